//! # skylog
//!
//! 텔레메트리 링크 + 피어 레지스트리 + 이어받기 가능한 비행 로그 다운로드
//!
//! ## 핵심 특징
//! - **블록 조립**: 로그를 40950바이트 블록 단위로 요청하고 누락 구간만 다시 요청
//! - **이어받기**: 카탈로그(`.state.json`)와 부분 파일로 중단 지점부터 재개
//! - **피어 레지스트리**: 하나의 링크에서 여러 기체를 시스템 ID로 구분
//! - **universal 피어**: 출처와 상관없이 모든 메시지를 받는 피어 (ID 0)
//! - **백프레셔**: 파일 쓰기 큐가 차면 다음 요청을 미룸
//!
//! 엔진/피어/레지스트리는 시간을 인자로 받는 동기 상태 기계이고,
//! [`link::Link`]의 드라이버 태스크가 tick과 수신 데이터를 전달함.

pub mod block;
pub mod catalog;
pub mod codec;
pub mod config;
pub mod error;
pub mod event;
pub mod fetcher;
pub mod link;
pub mod message;
pub mod peer;
pub mod registry;
pub mod stats;
pub mod writer;

pub use catalog::{Catalog, LogEntry};
pub use codec::{Codec, WireVersion};
pub use config::Config;
pub use error::{Error, Result};
pub use event::{EventReceiver, EventSender, LinkEvent, Outbox};
pub use fetcher::{LogFetcher, Phase, Status};
pub use link::{Endpoint, Link, PeerSnapshot};
pub use message::{Frame, Message, MessageKind};
pub use peer::{Peer, Telemetry};
pub use registry::Registry;
pub use stats::Progress;
pub use writer::{BlockSink, FileWriter, WriteEvent};

/// 피어(시스템) ID
pub type PeerId = u8;

/// universal 피어 ID (브로드캐스트 대상이기도 함)
pub const UNIVERSAL_PEER_ID: PeerId = 0;

/// 로그 데이터 패킷 하나의 페이로드 크기 (바이트)
pub const LOG_DATA_PAYLOAD: usize = 90;

/// 기본 블록 크기 (바이트)
pub const DEFAULT_BLOCK_SIZE: usize = LOG_DATA_PAYLOAD * 455; // 40950

/// 기본 송신 시스템 ID (지상국)
pub const DEFAULT_SYSTEM_ID: u8 = 255;
