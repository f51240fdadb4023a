//! 에러 타입 정의

use thiserror::Error;

use crate::PeerId;

/// skylog 에러 타입
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO 에러: {0}")]
    Io(#[from] std::io::Error),

    #[error("직렬화 에러: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("카탈로그 JSON 에러: {0}")]
    Json(#[from] serde_json::Error),

    #[error("프레임 크기 초과: {len} bytes (최대 {max})")]
    FrameTooLarge { len: usize, max: usize },

    #[error("CRC 불일치: expected {expected:08X}, got {got:08X}")]
    CrcMismatch { expected: u32, got: u32 },

    #[error("알 수 없는 피어: {0}")]
    UnknownPeer(PeerId),

    #[error("로그 다운로드가 활성화되지 않음: peer={0}")]
    FetcherMissing(PeerId),

    #[error("채널 에러")]
    ChannelError,

    #[error("연결 종료")]
    ConnectionClosed,
}

/// Result 타입 별칭
pub type Result<T> = std::result::Result<T, Error>;
