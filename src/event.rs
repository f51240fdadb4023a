//! 링크 알림

use tokio::sync::mpsc;

use crate::message::{Frame, Message};
use crate::peer::Telemetry;
use crate::stats::Progress;
use crate::PeerId;

/// 링크에서 발생하는 알림
#[derive(Debug, Clone)]
pub enum LinkEvent {
    /// 새 피어 등록됨
    NewPeer { peer: PeerId },

    /// 모드/무장/착륙/안전 상태 또는 연결 상태 변경
    StatusChanged {
        peer: PeerId,
        connected: bool,
        telemetry: Telemetry,
    },

    /// 피어가 메시지를 받음 (universal 피어는 0)
    Message { peer: PeerId, frame: Frame },

    /// 로그 하나 다운로드 완료
    Downloaded { peer: PeerId, log_id: u16 },

    /// 다운로드 진행률
    Progress { peer: PeerId, progress: Progress },
}

/// 알림 송신기
pub type EventSender = mpsc::UnboundedSender<LinkEvent>;

/// 알림 수신기
pub type EventReceiver = mpsc::UnboundedReceiver<LinkEvent>;

/// 송신 메시지 큐 (코덱 → 링크로 전달됨)
pub type Outbox = mpsc::UnboundedSender<Message>;

/// 수신기가 닫혀도 무시하고 보냄
pub(crate) fn notify(events: &EventSender, event: LinkEvent) {
    let _ = events.send(event);
}
