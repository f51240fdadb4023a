//! 피어 레지스트리
//!
//! 하나의 링크로 보이는 여러 피어를 시스템 ID로 나눠 관리함.
//! universal 피어(ID 0)는 출처와 상관없이 모든 프레임을 받음.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Instant;

use tracing::{debug, info};

use crate::event::{notify, EventSender, LinkEvent, Outbox};
use crate::fetcher::LogFetcher;
use crate::message::{Frame, Message, AUTOPILOT_INVALID, COMP_ID_AUTOPILOT1};
use crate::peer::Peer;
use crate::writer::{BlockSink, WriteEvent};
use crate::{Config, Error, PeerId, Result, UNIVERSAL_PEER_ID};

pub struct Registry {
    peers: BTreeMap<PeerId, Peer>,
    universal: Option<Peer>,
    config: Config,
    outbox: Outbox,
    events: EventSender,
}

impl Registry {
    pub fn new(config: Config, outbox: Outbox, events: EventSender) -> Self {
        Self {
            peers: BTreeMap::new(),
            universal: None,
            config,
            outbox,
            events,
        }
    }

    fn new_peer(&self, id: PeerId) -> Peer {
        Peer::new(id, self.config.clone(), self.outbox.clone(), self.events.clone())
    }

    /// 수신 프레임 분배
    pub fn dispatch(&mut self, frame: &Frame, now: Instant) {
        let Some(source) = frame.source() else {
            debug!("출처 없는 프레임 무시: {}", frame.message.name());
            return;
        };

        // 오토파일럿 하트비트만 새 피어로 등록
        if let Message::Heartbeat(heartbeat) = &frame.message {
            let accept = heartbeat.autopilot != AUTOPILOT_INVALID
                && frame.header.component_id == COMP_ID_AUTOPILOT1;

            if accept && !self.peers.contains_key(&source) {
                info!("새 피어 {}", source);
                let peer = self.new_peer(source);
                self.peers.insert(source, peer);
                notify(&self.events, LinkEvent::NewPeer { peer: source });
            }
        }

        if let Some(peer) = self.peers.get_mut(&source) {
            peer.update(frame, now);
        }

        if let Some(universal) = self.universal.as_mut() {
            universal.update(frame, now);
        }
    }

    /// universal 피어 (처음 접근할 때 생성)
    pub fn universal(&mut self) -> &mut Peer {
        let (config, outbox, events) = (&self.config, &self.outbox, &self.events);
        self.universal.get_or_insert_with(|| {
            debug!("universal 피어 생성");
            Peer::new(UNIVERSAL_PEER_ID, config.clone(), outbox.clone(), events.clone())
        })
    }

    /// 피어 직접 생성 (이미 있으면 그대로 반환)
    pub fn peer_or_create(&mut self, id: PeerId) -> &mut Peer {
        if id == UNIVERSAL_PEER_ID {
            return self.universal();
        }

        if !self.peers.contains_key(&id) {
            info!("피어 {} 직접 생성", id);
        }

        let config = &self.config;
        let outbox = &self.outbox;
        let events = &self.events;
        self.peers
            .entry(id)
            .or_insert_with(|| Peer::new(id, config.clone(), outbox.clone(), events.clone()))
    }

    pub fn peer(&self, id: PeerId) -> Option<&Peer> {
        if id == UNIVERSAL_PEER_ID {
            return self.universal.as_ref();
        }
        self.peers.get(&id)
    }

    pub fn peer_mut(&mut self, id: PeerId) -> Option<&mut Peer> {
        if id == UNIVERSAL_PEER_ID {
            return self.universal.as_mut();
        }
        self.peers.get_mut(&id)
    }

    /// 등록된 피어 (universal 제외, ID 순)
    pub fn peers(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values()
    }

    fn all_peers_mut(&mut self) -> impl Iterator<Item = &mut Peer> {
        self.universal.iter_mut().chain(self.peers.values_mut())
    }

    /// 모든 다운로드 엔진 tick
    pub fn tick(&mut self, now: Instant) {
        for peer in self.all_peers_mut() {
            peer.tick(now);
        }
    }

    /// 모든 피어 연결 확인
    pub fn check_liveness(&mut self, now: Instant) {
        for peer in self.all_peers_mut() {
            peer.check_liveness(now);
        }
    }

    /// 파일 쓰기 이벤트를 해당 피어의 엔진에 전달
    pub fn on_write_event(&mut self, id: PeerId, event: WriteEvent, now: Instant) -> Result<()> {
        self.peer_mut(id)
            .ok_or(Error::UnknownPeer(id))?
            .on_write_event(event, now)
    }

    /// 피어에 다운로드 엔진 생성
    ///
    /// universal 피어는 없으면 생성되고, 그 외 피어는 이미 등록되어 있어야 함.
    pub fn enable_log_fetch(
        &mut self,
        id: PeerId,
        log_dir: impl Into<PathBuf>,
        reverse: bool,
        sink: Box<dyn BlockSink>,
    ) -> Result<&mut LogFetcher> {
        let peer = if id == UNIVERSAL_PEER_ID {
            self.universal()
        } else {
            self.peers.get_mut(&id).ok_or(Error::UnknownPeer(id))?
        };
        peer.enable_log_fetch(log_dir, reverse, sink)
    }

    /// 링크로 메시지 송신
    pub fn send(&self, message: Message) -> Result<()> {
        self.outbox.send(message).map_err(|_| Error::ChannelError)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventReceiver;
    use crate::message::{Heartbeat, MessageKind, StatusText, VfrHud};
    use crate::writer::testing::SharedSink;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn registry() -> (Registry, mpsc::UnboundedReceiver<Message>, EventReceiver) {
        let (outbox, out_rx) = mpsc::unbounded_channel();
        let (events, ev_rx) = mpsc::unbounded_channel();
        (Registry::new(Config::default(), outbox, events), out_rx, ev_rx)
    }

    fn heartbeat(source: PeerId, component: u8, autopilot: u8) -> Frame {
        Frame::new(
            source,
            component,
            Message::Heartbeat(Heartbeat {
                custom_mode: 0,
                vehicle_type: 2,
                autopilot,
                base_mode: 0,
                system_status: 3,
                protocol_version: 3,
            }),
        )
    }

    fn vfr(source: PeerId, groundspeed: f32) -> Frame {
        Frame::new(
            source,
            1,
            Message::VfrHud(VfrHud {
                airspeed: 0.0,
                groundspeed,
                heading: 0,
                throttle: 0,
                alt: 0.0,
                climb: 0.0,
            }),
        )
    }

    fn new_peers(rx: &mut EventReceiver) -> Vec<PeerId> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let LinkEvent::NewPeer { peer } = event {
                out.push(peer);
            }
        }
        out
    }

    #[test]
    fn test_heartbeat_creates_autopilot_peer_only() {
        let (mut reg, _out, mut events) = registry();
        let now = Instant::now();

        // 오토파일럿이 아닌 컴포넌트
        reg.dispatch(&heartbeat(1, 100, 12), now);
        // INVALID 오토파일럿 (지상국 등)
        reg.dispatch(&heartbeat(2, 1, AUTOPILOT_INVALID), now);
        assert_eq!(reg.peers().count(), 0);

        reg.dispatch(&heartbeat(1, 1, 12), now);
        reg.dispatch(&heartbeat(1, 1, 12), now);
        assert_eq!(reg.peers().count(), 1);
        assert!(reg.peer(1).unwrap().is_connected());
        assert_eq!(new_peers(&mut events), vec![1]);

        // 하트비트가 아닌 메시지로는 생성되지 않음
        reg.dispatch(&vfr(5, 1.0), now);
        assert!(reg.peer(5).is_none());
    }

    #[test]
    fn test_universal_sees_every_source() {
        let (mut reg, _out, _events) = registry();
        let now = Instant::now();

        reg.universal();
        reg.dispatch(&heartbeat(1, 1, 12), now);
        reg.dispatch(&heartbeat(2, 1, 12), now);

        reg.dispatch(&vfr(1, 1.0), now);
        assert!((reg.peer(0).unwrap().telemetry().groundspeed - 3.6).abs() < 1e-6);

        reg.dispatch(&vfr(2, 2.0), now);
        reg.dispatch(
            &Frame::new(
                9,
                1,
                Message::StatusText(StatusText {
                    severity: 6,
                    text: "unknown source".into(),
                }),
            ),
            now,
        );

        let universal = reg.peer(0).unwrap();
        assert!((universal.telemetry().groundspeed - 7.2).abs() < 1e-6);
        assert!(universal.latest(MessageKind::StatusText).is_some());

        // 피어별로는 자기 데이터만
        assert!((reg.peer(1).unwrap().telemetry().groundspeed - 3.6).abs() < 1e-6);
        assert!((reg.peer(2).unwrap().telemetry().groundspeed - 7.2).abs() < 1e-6);
        assert!(reg.peer(1).unwrap().latest(MessageKind::StatusText).is_none());
        assert!(reg.peer(9).is_none());
    }

    #[test]
    fn test_sourceless_frame_dropped() {
        let (mut reg, _out, mut events) = registry();
        let now = Instant::now();

        reg.universal();
        reg.dispatch(&heartbeat(0, 1, 12), now);

        assert!(reg.peer(0).unwrap().latest(MessageKind::Heartbeat).is_none());
        assert!(new_peers(&mut events).is_empty());
    }

    #[test]
    fn test_manual_peer_and_liveness() {
        let (mut reg, _out, _events) = registry();
        let t0 = Instant::now();

        reg.peer_or_create(4);
        assert_eq!(reg.peer(4).unwrap().id(), 4);
        assert!(reg.peer_or_create(0).id() == UNIVERSAL_PEER_ID);

        reg.dispatch(&heartbeat(4, 1, 12), t0);
        assert!(reg.peer(4).unwrap().is_connected());

        reg.check_liveness(t0 + Duration::from_secs(11));
        assert!(!reg.peer(4).unwrap().is_connected());
    }

    #[test]
    fn test_enable_log_fetch_and_write_events() {
        let (mut reg, mut out, _events) = registry();
        let dir = tempfile::tempdir().unwrap();
        let now = Instant::now();

        assert!(matches!(
            reg.enable_log_fetch(7, dir.path(), false, Box::new(SharedSink::default())),
            Err(Error::UnknownPeer(7))
        ));
        assert!(matches!(
            reg.on_write_event(7, WriteEvent::Drained, now),
            Err(Error::UnknownPeer(7))
        ));

        reg.enable_log_fetch(0, dir.path(), false, Box::new(SharedSink::default()))
            .unwrap()
            .start(now);

        match out.try_recv().unwrap() {
            Message::LogRequestList(req) => assert_eq!(req.target_system, 0),
            other => panic!("unexpected message: {:?}", other),
        }

        assert!(reg.on_write_event(0, WriteEvent::Drained, now).is_ok());

        // 목록 타임아웃 후 tick으로 재요청
        reg.tick(now + Duration::from_millis(10_001));
        assert!(matches!(out.try_recv().unwrap(), Message::LogRequestList(_)));
    }

    #[test]
    fn test_send_goes_to_outbox() {
        let (reg, mut out, _events) = registry();
        let msg = Message::VfrHud(VfrHud {
            airspeed: 1.0,
            groundspeed: 1.0,
            heading: 0,
            throttle: 0,
            alt: 0.0,
            climb: 0.0,
        });

        reg.send(msg.clone()).unwrap();
        assert_eq!(out.try_recv().unwrap(), msg);
    }
}
