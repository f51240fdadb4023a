//! 원격 피어 (기체 하나)
//!
//! - 텔레메트리 스냅샷 갱신
//! - 하트비트 기반 연결 확인
//! - 필요할 때 로그 다운로드 엔진 생성

use std::collections::HashMap;
use std::f64::consts::PI;
use std::fmt;
use std::path::PathBuf;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::event::{notify, EventSender, LinkEvent, Outbox};
use crate::fetcher::LogFetcher;
use crate::message::{
    Frame, Message, MessageKind, LANDED_STATE_IN_AIR, LANDED_STATE_LANDING,
    LANDED_STATE_TAKEOFF, STATE_ACTIVE,
};
use crate::writer::{BlockSink, WriteEvent};
use crate::{Config, Error, PeerId, Result};

/// 기본 비행 모드 이름 (custom mode 16..24 비트)
const BASE_MODES: [&str; 8] = [
    "none",
    "Manual",
    "Altitude",
    "Position",
    "Auto",
    "Acro",
    "Offboard",
    "Stabilised",
];

/// Auto 하위 모드 이름 (custom mode 24..32 비트)
const SUB_MODES: [&str; 9] = [
    "none", "Ready", "Takeoff", "Loiter", "Mission", "RTL", "Land", "RTGS", "Follow",
];

const BASE_MODE_AUTO: usize = 4;

/// 안전 스위치 활성 비트
const SAFETY_ENABLED_BIT: u8 = 0x02;

/// custom mode → 비행 모드 이름
pub fn flight_mode_label(custom_mode: u32) -> &'static str {
    let base = ((custom_mode >> 16) & 0xFF) as usize;
    let sub = (custom_mode >> 24) as usize;

    match BASE_MODES.get(base) {
        Some(_) if base == BASE_MODE_AUTO => SUB_MODES.get(sub).copied().unwrap_or("invalid"),
        Some(name) => *name,
        None => "invalid",
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LandedState {
    #[default]
    Unknown,
    OnGround,
    Takeoff,
    Landing,
    OnRoute,
}

impl LandedState {
    fn from_raw(state: u8) -> Self {
        match state {
            LANDED_STATE_IN_AIR => LandedState::OnRoute,
            LANDED_STATE_TAKEOFF => LandedState::Takeoff,
            LANDED_STATE_LANDING => LandedState::Landing,
            _ => LandedState::OnGround,
        }
    }
}

impl fmt::Display for LandedState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LandedState::Unknown => "unknown",
            LandedState::OnGround => "On ground",
            LandedState::Takeoff => "Takeoff",
            LandedState::Landing => "Landing",
            LandedState::OnRoute => "On route",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ArmedState {
    #[default]
    Unknown,
    Armed,
    Disarmed,
}

impl fmt::Display for ArmedState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ArmedState::Unknown => "unknown",
            ArmedState::Armed => "Armed",
            ArmedState::Disarmed => "Disarmed",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SafetyState {
    #[default]
    Unknown,
    Enabled,
    Disabled,
}

impl fmt::Display for SafetyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SafetyState::Unknown => "unknown",
            SafetyState::Enabled => "Enabled",
            SafetyState::Disabled => "Disabled",
        })
    }
}

/// 위치 (도, 미터)
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Position {
    pub valid: bool,
    pub lat: f64,
    pub lon: f64,
    pub alt: f64,
}

/// 텔레메트리 스냅샷
#[derive(Debug, Clone, PartialEq)]
pub struct Telemetry {
    pub position: Position,
    /// 방위 (도)
    pub heading: Option<f64>,
    /// km/h
    pub airspeed: f64,
    /// km/h
    pub groundspeed: f64,
    /// 도
    pub roll: f64,
    /// 도
    pub pitch: f64,
    pub landed_state: LandedState,
    pub flight_mode: &'static str,
    pub armed_state: ArmedState,
    pub safety_state: SafetyState,
}

impl Default for Telemetry {
    fn default() -> Self {
        Self {
            position: Position::default(),
            heading: None,
            airspeed: 0.0,
            groundspeed: 0.0,
            roll: 0.0,
            pitch: 0.0,
            landed_state: LandedState::Unknown,
            flight_mode: "unknown",
            armed_state: ArmedState::Unknown,
            safety_state: SafetyState::Unknown,
        }
    }
}

/// 원격 피어
pub struct Peer {
    id: PeerId,
    telemetry: Telemetry,
    connected: bool,
    last_heartbeat: Option<Instant>,
    last_update: Option<Instant>,

    // 변경 감지용 직전 값
    last_custom_mode: u32,
    last_system_status: u8,
    last_landed_state: u8,
    last_safety_state: u8,

    latest: HashMap<MessageKind, Message>,
    fetcher: Option<LogFetcher>,

    config: Config,
    outbox: Outbox,
    events: EventSender,
}

impl Peer {
    pub fn new(id: PeerId, config: Config, outbox: Outbox, events: EventSender) -> Self {
        Self {
            id,
            telemetry: Telemetry::default(),
            connected: false,
            last_heartbeat: None,
            last_update: None,
            last_custom_mode: 0,
            last_system_status: 0,
            last_landed_state: 0,
            last_safety_state: 0,
            latest: HashMap::new(),
            fetcher: None,
            config,
            outbox,
            events,
        }
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn telemetry(&self) -> &Telemetry {
        &self.telemetry
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn last_heartbeat(&self) -> Option<Instant> {
        self.last_heartbeat
    }

    pub fn last_update(&self) -> Option<Instant> {
        self.last_update
    }

    /// 종류별 마지막 수신 메시지
    pub fn latest(&self, kind: MessageKind) -> Option<&Message> {
        self.latest.get(&kind)
    }

    /// 메시지 송신 (링크 드라이버가 인코딩)
    pub fn send(&self, message: Message) -> Result<()> {
        self.outbox.send(message).map_err(|_| Error::ChannelError)
    }

    /// 바뀐 상태를 알림에 담아 보냄
    fn notify_status(&self) {
        notify(
            &self.events,
            LinkEvent::StatusChanged {
                peer: self.id,
                connected: self.connected,
                telemetry: self.telemetry.clone(),
            },
        );
    }

    /// 수신 프레임 반영. 상태가 바뀌었으면 true
    pub fn update(&mut self, frame: &Frame, now: Instant) -> bool {
        self.last_update = Some(now);
        self.latest.insert(frame.message.kind(), frame.message.clone());

        let changed = match &frame.message {
            Message::StatusText(status) => {
                info!("Sys {}; {}: {}", self.id, status.severity, status.text);
                false
            }
            Message::ExtendedSysState(state) => {
                self.telemetry.landed_state = LandedState::from_raw(state.landed_state);
                let changed = self.last_landed_state != state.landed_state;
                self.last_landed_state = state.landed_state;
                changed
            }
            Message::Heartbeat(heartbeat) => {
                let mut changed = false;

                if self.last_custom_mode != heartbeat.custom_mode {
                    let prev = self.telemetry.flight_mode;
                    self.telemetry.flight_mode = flight_mode_label(heartbeat.custom_mode);
                    info!(
                        "Sys {} 비행 모드 변경: {} → {}",
                        self.id, prev, self.telemetry.flight_mode
                    );
                    self.last_custom_mode = heartbeat.custom_mode;
                    changed = true;
                }

                if self.last_system_status != heartbeat.system_status {
                    self.telemetry.armed_state = if heartbeat.system_status == STATE_ACTIVE {
                        ArmedState::Armed
                    } else {
                        ArmedState::Disarmed
                    };
                    info!("Sys {} 시스템 상태 변경: {}", self.id, heartbeat.system_status);
                    self.last_system_status = heartbeat.system_status;
                    changed = true;
                }

                if !self.connected {
                    warn!("Sys {} 연결됨", self.id);
                }
                self.last_heartbeat = Some(now);
                self.connected = true;

                changed
            }
            Message::ExtendedHud(hud) => {
                self.telemetry.safety_state = if hud.safety_state & SAFETY_ENABLED_BIT != 0 {
                    SafetyState::Enabled
                } else {
                    SafetyState::Disabled
                };
                let changed = self.last_safety_state != hud.safety_state;
                self.last_safety_state = hud.safety_state;
                changed
            }
            Message::GlobalPositionInt(pos) => {
                self.telemetry.position = Position {
                    valid: true,
                    lat: pos.lat as f64 / 1e7,
                    lon: pos.lon as f64 / 1e7,
                    alt: pos.alt as f64 / 1e3,
                };
                self.telemetry.heading = Some(pos.hdg as f64 / 1e2);
                false
            }
            Message::VfrHud(hud) => {
                self.telemetry.groundspeed = hud.groundspeed as f64 * 3.6;
                self.telemetry.airspeed = hud.airspeed as f64 * 3.6;
                false
            }
            Message::Attitude(att) => {
                self.telemetry.roll = att.roll as f64 * (180.0 / PI);
                self.telemetry.pitch = att.pitch as f64 * (180.0 / PI);
                self.telemetry.heading = Some(att.yaw as f64 * (180.0 / PI));
                false
            }
            _ => false,
        };

        if changed {
            self.notify_status();
        }

        if let Some(fetcher) = self.fetcher.as_mut() {
            fetcher.handle_message(&frame.message, now);
        }

        notify(
            &self.events,
            LinkEvent::Message {
                peer: self.id,
                frame: frame.clone(),
            },
        );

        changed
    }

    /// 연결 확인 (기준 333ms 주기). 연결이 끊겼으면 true
    pub fn check_liveness(&mut self, now: Instant) -> bool {
        if !self.connected {
            return false;
        }

        let Some(last) = self.last_heartbeat else {
            return false;
        };

        if now.saturating_duration_since(last) > self.config.liveness_timeout() {
            self.connected = false;
            warn!("Sys {} 연결 끊김", self.id);
            self.notify_status();
            return true;
        }

        false
    }

    /// 로그 다운로드 엔진 생성 (기존 엔진은 멈추고 교체)
    pub fn enable_log_fetch(
        &mut self,
        log_dir: impl Into<PathBuf>,
        reverse: bool,
        sink: Box<dyn BlockSink>,
    ) -> Result<&mut LogFetcher> {
        if let Some(old) = self.fetcher.as_mut() {
            debug!("Sys {} 기존 다운로드 엔진 교체", self.id);
            old.stop();
        }

        let fetcher = LogFetcher::new(
            self.id,
            log_dir,
            reverse,
            self.config.clone(),
            self.outbox.clone(),
            self.events.clone(),
            sink,
        )?;

        Ok(self.fetcher.insert(fetcher))
    }

    pub fn log_fetcher(&self) -> Option<&LogFetcher> {
        self.fetcher.as_ref()
    }

    pub fn log_fetcher_mut(&mut self) -> Option<&mut LogFetcher> {
        self.fetcher.as_mut()
    }

    /// 다운로드 엔진 tick (없으면 무시)
    pub fn tick(&mut self, now: Instant) {
        if let Some(fetcher) = self.fetcher.as_mut() {
            fetcher.tick(now);
        }
    }

    /// 파일 쓰기 이벤트 전달
    pub fn on_write_event(&mut self, event: WriteEvent, now: Instant) -> Result<()> {
        let fetcher = self
            .fetcher
            .as_mut()
            .ok_or(Error::FetcherMissing(self.id))?;
        fetcher.on_write_event(event, now);
        Ok(())
    }
}
