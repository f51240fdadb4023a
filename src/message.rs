//! 텔레메트리 메시지 정의
//!
//! 링크에서 소비/생성하는 메시지만 정의함

use serde::{Deserialize, Serialize};

use crate::PeerId;

/// 자동조종장치 컴포넌트 ID
pub const COMP_ID_AUTOPILOT1: u8 = 1;

/// 유효하지 않은 자동조종장치 타입
pub const AUTOPILOT_INVALID: u8 = 8;

/// 시스템 상태: 활성 (무장)
pub const STATE_ACTIVE: u8 = 4;

/// 착륙 상태 값
pub const LANDED_STATE_IN_AIR: u8 = 2;
pub const LANDED_STATE_TAKEOFF: u8 = 3;
pub const LANDED_STATE_LANDING: u8 = 4;

/// 로그 목록 요청에서 "전체"를 뜻하는 인덱스
pub const LOG_LIST_ALL: u16 = 0xFFFF;

/// 메시지 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageKind {
    Heartbeat = 0,
    StatusText = 1,
    ExtendedSysState = 2,
    ExtendedHud = 3,
    GlobalPositionInt = 4,
    VfrHud = 5,
    Attitude = 6,
    LogEntry = 7,
    LogData = 8,
    LogRequestList = 9,
    LogRequestData = 10,
}

impl MessageKind {
    pub fn name(&self) -> &'static str {
        match self {
            MessageKind::Heartbeat => "HEARTBEAT",
            MessageKind::StatusText => "STATUSTEXT",
            MessageKind::ExtendedSysState => "EXTENDED_SYS_STATE",
            MessageKind::ExtendedHud => "EXTENDED_HUD",
            MessageKind::GlobalPositionInt => "GLOBAL_POSITION_INT",
            MessageKind::VfrHud => "VFR_HUD",
            MessageKind::Attitude => "ATTITUDE",
            MessageKind::LogEntry => "LOG_ENTRY",
            MessageKind::LogData => "LOG_DATA",
            MessageKind::LogRequestList => "LOG_REQUEST_LIST",
            MessageKind::LogRequestData => "LOG_REQUEST_DATA",
        }
    }
}

/// Heartbeat (생존 확인 + 모드/상태)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    /// 상위 16비트에 기본/세부 모드가 들어있음
    pub custom_mode: u32,
    pub vehicle_type: u8,
    pub autopilot: u8,
    pub base_mode: u8,
    pub system_status: u8,
    pub protocol_version: u8,
}

/// 상태 텍스트
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusText {
    pub severity: u8,
    pub text: String,
}

/// 확장 시스템 상태
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtendedSysState {
    pub vtol_state: u8,
    pub landed_state: u8,
}

/// 확장 HUD (안전 스위치 상태)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtendedHud {
    /// 0x02 비트: 안전 스위치 활성
    pub safety_state: u8,
}

/// 전역 위치 (고정소수점 정수 단위)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalPositionInt {
    pub time_boot_ms: u32,
    /// degE7
    pub lat: i32,
    /// degE7
    pub lon: i32,
    /// mm
    pub alt: i32,
    /// mm
    pub relative_alt: i32,
    pub vx: i16,
    pub vy: i16,
    pub vz: i16,
    /// cdeg
    pub hdg: u16,
}

/// VFR HUD (속도 단위 m/s)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VfrHud {
    pub airspeed: f32,
    pub groundspeed: f32,
    pub heading: i16,
    pub throttle: u16,
    pub alt: f32,
    pub climb: f32,
}

/// 자세 (라디안)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attitude {
    pub time_boot_ms: u32,
    pub roll: f32,
    pub pitch: f32,
    pub yaw: f32,
    pub rollspeed: f32,
    pub pitchspeed: f32,
    pub yawspeed: f32,
}

/// 원격 로그 카탈로그 항목
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntryMessage {
    pub id: u16,
    pub num_logs: u16,
    pub last_log_num: u16,
    pub time_utc: u32,
    pub size: u32,
}

/// 로그 데이터 조각
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogData {
    pub id: u16,
    pub ofs: u32,
    pub count: u8,
    pub data: Vec<u8>,
}

impl LogData {
    /// `count` 만큼의 유효 페이로드
    pub fn payload(&self) -> &[u8] {
        let len = (self.count as usize).min(self.data.len());
        &self.data[..len]
    }
}

/// 로그 목록 요청 (인덱스 범위, `LOG_LIST_ALL` = 전체)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRequestList {
    pub target_system: u8,
    pub target_component: u8,
    pub start: u16,
    pub end: u16,
}

/// 로그 데이터 요청
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRequestData {
    pub target_system: u8,
    pub target_component: u8,
    pub id: u16,
    pub ofs: u32,
    pub count: u32,
}

/// 통합 메시지 enum
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    Heartbeat(Heartbeat),
    StatusText(StatusText),
    ExtendedSysState(ExtendedSysState),
    ExtendedHud(ExtendedHud),
    GlobalPositionInt(GlobalPositionInt),
    VfrHud(VfrHud),
    Attitude(Attitude),
    LogEntry(LogEntryMessage),
    LogData(LogData),
    LogRequestList(LogRequestList),
    LogRequestData(LogRequestData),
}

impl Message {
    /// 메시지 종류 반환
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Heartbeat(_) => MessageKind::Heartbeat,
            Message::StatusText(_) => MessageKind::StatusText,
            Message::ExtendedSysState(_) => MessageKind::ExtendedSysState,
            Message::ExtendedHud(_) => MessageKind::ExtendedHud,
            Message::GlobalPositionInt(_) => MessageKind::GlobalPositionInt,
            Message::VfrHud(_) => MessageKind::VfrHud,
            Message::Attitude(_) => MessageKind::Attitude,
            Message::LogEntry(_) => MessageKind::LogEntry,
            Message::LogData(_) => MessageKind::LogData,
            Message::LogRequestList(_) => MessageKind::LogRequestList,
            Message::LogRequestData(_) => MessageKind::LogRequestData,
        }
    }

    pub fn name(&self) -> &'static str {
        self.kind().name()
    }
}

/// 프레임 헤더 (송신측 식별 정보)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub sequence: u8,
    pub system_id: PeerId,
    pub component_id: u8,
}

/// 디코딩된 프레임
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub header: FrameHeader,
    pub message: Message,
}

impl Frame {
    pub fn new(system_id: PeerId, component_id: u8, message: Message) -> Self {
        Self {
            header: FrameHeader {
                sequence: 0,
                system_id,
                component_id,
            },
            message,
        }
    }

    /// 송신 시스템 ID (0이면 출처 없음)
    pub fn source(&self) -> Option<PeerId> {
        match self.header.system_id {
            0 => None,
            id => Some(id),
        }
    }
}
