//! 링크 / 로그 다운로드 설정

use std::time::Duration;

use tracing::warn;

use crate::{DEFAULT_BLOCK_SIZE, DEFAULT_SYSTEM_ID};

/// 요청 타임아웃 오버라이드 환경 변수
pub const REQUEST_TIMEOUT_ENV: &str = "LOG_FETCH_REQ_TIMEOUT_MILLIS";

/// skylog 설정
#[derive(Debug, Clone)]
pub struct Config {
    /// 블록 크기 (바이트)
    /// 패킷 페이로드 단위(90바이트)의 배수여야 함
    pub block_size: usize,

    /// 데이터 요청 재시도 타임아웃 (밀리초)
    pub request_timeout_ms: u64,

    /// 목록 요청 재시도 타임아웃 (밀리초)
    pub list_timeout_ms: u64,

    /// 수신 정지 판단 타임아웃 (밀리초)
    /// 초과 시 목록부터 다시 시작
    pub stall_timeout_ms: u64,

    /// 다운로드 속도 갱신 주기 (밀리초)
    pub rate_window_ms: u64,

    /// 진행률 보고 주기 (밀리초)
    pub progress_interval_ms: u64,

    /// 하트비트 없이 연결 유지로 보는 최대 시간 (밀리초)
    pub liveness_timeout_ms: u64,

    /// 다운로드 엔진 tick 주기 (밀리초)
    pub tick_interval_ms: u64,

    /// 연결 확인 tick 주기 (밀리초)
    pub liveness_interval_ms: u64,

    /// 파일 쓰기 큐 high-water mark (바이트)
    pub write_high_water: usize,

    /// 송신 시스템 ID
    pub system_id: u8,

    /// 송신 컴포넌트 ID
    pub component_id: u8,

    /// 수신 버퍼 크기
    pub recv_buffer_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            request_timeout_ms: 200,        // 200ms
            list_timeout_ms: 10_000,        // 10초
            stall_timeout_ms: 5_000,        // 5초
            rate_window_ms: 200,
            progress_interval_ms: 2_000,
            liveness_timeout_ms: 10_000,
            tick_interval_ms: 100,
            liveness_interval_ms: 333,
            write_high_water: 16 * 1024,    // 16KB
            system_id: DEFAULT_SYSTEM_ID,
            component_id: 0,
            recv_buffer_size: 64 * 1024,
        }
    }
}

impl Config {
    /// 기본 설정 + 환경 변수 오버라이드
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_value(std::env::var(REQUEST_TIMEOUT_ENV).ok().as_deref());
        config
    }

    fn apply_env_value(&mut self, value: Option<&str>) {
        let Some(raw) = value else {
            return;
        };

        match raw.trim().parse::<u64>() {
            Ok(ms) if ms > 0 => self.request_timeout_ms = ms,
            _ => warn!(
                "{} 값이 올바르지 않음: {:?}, 기본값 {}ms 사용",
                REQUEST_TIMEOUT_ENV, raw, self.request_timeout_ms
            ),
        }
    }

    /// 느린 텔레메트리 무선 링크용 설정
    pub fn slow_radio() -> Self {
        Self {
            request_timeout_ms: 1_000,
            stall_timeout_ms: 15_000,
            list_timeout_ms: 20_000,
            write_high_water: 64 * 1024,
            ..Self::default()
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn list_timeout(&self) -> Duration {
        Duration::from_millis(self.list_timeout_ms)
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_millis(self.stall_timeout_ms)
    }

    pub fn rate_window(&self) -> Duration {
        Duration::from_millis(self.rate_window_ms)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_millis(self.liveness_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_size_is_payload_multiple() {
        let config = Config::default();
        assert_eq!(config.block_size % crate::LOG_DATA_PAYLOAD, 0);
        assert_eq!(config.request_timeout(), Duration::from_millis(200));
    }

    #[test]
    fn test_env_override() {
        let mut config = Config::default();
        config.apply_env_value(Some("750"));
        assert_eq!(config.request_timeout_ms, 750);

        // 잘못된 값은 무시
        config.apply_env_value(Some("abc"));
        assert_eq!(config.request_timeout_ms, 750);

        config.apply_env_value(None);
        assert_eq!(config.request_timeout_ms, 750);
    }

    #[test]
    fn test_slow_radio_preset() {
        let config = Config::slow_radio();
        assert!(config.request_timeout() > Config::default().request_timeout());
        assert!(config.stall_timeout() > config.request_timeout());
        assert_eq!(config.block_size, crate::DEFAULT_BLOCK_SIZE);
    }
}
