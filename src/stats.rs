//! 다운로드 통계

use std::time::{Duration, Instant};

/// 이전 추정값 가중치
const SMOOTHING: f64 = 0.9;

/// 지수 평활 다운로드 속도 추정 (kB/s)
///
/// 진행률 보고에만 사용됨.
#[derive(Debug, Clone)]
pub struct RateEstimator {
    window: Duration,
    rate: f64,
    window_start: Option<Instant>,
    window_bytes: u64,
    total_bytes: u64,
}

impl RateEstimator {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            rate: 0.0,
            window_start: None,
            window_bytes: 0,
            total_bytes: 0,
        }
    }

    /// 수신 바이트 기록
    pub fn record(&mut self, bytes: usize) {
        self.window_bytes += bytes as u64;
        self.total_bytes += bytes as u64;
    }

    /// 윈도우가 지났으면 추정값 갱신. 갱신했으면 true
    pub fn update(&mut self, now: Instant) -> bool {
        let Some(start) = self.window_start else {
            self.window_start = Some(now);
            return false;
        };

        let elapsed = now.saturating_duration_since(start);
        if elapsed <= self.window {
            return false;
        }

        if self.window_bytes > 0 {
            let sample = (self.window_bytes as f64 / 1024.0) / elapsed.as_secs_f64();
            self.rate = self.rate * SMOOTHING + sample * (1.0 - SMOOTHING);
        }

        self.window_bytes = 0;
        self.window_start = Some(now);
        true
    }

    /// 현재 추정 속도 (kB/s)
    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// 총 수신 바이트
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }
}

/// 진행률 스냅샷
#[derive(Debug, Clone, PartialEq)]
pub struct Progress {
    /// 현재 받는 로그 ID
    pub log_id: u16,

    /// 원격 로그 개수
    pub log_total: u16,

    /// 다운로드 속도 (kB/s)
    pub download_rate: f64,

    /// 현재 로그의 기록 완료 바이트
    pub log_fetched_bytes: u32,

    /// 현재 로그의 전체 크기
    pub log_total_bytes: u32,

    /// 카탈로그 전체 진행률 (0.0 ~ 1.0)
    pub total_progress: f64,
}

impl Progress {
    /// 현재 로그 진행률 (0.0 ~ 1.0)
    pub fn log_progress(&self) -> f64 {
        if self.log_total_bytes == 0 {
            return 1.0;
        }
        self.log_fetched_bytes as f64 / self.log_total_bytes as f64
    }

    /// 통계 요약 문자열
    pub fn summary(&self) -> String {
        format!(
            "log {} of {} at {:.0}kB/s | {:.0}% ({:.2}/{:.2}MB) | {:.0}% of total",
            self.log_id,
            self.log_total,
            self.download_rate,
            self.log_progress() * 100.0,
            self.log_fetched_bytes as f64 / 1_000_000.0,
            self.log_total_bytes as f64 / 1_000_000.0,
            self.total_progress * 100.0,
        )
    }
}
