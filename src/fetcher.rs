//! 로그 다운로드 엔진 (피어 하나당 하나)
//!
//! - 목록 조회 → 카탈로그 맞춤 → 블록 단위 요청/조립 → 파일 기록
//! - 재시작 시 카탈로그와 부분 파일로 이어받기
//! - 외부 tick으로 타임아웃/재시도 처리 (시간은 호출자가 전달)

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::block::{Block, Ingest};
use crate::catalog::{Catalog, LogEntry};
use crate::event::{notify, EventSender, LinkEvent, Outbox};
use crate::message::{LogData, LogEntryMessage, LogRequestData, LogRequestList, Message, LOG_LIST_ALL};
use crate::stats::{Progress, RateEstimator};
use crate::writer::{Backpressure, BlockSink, WriteEvent, WriteJob};
use crate::{Config, PeerId, Result};

/// 엔진의 바깥 상태. Running일 때만 tick이 동작함
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Paused,
    Running,
    Error,
    /// 원격에 로그가 없음. start() 전까지 재시도하지 않음
    NoLogs,
}

/// 엔진의 세부 단계
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Standby,
    Listing,
    Fetching,
    Writing,
}

/// UTC 타임스탬프를 `YYYY-MM-DD-HH-MM-SS`로
pub fn format_utc(utc: u32) -> String {
    DateTime::<Utc>::from_timestamp(utc as i64, 0)
        .unwrap_or_default()
        .format("%Y-%m-%d-%H-%M-%S")
        .to_string()
}

/// 완료된 로그 파일 이름
pub fn log_file_name(utc: u32) -> String {
    format!("log_{}.px4log", format_utc(utc))
}

fn since(at: Option<Instant>, now: Instant) -> Duration {
    at.map(|t| now.saturating_duration_since(t))
        .unwrap_or(Duration::MAX)
}

/// 로그 다운로드 엔진
pub struct LogFetcher {
    peer: PeerId,
    log_dir: PathBuf,
    reverse: bool,
    config: Config,

    status: Status,
    phase: Phase,
    catalog: Catalog,

    // 목록 조회 중 임시 누적
    listing: BTreeMap<u16, LogEntryMessage>,
    list_total: Option<u16>,
    list_updated: bool,

    // 현재 받는 로그 (카탈로그 위치)
    current: Option<usize>,
    current_id: u16,
    output_path: PathBuf,
    block: Block,

    writing_blocked: bool,
    request_deferred: bool,

    rate: RateEstimator,
    last_progress: Option<Instant>,
    last_action: Option<Instant>,
    last_received: Option<Instant>,

    sink: Box<dyn BlockSink>,
    outbox: Outbox,
    events: EventSender,
}

impl LogFetcher {
    /// 새 엔진 생성. 로그 디렉터리를 만들고 카탈로그를 로드함
    pub fn new(
        peer: PeerId,
        log_dir: impl Into<PathBuf>,
        reverse: bool,
        config: Config,
        outbox: Outbox,
        events: EventSender,
        sink: Box<dyn BlockSink>,
    ) -> Result<Self> {
        let log_dir = log_dir.into();
        fs::create_dir_all(&log_dir)?;

        if let Err(e) = Catalog::migrate_legacy(&log_dir) {
            error!("카탈로그 파일 이름 변경 실패: {}", e);
        }
        let catalog = Catalog::load(&log_dir);

        Ok(Self {
            peer,
            reverse,
            block: Block::new(config.block_size),
            rate: RateEstimator::new(config.rate_window()),
            config,
            status: Status::Paused,
            phase: Phase::Standby,
            catalog,
            listing: BTreeMap::new(),
            list_total: None,
            list_updated: false,
            current: None,
            current_id: 0,
            output_path: log_dir.clone(),
            log_dir,
            writing_blocked: false,
            request_deferred: false,
            last_progress: None,
            last_action: None,
            last_received: None,
            sink,
            outbox,
            events,
        })
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    /// 현재 다운로드 속도 (kB/s)
    pub fn download_rate(&self) -> f64 {
        self.rate.rate()
    }

    /// 카탈로그 전체 진행률
    pub fn total_progress(&self) -> f64 {
        self.catalog.total_progress()
    }

    pub fn is_transferring(&self) -> bool {
        self.status == Status::Running
    }

    /// 현재 받고 있는 로그 ID
    pub fn current_log(&self) -> Option<u16> {
        self.current.map(|_| self.current_id)
    }

    /// 다운로드 시작 (항상 목록 조회부터)
    pub fn start(&mut self, now: Instant) {
        info!("로그 다운로드 시작: peer={}, dir={:?}", self.peer, self.log_dir);
        self.status = Status::Running;
        self.start_listing(now);
    }

    /// 다운로드 중지. 이미 보낸 요청의 응답은 무시됨
    pub fn stop(&mut self) {
        self.status = Status::Paused;
        self.phase = Phase::Standby;
    }

    /// 카탈로그 저장. 실패하면 false (메모리 상태로 계속 진행)
    pub fn persist(&self) -> bool {
        match self.catalog.save(&self.log_dir) {
            Ok(()) => true,
            Err(e) => {
                error!("카탈로그 저장 실패 ({:?}): {}", self.log_dir, e);
                false
            }
        }
    }

    fn send(&mut self, message: Message, now: Instant) {
        self.last_action = Some(now);
        if self.outbox.send(message).is_err() {
            warn!("송신 큐 닫힘: peer={}", self.peer);
        }
    }

    fn start_listing(&mut self, now: Instant) {
        // 상태 변경 전에 시각 기록
        self.last_action = Some(now);
        self.phase = Phase::Listing;

        self.list_updated = false;
        self.list_total = None;
        self.listing.clear();

        self.list_entries(now);
    }

    fn list_entries(&mut self, now: Instant) {
        let (start, end) = match self.list_total {
            Some(total) if total > 0 => {
                match (0..total).find(|i| !self.listing.contains_key(i)) {
                    Some(i) => {
                        debug!("목록 항목 {} 요청", i);
                        (i, i)
                    }
                    None => return,
                }
            }
            _ => {
                debug!("전체 목록 요청");
                (0, LOG_LIST_ALL)
            }
        };

        let request = Message::LogRequestList(LogRequestList {
            target_system: self.peer,
            target_component: 0,
            start,
            end,
        });
        self.send(request, now);
    }

    /// 수신 메시지 처리. 에러는 밖으로 나가지 않음
    pub fn handle_message(&mut self, message: &Message, now: Instant) {
        match message {
            Message::LogEntry(entry) if self.phase == Phase::Listing => {
                self.on_log_entry(entry, now);
            }
            Message::LogData(data) if self.phase == Phase::Fetching => {
                self.on_log_data(data, now);
            }
            _ => {}
        }
    }

    fn on_log_entry(&mut self, entry: &LogEntryMessage, now: Instant) {
        self.last_received = Some(now);

        if entry.num_logs == 0 {
            // 로그가 없거나 원격이 로그 목록을 열지 못하는 상태
            warn!("로그 개수 0 수신: peer={}", self.peer);
            self.stop();
            self.status = Status::NoLogs;
            return;
        }

        let total = *self.list_total.get_or_insert(entry.num_logs);

        if !self.listing.contains_key(&entry.id) {
            self.listing.insert(entry.id, entry.clone());
            debug!("LOG_ENTRY: {}/{}", self.listing.len(), total);
        }

        if self.listing.len() >= total as usize {
            self.apply_listing();
        }
    }

    fn apply_listing(&mut self) {
        debug!("로그 목록 수신 완료: {} entries", self.listing.len());

        let remote: Vec<LogEntry> = self.listing.values().map(LogEntry::from).collect();
        if let Some(i) = self.catalog.reconcile(&remote) {
            debug!("카탈로그 갱신: 위치 {}부터 교체", i);
        }
        self.persist();

        // 다음 tick에서 다운로드 대상 선택
        self.phase = Phase::Standby;
        self.list_updated = true;
    }

    fn start_fetching(&mut self, pos: usize, now: Instant) {
        let Some(entry) = self.catalog.entries.get(pos).cloned() else {
            error!("로그 항목 {} 없음", pos);
            self.start_listing(now);
            return;
        };

        debug!("로그 {} 다운로드 시작: {} / {}", entry.id, entry.fetched, entry.size);

        self.last_action = Some(now);
        self.phase = Phase::Fetching;
        self.current = Some(pos);
        self.current_id = entry.id;
        self.output_path = self.log_dir.join(format!(".{}", log_file_name(entry.utc)));

        let fetched = self.check_partial_file(pos, &entry);

        self.block.reset(fetched as u64, entry.size as u64);
        self.writing_blocked = false;
        self.request_deferred = false;

        self.fetch_data(now);
    }

    /// 부분 파일 크기와 카탈로그 진행 상태를 맞춤. 맞춘 fetched 반환
    fn check_partial_file(&mut self, pos: usize, entry: &LogEntry) -> u32 {
        let file_size = match fs::metadata(&self.output_path) {
            Ok(meta) => meta.len(),
            Err(_) => 0,
        };

        if file_size > entry.fetched as u64 {
            // 카탈로그 저장 후 기록되지 않은 꼬리가 남아있음
            warn!(
                "파일과 항목 크기 불일치: file {}, entry {}; 파일 자름",
                file_size, entry.fetched
            );

            let truncated = fs::OpenOptions::new()
                .write(true)
                .open(&self.output_path)
                .and_then(|f| f.set_len(entry.fetched as u64));
            if let Err(e) = truncated {
                error!("파일 자르기 실패 ({:?}): {}", self.output_path, e);
            }
            return entry.fetched;
        }

        if file_size < entry.fetched as u64 {
            // 파일 기록 전에 카탈로그만 저장된 경우
            warn!(
                "파일이 항목보다 작음: file {}, entry {}; 진행 상태 보정",
                file_size, entry.fetched
            );

            let corrected = file_size as u32;
            self.catalog.entries[pos].fetched = corrected;
            self.persist();
            return corrected;
        }

        entry.fetched
    }

    fn fetch_data(&mut self, now: Instant) {
        if self.writing_blocked {
            debug!("쓰기 대기 중, 요청 보류");
            self.request_deferred = true;
            return;
        }
        self.request_deferred = false;

        let Some(range) = self.block.next_request() else {
            return;
        };

        debug!("fetch {} (log {})", range, self.current_id);

        let request = Message::LogRequestData(LogRequestData {
            target_system: self.peer,
            target_component: 0,
            id: self.current_id,
            ofs: range.start as u32,
            count: range.len() as u32,
        });
        self.send(request, now);
    }

    fn on_log_data(&mut self, data: &LogData, now: Instant) {
        self.last_received = Some(now);

        if data.id != self.current_id {
            // 이전 로그의 늦은 응답
            debug!("다른 로그 id {}", data.id);
            return;
        }

        let payload = data.payload();
        match self.block.ingest(data.ofs as u64, payload) {
            Ingest::OutOfWindow => {
                // 블록 완료와 타임아웃이 겹치면 생길 수 있음
                debug!(
                    "블록 범위 밖 {} ({} - {})",
                    data.ofs,
                    self.block.offset(),
                    self.block.offset() + self.block.size()
                );
            }
            Ingest::Stored { request_complete } => {
                self.rate.record(payload.len());
                if request_complete {
                    self.on_request_complete(now);
                }
            }
        }
    }

    fn current_entry(&self) -> Option<&LogEntry> {
        self.current.and_then(|pos| self.catalog.entries.get(pos))
    }

    fn on_request_complete(&mut self, now: Instant) {
        let Some(size) = self.current_entry().map(|e| e.size as u64) else {
            return;
        };

        if self.block.has_missing() {
            debug!("블록 누락 구간 {}개", self.block.missing().len());
            self.fetch_data(now);
            return;
        }

        // 마지막 블록이면 로그 끝까지만 기록됨
        self.phase = Phase::Writing;
        let job = WriteJob {
            log_id: self.current_id,
            path: self.output_path.clone(),
            offset: self.block.offset(),
            data: Bytes::copy_from_slice(self.block.valid_data(size)),
        };

        if self.sink.submit(job) == Backpressure::Saturated {
            debug!("쓰기 큐 포화");
            self.writing_blocked = true;
        }
    }

    /// 파일 writer 이벤트 처리
    pub fn on_write_event(&mut self, event: WriteEvent, now: Instant) {
        match event {
            WriteEvent::Drained => {
                debug!("쓰기 대기 해제");
                self.writing_blocked = false;
                if self.request_deferred && self.phase == Phase::Fetching {
                    self.fetch_data(now);
                }
            }
            WriteEvent::Completed {
                log_id,
                offset,
                result,
            } => self.on_block_written(log_id, offset, result, now),
        }
    }

    fn on_block_written(
        &mut self,
        log_id: u16,
        offset: u64,
        result: std::io::Result<()>,
        now: Instant,
    ) {
        if self.phase != Phase::Writing || log_id != self.current_id || offset != self.block.offset() {
            // 재시작 이후 도착한 이전 쓰기 완료. 다음 시작 때 파일이 잘림
            debug!("이전 쓰기 완료 무시: log {} @ {}", log_id, offset);
            return;
        }

        if let Err(e) = result {
            error!("로그 {} 기록 실패: {}", log_id, e);
            self.phase = Phase::Standby;
            self.status = Status::Error;
            return;
        }

        let Some(pos) = self.current else {
            return;
        };
        let size = self.catalog.entries[pos].size;

        if self.block.is_last(size as u64) {
            self.catalog.entries[pos].fetched = size;
            self.persist();
            self.finish_output();

            self.phase = Phase::Standby;
            info!("로그 {} 다운로드 완료 ({} bytes)", log_id, size);
            notify(
                &self.events,
                LinkEvent::Downloaded {
                    peer: self.peer,
                    log_id,
                },
            );
        } else {
            let fetched = self.block.offset() + self.block.size();
            self.catalog.entries[pos].fetched = fetched as u32;
            self.persist();

            debug!("다음 블록: log {} @ {}", log_id, fetched);
            self.block.advance(size as u64);
            self.phase = Phase::Fetching;
            self.fetch_data(now);
        }
    }

    /// 앞의 '.'을 떼어 완료 파일로 표시
    fn finish_output(&self) {
        let Some(name) = self.output_path.file_name().and_then(|n| n.to_str()) else {
            return;
        };
        let Some(visible) = name.strip_prefix('.') else {
            return;
        };

        let target = self.output_path.with_file_name(visible);
        if let Err(e) = fs::rename(&self.output_path, &target) {
            error!("완료 파일 이름 변경 실패 ({:?}): {}", self.output_path, e);
        }
    }

    fn emit_progress(&self) {
        let Some(entry) = self.current_entry() else {
            return;
        };

        let progress = Progress {
            log_id: self.current_id,
            log_total: self.list_total.unwrap_or(self.catalog.len() as u16),
            download_rate: self.rate.rate(),
            log_fetched_bytes: entry.fetched,
            log_total_bytes: entry.size,
            total_progress: self.catalog.total_progress(),
        };

        debug!("fetching {}", progress.summary());
        notify(
            &self.events,
            LinkEvent::Progress {
                peer: self.peer,
                progress,
            },
        );
    }

    /// 주기적 호출 (기준 100ms). 타임아웃/재시도와 다음 로그 선택
    pub fn tick(&mut self, now: Instant) {
        if self.status != Status::Running {
            return;
        }

        if self.phase == Phase::Standby && self.list_updated {
            match self.catalog.next_target(self.reverse) {
                Some(pos) => self.start_fetching(pos, now),
                None => self.current = None,
            }
            return;
        }

        self.rate.update(now);

        if self.phase == Phase::Fetching
            && since(self.last_progress, now) > self.config.progress_interval()
        {
            self.emit_progress();
            self.last_progress = Some(now);
        }

        let idle = since(self.last_received, now);

        // 긴 무응답: 목록부터 다시
        if idle > self.config.stall_timeout() {
            match self.phase {
                Phase::Fetching => {
                    error!("긴 타임아웃, 목록부터 재시작: peer={}", self.peer);
                    self.start_listing(now);
                    return;
                }
                Phase::Writing => {
                    error!("쓰기 정체, 목록부터 재시작: peer={}", self.peer);
                    self.start_listing(now);
                    return;
                }
                _ => {}
            }
        }

        let waited = since(self.last_action, now);

        if self.phase == Phase::Listing
            && waited > self.config.list_timeout()
            && idle > self.config.list_timeout()
        {
            warn!("목록 타임아웃: peer={}", self.peer);
            self.list_entries(now);
        }

        if self.phase == Phase::Fetching
            && !self.writing_blocked
            && waited > self.config.request_timeout()
            && idle > self.config.request_timeout()
        {
            // 마지막으로 연속 수신한 지점부터 다시 요청
            let range = self.block.requeue_current();
            debug!("fetch 타임아웃, 재요청 {}", range);
            self.fetch_data(now);
        }
    }
}
