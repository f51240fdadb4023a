//! 블록 조립
//!
//! - Block: 한 번에 가져오는 로그의 연속 구간 (기본 40950 bytes)
//! - ByteRange: 블록 안에서 아직 받지 못한 반열린 구간
//!
//! 누락 구간은 스택으로 관리하며 가장 위 구간을 다음에 요청함.
//! 간격은 앞으로만 감지함: 기대 오프셋보다 뒤에서 도착한 조각만 새 누락 구간을 만듦.

use std::fmt;

use bytes::BytesMut;

/// 반열린 바이트 구간 `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} - {} ({})", self.start, self.end, self.len())
    }
}

/// 조각 수신 결과
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ingest {
    /// 현재 블록 범위 밖 (늦게 도착한 이전 블록 조각 등)
    OutOfWindow,
    /// 저장됨. 현재 요청 범위 끝까지 도달했는지 여부
    Stored { request_complete: bool },
}

/// 현재 받고 있는 블록의 상태
#[derive(Debug)]
pub struct Block {
    /// 로그 안에서 이 블록의 시작 오프셋
    offset: u64,
    size: usize,
    buffer: BytesMut,
    /// 누락 구간 스택 (마지막 원소가 다음 요청)
    missing: Vec<ByteRange>,
    request_offset: u64,
    request_size: u64,
    /// 연속이라고 볼 수 있는 다음 오프셋
    next_expected: u64,
    /// 타임아웃 후 복구 지점
    last_contiguous: u64,
}

impl Block {
    pub fn new(size: usize) -> Self {
        let mut buffer = BytesMut::with_capacity(size);
        buffer.resize(size, 0);

        Self {
            offset: 0,
            size,
            buffer,
            missing: Vec::new(),
            request_offset: 0,
            request_size: 0,
            next_expected: 0,
            last_contiguous: 0,
        }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn size(&self) -> u64 {
        self.size as u64
    }

    pub fn missing(&self) -> &[ByteRange] {
        &self.missing
    }

    pub fn has_missing(&self) -> bool {
        !self.missing.is_empty()
    }

    pub fn next_expected(&self) -> u64 {
        self.next_expected
    }

    pub fn last_contiguous(&self) -> u64 {
        self.last_contiguous
    }

    /// 로그 길이 `entry_size` 기준, `offset`에서 시작하는 새 블록
    ///
    /// 누락 구간은 블록 전체 하나로 초기화됨.
    pub fn reset(&mut self, offset: u64, entry_size: u64) {
        self.offset = offset;
        self.missing.clear();
        self.push_block_range(entry_size);
    }

    /// 다음 블록으로 이동 (이전 블록이 기록된 뒤 호출)
    pub fn advance(&mut self, entry_size: u64) {
        self.offset += self.size as u64;
        self.push_block_range(entry_size);
    }

    fn push_block_range(&mut self, entry_size: u64) {
        let len = (self.size as u64).min(entry_size.saturating_sub(self.offset));
        self.missing.push(ByteRange::new(self.offset, self.offset + len));
    }

    /// 이 블록이 로그의 마지막 블록인지
    pub fn is_last(&self, entry_size: u64) -> bool {
        self.offset + self.size as u64 >= entry_size
    }

    /// 기록할 유효 데이터 (마지막 블록이면 로그 끝까지만)
    pub fn valid_data(&self, entry_size: u64) -> &[u8] {
        let len = entry_size.saturating_sub(self.offset).min(self.size as u64) as usize;
        &self.buffer[..len]
    }

    /// 스택 맨 위 구간을 꺼내 현재 요청으로 설정
    pub fn next_request(&mut self) -> Option<ByteRange> {
        let range = self.missing.pop()?;

        self.request_offset = range.start;
        self.request_size = range.len();
        self.next_expected = range.start;
        self.last_contiguous = range.start;

        Some(range)
    }

    /// 타임아웃: 마지막 연속 지점부터 현재 요청 끝까지 다시 넣음
    pub fn requeue_current(&mut self) -> ByteRange {
        let range = ByteRange::new(
            self.last_contiguous,
            self.request_offset + self.request_size,
        );
        self.missing.push(range);
        range
    }

    /// 데이터 조각 수신
    pub fn ingest(&mut self, ofs: u64, payload: &[u8]) -> Ingest {
        if ofs < self.offset || ofs > self.offset + self.size as u64 {
            return Ingest::OutOfWindow;
        }

        let end = ofs + payload.len() as u64;

        if ofs > self.next_expected {
            // next_expected ~ ofs 구간이 빠짐
            self.missing.push(ByteRange::new(self.next_expected, ofs));
        } else {
            self.last_contiguous = ofs;

            // 누락 구간을 정확히 채우는 조각이면 스택에서 제거
            if let Some(pos) = self
                .missing
                .iter()
                .position(|r| r.start == ofs && r.end == end)
            {
                self.missing.remove(pos);
            }
        }

        self.next_expected = self.next_expected.max(end);

        // 버퍼 범위로 잘라서 복사
        let start = (ofs - self.offset) as usize;
        let stop = (start + payload.len()).min(self.size);
        if start < stop {
            self.buffer[start..stop].copy_from_slice(&payload[..stop - start]);
        }

        Ingest::Stored {
            request_complete: end >= self.request_offset + self.request_size,
        }
    }
}
