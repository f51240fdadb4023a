//! 로그 파일 기록
//!
//! - 블록 단위 위치 지정 쓰기 + fsync 후 완료 이벤트
//! - 큐에 쌓인 바이트가 high-water mark를 넘으면 포화 신호, 비워지면 Drained

use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::PeerId;

/// 블록 쓰기 작업
#[derive(Debug, Clone)]
pub struct WriteJob {
    pub log_id: u16,
    pub path: PathBuf,
    /// 파일 안 오프셋
    pub offset: u64,
    pub data: Bytes,
}

/// 쓰기 제출 결과
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backpressure {
    Ready,
    /// 받아들였지만 큐가 가득 참. Drained 전까지 요청 중단
    Saturated,
}

/// 쓰기 완료 신호
#[derive(Debug)]
pub enum WriteEvent {
    Completed {
        log_id: u16,
        offset: u64,
        result: std::io::Result<()>,
    },
    /// 포화 상태 해제
    Drained,
}

/// 블록 출력 대상
pub trait BlockSink: Send {
    fn submit(&mut self, job: WriteJob) -> Backpressure;
}

/// tokio 태스크 기반 파일 writer
///
/// 완료 이벤트는 `(PeerId, WriteEvent)`로 링크 드라이버에 전달됨.
pub struct FileWriter {
    job_tx: mpsc::UnboundedSender<WriteJob>,
    queued: Arc<AtomicUsize>,
    needs_drain: Arc<AtomicBool>,
    high_water: usize,
}

impl FileWriter {
    /// writer 태스크 시작 (tokio 런타임 안에서 호출)
    pub fn spawn(
        peer: PeerId,
        events: mpsc::UnboundedSender<(PeerId, WriteEvent)>,
        high_water: usize,
    ) -> Self {
        let (job_tx, mut job_rx) = mpsc::unbounded_channel::<WriteJob>();
        let queued = Arc::new(AtomicUsize::new(0));
        let needs_drain = Arc::new(AtomicBool::new(false));

        let queued_task = queued.clone();
        let needs_drain_task = needs_drain.clone();

        tokio::spawn(async move {
            while let Some(job) = job_rx.recv().await {
                let len = job.data.len();
                let result = write_block(&job).await;

                if let Err(e) = &result {
                    warn!("로그 {} 쓰기 실패 ({:?}): {}", job.log_id, job.path, e);
                }

                let remaining = queued_task.fetch_sub(len, Ordering::SeqCst) - len;

                // Drained가 완료보다 먼저 도착해야 다음 요청이 막히지 않음
                if remaining == 0 && needs_drain_task.swap(false, Ordering::SeqCst) {
                    debug!("쓰기 큐 비워짐: peer={}", peer);
                    if events.send((peer, WriteEvent::Drained)).is_err() {
                        break;
                    }
                }

                let done = WriteEvent::Completed {
                    log_id: job.log_id,
                    offset: job.offset,
                    result,
                };
                if events.send((peer, done)).is_err() {
                    break;
                }
            }
        });

        Self {
            job_tx,
            queued,
            needs_drain,
            high_water,
        }
    }
}

impl BlockSink for FileWriter {
    fn submit(&mut self, job: WriteJob) -> Backpressure {
        let len = job.data.len();
        let queued = self.queued.fetch_add(len, Ordering::SeqCst) + len;
        let saturated = queued >= self.high_water;

        // 태스크가 먼저 끝내도 Drained를 놓치지 않도록 전송 전에 표시
        if saturated {
            self.needs_drain.store(true, Ordering::SeqCst);
        }

        if self.job_tx.send(job).is_err() {
            self.queued.fetch_sub(len, Ordering::SeqCst);
            self.needs_drain.store(false, Ordering::SeqCst);
            warn!("writer 태스크 종료됨");
            return Backpressure::Ready;
        }

        if saturated {
            Backpressure::Saturated
        } else {
            Backpressure::Ready
        }
    }
}

async fn write_block(job: &WriteJob) -> std::io::Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .open(&job.path)
        .await?;

    file.seek(SeekFrom::Start(job.offset)).await?;
    file.write_all(&job.data).await?;
    file.sync_data().await?;
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_file_writer_positional_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".log_test.px4log");
        let (tx, mut rx) = mpsc::unbounded_channel();

        let mut writer = FileWriter::spawn(7, tx, 1024 * 1024);

        let first = writer.submit(WriteJob {
            log_id: 1,
            path: path.clone(),
            offset: 0,
            data: Bytes::from(vec![1u8; 100]),
        });
        assert_eq!(first, Backpressure::Ready);

        writer.submit(WriteJob {
            log_id: 1,
            path: path.clone(),
            offset: 100,
            data: Bytes::from(vec![2u8; 50]),
        });

        for expected_offset in [0u64, 100] {
            match rx.recv().await.unwrap() {
                (7, WriteEvent::Completed { offset, result, .. }) => {
                    assert_eq!(offset, expected_offset);
                    assert!(result.is_ok());
                }
                other => panic!("unexpected event: {:?}", other),
            }
        }

        let content = std::fs::read(&path).unwrap();
        assert_eq!(content.len(), 150);
        assert_eq!(content[99], 1);
        assert_eq!(content[100], 2);
    }

    #[tokio::test]
    async fn test_file_writer_saturation_then_drain() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");
        let (tx, mut rx) = mpsc::unbounded_channel();

        let mut writer = FileWriter::spawn(1, tx, 16);

        let status = writer.submit(WriteJob {
            log_id: 3,
            path,
            offset: 0,
            data: Bytes::from(vec![9u8; 64]),
        });
        assert_eq!(status, Backpressure::Saturated);

        // Drained가 Completed보다 먼저 옴
        assert!(matches!(rx.recv().await.unwrap(), (1, WriteEvent::Drained)));
        assert!(matches!(
            rx.recv().await.unwrap(),
            (1, WriteEvent::Completed { log_id: 3, .. })
        ));
    }
}
