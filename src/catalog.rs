//! 로그 카탈로그 (다운로드 진행 상태의 유일한 영구 기록)
//!
//! `<log_dir>/.state.json`에 JSON으로 저장되며 매번 전체를 새로 씀
//! (임시 파일에 쓴 뒤 rename).

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::message::LogEntryMessage;
use crate::Result;

/// 현재 카탈로그 파일 이름
pub const CATALOG_FILE: &str = ".state.json";

/// 이전 버전의 카탈로그 파일 이름
pub const LEGACY_CATALOG_FILE: &str = "state.json";

/// 원격 로그 하나의 카탈로그 항목
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: u16,
    pub utc: u32,
    pub size: u32,
    /// 디스크에 확실히 기록된 바이트 수 (0 ≤ fetched ≤ size)
    pub fetched: u32,
    /// id, utc, size 기반 식별 해시 (변경 감지용)
    pub hash: String,
}

impl LogEntry {
    pub fn new(id: u16, utc: u32, size: u32) -> Self {
        Self {
            id,
            utc,
            size,
            fetched: 0,
            hash: content_hash(id, utc, size),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.fetched >= self.size
    }
}

impl From<&LogEntryMessage> for LogEntry {
    fn from(msg: &LogEntryMessage) -> Self {
        LogEntry::new(msg.id, msg.time_utc, msg.size)
    }
}

/// 식별 해시 계산 (sha256, hex)
pub fn content_hash(id: u16, utc: u32, size: u32) -> String {
    let mut hasher = Sha256::new();
    hasher.update(id.to_string());
    hasher.update(utc.to_string());
    hasher.update(size.to_string());
    format!("{:x}", hasher.finalize())
}

/// 영구 카탈로그
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Catalog {
    pub entries: Vec<LogEntry>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn path(log_dir: &Path) -> PathBuf {
        log_dir.join(CATALOG_FILE)
    }

    /// 이전 파일 이름이 남아있으면 현재 이름으로 변경
    pub fn migrate_legacy(log_dir: &Path) -> Result<bool> {
        let legacy = log_dir.join(LEGACY_CATALOG_FILE);
        if !legacy.exists() {
            return Ok(false);
        }

        let current = Self::path(log_dir);
        fs::rename(&legacy, &current)?;
        info!("카탈로그 파일 이동: {:?} -> {:?}", legacy, current);
        Ok(true)
    }

    /// 디스크에서 로드 (없거나 깨졌으면 빈 카탈로그)
    pub fn load(log_dir: &Path) -> Self {
        let path = Self::path(log_dir);

        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(_) => {
                info!("카탈로그 파일 없음: {:?}", path);
                return Self::default();
            }
        };

        match serde_json::from_str::<Catalog>(&content) {
            Ok(mut catalog) => {
                catalog.clamp_fetched();
                debug!("카탈로그 로드: {} entries", catalog.entries.len());
                catalog
            }
            Err(e) => {
                warn!("카탈로그 파싱 실패, 빈 상태로 시작: {:?}: {}", path, e);
                Self::default()
            }
        }
    }

    /// 전체 파일을 원자적으로 교체
    pub fn save(&self, log_dir: &Path) -> Result<()> {
        let path = Self::path(log_dir);
        let tmp = log_dir.join(format!("{}.tmp", CATALOG_FILE));

        let content = serde_json::to_string(self)?;
        fs::write(&tmp, content)?;
        fs::rename(&tmp, &path)?;

        debug!("카탈로그 저장: {} entries", self.entries.len());
        Ok(())
    }

    fn clamp_fetched(&mut self) {
        for entry in &mut self.entries {
            if entry.fetched > entry.size {
                warn!(
                    "fetched가 size보다 큼: log {} ({} > {})",
                    entry.id, entry.fetched, entry.size
                );
                entry.fetched = entry.size;
            }
        }
    }

    /// 새로 조회한 원격 목록과 위치 기준으로 맞춤
    ///
    /// 해시가 처음 달라지는 위치부터 뒤는 버리고 원격 항목으로 대체.
    /// 그 앞의 항목(진행 상태 포함)은 유지됨. 원격 목록보다 긴 꼬리도 제거.
    /// 첫 불일치 위치를 반환 (모두 일치하면 None).
    pub fn reconcile(&mut self, remote: &[LogEntry]) -> Option<usize> {
        let mut divergence = None;

        for (i, fresh) in remote.iter().enumerate() {
            if i < self.entries.len() && self.entries[i].hash == fresh.hash {
                continue;
            }

            if i < self.entries.len() {
                debug!("카탈로그 정리: 앞 {}개 항목 유지", i);
                self.entries.truncate(i);
            }

            debug!(
                "새 로그: id={} utc={} size={} hash={}",
                fresh.id, fresh.utc, fresh.size, fresh.hash
            );

            let mut entry = fresh.clone();
            entry.fetched = 0;
            self.entries.push(entry);
            if divergence.is_none() {
                divergence = Some(i);
            }
        }

        if self.entries.len() > remote.len() {
            debug!(
                "원격에 없는 항목 제거: {} -> {}",
                self.entries.len(),
                remote.len()
            );
            self.entries.truncate(remote.len());
            if divergence.is_none() {
                divergence = Some(remote.len());
            }
        }

        divergence
    }

    /// 다음 다운로드 대상 위치
    pub fn next_target(&self, reverse: bool) -> Option<usize> {
        if reverse {
            self.entries.iter().rposition(|e| !e.is_complete())
        } else {
            self.entries.iter().position(|e| !e.is_complete())
        }
    }

    /// 전체 진행률 (0.0 ~ 1.0, 항목이 없으면 1.0)
    pub fn total_progress(&self) -> f64 {
        let total: u64 = self.entries.iter().map(|e| e.size as u64).sum();
        let fetched: u64 = self.entries.iter().map(|e| e.fetched as u64).sum();

        if total == 0 {
            return 1.0;
        }
        fetched as f64 / total as f64
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote(list: &[(u16, u32, u32)]) -> Vec<LogEntry> {
        list.iter()
            .map(|&(id, utc, size)| LogEntry::new(id, utc, size))
            .collect()
    }

    #[test]
    fn test_hash_identifies_entry() {
        assert_eq!(content_hash(1, 100, 2000), content_hash(1, 100, 2000));
        assert_ne!(content_hash(1, 100, 2000), content_hash(1, 100, 2001));
        assert_eq!(content_hash(1, 100, 2000).len(), 64);
    }

    #[test]
    fn test_reconcile_keeps_prefix_before_divergence() {
        let mut catalog = Catalog::new();
        catalog.reconcile(&remote(&[(0, 10, 100), (1, 20, 200), (2, 30, 300)]));
        for entry in &mut catalog.entries {
            entry.fetched = entry.size / 2;
        }

        // 인덱스 1이 바뀜
        let fresh = remote(&[(0, 10, 100), (1, 25, 250), (2, 30, 300), (3, 40, 400)]);
        assert_eq!(catalog.reconcile(&fresh), Some(1));

        assert_eq!(catalog.len(), 4);
        assert_eq!(catalog.entries[0].fetched, 50);
        assert_eq!(catalog.entries[1].utc, 25);
        assert_eq!(catalog.entries[1].fetched, 0);
        // 인덱스 2는 원래와 같지만 불일치 이후라 진행 상태가 초기화됨
        assert_eq!(catalog.entries[2].fetched, 0);
        assert_eq!(catalog.entries[3].fetched, 0);
    }

    #[test]
    fn test_reconcile_unchanged_catalog() {
        let list = remote(&[(0, 10, 100), (1, 20, 200)]);
        let mut catalog = Catalog::new();
        catalog.reconcile(&list);
        catalog.entries[1].fetched = 150;

        assert_eq!(catalog.reconcile(&list), None);
        assert_eq!(catalog.entries[1].fetched, 150);
    }

    #[test]
    fn test_reconcile_drops_stale_tail() {
        let mut catalog = Catalog::new();
        catalog.reconcile(&remote(&[(0, 10, 100), (1, 20, 200), (2, 30, 300)]));

        assert_eq!(catalog.reconcile(&remote(&[(0, 10, 100)])), Some(1));
        assert_eq!(catalog.len(), 1);
    }

    #[test]
    fn test_next_target_order() {
        let mut catalog = Catalog::new();
        catalog.reconcile(&remote(&[(0, 10, 100), (1, 20, 200), (2, 30, 300)]));
        catalog.entries[0].fetched = 100;

        assert_eq!(catalog.next_target(false), Some(1));
        assert_eq!(catalog.next_target(true), Some(2));

        for entry in &mut catalog.entries {
            entry.fetched = entry.size;
        }
        assert_eq!(catalog.next_target(false), None);
        assert_eq!(catalog.total_progress(), 1.0);
    }

    #[test]
    fn test_save_load_and_migrate() {
        let dir = tempfile::tempdir().unwrap();

        let mut catalog = Catalog::new();
        catalog.reconcile(&remote(&[(0, 10, 100)]));
        catalog.entries[0].fetched = 90;
        catalog.save(dir.path()).unwrap();

        // JSON 형식 확인
        let raw = fs::read_to_string(Catalog::path(dir.path())).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["entries"][0]["fetched"], 90);
        assert_eq!(value["entries"][0]["utc"], 10);

        // 이전 파일 이름으로 옮긴 뒤 마이그레이션
        fs::rename(Catalog::path(dir.path()), dir.path().join(LEGACY_CATALOG_FILE)).unwrap();
        assert!(Catalog::migrate_legacy(dir.path()).unwrap());
        assert!(!Catalog::migrate_legacy(dir.path()).unwrap());

        assert_eq!(Catalog::load(dir.path()), catalog);
    }

    #[test]
    fn test_load_corrupt_or_overfetched() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(Catalog::path(dir.path()), "{not json").unwrap();
        assert!(Catalog::load(dir.path()).is_empty());

        let mut catalog = Catalog::new();
        catalog.reconcile(&remote(&[(0, 10, 100)]));
        catalog.entries[0].fetched = 500;
        catalog.save(dir.path()).unwrap();

        let loaded = Catalog::load(dir.path());
        assert_eq!(loaded.entries[0].fetched, 100);
    }
}
