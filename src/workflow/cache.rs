use super::{SpecError, WorkflowSpec};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

pub const SPEC_CACHE_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub size: usize,
    pub hit_rate: f64,
}

struct CacheEntry {
    spec: Arc<WorkflowSpec>,
    digest: [u8; 32],
    loaded_at: Instant,
}

/// Workflow-id keyed spec cache. Entries are reused until the TTL expires;
/// expired entries are revalidated against the file's content digest and
/// only reparsed when the bytes changed. No negative caching: load failures
/// are returned and nothing is stored.
pub struct SpecCache {
    dir: PathBuf,
    ttl: Duration,
    entries: Mutex<HashMap<String, CacheEntry>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl SpecCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self::with_ttl(dir, SPEC_CACHE_TTL)
    }

    pub fn with_ttl(dir: impl Into<PathBuf>, ttl: Duration) -> Self {
        Self {
            dir: dir.into(),
            ttl,
            entries: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn spec_path(&self, workflow_id: &str) -> PathBuf {
        self.dir.join(format!("{workflow_id}.yaml"))
    }

    pub fn get_spec(&self, workflow_id: &str) -> Result<Arc<WorkflowSpec>, SpecError> {
        let mut entries = self.entries.lock().unwrap_or_else(|err| err.into_inner());

        if let Some(entry) = entries.get_mut(workflow_id) {
            if entry.loaded_at.elapsed() < self.ttl {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(entry.spec.clone());
            }
            // TTL expired: revalidate against the on-disk bytes.
            let path = self.spec_path(workflow_id);
            let raw = fs::read(&path).map_err(|source| SpecError::Read {
                path: path.display().to_string(),
                source,
            })?;
            let digest = content_digest(&raw);
            if digest == entry.digest {
                entry.loaded_at = Instant::now();
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(entry.spec.clone());
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let path = self.spec_path(workflow_id);
        let raw = fs::read(&path).map_err(|source| SpecError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let spec: WorkflowSpec =
            serde_yaml::from_str(&String::from_utf8_lossy(&raw)).map_err(|source| {
                SpecError::Parse {
                    path: path.display().to_string(),
                    source,
                }
            })?;
        spec.validate()?;
        let spec = Arc::new(spec);
        entries.insert(
            workflow_id.to_string(),
            CacheEntry {
                spec: spec.clone(),
                digest: content_digest(&raw),
                loaded_at: Instant::now(),
            },
        );
        Ok(spec)
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheStats {
            hits,
            misses,
            size: self
                .entries
                .lock()
                .unwrap_or_else(|err| err.into_inner())
                .len(),
            hit_rate: if total == 0 {
                0.0
            } else {
                hits as f64 / total as f64
            },
        }
    }
}

fn content_digest(raw: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(raw);
    hasher.finalize().into()
}
