use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use exchange_core::ExchangeState;
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("encode: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("save timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("save task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
    #[error("store lock poisoned")]
    Poisoned,
}

// load never fails: a missing or unreadable blob yields the empty state.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn load(&self) -> ExchangeState;
    async fn save(&self, state: &ExchangeState) -> Result<(), StoreError>;
}

pub struct JsonFileStore {
    path: PathBuf,
    generation: AtomicU64,
    // generation of the snapshot currently on disk
    written: Arc<tokio::sync::Mutex<u64>>,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            generation: AtomicU64::new(0),
            written: Arc::new(tokio::sync::Mutex::new(0)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl StateStore for JsonFileStore {
    async fn load(&self) -> ExchangeState {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => decode(&bytes, &self.path.display().to_string()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no saved state, starting empty");
                ExchangeState::default()
            }
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "unable to read saved state");
                ExchangeState::default()
            }
        }
    }

    async fn save(&self, state: &ExchangeState) -> Result<(), StoreError> {
        let json = serde_json::to_vec_pretty(state)?;
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let path = self.path.clone();
        let written = Arc::clone(&self.written);

        // Runs to completion even if the caller stops waiting, so a timed-out
        // save can never interleave with the next one.
        let task = tokio::spawn(async move {
            let mut on_disk = written.lock().await;
            if *on_disk > generation {
                debug!(generation, "newer snapshot already saved, skipping");
                return Ok(());
            }
            write_atomically(&path, generation, &json).await?;
            *on_disk = generation;
            Ok::<(), StoreError>(())
        });
        task.await?
    }
}

async fn write_atomically(path: &Path, generation: u64, json: &[u8]) -> Result<(), StoreError> {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(format!(".tmp{generation}"));
    let tmp = path.with_file_name(name);

    tokio::fs::write(&tmp, json).await?;
    if let Err(err) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(err.into());
    }
    Ok(())
}

// Used when no state path is configured.
#[derive(Default)]
pub struct MemoryStore {
    blob: Mutex<Option<Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_blob(blob: impl Into<Vec<u8>>) -> Self {
        Self {
            blob: Mutex::new(Some(blob.into())),
        }
    }

    pub fn blob(&self) -> Option<Vec<u8>> {
        self.blob.lock().ok().and_then(|guard| guard.clone())
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn load(&self) -> ExchangeState {
        match self.blob() {
            Some(bytes) => decode(&bytes, "memory"),
            None => ExchangeState::default(),
        }
    }

    async fn save(&self, state: &ExchangeState) -> Result<(), StoreError> {
        let json = serde_json::to_vec(state)?;
        let mut guard = self.blob.lock().map_err(|_| StoreError::Poisoned)?;
        *guard = Some(json);
        Ok(())
    }
}

fn decode(bytes: &[u8], source: &str) -> ExchangeState {
    match serde_json::from_slice::<ExchangeState>(bytes) {
        Ok(mut state) => {
            if let Err(violation) = state.check_invariants() {
                warn!(source, %violation, "saved state is inconsistent, repairing");
                state.sanitize();
            }
            state
        }
        Err(err) => {
            warn!(source, error = %err, "saved state is corrupt, starting empty");
            ExchangeState::default()
        }
    }
}
