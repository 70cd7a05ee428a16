//! Durable step execution.
//!
//! A workflow runs as a sequence of named steps. Each step's result is
//! persisted in a [`StepJournal`] once the step finishes; running the
//! same workflow key again replays finished steps from the journal
//! instead of executing them, so execution resumes at the first step
//! with no recorded result. Steps must therefore be safe to re-run if the
//! process dies after the side effect but before the journal write.
//!
//! [`KeyedLocks`] serializes operations that share a key (a project id)
//! while letting different keys run in parallel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::OwnedMutexGuard;
use tracing::debug;

use keel_state::StateStore;

use crate::error::{WorkflowError, WorkflowResult};

/// Storage for completed step results.
pub trait StepJournal: Send + Sync {
    fn load(&self, workflow_key: &str, step: &str) -> WorkflowResult<Option<Vec<u8>>>;

    fn save(&self, workflow_key: &str, step: &str, value: &[u8]) -> WorkflowResult<()>;

    fn completed_steps(&self, workflow_key: &str) -> WorkflowResult<Vec<String>>;
}

impl StepJournal for StateStore {
    fn load(&self, workflow_key: &str, step: &str) -> WorkflowResult<Option<Vec<u8>>> {
        Ok(self.get_checkpoint(workflow_key, step)?)
    }

    fn save(&self, workflow_key: &str, step: &str, value: &[u8]) -> WorkflowResult<()> {
        Ok(self.put_checkpoint(workflow_key, step, value)?)
    }

    fn completed_steps(&self, workflow_key: &str) -> WorkflowResult<Vec<String>> {
        Ok(self.list_checkpoints(workflow_key)?)
    }
}

/// One run (or resumed run) of a keyed workflow.
pub struct Execution {
    journal: Arc<dyn StepJournal>,
    key: String,
    executed: AtomicUsize,
    replayed: AtomicUsize,
}

impl Execution {
    pub fn new(journal: Arc<dyn StepJournal>, key: &str) -> Self {
        Self {
            journal,
            key: key.to_string(),
            executed: AtomicUsize::new(0),
            replayed: AtomicUsize::new(0),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Run `step` unless its result is already journaled, in which case
    /// the journaled result is returned and `step` is never called.
    pub async fn step<T, F, Fut>(&self, name: &str, step: F) -> WorkflowResult<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = WorkflowResult<T>>,
    {
        if let Some(bytes) = self.journal.load(&self.key, name)? {
            self.replayed.fetch_add(1, Ordering::Relaxed);
            debug!(workflow = %self.key, step = name, "step replayed from journal");
            return serde_json::from_slice(&bytes)
                .map_err(|e| WorkflowError::Checkpoint(format!("{}/{name}: {e}", self.key)));
        }

        let value = step().await?;
        let bytes = serde_json::to_vec(&value)
            .map_err(|e| WorkflowError::Checkpoint(format!("{}/{name}: {e}", self.key)))?;
        self.journal.save(&self.key, name, &bytes)?;
        self.executed.fetch_add(1, Ordering::Relaxed);
        debug!(workflow = %self.key, step = name, "step completed");
        Ok(value)
    }

    /// Persist a value under `name` without running anything.
    pub fn record<T: Serialize>(&self, name: &str, value: &T) -> WorkflowResult<()> {
        let bytes = serde_json::to_vec(value)
            .map_err(|e| WorkflowError::Checkpoint(format!("{}/{name}: {e}", self.key)))?;
        self.journal.save(&self.key, name, &bytes)
    }

    /// Read a recorded value.
    pub fn recorded<T: DeserializeOwned>(&self, name: &str) -> WorkflowResult<Option<T>> {
        match self.journal.load(&self.key, name)? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| WorkflowError::Checkpoint(format!("{}/{name}: {e}", self.key))),
            None => Ok(None),
        }
    }

    pub fn is_completed(&self, name: &str) -> WorkflowResult<bool> {
        Ok(self.journal.load(&self.key, name)?.is_some())
    }

    /// Steps executed (not replayed) by this run.
    pub fn executed(&self) -> usize {
        self.executed.load(Ordering::Relaxed)
    }

    /// Steps answered from the journal by this run.
    pub fn replayed(&self) -> usize {
        self.replayed.load(Ordering::Relaxed)
    }
}

/// Per-key async mutual exclusion.
#[derive(Clone, Default)]
pub struct KeyedLocks {
    locks: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

/// Held while a keyed operation runs.
pub struct KeyGuard {
    _guard: OwnedMutexGuard<()>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, key: &str) -> KeyGuard {
        let mutex = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            // Drop idle entries: only the map itself holds them.
            locks.retain(|k, m| k == key || Arc::strong_count(m) > 1);
            locks.entry(key.to_string()).or_default().clone()
        };
        KeyGuard {
            _guard: mutex.lock_owned().await,
        }
    }

    /// Number of keys currently tracked.
    pub fn tracked(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
