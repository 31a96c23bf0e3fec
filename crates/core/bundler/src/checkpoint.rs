use std::collections::BTreeMap;

use tokio::sync::Mutex;

use crate::{
    error::StateError,
    state::{Checkpoint, PersistedState, StateStore},
};

/// Orders upload completions before they reach the state file.
///
/// Uploads finish in any order, but the persisted state may only move past a boundary once
/// every earlier boundary is uploaded too. Completions are held until the sequence numbers
/// below them are complete, and only the last checkpoint of a contiguous run is saved.
#[derive(Debug)]
pub(crate) struct Checkpointer {
    inner: Mutex<Inner>,
}

#[derive(Debug)]
struct Inner {
    store: StateStore,
    next: u64,
    completed: BTreeMap<u64, Checkpoint>,
}

impl Checkpointer {
    pub(crate) fn new(store: StateStore) -> Self {
        Self {
            inner: Mutex::new(Inner {
                store,
                next: 0,
                completed: BTreeMap::new(),
            }),
        }
    }

    /// Records that upload `seq` succeeded and persists the furthest contiguous checkpoint.
    ///
    /// Returns the saved state, or `None` when an earlier upload is still pending.
    pub(crate) async fn complete(
        &self,
        seq: u64,
        checkpoint: Checkpoint,
    ) -> Result<Option<PersistedState>, StateError> {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        inner.completed.insert(seq, checkpoint);

        let mut latest = None;
        while let Some(checkpoint) = inner.completed.remove(&inner.next) {
            latest = Some(checkpoint);
            inner.next += 1;
        }

        let Some(checkpoint) = latest else {
            tracing::debug!(
                seq,
                waiting_for = inner.next,
                pending = inner.completed.len(),
                "checkpoint held back"
            );
            return Ok(None);
        };

        inner.store.save(&checkpoint).await.map(Some)
    }

    /// Number of completed uploads waiting on an earlier one.
    pub(crate) async fn pending(&self) -> usize {
        self.inner.lock().await.completed.len()
    }
}
