use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;

use crate::types::{CoreError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FetchStatus {
    Pending,
    Completed,
    Cancelled,
    Failed,
}

impl FetchStatus {
    pub fn is_terminal(self) -> bool {
        self != FetchStatus::Pending
    }
}

impl fmt::Display for FetchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FetchStatus::Pending => "PENDING",
            FetchStatus::Completed => "COMPLETED",
            FetchStatus::Cancelled => "CANCELLED",
            FetchStatus::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// Terminal status of every item, keyed by id.
pub type BatchOutcome = HashMap<String, FetchStatus>;

/// One unit of a fetch batch. The status leaves `Pending` at most once.
#[derive(Debug)]
pub struct FetchItem {
    id: String,
    partial_path: PathBuf,
    final_path: PathBuf,
    status: Mutex<FetchStatus>,
    reason: Mutex<Option<String>>,
}

impl FetchItem {
    pub(crate) fn new(id: String, final_path: PathBuf, partial_path: PathBuf) -> Self {
        Self {
            id,
            partial_path,
            final_path,
            status: Mutex::new(FetchStatus::Pending),
            reason: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn partial_path(&self) -> &Path {
        &self.partial_path
    }

    pub fn final_path(&self) -> &Path {
        &self.final_path
    }

    pub fn status(&self) -> FetchStatus {
        *self.status.lock()
    }

    /// Why the item failed, if it did.
    pub fn reason(&self) -> Option<String> {
        self.reason.lock().clone()
    }
}

pub(crate) struct BatchState {
    items: Vec<FetchItem>,
    index: HashMap<String, usize>,
    pending: AtomicUsize,
    cancel_tx: watch::Sender<bool>,
    outcome_tx: watch::Sender<Option<Arc<BatchOutcome>>>,
}

impl BatchState {
    pub(crate) fn new(items: Vec<FetchItem>) -> Arc<Self> {
        let index = items
            .iter()
            .enumerate()
            .map(|(i, item)| (item.id.clone(), i))
            .collect();
        let pending = AtomicUsize::new(items.len());
        let (cancel_tx, _) = watch::channel(false);
        let (outcome_tx, _) = watch::channel(None);
        Arc::new(Self {
            items,
            index,
            pending,
            cancel_tx,
            outcome_tx,
        })
    }

    pub(crate) fn cancel_receiver(&self) -> watch::Receiver<bool> {
        self.cancel_tx.subscribe()
    }

    /// Moves item `index` out of `Pending`. Returns `false` if it already was
    /// terminal. The last transition publishes the batch outcome.
    pub(crate) fn transition(&self, index: usize, status: FetchStatus, reason: Option<String>) -> bool {
        let item = &self.items[index];
        {
            let mut current = item.status.lock();
            if current.is_terminal() || !status.is_terminal() {
                return false;
            }
            if reason.is_some() {
                *item.reason.lock() = reason;
            }
            *current = status;
        }

        if self.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.publish_outcome();
        }
        true
    }

    fn publish_outcome(&self) {
        let outcome: BatchOutcome = self
            .items
            .iter()
            .map(|item| (item.id.clone(), item.status()))
            .collect();
        let count = |s: FetchStatus| outcome.values().filter(|v| **v == s).count();
        tracing::info!(
            total = outcome.len(),
            completed = count(FetchStatus::Completed),
            failed = count(FetchStatus::Failed),
            cancelled = count(FetchStatus::Cancelled),
            "Fetch batch finished"
        );
        self.outcome_tx.send_replace(Some(Arc::new(outcome)));
    }
}

/// Marks its item `Failed` when dropped while the item is still pending, so
/// that a fetch task that dies early cannot leave the batch unresolved.
pub(crate) struct ItemGuard {
    state: Arc<BatchState>,
    index: usize,
}

impl ItemGuard {
    pub(crate) fn new(state: Arc<BatchState>, index: usize) -> Self {
        Self { state, index }
    }

    pub(crate) fn item(&self) -> &FetchItem {
        &self.state.items[self.index]
    }

    pub(crate) fn cancel_receiver(&self) -> watch::Receiver<bool> {
        self.state.cancel_receiver()
    }

    pub(crate) fn finish(&self, status: FetchStatus, reason: Option<String>) {
        self.state.transition(self.index, status, reason);
    }
}

impl Drop for ItemGuard {
    fn drop(&mut self) {
        let abandoned = self.state.transition(
            self.index,
            FetchStatus::Failed,
            Some("fetch task terminated before completion".to_string()),
        );
        if abandoned {
            tracing::warn!(id = %self.item().id, "Fetch task abandoned its item");
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ItemReport {
    pub id: String,
    pub status: FetchStatus,
    pub path: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchSummary {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub pending: usize,
    pub items: Vec<ItemReport>,
}

impl BatchSummary {
    pub fn all_completed(&self) -> bool {
        self.completed == self.total
    }
}

/// Caller's view of a running fetch batch.
#[derive(Clone)]
pub struct BatchHandle {
    state: Arc<BatchState>,
}

impl BatchHandle {
    pub(crate) fn new(state: Arc<BatchState>) -> Self {
        Self { state }
    }

    /// Item ids in submission order, trimmed and de-duplicated.
    pub fn ids(&self) -> Vec<&str> {
        self.state.items.iter().map(|i| i.id.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.state.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.items.is_empty()
    }

    pub fn item(&self, id: &str) -> Option<&FetchItem> {
        self.state.index.get(id).map(|&i| &self.state.items[i])
    }

    pub fn status(&self, id: &str) -> Option<FetchStatus> {
        self.item(id).map(FetchItem::status)
    }

    pub fn snapshot(&self) -> Vec<(String, FetchStatus)> {
        self.state
            .items
            .iter()
            .map(|i| (i.id.clone(), i.status()))
            .collect()
    }

    /// `(id, reason)` of every failed item.
    pub fn failures(&self) -> Vec<(String, String)> {
        self.state
            .items
            .iter()
            .filter(|i| i.status() == FetchStatus::Failed)
            .map(|i| (i.id.clone(), i.reason().unwrap_or_default()))
            .collect()
    }

    pub fn is_done(&self) -> bool {
        self.state.pending.load(Ordering::Acquire) == 0
    }

    /// Asks every pending item to stop. Items that already went past the
    /// point of no return still complete. Calling it again has no effect.
    pub fn cancel(&self) {
        let was_cancelled = self.state.cancel_tx.send_replace(true);
        if !was_cancelled {
            tracing::info!(
                pending = self.state.pending.load(Ordering::Acquire),
                "Fetch batch cancelled"
            );
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.state.cancel_tx.borrow()
    }

    /// Resolves with the terminal status of every item once none is pending.
    pub async fn outcome(&self) -> Result<Arc<BatchOutcome>> {
        let mut rx = self.state.outcome_tx.subscribe();
        let published = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| CoreError::Internal("fetch batch outcome channel closed".to_string()))?;
        published
            .clone()
            .ok_or_else(|| CoreError::Internal("fetch batch outcome missing".to_string()))
    }

    pub async fn outcome_timeout(&self, timeout: Duration) -> Result<Arc<BatchOutcome>> {
        tokio::time::timeout(timeout, self.outcome())
            .await
            .unwrap_or(Err(CoreError::Timeout(timeout)))
    }

    pub fn summary(&self) -> BatchSummary {
        let items: Vec<ItemReport> = self
            .state
            .items
            .iter()
            .map(|i| {
                let status = i.status();
                let path = if status == FetchStatus::Completed {
                    i.final_path.clone()
                } else {
                    i.partial_path.clone()
                };
                ItemReport {
                    id: i.id.clone(),
                    status,
                    path,
                    reason: i.reason(),
                }
            })
            .collect();
        let count = |s: FetchStatus| items.iter().filter(|i| i.status == s).count();

        BatchSummary {
            total: items.len(),
            completed: count(FetchStatus::Completed),
            failed: count(FetchStatus::Failed),
            cancelled: count(FetchStatus::Cancelled),
            pending: count(FetchStatus::Pending),
            items,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(ids: &[&str]) -> Arc<BatchState> {
        let items = ids
            .iter()
            .map(|id| {
                FetchItem::new(
                    id.to_string(),
                    PathBuf::from(id),
                    PathBuf::from(format!("{}.partial", id)),
                )
            })
            .collect();
        BatchState::new(items)
    }

    #[test]
    fn test_transition_is_one_way() {
        let state = state(&["a", "b"]);
        assert!(state.transition(0, FetchStatus::Failed, Some("404".to_string())));
        assert!(!state.transition(0, FetchStatus::Completed, None));
        assert_eq!(state.items[0].status(), FetchStatus::Failed);
        assert_eq!(state.items[0].reason().as_deref(), Some("404"));
        assert!(!state.transition(1, FetchStatus::Pending, None));
    }

    #[tokio::test]
    async fn test_outcome_resolves_after_last_transition() {
        let state = state(&["a", "b"]);
        let handle = BatchHandle::new(state.clone());
        assert!(!handle.is_done());

        state.transition(0, FetchStatus::Completed, None);
        assert!(handle
            .outcome_timeout(Duration::from_millis(20))
            .await
            .is_err());

        state.transition(1, FetchStatus::Cancelled, None);
        let outcome = handle.outcome().await.unwrap();
        assert!(handle.is_done());
        assert_eq!(outcome.len(), 2);
        assert_eq!(outcome["a"], FetchStatus::Completed);
        assert_eq!(outcome["b"], FetchStatus::Cancelled);
    }

    #[test]
    fn test_dropped_guard_fails_pending_item() {
        let state = state(&["a", "b"]);
        let handle = BatchHandle::new(state.clone());

        let finished = ItemGuard::new(state.clone(), 0);
        finished.finish(FetchStatus::Completed, None);
        drop(finished);
        drop(ItemGuard::new(state.clone(), 1));

        assert_eq!(handle.status("a"), Some(FetchStatus::Completed));
        assert_eq!(handle.status("b"), Some(FetchStatus::Failed));
        assert_eq!(handle.failures().len(), 1);
        assert!(handle.is_done());
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let state = state(&["a"]);
        let handle = BatchHandle::new(state.clone());
        let rx = state.cancel_receiver();
        assert!(!handle.is_cancelled());

        handle.cancel();
        handle.cancel();
        assert!(handle.is_cancelled());
        assert!(*rx.borrow());
    }

    #[test]
    fn test_summary_counts() {
        let state = state(&["a", "b", "c"]);
        let handle = BatchHandle::new(state.clone());
        state.transition(0, FetchStatus::Completed, None);
        state.transition(1, FetchStatus::Failed, Some("boom".to_string()));

        let summary = handle.summary();
        assert_eq!(summary.total, 3);
        assert_eq!(summary.completed, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.pending, 1);
        assert!(!summary.all_completed());
        assert_eq!(summary.items[0].path, PathBuf::from("a"));
        assert_eq!(summary.items[1].path, PathBuf::from("b.partial"));

        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["items"][0]["status"], "COMPLETED");
        assert!(json["items"][0].get("reason").is_none());
    }

    #[test]
    fn test_status_display() {
        assert_eq!(FetchStatus::Cancelled.to_string(), "CANCELLED");
        assert!(!FetchStatus::Pending.is_terminal());
    }
}
