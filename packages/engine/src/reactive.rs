use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::Poll;

use futures_util::future::poll_fn;
use futures_util::task::AtomicWaker;
use serde::{Deserialize, Serialize};

use crate::query::Dependencies;

/// Pending re-executions are coalesced; if a slow watch falls this far
/// behind, the oldest batch is dropped (the watch re-reads current state,
/// so no staleness can result).
const MAX_PENDING_BATCHES_PER_WATCH: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
    RowInsert,
    RowUpdate,
    RowDelete,
    Ddl,
}

/// One mutation as seen by the reactive layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeDescriptor {
    pub kind: ChangeKind,
    pub table: String,
    pub row_id: Option<String>,
    /// Mutated columns for updates; always contains `system_version`.
    pub columns: BTreeSet<String>,
}

impl ChangeDescriptor {
    pub fn insert(table: impl Into<String>, row_id: impl Into<String>) -> Self {
        Self {
            kind: ChangeKind::RowInsert,
            table: table.into(),
            row_id: Some(row_id.into()),
            columns: BTreeSet::new(),
        }
    }

    pub fn update(
        table: impl Into<String>,
        row_id: impl Into<String>,
        columns: BTreeSet<String>,
    ) -> Self {
        Self {
            kind: ChangeKind::RowUpdate,
            table: table.into(),
            row_id: Some(row_id.into()),
            columns,
        }
    }

    pub fn delete(table: impl Into<String>, row_id: impl Into<String>) -> Self {
        Self {
            kind: ChangeKind::RowDelete,
            table: table.into(),
            row_id: Some(row_id.into()),
            columns: BTreeSet::new(),
        }
    }

    pub fn ddl(table: impl Into<String>) -> Self {
        Self {
            kind: ChangeKind::Ddl,
            table: table.into(),
            row_id: None,
            columns: BTreeSet::new(),
        }
    }
}

/// All descriptors of one committed write, delivered atomically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeBatch {
    pub sequence: u64,
    pub changes: Vec<ChangeDescriptor>,
}

/// A subscription's view of the change bus. `next().await` parks on the
/// listener queue; dropping the stream unsubscribes.
pub struct ChangeStream {
    listener_id: u64,
    queue: Arc<ListenerQueue>,
    bus: Arc<ChangeBus>,
    closed: AtomicBool,
}

impl ChangeStream {
    pub fn try_next(&self) -> Option<ChangeBatch> {
        self.queue.try_pop()
    }

    pub async fn next(&self) -> Option<ChangeBatch> {
        poll_fn(|cx| {
            if let Some(batch) = self.queue.try_pop() {
                return Poll::Ready(Some(batch));
            }
            if self.closed.load(Ordering::SeqCst) {
                return Poll::Ready(None);
            }
            self.queue.waker.register(cx.waker());
            if let Some(batch) = self.queue.try_pop() {
                return Poll::Ready(Some(batch));
            }
            if self.closed.load(Ordering::SeqCst) {
                return Poll::Ready(None);
            }
            Poll::Pending
        })
        .await
    }

    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.bus.unsubscribe(self.listener_id);
        self.queue.waker.wake();
    }
}

impl Drop for ChangeStream {
    fn drop(&mut self) {
        self.close();
    }
}

/// Watch registry. Owned by the database; mutation commits publish batches
/// here after the storage transaction commits, so no listener can observe
/// partial state.
#[derive(Default)]
pub struct ChangeBus {
    inner: Mutex<ChangeBusInner>,
}

#[derive(Default)]
struct ChangeBusInner {
    next_listener_id: u64,
    next_sequence: u64,
    listeners: HashMap<u64, ListenerEntry>,
    by_table: HashMap<String, HashSet<u64>>,
}

#[derive(Clone)]
struct ListenerEntry {
    filter: WatchFilter,
    queue: Arc<ListenerQueue>,
}

#[derive(Default)]
struct ListenerQueue {
    queue: Mutex<VecDeque<ChangeBatch>>,
    waker: AtomicWaker,
}

impl ListenerQueue {
    fn try_pop(&self) -> Option<ChangeBatch> {
        self.queue.lock().unwrap().pop_front()
    }
}

impl ChangeBus {
    pub fn subscribe(self: &Arc<Self>, filter: WatchFilter) -> ChangeStream {
        let queue = Arc::new(ListenerQueue::default());
        let mut inner = self.inner.lock().unwrap();
        let listener_id = inner.next_listener_id;
        inner.next_listener_id = inner.next_listener_id.saturating_add(1);

        for table in &filter.tables {
            inner
                .by_table
                .entry(table.clone())
                .or_default()
                .insert(listener_id);
        }
        inner.listeners.insert(
            listener_id,
            ListenerEntry {
                filter,
                queue: Arc::clone(&queue),
            },
        );

        ChangeStream {
            listener_id,
            queue,
            bus: Arc::clone(self),
            closed: AtomicBool::new(false),
        }
    }

    /// Publishes one committed write. Descriptors from a single commit form
    /// one batch; matching listeners each receive the whole batch once.
    pub fn emit(&self, changes: Vec<ChangeDescriptor>) {
        if changes.is_empty() {
            return;
        }

        let (batch, candidates) = {
            let mut inner = self.inner.lock().unwrap();

            let mut candidate_ids: HashSet<u64> = HashSet::new();
            for change in &changes {
                if let Some(listener_ids) = inner.by_table.get(&change.table) {
                    candidate_ids.extend(listener_ids.iter().copied());
                }
            }
            if candidate_ids.is_empty() {
                return;
            }

            let sequence = inner.next_sequence;
            inner.next_sequence = inner.next_sequence.saturating_add(1);
            let batch = ChangeBatch { sequence, changes };

            let listeners: Vec<ListenerEntry> = candidate_ids
                .into_iter()
                .filter_map(|listener_id| inner.listeners.get(&listener_id).cloned())
                .collect();
            (batch, listeners)
        };

        for listener in candidates {
            if !listener.filter.matches_batch(&batch) {
                continue;
            }
            enqueue_batch(&listener.queue, batch.clone());
        }
    }

    fn unsubscribe(&self, listener_id: u64) {
        let mut inner = self.inner.lock().unwrap();
        let Some(listener) = inner.listeners.remove(&listener_id) else {
            return;
        };
        for table in &listener.filter.tables {
            if let Some(ids) = inner.by_table.get_mut(table) {
                ids.remove(&listener_id);
                if ids.is_empty() {
                    inner.by_table.remove(table);
                }
            }
        }
    }
}

fn enqueue_batch(queue: &ListenerQueue, batch: ChangeBatch) {
    let mut guard = queue.queue.lock().unwrap();
    if guard.len() >= MAX_PENDING_BATCHES_PER_WATCH {
        guard.pop_front();
    }
    guard.push_back(batch);
    drop(guard);
    queue.waker.wake();
}

/// Compiled invalidation filter for one watch, built from its dependency
/// set.
#[derive(Debug, Clone)]
pub struct WatchFilter {
    tables: BTreeSet<String>,
    columns: HashSet<(String, String)>,
    wildcard_tables: BTreeSet<String>,
}

impl WatchFilter {
    pub fn from_dependencies(deps: &Dependencies) -> Self {
        Self {
            tables: deps.tables.clone(),
            columns: deps.columns.iter().cloned().collect(),
            wildcard_tables: deps.wildcard_tables.clone(),
        }
    }

    pub fn matches_batch(&self, batch: &ChangeBatch) -> bool {
        batch.changes.iter().any(|change| self.matches(change))
    }

    /// The invalidation rule: DDL, inserts and deletes invalidate on table
    /// match; updates additionally require a column intersection unless the
    /// watch is wildcard for that table. Mutated `system_*` columns only
    /// count when the watch names them explicitly.
    pub fn matches(&self, change: &ChangeDescriptor) -> bool {
        if !self.tables.contains(&change.table) {
            return false;
        }
        match change.kind {
            ChangeKind::Ddl | ChangeKind::RowInsert | ChangeKind::RowDelete => true,
            ChangeKind::RowUpdate => {
                if self.wildcard_tables.contains(&change.table) {
                    return true;
                }
                // `system_*` columns are in every update's mutated set; they
                // participate only when the watch names them explicitly,
                // which this containment check already encodes.
                change.columns.iter().any(|column| {
                    self.columns
                        .contains(&(change.table.clone(), column.clone()))
                })
            }
        }
    }
}
