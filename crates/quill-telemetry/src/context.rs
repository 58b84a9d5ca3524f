//! Correlation context scoped to one unit of work
//!
//! Async units of work run inside [`scope`], which installs a task-local store that
//! is dropped when the future completes, errors or is cancelled. A tokio task that
//! binds without a scope gets a store keyed by its task id, released by [`clear`].
//! Synchronous code outside any runtime falls back to a thread-local store, which
//! should be wrapped in [`bind_scoped`] so it is cleared on every exit path.
//!
//! Two concurrently running units never observe each other's bindings.

use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, OnceLock, PoisonError};
use tokio::task::futures::TaskLocalFuture;
use tokio::task::Id as TaskId;
use uuid::Uuid;

pub const TRACE_ID: &str = "trace_id";
pub const SPAN_ID: &str = "span_id";
pub const REQUEST_ID: &str = "request_id";

tokio::task_local! {
    static TASK_CONTEXT: RefCell<CorrelationContext>;
}

thread_local! {
    static THREAD_CONTEXT: RefCell<CorrelationContext> = RefCell::new(CorrelationContext::new());
}

/// Stores of tokio tasks that bound keys without entering a [`scope`].
/// An entry is dropped as soon as its context becomes empty.
static UNSCOPED_TASKS: OnceLock<Mutex<HashMap<TaskId, CorrelationContext>>> = OnceLock::new();
static UNSCOPED_WARNED: AtomicBool = AtomicBool::new(false);

fn unscoped_tasks() -> &'static Mutex<HashMap<TaskId, CorrelationContext>> {
    UNSCOPED_TASKS.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Unique identifier for correlating related log entries and operations
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Generate a new random correlation ID
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Create a correlation ID from a string
    pub fn from_string(id: String) -> Self {
        Self(id)
    }

    /// Get the correlation ID as a string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<CorrelationId> for String {
    fn from(id: CorrelationId) -> Self {
        id.0
    }
}

/// Correlation keys bound to one unit of work
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorrelationContext {
    entries: BTreeMap<String, String>,
}

impl CorrelationContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Context for an incoming request: fresh `request_id` and `span_id`, and the
    /// caller's trace id when one was propagated (otherwise a new one)
    pub fn for_request(incoming_trace_id: Option<&str>) -> Self {
        let trace_id = incoming_trace_id
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(|id| CorrelationId::from_string(id.to_string()))
            .unwrap_or_default();

        Self::new()
            .with(TRACE_ID, trace_id)
            .with(SPAN_ID, CorrelationId::new())
            .with(REQUEST_ID, CorrelationId::new())
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl<K, V> FromIterator<(K, V)> for CorrelationContext
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut context = Self::new();
        for (key, value) in iter {
            context.insert(key, value);
        }
        context
    }
}

/// Run `f` against the store of the active unit of work
fn with_active<R>(f: impl FnOnce(&mut CorrelationContext) -> R) -> R {
    if in_task_scope() {
        return TASK_CONTEXT.with(|cell| f(&mut cell.borrow_mut()));
    }

    match tokio::task::try_id() {
        Some(task_id) => {
            let mut stores = unscoped_tasks()
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let context = stores.entry(task_id).or_default();
            let result = f(&mut *context);
            if context.is_empty() {
                stores.remove(&task_id);
            }
            result
        }
        None => THREAD_CONTEXT.with(|cell| f(&mut cell.borrow_mut())),
    }
}

fn warn_unscoped_once() {
    if tokio::task::try_id().is_none() || UNSCOPED_WARNED.swap(true, Ordering::Relaxed) {
        return;
    }
    tracing::warn!(
        telemetry.event = "unscoped_context_bind",
        "Correlation keys bound in a task without a scope; call clear() when the task ends"
    );
}

/// Whether the caller runs inside a [`scope`]
pub fn in_task_scope() -> bool {
    TASK_CONTEXT.try_with(|_| ()).is_ok()
}

/// Install or overwrite keys for the active unit of work
pub fn bind<I, K, V>(keys: I)
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<String>,
{
    if !in_task_scope() {
        warn_unscoped_once();
    }
    with_active(|context| {
        for (key, value) in keys {
            context.insert(key, value);
        }
    });
}

/// Snapshot of the active unit of work's keys
pub fn current() -> CorrelationContext {
    with_active(|context| context.clone())
}

/// Remove every key of the active unit of work
pub fn clear() {
    with_active(CorrelationContext::clear);
}

/// Run a future as its own unit of work with `context` bound.
///
/// The store lives exactly as long as the future, so it is released on success,
/// on error and on cancellation alike.
pub fn scope<F>(
    context: CorrelationContext,
    future: F,
) -> TaskLocalFuture<RefCell<CorrelationContext>, F>
where
    F: Future,
{
    TASK_CONTEXT.scope(RefCell::new(context), future)
}

/// Synchronous counterpart of [`scope`]
pub fn sync_scope<R>(context: CorrelationContext, f: impl FnOnce() -> R) -> R {
    TASK_CONTEXT.sync_scope(RefCell::new(context), f)
}

/// Run a future (typically about to be spawned) with a copy of the current context
pub fn propagate<F>(future: F) -> TaskLocalFuture<RefCell<CorrelationContext>, F>
where
    F: Future,
{
    scope(current(), future)
}

/// Bind keys until the returned guard is dropped, then restore the previous keys
pub fn bind_scoped<I, K, V>(keys: I) -> ContextGuard
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<String>,
{
    let previous = current();
    bind(keys);
    ContextGuard {
        previous: Some(previous),
    }
}

/// RAII guard returned by [`bind_scoped`]
#[must_use = "the context is restored as soon as the guard is dropped"]
pub struct ContextGuard {
    previous: Option<CorrelationContext>,
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            with_active(|context| *context = previous);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::sleep;

    #[test]
    fn test_correlation_id_generation() {
        let id1 = CorrelationId::new();
        let id2 = CorrelationId::new();

        assert_ne!(id1, id2);
        assert!(!id1.as_str().is_empty());
    }

    #[test]
    fn test_for_request_reuses_incoming_trace() {
        let context = CorrelationContext::for_request(Some("trace-abc"));
        assert_eq!(context.get(TRACE_ID), Some("trace-abc"));
        assert!(context.get(SPAN_ID).is_some());
        assert!(context.get(REQUEST_ID).is_some());

        let minted = CorrelationContext::for_request(Some("  "));
        assert_ne!(minted.get(TRACE_ID), Some("  "));
        assert_eq!(minted.len(), 3);
    }

    #[test]
    fn test_bind_is_idempotent_and_current_is_a_copy() {
        std::thread::spawn(|| {
            bind([(REQUEST_ID, "r-1")]);
            bind([(REQUEST_ID, "r-2")]);

            let mut snapshot = current();
            snapshot.insert("extra", "x");

            let live = current();
            assert_eq!(live.get(REQUEST_ID), Some("r-2"));
            assert_eq!(live.len(), 1);

            clear();
            assert!(current().is_empty());
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_guard_restores_previous_bindings() {
        std::thread::spawn(|| {
            bind([(TRACE_ID, "outer")]);
            {
                let _guard = bind_scoped([(TRACE_ID, "inner"), (REQUEST_ID, "r-9")]);
                assert_eq!(current().get(TRACE_ID), Some("inner"));
            }
            let restored = current();
            assert_eq!(restored.get(TRACE_ID), Some("outer"));
            assert!(restored.get(REQUEST_ID).is_none());
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_threads_are_isolated() {
        let a = std::thread::spawn(|| {
            bind([(TRACE_ID, "t1")]);
            std::thread::sleep(Duration::from_millis(20));
            current().get(TRACE_ID).map(str::to_string)
        });
        let b = std::thread::spawn(|| {
            bind([(TRACE_ID, "t2")]);
            std::thread::sleep(Duration::from_millis(20));
            current().get(TRACE_ID).map(str::to_string)
        });

        assert_eq!(a.join().unwrap().as_deref(), Some("t1"));
        assert_eq!(b.join().unwrap().as_deref(), Some("t2"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_task_scopes_are_isolated() {
        let first = tokio::spawn(scope(CorrelationContext::new(), async {
            bind([(TRACE_ID, "t1")]);
            sleep(Duration::from_millis(20)).await;
            current().get(TRACE_ID).map(str::to_string)
        }));
        let second = tokio::spawn(scope(CorrelationContext::new(), async {
            bind([(TRACE_ID, "t2")]);
            sleep(Duration::from_millis(20)).await;
            current().get(TRACE_ID).map(str::to_string)
        }));

        assert_eq!(first.await.unwrap().as_deref(), Some("t1"));
        assert_eq!(second.await.unwrap().as_deref(), Some("t2"));
    }

    #[tokio::test]
    async fn test_unscoped_tasks_on_one_thread_are_isolated() {
        let (a_bound_tx, a_bound_rx) = tokio::sync::oneshot::channel();
        let (b_done_tx, b_done_rx) = tokio::sync::oneshot::channel();

        let unit_a = tokio::spawn(async move {
            bind([(TRACE_ID, "t1")]);
            a_bound_tx.send(()).unwrap();
            b_done_rx.await.unwrap();
            let seen = current().get(TRACE_ID).map(str::to_string);
            clear();
            let released = !unscoped_tasks().lock().unwrap().contains_key(&tokio::task::id());
            assert!(released);
            seen
        });
        let unit_b = tokio::spawn(async move {
            a_bound_rx.await.unwrap();
            let before = current().get(TRACE_ID).map(str::to_string);
            bind([(TRACE_ID, "t2")]);
            let after = current().get(TRACE_ID).map(str::to_string);
            clear();
            assert!(current().is_empty());
            b_done_tx.send(()).unwrap();
            (before, after)
        });

        let (before, after) = unit_b.await.unwrap();
        assert_eq!(before, None);
        assert_eq!(after.as_deref(), Some("t2"));
        assert_eq!(unit_a.await.unwrap().as_deref(), Some("t1"));
    }

    #[tokio::test]
    async fn test_scope_ends_with_the_future() {
        let seen = scope(
            CorrelationContext::new().with(REQUEST_ID, "r-1"),
            async { current() },
        )
        .await;

        assert_eq!(seen.get(REQUEST_ID), Some("r-1"));
        assert!(!in_task_scope());
    }

    #[tokio::test]
    async fn test_propagate_copies_into_spawned_task() {
        let handle = scope(CorrelationContext::new().with(TRACE_ID, "parent"), async {
            let child = tokio::spawn(propagate(async {
                bind([(SPAN_ID, "child-span")]);
                current()
            }));
            let child_view = child.await.unwrap();
            (child_view, current())
        })
        .await;

        let (child_view, parent_view) = handle;
        assert_eq!(child_view.get(TRACE_ID), Some("parent"));
        assert_eq!(child_view.get(SPAN_ID), Some("child-span"));
        assert!(parent_view.get(SPAN_ID).is_none());
    }
}
