//! Transactional unit of work.
//!
//! A [`TransactionContext`] scopes everything the transport does on behalf of
//! one logical operation: the backend connection, the pending outbound
//! messages and the leases of received messages. Work is attached through
//! keyed unit items and lifecycle hooks; the owner of the unit then drives it
//! through exactly one of two endings:
//!
//! ```text
//! complete(): committed hooks ─┬─ ok ──► completed hooks
//!                              └─ err ─► aborted hooks
//! abort():    aborted hooks
//! dispose():  disposed hooks, in reverse registration order
//! ```
//!
//! Each phase runs at most once and disposal always comes last.

use crate::error::TransportError;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

#[cfg(test)]
#[path = "unit_tests.rs"]
mod tests;

/// Future returned by a lifecycle hook
pub type HookFuture = BoxFuture<'static, Result<(), TransportError>>;

type Hook = Box<dyn FnOnce() -> HookFuture + Send>;

type Item = Arc<dyn Any + Send + Sync>;

/// Lifecycle state of a unit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitState {
    /// Accepting work
    Active,
    /// Committed hooks succeeded, completed hooks ran
    Completed,
    /// Aborted hooks ran, either explicitly or after a failed commit
    Aborted,
    /// Disposed hooks ran; the unit is finished
    Disposed,
}

#[derive(Clone, Copy, Debug)]
enum Phase {
    Committed,
    Completed,
    Aborted,
    Disposed,
}

impl Phase {
    fn as_str(self) -> &'static str {
        match self {
            Self::Committed => "committed",
            Self::Completed => "completed",
            Self::Aborted => "aborted",
            Self::Disposed => "disposed",
        }
    }
}

#[derive(Default)]
struct Hooks {
    committed: Vec<Hook>,
    completed: Vec<Hook>,
    aborted: Vec<Hook>,
    disposed: Vec<Hook>,
}

impl Hooks {
    fn slot(&mut self, phase: Phase) -> &mut Vec<Hook> {
        match phase {
            Phase::Committed => &mut self.committed,
            Phase::Completed => &mut self.completed,
            Phase::Aborted => &mut self.aborted,
            Phase::Disposed => &mut self.disposed,
        }
    }
}

/// Reference transactional unit
pub struct TransactionContext {
    id: String,
    items: Mutex<HashMap<String, Item>>,
    hooks: Mutex<Hooks>,
    state: Mutex<UnitState>,
}

impl TransactionContext {
    /// Create a new active unit
    pub fn new() -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            items: Mutex::new(HashMap::new()),
            hooks: Mutex::new(Hooks::default()),
            state: Mutex::new(UnitState::Active),
        }
    }

    /// Unique id of this unit, used in log fields
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Current lifecycle state
    pub fn state(&self) -> UnitState {
        *lock(&self.state)
    }

    /// Fail unless the unit still accepts work
    ///
    /// # Errors
    /// Returns [`TransportError::Unit`] once the unit has completed, aborted
    /// or been disposed.
    pub fn ensure_active(&self) -> Result<(), TransportError> {
        let state = *lock(&self.state);
        if state != UnitState::Active {
            return Err(TransportError::Unit {
                message: format!("unit {} is already {:?}", self.id, state),
            });
        }
        Ok(())
    }

    /// Get the unit item stored under `key`, creating it with `create` on first use
    ///
    /// `create` runs at most once per key and may register hooks on the unit,
    /// but must not access unit items itself.
    ///
    /// # Errors
    /// Returns [`TransportError::Unit`] if the stored item has a different type.
    pub fn get_or_add<T, F>(&self, key: &str, create: F) -> Result<Arc<T>, TransportError>
    where
        T: Any + Send + Sync,
        F: FnOnce(&TransactionContext) -> T,
    {
        let mut items = lock(&self.items);
        let item = match items.get(key) {
            Some(existing) => Arc::clone(existing),
            None => {
                let created: Item = Arc::new(create(self));
                items.insert(key.to_string(), Arc::clone(&created));
                created
            }
        };
        drop(items);

        item.downcast::<T>().map_err(|_| TransportError::Unit {
            message: format!("unit item '{}' has an unexpected type", key),
        })
    }

    /// Get the unit item stored under `key`, if any
    pub fn get<T>(&self, key: &str) -> Result<Option<Arc<T>>, TransportError>
    where
        T: Any + Send + Sync,
    {
        let Some(item) = lock(&self.items).get(key).cloned() else {
            return Ok(None);
        };
        item.downcast::<T>().map(Some).map_err(|_| TransportError::Unit {
            message: format!("unit item '{}' has an unexpected type", key),
        })
    }

    /// Run `hook` when the unit commits
    pub fn on_committed<F, Fut>(&self, hook: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), TransportError>> + Send + 'static,
    {
        self.register(Phase::Committed, hook);
    }

    /// Run `hook` after a successful commit
    pub fn on_completed<F, Fut>(&self, hook: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), TransportError>> + Send + 'static,
    {
        self.register(Phase::Completed, hook);
    }

    /// Run `hook` when the unit aborts or its commit fails
    pub fn on_aborted<F, Fut>(&self, hook: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), TransportError>> + Send + 'static,
    {
        self.register(Phase::Aborted, hook);
    }

    /// Run `hook` when the unit is disposed
    pub fn on_disposed<F, Fut>(&self, hook: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), TransportError>> + Send + 'static,
    {
        self.register(Phase::Disposed, hook);
    }

    /// Commit the unit
    ///
    /// Runs committed hooks in order, stopping at the first failure. On success
    /// the completed hooks run; on failure the aborted hooks run instead and
    /// the commit error is returned.
    pub async fn complete(&self) -> Result<(), TransportError> {
        self.finish(UnitState::Completed)?;

        if let Err(commit_error) = self.run(Phase::Committed, true).await {
            warn!(unit_id = %self.id, error = %commit_error, "Commit failed; aborting unit");
            self.set_state(UnitState::Aborted);
            self.hooks_mut().completed.clear();
            if let Err(e) = self.run(Phase::Aborted, false).await {
                warn!(unit_id = %self.id, error = %e, "Aborted hook failed after commit failure");
            }
            return Err(commit_error);
        }

        self.hooks_mut().aborted.clear();
        self.run(Phase::Completed, false).await
    }

    /// Abort the unit, discarding anything not yet committed
    pub async fn abort(&self) -> Result<(), TransportError> {
        self.finish(UnitState::Aborted)?;
        {
            let mut hooks = self.hooks_mut();
            hooks.committed.clear();
            hooks.completed.clear();
        }
        self.run(Phase::Aborted, false).await
    }

    /// Dispose the unit, releasing everything attached to it
    ///
    /// Disposing twice is a no-op.
    pub async fn dispose(&self) -> Result<(), TransportError> {
        {
            let mut state = lock(&self.state);
            if *state == UnitState::Disposed {
                return Ok(());
            }
            *state = UnitState::Disposed;
        }
        {
            let mut hooks = self.hooks_mut();
            hooks.committed.clear();
            hooks.completed.clear();
            hooks.aborted.clear();
            hooks.disposed.reverse();
        }
        let result = self.run(Phase::Disposed, false).await;
        lock(&self.items).clear();
        result
    }

    fn register<F, Fut>(&self, phase: Phase, hook: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), TransportError>> + Send + 'static,
    {
        let hook: Hook = Box::new(move || hook().boxed());
        self.hooks_mut().slot(phase).push(hook);
    }

    fn finish(&self, to: UnitState) -> Result<(), TransportError> {
        let mut state = lock(&self.state);
        if *state != UnitState::Active {
            return Err(TransportError::Unit {
                message: format!("unit {} is already {:?}", self.id, *state),
            });
        }
        *state = to;
        Ok(())
    }

    fn set_state(&self, to: UnitState) {
        *lock(&self.state) = to;
    }

    fn hooks_mut(&self) -> MutexGuard<'_, Hooks> {
        lock(&self.hooks)
    }

    /// Run and drain the hooks of one phase
    ///
    /// With `stop_on_error` the first failure ends the phase; otherwise every
    /// hook runs and the first failure is reported.
    async fn run(&self, phase: Phase, stop_on_error: bool) -> Result<(), TransportError> {
        let hooks = std::mem::take(self.hooks_mut().slot(phase));
        debug!(unit_id = %self.id, phase = phase.as_str(), count = hooks.len(), "Running unit hooks");

        let mut first_error = None;
        for hook in hooks {
            if let Err(e) = hook().await {
                if stop_on_error {
                    return Err(e);
                }
                warn!(unit_id = %self.id, phase = phase.as_str(), error = %e, "Unit hook failed");
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Default for TransactionContext {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TransactionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionContext")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
