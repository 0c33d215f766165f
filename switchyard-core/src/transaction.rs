//! Transactions (units of work).
//!
//! The first mutating call of a logical operation opens a transaction; every
//! nested mutating call reuses it. Follow-up work a call triggers without
//! awaiting it (emitted events, deferred tasks) is queued on the transaction,
//! and the root call only completes once that queue has drained to empty.
//!
//! # States
//!
//! `Open -> Draining -> Committed | Failed`
//!
//! Draining is a fixpoint: awaiting one batch of queued work may queue more,
//! so the queue is re-checked after every batch.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures_util::future::{try_join_all, BoxFuture};
use futures_util::FutureExt;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::context;
use crate::error::{CoreError, Result};

tokio::task_local! {
    static TRANSACTION: Arc<Transaction>;
}

type Callback = Box<dyn FnOnce() + Send>;

/// Lifecycle of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// The root call is still running.
    Open,
    /// The root call returned; queued work is being awaited.
    Draining,
    /// Everything settled successfully and `on_success` callbacks ran.
    Committed,
    /// The root call or queued work failed and `on_error` callbacks ran.
    Failed,
}

impl TransactionState {
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Committed | Self::Failed)
    }
}

/// A unit of work shared by a root mutating call and everything it triggers.
pub struct Transaction {
    state: Mutex<TransactionState>,
    pending: Mutex<Vec<JoinHandle<Result<()>>>>,
    on_success: Mutex<Vec<Callback>>,
    on_error: Mutex<Vec<Callback>>,
    attributes: Map<String, Value>,
}

impl Transaction {
    /// Open a transaction carrying `attributes`.
    pub fn new(attributes: Map<String, Value>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(TransactionState::Open),
            pending: Mutex::new(Vec::new()),
            on_success: Mutex::new(Vec::new()),
            on_error: Mutex::new(Vec::new()),
            attributes,
        })
    }

    pub fn state(&self) -> TransactionState {
        *self.state.lock()
    }

    /// Attributes given when the transaction was opened.
    pub fn attributes(&self) -> &Map<String, Value> {
        &self.attributes
    }

    pub fn attribute(&self, name: &str) -> Option<&Value> {
        self.attributes.get(name)
    }

    /// Run `f` once the transaction commits. Runs immediately if it already
    /// did; never runs if it failed.
    pub fn on_success(&self, f: impl FnOnce() + Send + 'static) {
        let state = self.state.lock();
        match *state {
            TransactionState::Committed => {
                drop(state);
                f();
            }
            TransactionState::Failed => {}
            _ => self.on_success.lock().push(Box::new(f)),
        }
    }

    /// Run `f` if the transaction fails. Runs immediately if it already did;
    /// never runs if it committed.
    pub fn on_error(&self, f: impl FnOnce() + Send + 'static) {
        let state = self.state.lock();
        match *state {
            TransactionState::Failed => {
                drop(state);
                f();
            }
            TransactionState::Committed => {}
            _ => self.on_error.lock().push(Box::new(f)),
        }
    }

    /// Spawn follow-up work and make the root call wait for it.
    ///
    /// The task inherits the caller's context. Work deferred onto a closed
    /// transaction still runs, but nothing waits for it. Outside a tokio
    /// runtime there is nowhere to run the work, so it is dropped with a
    /// warning.
    pub fn defer<F>(&self, fut: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let Ok(runtime) = Handle::try_current() else {
            warn!("no runtime to defer on; follow-up work dropped");
            return;
        };
        let closed = self.state().is_closed();
        let handle = runtime.spawn(context::propagate(async move {
            let result = fut.await;
            if let Err(err) = &result {
                if closed {
                    warn!(error = %err, "follow-up work failed after its transaction closed");
                }
            }
            result
        }));
        if !closed {
            self.pending.lock().push(handle);
        }
    }

    /// Number of queued tasks not yet awaited.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    async fn drain(&self) -> Result<()> {
        let mut batches = 0usize;
        loop {
            let batch = std::mem::take(&mut *self.pending.lock());
            if batch.is_empty() {
                break;
            }
            batches += 1;
            try_join_all(batch.into_iter().map(|handle| {
                handle.map(|joined| joined.map_err(CoreError::from).and_then(|result| result))
            }))
            .await?;
        }
        debug!(batches, "transaction drained");
        Ok(())
    }

    fn set_state(&self, state: TransactionState) {
        *self.state.lock() = state;
    }

    fn finish(&self, succeeded: bool) {
        let callbacks = {
            let mut state = self.state.lock();
            if succeeded {
                *state = TransactionState::Committed;
                self.on_error.lock().clear();
                std::mem::take(&mut *self.on_success.lock())
            } else {
                *state = TransactionState::Failed;
                self.on_success.lock().clear();
                std::mem::take(&mut *self.on_error.lock())
            }
        };
        for callback in callbacks {
            callback();
        }
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("state", &self.state())
            .field("pending", &self.pending_count())
            .field("attributes", &self.attributes)
            .finish()
    }
}

/// The open transaction of the current logical call, if any.
pub fn current() -> Option<Arc<Transaction>> {
    TRANSACTION
        .try_with(Arc::clone)
        .ok()
        .or_else(|| context::current().and_then(|ctx| ctx.transaction().cloned()))
}

/// Run `fut` as a new root unit of work carrying `attributes`.
///
/// Resolves once `fut` and everything it deferred have settled. On failure
/// the `on_error` callbacks run and the error is returned unchanged.
pub async fn transaction<F, T>(attributes: Map<String, Value>, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    run_root(Transaction::new(attributes), fut).await
}

/// Run `body` inside `existing`, or as the root of a new transaction.
pub(crate) async fn run<F, T>(existing: Option<Arc<Transaction>>, body: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match existing {
        Some(tx) if !tx.state().is_closed() => TRANSACTION.scope(tx, body).await,
        _ => run_root(Transaction::new(Map::new()), body).await,
    }
}

pub(crate) async fn run_root<F, T>(tx: Arc<Transaction>, body: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    let result = TRANSACTION.scope(tx.clone(), body).await;
    let result = match result {
        Ok(value) => {
            tx.set_state(TransactionState::Draining);
            tx.drain().await.map(|()| value)
        }
        Err(err) => Err(err),
    };
    tx.finish(result.is_ok());
    result
}

/// Re-install the current transaction around `fut`, for spawned tasks.
pub(crate) fn carry<F>(fut: F) -> BoxFuture<'static, F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send,
{
    match TRANSACTION.try_with(Arc::clone) {
        Ok(tx) => TRANSACTION.scope(tx, fut).boxed(),
        Err(_) => fut.boxed(),
    }
}
