use futures::future::{BoxFuture, FutureExt};
use futures::stream::{FuturesUnordered, StreamExt};
use std::future::Future;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::runtime::{self, Handle, Runtime};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::error::{CloserError, Result};
use crate::signal::{self, Signal, Watcher};

const IDLE: u8 = 0;
const CLOSING: u8 = 1;
const CLOSED: u8 = 2;

/// Lifecycle of a [`Closer`]. It only ever moves forward.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum State {
    Idle,
    Closing,
    Closed,
}

pub(crate) type OnRepeat = Arc<dyn Fn(Signal) + Send + Sync>;

enum Runner {
    Spawn(Handle),
    Inline(Runtime),
}

type ActionFn = Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<()>> + Send>;

pub(crate) struct Action {
    name: String,
    run: ActionFn,
}

impl Action {
    fn new<F, Fut, E>(name: String, action: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<(), E>> + Send + 'static,
        E: Into<anyhow::Error>,
    {
        let run: ActionFn = Box::new(move || {
            async move { action().await.map_err(Into::<anyhow::Error>::into) }.boxed()
        });
        Self { name, run }
    }
}

struct Inner {
    actions: Mutex<Vec<Action>>,
    state: AtomicU8,
    done: CancellationToken,
    next_id: AtomicUsize,
}

/// Collects cleanup actions and runs all of them, concurrently and exactly
/// once, when closed.
///
/// Cloning is cheap and every clone refers to the same set of actions.
///
/// ```no_run
/// use closer::{Closer, Signal};
///
/// # async fn run() -> Result<(), closer::CloserError> {
/// let closer = Closer::with_signals(&[Signal::Interrupt, Signal::Terminate])?;
/// closer.add(|| async {
///     // flush buffers, close connections...
///     Ok::<_, std::io::Error>(())
/// });
/// closer.wait().await;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Closer {
    inner: Arc<Inner>,
}

impl Closer {
    /// A closer that is only closed by an explicit [`close_all`](Self::close_all)
    /// or [`trigger`](Self::trigger). Does not need a runtime.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                actions: Mutex::new(Vec::new()),
                state: AtomicU8::new(IDLE),
                done: CancellationToken::new(),
                next_id: AtomicUsize::new(0),
            }),
        }
    }

    /// A closer that also closes itself on the first delivery of any of
    /// `signals`. An empty set behaves like [`Closer::new`].
    ///
    /// Handlers are installed before this returns, so a tokio runtime is
    /// required when `signals` is not empty. A second delivery while closing
    /// exits the process with `128 + signo`, as if no handler were
    /// installed. So does a delivery after the closer was dropped.
    pub fn with_signals(signals: &[Signal]) -> Result<Self> {
        Self::watching(
            signals,
            Arc::new(|signal: Signal| {
                signal::exit_with(signal);
            }),
        )
    }

    pub(crate) fn watching(signals: &[Signal], on_repeat: OnRepeat) -> Result<Self> {
        let closer = Self::new();
        if signals.is_empty() {
            return Ok(closer);
        }

        let runtime = Handle::try_current().map_err(|_| CloserError::NoRuntime)?;
        let mut watcher = Watcher::install(signals)?;
        debug!(signals = ?signals, "watch for shutdown signals");

        let weak = Arc::downgrade(&closer.inner);
        runtime.spawn(async move {
            let signal = watcher.recv().await;
            match Weak::upgrade(&weak) {
                Some(inner) => {
                    info!(signal = %signal, "received shutdown signal");
                    Closer { inner }.begin();
                }
                None => {
                    warn!(signal = %signal, "received signal after closer was dropped");
                    on_repeat(signal);
                    return;
                }
            }

            let signal = watcher.recv().await;
            warn!(signal = %signal, "received shutdown signal again, exit without waiting");
            on_repeat(signal);
        });
        Ok(closer)
    }

    /// Register a cleanup action.
    ///
    /// An action added after closing has started is not run.
    pub fn add<F, Fut, E>(&self, action: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<(), E>> + Send + 'static,
        E: Into<anyhow::Error>,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.add_named(format!("action-{}", id), action);
    }

    /// Register a cleanup action under a name used in logs.
    pub fn add_named<F, Fut, E>(&self, name: impl Into<String>, action: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<(), E>> + Send + 'static,
        E: Into<anyhow::Error>,
    {
        self.push(vec![Action::new(name.into(), action)]);
    }

    /// Register several actions of the same type at once.
    pub fn add_all<I, F, Fut, E>(&self, actions: I)
    where
        I: IntoIterator<Item = F>,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<(), E>> + Send + 'static,
        E: Into<anyhow::Error>,
    {
        let actions = actions
            .into_iter()
            .map(|action| {
                let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
                Action::new(format!("action-{}", id), action)
            })
            .collect();
        self.push(actions);
    }

    /// Register a synchronous cleanup action. It runs on the blocking pool.
    pub fn add_blocking<F, E>(&self, action: F)
    where
        F: FnOnce() -> std::result::Result<(), E> + Send + 'static,
        E: Into<anyhow::Error> + Send + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.add_named(format!("action-{}", id), move || async move {
            let result: anyhow::Result<()> = match tokio::task::spawn_blocking(action).await {
                Ok(result) => result.map_err(Into::into),
                Err(e) => Err(e.into()),
            };
            result
        });
    }

    fn push(&self, mut actions: Vec<Action>) {
        if self.state() != State::Idle {
            for action in &actions {
                warn!(
                    action = action.name,
                    "action registered after close started, it may not run"
                );
            }
        }
        for action in &actions {
            trace!(action = action.name, "register action");
        }
        self.lock_actions().append(&mut actions);
    }

    /// Run every registered action concurrently and return once all of them
    /// finished.
    ///
    /// Only the first call does any work. Later or concurrent calls return
    /// immediately; use [`wait`](Self::wait) to observe completion.
    pub async fn close_all(&self) {
        if self.begin() {
            self.wait().await;
        }
    }

    /// Start closing and return.
    ///
    /// Inside a tokio runtime the close runs in the background. Outside of
    /// one, for example from a `Drop` impl on a plain thread, the first call
    /// runs the close to completion on the calling thread.
    pub fn trigger(&self) {
        self.begin();
    }

    /// Wins the latch and starts the run, or returns `false`. The latch is
    /// only taken once there is a runtime to run on. A spawned run outlives
    /// a dropped caller.
    pub(crate) fn begin(&self) -> bool {
        if self.state() != State::Idle {
            trace!("close already started");
            return false;
        }

        let runner = match Handle::try_current() {
            Ok(handle) => Runner::Spawn(handle),
            Err(_) => match runtime::Builder::new_current_thread().enable_all().build() {
                Ok(runtime) => Runner::Inline(runtime),
                Err(e) => {
                    warn!(error = %e, "failed to build runtime for close");
                    return false;
                }
            },
        };

        if self
            .inner
            .state
            .compare_exchange(IDLE, CLOSING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            trace!("close already started");
            return false;
        }

        let inner = self.inner.clone();
        match runner {
            Runner::Spawn(handle) => {
                handle.spawn(async move { inner.run().await });
            }
            Runner::Inline(runtime) => {
                debug!("no runtime, close on the calling thread");
                runtime.block_on(inner.run());
            }
        }
        true
    }

    /// Resolves once every action has finished. Never resolves if the closer
    /// is never closed.
    pub async fn wait(&self) {
        self.inner.done.cancelled().await;
    }

    /// Like [`wait`](Self::wait) but gives up after `timeout`. Actions that
    /// are still running keep running.
    pub async fn wait_timeout(&self, timeout: Duration) -> Result<()> {
        tokio::time::timeout(timeout, self.wait())
            .await
            .map_err(|_| CloserError::Timeout(timeout))
    }

    pub fn state(&self) -> State {
        match self.inner.state.load(Ordering::Acquire) {
            IDLE => State::Idle,
            CLOSING => State::Closing,
            _ => State::Closed,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.done.is_cancelled()
    }

    /// Number of actions waiting to run.
    pub fn pending(&self) -> usize {
        self.lock_actions().len()
    }

    /// Move every pending action of `other` into this closer.
    pub(crate) fn absorb(&self, other: &Closer) {
        let actions = std::mem::take(&mut *other.lock_actions());
        if !actions.is_empty() {
            debug!(count = actions.len(), "move pending actions");
            self.push(actions);
        }
    }

    fn lock_actions(&self) -> MutexGuard<'_, Vec<Action>> {
        self.inner.lock_actions()
    }
}

impl Inner {
    fn lock_actions(&self) -> MutexGuard<'_, Vec<Action>> {
        // nothing panics while the lock is held
        self.actions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn run(&self) {
        let actions = std::mem::take(&mut *self.lock_actions());
        info!(count = actions.len(), "closing");

        let mut tasks: FuturesUnordered<_> = actions
            .into_iter()
            .map(|action| {
                let handle = tokio::spawn((action.run)());
                let name = action.name;
                async move { (name, handle.await) }
            })
            .collect();

        let mut failed = 0usize;
        while let Some((name, result)) = tasks.next().await {
            match result {
                Ok(Ok(())) => trace!(action = name, "action completed"),
                Ok(Err(e)) => {
                    failed += 1;
                    warn!(action = name, error = %e, "error returned from closer action");
                }
                Err(e) => {
                    failed += 1;
                    warn!(action = name, error = %e, "closer action panicked");
                }
            }
        }

        self.state.store(CLOSED, Ordering::Release);
        info!(failed, "close complete");
        self.done.cancel();
    }
}

impl Default for Closer {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Closer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Closer")
            .field("state", &self.state())
            .field("pending", &self.pending())
            .finish()
    }
}
