//! Process-wide default closer.
//!
//! The default is created lazily without signal watching. Startup code may
//! replace it once with [`install`], for example with a closer built by
//! [`Closer::with_signals`]. Actions already registered on the default move
//! over to the installed closer. Code that can take a [`Closer`] as a
//! parameter should prefer [`global`] over the free functions.

use lazy_static::lazy_static;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{PoisonError, RwLock};
use tracing::debug;

use crate::closer::{Closer, State};
use crate::error::{CloserError, Result};

lazy_static! {
    static ref DEFAULT: RwLock<Closer> = RwLock::new(Closer::new());
}

static INSTALLED: AtomicBool = AtomicBool::new(false);

/// Handle to the current default closer.
pub fn global() -> Closer {
    with_default(Closer::clone)
}

/// Run `f` on the default closer while holding the read guard, so it cannot
/// interleave with [`install`].
fn with_default<T>(f: impl FnOnce(&Closer) -> T) -> T {
    let current = DEFAULT.read().unwrap_or_else(PoisonError::into_inner);
    f(&current)
}

/// Replace the default closer. Allowed once, and only while the default has
/// not started closing.
pub fn install(closer: Closer) -> Result<()> {
    let mut current = DEFAULT.write().unwrap_or_else(PoisonError::into_inner);
    if INSTALLED.load(Ordering::Acquire) || current.state() != State::Idle {
        return Err(CloserError::GlobalInstalled);
    }

    closer.absorb(&current);
    *current = closer;
    INSTALLED.store(true, Ordering::Release);
    debug!("installed default closer");
    Ok(())
}

/// Start over with a fresh default closer.
#[cfg(any(test, feature = "test-util"))]
pub fn reset() {
    let mut current = DEFAULT.write().unwrap_or_else(PoisonError::into_inner);
    *current = Closer::new();
    INSTALLED.store(false, Ordering::Release);
}

/// Register a cleanup action on the default closer.
pub fn add<F, Fut, E>(action: F)
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = std::result::Result<(), E>> + Send + 'static,
    E: Into<anyhow::Error>,
{
    with_default(|closer| closer.add(action))
}

pub fn add_named<F, Fut, E>(name: impl Into<String>, action: F)
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = std::result::Result<(), E>> + Send + 'static,
    E: Into<anyhow::Error>,
{
    with_default(|closer| closer.add_named(name, action))
}

pub fn add_blocking<F, E>(action: F)
where
    F: FnOnce() -> std::result::Result<(), E> + Send + 'static,
    E: Into<anyhow::Error> + Send + 'static,
{
    with_default(|closer| closer.add_blocking(action))
}

/// Close the default closer. See [`Closer::close_all`].
pub async fn close_all() {
    let (started, closer) = with_default(|closer| (closer.begin(), closer.clone()));
    if started {
        closer.wait().await;
    }
}

pub fn trigger() {
    with_default(|closer| {
        closer.begin();
    })
}

/// Wait for the default closer to finish closing.
pub async fn wait() {
    global().wait().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use lazy_static::lazy_static;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::time::Duration;

    lazy_static! {
        // tests share the process-wide default
        static ref SERIAL: tokio::sync::Mutex<()> = tokio::sync::Mutex::new(());
    }

    #[tokio::test]
    async fn test_global_functions() {
        let _guard = SERIAL.lock().await;
        reset();

        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        add(move || async move {
            c.fetch_add(1, Ordering::SeqCst);
            Ok::<_, anyhow::Error>(())
        });
        let c = counter.clone();
        add_blocking(move || {
            c.fetch_add(1, Ordering::SeqCst);
            Ok::<_, std::io::Error>(())
        });

        close_all().await;
        tokio::time::timeout(Duration::from_secs(1), wait())
            .await
            .expect("default closer completes");

        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert!(global().is_closed());
    }

    #[tokio::test]
    async fn test_install_moves_pending_actions() {
        let _guard = SERIAL.lock().await;
        reset();

        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        add_named("early", move || async move {
            c.fetch_add(1, Ordering::SeqCst);
            Ok::<_, anyhow::Error>(())
        });

        let installed = Closer::new();
        install(installed.clone()).unwrap();
        assert_eq!(installed.pending(), 1);

        trigger();
        installed.wait().await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_add_racing_install_is_kept() {
        let _guard = SERIAL.lock().await;
        reset();

        let counter = Arc::new(AtomicUsize::new(0));
        let adders: Vec<_> = (0..4)
            .map(|_| {
                let counter = counter.clone();
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        let c = counter.clone();
                        add(move || async move {
                            c.fetch_add(1, Ordering::SeqCst);
                            Ok::<_, anyhow::Error>(())
                        });
                    }
                })
            })
            .collect();

        install(Closer::new()).unwrap();
        for adder in adders {
            adder.join().unwrap();
        }

        close_all().await;
        assert_eq!(counter.load(Ordering::SeqCst), 200);
    }

    #[test]
    fn test_trigger_without_runtime() {
        let _guard = SERIAL.blocking_lock();
        reset();

        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        add(move || async move {
            c.fetch_add(1, Ordering::SeqCst);
            Ok::<_, anyhow::Error>(())
        });

        trigger();
        assert!(global().is_closed());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_install_only_once() {
        let _guard = SERIAL.lock().await;
        reset();

        install(Closer::new()).unwrap();
        assert!(matches!(
            install(Closer::new()),
            Err(CloserError::GlobalInstalled)
        ));
    }

    #[tokio::test]
    async fn test_install_after_close_rejected() {
        let _guard = SERIAL.lock().await;
        reset();

        close_all().await;
        assert!(matches!(
            install(Closer::new()),
            Err(CloserError::GlobalInstalled)
        ));
    }
}
