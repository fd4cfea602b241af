//! One-shot shutdown trigger shared by the console and the signal handlers.

use std::{future::Future, io, sync::Arc};

use tokio::{
    signal::unix::{signal, SignalKind},
    sync::watch,
};

/// A cloneable flag that flips to "shutting down" exactly once.
#[derive(Debug, Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Requests shutdown. Returns `true` only for the first caller.
    pub fn trigger(&self) -> bool {
        self.tx.send_if_modified(|triggered| !std::mem::replace(triggered, true))
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once shutdown has been requested.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(|triggered| *triggered).await;
    }
}

/// Registers SIGINT and SIGTERM handlers and returns the future that triggers `shutdown` on the
/// first of them.
///
/// The handlers are in place as soon as this returns, before the future is first polled, so a
/// signal arriving in between is not lost. The future returns early if shutdown is requested
/// elsewhere. Must be called from within a runtime.
pub fn listen_for_signals(shutdown: Shutdown) -> io::Result<impl Future<Output = ()> + Send + 'static> {
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;

    Ok(async move {
        let name = tokio::select! {
            _ = interrupt.recv() => "SIGINT",
            _ = terminate.recv() => "SIGTERM",
            _ = shutdown.wait() => return,
        };

        if shutdown.trigger() {
            tracing::info!(signal = name, "signal received, shutting down");
        }
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test(flavor = "multi_thread")]
    async fn only_first_trigger_wins() {
        let shutdown = Shutdown::new();
        let other = shutdown.clone();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let s = shutdown.clone();
                tokio::spawn(async move { s.trigger() })
            })
            .collect();

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }

        assert_eq!(winners, 1);
        assert!(other.is_triggered());
        assert!(!other.trigger());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn wait_resolves_after_trigger() {
        let shutdown = Shutdown::new();

        let waiter = tokio::spawn({
            let s = shutdown.clone();
            async move { s.wait().await }
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();

        // Already triggered: resolves immediately.
        tokio::time::timeout(Duration::from_secs(1), shutdown.wait()).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn signal_listener_stops_on_trigger() {
        let shutdown = Shutdown::new();
        let listener = tokio::spawn(listen_for_signals(shutdown.clone()).unwrap());

        shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(1), listener).await.unwrap().unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn signal_before_first_poll_is_not_lost() {
        use nix::{
            sys::signal::{kill, Signal},
            unistd::Pid,
        };

        let _ = tracing_subscriber::fmt::try_init();

        let shutdown = Shutdown::new();
        let listener = listen_for_signals(shutdown.clone()).unwrap();

        // Delivered while nothing polls the listener yet.
        kill(Pid::this(), Signal::SIGTERM).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!shutdown.is_triggered());

        tokio::time::timeout(Duration::from_secs(1), listener).await.unwrap();
        assert!(shutdown.is_triggered());
    }
}
