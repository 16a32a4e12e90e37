//! Fail-together task group.
//!
//! Every actor runs as its own tokio task and receives a shared shutdown
//! signal. The first actor to return, successfully or not, flips the signal
//! and the group waits for the rest. Actors still running after the drain
//! timeout are aborted.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::{JoinError, JoinSet};
use tokio::time::Instant;
use tracing::{debug, error, warn};

/// How long stopped-but-not-finished actors get before they are aborted.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

type ActorFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;
type Actor = Box<dyn FnOnce(watch::Receiver<bool>) -> ActorFuture + Send>;

/// A set of actors that live and die together.
pub struct RunGroup {
    actors: Vec<(String, Actor)>,
    drain_timeout: Duration,
}

impl Default for RunGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl RunGroup {
    pub fn new() -> Self {
        Self {
            actors: Vec::new(),
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// Add an actor. It must return once the receiver observes `true`.
    pub fn add<F, Fut>(mut self, name: impl Into<String>, actor: F) -> Self
    where
        F: FnOnce(watch::Receiver<bool>) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.actors
            .push((name.into(), Box::new(move |rx| Box::pin(actor(rx)))));
        self
    }

    /// Run every actor until the first one returns, then stop the rest.
    ///
    /// Returns the first error in completion order, or `Ok(())`.
    pub async fn run(self) -> anyhow::Result<()> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut set = JoinSet::new();
        for (name, actor) in self.actors {
            let fut = actor(shutdown_rx.clone());
            set.spawn(async move { (name, fut.await) });
        }
        drop(shutdown_rx);

        let mut first_error = None;

        let Some(joined) = set.join_next().await else {
            return Ok(());
        };
        record(joined, &mut first_error);
        let _ = shutdown_tx.send(true);

        let deadline = Instant::now() + self.drain_timeout;
        loop {
            match tokio::time::timeout_at(deadline, set.join_next()).await {
                Ok(Some(joined)) => record(joined, &mut first_error),
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        remaining = set.len(),
                        timeout = ?self.drain_timeout,
                        "actors did not stop in time, aborting"
                    );
                    set.abort_all();
                    while let Some(joined) = set.join_next().await {
                        record(joined, &mut first_error);
                    }
                    break;
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn record(
    joined: Result<(String, anyhow::Result<()>), JoinError>,
    first_error: &mut Option<anyhow::Error>,
) {
    match joined {
        Ok((name, Ok(()))) => debug!(actor = %name, "actor stopped"),
        Ok((name, Err(e))) => {
            error!(actor = %name, error = %e, "actor failed");
            if first_error.is_none() {
                *first_error = Some(e.context(format!("{name} failed")));
            }
        }
        Err(e) if e.is_cancelled() => {}
        Err(e) => {
            error!(error = %e, "actor panicked");
            if first_error.is_none() {
                *first_error = Some(anyhow::anyhow!("actor panicked: {e}"));
            }
        }
    }
}
