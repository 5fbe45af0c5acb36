//! Shutdown coordination for the proxy.
//!
//! A single actor task owns the "accepting" flag and the in-flight counter.
//! Request handlers register through [`ShutdownHandle::enter`] and hold the
//! returned [`ActivityGuard`] until they finish. Once terminated, the actor
//! rejects new registrations, waits for the counter to reach zero (logging
//! what is still outstanding) and then flips the `closed` watch, which the
//! server uses as its graceful-shutdown trigger.

use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};

/// Default interval between "still draining" log lines.
pub const DEFAULT_DRAIN_LOG_INTERVAL: Duration = Duration::from_secs(1);

enum Command {
    Enter(oneshot::Sender<Option<ActivityGuard>>),
    Leave,
    Terminate,
    Status(oneshot::Sender<ShutdownSnapshot>),
}

/// Point-in-time view of the coordinator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownSnapshot {
    pub accepting: bool,
    pub in_flight: usize,
}

/// Spawns the coordinator actor.
pub struct ShutdownCoordinator {
    accepting: bool,
    in_flight: usize,
    drain_log_interval: Duration,
    closed: watch::Sender<bool>,
    tx: mpsc::WeakUnboundedSender<Command>,
}

impl ShutdownCoordinator {
    /// Start the actor on the current runtime and return a handle to it.
    pub fn spawn(drain_log_interval: Duration) -> ShutdownHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let (closed_tx, closed_rx) = watch::channel(false);
        let coordinator = Self {
            accepting: true,
            in_flight: 0,
            drain_log_interval,
            closed: closed_tx,
            tx: tx.downgrade(),
        };
        tokio::spawn(coordinator.run(rx));
        ShutdownHandle { tx, closed: closed_rx }
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        let mut ticker = tokio::time::interval(self.drain_log_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = rx.recv() => match command {
                    Some(command) => self.apply(command),
                    None => break,
                },
                _ = ticker.tick(), if self.is_draining() => {
                    tracing::info!(active = self.in_flight, "Waiting for active requests to finish");
                }
            }

            if !self.accepting && self.in_flight == 0 && !*self.closed.borrow() {
                tracing::info!("All requests finished, closing listener");
                let _ = self.closed.send(true);
            }
        }
    }

    fn apply(&mut self, command: Command) {
        match command {
            Command::Enter(reply) => {
                // The guard travels through the reply, so a caller that goes
                // away before or after the send still releases its slot.
                let guard = match self.tx.upgrade() {
                    Some(tx) if self.accepting => {
                        self.in_flight += 1;
                        Some(ActivityGuard { tx })
                    }
                    _ => None,
                };
                let _ = reply.send(guard);
            }
            Command::Leave => {
                self.in_flight = self.in_flight.saturating_sub(1);
            }
            Command::Terminate => {
                if self.accepting {
                    self.accepting = false;
                    tracing::info!(active = self.in_flight, "Shutdown requested, no longer accepting requests");
                }
            }
            Command::Status(reply) => {
                let _ = reply.send(ShutdownSnapshot {
                    accepting: self.accepting,
                    in_flight: self.in_flight,
                });
            }
        }
    }

    fn is_draining(&self) -> bool {
        !self.accepting && self.in_flight > 0
    }
}

/// Cloneable access to the coordinator actor.
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: mpsc::UnboundedSender<Command>,
    closed: watch::Receiver<bool>,
}

impl ShutdownHandle {
    /// Register a request. `None` once shutdown has begun.
    pub async fn enter(&self) -> Option<ActivityGuard> {
        let (reply, admitted) = oneshot::channel();
        self.tx.send(Command::Enter(reply)).ok()?;
        admitted.await.ok().flatten()
    }

    /// Stop accepting requests and start draining.
    pub fn terminate(&self) {
        let _ = self.tx.send(Command::Terminate);
    }

    /// Current state, or `None` if the actor has stopped.
    pub async fn snapshot(&self) -> Option<ShutdownSnapshot> {
        let (reply, snapshot) = oneshot::channel();
        self.tx.send(Command::Status(reply)).ok()?;
        snapshot.await.ok()
    }

    /// Resolves once shutdown was requested and no request is in flight.
    pub async fn closed(&self) {
        let mut closed = self.closed.clone();
        // An error means the actor is gone, which also ends the wait.
        let _ = closed.wait_for(|closed| *closed).await;
    }
}

/// Marks one in-flight request; deregisters on drop.
pub struct ActivityGuard {
    tx: mpsc::UnboundedSender<Command>,
}

impl Drop for ActivityGuard {
    fn drop(&mut self) {
        let _ = self.tx.send(Command::Leave);
    }
}
