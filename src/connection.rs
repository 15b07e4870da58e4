use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use log::{info, warn};
use tokio::sync::{broadcast, mpsc, watch};

use crate::upstream::{RemoteChat, RemoteMessage, UpstreamEvent, UpstreamService};

/// Bounded reconnect policy: after this many consecutive failures the
/// manager goes terminal `Closed` and surfaces a connection-failed
/// event instead of retrying further.
pub const MAX_CONNECT_ATTEMPTS: u32 = 5;
pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Closed,
    Connecting,
    Open,
    LoggedOut,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Closed => "closed",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::LoggedOut => "logged_out",
        }
    }
}

/// Session-level events re-broadcast to the sync engine and the relay
/// bridge, in the order the upstream produced them.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    StateChanged(ConnectionState),
    Qr { url: String },
    Message(RemoteMessage),
    Snapshot(Vec<RemoteChat>),
    /// Terminal: the bounded retry budget is exhausted.
    ConnectionFailed,
}

enum SessionOutcome {
    /// Authoritative logout; credentials were wiped, reconnect at once.
    LoggedOut,
    /// Transient close or stream end; apply the bounded retry policy.
    Dropped,
    Shutdown,
}

/// Owns the lifecycle of the single upstream session as an explicit
/// state machine. Upstream callbacks arrive as a typed event channel
/// consumed by one control loop; nothing else mutates the state.
pub struct ConnectionManager {
    upstream: Arc<dyn UpstreamService>,
    state_tx: watch::Sender<ConnectionState>,
    events: broadcast::Sender<SessionEvent>,
    attempts: AtomicU32,
}

impl ConnectionManager {
    pub fn new(upstream: Arc<dyn UpstreamService>) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Closed);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            upstream,
            state_tx,
            events,
            attempts: AtomicU32::new(0),
        }
    }

    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    fn transition(&self, next: ConnectionState) {
        let prev = *self.state_tx.borrow();
        if prev != next {
            info!(target: "Connection", "State {} -> {}", prev.as_str(), next.as_str());
        }
        self.state_tx.send_replace(next);
        let _ = self.events.send(SessionEvent::StateChanged(next));
    }

    /// Control loop. Runs until shutdown is signalled or the retry
    /// budget is exhausted.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                self.transition(ConnectionState::Closed);
                return;
            }

            self.transition(ConnectionState::Connecting);
            match self.upstream.connect().await {
                Ok(rx) => match self.drive_session(rx, &mut shutdown).await {
                    SessionOutcome::LoggedOut => continue,
                    SessionOutcome::Dropped => {
                        self.transition(ConnectionState::Closed);
                    }
                    SessionOutcome::Shutdown => {
                        self.transition(ConnectionState::Closed);
                        return;
                    }
                },
                Err(e) => {
                    warn!(target: "Connection", "Connect attempt failed: {e:#}");
                }
            }

            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if attempt >= MAX_CONNECT_ATTEMPTS {
                warn!(target: "Connection", "Giving up after {attempt} attempts");
                self.transition(ConnectionState::Closed);
                let _ = self.events.send(SessionEvent::ConnectionFailed);
                return;
            }
            info!(
                target: "Connection",
                "Reconnecting in {:?} (attempt {attempt}/{MAX_CONNECT_ATTEMPTS})",
                RECONNECT_DELAY
            );
            tokio::select! {
                _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                _ = shutdown.changed() => {}
            }
        }
    }

    async fn drive_session(
        &self,
        mut rx: mpsc::Receiver<UpstreamEvent>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> SessionOutcome {
        loop {
            let event = tokio::select! {
                ev = rx.recv() => ev,
                _ = shutdown.changed() => return SessionOutcome::Shutdown,
            };
            match event {
                Some(UpstreamEvent::Open) => {
                    self.attempts.store(0, Ordering::SeqCst);
                    self.transition(ConnectionState::Open);
                }
                Some(UpstreamEvent::Qr { url }) => {
                    // Pairing challenges pass through verbatim; the
                    // state machine stays in `connecting`.
                    let _ = self.events.send(SessionEvent::Qr { url });
                }
                Some(UpstreamEvent::Message(msg)) => {
                    let _ = self.events.send(SessionEvent::Message(msg));
                }
                Some(UpstreamEvent::Snapshot(chats)) => {
                    let _ = self.events.send(SessionEvent::Snapshot(chats));
                }
                Some(UpstreamEvent::Close(reason)) => {
                    if reason.is_logged_out() {
                        info!(target: "Connection", "Upstream logout, wiping credentials");
                        self.transition(ConnectionState::LoggedOut);
                        if let Err(e) = self.upstream.clear_credentials().await {
                            warn!(target: "Connection", "Credential wipe failed: {e:#}");
                        }
                        self.attempts.store(0, Ordering::SeqCst);
                        return SessionOutcome::LoggedOut;
                    }
                    warn!(target: "Connection", "Upstream closed: {reason:?}");
                    return SessionOutcome::Dropped;
                }
                None => {
                    warn!(target: "Connection", "Upstream event stream ended");
                    return SessionOutcome::Dropped;
                }
            }
        }
    }
}
