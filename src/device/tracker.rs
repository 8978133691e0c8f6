//! Optimistic connect/disconnect tracking
//!
//! One machine owns both the confirmed connectivity and the pending target.
//! Surfaces read [`CommandState::phase`] instead of combining the two.
//!
//! # Phases
//!
//! ```text
//!                 UserIntent(true)            InboundStatus(online)
//!  Disconnected ───────────────────► Connecting ──────────────────► Connected
//!       ▲        PublishResult(Err)      │                              │
//!       └────────── ConfirmationTimeout ─┘                              │
//!       ▲                                                               │
//!       │  InboundStatus(offline)              UserIntent(false)        │
//!       └─────────────────────────── Disconnecting ◄────────────────────┘
//! ```
//!
//! `Unknown` accepts no intents; it only leaves on the first inbound status.
//!
//! The tracker itself performs no I/O. [`CommandTracker::apply`] returns a
//! [`Decision`] telling the caller whether to publish, arm the confirmation
//! timer, or do nothing.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::device::error::BridgeError;
use crate::device::status::Connectivity;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LinkPhase {
    #[default]
    Unknown,
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

impl fmt::Display for LinkPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            LinkPhase::Unknown => "Checking device...",
            LinkPhase::Disconnected => "Device Disconnected",
            LinkPhase::Connecting => "Connecting",
            LinkPhase::Connected => "Device Connected",
            LinkPhase::Disconnecting => "Disconnecting",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackerEvent {
    InboundStatus(Connectivity),
    UserIntent { target: bool, device_bound: bool },
    PublishResult { seq: u64, outcome: Result<(), String> },
    ConfirmationTimeout { seq: u64, after: Duration },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    NoDevice,
    ConnectivityUnknown,
    CommandInFlight,
}

impl From<Rejection> for BridgeError {
    fn from(rejection: Rejection) -> Self {
        match rejection {
            Rejection::NoDevice => BridgeError::NoDevice,
            Rejection::ConnectivityUnknown => BridgeError::ConnectivityUnknown,
            Rejection::CommandInFlight => BridgeError::CommandInFlight,
        }
    }
}

/// What the caller has to do after an event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Send the connect/disconnect command, then report `PublishResult { seq }`
    Publish { target: bool, seq: u64 },
    /// Published; start the confirmation timer for `seq`
    AwaitConfirmation { seq: u64 },
    Rejected(Rejection),
    Updated,
    Ignored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PendingCommand {
    target: bool,
    seq: u64,
    published: bool,
}

/// Snapshot handed to observers
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandState {
    pub phase: LinkPhase,
    pub confirmed: Connectivity,
    pub pending: Option<bool>,
    pub last_error: Option<String>,
}

impl CommandState {
    /// A command is outstanding and the device has not reached its target yet
    pub fn waiting(&self) -> bool {
        match self.pending {
            Some(target) => self.confirmed.as_bool() != Some(target),
            None => false,
        }
    }
}

#[derive(Debug, Default)]
pub struct CommandTracker {
    confirmed: Connectivity,
    pending: Option<PendingCommand>,
    last_error: Option<String>,
    next_seq: u64,
}

impl CommandTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> LinkPhase {
        match (self.pending, self.confirmed) {
            (Some(p), Connectivity::Connected) if p.target => LinkPhase::Connected,
            (Some(p), Connectivity::Disconnected) if !p.target => LinkPhase::Disconnected,
            (Some(p), _) if p.target => LinkPhase::Connecting,
            (Some(_), _) => LinkPhase::Disconnecting,
            (None, Connectivity::Unknown) => LinkPhase::Unknown,
            (None, Connectivity::Connected) => LinkPhase::Connected,
            (None, Connectivity::Disconnected) => LinkPhase::Disconnected,
        }
    }

    pub fn snapshot(&self) -> CommandState {
        CommandState {
            phase: self.phase(),
            confirmed: self.confirmed,
            pending: self.pending.map(|p| p.target),
            last_error: self.last_error.clone(),
        }
    }

    pub fn apply(&mut self, event: TrackerEvent) -> Decision {
        match event {
            TrackerEvent::InboundStatus(connectivity) => self.on_status(connectivity),
            TrackerEvent::UserIntent {
                target,
                device_bound,
            } => self.on_intent(target, device_bound),
            TrackerEvent::PublishResult { seq, outcome } => self.on_publish(seq, outcome),
            TrackerEvent::ConfirmationTimeout { seq, after } => self.on_timeout(seq, after),
        }
    }

    fn on_status(&mut self, connectivity: Connectivity) -> Decision {
        let changed = self.confirmed != connectivity;
        self.confirmed = connectivity;

        match self.pending {
            Some(pending) if connectivity.as_bool() == Some(pending.target) => {
                info!("Device confirmed {}", connectivity);
                self.pending = None;
                Decision::Updated
            }
            _ if changed => Decision::Updated,
            _ => Decision::Ignored,
        }
    }

    fn on_intent(&mut self, target: bool, device_bound: bool) -> Decision {
        let rejection = if !device_bound {
            Some(Rejection::NoDevice)
        } else if self.pending.is_some() {
            Some(Rejection::CommandInFlight)
        } else if self.confirmed == Connectivity::Unknown {
            Some(Rejection::ConnectivityUnknown)
        } else {
            None
        };
        if let Some(rejection) = rejection {
            debug!("Rejected request for target {}: {:?}", target, rejection);
            return Decision::Rejected(rejection);
        }

        self.next_seq += 1;
        let seq = self.next_seq;
        self.pending = Some(PendingCommand {
            target,
            seq,
            published: false,
        });
        self.last_error = None;
        Decision::Publish { target, seq }
    }

    fn on_publish(&mut self, seq: u64, outcome: Result<(), String>) -> Decision {
        let current = self.pending.filter(|p| p.seq == seq);

        match (outcome, current) {
            (Err(reason), current) => {
                if current.is_some() {
                    self.pending = None;
                }
                if seq == self.next_seq {
                    warn!("Command {} failed: {}", seq, reason);
                    self.last_error = Some(reason);
                    Decision::Updated
                } else {
                    Decision::Ignored
                }
            }
            (Ok(()), Some(pending)) => {
                if self.confirmed.as_bool() == Some(pending.target) {
                    // Already there; nothing left to confirm
                    self.pending = None;
                    Decision::Updated
                } else {
                    self.pending = Some(PendingCommand {
                        published: true,
                        ..pending
                    });
                    Decision::AwaitConfirmation { seq }
                }
            }
            (Ok(()), None) => Decision::Ignored,
        }
    }

    fn on_timeout(&mut self, seq: u64, after: Duration) -> Decision {
        match self.pending {
            Some(pending) if pending.seq == seq && pending.published => {
                self.pending = None;
                let error = BridgeError::ConfirmationTimeout(after.as_secs());
                warn!("{}", error);
                self.last_error = Some(error.to_string());
                Decision::Updated
            }
            _ => Decision::Ignored,
        }
    }
}

/// Shared tracker of one device binding
///
/// Events are applied one at a time and every resulting snapshot is
/// published, until the handle is closed.
#[derive(Clone)]
pub struct TrackerHandle {
    tracker: Arc<Mutex<CommandTracker>>,
    state: Arc<watch::Sender<CommandState>>,
    cancel: CancellationToken,
}

impl TrackerHandle {
    pub fn new(state: Arc<watch::Sender<CommandState>>) -> Self {
        Self {
            tracker: Arc::new(Mutex::new(CommandTracker::new())),
            state,
            cancel: CancellationToken::new(),
        }
    }

    pub async fn apply(&self, event: TrackerEvent) -> Decision {
        let mut tracker = self.tracker.lock().await;
        self.apply_locked(&mut tracker, event)
    }

    /// Applies an accepted status, then runs `publish` before any other event
    ///
    /// Observers of whatever `publish` writes therefore never see a status
    /// the tracker has not taken in yet.
    pub async fn observe<T>(&self, status: Connectivity, publish: impl FnOnce() -> T) -> T {
        let mut tracker = self.tracker.lock().await;
        self.apply_locked(&mut tracker, TrackerEvent::InboundStatus(status));
        publish()
    }

    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stops publishing snapshots and waits out an update already in progress
    pub async fn close(&self) {
        self.cancel.cancel();
        drop(self.tracker.lock().await);
    }

    fn apply_locked(&self, tracker: &mut CommandTracker, event: TrackerEvent) -> Decision {
        let decision = tracker.apply(event);
        // a closed binding must not overwrite the next device's state
        if !self.cancel.is_cancelled() {
            self.state.send_replace(tracker.snapshot());
        }
        decision
    }
}
