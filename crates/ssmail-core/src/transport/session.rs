//! Lifecycle of one pull from an external mailbox.
//!
//! ```text
//! Connecting -> Ready -> Fetching -> Closing -> Closed
//!      |                    |           ^
//!      +-----> Error <------+-----------+
//! ```
//!
//! Every run ends in `Closed`, whether the connect, the fetch or the
//! logout failed.

use serde::Serialize;
use tracing::{debug, warn};

use crate::Result;

/// Pull session states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// Opening the connection and authenticating.
    Connecting,
    /// Authenticated, nothing fetched yet.
    Ready,
    /// Retrieving messages.
    Fetching,
    /// Connect or fetch failed.
    Error,
    /// Logging out.
    Closing,
    /// Done; the connection is released.
    Closed,
}

impl SessionState {
    /// Whether `next` may follow `self`.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Connecting, Self::Ready | Self::Error)
                | (Self::Ready, Self::Fetching | Self::Closing)
                | (Self::Fetching, Self::Closing | Self::Error)
                | (Self::Error, Self::Closing)
                | (Self::Closing, Self::Closed)
        )
    }
}

/// A connected, authenticated mailbox.
///
/// Implementations are blocking; callers run sessions off the async runtime.
pub trait PullConnection {
    /// Raw RFC 5322 bytes of the newest `window` messages, newest first.
    ///
    /// # Errors
    ///
    /// Returns a transport error if the mailbox cannot be read.
    fn fetch_recent(&mut self, window: usize) -> Result<Vec<Vec<u8>>>;

    /// Ends the session.
    ///
    /// # Errors
    ///
    /// Returns a transport error if logout fails.
    fn close(&mut self) -> Result<()>;
}

/// Result of [`PullSession::run`].
#[derive(Debug)]
pub struct PullOutcome {
    /// Fetched messages, or the connect/fetch error.
    pub result: Result<Vec<Vec<u8>>>,
    /// Every state the session passed through, in order.
    pub history: Vec<SessionState>,
}

/// Drives a single pull through its states.
#[derive(Debug)]
pub struct PullSession {
    label: String,
    state: SessionState,
    history: Vec<SessionState>,
}

impl PullSession {
    /// Starts a session in [`SessionState::Connecting`].
    #[must_use]
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            state: SessionState::Connecting,
            history: vec![SessionState::Connecting],
        }
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> SessionState {
        self.state
    }

    fn enter(&mut self, next: SessionState) {
        if !self.state.can_transition_to(next) {
            warn!("{}: unexpected transition {:?} -> {:?}", self.label, self.state, next);
        }
        debug!("{}: {:?} -> {:?}", self.label, self.state, next);
        self.state = next;
        self.history.push(next);
    }

    /// Connects, fetches the newest `window` messages and closes.
    pub fn run<C, F>(mut self, connect: F, window: usize) -> PullOutcome
    where
        C: PullConnection,
        F: FnOnce() -> Result<C>,
    {
        let mut connection = match connect() {
            Ok(connection) => connection,
            Err(e) => {
                self.enter(SessionState::Error);
                return self.finish(Err(e));
            }
        };
        self.enter(SessionState::Ready);

        self.enter(SessionState::Fetching);
        let result = connection.fetch_recent(window);
        if result.is_err() {
            self.enter(SessionState::Error);
        }

        self.enter(SessionState::Closing);
        if let Err(e) = connection.close() {
            warn!("{}: logout failed: {e}", self.label);
        }
        self.enter(SessionState::Closed);
        PullOutcome {
            result,
            history: self.history,
        }
    }

    fn finish(mut self, result: Result<Vec<Vec<u8>>>) -> PullOutcome {
        self.enter(SessionState::Closing);
        self.enter(SessionState::Closed);
        PullOutcome {
            result,
            history: self.history,
        }
    }
}
