//! Session lifecycle controller.
//!
//! Tracks the session phase and owns the two cancellation signals:
//!
//! - `shutdown`: internal, stops the reader and writer tasks once the session
//!   reaches a terminal phase.
//! - `external`: handed to the session owner; cancelling it aborts the session.
//!
//! ```text
//! Open --close()--> Closing --flushed--> Closed
//!   |                  |
//!   +---abort(err)-----+-----------------> Aborted(err)
//! ```
//!
//! Transitions are made with `watch::Sender::send_if_modified`, so each one
//! happens at most once no matter how many tasks race for it.

use crate::error::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Observable session phase
#[derive(Debug, Clone)]
pub enum SessionState {
    /// Accepting new streams
    Open,
    /// `close()` in progress, flushing Close frames
    Closing,
    /// Graceful shutdown finished
    Closed,
    /// Torn down by an error or cancellation
    Aborted(Error),
}

impl SessionState {
    pub fn is_open(&self) -> bool {
        matches!(self, SessionState::Open)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Aborted(_))
    }
}

#[derive(Debug)]
pub(crate) struct Lifecycle {
    state: watch::Sender<SessionState>,
    shutdown: CancellationToken,
    external: CancellationToken,
}

impl Lifecycle {
    pub(crate) fn new(external: CancellationToken) -> Self {
        let (state, _) = watch::channel(SessionState::Open);
        Self {
            state,
            shutdown: CancellationToken::new(),
            external,
        }
    }

    pub(crate) fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    pub(crate) fn is_open(&self) -> bool {
        self.state.borrow().is_open()
    }

    /// Open -> Closing. False if the session was not open.
    pub(crate) fn begin_close(&self) -> bool {
        self.state.send_if_modified(|state| {
            if state.is_open() {
                *state = SessionState::Closing;
                true
            } else {
                false
            }
        })
    }

    /// Closing -> Closed, stopping the background tasks
    pub(crate) fn finish_close(&self) -> bool {
        let changed = self.state.send_if_modified(|state| {
            if matches!(state, SessionState::Closing) {
                *state = SessionState::Closed;
                true
            } else {
                false
            }
        });
        if changed {
            self.shutdown.cancel();
        }
        changed
    }

    /// Any non-terminal phase -> Aborted. True only for the call that won.
    pub(crate) fn abort(&self, err: Error) -> bool {
        let changed = self.state.send_if_modified(|state| {
            if state.is_terminal() {
                false
            } else {
                *state = SessionState::Aborted(err);
                true
            }
        });
        if changed {
            self.shutdown.cancel();
        }
        changed
    }

    pub(crate) fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub(crate) fn external_token(&self) -> CancellationToken {
        self.external.clone()
    }

    /// Resolve once the session is Closed or Aborted
    pub(crate) async fn terminated(&self) -> SessionState {
        let mut rx = self.state.subscribe();
        let result = match rx.wait_for(SessionState::is_terminal).await {
            Ok(state) => state.clone(),
            Err(_) => self.state(),
        };
        result
    }
}
