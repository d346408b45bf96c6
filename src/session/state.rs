//! Per-connection session state. Never persisted.

use crate::token::Token;

/// Where a session is in its logical exchange.
///
/// Phases only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    /// Waiting for the first CTS, or for the offset rendezvous to answer.
    AwaitingOffset,
    /// Delivering early errors and feed items.
    Streaming,
    /// Delivering errors reported while the feed was streaming.
    Draining,
    /// `COMPLETE` was sent; only `PING`s are answered from here on.
    Complete,
}

/// Outcome of a finished session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    /// Token the session was bound to.
    pub token: Token,
    /// `RESOURCE` and `ERROR` responses produced.
    pub emitted: u64,
    /// `PONG`s sent in answer to `PING`.
    pub pongs: u64,
    /// Whether `COMPLETE` was sent.
    pub complete: bool,
}

/// Pairing and phase bookkeeping for one session.
#[derive(Debug)]
pub struct SessionState {
    token: Token,
    phase: Phase,
    emitted: u64,
    pongs: u64,
    pending_cts: u64,
}

impl SessionState {
    /// A fresh session for `token`, waiting for its offset.
    #[must_use]
    pub fn new(token: Token) -> Self {
        Self {
            token,
            phase: Phase::AwaitingOffset,
            emitted: 0,
            pongs: 0,
            pending_cts: 0,
        }
    }

    /// The session's token.
    #[must_use]
    pub fn token(&self) -> &Token {
        &self.token
    }

    /// Current phase.
    #[must_use]
    pub const fn phase(&self) -> Phase {
        self.phase
    }

    /// Whether `COMPLETE` has been sent.
    #[must_use]
    pub const fn is_complete(&self) -> bool {
        matches!(self.phase, Phase::Complete)
    }

    /// CTSs received and not yet answered.
    #[must_use]
    pub const fn pending_cts(&self) -> u64 {
        self.pending_cts
    }

    /// Whether the next response should be pulled.
    #[must_use]
    pub const fn wants_response(&self) -> bool {
        self.pending_cts > 0 && !self.is_complete()
    }

    /// Queue a CTS. Returns false if the exchange is already complete.
    pub fn on_cts(&mut self) -> bool {
        if self.is_complete() {
            return false;
        }
        self.pending_cts += 1;
        true
    }

    /// Count a `PONG`.
    pub fn on_pong(&mut self) {
        self.pongs += 1;
    }

    /// Record one CTS-paired response of `phase`. Returns its 1-based position.
    pub fn on_response(&mut self, phase: Phase) -> u64 {
        self.pending_cts = self.pending_cts.saturating_sub(1);
        self.phase = self.phase.max(phase);
        if phase != Phase::Complete {
            self.emitted += 1;
        } else {
            // Nothing follows COMPLETE.
            self.pending_cts = 0;
        }
        self.emitted + u64::from(phase == Phase::Complete)
    }

    /// Counters so far.
    #[must_use]
    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            token: self.token.clone(),
            emitted: self.emitted,
            pongs: self.pongs,
            complete: self.is_complete(),
        }
    }
}
