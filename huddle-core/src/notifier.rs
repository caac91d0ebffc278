//! Incoming call notification
//!
//! While no call is in progress, call-initiation frames from the conversation
//! are collected into a single pending [`IncomingCallOffer`] that the user
//! accepts or declines. A call can be announced by an `incoming_call` notice,
//! by the `webrtc_offer` itself, or by both in either order; the two halves
//! are merged. Only one offer is retained: a newer, unrelated offer replaces
//! the pending one.

use crate::call::CallError;
use crate::signaling::SessionDescription;
use crate::types::CallMode;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;

/// A call waiting for the local user's decision
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IncomingCallOffer {
    /// Caller's user name, if announced
    pub from: Option<String>,
    /// Requested media
    pub mode: CallMode,
    /// Caller's SDP offer, once received
    pub offer: Option<SessionDescription>,
    /// When the call was first announced
    pub received_at: DateTime<Utc>,
    #[serde(skip)]
    received_instant: Instant,
}

impl IncomingCallOffer {
    /// Offer received now
    #[must_use]
    pub fn new(from: Option<String>, mode: CallMode, offer: Option<SessionDescription>) -> Self {
        Self {
            from,
            mode,
            offer,
            received_at: Utc::now(),
            received_instant: Instant::now(),
        }
    }

    /// Check if the offer payload has arrived, so the call can be accepted
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.offer.is_some()
    }

    /// Monotonic receipt time
    #[must_use]
    pub fn received_instant(&self) -> Instant {
        self.received_instant
    }

    fn same_caller(&self, from: Option<&str>) -> bool {
        match (self.from.as_deref(), from) {
            (Some(a), Some(b)) => a == b,
            _ => true,
        }
    }
}

/// What a notification did to the pending offer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeOutcome {
    /// New pending offer
    Ringing,
    /// Completed the pending offer with its other half
    Merged,
    /// Replaced an unrelated pending offer
    Replaced,
    /// Not a call for the local user
    Ignored,
}

/// Holds at most one pending incoming call
#[derive(Debug)]
pub struct IncomingCallNotifier {
    local_user: String,
    pending: Option<IncomingCallOffer>,
}

impl IncomingCallNotifier {
    /// Create a notifier for `local_user`
    pub fn new(local_user: impl Into<String>) -> Self {
        Self {
            local_user: local_user.into(),
            pending: None,
        }
    }

    /// Handle an `incoming_call` notice
    pub fn on_incoming_call(&mut self, from: &str, mode: CallMode) -> NoticeOutcome {
        if from == self.local_user {
            tracing::debug!("Ignoring own incoming_call echo");
            return NoticeOutcome::Ignored;
        }

        if let Some(pending) = self.pending.as_mut() {
            if pending.from.is_none() && pending.is_ready() {
                pending.from = Some(from.to_string());
                tracing::debug!(from, "Caller identity merged into pending offer");
                return NoticeOutcome::Merged;
            }
        }

        self.replace(IncomingCallOffer::new(Some(from.to_string()), mode, None))
    }

    /// Handle a `webrtc_offer` received while idle
    pub fn on_offer(
        &mut self,
        from: Option<&str>,
        mode: CallMode,
        offer: SessionDescription,
    ) -> NoticeOutcome {
        if from == Some(self.local_user.as_str()) {
            tracing::debug!("Ignoring own offer echo");
            return NoticeOutcome::Ignored;
        }

        if let Some(pending) = self.pending.as_mut() {
            if !pending.is_ready() && pending.same_caller(from) {
                if pending.from.is_none() {
                    pending.from = from.map(str::to_owned);
                }
                pending.mode = mode;
                pending.offer = Some(offer);
                tracing::debug!(mode = %mode, "Offer merged into pending call notice");
                return NoticeOutcome::Merged;
            }
        }

        self.replace(IncomingCallOffer::new(
            from.map(str::to_owned),
            mode,
            Some(offer),
        ))
    }

    fn replace(&mut self, offer: IncomingCallOffer) -> NoticeOutcome {
        let from = offer.from.clone();
        let mode = offer.mode;
        match self.pending.replace(offer) {
            Some(previous) => {
                tracing::info!(
                    previous_from = ?previous.from,
                    from = ?from,
                    mode = %mode,
                    "Pending incoming call replaced by a newer one"
                );
                NoticeOutcome::Replaced
            }
            None => {
                tracing::info!(from = ?from, mode = %mode, "Incoming call");
                NoticeOutcome::Ringing
            }
        }
    }

    /// Pending offer, if any
    #[must_use]
    pub fn pending(&self) -> Option<&IncomingCallOffer> {
        self.pending.as_ref()
    }

    /// Discard the pending offer; nothing is sent to the caller
    pub fn decline(&mut self) -> Option<IncomingCallOffer> {
        let declined = self.pending.take();
        if let Some(offer) = &declined {
            tracing::info!(from = ?offer.from, "Incoming call declined");
        }
        declined
    }

    /// Take the pending offer for acceptance
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` if nothing is pending, or if only the notice
    /// has arrived so far (the notice is kept)
    pub fn take_ready(&mut self) -> Result<IncomingCallOffer, CallError> {
        match self.pending.take() {
            Some(offer) if offer.is_ready() => Ok(offer),
            Some(notice) => {
                self.pending = Some(notice);
                Err(CallError::InvalidState(
                    "incoming call has no offer yet".to_string(),
                ))
            }
            None => Err(CallError::InvalidState(
                "no pending incoming call".to_string(),
            )),
        }
    }

    /// When the pending offer goes stale under `timeout`
    #[must_use]
    pub fn deadline(&self, timeout: Duration) -> Option<Instant> {
        self.pending
            .as_ref()
            .map(|offer| offer.received_instant + timeout)
    }

    /// Discard the pending offer if it is older than `timeout`
    pub fn expire(&mut self, now: Instant, timeout: Duration) -> Option<IncomingCallOffer> {
        let stale = self
            .pending
            .as_ref()
            .is_some_and(|offer| now.saturating_duration_since(offer.received_instant) >= timeout);
        if !stale {
            return None;
        }
        let expired = self.pending.take();
        if let Some(offer) = &expired {
            tracing::info!(from = ?offer.from, "Incoming call expired");
        }
        expired
    }

    /// Drop the pending offer without logging a decision
    pub fn clear(&mut self) -> Option<IncomingCallOffer> {
        self.pending.take()
    }
}
