//! Cooperative cancellation tokens.
//!
//! A [`CancelToken`] is a propagatable "stop now" signal with an
//! attached reason. Tokens support listener registration (callbacks run
//! once, on cancellation), linking (a parent's cancellation cascades
//! into a child) and an async [`CancelToken::cancelled`] future for
//! select-style use in handlers.
//!
//! Cancellation is cooperative only: setting the flag and firing the
//! listeners does not interrupt a handler that never checks the token.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio::sync::Notify;

type CancelListener = Box<dyn FnOnce(&str) + Send>;

struct TokenState {
    /// `Some(reason)` once cancelled. First cancellation wins.
    reason: Option<String>,
    listeners: Vec<(u64, CancelListener)>,
}

struct TokenInner {
    state: Mutex<TokenState>,
    notify: Notify,
    next_id: AtomicU64,
}

/// A cooperative cancellation signal with an attached reason.
pub struct CancelToken {
    inner: Arc<TokenInner>,
}

impl CancelToken {
    /// Create a fresh, uncancelled token.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TokenInner {
                state: Mutex::new(TokenState {
                    reason: None,
                    listeners: Vec::new(),
                }),
                notify: Notify::new(),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// Cancel the token with the given reason.
    ///
    /// Fires every registered listener exactly once and wakes all
    /// `cancelled()` waiters. Returns `false` if the token was already
    /// cancelled (the original reason is kept).
    pub fn cancel(&self, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        let listeners = {
            let mut state = self
                .inner
                .state
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if state.reason.is_some() {
                return false;
            }
            state.reason = Some(reason.clone());
            std::mem::take(&mut state.listeners)
        };
        // Listeners run outside the lock so they may touch this token.
        for (_, listener) in listeners {
            listener(&reason);
        }
        self.inner.notify.notify_waiters();
        true
    }

    /// Whether the token has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .reason
            .is_some()
    }

    /// The cancellation reason, if cancelled.
    #[must_use]
    pub fn reason(&self) -> Option<String> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .reason
            .clone()
    }

    /// Register a listener fired once upon cancellation.
    ///
    /// If the token is already cancelled the listener runs immediately
    /// on the calling thread. The returned registration removes the
    /// listener again; a caller that links tokens per request must
    /// unregister when the request settles, or the token's listener
    /// list grows for its whole lifetime.
    pub fn on_cancel(&self, listener: impl FnOnce(&str) + Send + 'static) -> CancelRegistration {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let mut state = self
            .inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(reason) = state.reason.clone() {
            drop(state);
            listener(&reason);
        } else {
            state.listeners.push((id, Box::new(listener)));
        }
        CancelRegistration {
            id,
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Link a parent token into this one: when `parent` cancels, this
    /// token cancels with the same reason.
    ///
    /// The returned registration lives on `parent`; unregister it once
    /// this token's work is done so short-lived tokens do not pile up
    /// on a long-lived parent.
    pub fn link(&self, parent: &CancelToken) -> CancelRegistration {
        let this = self.clone();
        parent.on_cancel(move |reason| {
            this.cancel(reason);
        })
    }

    /// Create a child token that cancels whenever this one does.
    ///
    /// The link is permanent; for per-request tokens prefer
    /// [`CancelToken::link`] and unregister on completion.
    #[must_use]
    pub fn child(&self) -> CancelToken {
        let child = CancelToken::new();
        let _ = child.link(self);
        child
    }

    /// Number of registered listeners.
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .listeners
            .len()
    }

    /// Wait until the token is cancelled, returning the reason.
    pub async fn cancelled(&self) -> String {
        loop {
            let notified = self.inner.notify.notified();
            if let Some(reason) = self.reason() {
                return reason;
            }
            notified.await;
        }
    }
}

impl Clone for CancelToken {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .field("reason", &self.reason())
            .finish()
    }
}

/// Handle for one listener registration.
///
/// Dropping the handle does NOT remove the listener; call
/// [`CancelRegistration::unregister`] to take it off the token.
#[derive(Debug)]
#[must_use = "an unregistered listener stays on the token for its whole lifetime"]
pub struct CancelRegistration {
    id: u64,
    inner: Weak<TokenInner>,
}

impl CancelRegistration {
    /// Remove this listener from its token.
    ///
    /// A no-op if the token is gone or the listener already fired.
    pub fn unregister(self) {
        if let Some(inner) = self.inner.upgrade() {
            inner
                .state
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .listeners
                .retain(|(id, _)| *id != self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn cancel_sets_reason_once() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        assert!(token.cancel("first"));
        assert!(!token.cancel("second"));
        assert_eq!(token.reason().as_deref(), Some("first"));
    }

    #[test]
    fn listeners_fire_on_cancel() {
        let token = CancelToken::new();
        let count = Arc::new(AtomicUsize::new(0));

        let c = Arc::clone(&count);
        let _registration = token.on_cancel(move |reason| {
            assert_eq!(reason, "stop");
            c.fetch_add(1, Ordering::SeqCst);
        });

        token.cancel("stop");
        assert_eq!(count.load(Ordering::SeqCst), 1);

        // Cancelling again does not refire.
        token.cancel("again");
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn late_listener_fires_immediately() {
        let token = CancelToken::new();
        token.cancel("done");

        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let _registration = token.on_cancel(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unregistered_listener_never_fires() {
        let token = CancelToken::new();
        let count = Arc::new(AtomicUsize::new(0));

        let c = Arc::clone(&count);
        let registration = token.on_cancel(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        registration.unregister();

        token.cancel("stop");
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn listener_count_tracks_registration_and_removal() {
        let parent = CancelToken::new();
        assert_eq!(parent.listener_count(), 0);

        let per_request = CancelToken::new();
        let link = per_request.link(&parent);
        assert_eq!(parent.listener_count(), 1);

        link.unregister();
        assert_eq!(parent.listener_count(), 0);

        // An unlinked token no longer observes the parent.
        parent.cancel("system");
        assert!(!per_request.is_cancelled());
    }

    #[test]
    fn unregister_removes_only_its_own_listener() {
        let token = CancelToken::new();
        let count = Arc::new(AtomicUsize::new(0));

        let c = Arc::clone(&count);
        let first = token.on_cancel(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        let c = Arc::clone(&count);
        let _second = token.on_cancel(move |_| {
            c.fetch_add(10, Ordering::SeqCst);
        });

        first.unregister();
        token.cancel("stop");
        assert_eq!(count.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn link_cascades_with_reason() {
        let parent = CancelToken::new();
        let child = parent.child();

        parent.cancel("system");
        assert!(child.is_cancelled());
        assert_eq!(child.reason().as_deref(), Some("system"));
    }

    #[test]
    fn child_does_not_cancel_parent() {
        let parent = CancelToken::new();
        let child = parent.child();

        child.cancel("local");
        assert!(!parent.is_cancelled());
    }

    #[test]
    fn clones_share_state() {
        let token = CancelToken::new();
        let clone = token.clone();
        token.cancel("shared");
        assert!(clone.is_cancelled());
    }

    #[tokio::test]
    async fn cancelled_future_resolves() {
        let token = CancelToken::new();
        let waiter = token.clone();

        let handle = tokio::spawn(async move { waiter.cancelled().await });
        tokio::task::yield_now().await;
        token.cancel("deadline");

        let reason = handle.await.unwrap();
        assert_eq!(reason, "deadline");
    }

    #[tokio::test]
    async fn cancelled_future_on_already_cancelled_token() {
        let token = CancelToken::new();
        token.cancel("early");
        assert_eq!(token.cancelled().await, "early");
    }
}
