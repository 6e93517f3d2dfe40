use std::sync::{Arc, Mutex, Weak};

use tokio::sync::Notify;

use crate::util::lock_unpoisoned;

/// Why a token fired. The first source to fire decides the reason carried
/// by every token derived from it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CancelReason {
    /// The caller's external cancellation handle.
    User,
    /// A per-attempt or per-racer timeout elapsed.
    Timeout,
    /// A newer call superseded this one in the debouncer.
    Debounced,
    /// A hedge racer lost the race and was pruned.
    HedgePruned,
}

#[derive(Default)]
struct TokenState {
    fired: Option<CancelReason>,
    next_listener_id: u64,
    listeners: Vec<(u64, Weak<TokenInner>)>,
}

#[derive(Default)]
struct TokenInner {
    state: Mutex<TokenState>,
    notify: Notify,
}

/// One-shot cancellation token. Fires at most once; once fired, every
/// observer sees the fired state synchronously. Derived tokens fire when
/// any of their sources fire, carrying the source's reason.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<TokenInner>,
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("CancelToken")
            .field("fired", &self.fired_reason())
            .finish()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire the token. Idempotent: the first reason wins and later calls
    /// are ignored. Propagates to every linked dependent.
    pub fn fire(&self, reason: CancelReason) {
        fire_inner(&self.inner, reason);
    }

    pub fn is_fired(&self) -> bool {
        self.fired_reason().is_some()
    }

    pub fn fired_reason(&self) -> Option<CancelReason> {
        lock_unpoisoned(&self.inner.state).fired
    }

    /// Wait until the token fires. Returns immediately if it already has.
    pub async fn cancelled(&self) -> CancelReason {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            // Register with the notifier before re-checking state; a fire
            // between the check and the await would otherwise be missed.
            notified.as_mut().enable();
            if let Some(reason) = self.fired_reason() {
                return reason;
            }
            notified.await;
        }
    }

    /// Register `dependent` to fire when this token fires. The returned
    /// guard deregisters on drop so long-lived tokens do not accumulate
    /// dead listeners.
    fn listen(&self, dependent: &CancelToken) -> ListenerGuard {
        let registration = {
            let mut state = lock_unpoisoned(&self.inner.state);
            match state.fired {
                Some(reason) => Err(reason),
                None => {
                    let id = state.next_listener_id;
                    state.next_listener_id += 1;
                    state.listeners.push((id, Arc::downgrade(&dependent.inner)));
                    Ok(id)
                }
            }
        };
        match registration {
            Ok(id) => ListenerGuard {
                source: Arc::downgrade(&self.inner),
                id: Some(id),
            },
            Err(reason) => {
                dependent.fire(reason);
                ListenerGuard {
                    source: Weak::new(),
                    id: None,
                }
            }
        }
    }

    /// Compose a token over any number of sources. The produced token
    /// fires when the first source fires, with that source's reason; a
    /// source already fired at compose time yields a pre-fired token.
    /// Dropping the result releases every listener registration.
    pub fn compose<'a>(sources: impl IntoIterator<Item = &'a CancelToken>) -> LinkedToken {
        let token = CancelToken::new();
        let links = sources
            .into_iter()
            .map(|source| source.listen(&token))
            .collect();
        LinkedToken {
            token,
            _links: links,
        }
    }

    /// A single-source composition.
    pub fn child(&self) -> LinkedToken {
        Self::compose([self])
    }
}

fn fire_inner(inner: &Arc<TokenInner>, reason: CancelReason) {
    let listeners = {
        let mut state = lock_unpoisoned(&inner.state);
        if state.fired.is_some() {
            return;
        }
        state.fired = Some(reason);
        std::mem::take(&mut state.listeners)
    };
    inner.notify.notify_waiters();
    for (_, dependent) in listeners {
        if let Some(dependent) = dependent.upgrade() {
            fire_inner(&dependent, reason);
        }
    }
}

/// A composed token together with its listener registrations. Keep it
/// alive for as long as the composition should observe its sources.
pub struct LinkedToken {
    token: CancelToken,
    _links: Vec<ListenerGuard>,
}

impl LinkedToken {
    pub fn token(&self) -> &CancelToken {
        &self.token
    }
}

impl std::ops::Deref for LinkedToken {
    type Target = CancelToken;

    fn deref(&self) -> &CancelToken {
        &self.token
    }
}

struct ListenerGuard {
    source: Weak<TokenInner>,
    id: Option<u64>,
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        let Some(id) = self.id else {
            return;
        };
        if let Some(source) = self.source.upgrade() {
            let mut state = lock_unpoisoned(&source.state);
            state.listeners.retain(|(listener_id, _)| *listener_id != id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{CancelReason, CancelToken};

    #[test]
    fn first_reason_wins() {
        let token = CancelToken::new();
        token.fire(CancelReason::Timeout);
        token.fire(CancelReason::User);
        assert_eq!(token.fired_reason(), Some(CancelReason::Timeout));
    }

    #[test]
    fn composed_token_inherits_reason_from_first_source() {
        let user = CancelToken::new();
        let timeout = CancelToken::new();
        let combined = CancelToken::compose([&user, &timeout]);
        assert!(!combined.is_fired());

        timeout.fire(CancelReason::Timeout);
        assert_eq!(combined.fired_reason(), Some(CancelReason::Timeout));

        user.fire(CancelReason::User);
        assert_eq!(combined.fired_reason(), Some(CancelReason::Timeout));
    }

    #[test]
    fn composing_over_fired_source_yields_prefired_token() {
        let source = CancelToken::new();
        source.fire(CancelReason::Debounced);
        let combined = CancelToken::compose([&source]);
        assert_eq!(combined.fired_reason(), Some(CancelReason::Debounced));
    }

    #[test]
    fn dropping_composition_releases_listener() {
        let source = CancelToken::new();
        {
            let _combined = source.child();
        }
        // The guard is gone; firing must not panic or leak.
        source.fire(CancelReason::User);
        assert_eq!(source.fired_reason(), Some(CancelReason::User));
    }

    #[tokio::test]
    async fn cancelled_wakes_waiters() {
        let token = CancelToken::new();
        let waiter = token.clone();
        let join = tokio::spawn(async move { waiter.cancelled().await });
        tokio::task::yield_now().await;
        token.fire(CancelReason::User);
        let reason = join.await.expect("waiter task should complete");
        assert_eq!(reason, CancelReason::User);
    }

    #[tokio::test]
    async fn cancelled_returns_immediately_when_already_fired() {
        let token = CancelToken::new();
        token.fire(CancelReason::Timeout);
        assert_eq!(token.cancelled().await, CancelReason::Timeout);
    }
}
