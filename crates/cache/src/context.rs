//! Execution contexts threaded through cached calls

use std::any::Any;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Execution context for a cached call.
///
/// Carries the caller's cancellation interest plus the chain of cache calls
/// currently executing above this one. The chain is what the recursion guard
/// inspects: a call for a `(cache, key)` pair already present in its own
/// ancestry is guaranteed to deadlock and fails fast instead.
///
/// Contexts are cheap to clone; the ancestry is an immutable shared list.
#[derive(Clone, Default)]
pub struct CallContext {
    cancel: CancellationToken,
    active: Option<Arc<ActiveCall>>,
}

struct ActiveCall {
    cache_id: u64,
    key: Arc<dyn Any + Send + Sync>,
    parent: Option<Arc<ActiveCall>>,
}

impl CallContext {
    /// Create a context that is never canceled.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a context that is canceled when `token` fires.
    #[must_use]
    pub fn with_cancellation(token: CancellationToken) -> Self {
        Self {
            cancel: token,
            active: None,
        }
    }

    /// The token expressing this caller's interest.
    #[must_use]
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Whether this context has been canceled.
    #[must_use]
    pub fn is_canceled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once this context is canceled.
    pub async fn canceled(&self) {
        self.cancel.cancelled().await;
    }

    /// Whether `(cache_id, key)` is already executing in this call chain.
    pub(crate) fn is_active<K>(&self, cache_id: u64, key: &K) -> bool
    where
        K: Eq + Send + Sync + 'static,
    {
        let mut node = self.active.as_ref();
        while let Some(call) = node {
            if call.cache_id == cache_id && call.key.downcast_ref::<K>().is_some_and(|k| k == key)
            {
                return true;
            }
            node = call.parent.as_ref();
        }
        false
    }

    /// Derive the context a computation runs under: the caller's call chain
    /// plus the new marker, canceled by the entry's waiter-counted token
    /// rather than by any single caller.
    pub(crate) fn for_computation<K>(
        &self,
        cache_id: u64,
        key: K,
        cancel: CancellationToken,
    ) -> Self
    where
        K: Eq + Send + Sync + 'static,
    {
        Self {
            cancel,
            active: Some(Arc::new(ActiveCall {
                cache_id,
                key: Arc::new(key),
                parent: self.active.clone(),
            })),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marker_matches_same_cache_and_key() {
        let ctx = CallContext::new();
        let derived = ctx.for_computation(7, "k".to_string(), CancellationToken::new());
        assert!(derived.is_active(7, &"k".to_string()));
        assert!(!derived.is_active(7, &"other".to_string()));
        assert!(!derived.is_active(8, &"k".to_string()));
        assert!(!ctx.is_active(7, &"k".to_string()));
    }

    #[test]
    fn markers_accumulate_down_the_chain() {
        let ctx = CallContext::new();
        let first = ctx.for_computation(1, "a".to_string(), CancellationToken::new());
        let second = first.for_computation(1, "b".to_string(), CancellationToken::new());
        assert!(second.is_active(1, &"a".to_string()));
        assert!(second.is_active(1, &"b".to_string()));
        assert!(!first.is_active(1, &"b".to_string()));
    }

    #[test]
    fn key_types_do_not_collide() {
        let ctx = CallContext::new();
        let derived = ctx.for_computation(1, 42u64, CancellationToken::new());
        assert!(derived.is_active(1, &42u64));
        assert!(!derived.is_active(1, &"42".to_string()));
    }
}
