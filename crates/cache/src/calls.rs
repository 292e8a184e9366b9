//! Reference-counted single-flight call memoization

use crate::context::CallContext;
use crate::{Error, Result};
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Future returned by lifecycle callbacks.
pub type CallbackFuture = BoxFuture<'static, Result<()>>;

/// Called whenever the value is returned from the cache, hit or miss.
pub type PostCallFn = Arc<dyn Fn() -> CallbackFuture + Send + Sync>;

/// Called when the value's entry is dropped from the cache.
pub type OnReleaseFn = Arc<dyn Fn() -> CallbackFuture + Send + Sync>;

/// A computed value bundled with optional lifecycle callbacks.
///
/// Callbacks are supplied by the computation, not the caller: the computation
/// knows what teardown its value needs, callers only balance references.
pub struct ValueWithCallbacks<V> {
    /// The actual value to cache
    pub value: V,
    /// If set, called whenever the value is returned from the cache
    pub post_call: Option<PostCallFn>,
    /// If set, called when the value is removed from the cache
    pub on_release: Option<OnReleaseFn>,
}

impl<V> ValueWithCallbacks<V> {
    /// Wrap a bare value with no callbacks.
    #[must_use]
    pub fn bare(value: V) -> Self {
        Self {
            value,
            post_call: None,
            on_release: None,
        }
    }
}

static NEXT_CACHE_ID: AtomicU64 = AtomicU64::new(1);

/// Concurrency-safe, reference-counted, single-flight memoizing cache.
///
/// At most one computation runs per key at a time (unless a caller opts out
/// of deduplication); concurrent callers for the same key join the in-flight
/// computation and all observe the same result. Completed entries are kept
/// until every holder has called [`CacheResult::release`].
///
/// Cloning the handle shares the underlying cache.
pub struct Cache<K, V> {
    id: u64,
    state: Arc<Mutex<State<K, V>>>,
}

impl<K, V> Clone for Cache<K, V> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            state: self.state.clone(),
        }
    }
}

struct State<K, V> {
    /// calls in progress, joinable by future callers for the same key
    ongoing: HashMap<K, Arc<Entry<V>>>,
    /// calls that completed successfully and are retained by references
    completed: HashMap<K, Arc<Entry<V>>>,
}

struct Entry<V> {
    /// fires once the computation has settled; `outcome` is set before this
    done: CancellationToken,
    /// the computation context's token; fires when the last waiter departs
    abandon: CancellationToken,
    outcome: OnceLock<Outcome<V>>,
    /// callers currently blocked on settlement; mutated under the cache lock
    waiters: AtomicUsize,
    /// callers holding the completed result; mutated under the cache lock
    refcount: AtomicUsize,
}

enum Outcome<V> {
    Ok(Settled<V>),
    Err(Error),
}

struct Settled<V> {
    value: V,
    post_call: Option<PostCallFn>,
    on_release: Option<OnReleaseFn>,
}

impl<V> Entry<V> {
    fn ongoing() -> Arc<Self> {
        Arc::new(Self {
            done: CancellationToken::new(),
            abandon: CancellationToken::new(),
            outcome: OnceLock::new(),
            // the initiating caller counts as the first waiter
            waiters: AtomicUsize::new(1),
            refcount: AtomicUsize::new(0),
        })
    }

    fn settled(resolved: ValueWithCallbacks<V>) -> Arc<Self> {
        let entry = Self {
            done: CancellationToken::new(),
            abandon: CancellationToken::new(),
            outcome: OnceLock::new(),
            waiters: AtomicUsize::new(0),
            refcount: AtomicUsize::new(0),
        };
        let _ = entry.outcome.set(Outcome::Ok(Settled {
            value: resolved.value,
            post_call: resolved.post_call,
            on_release: resolved.on_release,
        }));
        entry.done.cancel();
        Arc::new(entry)
    }
}

fn lock<K, V>(state: &Arc<Mutex<State<K, V>>>) -> MutexGuard<'_, State<K, V>> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

fn evict<K: Eq + Hash, V>(st: &mut State<K, V>, key: &K, entry: &Arc<Entry<V>>) {
    if st.ongoing.get(key).is_some_and(|e| Arc::ptr_eq(e, entry)) {
        st.ongoing.remove(key);
    }
    if st.completed.get(key).is_some_and(|e| Arc::ptr_eq(e, entry)) {
        st.completed.remove(key);
    }
}

/// Decrements the waiter count even when a caller's future is dropped
/// mid-wait, so an unwatched computation is still abandoned and an
/// unreferenced entry still evicted.
struct WaiterGuard<K: Eq + Hash, V> {
    state: Arc<Mutex<State<K, V>>>,
    key: K,
    entry: Arc<Entry<V>>,
    armed: bool,
}

impl<K: Eq + Hash, V> Drop for WaiterGuard<K, V> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut st = lock(&self.state);
        let remaining = self.entry.waiters.fetch_sub(1, Ordering::Relaxed) - 1;
        if remaining == 0 {
            if !self.entry.done.is_cancelled() {
                debug!("no waiters remain; abandoning in-flight computation");
            }
            self.entry.abandon.cancel();
            if self.entry.refcount.load(Ordering::Relaxed) == 0 {
                evict(&mut st, &self.key, &self.entry);
            }
        }
    }
}

impl<K, V> Default for Cache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> Cache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self {
            id: NEXT_CACHE_ID.fetch_add(1, Ordering::Relaxed),
            state: Arc::new(Mutex::new(State {
                ongoing: HashMap::new(),
                completed: HashMap::new(),
            })),
        }
    }

    /// Number of tracked entries (ongoing and completed).
    #[must_use]
    pub fn size(&self) -> usize {
        let st = lock(&self.state);
        st.ongoing.len() + st.completed.len()
    }

    /// Return the cached result for `key` or initialize it with `f`.
    ///
    /// `key == None` bypasses the cache entirely: no deduplication, no
    /// storage, every call computes fresh on the caller's own context.
    pub async fn get_or_initialize<F, Fut>(
        &self,
        ctx: &CallContext,
        key: Option<K>,
        f: F,
    ) -> Result<CacheResult<K, V>>
    where
        F: FnOnce(CallContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<V>> + Send + 'static,
    {
        self.get_or_initialize_with_callbacks(ctx, key, false, move |cctx| {
            let fut = f(cctx);
            async move { Ok(ValueWithCallbacks::bare(fut.await?)) }
        })
        .await
    }

    /// Return the cached result for `key` or initialize it with the given
    /// pre-computed value.
    pub async fn get_or_initialize_value(
        &self,
        ctx: &CallContext,
        key: Option<K>,
        value: V,
    ) -> Result<CacheResult<K, V>> {
        self.get_or_initialize(ctx, key, move |_| async move { Ok(value) })
            .await
    }

    /// As [`Cache::get_or_initialize`], but the computation resolves to a
    /// [`ValueWithCallbacks`], and `skip_dedupe` suppresses joining an
    /// in-flight computation: a fresh one is started and run independently,
    /// still subject to the recursion guard.
    pub async fn get_or_initialize_with_callbacks<F, Fut>(
        &self,
        ctx: &CallContext,
        key: Option<K>,
        skip_dedupe: bool,
        f: F,
    ) -> Result<CacheResult<K, V>>
    where
        F: FnOnce(CallContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<ValueWithCallbacks<V>>> + Send + 'static,
    {
        let Some(key) = key else {
            // Explicit bypass: run on the caller's own context, index nothing.
            let resolved = f(ctx.clone()).await?;
            return Ok(CacheResult {
                slot: None,
                entry: Entry::settled(resolved),
                hit_cache: false,
            });
        };

        if ctx.is_active(self.id, &key) {
            return Err(Error::RecursiveCall);
        }

        enum Action<V> {
            Hit(Arc<Entry<V>>),
            Join(Arc<Entry<V>>),
            Start(Arc<Entry<V>>, CallContext),
        }

        let action = {
            let mut st = lock(&self.state);
            if let Some(entry) = st.completed.get(&key) {
                entry.refcount.fetch_add(1, Ordering::Relaxed);
                Action::Hit(entry.clone())
            } else if let Some(entry) =
                (!skip_dedupe).then(|| st.ongoing.get(&key)).flatten()
            {
                entry.waiters.fetch_add(1, Ordering::Relaxed);
                Action::Join(entry.clone())
            } else {
                let entry = Entry::ongoing();
                if !skip_dedupe {
                    st.ongoing.insert(key.clone(), entry.clone());
                }
                let compute_ctx =
                    ctx.for_computation(self.id, key.clone(), entry.abandon.clone());
                Action::Start(entry, compute_ctx)
            }
        };

        match action {
            Action::Hit(entry) => Ok(CacheResult {
                slot: Some((self.state.clone(), key)),
                entry,
                hit_cache: true,
            }),
            Action::Join(entry) => self.wait(ctx, key, entry).await,
            Action::Start(entry, compute_ctx) => {
                let task_entry = entry.clone();
                tokio::spawn(async move {
                    let outcome = match f(compute_ctx).await {
                        Ok(resolved) => Outcome::Ok(Settled {
                            value: resolved.value,
                            post_call: resolved.post_call,
                            on_release: resolved.on_release,
                        }),
                        Err(err) => Outcome::Err(err),
                    };
                    let _ = task_entry.outcome.set(outcome);
                    task_entry.done.cancel();
                });
                let mut res = self.wait(ctx, key, entry).await?;
                // the initiating caller is never a cache hit, even when the
                // computation finished before its first poll
                res.hit_cache = false;
                Ok(res)
            }
        }
    }

    async fn wait(
        &self,
        ctx: &CallContext,
        key: K,
        entry: Arc<Entry<V>>,
    ) -> Result<CacheResult<K, V>> {
        let mut guard = WaiterGuard {
            state: self.state.clone(),
            key: key.clone(),
            entry: entry.clone(),
            armed: true,
        };

        // a call that finds the entry already settled counts as a hit even
        // though this particular waiter never blocked
        let (hit, wait_err) = if entry.done.is_cancelled() {
            (true, None)
        } else {
            tokio::select! {
                () = entry.done.cancelled() => (false, None),
                () = ctx.canceled() => (false, Some(Error::Canceled)),
            }
        };

        let err = match wait_err {
            Some(e) => Some(e),
            None => match entry.outcome.get() {
                Some(Outcome::Ok(_)) => None,
                Some(Outcome::Err(e)) => Some(e.clone()),
                // the computation task stopped without settling
                None => Some(Error::compute(
                    "cached computation terminated without settling",
                )),
            },
        };

        guard.armed = false;
        let mut st = lock(&self.state);
        let remaining = entry.waiters.fetch_sub(1, Ordering::Relaxed) - 1;
        if remaining == 0 {
            if !entry.done.is_cancelled() {
                debug!("no waiters remain; abandoning in-flight computation");
            }
            entry.abandon.cancel();
        }

        match err {
            None => {
                if st.ongoing.get(&key).is_some_and(|e| Arc::ptr_eq(e, &entry)) {
                    st.ongoing.remove(&key);
                }
                // promote into the completed index, or adopt the entry a
                // concurrent call promoted first
                let chosen = match st.completed.get(&key) {
                    Some(existing) => existing.clone(),
                    None => {
                        st.completed.insert(key.clone(), entry.clone());
                        entry
                    }
                };
                chosen.refcount.fetch_add(1, Ordering::Relaxed);
                drop(st);
                Ok(CacheResult {
                    slot: Some((self.state.clone(), key)),
                    entry: chosen,
                    hit_cache: hit,
                })
            }
            Some(err) => {
                if remaining == 0 && entry.refcount.load(Ordering::Relaxed) == 0 {
                    // failed and unreferenced; drop it so the next call
                    // starts a clean attempt
                    evict(&mut st, &key, &entry);
                }
                Err(err)
            }
        }
    }
}

/// Handle to a settled cache entry held by one caller.
///
/// Each successful `get_or_initialize*` return holds one reference; callers
/// must balance it with exactly one [`CacheResult::release`]. Dropping a
/// result without releasing leaks the entry until process exit.
pub struct CacheResult<K, V> {
    /// index slot this result counts against; `None` for bypass results
    slot: Option<(Arc<Mutex<State<K, V>>>, K)>,
    entry: Arc<Entry<V>>,
    hit_cache: bool,
}

impl<K, V> std::fmt::Debug for CacheResult<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheResult")
            .field("hit_cache", &self.hit_cache)
            .finish_non_exhaustive()
    }
}

impl<K, V> CacheResult<K, V>
where
    K: Eq + Hash,
{
    /// The computed value.
    #[must_use]
    pub fn value(&self) -> &V {
        match self.entry.outcome.get() {
            Some(Outcome::Ok(settled)) => &settled.value,
            _ => unreachable!("cache results are only constructed from settled entries"),
        }
    }

    /// Whether this call observed an already-settled entry.
    #[must_use]
    pub fn hit_cache(&self) -> bool {
        self.hit_cache
    }

    /// Run the computation's post-call hook, if any.
    pub async fn post_call(&self) -> Result<()> {
        let cb = match self.entry.outcome.get() {
            Some(Outcome::Ok(settled)) => settled.post_call.clone(),
            _ => None,
        };
        match cb {
            Some(cb) => cb().await,
            None => Ok(()),
        }
    }

    /// Release this caller's reference.
    ///
    /// When the reference and waiter counts both reach zero the entry is
    /// dropped from the cache and its `on_release` hook runs, outside the
    /// cache lock. Results from bypass calls release as a no-op.
    pub async fn release(self) -> Result<()> {
        let Some((state, key)) = &self.slot else {
            return Ok(());
        };
        let on_release = {
            let mut st = lock(state);
            let remaining = self.entry.refcount.fetch_sub(1, Ordering::Relaxed) - 1;
            if remaining == 0 && self.entry.waiters.load(Ordering::Relaxed) == 0 {
                evict(&mut st, key, &self.entry);
                match self.entry.outcome.get() {
                    Some(Outcome::Ok(settled)) => settled.on_release.clone(),
                    _ => None,
                }
            } else {
                None
            }
        };
        match on_release {
            Some(cb) => cb().await,
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::oneshot;

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_calls_compute_once() {
        let cache: Cache<String, usize> = Cache::new();
        let computed = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..50 {
            let cache = cache.clone();
            let computed = computed.clone();
            handles.push(tokio::spawn(async move {
                let ctx = CallContext::new();
                cache
                    .get_or_initialize(&ctx, Some("answer".to_string()), move |_| async move {
                        computed.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        Ok(42)
                    })
                    .await
            }));
        }

        for handle in handles {
            let res = handle.await.expect("join").expect("call");
            assert_eq!(*res.value(), 42);
        }
        assert_eq!(computed.load(Ordering::SeqCst), 1);
        assert_eq!(cache.size(), 1);
    }

    #[tokio::test]
    async fn failed_computations_are_not_cached() {
        let cache: Cache<&str, i32> = Cache::new();
        let ctx = CallContext::new();

        let err = cache
            .get_or_initialize(&ctx, Some("k"), |_| async { Err(Error::compute("nope")) })
            .await
            .expect_err("first call fails");
        assert_eq!(err, Error::compute("nope"));

        let err = cache
            .get_or_initialize(&ctx, Some("k"), |_| async { Err(Error::compute("nope 2")) })
            .await
            .expect_err("second call fails with its own error");
        assert_eq!(err, Error::compute("nope 2"));

        let res = cache
            .get_or_initialize(&ctx, Some("k"), |_| async { Ok(1) })
            .await
            .expect("third call succeeds");
        assert_eq!(*res.value(), 1);

        let res = cache
            .get_or_initialize(&ctx, Some("k"), |_| async { Err(Error::compute("ignored")) })
            .await
            .expect("cached success wins");
        assert_eq!(*res.value(), 1);
        assert!(res.hit_cache());
    }

    #[tokio::test]
    async fn recursive_self_call_fails_fast() {
        let cache: Cache<&str, i32> = Cache::new();
        let ctx = CallContext::new();

        let inner = cache.clone();
        let err = cache
            .get_or_initialize(&ctx, Some("k"), move |cctx| async move {
                inner
                    .get_or_initialize(&cctx, Some("k"), |_| async { Ok(2) })
                    .await
                    .map(|r| *r.value())
            })
            .await
            .expect_err("self-referential call must fail");
        assert_eq!(err, Error::RecursiveCall);
    }

    #[tokio::test]
    async fn recursion_on_other_keys_and_caches_is_legal() {
        let cache: Cache<&str, i32> = Cache::new();
        let ctx = CallContext::new();

        let inner = cache.clone();
        let res = cache
            .get_or_initialize(&ctx, Some("outer"), move |cctx| async move {
                let r = inner
                    .get_or_initialize(&cctx, Some("nested"), |_| async { Ok(12) })
                    .await?;
                Ok(*r.value())
            })
            .await
            .expect("nested call for a different key");
        assert_eq!(*res.value(), 12);

        let other: Cache<&str, i32> = Cache::new();
        let res = cache
            .get_or_initialize(&ctx, Some("shared"), move |cctx| async move {
                let r = other
                    .get_or_initialize(&cctx, Some("shared"), |_| async { Ok(101) })
                    .await?;
                Ok(*r.value())
            })
            .await
            .expect("same key on a different cache instance");
        assert_eq!(*res.value(), 101);
    }

    #[tokio::test]
    async fn cancellation_only_affects_the_canceling_caller() {
        let cache: Cache<&str, i32> = Cache::new();
        let (started_tx, started_rx) = oneshot::channel();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();

        let c1 = cache.clone();
        let h1 = tokio::spawn(async move {
            c1.get_or_initialize(&CallContext::new(), Some("k"), move |_| async move {
                let _ = started_tx.send(());
                let _ = stop_rx.await;
                Ok(7)
            })
            .await
        });
        started_rx.await.expect("computation started");

        let cancel2 = CancellationToken::new();
        let ctx2 = CallContext::with_cancellation(cancel2.clone());
        let c2 = cache.clone();
        let h2 = tokio::spawn(async move {
            c2.get_or_initialize(&ctx2, Some("k"), |_| async { Ok(0) })
                .await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        cancel2.cancel();
        let err = h2.await.expect("join").expect_err("canceled caller errors");
        assert_eq!(err, Error::Canceled);
        assert!(!h1.is_finished(), "computation must survive for the remaining caller");

        let _ = stop_tx.send(());
        let res = h1.await.expect("join").expect("surviving caller succeeds");
        assert_eq!(*res.value(), 7);
        assert!(!res.hit_cache());
    }

    #[tokio::test]
    async fn computation_abandoned_after_last_waiter_departs() {
        let cache: Cache<&str, i32> = Cache::new();
        let (started_tx, started_rx) = oneshot::channel();
        let (abandoned_tx, abandoned_rx) = oneshot::channel();

        let cancel = CancellationToken::new();
        let ctx = CallContext::with_cancellation(cancel.clone());
        let c = cache.clone();
        let handle = tokio::spawn(async move {
            c.get_or_initialize(&ctx, Some("k"), move |cctx| async move {
                let _ = started_tx.send(());
                cctx.canceled().await;
                let _ = abandoned_tx.send(());
                Err(Error::compute("abandoned"))
            })
            .await
        });
        started_rx.await.expect("computation started");

        cancel.cancel();
        let err = handle.await.expect("join").expect_err("caller sees its own cancellation");
        assert_eq!(err, Error::Canceled);
        abandoned_rx
            .await
            .expect("computation context canceled once the last waiter left");
        assert_eq!(cache.size(), 0);
    }

    #[tokio::test]
    async fn release_is_reference_counted() {
        let cache: Cache<&str, i32> = Cache::new();
        let ctx = CallContext::new();
        let released = Arc::new(AtomicUsize::new(0));

        let hook = released.clone();
        let res1 = cache
            .get_or_initialize_with_callbacks(&ctx, Some("k"), false, move |_| async move {
                Ok(ValueWithCallbacks {
                    value: 1,
                    post_call: None,
                    on_release: Some(Arc::new(move || {
                        let hook = hook.clone();
                        Box::pin(async move {
                            hook.fetch_add(1, Ordering::SeqCst);
                            Ok(())
                        })
                    })),
                })
            })
            .await
            .expect("initialize");
        let res2 = cache
            .get_or_initialize(&ctx, Some("k"), |_| async { Ok(1) })
            .await
            .expect("hit");
        assert!(res2.hit_cache());
        assert_eq!(cache.size(), 1);

        res1.release().await.expect("first release");
        assert_eq!(released.load(Ordering::SeqCst), 0, "entry still referenced");
        assert_eq!(cache.size(), 1);

        res2.release().await.expect("last release");
        assert_eq!(released.load(Ordering::SeqCst), 1, "hook fires exactly once");
        assert_eq!(cache.size(), 0);
    }

    #[tokio::test]
    async fn on_release_errors_propagate() {
        let cache: Cache<&str, i32> = Cache::new();
        let ctx = CallContext::new();

        let res = cache
            .get_or_initialize_with_callbacks(&ctx, Some("k"), false, |_| async {
                Ok(ValueWithCallbacks {
                    value: 2,
                    post_call: None,
                    on_release: Some(Arc::new(|| {
                        Box::pin(async { Err(Error::compute("oh no")) })
                    })),
                })
            })
            .await
            .expect("initialize");

        let err = res.release().await.expect_err("hook failure surfaces");
        assert_eq!(err, Error::compute("oh no"));
    }

    #[tokio::test]
    async fn post_call_runs_on_every_return() {
        let cache: Cache<&str, i32> = Cache::new();
        let ctx = CallContext::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let hook = calls.clone();
        let res = cache
            .get_or_initialize_with_callbacks(&ctx, Some("k"), false, move |_| async move {
                Ok(ValueWithCallbacks {
                    value: 3,
                    post_call: Some(Arc::new(move || {
                        let hook = hook.clone();
                        Box::pin(async move {
                            hook.fetch_add(1, Ordering::SeqCst);
                            Ok(())
                        })
                    })),
                    on_release: None,
                })
            })
            .await
            .expect("initialize");

        res.post_call().await.expect("post call");
        res.post_call().await.expect("post call again");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn skip_dedupe_runs_computations_independently() {
        let cache: Cache<&str, i32> = Cache::new();
        let (started1_tx, started1_rx) = oneshot::channel();
        let (go1_tx, go1_rx) = oneshot::channel::<()>();
        let (started2_tx, started2_rx) = oneshot::channel();
        let (go2_tx, go2_rx) = oneshot::channel::<()>();

        let c1 = cache.clone();
        let h1 = tokio::spawn(async move {
            c1.get_or_initialize_with_callbacks(
                &CallContext::new(),
                Some("k"),
                true,
                move |_| async move {
                    let _ = started1_tx.send(());
                    let _ = go1_rx.await;
                    Ok(ValueWithCallbacks::bare(1))
                },
            )
            .await
        });
        let c2 = cache.clone();
        let h2 = tokio::spawn(async move {
            c2.get_or_initialize_with_callbacks(
                &CallContext::new(),
                Some("k"),
                true,
                move |_| async move {
                    let _ = started2_tx.send(());
                    let _ = go2_rx.await;
                    Ok(ValueWithCallbacks::bare(2))
                },
            )
            .await
        });

        // both computations are in flight at once: no deduplication happened
        started1_rx.await.expect("first computation started");
        started2_rx.await.expect("second computation started");
        let _ = go1_tx.send(());
        let _ = go2_tx.send(());

        h1.await.expect("join").expect("first call succeeds");
        h2.await.expect("join").expect("second call succeeds");
        assert_eq!(cache.size(), 1, "one entry wins the completed index");
    }

    #[tokio::test]
    async fn bypass_key_always_computes() {
        let cache: Cache<String, i32> = Cache::new();
        let ctx = CallContext::new();
        let computed = Arc::new(AtomicUsize::new(0));

        for want in [1, 2] {
            let computed = computed.clone();
            let res = cache
                .get_or_initialize(&ctx, None, move |_| async move {
                    computed.fetch_add(1, Ordering::SeqCst);
                    Ok(want)
                })
                .await
                .expect("bypass call");
            assert_eq!(*res.value(), want);
            assert!(!res.hit_cache());
            res.release().await.expect("bypass release is a no-op");
        }
        assert_eq!(computed.load(Ordering::SeqCst), 2);
        assert_eq!(cache.size(), 0);
    }

    #[tokio::test]
    async fn precomputed_values_are_cached() {
        let cache: Cache<&str, i32> = Cache::new();
        let ctx = CallContext::new();

        let first = cache
            .get_or_initialize_value(&ctx, Some("k"), 9)
            .await
            .expect("store");
        assert!(!first.hit_cache());

        let second = cache
            .get_or_initialize_value(&ctx, Some("k"), 10)
            .await
            .expect("hit");
        assert!(second.hit_cache());
        assert_eq!(*second.value(), 9);
    }
}
