//! Non-expiring single-flight memoization.

use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};

use futures::FutureExt as _;
use futures::future::{BoxFuture, Shared};

use crate::error::SharedError;
use crate::expiring_cache::{CacheKey, ExpiringCache};

/// Keyed memoization: every key is computed at most once unless the
/// computation fails.
pub struct MemoCache<V> {
    inner: ExpiringCache<V>,
}

impl<V> Default for MemoCache<V> {
    fn default() -> Self {
        Self {
            inner: ExpiringCache::default(),
        }
    }
}

impl<V> MemoCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &CacheKey) -> Option<V> {
        self.inner.get(key)
    }

    pub fn has(&self, key: &CacheKey) -> bool {
        self.inner.has(key)
    }

    pub fn set(&self, key: CacheKey, value: V) {
        self.inner.set(key, None, value);
    }

    pub fn delete(&self, key: &CacheKey) -> bool {
        self.inner.delete(key)
    }

    pub fn clear(&self) {
        self.inner.clear();
    }

    pub async fn get_or_compute<F, Fut>(&self, key: CacheKey, compute: F) -> Result<V, SharedError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<V>> + Send + 'static,
    {
        self.inner
            .get_or_compute(key, move || async move {
                Ok::<_, anyhow::Error>((compute().await?, None))
            })
            .await
    }
}

type Flight<T> = Shared<BoxFuture<'static, Result<T, SharedError>>>;

struct OnceState<T> {
    in_flight: Option<Flight<T>>,
    result: Option<T>,
}

/// A single memoized value with no key, e.g. the app listing of a space.
pub struct OnceFlight<T> {
    state: Mutex<OnceState<T>>,
}

impl<T> Default for OnceFlight<T> {
    fn default() -> Self {
        Self {
            state: Mutex::new(OnceState {
                in_flight: None,
                result: None,
            }),
        }
    }
}

impl<T> OnceFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, OnceState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self) -> Option<T> {
        self.state().result.clone()
    }

    pub fn reset(&self) {
        let mut state = self.state();
        state.in_flight = None;
        state.result = None;
    }

    pub async fn get_or_compute<F, Fut>(&self, compute: F) -> Result<T, SharedError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let flight = {
            let mut state = self.state();
            if let Some(result) = &state.result {
                return Ok(result.clone());
            }
            match state.in_flight.clone() {
                Some(flight) => flight,
                None => {
                    let flight = async move { compute().await.map_err(SharedError::new) }
                        .boxed()
                        .shared();
                    state.in_flight = Some(flight.clone());
                    flight
                }
            }
        };

        let outcome = flight.clone().await;

        let mut state = self.state();
        if state
            .in_flight
            .as_ref()
            .is_some_and(|current| current.ptr_eq(&flight))
        {
            state.in_flight = None;
        }
        if let Ok(value) = &outcome
            && state.result.is_none()
        {
            state.result = Some(value.clone());
        }
        outcome
    }
}
