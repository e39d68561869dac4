//! Expiring key/value cache with single-flight computation.
//!
//! An entry is a value plus an optional expiration instant. While a value is
//! being computed the cache holds an in-flight placeholder, so concurrent
//! callers of [`ExpiringCache::get_or_compute`] for the same key share one
//! computation instead of starting their own.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, TimeDelta, Utc};
use futures::FutureExt as _;
use futures::future::{BoxFuture, Shared};

use crate::error::{OperatorError, SharedError};

pub const KEY_SEPARATOR: &str = "##";

/// Cache key: a single string or an ordered tuple of strings joined by
/// [`KEY_SEPARATOR`]. Parts must not contain the separator themselves.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn single(key: impl Into<String>) -> Result<Self, OperatorError> {
        let key = key.into();
        check_part(&key)?;
        Ok(Self(key))
    }

    pub fn compound<I, S>(parts: I) -> Result<Self, OperatorError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut joined = String::new();
        for (index, part) in parts.into_iter().enumerate() {
            let part = part.as_ref();
            check_part(part)?;
            if index > 0 {
                joined.push_str(KEY_SEPARATOR);
            }
            joined.push_str(part);
        }
        Ok(Self(joined))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn check_part(part: &str) -> Result<(), OperatorError> {
    if part.contains(KEY_SEPARATOR) {
        return Err(OperatorError::InvalidCacheKey {
            part: part.to_string(),
            separator: KEY_SEPARATOR,
        });
    }
    Ok(())
}

#[derive(Clone, Debug)]
struct Stored<V> {
    value: V,
    expires_at: Option<DateTime<Utc>>,
}

impl<V> Stored<V> {
    fn is_fresh(&self, now: DateTime<Utc>, safety_gap: TimeDelta) -> bool {
        match self.expires_at {
            None => true,
            Some(expires_at) => now + safety_gap <= expires_at,
        }
    }
}

type Computation<V> = Shared<BoxFuture<'static, Result<Stored<V>, SharedError>>>;

enum Slot<V> {
    InFlight {
        generation: u64,
        computation: Computation<V>,
    },
    Ready(Stored<V>),
}

pub struct ExpiringCache<V> {
    slots: Mutex<HashMap<CacheKey, Slot<V>>>,
    safety_gap: TimeDelta,
    next_generation: AtomicU64,
}

impl<V> Default for ExpiringCache<V> {
    fn default() -> Self {
        Self::new(TimeDelta::zero())
    }
}

impl<V> ExpiringCache<V> {
    /// `safety_gap` is subtracted from every expiration: an entry expiring at
    /// `T` is served up to and including `T - safety_gap`.
    pub fn new(safety_gap: TimeDelta) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            safety_gap,
            next_generation: AtomicU64::new(0),
        }
    }

    pub fn safety_gap(&self) -> TimeDelta {
        self.safety_gap
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<CacheKey, Slot<V>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn delete(&self, key: &CacheKey) -> bool {
        self.slots().remove(key).is_some()
    }

    pub fn clear(&self) {
        self.slots().clear();
    }

    /// Number of ready or in-flight entries, expired ones included.
    pub fn len(&self) -> usize {
        self.slots().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots().is_empty()
    }

    pub fn set(&self, key: CacheKey, expires_at: Option<DateTime<Utc>>, value: V) {
        self.slots()
            .insert(key, Slot::Ready(Stored { value, expires_at }));
    }

    /// True when a computed, non-expired value is stored. In-flight
    /// computations do not count.
    pub fn has(&self, key: &CacheKey) -> bool {
        self.has_at(key, Utc::now())
    }

    pub fn has_at(&self, key: &CacheKey, now: DateTime<Utc>) -> bool {
        matches!(
            self.slots().get(key),
            Some(Slot::Ready(stored)) if stored.is_fresh(now, self.safety_gap)
        )
    }
}

impl<V> ExpiringCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn get(&self, key: &CacheKey) -> Option<V> {
        self.get_at(key, Utc::now())
    }

    pub fn get_at(&self, key: &CacheKey, now: DateTime<Utc>) -> Option<V> {
        match self.slots().get(key) {
            Some(Slot::Ready(stored)) if stored.is_fresh(now, self.safety_gap) => {
                Some(stored.value.clone())
            }
            _ => None,
        }
    }

    pub async fn get_or_compute<F, Fut>(&self, key: CacheKey, compute: F) -> Result<V, SharedError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<(V, Option<DateTime<Utc>>)>> + Send + 'static,
    {
        self.get_or_compute_at(key, Utc::now(), compute).await
    }

    /// Return the fresh value for `key`, joining an in-flight computation if
    /// one exists, or start `compute`. A failed computation records nothing
    /// and its error is returned to every caller that awaited it.
    pub async fn get_or_compute_at<F, Fut>(
        &self,
        key: CacheKey,
        now: DateTime<Utc>,
        compute: F,
    ) -> Result<V, SharedError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<(V, Option<DateTime<Utc>>)>> + Send + 'static,
    {
        let (generation, computation) = {
            let mut slots = self.slots();
            let joined = match slots.get(&key) {
                Some(Slot::Ready(stored)) if stored.is_fresh(now, self.safety_gap) => {
                    tracing::trace!(key = %key, "cache hit");
                    return Ok(stored.value.clone());
                }
                Some(Slot::InFlight {
                    generation,
                    computation,
                }) => Some((*generation, computation.clone())),
                _ => None,
            };
            match joined {
                Some(flight) => {
                    tracing::trace!(key = %key, "joining in-flight computation");
                    flight
                }
                None => {
                    tracing::trace!(key = %key, "cache miss");
                    let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
                    // `compute` runs on first poll, outside the lock.
                    let computation = async move {
                        let (value, expires_at) = compute().await.map_err(SharedError::new)?;
                        Ok::<_, SharedError>(Stored { value, expires_at })
                    }
                    .boxed()
                    .shared();
                    slots.insert(
                        key.clone(),
                        Slot::InFlight {
                            generation,
                            computation: computation.clone(),
                        },
                    );
                    (generation, computation)
                }
            }
        };

        let outcome = computation.await;

        let mut slots = self.slots();
        let owns_slot = matches!(
            slots.get(&key),
            Some(Slot::InFlight { generation: current, .. }) if *current == generation
        );
        if owns_slot {
            match &outcome {
                Ok(stored) => {
                    slots.insert(key, Slot::Ready(stored.clone()));
                }
                Err(_) => {
                    slots.remove(&key);
                }
            }
        }
        outcome.map(|stored| stored.value)
    }
}
