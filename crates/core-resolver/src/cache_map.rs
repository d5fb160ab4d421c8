// Copyright Exograph, Inc. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file at the root of this repository.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Keyed single-flight memoization.
//!
//! For any key, at most one producer runs at a time; every concurrent caller
//! observes the producer's outcome. Successful outcomes persist; failed ones
//! are published to the waiters already in line and then evicted, so the next
//! caller retries. Re-entry on the same key within one request is detected
//! through a context marker and fails fast instead of deadlocking.

use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::hash::Hash;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::watch;

use crate::request_context::{Marker, RequestContext};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("recursive call detected")]
    RecursiveCall,

    #[error("key not found")]
    NotFound,

    #[error("producer panicked")]
    ProducerPanicked,

    #[error("producer abandoned before completing")]
    ProducerAbandoned,
}

/// Hook returned by a producer alongside its value; replayed to later hits.
pub type PostCall<E> =
    Arc<dyn Fn(RequestContext) -> BoxFuture<'static, Result<(), E>> + Send + Sync>;

struct Outcome<V, E> {
    result: Result<V, E>,
    post_call: Option<PostCall<E>>,
}

impl<V: Clone, E: Clone> Clone for Outcome<V, E> {
    fn clone(&self) -> Self {
        Self {
            result: self.result.clone(),
            post_call: self.post_call.clone(),
        }
    }
}

type Slot<V, E> = watch::Receiver<Option<Outcome<V, E>>>;

enum WaitEnd<V, E> {
    Published(Outcome<V, E>),
    Abandoned,
}

static NEXT_MAP_ID: AtomicU64 = AtomicU64::new(0);

pub struct CacheMap<K, V, E> {
    id: u64,
    calls: Mutex<HashMap<K, Slot<V, E>>>,
}

impl<K, V, E> Default for CacheMap<K, V, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, E> CacheMap<K, V, E> {
    pub fn new() -> Self {
        Self {
            id: NEXT_MAP_ID.fetch_add(1, Ordering::Relaxed),
            calls: Mutex::new(HashMap::new()),
        }
    }
}

impl<K, V, E> CacheMap<K, V, E>
where
    K: Eq + Hash + Clone + Display,
    V: Clone,
    E: Clone + From<CacheError>,
{
    fn marker(&self, key: &K) -> Marker {
        Marker::new(self.id, key.to_string())
    }

    /// Return the cached value for `key`, or run `producer` to create it.
    /// The boolean is true on a hit (the producer did not run for this call).
    pub async fn get_or_initialize<F, Fut>(
        &self,
        ctx: &RequestContext,
        key: K,
        producer: F,
    ) -> Result<(V, bool), E>
    where
        F: FnOnce(RequestContext) -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        let (value, hit, _post_call) = self
            .get_or_initialize_with_post_call(ctx, key, |ctx| async move {
                producer(ctx).await.map(|value| (value, None::<PostCall<E>>))
            })
            .await?;
        Ok((value, hit))
    }

    /// As [`CacheMap::get_or_initialize`], but the producer may return a hook
    /// that is stored with the entry and handed back on every later hit.
    pub async fn get_or_initialize_with_post_call<F, Fut>(
        &self,
        ctx: &RequestContext,
        key: K,
        producer: F,
    ) -> Result<(V, bool, Option<PostCall<E>>), E>
    where
        F: FnOnce(RequestContext) -> Fut,
        Fut: Future<Output = Result<(V, Option<PostCall<E>>), E>>,
    {
        let marker = self.marker(&key);
        if ctx.has_marker(&marker) {
            return Err(CacheError::RecursiveCall.into());
        }

        // Bookkeeping only under the lock; the producer runs outside it.
        let mut publish = None;
        let waiter = {
            let mut calls = self.calls.lock();
            match calls.get(&key) {
                Some(slot) => Some(slot.clone()),
                None => {
                    let (tx, rx) = watch::channel(None);
                    calls.insert(key.clone(), rx);
                    publish = Some(tx);
                    None
                }
            }
        };

        if let Some(mut slot) = waiter {
            return match wait(&mut slot).await {
                WaitEnd::Published(outcome) => outcome
                    .result
                    .map(|value| (value, true, outcome.post_call)),
                WaitEnd::Abandoned => {
                    self.evict_abandoned(&key);
                    Err(CacheError::ProducerAbandoned.into())
                }
            };
        }

        let Some(tx) = publish else {
            // one of the two branches above always applies
            return Err(CacheError::ProducerAbandoned.into());
        };

        let child_ctx = ctx.with_marker(marker);
        let outcome = match AssertUnwindSafe(producer(child_ctx)).catch_unwind().await {
            Ok(Ok((value, post_call))) => Outcome {
                result: Ok(value),
                post_call,
            },
            Ok(Err(error)) => Outcome {
                result: Err(error),
                post_call: None,
            },
            Err(_panic) => Outcome {
                result: Err(CacheError::ProducerPanicked.into()),
                post_call: None,
            },
        };

        let returned = match &outcome {
            Outcome {
                result: Ok(value),
                post_call,
            } => Ok((value.clone(), false, post_call.clone())),
            Outcome {
                result: Err(error), ..
            } => Err(error.clone()),
        };

        let failed = outcome.result.is_err();
        let _ = tx.send(Some(outcome));
        if failed {
            // waiters already in line got the error; the next caller retries
            self.calls.lock().remove(&key);
        }

        returned
    }

    /// Seed the cache with a literal value unless an entry already exists.
    pub async fn get_or_initialize_value(
        &self,
        ctx: &RequestContext,
        key: K,
        value: V,
    ) -> Result<(V, bool), E> {
        self.get_or_initialize(ctx, key, |_ctx| async move { Ok(value) })
            .await
    }

    /// Return the stored value, waiting for a pending producer if necessary.
    pub async fn get(&self, ctx: &RequestContext, key: &K) -> Result<V, E> {
        let marker = self.marker(key);
        if ctx.has_marker(&marker) {
            return Err(CacheError::RecursiveCall.into());
        }

        let slot = self.calls.lock().get(key).cloned();
        match slot {
            Some(mut slot) => match wait(&mut slot).await {
                WaitEnd::Published(outcome) => outcome.result,
                WaitEnd::Abandoned => {
                    self.evict_abandoned(key);
                    Err(CacheError::ProducerAbandoned.into())
                }
            },
            None => Err(CacheError::NotFound.into()),
        }
    }

    /// Overwrite unconditionally, bypassing any producer.
    pub fn set(&self, key: K, value: V) {
        let (_tx, rx) = watch::channel(Some(Outcome {
            result: Ok(value),
            post_call: None,
        }));
        self.calls.lock().insert(key, rx);
    }

    pub fn keys(&self) -> Vec<K> {
        self.calls.lock().keys().cloned().collect()
    }

    /// Remove an entry whose producer vanished without publishing (its task
    /// was dropped mid-flight).
    fn evict_abandoned(&self, key: &K) {
        let mut calls = self.calls.lock();
        if let Some(slot) = calls.get(key) {
            if slot.has_changed().is_err() && slot.borrow().is_none() {
                calls.remove(key);
            }
        }
    }
}

async fn wait<V: Clone, E: Clone>(slot: &mut Slot<V, E>) -> WaitEnd<V, E> {
    match slot.wait_for(|outcome| outcome.is_some()).await {
        Ok(guard) => match guard.as_ref() {
            Some(outcome) => WaitEnd::Published(outcome.clone()),
            None => WaitEnd::Abandoned,
        },
        Err(_closed) => WaitEnd::Abandoned,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use thiserror::Error;

    #[derive(Debug, Error, Clone, PartialEq)]
    enum TestError {
        #[error(transparent)]
        Cache(#[from] CacheError),

        #[error("boom")]
        Boom,
    }

    type TestMap = CacheMap<String, usize, TestError>;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn single_flight_runs_the_producer_once() {
        let map = Arc::new(TestMap::new());
        let runs = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let map = map.clone();
            let runs = runs.clone();
            tasks.push(tokio::spawn(async move {
                let ctx = RequestContext::default();
                map.get_or_initialize(&ctx, "k".to_string(), |_ctx| async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    Ok(42)
                })
                .await
            }));
        }

        let mut hits = 0;
        for task in tasks {
            let (value, hit) = task.await.unwrap().unwrap();
            assert_eq!(value, 42);
            if hit {
                hits += 1;
            }
        }

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(hits, 15);
    }

    #[tokio::test]
    async fn recursive_initialization_fails_fast() {
        let map = Arc::new(TestMap::new());
        let ctx = RequestContext::default();

        let inner_map = map.clone();
        let result = map
            .get_or_initialize(&ctx, "k".to_string(), |inner_ctx| async move {
                // same map, same key, inherited context: must not deadlock
                inner_map
                    .get_or_initialize(&inner_ctx, "k".to_string(), |_ctx| async move { Ok(1) })
                    .await
                    .map(|(value, _hit)| value)
            })
            .await;

        assert_eq!(result, Err(TestError::Cache(CacheError::RecursiveCall)));
    }

    #[tokio::test]
    async fn different_key_recursion_is_allowed() {
        let map = Arc::new(TestMap::new());
        let ctx = RequestContext::default();

        let inner_map = map.clone();
        let (value, _hit) = map
            .get_or_initialize(&ctx, "outer".to_string(), |inner_ctx| async move {
                inner_map
                    .get_or_initialize(&inner_ctx, "inner".to_string(), |_ctx| async move { Ok(2) })
                    .await
                    .map(|(value, _hit)| value + 1)
            })
            .await
            .unwrap();

        assert_eq!(value, 3);
    }

    #[tokio::test]
    async fn failed_producers_are_evicted() {
        let map = TestMap::new();
        let ctx = RequestContext::default();

        let failed = map
            .get_or_initialize(&ctx, "k".to_string(), |_ctx| async move {
                Err(TestError::Boom)
            })
            .await;
        assert_eq!(failed, Err(TestError::Boom));
        assert!(map.keys().is_empty());

        let (value, hit) = map
            .get_or_initialize(&ctx, "k".to_string(), |_ctx| async move { Ok(7) })
            .await
            .unwrap();
        assert_eq!((value, hit), (7, false));
    }

    #[tokio::test]
    async fn panicking_producers_release_waiters() {
        let map = TestMap::new();
        let ctx = RequestContext::default();

        let result = map
            .get_or_initialize(&ctx, "k".to_string(), |_ctx| async move {
                panic!("producer blew up")
            })
            .await;
        assert_eq!(result, Err(TestError::Cache(CacheError::ProducerPanicked)));
        assert!(map.keys().is_empty());
    }

    #[tokio::test]
    async fn get_waits_and_set_overwrites() {
        let map = TestMap::new();
        let ctx = RequestContext::default();

        assert_eq!(
            map.get(&ctx, &"k".to_string()).await,
            Err(TestError::Cache(CacheError::NotFound))
        );

        map.set("k".to_string(), 9);
        assert_eq!(map.get(&ctx, &"k".to_string()).await, Ok(9));

        map.set("k".to_string(), 10);
        assert_eq!(map.get(&ctx, &"k".to_string()).await, Ok(10));
        assert_eq!(map.keys(), vec!["k".to_string()]);
    }

    #[tokio::test]
    async fn value_seeding_respects_existing_entries() {
        let map = TestMap::new();
        let ctx = RequestContext::default();

        let (value, hit) = map
            .get_or_initialize_value(&ctx, "k".to_string(), 1)
            .await
            .unwrap();
        assert_eq!((value, hit), (1, false));

        let (value, hit) = map
            .get_or_initialize_value(&ctx, "k".to_string(), 2)
            .await
            .unwrap();
        assert_eq!((value, hit), (1, true));
    }

    #[tokio::test]
    async fn post_call_is_replayed_on_hits() {
        let map = TestMap::new();
        let ctx = RequestContext::default();
        let invocations = Arc::new(AtomicUsize::new(0));

        let hook_invocations = invocations.clone();
        let (_value, hit, post_call) = map
            .get_or_initialize_with_post_call(&ctx, "k".to_string(), |_ctx| async move {
                let invocations = hook_invocations.clone();
                let hook: PostCall<TestError> = Arc::new(move |_ctx| {
                    let invocations = invocations.clone();
                    async move {
                        invocations.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                    .boxed()
                });
                Ok((5, Some(hook)))
            })
            .await
            .unwrap();
        assert!(!hit);
        assert!(post_call.is_some());

        let (value, hit, post_call) = map
            .get_or_initialize_with_post_call(&ctx, "k".to_string(), |_ctx| async move {
                Ok((99, None::<PostCall<TestError>>))
            })
            .await
            .unwrap();
        assert_eq!(value, 5);
        assert!(hit);

        let hook = post_call.expect("hit should carry the stored hook");
        hook(RequestContext::default()).await.unwrap();
        assert_eq!(invocations.load(Ordering::SeqCst), 1);
    }
}
