//! Single-flight coordination of cache writers.
//!
//! At most one fetch-and-store runs per [`CacheKey`]. Later requesters for
//! the same key get a [`Waiter`] that resolves once the active writer is
//! gone, whether it committed or aborted, and then look the cache up again.

use super::CacheKey;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};
use tokio::sync::watch;

type Registry = Arc<Mutex<HashMap<CacheKey, watch::Receiver<()>>>>;

/// Process-wide in-flight registry. Cloning shares the registry.
#[derive(Clone, Default)]
pub struct SingleFlight {
    inflight: Registry,
}

/// Outcome of [`SingleFlight::acquire`].
pub enum Flight {
    /// The caller owns the write path for the key until the guard drops.
    Leader(FlightGuard),
    /// Another writer is active.
    Follower(Waiter),
}

impl SingleFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register as the writer for `key`, or wait on the current one.
    ///
    /// Check and insert happen under one lock.
    pub fn acquire(&self, key: &CacheKey) -> Flight {
        let mut inflight = self.inflight.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(rx) = inflight.get(key) {
            return Flight::Follower(Waiter { rx: rx.clone() });
        }

        let (tx, rx) = watch::channel(());
        inflight.insert(key.clone(), rx);
        Flight::Leader(FlightGuard {
            key: key.clone(),
            inflight: self.inflight.clone(),
            _done: tx,
        })
    }

    pub fn is_in_flight(&self, key: &CacheKey) -> bool {
        self.inflight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.inflight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Registration of the active writer. Dropping it removes the registry entry
/// and releases every waiter.
pub struct FlightGuard {
    key: CacheKey,
    inflight: Registry,
    _done: watch::Sender<()>,
}

impl FlightGuard {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        // The entry goes before the sender, so a released waiter never finds
        // the stale entry.
        self.inflight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
    }
}

/// Handle on another request's in-progress write.
pub struct Waiter {
    rx: watch::Receiver<()>,
}

impl Waiter {
    /// Resolve once the writer's guard is dropped.
    pub async fn wait(mut self) {
        // Nothing is ever sent; `changed` only returns once the sender is gone.
        while self.rx.changed().await.is_ok() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Method;
    use std::time::Duration;

    fn key(path: &str) -> CacheKey {
        let uri = format!("http://example.com{path}").parse().unwrap();
        CacheKey::new(&Method::GET, &uri).unwrap()
    }

    #[tokio::test]
    async fn test_second_acquire_waits_for_guard() {
        let flights = SingleFlight::new();
        let k = key("/a");

        let Flight::Leader(guard) = flights.acquire(&k) else {
            panic!("first acquire must lead");
        };
        assert!(flights.is_in_flight(&k));

        let Flight::Follower(waiter) = flights.acquire(&k) else {
            panic!("second acquire must follow");
        };

        let waiting = tokio::spawn(waiter.wait());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiting.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), waiting)
            .await
            .expect("waiter released")
            .unwrap();

        assert!(!flights.is_in_flight(&k));
        assert!(matches!(flights.acquire(&k), Flight::Leader(_)));
    }

    #[tokio::test]
    async fn test_distinct_keys_do_not_coordinate() {
        let flights = SingleFlight::new();
        let a = flights.acquire(&key("/a"));
        let b = flights.acquire(&key("/b"));
        assert!(matches!(a, Flight::Leader(_)));
        assert!(matches!(b, Flight::Leader(_)));
        assert_eq!(flights.len(), 2);

        drop((a, b));
        assert_eq!(flights.len(), 0);
    }

    #[tokio::test]
    async fn test_waiter_after_release_returns_immediately() {
        let flights = SingleFlight::new();
        let k = key("/a");
        let Flight::Leader(guard) = flights.acquire(&k) else {
            panic!("first acquire must lead");
        };
        let Flight::Follower(waiter) = flights.acquire(&k) else {
            panic!("second acquire must follow");
        };
        drop(guard);

        tokio::time::timeout(Duration::from_millis(100), waiter.wait())
            .await
            .expect("no hang after writer is gone");
    }

    #[tokio::test]
    async fn test_released_waiters_race_for_one_new_leader() {
        let flights = SingleFlight::new();
        let k = key("/a");
        let Flight::Leader(guard) = flights.acquire(&k) else {
            panic!("first acquire must lead");
        };

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let Flight::Follower(waiter) = flights.acquire(&k) else {
                panic!("must follow while guard is held");
            };
            let flights = flights.clone();
            let k = k.clone();
            tasks.push(tokio::spawn(async move {
                waiter.wait().await;
                match flights.acquire(&k) {
                    Flight::Leader(guard) => {
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        drop(guard);
                        1
                    }
                    Flight::Follower(waiter) => {
                        waiter.wait().await;
                        0
                    }
                }
            }));
        }

        drop(guard);
        let mut leaders = 0;
        for task in tasks {
            leaders += task.await.unwrap();
        }
        assert!(leaders >= 1);
        assert_eq!(flights.len(), 0);
    }
}
