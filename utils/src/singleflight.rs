use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::{Mutex, oneshot};
use tracing::info;

use crate::errors::SingleflightError;

type Waiters<T> = Vec<oneshot::Sender<T>>;

/// A keyed single-flight group: concurrent calls to `run` with the same key coalesce so that
/// only one invocation of the work function executes; all other callers await the same result.
///
/// - The first caller for a key becomes the "leader", executes the work, and then broadcasts the value to all
///   "followers".
/// - Followers wait on a oneshot to receive a clone of the produced value.
/// - Once the leader finishes the key is cleared, so a later call starts a new flight.
///
/// If the work needs to report failure, make `T` a `Result` with a cloneable error.
pub struct SingleFlight<T: Clone + Send + 'static> {
    in_flight: Arc<Mutex<HashMap<String, Waiters<T>>>>,
}

impl<T: Clone + Send + 'static> Default for SingleFlight<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + 'static> SingleFlight<T> {
    pub fn new() -> Self {
        Self {
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Coalesce concurrent calls under `key`: only the first caller's `work` runs.
    pub async fn run<F, Fut>(&self, key: &str, work: F) -> Result<T, SingleflightError>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = T> + Send,
    {
        // Attempt to become the leader or register as a follower.
        let rx_opt = {
            let mut guard = self.in_flight.lock().await;
            match guard.get_mut(key) {
                Some(waiters) => {
                    let (tx, rx) = oneshot::channel();
                    waiters.push(tx);
                    Some(rx)
                },
                None => {
                    guard.insert(key.to_owned(), Vec::new());
                    None
                },
            }
        };

        if let Some(rx) = rx_opt {
            return rx.await.map_err(|e| {
                let msg = format!("Singleflight leader for '{key}' finished without broadcasting a result: {e:?}");
                info!("{msg}");
                SingleflightError::LeaderDropped(msg)
            });
        }

        // We're the leader: run the work *without* holding the lock.
        let value = work().await;

        let waiters = self.in_flight.lock().await.remove(key).unwrap_or_default();
        for tx in waiters {
            // Receivers may have been dropped.
            let _ = tx.send(value.clone());
        }

        Ok(value)
    }

    /// Number of keys with a flight currently in progress.
    pub async fn num_in_flight(&self) -> usize {
        self.in_flight.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use tokio::time::sleep;

    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn coalesces_concurrent_calls_by_key() {
        let calls = Arc::new(AtomicUsize::new(0));
        let group = Arc::new(SingleFlight::<usize>::new());

        let mut handles = Vec::new();
        for _ in 0..32 {
            let group = group.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                group
                    .run("scope-a", || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        sleep(Duration::from_millis(50)).await;
                        42usize
                    })
                    .await
            }));
        }

        for h in handles {
            assert_eq!(h.await.unwrap().unwrap(), 42);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1, "only one flight runs");
        assert_eq!(group.num_in_flight().await, 0);
    }

    #[tokio::test]
    async fn sequential_runs_start_new_flights() {
        let group = SingleFlight::<u32>::new();
        assert_eq!(group.run("k", || async { 7 }).await.unwrap(), 7);
        assert_eq!(group.run("k", || async { 9 }).await.unwrap(), 9);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn distinct_keys_do_not_coalesce() {
        let calls = Arc::new(AtomicUsize::new(0));
        let group = Arc::new(SingleFlight::<usize>::new());

        let mut handles = Vec::new();
        for i in 0..4 {
            let group = group.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                group
                    .run(&format!("scope-{i}"), || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        sleep(Duration::from_millis(20)).await;
                        i
                    })
                    .await
            }));
        }
        for (i, h) in handles.into_iter().enumerate() {
            assert_eq!(h.await.unwrap().unwrap(), i);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }
}
