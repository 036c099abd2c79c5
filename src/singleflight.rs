//! Duplicate-work suppression keyed by cache key. The producer runs on a
//! detached task, so a caller that goes away never aborts work other
//! callers (or the cache) depend on. The in-flight entry is removed before
//! the result is published: a caller arriving afterwards either sees the
//! finished state in the store or starts the next producer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{watch, Mutex};

pub struct Group<T> {
    inner: Arc<Mutex<HashMap<String, Arc<Call<T>>>>>,
}

impl<T: Clone + Send + Sync + 'static> Default for Group<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + Sync + 'static> Group<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Runs `f` for `key` unless a producer is already in flight, in which
    /// case the caller waits for that producer's result instead. Returns
    /// the value and whether it was shared with other callers.
    pub async fn run<F, Fut>(&self, key: String, f: F) -> (T, bool)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = T> + Send + 'static,
    {
        let call = {
            let mut map = self.inner.lock().await;
            if let Some(call) = map.get(&key) {
                call.clone()
            } else {
                let call = Arc::new(Call::new());
                map.insert(key.clone(), call.clone());
                tokio::spawn(run_call(self.inner.clone(), key, call.clone(), f));
                call
            }
        };

        call.callers.fetch_add(1, Ordering::SeqCst);
        let value = call.wait().await;
        let shared = call.callers.load(Ordering::SeqCst) > 1;
        (value, shared)
    }
}

struct Call<T> {
    result: watch::Sender<Option<T>>,
    callers: AtomicUsize,
}

impl<T: Clone + Send + Sync + 'static> Call<T> {
    fn new() -> Self {
        let (result, _) = watch::channel(None);
        Self {
            result,
            callers: AtomicUsize::new(0),
        }
    }

    async fn wait(&self) -> T {
        let mut rx = self.result.subscribe();
        let value = rx
            .wait_for(|slot| slot.is_some())
            .await
            .expect("singleflight producer vanished");
        value.clone().expect("checked above")
    }

    fn publish(&self, value: T) {
        self.result.send_replace(Some(value));
    }
}

async fn run_call<T, F, Fut>(
    map: Arc<Mutex<HashMap<String, Arc<Call<T>>>>>,
    key: String,
    call: Arc<Call<T>>,
    f: F,
) where
    T: Clone + Send + Sync + 'static,
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = T>,
{
    let result = f().await;
    {
        let mut map = map.lock().await;
        map.remove(&key);
    }
    call.publish(result);
}
