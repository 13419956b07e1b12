use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use super::Store;
use crate::location::Location;

/// Produces the payload to persist, or `None` once the source is gone.
pub type SnapshotFn = Arc<dyn Fn() -> Option<Value> + Send + Sync>;

/// Debounced, single-slot writer for one location's payload.
///
/// At most one write is in flight. A request arriving during a write only
/// raises the pending flag; the in-flight writer loops and writes again
/// with a fresh snapshot, so a later payload is never overwritten by an
/// earlier one.
#[derive(Clone)]
pub struct Saver {
    inner: Arc<SaverInner>,
}

struct SaverInner {
    location: Location,
    store: Arc<dyn Store>,
    snapshot: SnapshotFn,
    debounce: Duration,
    runtime: Handle,
    timer: Mutex<Option<JoinHandle<()>>>,
    slot: tokio::sync::Mutex<()>,
    pending: AtomicBool,
    closed: AtomicBool,
}

impl std::fmt::Debug for Saver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Saver")
            .field("location", &self.inner.location)
            .field("debounce", &self.inner.debounce)
            .finish()
    }
}

impl Saver {
    /// Must be called from within a tokio runtime; debounce timers are
    /// spawned onto it.
    pub fn new(
        location: Location,
        store: Arc<dyn Store>,
        debounce: Duration,
        snapshot: SnapshotFn,
    ) -> Self {
        Self {
            inner: Arc::new(SaverInner {
                location,
                store,
                snapshot,
                debounce,
                runtime: Handle::current(),
                timer: Mutex::new(None),
                slot: tokio::sync::Mutex::new(()),
                pending: AtomicBool::new(false),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Schedule a save after the debounce window, superseding any
    /// previously scheduled one.
    pub fn schedule(&self) {
        if self.inner.closed.load(Ordering::SeqCst) {
            return;
        }
        let mut timer = self.inner.timer.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = timer.take() {
            previous.abort();
        }
        let saver = self.clone();
        let debounce = self.inner.debounce;
        let runtime = self.inner.runtime.clone();
        *timer = Some(self.inner.runtime.spawn(async move {
            tokio::time::sleep(debounce).await;
            // only the timer is cancellable, never the write itself
            runtime.spawn(async move { saver.save().await });
        }));
    }

    /// Write the current payload now.
    ///
    /// Failures are logged and counted; the next scheduled save retries.
    pub async fn save(&self) {
        self.inner.pending.store(true, Ordering::SeqCst);
        let _slot = self.inner.slot.lock().await;
        while self.inner.pending.swap(false, Ordering::SeqCst) {
            if self.inner.closed.load(Ordering::SeqCst) {
                return;
            }
            let Some(payload) = (self.inner.snapshot)() else {
                return;
            };
            self.write(&payload).await;
        }
    }

    async fn write(&self, payload: &Value) {
        let location = &self.inner.location;
        match self.inner.store.set(location, payload).await {
            Ok(()) => {
                metrics::counter!("weft_saves_total").increment(1);
                tracing::debug!(location = %location, "state saved");
            }
            Err(e) => {
                metrics::counter!("weft_save_failures_total").increment(1);
                tracing::warn!(location = %location, error = %e, "failed to save state");
            }
        }
    }

    /// Cancel any scheduled save and write immediately.
    pub async fn flush(&self) {
        self.cancel_timer();
        self.save().await;
    }

    /// Stop accepting saves and wait out a write already in flight.
    pub async fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.cancel_timer();
        let _slot = self.inner.slot.lock().await;
    }

    fn cancel_timer(&self) {
        let timer = self
            .inner
            .timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(timer) = timer {
            timer.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::MemoryStore;
    use serde_json::json;
    use std::sync::atomic::AtomicU64;

    fn counter_saver(store: Arc<MemoryStore>, debounce: Duration) -> (Saver, Arc<AtomicU64>) {
        let counter = Arc::new(AtomicU64::new(0));
        let source = counter.clone();
        let saver = Saver::new(
            Location::new("app", "todos", "main"),
            store,
            debounce,
            Arc::new(move || Some(json!({"n": source.load(Ordering::SeqCst)}))),
        );
        (saver, counter)
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounce_coalesces_writes() {
        let store = Arc::new(MemoryStore::new());
        let (saver, counter) = counter_saver(store.clone(), Duration::from_millis(500));

        for n in 1..=5 {
            counter.store(n, Ordering::SeqCst);
            saver.schedule();
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert_eq!(store.writes(), 0);

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(store.writes(), 1);
        let saved = store.get(&Location::new("app", "todos", "main")).await.unwrap();
        assert_eq!(saved, Some(json!({"n": 5})));
    }

    #[tokio::test]
    async fn test_concurrent_saves_share_one_slot() {
        let store = Arc::new(MemoryStore::new());
        let (saver, counter) = counter_saver(store.clone(), Duration::from_millis(500));
        counter.store(7, Ordering::SeqCst);

        tokio::join!(saver.save(), saver.save(), saver.save());

        assert!(store.writes() >= 1 && store.writes() <= 3);
        let saved = store.get(&Location::new("app", "todos", "main")).await.unwrap();
        assert_eq!(saved, Some(json!({"n": 7})));
    }

    #[tokio::test]
    async fn test_write_failure_is_not_fatal() {
        let store = Arc::new(MemoryStore::new());
        let (saver, _) = counter_saver(store.clone(), Duration::from_millis(500));

        store.fail_writes(true);
        saver.save().await;
        assert_eq!(store.writes(), 0);

        store.fail_writes(false);
        saver.save().await;
        assert_eq!(store.writes(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_drops_scheduled_save() {
        let store = Arc::new(MemoryStore::new());
        let (saver, _) = counter_saver(store.clone(), Duration::from_millis(500));
        saver.schedule();
        saver.close().await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(store.writes(), 0);
    }
}
