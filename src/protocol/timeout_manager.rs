use log::debug;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Callback fired when a timeout elapses without being cancelled
pub type TimeoutHandler<K> = Box<dyn FnOnce(K) + Send>;

struct ActiveTimeout {
    generation: u64,
    task: JoinHandle<()>,
}

/// Keyed one-shot timers, used for the handshake deadline of new sessions
pub struct TimeoutManager<K> {
    active_timeouts: Arc<Mutex<HashMap<K, ActiveTimeout>>>,
    generation: AtomicU64,
}

impl<K> TimeoutManager<K>
where
    K: Eq + Hash + Clone + Debug + Send + 'static,
{
    pub fn new() -> Self {
        Self {
            active_timeouts: Arc::new(Mutex::new(HashMap::new())),
            generation: AtomicU64::new(0),
        }
    }

    /// Start (or restart) the timeout for `key`. Must be called inside a tokio runtime.
    pub fn start_timeout(&self, key: K, timeout: Duration, on_timeout: TimeoutHandler<K>) {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let active_timeouts = Arc::clone(&self.active_timeouts);
        let task_key = key.clone();

        // Held across the spawn so the task cannot observe the map before its entry exists.
        let mut timeouts = self.active_timeouts.lock();
        let task = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let fired = {
                let mut timeouts = active_timeouts.lock();
                match timeouts.get(&task_key) {
                    Some(active) if active.generation == generation => {
                        timeouts.remove(&task_key);
                        true
                    }
                    _ => false,
                }
            };
            if fired {
                debug!("Timeout elapsed for {:?} after {:?}", task_key, timeout);
                on_timeout(task_key);
            }
        });

        if let Some(previous) = timeouts.insert(key, ActiveTimeout { generation, task }) {
            previous.task.abort();
        }
    }

    /// Cancel the timeout for `key`; returns whether one was active
    pub fn cancel_timeout(&self, key: &K) -> bool {
        match self.active_timeouts.lock().remove(key) {
            Some(active) => {
                active.task.abort();
                true
            }
            None => false,
        }
    }

    pub fn has_timeout(&self, key: &K) -> bool {
        self.active_timeouts.lock().contains_key(key)
    }

    pub fn active_timeout_count(&self) -> usize {
        self.active_timeouts.lock().len()
    }

    pub fn cancel_all_timeouts(&self) {
        for (_, active) in self.active_timeouts.lock().drain() {
            active.task.abort();
        }
    }
}

impl<K> Default for TimeoutManager<K>
where
    K: Eq + Hash + Clone + Debug + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test(start_paused = true)]
    async fn test_timeout_fires() {
        let manager = TimeoutManager::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        manager.start_timeout(
            "client",
            Duration::from_secs(10),
            Box::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        assert!(manager.has_timeout(&"client"));
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(manager.active_timeout_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_timeout_does_not_fire() {
        let manager = TimeoutManager::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        manager.start_timeout(
            1u32,
            Duration::from_secs(10),
            Box::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        assert!(manager.cancel_timeout(&1));
        assert!(!manager.cancel_timeout(&1));
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
