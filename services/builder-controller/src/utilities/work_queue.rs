use std::{
    collections::{HashMap, HashSet, VecDeque},
    hash::Hash,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use tokio::{sync::Notify, time::Instant};
use tracing::debug;

use crate::utilities::rate_limiter::RateLimiter;

struct QueueState<K> {
    queue: VecDeque<K>,
    /// Items that need processing, queued or waiting for an in-flight run to end.
    dirty: HashSet<K>,
    processing: HashSet<K>,
    /// Earliest scheduled deadline per delayed item.
    waiting: HashMap<K, Instant>,
    shutting_down: bool,
}

/// Deduplicating, rate-limited work queue.
///
/// An item is handed to at most one consumer at a time. Re-adding an item
/// that is being processed schedules exactly one more run once [`done`] is
/// called for it.
///
/// [`done`]: WorkQueue::done
pub struct WorkQueue<K> {
    state: Mutex<QueueState<K>>,
    notify: Notify,
    rate_limiter: Box<dyn RateLimiter<K>>,
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
{
    pub fn new(rate_limiter: Box<dyn RateLimiter<K>>) -> Self {
        Self {
            state: Mutex::new(QueueState {
                queue: VecDeque::new(),
                dirty: HashSet::new(),
                processing: HashSet::new(),
                waiting: HashMap::new(),
                shutting_down: false,
            }),
            notify: Notify::new(),
            rate_limiter,
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<K>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add(&self, item: K) {
        {
            let mut state = self.lock();
            if state.shutting_down || state.dirty.contains(&item) {
                return;
            }

            state.dirty.insert(item.clone());
            if state.processing.contains(&item) {
                return;
            }

            state.queue.push_back(item);
        }
        self.notify.notify_one();
    }

    /// Waits for the next item; `None` once the queue is shut down.
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.lock();
                if state.shutting_down {
                    return None;
                }
                if let Some(item) = state.queue.pop_front() {
                    state.dirty.remove(&item);
                    state.processing.insert(item.clone());
                    return Some(item);
                }
            }
            notified.await;
        }
    }

    pub fn done(&self, item: &K) {
        let requeued = {
            let mut state = self.lock();
            state.processing.remove(item);
            if state.dirty.contains(item) {
                state.queue.push_back(item.clone());
                true
            } else {
                false
            }
        };

        if requeued {
            self.notify.notify_one();
        }
    }

    /// Adds `item` once `delay` has elapsed. Keeps the earliest deadline
    /// when the item is already scheduled.
    pub fn add_after(self: &Arc<Self>, item: K, delay: Duration) {
        if delay.is_zero() {
            self.add(item);
            return;
        }

        let deadline = Instant::now() + delay;
        {
            let mut state = self.lock();
            if state.shutting_down {
                return;
            }
            if state
                .waiting
                .get(&item)
                .is_some_and(|existing| *existing <= deadline)
            {
                return;
            }
            state.waiting.insert(item.clone(), deadline);
        }

        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;

            let due = {
                let mut state = queue.lock();
                // A later call may have moved the deadline earlier.
                if state.waiting.get(&item) == Some(&deadline) {
                    state.waiting.remove(&item);
                    true
                } else {
                    false
                }
            };

            if due {
                queue.add(item);
            }
        });
    }

    pub fn add_rate_limited(self: &Arc<Self>, item: K) {
        let delay = self.rate_limiter.when(&item);
        debug!(delay_ms = delay.as_millis() as u64, "⏳ Requeue scheduled");
        self.add_after(item, delay);
    }

    pub fn forget(&self, item: &K) {
        self.rate_limiter.forget(item);
    }

    pub fn num_requeues(&self, item: &K) -> u32 {
        self.rate_limiter.num_requeues(item)
    }

    /// Wakes every waiting consumer; in-flight items finish normally.
    pub fn shut_down(&self) {
        {
            let mut state = self.lock();
            state.shutting_down = true;
            state.waiting.clear();
        }
        self.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.lock().shutting_down
    }

    /// Queued items, not counting the ones being processed.
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utilities::rate_limiter::ItemExponentialFailureRateLimiter;

    fn queue() -> Arc<WorkQueue<&'static str>> {
        Arc::new(WorkQueue::new(Box::new(
            ItemExponentialFailureRateLimiter::new(
                Duration::from_millis(5),
                Duration::from_secs(1000),
            ),
        )))
    }

    #[tokio::test]
    async fn duplicate_adds_collapse() {
        let queue = queue();
        queue.add("a");
        queue.add("a");
        queue.add("b");

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.get().await, Some("a"));
        assert_eq!(queue.get().await, Some("b"));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn readding_in_flight_item_runs_it_exactly_once_more() {
        let queue = queue();
        queue.add("a");
        let item = queue.get().await.unwrap();

        for _ in 0..10 {
            queue.add("a");
        }
        // Still held by the first consumer.
        assert!(queue.is_empty());

        queue.done(&item);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.get().await, Some("a"));
        queue.done(&"a");
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn get_waits_for_an_add() {
        let queue = queue();
        let consumer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.get().await })
        };

        tokio::task::yield_now().await;
        queue.add("a");

        assert_eq!(consumer.await.unwrap(), Some("a"));
    }

    #[tokio::test]
    async fn shut_down_releases_blocked_consumers() {
        let queue = queue();
        let consumers: Vec<_> = (0..3)
            .map(|_| {
                let queue = Arc::clone(&queue);
                tokio::spawn(async move { queue.get().await })
            })
            .collect();

        tokio::task::yield_now().await;
        queue.shut_down();

        for consumer in consumers {
            assert_eq!(consumer.await.unwrap(), None);
        }

        queue.add("a");
        assert!(queue.is_empty());
        assert_eq!(queue.get().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn add_after_keeps_the_earliest_deadline() {
        let queue = queue();
        queue.add_after("a", Duration::from_secs(10));
        queue.add_after("a", Duration::from_secs(1));
        queue.add_after("a", Duration::from_secs(5));

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.get().await, Some("a"));
        queue.done(&"a");

        // The superseded timers fire without adding it again.
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_adds_back_off_until_forgotten() {
        let queue = queue();

        queue.add_rate_limited("a");
        queue.add_rate_limited("a");
        assert_eq!(queue.num_requeues(&"a"), 2);

        tokio::time::sleep(Duration::from_millis(6)).await;
        assert_eq!(queue.get().await, Some("a"));
        queue.done(&"a");

        queue.forget(&"a");
        assert_eq!(queue.num_requeues(&"a"), 0);
    }
}
