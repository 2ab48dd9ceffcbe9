//! In-memory store.

use super::JobStore;
use crate::error::StoreError;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

#[derive(Default)]
struct MemoryState {
    /// Lists, head at the front
    lists: HashMap<String, VecDeque<String>>,

    /// Sorted sets kept ordered by (score, member)
    sorted: HashMap<String, Vec<(f64, String)>>,

    counters: HashMap<String, i64>,
}

/// [`JobStore`] that keeps everything in process memory.
///
/// Clones share the same data. Blocking pops wake up as soon as a push lands.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
    pushed: Arc<Notify>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of a counter, 0 when never incremented
    pub async fn counter(&self, key: &str) -> i64 {
        self.state.lock().await.counters.get(key).copied().unwrap_or(0)
    }

    /// Score of a sorted-set member
    pub async fn score(&self, key: &str, member: &str) -> Option<f64> {
        let state = self.state.lock().await;
        state
            .sorted
            .get(key)?
            .iter()
            .find(|(_, m)| m == member)
            .map(|(score, _)| *score)
    }

    async fn try_pop_push(&self, source: &str, destination: &str) -> Option<String> {
        let mut state = self.state.lock().await;
        let value = state.lists.get_mut(source)?.pop_back()?;
        state
            .lists
            .entry(destination.to_string())
            .or_default()
            .push_front(value.clone());
        Some(value)
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn lpush(&self, key: &str, value: &str) -> Result<(), StoreError> {
        {
            let mut state = self.state.lock().await;
            state
                .lists
                .entry(key.to_string())
                .or_default()
                .push_front(value.to_string());
        }
        self.pushed.notify_waiters();
        Ok(())
    }

    async fn brpoplpush(
        &self,
        source: &str,
        destination: &str,
        timeout: Duration,
    ) -> Result<Option<String>, StoreError> {
        let deadline = Instant::now() + timeout;
        loop {
            // Register before checking so a push in between is not missed
            let pushed = self.pushed.notified();
            if let Some(value) = self.try_pop_push(source, destination).await {
                return Ok(Some(value));
            }
            if tokio::time::timeout_at(deadline, pushed).await.is_err() {
                return Ok(self.try_pop_push(source, destination).await);
            }
        }
    }

    async fn lrange_all(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .lists
            .get(key)
            .map(|list| list.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn lrem_last(&self, key: &str, value: &str) -> Result<usize, StoreError> {
        let mut state = self.state.lock().await;
        let Some(list) = state.lists.get_mut(key) else {
            return Ok(0);
        };
        match list.iter().rposition(|v| v == value) {
            Some(index) => {
                list.remove(index);
                Ok(1)
            }
            None => Ok(0),
        }
    }

    async fn llen(&self, key: &str) -> Result<usize, StoreError> {
        let state = self.state.lock().await;
        Ok(state.lists.get(key).map_or(0, VecDeque::len))
    }

    async fn zadd(&self, key: &str, score: f64, member: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let set = state.sorted.entry(key.to_string()).or_default();
        set.retain(|(_, m)| m != member);
        let index = set
            .iter()
            .position(|(s, m)| (*s, m.as_str()) > (score, member))
            .unwrap_or(set.len());
        set.insert(index, (score, member.to_string()));
        Ok(())
    }

    async fn zfirst_due(&self, key: &str, max_score: f64) -> Result<Option<String>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .sorted
            .get(key)
            .and_then(|set| set.first())
            .filter(|(score, _)| *score <= max_score)
            .map(|(_, member)| member.clone()))
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        let Some(set) = state.sorted.get_mut(key) else {
            return Ok(false);
        };
        let before = set.len();
        set.retain(|(_, m)| m != member);
        Ok(set.len() < before)
    }

    async fn zcard(&self, key: &str) -> Result<usize, StoreError> {
        let state = self.state.lock().await;
        Ok(state.sorted.get(key).map_or(0, Vec::len))
    }

    async fn zrange(&self, key: &str, start: usize, stop: usize) -> Result<Vec<String>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .sorted
            .get(key)
            .map(|set| {
                set.iter()
                    .skip(start)
                    .take((stop + 1).saturating_sub(start))
                    .map(|(_, member)| member.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn incr(&self, key: &str) -> Result<i64, StoreError> {
        let mut state = self.state.lock().await;
        let counter = state.counters.entry(key.to_string()).or_insert(0);
        *counter += 1;
        Ok(*counter)
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.lists.remove(key);
        state.sorted.remove(key);
        state.counters.remove(key);
        Ok(())
    }

    async fn dedicated(&self) -> Result<Arc<dyn JobStore>, StoreError> {
        Ok(Arc::new(self.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pop_push_moves_tail_to_head() {
        let store = MemoryStore::new();
        store.lpush("q", "first").await.unwrap();
        store.lpush("q", "second").await.unwrap();

        let popped = store
            .brpoplpush("q", "q:inprogress", Duration::from_millis(10))
            .await
            .unwrap();

        assert_eq!(popped.as_deref(), Some("first"));
        assert_eq!(store.lrange_all("q").await.unwrap(), vec!["second"]);
        assert_eq!(store.lrange_all("q:inprogress").await.unwrap(), vec!["first"]);
    }

    #[tokio::test]
    async fn test_pop_push_times_out_on_empty_list() {
        let store = MemoryStore::new();
        let popped = store
            .brpoplpush("q", "q:inprogress", Duration::from_millis(20))
            .await
            .unwrap();
        assert_eq!(popped, None);
    }

    #[tokio::test]
    async fn test_blocked_pop_wakes_on_push() {
        let store = MemoryStore::new();
        let waiter = {
            let store = store.clone();
            tokio::spawn(async move {
                store
                    .brpoplpush("q", "q:inprogress", Duration::from_secs(5))
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        store.lpush("q", "late").await.unwrap();

        let popped = waiter.await.unwrap().unwrap();
        assert_eq!(popped.as_deref(), Some("late"));
    }

    #[tokio::test]
    async fn test_lrem_last_removes_one_occurrence_from_tail() {
        let store = MemoryStore::new();
        for value in ["a", "b", "a"] {
            store.lpush("l", value).await.unwrap();
        }

        assert_eq!(store.lrem_last("l", "a").await.unwrap(), 1);
        assert_eq!(store.lrange_all("l").await.unwrap(), vec!["a", "b"]);
        assert_eq!(store.lrem_last("l", "missing").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_sorted_set_orders_by_score() {
        let store = MemoryStore::new();
        store.zadd("z", 30.0, "late").await.unwrap();
        store.zadd("z", 10.0, "early").await.unwrap();
        store.zadd("z", 20.0, "middle").await.unwrap();

        assert_eq!(store.zfirst_due("z", 5.0).await.unwrap(), None);
        assert_eq!(store.zfirst_due("z", 25.0).await.unwrap().as_deref(), Some("early"));
        assert_eq!(
            store.zrange("z", 0, 1).await.unwrap(),
            vec!["early".to_string(), "middle".to_string()]
        );

        assert!(store.zrem("z", "early").await.unwrap());
        assert!(!store.zrem("z", "early").await.unwrap());
        assert_eq!(store.zcard("z").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_zadd_rescores_existing_member() {
        let store = MemoryStore::new();
        store.zadd("z", 10.0, "job").await.unwrap();
        store.zadd("z", 50.0, "job").await.unwrap();

        assert_eq!(store.zcard("z").await.unwrap(), 1);
        assert_eq!(store.score("z", "job").await, Some(50.0));
    }

    #[tokio::test]
    async fn test_incr_and_del() {
        let store = MemoryStore::new();
        assert_eq!(store.incr("stat:processed").await.unwrap(), 1);
        assert_eq!(store.incr("stat:processed").await.unwrap(), 2);

        store.del("stat:processed").await.unwrap();
        assert_eq!(store.counter("stat:processed").await, 0);
    }
}
