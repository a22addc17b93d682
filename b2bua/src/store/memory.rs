use super::{KvStore, StoreError, WatchEvent};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| at <= Instant::now())
    }
}

/// In-process [`KvStore`] backed by a concurrent hash map.
///
/// TTLs are enforced lazily on access plus an explicit [`MemoryStore::evict_expired`]
/// pass driven by the supervisory loops.
#[derive(Default)]
pub struct MemoryStore {
    entries: DashMap<String, Entry>,
    watchers: Mutex<Vec<(String, broadcast::Sender<WatchEvent>)>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn notify(&self, key: &str, event: WatchEvent) {
        let mut watchers = self.watchers.lock();

        watchers.retain(|(prefix, sender)| {
            if sender.receiver_count() == 0 {
                return false;
            }

            if key.starts_with(prefix.as_str()) {
                let _ = sender.send(event.clone());
            }

            true
        });
    }

    /// Drop expired entries. Returns how many were evicted.
    pub fn evict_expired(&self) -> usize {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| entry.value().is_expired())
            .map(|entry| entry.key().clone())
            .collect();

        for key in &expired {
            self.entries.remove(key);
            self.notify(key, WatchEvent::Delete { key: key.clone() });
        }

        expired.len()
    }
}

#[async_trait::async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        match self.entries.get(key) {
            Some(entry) if !entry.is_expired() => Ok(Some(entry.value.clone())),
            _ => Ok(None),
        }
    }

    async fn put(
        &self,
        key: &str,
        value: String,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        self.entries.insert(
            key.to_owned(),
            Entry {
                value: value.clone(),
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );

        self.notify(
            key,
            WatchEvent::Put {
                key: key.to_owned(),
                value,
            },
        );

        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        if self.entries.remove(key).is_some() {
            self.notify(key, WatchEvent::Delete { key: key.to_owned() });
        }

        Ok(())
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>, StoreError> {
        Ok(self
            .entries
            .iter()
            .filter(|entry| entry.key().starts_with(prefix) && !entry.value().is_expired())
            .map(|entry| (entry.key().clone(), entry.value().value.clone()))
            .collect())
    }

    fn watch_prefix(&self, prefix: &str) -> broadcast::Receiver<WatchEvent> {
        let (sender, receiver) = broadcast::channel(64);

        self.watchers.lock().push((prefix.to_owned(), sender));

        receiver
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn put_get_delete() {
        let store = MemoryStore::new();

        store.put("a", "1".into(), None).await.unwrap();
        assert_eq!(store.get("a").await.unwrap().as_deref(), Some("1"));

        store.delete("a").await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn ttl_expiry() {
        let store = MemoryStore::new();

        store
            .put("a", "1".into(), Some(Duration::from_secs(60)))
            .await
            .unwrap();
        store.put("b", "2".into(), Some(Duration::ZERO)).await.unwrap();

        assert_eq!(store.get("b").await.unwrap(), None);
        assert_eq!(store.get("a").await.unwrap().as_deref(), Some("1"));

        assert_eq!(store.evict_expired(), 1);
    }

    #[tokio::test]
    async fn prefix_listing() {
        let store = MemoryStore::new();

        store.put("rules/1", "a".into(), None).await.unwrap();
        store.put("rules/2", "b".into(), None).await.unwrap();
        store.put("other/3", "c".into(), None).await.unwrap();

        let mut listed = store.list_prefix("rules/").await.unwrap();
        listed.sort();

        assert_eq!(
            listed,
            vec![
                ("rules/1".to_string(), "a".to_string()),
                ("rules/2".to_string(), "b".to_string())
            ]
        );
    }

    #[tokio::test]
    async fn watch_sees_changes_under_prefix() {
        let store = MemoryStore::new();

        let mut watch = store.watch_prefix("rules/");

        store.put("rules/1", "a".into(), None).await.unwrap();
        store.put("other/1", "x".into(), None).await.unwrap();
        store.delete("rules/1").await.unwrap();

        match watch.recv().await.unwrap() {
            WatchEvent::Put { key, value } => {
                assert_eq!(key, "rules/1");
                assert_eq!(value, "a");
            }
            event => panic!("unexpected event {event:?}"),
        }

        match watch.recv().await.unwrap() {
            WatchEvent::Delete { key } => assert_eq!(key, "rules/1"),
            event => panic!("unexpected event {event:?}"),
        }
    }
}
