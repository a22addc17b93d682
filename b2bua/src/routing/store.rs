use super::{validate, RoutingEngine, RoutingRule, RuleError};
use crate::store::{KvStore, StoreError, WatchEvent};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

/// Keyspace the rules live under, one JSON blob per rule
pub const RULES_PREFIX: &str = "/tandem/routing-rules/";

#[derive(Debug, thiserror::Error)]
pub enum RuleStoreError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Rule(#[from] RuleError),
    #[error("rule {0} does not exist")]
    NotFound(String),
    #[error("rule blob is not valid json: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Persists routing rules in the shared KV store and keeps the engine's
/// compiled snapshot in sync with it.
pub struct RuleStore {
    store: Arc<dyn KvStore>,
    engine: Arc<RoutingEngine>,
}

impl RuleStore {
    pub fn new(store: Arc<dyn KvStore>, engine: Arc<RoutingEngine>) -> Self {
        Self { store, engine }
    }

    fn key(rule_id: &str) -> String {
        format!("{RULES_PREFIX}{rule_id}")
    }

    /// Scan the keyspace and publish the resulting snapshot. Malformed
    /// blobs are logged and skipped, the engine keeps running on the rest.
    pub async fn reload(&self) -> Result<usize, StoreError> {
        let entries = self.store.list_prefix(RULES_PREFIX).await?;

        let rules: Vec<RoutingRule> = entries
            .into_iter()
            .filter_map(|(key, blob)| match serde_json::from_str(&blob) {
                Ok(rule) => Some(rule),
                Err(e) => {
                    log::warn!("skipping malformed rule blob at {key}: {e}");
                    None
                }
            })
            .collect();

        let count = rules.len();
        self.engine.publish(rules);

        Ok(count)
    }

    /// Validate and persist a rule. The watcher refreshes the engine.
    pub async fn put_rule(&self, rule: RoutingRule) -> Result<(), RuleStoreError> {
        validate(&rule)?;

        let blob = serde_json::to_string(&rule)?;
        self.store.put(&Self::key(&rule.id), blob, None).await?;

        Ok(())
    }

    pub async fn delete_rule(&self, rule_id: &str) -> Result<(), RuleStoreError> {
        if self.store.get(&Self::key(rule_id)).await?.is_none() {
            return Err(RuleStoreError::NotFound(rule_id.to_owned()));
        }

        self.store.delete(&Self::key(rule_id)).await?;

        Ok(())
    }

    pub async fn get_rule(&self, rule_id: &str) -> Result<RoutingRule, RuleStoreError> {
        let blob = self
            .store
            .get(&Self::key(rule_id))
            .await?
            .ok_or_else(|| RuleStoreError::NotFound(rule_id.to_owned()))?;

        Ok(serde_json::from_str(&blob)?)
    }

    pub async fn list_rules(&self) -> Result<Vec<RoutingRule>, RuleStoreError> {
        let entries = self.store.list_prefix(RULES_PREFIX).await?;

        let mut rules: Vec<RoutingRule> = entries
            .into_iter()
            .filter_map(|(_, blob)| serde_json::from_str(&blob).ok())
            .collect();

        rules.sort_by(|a: &RoutingRule, b: &RoutingRule| {
            b.priority.cmp(&a.priority).then_with(|| a.id.cmp(&b.id))
        });

        Ok(rules)
    }

    /// Watch the keyspace and refresh the engine on every change until
    /// shutdown
    pub async fn run_watcher(self: Arc<Self>, shutdown: CancellationToken) {
        let mut watch = self.store.watch_prefix(RULES_PREFIX);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                event = watch.recv() => match event {
                    Ok(WatchEvent::Put { key, .. }) | Ok(WatchEvent::Delete { key }) => {
                        log::debug!("routing rules changed ({key}), recompiling");

                        if let Err(e) = self.reload().await {
                            log::error!("failed to reload routing rules, keeping current snapshot: {e}");
                        }
                    }
                    Err(RecvError::Lagged(missed)) => {
                        log::warn!("rule watcher lagged {missed} events, full reload");

                        if let Err(e) = self.reload().await {
                            log::error!("failed to reload routing rules: {e}");
                        }
                    }
                    Err(RecvError::Closed) => return,
                },
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::routing::{RouteDecision, RouteInput, RuleAction, RuleConditions};
    use crate::store::MemoryStore;
    use sip_types::Headers;
    use std::collections::HashMap;

    fn rule(id: &str, priority: u32) -> RoutingRule {
        RoutingRule {
            id: id.into(),
            priority,
            enabled: true,
            description: String::new(),
            conditions: RuleConditions::default(),
            action: RuleAction::Forward {
                next_hop: "sip:gw@192.0.2.1:5060".into(),
                add_headers: HashMap::new(),
                remove_headers: vec![],
                media_flags: String::new(),
            },
        }
    }

    #[tokio::test]
    async fn startup_seed_and_crud() {
        let store = Arc::new(MemoryStore::new());
        let engine = Arc::new(RoutingEngine::new());
        let rules = RuleStore::new(store.clone(), engine.clone());

        rules.put_rule(rule("one", 100)).await.unwrap();
        rules.put_rule(rule("two", 50)).await.unwrap();

        assert_eq!(rules.reload().await.unwrap(), 2);
        assert_eq!(engine.active_rules(), 2);

        rules.delete_rule("one").await.unwrap();
        rules.reload().await.unwrap();
        assert_eq!(engine.active_rules(), 1);

        assert!(matches!(
            rules.get_rule("one").await,
            Err(RuleStoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn malformed_blob_is_skipped() {
        let store = Arc::new(MemoryStore::new());
        let engine = Arc::new(RoutingEngine::new());
        let rules = RuleStore::new(store.clone(), engine.clone());

        rules.put_rule(rule("good", 10)).await.unwrap();
        store
            .put(&format!("{RULES_PREFIX}broken"), "{not json".into(), None)
            .await
            .unwrap();

        assert_eq!(rules.reload().await.unwrap(), 1);
        assert_eq!(engine.active_rules(), 1);

        let headers = Headers::new();
        let decision = engine.route(&RouteInput {
            request_uri: "sip:999@example.com".into(),
            from: "<sip:787@example.com>",
            to: "<sip:999@example.com>",
            source_ip: "198.51.100.4".parse().unwrap(),
            headers: &headers,
        });

        assert!(matches!(decision, RouteDecision::Forward { .. }));
    }

    #[tokio::test]
    async fn watcher_recompiles_on_change() {
        let store = Arc::new(MemoryStore::new());
        let engine = Arc::new(RoutingEngine::new());
        let rules = Arc::new(RuleStore::new(store.clone(), engine.clone()));

        let shutdown = CancellationToken::new();
        let watcher = tokio::spawn(rules.clone().run_watcher(shutdown.clone()));

        // give the watcher a chance to subscribe
        tokio::task::yield_now().await;

        rules.put_rule(rule("hot", 10)).await.unwrap();

        // the watcher runs concurrently, poll until it published
        for _ in 0..100 {
            if engine.active_rules() == 1 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        assert_eq!(engine.active_rules(), 1);

        shutdown.cancel();
        watcher.await.unwrap();
    }
}
