use crate::call::{unix_now, Call, CallHandle, CallRegistry, CallState, Leg, MediaSession};
use crate::config::{LimitAction, SessionConfig};
use crate::dialog::{Dialog, DialogState};
use crate::error::{B2buaError, Result};
use crate::metrics::Metrics;
use crate::relay::MediaRelayClient;
use crate::store::KvStore;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Session record as persisted in the shared store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    pub identity: String,
    pub state: CallState,
    pub caller_call_id: String,
    pub callee_call_id: Option<String>,
    pub media: Option<MediaSession>,
    pub metadata: HashMap<String, String>,
    pub created_at: u64,
    pub updated_at: u64,
}

fn session_key(id: &str) -> String {
    format!("session:{id}")
}

fn active_key(identity: &str) -> String {
    format!("active-sessions:{identity}")
}

fn limit_key(identity: &str) -> String {
    format!("user-limit:{identity}")
}

/// How long a terminated session record stays readable for auditing
const AUDIT_TTL: Duration = Duration::from_secs(5 * 60);

/// Owns the composite call lifecycle: per identity limits, persistence to
/// the shared store and the media relay session that goes with each call.
pub struct SessionManager {
    config: SessionConfig,
    store: Arc<dyn KvStore>,
    relay: Arc<MediaRelayClient>,
    registry: Arc<CallRegistry>,
    metrics: Arc<Metrics>,

    /// identity to active session count, rebuilt from the store on startup
    counters: DashMap<String, usize>,
}

impl SessionManager {
    pub fn new(
        config: SessionConfig,
        store: Arc<dyn KvStore>,
        relay: Arc<MediaRelayClient>,
        registry: Arc<CallRegistry>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            config,
            store,
            relay,
            registry,
            metrics,
            counters: DashMap::new(),
        }
    }

    pub fn registry(&self) -> &Arc<CallRegistry> {
        &self.registry
    }

    pub fn relay(&self) -> &Arc<MediaRelayClient> {
        &self.relay
    }

    pub fn store(&self) -> &Arc<dyn KvStore> {
        &self.store
    }

    /// Rebuild the identity counters from the persisted active-session
    /// index. Run once on startup so a crashed instance's decrements are
    /// not lost forever.
    pub async fn rebuild_counters(&self) -> Result<()> {
        let entries = self
            .store
            .list_prefix("active-sessions:")
            .await
            .map_err(|e| B2buaError::StoreUnavailable(e.to_string()))?;

        self.counters.clear();

        for (key, blob) in entries {
            let identity = key.trim_start_matches("active-sessions:").to_owned();

            match serde_json::from_str::<Vec<String>>(&blob) {
                Ok(ids) => {
                    self.counters.insert(identity, ids.len());
                }
                Err(e) => {
                    log::warn!("unreadable active session index for {identity}: {e}");
                }
            }
        }

        Ok(())
    }

    pub fn active_count(&self, identity: &str) -> usize {
        self.counters.get(identity).map(|count| *count).unwrap_or(0)
    }

    async fn limit_of(&self, identity: &str) -> Result<usize> {
        // a per identity override in the store wins over static config
        let stored = self
            .store
            .get(&limit_key(identity))
            .await
            .map_err(|e| B2buaError::StoreUnavailable(e.to_string()))?;

        if let Some(limit) = stored.and_then(|blob| blob.trim().parse().ok()) {
            return Ok(limit);
        }

        Ok(self
            .config
            .user_limits
            .get(identity)
            .copied()
            .unwrap_or(self.config.default_user_limit))
    }

    /// Admit a new call for `identity`, enforcing its concurrent session
    /// cap, and persist the session record.
    ///
    /// Session creation fails closed when the store is unreachable.
    pub async fn create_session(&self, call: Call) -> Result<Arc<CallHandle>> {
        let identity = call.identity.clone();
        let limit = self.limit_of(&identity).await?;

        if self.active_count(&identity) >= limit {
            match self.config.limit_action {
                LimitAction::Reject => {
                    log::info!(
                        "rejecting call for {identity}, {limit} active sessions allowed"
                    );

                    return Err(B2buaError::LimitExceeded);
                }
                LimitAction::TerminateOldest => {
                    if let Some(oldest) = self.oldest_session_of(&identity).await {
                        log::info!(
                            "evicting oldest session {oldest} of {identity} to admit a new one"
                        );

                        self.terminate(&oldest).await;
                    } else {
                        return Err(B2buaError::LimitExceeded);
                    }
                }
            }
        }

        let record = record_of(&call);
        self.persist(&record).await?;
        self.add_to_active_index(&identity, &call.id).await?;

        *self.counters.entry(identity).or_insert(0) += 1;

        let handle = self.registry.insert(call);
        self.metrics.active_calls.set(self.registry.len() as i64);

        Ok(handle)
    }

    async fn oldest_session_of(&self, identity: &str) -> Option<String> {
        let mut oldest: Option<(String, std::time::Instant)> = None;

        for (id, handle) in self.registry.snapshot() {
            let call = handle.call.lock().await;

            if call.identity != identity || call.is_terminated() {
                continue;
            }

            if oldest
                .as_ref()
                .is_none_or(|(_, created)| call.created_at < *created)
            {
                oldest = Some((id, call.created_at));
            }
        }

        oldest.map(|(id, _)| id)
    }

    /// Bind the outbound dialog to the session once leg B exists
    pub async fn attach_callee_dialog(&self, session_id: &str, dialog: Dialog) -> Result<()> {
        let handle = self
            .registry
            .get(session_id)
            .ok_or_else(|| B2buaError::Internal(format!("unknown session {session_id}")))?;

        let key = dialog.key();

        {
            let mut call = handle.call.lock().await;
            call.callee = Some(dialog);
            call.touch();

            self.persist_call(&call).await;
        }

        self.registry.index_dialog(session_id, Leg::B, key);

        Ok(())
    }

    /// Re-index the callee dialog after its remote tag became known
    pub fn reindex_callee(&self, session_id: &str, old: &crate::dialog::DialogKey, new: crate::dialog::DialogKey) {
        self.registry.remove_dialog(old);
        self.registry.index_dialog(session_id, Leg::B, new);
    }

    /// Pass an SDP offer through the media relay, updating the persisted
    /// media state.
    ///
    /// `origin` is the leg the offer arrived on; the relay's side tags
    /// follow the offer direction.
    pub async fn process_offer(
        &self,
        session_id: &str,
        sdp: &str,
        flags: &str,
        origin: Leg,
    ) -> Result<String> {
        let handle = self
            .registry
            .get(session_id)
            .ok_or_else(|| B2buaError::Internal(format!("unknown session {session_id}")))?;

        let (relay_call_id, from_tag) = {
            let call = handle.call.lock().await;

            let tag = match origin {
                Leg::A => call.caller.local_tag.to_string(),
                Leg::B => call
                    .callee
                    .as_ref()
                    .map(|dialog| dialog.local_tag.to_string())
                    .unwrap_or_else(|| call.caller.local_tag.to_string()),
            };

            (call.caller.call_id.to_string(), tag)
        };

        let result = self.relay.offer(&relay_call_id, &from_tag, sdp, flags).await;

        self.metrics
            .relay_requests
            .with_label_values(&["offer", outcome(&result)])
            .inc();

        let rewritten = result?;

        {
            let mut call = handle.call.lock().await;

            let media = call.media.get_or_insert_with(MediaSession::new);
            media.last_offer = Some(rewritten.clone());
            media.updated_at = unix_now();
            call.touch();

            self.persist_call(&call).await;
        }

        Ok(rewritten)
    }

    /// Pass an SDP answer through the media relay. A call only transitions
    /// Connected after this succeeded.
    ///
    /// `origin` is the leg the matching offer arrived on.
    pub async fn process_answer(
        &self,
        session_id: &str,
        sdp: &str,
        flags: &str,
        origin: Leg,
    ) -> Result<String> {
        let handle = self
            .registry
            .get(session_id)
            .ok_or_else(|| B2buaError::Internal(format!("unknown session {session_id}")))?;

        let (relay_call_id, from_tag, to_tag) = {
            let call = handle.call.lock().await;

            let caller_tag = call.caller.local_tag.to_string();
            let callee_tag = call
                .callee
                .as_ref()
                .map(|dialog| dialog.local_tag.to_string())
                .unwrap_or_default();

            let (from_tag, to_tag) = match origin {
                Leg::A => (caller_tag, callee_tag),
                Leg::B => (callee_tag, caller_tag),
            };

            (call.caller.call_id.to_string(), from_tag, to_tag)
        };

        let result = self
            .relay
            .answer(&relay_call_id, &from_tag, &to_tag, sdp, flags)
            .await;

        self.metrics
            .relay_requests
            .with_label_values(&["answer", outcome(&result)])
            .inc();

        let rewritten = result?;

        {
            let mut call = handle.call.lock().await;

            let media = call.media.get_or_insert_with(MediaSession::new);
            media.last_answer = Some(rewritten.clone());
            media.updated_at = unix_now();
            call.touch();

            self.persist_call(&call).await;
        }

        Ok(rewritten)
    }

    pub async fn update_state(&self, session_id: &str, state: CallState) {
        let Some(handle) = self.registry.get(session_id) else {
            return;
        };

        let mut call = handle.call.lock().await;
        call.state = state;
        call.touch();

        if state == CallState::Connected {
            self.metrics.calls_connected.inc();
            self.metrics
                .call_setup_seconds
                .observe(call.created_at.elapsed().as_secs_f64());
        }

        self.persist_call(&call).await;
    }

    /// Tear a session down: delete the relay anchor, terminate both
    /// dialogs, free the identity slot and leave the record behind for the
    /// audit window.
    ///
    /// Idempotent, terminating an unknown or already terminated session
    /// does nothing.
    pub async fn terminate(&self, session_id: &str) {
        let Some(handle) = self.registry.remove(session_id) else {
            return;
        };

        self.metrics.active_calls.set(self.registry.len() as i64);

        let mut call = handle.call.lock().await;

        if call.is_terminated() {
            return;
        }

        call.state = CallState::Terminated;
        call.caller.state = DialogState::Terminated;
        if let Some(callee) = &mut call.callee {
            callee.state = DialogState::Terminated;
        }

        // relay failures must not leak call state, log and continue
        let delete = self
            .relay
            .delete(
                &call.caller.call_id,
                &call.caller.local_tag,
                call.callee.as_ref().map(|dialog| &*dialog.local_tag),
            )
            .await;

        self.metrics
            .relay_requests
            .with_label_values(&["delete", outcome(&delete)])
            .inc();

        if let Err(e) = delete {
            log::warn!("media relay delete for {session_id} failed: {e}");
            self.metrics.record_error(match &e {
                B2buaError::RelayTimeout => "relay_timeout",
                _ => "relay_error",
            });
        }

        let identity = call.identity.clone();

        // the registry remove above makes this run at most once per session
        if let Some(mut count) = self.counters.get_mut(&identity) {
            *count = count.saturating_sub(1);
        }

        if let Err(e) = self.remove_from_active_index(&identity, session_id).await {
            log::warn!("failed to update active session index for {identity}: {e}");
        }

        // keep the terminated record around briefly for auditing
        let mut record = record_of(&call);
        record.updated_at = unix_now();

        if let Err(e) = self
            .store
            .put(
                &session_key(session_id),
                serde_json::to_string(&record).unwrap_or_default(),
                Some(AUDIT_TTL),
            )
            .await
        {
            log::warn!("failed to persist terminated session {session_id}: {e}");
        }

        self.metrics.calls_terminated.inc();

        log::info!("session {session_id} terminated");
    }

    async fn persist(&self, record: &SessionRecord) -> Result<()> {
        let blob = serde_json::to_string(record)
            .map_err(|e| B2buaError::Internal(e.to_string()))?;

        self.store
            .put(&session_key(&record.id), blob, Some(self.config.session_ttl))
            .await
            .map_err(|e| B2buaError::StoreUnavailable(e.to_string()))
    }

    /// Best effort persistence for updates on a live call
    async fn persist_call(&self, call: &Call) {
        let record = record_of(call);

        if let Err(e) = self.persist(&record).await {
            log::warn!("failed to persist session {}: {e}", call.id);
        }
    }

    async fn add_to_active_index(&self, identity: &str, session_id: &str) -> Result<()> {
        let mut ids = self.read_active_index(identity).await?;

        if !ids.iter().any(|id| id == session_id) {
            ids.push(session_id.to_owned());
        }

        self.write_active_index(identity, &ids).await
    }

    async fn remove_from_active_index(&self, identity: &str, session_id: &str) -> Result<()> {
        let mut ids = self.read_active_index(identity).await?;
        ids.retain(|id| id != session_id);

        self.write_active_index(identity, &ids).await
    }

    async fn read_active_index(&self, identity: &str) -> Result<Vec<String>> {
        let blob = self
            .store
            .get(&active_key(identity))
            .await
            .map_err(|e| B2buaError::StoreUnavailable(e.to_string()))?;

        Ok(blob
            .and_then(|blob| serde_json::from_str(&blob).ok())
            .unwrap_or_default())
    }

    async fn write_active_index(&self, identity: &str, ids: &[String]) -> Result<()> {
        self.store
            .put(
                &active_key(identity),
                serde_json::to_string(ids).unwrap_or_default(),
                Some(self.config.session_ttl),
            )
            .await
            .map_err(|e| B2buaError::StoreUnavailable(e.to_string()))
    }

    /// Session record as currently persisted, for the management API
    pub async fn persisted_record(&self, session_id: &str) -> Result<Option<SessionRecord>> {
        let blob = self
            .store
            .get(&session_key(session_id))
            .await
            .map_err(|e| B2buaError::StoreUnavailable(e.to_string()))?;

        Ok(blob.and_then(|blob| serde_json::from_str(&blob).ok()))
    }
}

fn record_of(call: &Call) -> SessionRecord {
    SessionRecord {
        id: call.id.clone(),
        identity: call.identity.clone(),
        state: call.state,
        caller_call_id: call.caller.call_id.to_string(),
        callee_call_id: call
            .callee
            .as_ref()
            .map(|dialog| dialog.call_id.to_string()),
        media: call.media.clone(),
        metadata: call.metadata.clone(),
        created_at: unix_now(),
        updated_at: unix_now(),
    }
}

fn outcome<T>(result: &Result<T>) -> &'static str {
    match result {
        Ok(_) => "ok",
        Err(B2buaError::RelayTimeout) => "timeout",
        Err(_) => "error",
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::call::Call;
    use crate::config::RelayConfig;
    use crate::dialog::{random_string, Dialog};
    use crate::store::MemoryStore;
    use sip_types::header::typed::Contact;
    use sip_types::host::HostPort;
    use sip_types::uri::{NameAddr, SipUri};

    async fn manager(config: SessionConfig) -> SessionManager {
        let store = Arc::new(MemoryStore::new());
        let relay = Arc::new(
            MediaRelayClient::new(&RelayConfig {
                instances: vec![],
                timeout: Duration::from_millis(100),
            })
            .await
            .unwrap(),
        );

        SessionManager::new(
            config,
            store,
            relay,
            Arc::new(CallRegistry::new()),
            Arc::new(Metrics::new()),
        )
    }

    fn call(id: &str, identity: &str) -> Call {
        let target = SipUri::parse(&format!("sip:{identity}@198.51.100.4")).unwrap();
        let contact = Contact::new(NameAddr::uri(SipUri::new(
            HostPort::parse("198.51.100.1:5060").unwrap(),
        )));

        let mut dialog = Dialog::new_uac(NameAddr::uri(target.clone()), target, contact);
        dialog.remote_tag = Some(random_string());

        Call::new(id.into(), identity.into(), dialog)
    }

    #[tokio::test]
    async fn limit_rejects_at_cap() {
        let manager = manager(SessionConfig {
            default_user_limit: 2,
            ..Default::default()
        })
        .await;

        manager.create_session(call("cs-1", "787")).await.unwrap();
        manager.create_session(call("cs-2", "787")).await.unwrap();

        let result = manager.create_session(call("cs-3", "787")).await;
        assert!(matches!(result, Err(B2buaError::LimitExceeded)));

        // counter untouched by the rejected attempt
        assert_eq!(manager.active_count("787"), 2);

        // other identities are unaffected
        manager.create_session(call("cs-4", "999")).await.unwrap();
    }

    #[tokio::test]
    async fn terminate_oldest_evicts() {
        let manager = manager(SessionConfig {
            default_user_limit: 1,
            limit_action: LimitAction::TerminateOldest,
            ..Default::default()
        })
        .await;

        manager.create_session(call("cs-1", "787")).await.unwrap();
        manager.create_session(call("cs-2", "787")).await.unwrap();

        assert_eq!(manager.active_count("787"), 1);
        assert!(manager.registry().get("cs-1").is_none());
        assert!(manager.registry().get("cs-2").is_some());
    }

    #[tokio::test]
    async fn terminate_decrements_exactly_once() {
        let manager = manager(SessionConfig::default()).await;

        manager.create_session(call("cs-1", "787")).await.unwrap();
        assert_eq!(manager.active_count("787"), 1);

        manager.terminate("cs-1").await;
        manager.terminate("cs-1").await;

        assert_eq!(manager.active_count("787"), 0);
    }

    #[tokio::test]
    async fn counters_rebuild_from_store() {
        let store = Arc::new(MemoryStore::new());

        store
            .put(
                "active-sessions:787",
                serde_json::to_string(&vec!["cs-1", "cs-2"]).unwrap(),
                None,
            )
            .await
            .unwrap();

        let relay = Arc::new(
            MediaRelayClient::new(&RelayConfig {
                instances: vec![],
                timeout: Duration::from_millis(100),
            })
            .await
            .unwrap(),
        );

        let manager = SessionManager::new(
            SessionConfig::default(),
            store,
            relay,
            Arc::new(CallRegistry::new()),
            Arc::new(Metrics::new()),
        );

        manager.rebuild_counters().await.unwrap();

        assert_eq!(manager.active_count("787"), 2);
    }

    #[tokio::test]
    async fn session_record_persisted() {
        let manager = manager(SessionConfig::default()).await;

        manager.create_session(call("cs-1", "787")).await.unwrap();

        let record = manager.persisted_record("cs-1").await.unwrap().unwrap();
        assert_eq!(record.identity, "787");
        assert_eq!(record.state, CallState::Initial);
    }
}
