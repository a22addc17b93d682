use crate::dialog::{Dialog, DialogKey};
use bytesstr::BytesStr;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::{Mutex, Notify};

/// Which leg of a call a dialog belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Leg {
    /// Inbound, caller side
    A,
    /// Outbound, callee side
    B,
}

impl Leg {
    pub fn peer(self) -> Leg {
        match self {
            Leg::A => Leg::B,
            Leg::B => Leg::A,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    Initial,
    Ringing,
    Connected,
    Holding,
    Terminating,
    Terminated,
}

/// Media side state as last reported by the relay
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MediaSession {
    pub relay_instance: Option<String>,
    pub last_offer: Option<String>,
    pub last_answer: Option<String>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl MediaSession {
    pub fn new() -> Self {
        let now = unix_now();

        Self {
            relay_instance: None,
            last_offer: None,
            last_answer: None,
            created_at: now,
            updated_at: now,
        }
    }
}

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// The composite session binding both legs and the media anchor.
///
/// A call exclusively owns its dialogs; everything else refers to them
/// through the registry's dialog index.
#[derive(Debug)]
pub struct Call {
    pub id: String,
    pub state: CallState,
    pub identity: String,

    pub caller: Dialog,
    pub callee: Option<Dialog>,

    pub media: Option<MediaSession>,

    pub metadata: HashMap<String, String>,

    pub created_at: Instant,
    pub last_activity: Instant,
}

impl Call {
    pub fn new(id: String, identity: String, caller: Dialog) -> Self {
        let now = Instant::now();

        Self {
            id,
            state: CallState::Initial,
            identity,
            caller,
            callee: None,
            media: None,
            metadata: HashMap::new(),
            created_at: now,
            last_activity: now,
        }
    }

    pub fn dialog(&self, leg: Leg) -> Option<&Dialog> {
        match leg {
            Leg::A => Some(&self.caller),
            Leg::B => self.callee.as_ref(),
        }
    }

    pub fn dialog_mut(&mut self, leg: Leg) -> Option<&mut Dialog> {
        match leg {
            Leg::A => Some(&mut self.caller),
            Leg::B => self.callee.as_mut(),
        }
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn is_terminated(&self) -> bool {
        matches!(self.state, CallState::Terminated)
    }
}

/// Shared handle to one call plus its control signals
pub struct CallHandle {
    pub call: Mutex<Call>,
    /// Fired when the A leg acknowledges a pending 2xx, stops retransmissions
    pub ack_received: Notify,
    /// Whether the initial INVITE's ACK was already stitched through to leg B
    pub initial_ack_done: std::sync::atomic::AtomicBool,
}

/// All live calls, indexed by session id and by the dialog keys of both
/// legs.
///
/// The map is sharded internally, readers wanting a listing take a snapshot
/// instead of holding iterators over live shards.
#[derive(Default)]
pub struct CallRegistry {
    calls: DashMap<String, Arc<CallHandle>>,
    dialogs: DashMap<DialogKey, (String, Leg)>,
}

impl CallRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Derive the synthetic session id from the inbound Call-ID
    pub fn session_id(inbound_call_id: &BytesStr) -> String {
        format!("cs-{}", hex::encode(fnv1a(inbound_call_id.as_bytes())))
    }

    pub fn insert(&self, call: Call) -> Arc<CallHandle> {
        let id = call.id.clone();
        let caller_key = call.caller.key();

        let handle = Arc::new(CallHandle {
            call: Mutex::new(call),
            ack_received: Notify::new(),
            initial_ack_done: std::sync::atomic::AtomicBool::new(false),
        });

        self.calls.insert(id.clone(), handle.clone());
        self.dialogs.insert(caller_key, (id, Leg::A));

        handle
    }

    /// Register the callee dialog of an existing call in the index
    pub fn index_dialog(&self, call_id: &str, leg: Leg, key: DialogKey) {
        self.dialogs.insert(key, (call_id.to_owned(), leg));
    }

    pub fn remove_dialog(&self, key: &DialogKey) {
        self.dialogs.remove(key);
    }

    pub fn get(&self, call_id: &str) -> Option<Arc<CallHandle>> {
        self.calls.get(call_id).map(|handle| handle.clone())
    }

    /// Find the call owning the dialog an in-dialog request addresses.
    ///
    /// Early UAC dialogs are indexed without a remote tag, so a fallback
    /// lookup without the tag catches requests racing dialog confirmation.
    pub fn find_by_dialog(&self, key: &DialogKey) -> Option<(Arc<CallHandle>, Leg)> {
        let lookup = |key: &DialogKey| {
            self.dialogs.get(key).and_then(|entry| {
                let (call_id, leg) = entry.value().clone();
                Some((self.get(&call_id)?, leg))
            })
        };

        lookup(key).or_else(|| {
            let untagged = DialogKey {
                call_id: key.call_id.clone(),
                local_tag: key.local_tag.clone(),
                remote_tag: None,
            };

            lookup(&untagged)
        })
    }

    /// Drop a call and all its index entries
    pub fn remove(&self, call_id: &str) -> Option<Arc<CallHandle>> {
        let (_, handle) = self.calls.remove(call_id)?;

        self.dialogs.retain(|_, value| value.0 != call_id);

        Some(handle)
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Immutable snapshot of all call handles for listings and sweeps
    pub fn snapshot(&self) -> Vec<(String, Arc<CallHandle>)> {
        self.calls
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }
}

/// FNV-1a digest, session ids only need to be opaque and stable
fn fnv1a(input: &[u8]) -> [u8; 8] {
    let mut hash: u64 = 0xcbf29ce484222325;

    for &byte in input {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x100000001b3);
    }

    hash.to_be_bytes()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::dialog::{random_string, Dialog};
    use sip_types::header::typed::Contact;
    use sip_types::host::HostPort;
    use sip_types::uri::{NameAddr, SipUri};

    fn caller_dialog() -> Dialog {
        let target = SipUri::parse("sip:787@198.51.100.4").unwrap();
        let contact = Contact::new(NameAddr::uri(SipUri::new(
            HostPort::parse("198.51.100.1:5060").unwrap(),
        )));

        let mut dialog = Dialog::new_uac(NameAddr::uri(target.clone()), target, contact);
        dialog.remote_tag = Some(random_string());
        dialog
    }

    #[test]
    fn session_id_is_stable_and_opaque() {
        let a = CallRegistry::session_id(&"abc@host".into());
        let b = CallRegistry::session_id(&"abc@host".into());
        let c = CallRegistry::session_id(&"other@host".into());

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("cs-"));
    }

    #[tokio::test]
    async fn dialog_index_finds_call_and_leg() {
        let registry = CallRegistry::new();

        let caller = caller_dialog();
        let key = caller.key();

        registry.insert(Call::new("cs-1".into(), "787".into(), caller));

        let (handle, leg) = registry.find_by_dialog(&key).unwrap();
        assert_eq!(leg, Leg::A);
        assert_eq!(handle.call.lock().await.id, "cs-1");
    }

    #[tokio::test]
    async fn remove_clears_dialog_index() {
        let registry = CallRegistry::new();

        let caller = caller_dialog();
        let key = caller.key();

        registry.insert(Call::new("cs-1".into(), "787".into(), caller));
        registry.remove("cs-1");

        assert!(registry.find_by_dialog(&key).is_none());
        assert!(registry.is_empty());
    }
}
