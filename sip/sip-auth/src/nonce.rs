use bytesstr::BytesStr;
use parking_lot::Mutex;
use rand::RngCore;
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// How long a nonce is accepted after issuance
pub const NONCE_VALID_FOR: Duration = Duration::from_secs(5 * 60);

/// How long a nonce entry is kept before garbage collection
pub const NONCE_GC_AFTER: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum NonceError {
    #[error("nonce is unknown")]
    Unknown,
    #[error("nonce has expired")]
    Expired,
    #[error("nonce was already used")]
    Replayed,
    #[error("nonce was issued to a different client")]
    WrongClient,
}

struct NonceEntry {
    issued_at: Instant,
    client_ip: IpAddr,
    consumed: bool,
}

/// Store of all outstanding nonces.
///
/// All operations are O(1) hash table accesses behind a single mutex.
#[derive(Default)]
pub struct NonceStore {
    entries: Mutex<HashMap<String, NonceEntry>>,
}

impl NonceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mint a new nonce bound to `client_ip`.
    ///
    /// The value is 16 bytes of CSPRNG output followed by the issuance
    /// timestamp, hex encoded.
    pub fn mint(&self, client_ip: IpAddr) -> BytesStr {
        let mut bytes = [0u8; 24];
        rand::rng().fill_bytes(&mut bytes[..16]);

        let unix_secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        bytes[16..].copy_from_slice(&unix_secs.to_be_bytes());

        let nonce = BytesStr::from(hex::encode(bytes));

        self.entries.lock().insert(
            nonce.to_string(),
            NonceEntry {
                issued_at: Instant::now(),
                client_ip,
                consumed: false,
            },
        );

        nonce
    }

    /// Validate `nonce` for a request from `client_ip` and mark it consumed.
    ///
    /// With `replay_protection` a nonce is accepted at most once; without it
    /// any number of uses within the validity window pass.
    pub fn consume(
        &self,
        nonce: &str,
        client_ip: IpAddr,
        replay_protection: bool,
    ) -> Result<(), NonceError> {
        let mut entries = self.entries.lock();

        let entry = entries.get_mut(nonce).ok_or(NonceError::Unknown)?;

        if entry.issued_at.elapsed() > NONCE_VALID_FOR {
            return Err(NonceError::Expired);
        }

        if entry.client_ip != client_ip {
            return Err(NonceError::WrongClient);
        }

        if replay_protection && entry.consumed {
            return Err(NonceError::Replayed);
        }

        entry.consumed = true;

        Ok(())
    }

    /// Drop all entries past the garbage collection age. Returns how many
    /// were evicted.
    pub fn evict_expired(&self) -> usize {
        let mut entries = self.entries.lock();

        let before = entries.len();
        entries.retain(|_, entry| entry.issued_at.elapsed() < NONCE_GC_AFTER);

        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::net::Ipv4Addr;

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(192, 0, 2, last))
    }

    #[test]
    fn mint_and_consume() {
        let store = NonceStore::new();

        let nonce = store.mint(ip(1));

        assert_eq!(nonce.len(), 48);
        assert_eq!(store.consume(&nonce, ip(1), true), Ok(()));
    }

    #[test]
    fn replay_detection() {
        let store = NonceStore::new();
        let nonce = store.mint(ip(1));

        assert_eq!(store.consume(&nonce, ip(1), true), Ok(()));
        assert_eq!(store.consume(&nonce, ip(1), true), Err(NonceError::Replayed));
    }

    #[test]
    fn replay_allowed_without_protection() {
        let store = NonceStore::new();
        let nonce = store.mint(ip(1));

        assert_eq!(store.consume(&nonce, ip(1), false), Ok(()));
        assert_eq!(store.consume(&nonce, ip(1), false), Ok(()));
    }

    #[test]
    fn unknown_nonce() {
        let store = NonceStore::new();

        assert_eq!(
            store.consume("deadbeef", ip(1), true),
            Err(NonceError::Unknown)
        );
    }

    #[test]
    fn wrong_client() {
        let store = NonceStore::new();
        let nonce = store.mint(ip(1));

        assert_eq!(
            store.consume(&nonce, ip(2), true),
            Err(NonceError::WrongClient)
        );
    }

    #[test]
    fn eviction_keeps_fresh_nonces() {
        let store = NonceStore::new();
        store.mint(ip(1));

        assert_eq!(store.evict_expired(), 0);
        assert_eq!(store.len(), 1);
    }
}
