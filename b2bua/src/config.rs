use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

fn default_true() -> bool {
    true
}

/// Runtime configuration of the B2BUA core.
///
/// Loading this from files or a config service is the job of the outer
/// binary shell, the core consumes the finished struct.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub sip: SipConfig,
    pub auth: AuthConfig,
    pub sessions: SessionConfig,
    pub relay: RelayConfig,
    pub api: ApiConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sip: SipConfig::default(),
            auth: AuthConfig::default(),
            sessions: SessionConfig::default(),
            relay: RelayConfig::default(),
            api: ApiConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SipConfig {
    /// UDP bind addresses
    pub udp: Vec<SocketAddr>,
    /// TCP listener addresses
    pub tcp: Vec<SocketAddr>,
    /// WebSocket listener addresses
    pub ws: Vec<SocketAddr>,
    /// Identity used in the From header of outbound legs
    pub local_identity: String,
    /// Ring timeout for outbound INVITEs
    #[serde(with = "secs")]
    pub ring_timeout: Duration,
    /// Dialogs idle longer than this are swept
    #[serde(with = "secs")]
    pub dialog_timeout: Duration,
    /// INVITEs per source IP per second before 503
    pub invite_rate_limit: u32,
    /// Active call ceiling before 503
    pub max_active_calls: usize,
    /// Source address gate applied before routing
    pub acl: AclConfig,
}

impl Default for SipConfig {
    fn default() -> Self {
        Self {
            udp: vec!["0.0.0.0:5060".parse().unwrap()],
            tcp: vec![],
            ws: vec![],
            local_identity: "sip:tandem@localhost".into(),
            ring_timeout: Duration::from_secs(180),
            dialog_timeout: Duration::from_secs(30 * 60),
            invite_rate_limit: 20,
            max_active_calls: 10_000,
            acl: AclConfig::default(),
        }
    }
}

/// Source address ACL for initial requests. Deny entries always win; a
/// non-empty allow list admits only its members.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AclConfig {
    /// IPs or CIDR blocks allowed to place calls, empty allows any source
    pub allow: Vec<String>,
    /// IPs or CIDR blocks always refused
    pub deny: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub enabled: bool,
    pub realm: String,
    /// Detect and reject nonce reuse
    #[serde(default = "default_true")]
    pub replay_protection: bool,
    /// Static users, management APIs may add more at runtime
    pub users: HashMap<String, String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            realm: "tandem".into(),
            replay_protection: true,
            users: HashMap::new(),
        }
    }
}

/// What happens when an identity would exceed its session cap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitAction {
    /// Refuse the new session
    Reject,
    /// Evict the oldest session of the identity and allow the new one
    TerminateOldest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Per identity cap when no explicit limit is stored
    pub default_user_limit: usize,
    pub limit_action: LimitAction,
    /// Per identity overrides
    pub user_limits: HashMap<String, usize>,
    /// TTL on persisted session records
    #[serde(with = "secs")]
    pub session_ttl: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_user_limit: 10,
            limit_action: LimitAction::Reject,
            user_limits: HashMap::new(),
            session_ttl: Duration::from_secs(24 * 60 * 60),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub instances: Vec<RelayInstanceConfig>,
    /// Give up on a relay request after this long
    #[serde(with = "secs")]
    pub timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            instances: vec![],
            timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayInstanceConfig {
    pub id: String,
    pub addr: SocketAddr,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_weight() -> u32 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub enabled: bool,
    pub bind: SocketAddr,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: "127.0.0.1:8080".parse().unwrap(),
        }
    }
}

/// (De)serialize durations as whole seconds
mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults_deserialize_from_empty() {
        let config: Config = serde_json::from_str("{}").unwrap();

        assert_eq!(config.sessions.default_user_limit, 10);
        assert_eq!(config.sessions.limit_action, LimitAction::Reject);
        assert_eq!(config.sip.ring_timeout, Duration::from_secs(180));
    }

    #[test]
    fn limit_action_snake_case() {
        let action: LimitAction = serde_json::from_str("\"terminate_oldest\"").unwrap();
        assert_eq!(action, LimitAction::TerminateOldest);
    }
}
