use crate::nonce::{NonceError, NonceStore};
use crate::UserStore;
use sip_types::header::typed::{DigestChallenge, DigestResponse};
use sip_types::Method;
use std::net::IpAddr;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("unknown user {0}")]
    UnknownUser(String),
    #[error("response is for realm {0}, not ours")]
    WrongRealm(String),
    #[error("unsupported qop {0}")]
    UnsupportedQop(String),
    #[error("qop response is missing nc or cnonce")]
    IncompleteQop,
    #[error(transparent)]
    Nonce(#[from] NonceError),
    #[error("digest response does not match")]
    WrongResponse,
}

/// Validates `Authorization: Digest` headers against the configured realm
/// and user store, and mints the matching challenges.
pub struct DigestAuthenticator {
    realm: String,
    users: UserStore,
    nonces: NonceStore,

    /// Reject nonces that were already used once. On by default.
    pub replay_protection: bool,
}

impl DigestAuthenticator {
    pub fn new(realm: impl Into<String>, users: UserStore) -> Self {
        Self {
            realm: realm.into(),
            users,
            nonces: NonceStore::new(),
            replay_protection: true,
        }
    }

    pub fn realm(&self) -> &str {
        &self.realm
    }

    pub fn users(&self) -> &UserStore {
        &self.users
    }

    pub fn nonces(&self) -> &NonceStore {
        &self.nonces
    }

    /// Mint a fresh challenge for a client.
    ///
    /// `Digest realm="...", nonce="...", algorithm=MD5, qop="auth"`
    pub fn create_challenge(&self, client_ip: IpAddr) -> DigestChallenge {
        DigestChallenge {
            realm: self.realm.as_str().into(),
            nonce: self.nonces.mint(client_ip),
            algorithm: "MD5".into(),
            qop: Some("auth".into()),
        }
    }

    /// Validate a digest response for a request of the given method.
    ///
    /// Returns the authenticated username on success.
    pub fn verify(
        &self,
        method: &Method,
        authorization: &DigestResponse,
        client_ip: IpAddr,
    ) -> Result<String, AuthError> {
        if authorization.realm != self.realm.as_str() {
            return Err(AuthError::WrongRealm(authorization.realm.to_string()));
        }

        self.nonces
            .consume(&authorization.nonce, client_ip, self.replay_protection)?;

        let username = authorization.username.to_string();

        let password = self
            .users
            .password_of(&username)
            .ok_or_else(|| AuthError::UnknownUser(username.clone()))?;

        let ha1 = hash_md5(format!("{}:{}:{}", username, self.realm, password));
        let ha2 = hash_md5(format!("{}:{}", method, authorization.uri));

        let expected = match authorization.qop.as_deref() {
            None => hash_md5(format!("{}:{}:{}", ha1, authorization.nonce, ha2)),
            Some("auth") => {
                let nc = authorization.nc.as_ref().ok_or(AuthError::IncompleteQop)?;
                let cnonce = authorization
                    .cnonce
                    .as_ref()
                    .ok_or(AuthError::IncompleteQop)?;

                hash_md5(format!(
                    "{}:{}:{}:{}:auth:{}",
                    ha1, authorization.nonce, nc, cnonce, ha2
                ))
            }
            Some(other) => return Err(AuthError::UnsupportedQop(other.to_string())),
        };

        if expected.eq_ignore_ascii_case(&authorization.response) {
            Ok(username)
        } else {
            Err(AuthError::WrongResponse)
        }
    }
}

fn hash_md5(i: String) -> String {
    format!("{:x}", md5::compute(i))
}

#[cfg(test)]
mod test {
    use super::*;
    use bytesstr::BytesStr;
    use std::net::Ipv4Addr;

    fn client_ip() -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(198, 51, 100, 4))
    }

    fn test_authenticator() -> DigestAuthenticator {
        let users = UserStore::new();
        users.add_user("787", "12345");

        DigestAuthenticator::new("voice.local", users)
    }

    fn response_for(nonce: &str, response: String) -> DigestResponse {
        DigestResponse {
            username: "787".into(),
            realm: "voice.local".into(),
            nonce: nonce.into(),
            uri: "sip:999@voice.local".into(),
            response: BytesStr::from(response),
            qop: None,
            nc: None,
            cnonce: None,
        }
    }

    #[test]
    fn challenge_then_valid_response() {
        let authenticator = test_authenticator();

        let challenge = authenticator.create_challenge(client_ip());
        assert_eq!(challenge.realm, "voice.local");
        assert_eq!(challenge.algorithm, "MD5");

        // response' = MD5(MD5(user:realm:password):nonce:MD5(method:uri))
        let ha1 = hash_md5("787:voice.local:12345".into());
        let ha2 = hash_md5("INVITE:sip:999@voice.local".into());
        let response = hash_md5(format!("{}:{}:{}", ha1, challenge.nonce, ha2));

        let username = authenticator
            .verify(
                &Method::INVITE,
                &response_for(&challenge.nonce, response),
                client_ip(),
            )
            .unwrap();

        assert_eq!(username, "787");
    }

    #[test]
    fn qop_auth_response() {
        let authenticator = test_authenticator();
        let challenge = authenticator.create_challenge(client_ip());

        let ha1 = hash_md5("787:voice.local:12345".into());
        let ha2 = hash_md5("INVITE:sip:999@voice.local".into());
        let response = hash_md5(format!(
            "{}:{}:00000001:0a4f113b:auth:{}",
            ha1, challenge.nonce, ha2
        ));

        let mut authorization = response_for(&challenge.nonce, response);
        authorization.qop = Some("auth".into());
        authorization.nc = Some("00000001".into());
        authorization.cnonce = Some("0a4f113b".into());

        assert!(authenticator
            .verify(&Method::INVITE, &authorization, client_ip())
            .is_ok());
    }

    #[test]
    fn wrong_password_is_rejected() {
        let authenticator = test_authenticator();
        let challenge = authenticator.create_challenge(client_ip());

        let ha1 = hash_md5("787:voice.local:wrong".into());
        let ha2 = hash_md5("INVITE:sip:999@voice.local".into());
        let response = hash_md5(format!("{}:{}:{}", ha1, challenge.nonce, ha2));

        let result = authenticator.verify(
            &Method::INVITE,
            &response_for(&challenge.nonce, response),
            client_ip(),
        );

        assert!(matches!(result, Err(AuthError::WrongResponse)));
    }

    #[test]
    fn nonce_is_single_use() {
        let authenticator = test_authenticator();
        let challenge = authenticator.create_challenge(client_ip());

        let ha1 = hash_md5("787:voice.local:12345".into());
        let ha2 = hash_md5("INVITE:sip:999@voice.local".into());
        let response = hash_md5(format!("{}:{}:{}", ha1, challenge.nonce, ha2));

        let authorization = response_for(&challenge.nonce, response);

        assert!(authenticator
            .verify(&Method::INVITE, &authorization, client_ip())
            .is_ok());

        let result = authenticator.verify(&Method::INVITE, &authorization, client_ip());
        assert!(matches!(result, Err(AuthError::Nonce(NonceError::Replayed))));
    }

    #[test]
    fn unknown_nonce_is_rejected() {
        let authenticator = test_authenticator();

        let result = authenticator.verify(
            &Method::INVITE,
            &response_for("deadbeef", "00".into()),
            client_ip(),
        );

        assert!(matches!(result, Err(AuthError::Nonce(NonceError::Unknown))));
    }
}
