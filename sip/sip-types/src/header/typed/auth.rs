use crate::header::{comma_split, HeaderError, HeaderValue};
use crate::Name;
use bytesstr::BytesStr;
use std::fmt;

fn parse_digest_params(
    name: Name,
    value: &BytesStr,
) -> Result<Vec<(BytesStr, BytesStr)>, HeaderError> {
    let rest = value
        .trim()
        .strip_prefix("Digest")
        .ok_or_else(|| HeaderError::malformed(name.clone(), "not a digest scheme"))?;

    let mut params = Vec::new();

    for item in comma_split(rest) {
        let (key, val) = item
            .split_once('=')
            .ok_or_else(|| HeaderError::malformed(name.clone(), item.to_string()))?;

        params.push((
            BytesStr::from(key.trim()),
            BytesStr::from(val.trim().trim_matches('"')),
        ));
    }

    Ok(params)
}

fn get_param<'p>(params: &'p [(BytesStr, BytesStr)], key: &str) -> Option<&'p BytesStr> {
    params
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(key))
        .map(|(_, v)| v)
}

/// `WWW-Authenticate: Digest …` challenge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestChallenge {
    pub realm: BytesStr,
    pub nonce: BytesStr,
    pub algorithm: BytesStr,
    pub qop: Option<BytesStr>,
}

impl HeaderValue for DigestChallenge {
    fn name() -> Name {
        Name::WWW_AUTHENTICATE
    }

    fn parse(value: &BytesStr) -> Result<Self, HeaderError> {
        let params = parse_digest_params(Name::WWW_AUTHENTICATE, value)?;
        let missing = |key: &str| {
            HeaderError::malformed(Name::WWW_AUTHENTICATE, format!("missing {key}"))
        };

        Ok(DigestChallenge {
            realm: get_param(&params, "realm").ok_or_else(|| missing("realm"))?.clone(),
            nonce: get_param(&params, "nonce").ok_or_else(|| missing("nonce"))?.clone(),
            algorithm: get_param(&params, "algorithm")
                .cloned()
                .unwrap_or_else(|| BytesStr::from_static("MD5")),
            qop: get_param(&params, "qop").cloned(),
        })
    }

    fn print(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for DigestChallenge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Digest realm=\"{}\", nonce=\"{}\", algorithm={}",
            self.realm, self.nonce, self.algorithm
        )?;

        if let Some(qop) = &self.qop {
            write!(f, ", qop=\"{qop}\"")?;
        }

        Ok(())
    }
}

/// `Authorization: Digest …` response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestResponse {
    pub username: BytesStr,
    pub realm: BytesStr,
    pub nonce: BytesStr,
    pub uri: BytesStr,
    pub response: BytesStr,
    pub qop: Option<BytesStr>,
    pub nc: Option<BytesStr>,
    pub cnonce: Option<BytesStr>,
}

impl HeaderValue for DigestResponse {
    fn name() -> Name {
        Name::AUTHORIZATION
    }

    fn parse(value: &BytesStr) -> Result<Self, HeaderError> {
        let params = parse_digest_params(Name::AUTHORIZATION, value)?;
        let missing =
            |key: &str| HeaderError::malformed(Name::AUTHORIZATION, format!("missing {key}"));

        Ok(DigestResponse {
            username: get_param(&params, "username").ok_or_else(|| missing("username"))?.clone(),
            realm: get_param(&params, "realm").ok_or_else(|| missing("realm"))?.clone(),
            nonce: get_param(&params, "nonce").ok_or_else(|| missing("nonce"))?.clone(),
            uri: get_param(&params, "uri").ok_or_else(|| missing("uri"))?.clone(),
            response: get_param(&params, "response").ok_or_else(|| missing("response"))?.clone(),
            qop: get_param(&params, "qop").cloned(),
            nc: get_param(&params, "nc").cloned(),
            cnonce: get_param(&params, "cnonce").cloned(),
        })
    }

    fn print(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for DigestResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\", response=\"{}\"",
            self.username, self.realm, self.nonce, self.uri, self.response
        )?;

        if let Some(qop) = &self.qop {
            write!(f, ", qop={qop}")?;
        }
        if let Some(nc) = &self.nc {
            write!(f, ", nc={nc}")?;
        }
        if let Some(cnonce) = &self.cnonce {
            write!(f, ", cnonce=\"{cnonce}\"")?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn challenge_roundtrip() {
        let challenge = DigestChallenge {
            realm: "voice.local".into(),
            nonce: "abcdef0123456789".into(),
            algorithm: "MD5".into(),
            qop: Some("auth".into()),
        };

        let printed = BytesStr::from(challenge.print());
        let reparsed = DigestChallenge::parse(&printed).unwrap();

        assert_eq!(challenge, reparsed);
    }

    #[test]
    fn response_parse() {
        let input = BytesStr::from_static(
            "Digest username=\"787\", realm=\"voice.local\", nonce=\"n1\", \
             uri=\"sip:999@voice.local\", response=\"deadbeef\", qop=auth, \
             nc=00000001, cnonce=\"0a4f113b\"",
        );

        let response = DigestResponse::parse(&input).unwrap();

        assert_eq!(response.username, "787");
        assert_eq!(response.realm, "voice.local");
        assert_eq!(response.nonce, "n1");
        assert_eq!(response.qop.as_deref(), Some("auth"));
        assert_eq!(response.nc.as_deref(), Some("00000001"));
    }

    #[test]
    fn rejects_basic_scheme() {
        let input = BytesStr::from_static("Basic dXNlcjpwYXNz");
        assert!(DigestResponse::parse(&input).is_err());
    }
}
