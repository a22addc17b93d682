//! Core part of the tandem SIP stack.
//!
//! Implements the transport and transaction abstractions the B2BUA is built
//! on: an [`Endpoint`] owning the enabled transports, a transaction registry
//! keyed per RFC 3261, and a stack of [`Layer`]s which get offered every
//! request that does not belong to an ongoing transaction.

use bytes::Bytes;
use downcast_rs::{impl_downcast, Downcast};
use sip_types::header::typed::{CSeq, CallId, FromTo, Via};
use sip_types::header::HeaderError;
use sip_types::msg::{RequestLine, StatusLine};
use sip_types::uri::SipUri;
use sip_types::{Headers, Method, Name};
use std::fmt;
use transaction::{TsxKey, TsxRegistration};
use transport::MessageTpInfo;

mod endpoint;
mod error;
mod may_take;
pub mod transaction;
pub mod transport;

pub use endpoint::{Endpoint, EndpointBuilder};
pub use error::{Error, Result};
pub use may_take::MayTake;

/// Basic response
#[derive(Debug, Clone)]
pub struct Response {
    pub line: StatusLine,
    pub headers: Headers,
    pub body: Bytes,
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.line.fmt(f)
    }
}

/// Basic request
#[derive(Debug, Clone)]
pub struct Request {
    pub line: RequestLine,
    pub headers: Headers,
    pub body: Bytes,
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.line.fmt(f)
    }
}

impl Request {
    /// Create an empty request
    pub fn new(method: Method, uri: SipUri) -> Self {
        Self {
            line: RequestLine { method, uri },
            headers: Default::default(),
            body: Bytes::new(),
        }
    }
}

/// Parsed SIP headers that are part of every message
#[derive(Debug)]
pub struct BaseHeaders {
    /// All via headers, guaranteed to not be empty
    pub via: Vec<Via>,
    pub from: FromTo,
    pub to: FromTo,
    pub call_id: CallId,
    pub cseq: CSeq,
}

impl BaseHeaders {
    fn extract_from(headers: &Headers) -> Result<Self, HeaderError> {
        let via: Vec<Via> = headers.get_named_list()?;

        if via.is_empty() {
            return Err(HeaderError::missing(Name::VIA));
        }

        let to_value = headers
            .get(&Name::TO)
            .ok_or_else(|| HeaderError::missing(Name::TO))?;

        Ok(BaseHeaders {
            via,
            from: headers.get_named()?,
            to: FromTo::parse_value(to_value)?,
            call_id: headers.get_named()?,
            cseq: headers.get_named()?,
        })
    }

    /// The Via pushed by the last hop
    pub fn top_via(&self) -> &Via {
        &self.via[0]
    }
}

/// Request received by the endpoint and passed to every layer
#[derive(Debug)]
pub struct IncomingRequest {
    pub tp_info: MessageTpInfo,
    pub tsx_key: TsxKey,
    tsx: Option<TsxRegistration>,

    pub line: RequestLine,
    pub base_headers: BaseHeaders,
    pub headers: Headers,
    pub body: Bytes,
}

impl fmt::Display for IncomingRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.line.fmt(f)
    }
}

impl IncomingRequest {
    #[track_caller]
    fn take_tsx_registration(&mut self) -> TsxRegistration {
        let Some(tsx) = self.tsx.take() else {
            panic!(
                "tried to create transaction for {:?}, which is an already handled message or isn't a transaction creating request",
                self.tsx_key
            );
        };

        tsx
    }
}

/// Layers are extensions to the endpoint.
///
/// They are added to the endpoint in the building stage and are offered every
/// incoming request which is outside any transaction, in insertion order. A
/// layer takes ownership of a request by calling [`MayTake::take`], which
/// stops the offer round.
#[async_trait::async_trait]
pub trait Layer: Downcast + Send + Sync + 'static {
    /// Return a descriptive and unique name of the layer
    fn name(&self) -> &'static str;

    /// Called while building the endpoint
    fn init(&mut self, _endpoint: &mut EndpointBuilder) {}

    async fn receive(&self, endpoint: &Endpoint, request: MayTake<'_, IncomingRequest>);
}

impl_downcast!(Layer);

#[cfg(test)]
mod test {
    use super::*;

    fn headers_of(raw: &[(&str, &str)]) -> Headers {
        let mut headers = Headers::new();

        for (name, value) in raw {
            headers.insert(*name, *value);
        }

        headers
    }

    #[test]
    fn base_headers_extraction() {
        let headers = headers_of(&[
            ("Via", "SIP/2.0/UDP 198.51.100.4;branch=z9hG4bK776asdhds"),
            ("Via", "SIP/2.0/UDP 203.0.113.1;branch=z9hG4bKnashds8"),
            ("From", "<sip:787@example.com>;tag=1928301774"),
            ("To", "<sip:999@example.com>"),
            ("Call-ID", "abc@host"),
            ("CSeq", "1 INVITE"),
        ]);

        let base = BaseHeaders::extract_from(&headers).unwrap();

        assert_eq!(base.via.len(), 2);
        assert_eq!(base.top_via().branch().unwrap(), "z9hG4bK776asdhds");
        assert_eq!(base.from.tag.as_deref(), Some("1928301774"));
        assert!(base.to.tag.is_none());
        assert_eq!(base.call_id.0, "abc@host");
        assert_eq!(base.cseq.cseq, 1);
    }

    #[test]
    fn base_headers_require_via() {
        let headers = headers_of(&[
            ("From", "<sip:787@example.com>;tag=abc"),
            ("To", "<sip:999@example.com>"),
            ("Call-ID", "abc@host"),
            ("CSeq", "1 INVITE"),
        ]);

        assert!(BaseHeaders::extract_from(&headers).is_err());
    }

    #[test]
    fn tsx_key_matches_ack_to_invite() {
        let invite_headers = headers_of(&[
            ("Via", "SIP/2.0/UDP 198.51.100.4;branch=z9hG4bK776asdhds"),
            ("From", "<sip:787@example.com>;tag=1928301774"),
            ("To", "<sip:999@example.com>;tag=aaa111"),
            ("Call-ID", "abc@host"),
            ("CSeq", "1 INVITE"),
        ]);

        let ack_headers = headers_of(&[
            ("Via", "SIP/2.0/UDP 198.51.100.4;branch=z9hG4bK776asdhds"),
            ("From", "<sip:787@example.com>;tag=1928301774"),
            ("To", "<sip:999@example.com>;tag=aaa111"),
            ("Call-ID", "abc@host"),
            ("CSeq", "1 ACK"),
        ]);

        let invite = BaseHeaders::extract_from(&invite_headers).unwrap();
        let ack = BaseHeaders::extract_from(&ack_headers).unwrap();

        let (_, invite_line) =
            sip_types::msg::MessageLine::parse("INVITE sip:999@example.com SIP/2.0").unwrap();
        let (_, ack_line) =
            sip_types::msg::MessageLine::parse("ACK sip:999@example.com SIP/2.0").unwrap();

        let invite_key = TsxKey::from_message_parts(&invite_line, &invite).unwrap();
        let ack_key = TsxKey::from_message_parts(&ack_line, &ack).unwrap();

        assert_eq!(invite_key, ack_key);
        assert!(invite_key.is_invite());
    }

    #[test]
    fn tsx_key_rfc2543_fallback() {
        let headers = headers_of(&[
            ("Via", "SIP/2.0/UDP 198.51.100.4;branch=1"),
            ("From", "<sip:787@example.com>;tag=1928301774"),
            ("To", "<sip:999@example.com>"),
            ("Call-ID", "abc@host"),
            ("CSeq", "42 OPTIONS"),
        ]);

        let base = BaseHeaders::extract_from(&headers).unwrap();

        let (_, line) =
            sip_types::msg::MessageLine::parse("OPTIONS sip:999@example.com SIP/2.0").unwrap();

        let key = TsxKey::from_message_parts(&line, &base).unwrap();

        // pre-3261 peers without the magic cookie still get a stable key
        assert!(key.is_server());
        assert_eq!(key.branch(), "");
    }
}
