//! Typed representations for the headers the B2BUA inspects or constructs.
//!
//! Everything else passes through [`Headers`](crate::Headers) untouched.

use super::{HeaderError, HeaderValue};
use crate::Name;
use bytesstr::BytesStr;

mod auth;
mod call_id;
mod contact;
mod cseq;
mod from_to;
mod routing;
mod via;

pub use auth::{DigestChallenge, DigestResponse};
pub use call_id::CallId;
pub use contact::Contact;
pub use cseq::CSeq;
pub use from_to::FromTo;
pub use routing::{RecordRoute, Route};
pub use via::Via;

macro_rules! u32_header {
    ($(#[$meta:meta])* $struct_name:ident, $header_name:expr) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $struct_name(pub u32);

        impl HeaderValue for $struct_name {
            fn name() -> Name {
                $header_name
            }

            fn parse(value: &BytesStr) -> Result<Self, HeaderError> {
                value
                    .trim()
                    .parse()
                    .map(Self)
                    .map_err(|_| HeaderError::malformed($header_name, value.to_string()))
            }

            fn print(&self) -> String {
                self.0.to_string()
            }
        }
    };
}

u32_header!(
    /// `Max-Forwards` header
    MaxForwards,
    Name::MAX_FORWARDS
);

u32_header!(
    /// `Expires` header
    Expires,
    Name::EXPIRES
);

u32_header!(
    /// `Content-Length` header
    ContentLength,
    Name::CONTENT_LENGTH
);

/// `Content-Type` header
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContentType(pub BytesStr);

impl ContentType {
    pub fn sdp() -> Self {
        Self(BytesStr::from_static("application/sdp"))
    }
}

impl HeaderValue for ContentType {
    fn name() -> Name {
        Name::CONTENT_TYPE
    }

    fn parse(value: &BytesStr) -> Result<Self, HeaderError> {
        Ok(Self(BytesStr::from(value.trim())))
    }

    fn print(&self) -> String {
        self.0.to_string()
    }
}

/// Single entry of an `Allow` header
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Allow(pub crate::Method);

impl HeaderValue for Allow {
    fn name() -> Name {
        Name::ALLOW
    }

    fn parse(value: &BytesStr) -> Result<Self, HeaderError> {
        Ok(Self(crate::Method::from(value.trim())))
    }

    fn print(&self) -> String {
        self.0.to_string()
    }
}
