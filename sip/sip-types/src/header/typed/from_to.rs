use crate::header::{HeaderError, HeaderValue};
use crate::uri::{NameAddr, Params};
use crate::Name;
use bytesstr::BytesStr;
use std::fmt;

/// Value shared by the `From` and `To` headers.
///
/// [`HeaderValue`] is implemented for the `From` position, [`Headers`]
/// accessors that need the `To` header use the explicit name.
///
/// [`Headers`]: crate::Headers
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FromTo {
    pub addr: NameAddr,
    pub tag: Option<BytesStr>,
    pub params: Params,
}

impl FromTo {
    pub fn new(addr: NameAddr, tag: Option<BytesStr>) -> Self {
        Self {
            addr,
            tag,
            params: Params::new(),
        }
    }

    pub fn parse_value(value: &BytesStr) -> Result<Self, HeaderError> {
        let (addr, mut params) = NameAddr::parse(value)
            .map_err(|e| HeaderError::malformed(Name::FROM, e.to_string()))?;

        Ok(FromTo {
            addr,
            tag: params.take("tag"),
            params,
        })
    }
}

impl HeaderValue for FromTo {
    fn name() -> Name {
        Name::FROM
    }

    fn parse(value: &BytesStr) -> Result<Self, HeaderError> {
        Self::parse_value(value)
    }

    fn print(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for FromTo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.addr.fmt(f)?;

        if let Some(tag) = &self.tag {
            write!(f, ";tag={tag}")?;
        }

        self.params.fmt(f)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn from_with_tag() {
        let input = BytesStr::from_static("\"Alice\" <sip:787@example.com>;tag=9fxced76sl");

        let from = FromTo::parse_value(&input).unwrap();

        assert_eq!(from.addr.display.as_deref(), Some("Alice"));
        assert_eq!(from.addr.uri.user.as_deref(), Some("787"));
        assert_eq!(from.tag.as_deref(), Some("9fxced76sl"));
    }

    #[test]
    fn to_without_tag() {
        let input = BytesStr::from_static("sip:999@example.com");

        let to = FromTo::parse_value(&input).unwrap();

        assert!(to.tag.is_none());
        assert_eq!(to.to_string(), "<sip:999@example.com>");
    }
}
