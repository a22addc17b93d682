use crate::header::{HeaderError, HeaderValue};
use crate::Name;
use bytesstr::BytesStr;

/// `Call-ID` header
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CallId(pub BytesStr);

impl CallId {
    pub fn new(id: impl Into<BytesStr>) -> Self {
        Self(id.into())
    }
}

impl HeaderValue for CallId {
    fn name() -> Name {
        Name::CALL_ID
    }

    fn parse(value: &BytesStr) -> Result<Self, HeaderError> {
        let value = value.trim();

        if value.is_empty() {
            return Err(HeaderError::malformed(Name::CALL_ID, "empty"));
        }

        Ok(Self(BytesStr::from(value)))
    }

    fn print(&self) -> String {
        self.0.to_string()
    }
}
