use crate::header::{HeaderError, HeaderValue};
use crate::{Method, Name};
use bytesstr::BytesStr;
use std::fmt;

/// `CSeq` header
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CSeq {
    pub cseq: u32,
    pub method: Method,
}

impl CSeq {
    pub fn new(cseq: u32, method: Method) -> Self {
        Self { cseq, method }
    }
}

impl HeaderValue for CSeq {
    fn name() -> Name {
        Name::CSEQ
    }

    fn parse(value: &BytesStr) -> Result<Self, HeaderError> {
        let malformed = || HeaderError::malformed(Name::CSEQ, value.to_string());

        let (cseq, method) = value.trim().split_once(char::is_whitespace).ok_or_else(malformed)?;

        Ok(CSeq {
            cseq: cseq.parse().map_err(|_| malformed())?,
            method: Method::from(method.trim()),
        })
    }

    fn print(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for CSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.cseq, self.method)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn cseq() {
        let cseq = CSeq::parse(&BytesStr::from_static("314159 INVITE")).unwrap();

        assert_eq!(cseq.cseq, 314159);
        assert_eq!(cseq.method, Method::INVITE);
        assert_eq!(cseq.to_string(), "314159 INVITE");
    }
}
