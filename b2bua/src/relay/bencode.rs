//! Minimal bencoding, the media relay control protocol's wire format.
//!
//! Only what the control dictionaries need: byte strings, integers, lists
//! and dictionaries with string keys.

use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Int(i64),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Dict(BTreeMap<String, Value>),
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BencodeError {
    #[error("input ended inside a value")]
    Truncated,
    #[error("unexpected byte {0:#04x} at offset {1}")]
    Unexpected(u8, usize),
    #[error("invalid length prefix")]
    BadLength,
    #[error("invalid integer")]
    BadInt,
    #[error("dictionary key is not valid utf-8")]
    BadKey,
}

impl Value {
    pub fn str(value: impl Into<String>) -> Value {
        Value::Bytes(value.into().into_bytes())
    }

    pub fn dict(entries: impl IntoIterator<Item = (&'static str, Value)>) -> Value {
        Value::Dict(
            entries
                .into_iter()
                .map(|(k, v)| (k.to_owned(), v))
                .collect(),
        )
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Dict(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Bytes(bytes) => std::str::from_utf8(bytes).ok(),
            _ => None,
        }
    }

    /// String value of `key` in a dictionary
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.as_dict()?.get(key)?.as_str()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode_into(&mut out);
        out
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            Value::Int(i) => {
                out.extend_from_slice(format!("i{i}e").as_bytes());
            }
            Value::Bytes(bytes) => {
                out.extend_from_slice(format!("{}:", bytes.len()).as_bytes());
                out.extend_from_slice(bytes);
            }
            Value::List(items) => {
                out.push(b'l');
                for item in items {
                    item.encode_into(out);
                }
                out.push(b'e');
            }
            Value::Dict(map) => {
                out.push(b'd');
                for (key, value) in map {
                    out.extend_from_slice(format!("{}:", key.len()).as_bytes());
                    out.extend_from_slice(key.as_bytes());
                    value.encode_into(out);
                }
                out.push(b'e');
            }
        }
    }

    /// Decode a single value, returning it and the number of bytes consumed
    pub fn decode(input: &[u8]) -> Result<(Value, usize), BencodeError> {
        let mut parser = Parser { input, pos: 0 };
        let value = parser.value()?;
        Ok((value, parser.pos))
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(i) => write!(f, "{i}"),
            Value::Bytes(bytes) => write!(f, "{:?}", String::from_utf8_lossy(bytes)),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    item.fmt(f)?;
                }
                write!(f, "]")
            }
            Value::Dict(map) => {
                write!(f, "{{")?;
                for (i, (key, value)) in map.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{key}: {value}")?;
                }
                write!(f, "}}")
            }
        }
    }
}

struct Parser<'i> {
    input: &'i [u8],
    pos: usize,
}

impl Parser<'_> {
    fn peek(&self) -> Result<u8, BencodeError> {
        self.input.get(self.pos).copied().ok_or(BencodeError::Truncated)
    }

    fn bump(&mut self) -> Result<u8, BencodeError> {
        let byte = self.peek()?;
        self.pos += 1;
        Ok(byte)
    }

    fn value(&mut self) -> Result<Value, BencodeError> {
        match self.peek()? {
            b'i' => self.int(),
            b'l' => self.list(),
            b'd' => self.dict(),
            b'0'..=b'9' => Ok(Value::Bytes(self.bytes()?.to_vec())),
            byte => Err(BencodeError::Unexpected(byte, self.pos)),
        }
    }

    fn int(&mut self) -> Result<Value, BencodeError> {
        self.bump()?;

        let start = self.pos;
        while self.peek()? != b'e' {
            self.pos += 1;
        }

        let digits = std::str::from_utf8(&self.input[start..self.pos])
            .map_err(|_| BencodeError::BadInt)?;
        let value: i64 = digits.parse().map_err(|_| BencodeError::BadInt)?;

        self.bump()?;

        Ok(Value::Int(value))
    }

    fn bytes(&mut self) -> Result<&[u8], BencodeError> {
        let start = self.pos;
        while self.peek()? != b':' {
            if !self.peek()?.is_ascii_digit() {
                return Err(BencodeError::BadLength);
            }
            self.pos += 1;
        }

        let len: usize = std::str::from_utf8(&self.input[start..self.pos])
            .map_err(|_| BencodeError::BadLength)?
            .parse()
            .map_err(|_| BencodeError::BadLength)?;

        self.bump()?;

        let end = self.pos.checked_add(len).ok_or(BencodeError::BadLength)?;
        let bytes = self.input.get(self.pos..end).ok_or(BencodeError::Truncated)?;
        self.pos = end;

        Ok(bytes)
    }

    fn list(&mut self) -> Result<Value, BencodeError> {
        self.bump()?;

        let mut items = Vec::new();
        while self.peek()? != b'e' {
            items.push(self.value()?);
        }

        self.bump()?;

        Ok(Value::List(items))
    }

    fn dict(&mut self) -> Result<Value, BencodeError> {
        self.bump()?;

        let mut map = BTreeMap::new();
        while self.peek()? != b'e' {
            let key = String::from_utf8(self.bytes()?.to_vec())
                .map_err(|_| BencodeError::BadKey)?;
            let value = self.value()?;
            map.insert(key, value);
        }

        self.bump()?;

        Ok(Value::Dict(map))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn encode_dict_sorts_keys() {
        let value = Value::dict([
            ("command", Value::str("offer")),
            ("call-id", Value::str("abc@host")),
        ]);

        assert_eq!(
            value.encode(),
            b"d7:call-id8:abc@host7:command5:offere".to_vec()
        );
    }

    #[test]
    fn decode_roundtrip() {
        let value = Value::dict([
            ("result", Value::str("ok")),
            ("created", Value::Int(1722470400)),
            ("streams", Value::List(vec![Value::str("a"), Value::str("b")])),
        ]);

        let encoded = value.encode();
        let (decoded, consumed) = Value::decode(&encoded).unwrap();

        assert_eq!(decoded, value);
        assert_eq!(consumed, encoded.len());
    }

    #[test]
    fn trailing_bytes_are_reported() {
        let (value, consumed) = Value::decode(b"i42etrailing").unwrap();

        assert_eq!(value, Value::Int(42));
        assert_eq!(consumed, 4);
    }

    #[test]
    fn get_str() {
        let (value, _) = Value::decode(b"d6:result2:oke").unwrap();

        assert_eq!(value.get_str("result"), Some("ok"));
        assert_eq!(value.get_str("missing"), None);
    }

    #[test]
    fn truncated_input_errors() {
        assert_eq!(Value::decode(b"d6:resul"), Err(BencodeError::Truncated));
        assert_eq!(Value::decode(b"10:short"), Err(BencodeError::Truncated));
    }

    #[test]
    fn negative_int() {
        let (value, _) = Value::decode(b"i-7e").unwrap();
        assert_eq!(value, Value::Int(-7));
    }
}
