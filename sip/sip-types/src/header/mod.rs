//! Contains everything header related

use bytesstr::BytesStr;

pub mod headers;
pub mod name;
pub mod typed;

use name::Name;

/// Error returned by typed header accessors
#[derive(Debug, thiserror::Error)]
pub enum HeaderError {
    #[error("missing header {0}")]
    Missing(Name),
    #[error("malformed {name} header: {detail}")]
    Malformed { name: Name, detail: String },
}

impl HeaderError {
    pub fn missing(name: Name) -> Self {
        Self::Missing(name)
    }

    pub fn malformed(name: Name, detail: impl Into<String>) -> Self {
        Self::Malformed {
            name,
            detail: detail.into(),
        }
    }
}

/// A header type which can be parsed from and printed to a single header value
pub trait HeaderValue: Sized {
    /// Name the header is stored under
    fn name() -> Name;

    /// Parse the typed representation from a raw header value
    fn parse(value: &BytesStr) -> Result<Self, HeaderError>;

    /// Print the value as it appears after `Name: ` on the wire
    fn print(&self) -> String;
}

/// Split a header value on top level commas, respecting `<>` brackets and
/// quoted strings. Used for headers that allow the comma separated list form
/// (Via, Route, Record-Route, Contact).
pub fn comma_split(value: &str) -> impl Iterator<Item = &str> {
    let mut items = Vec::new();
    let mut depth = 0usize;
    let mut in_quotes = false;
    let mut start = 0;

    for (i, c) in value.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            '<' if !in_quotes => depth += 1,
            '>' if !in_quotes => depth = depth.saturating_sub(1),
            ',' if !in_quotes && depth == 0 => {
                items.push(value[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }

    items.push(value[start..].trim());

    items.into_iter().filter(|item| !item.is_empty())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn comma_split_plain() {
        let items: Vec<_> = comma_split("a, b ,c").collect();
        assert_eq!(items, vec!["a", "b", "c"]);
    }

    #[test]
    fn comma_split_brackets_and_quotes() {
        let items: Vec<_> =
            comma_split(r#""Smith, John" <sip:a@h;lr>, <sip:b@h>"#).collect();
        assert_eq!(items, vec![r#""Smith, John" <sip:a@h;lr>"#, "<sip:b@h>"]);
    }
}
