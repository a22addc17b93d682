use super::{HeaderError, HeaderValue, comma_split};
use crate::header::name::Name;
use bytesstr::BytesStr;
use std::fmt;

/// Ordered multimap of SIP message headers.
///
/// Every value is kept as its own entry in arrival order, so printing the map
/// reproduces the exact header sequence of the original message. Lookup
/// normalizes names (case and compact forms), printing uses the name exactly
/// as it was inserted.
#[derive(Debug, Default, Clone)]
pub struct Headers {
    entries: Vec<(Name, BytesStr)>,
}

impl Headers {
    #[inline]
    pub const fn new() -> Self {
        Headers {
            entries: Vec::new(),
        }
    }

    #[inline]
    pub fn with_capacity(capacity: usize) -> Self {
        Headers {
            entries: Vec::with_capacity(capacity),
        }
    }

    /// Append a raw header value
    pub fn insert<N, V>(&mut self, name: N, value: V)
    where
        N: Into<Name>,
        V: Into<BytesStr>,
    {
        self.entries.push((name.into(), value.into()));
    }

    /// Insert a raw header value at the front of the map
    pub fn insert_front<N, V>(&mut self, name: N, value: V)
    where
        N: Into<Name>,
        V: Into<BytesStr>,
    {
        self.entries.insert(0, (name.into(), value.into()));
    }

    /// Append a typed header
    pub fn insert_named<H: HeaderValue>(&mut self, header: &H) {
        self.insert(H::name(), header.print());
    }

    /// Insert a typed header at the front of the map
    pub fn insert_named_front<H: HeaderValue>(&mut self, header: &H) {
        self.insert_front(H::name(), header.print());
    }

    /// Replace all values of `name` with a single `value`, keeping the
    /// position of the first occurrence (or appending if absent)
    pub fn replace<N, V>(&mut self, name: N, value: V)
    where
        N: Into<Name>,
        V: Into<BytesStr>,
    {
        let name = name.into();

        if let Some(pos) = self.entries.iter().position(|(n, _)| *n == name) {
            self.entries.retain(|(n, _)| *n != name);
            self.entries.insert(pos, (name, value.into()));
        } else {
            self.entries.push((name, value.into()));
        }
    }

    pub fn contains(&self, name: &Name) -> bool {
        self.entries.iter().any(|(n, _)| n == name)
    }

    /// First raw value stored under `name`
    pub fn get(&self, name: &Name) -> Option<&BytesStr> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }

    /// All raw values stored under `name`, in order
    pub fn get_all<'s>(&'s self, name: &'s Name) -> impl Iterator<Item = &'s BytesStr> + 's {
        self.entries
            .iter()
            .filter(move |(n, _)| n == name)
            .map(|(_, v)| v)
    }

    /// Remove all values of `name`, returning them in order
    pub fn remove(&mut self, name: &Name) -> Vec<BytesStr> {
        let mut removed = Vec::new();

        self.entries.retain(|(n, v)| {
            if n == name {
                removed.push(v.clone());
                false
            } else {
                true
            }
        });

        removed
    }

    /// Remove the topmost value of `name`, keeping the rest
    pub fn pop_front(&mut self, name: &Name) -> Option<BytesStr> {
        let pos = self.entries.iter().position(|(n, _)| n == name)?;
        Some(self.entries.remove(pos).1)
    }

    /// Parse the first value of the header as `H`
    pub fn get_named<H: HeaderValue>(&self) -> Result<H, HeaderError> {
        let value = self
            .get(&H::name())
            .ok_or_else(|| HeaderError::missing(H::name()))?;

        H::parse(value)
    }

    /// Parse the first value of the header as `H`, `None` if absent
    pub fn try_get_named<H: HeaderValue>(&self) -> Option<Result<H, HeaderError>> {
        self.get(&H::name()).map(H::parse)
    }

    /// Parse every value of the header as `H`, splitting comma separated
    /// list forms. Returns an empty vec if the header is absent.
    pub fn get_named_list<H: HeaderValue>(&self) -> Result<Vec<H>, HeaderError> {
        let mut out = Vec::new();

        for value in self.get_all(&H::name()) {
            for item in comma_split(value) {
                out.push(H::parse(&BytesStr::from(item))?);
            }
        }

        Ok(out)
    }

    /// Clone all values of `name` into `dest`, preserving order
    pub fn clone_into(&self, dest: &mut Self, name: Name) {
        for value in self.get_all(&name) {
            dest.insert(name.clone(), value.clone());
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Name, &BytesStr)> + '_ {
        self.entries.iter().map(|(n, v)| (n, v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Display for Headers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, value) in self.iter() {
            write!(f, "{}: {}\r\n", name.as_print_str(), value)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::header::typed::MaxForwards;

    #[test]
    fn order_preserved_across_names() {
        let mut headers = Headers::new();
        headers.insert(Name::VIA, "SIP/2.0/UDP a;branch=z9hG4bK1");
        headers.insert(Name::MAX_FORWARDS, "70");
        headers.insert(Name::VIA, "SIP/2.0/UDP b;branch=z9hG4bK2");

        let printed = headers.to_string();
        assert_eq!(
            printed,
            "Via: SIP/2.0/UDP a;branch=z9hG4bK1\r\nMax-Forwards: 70\r\nVia: SIP/2.0/UDP b;branch=z9hG4bK2\r\n"
        );
    }

    #[test]
    fn lookup_normalizes_case_but_print_preserves_it() {
        let mut headers = Headers::new();
        headers.insert("x-ROUTE-tag", "abc");

        assert_eq!(headers.get(&Name::from("X-Route-Tag")).unwrap(), "abc");
        assert!(headers.to_string().starts_with("x-ROUTE-tag: abc"));
    }

    #[test]
    fn typed_roundtrip() {
        let mut headers = Headers::new();
        headers.insert_named(&MaxForwards(70));

        let max_fwd: MaxForwards = headers.get_named().unwrap();
        assert_eq!(max_fwd.0, 70);
    }

    #[test]
    fn pop_front_removes_topmost() {
        let mut headers = Headers::new();
        headers.insert(Name::VIA, "first");
        headers.insert(Name::VIA, "second");

        assert_eq!(headers.pop_front(&Name::VIA).unwrap(), "first");
        assert_eq!(headers.get(&Name::VIA).unwrap(), "second");
    }

    #[test]
    fn replace_keeps_position() {
        let mut headers = Headers::new();
        headers.insert(Name::CONTACT, "<sip:a@a>");
        headers.insert(Name::MAX_FORWARDS, "70");
        headers.insert(Name::CONTACT, "<sip:b@b>");

        headers.replace(Name::CONTACT, "<sip:c@c>");

        let printed = headers.to_string();
        assert_eq!(
            printed,
            "Contact: <sip:c@c>\r\nMax-Forwards: 70\r\n"
        );
    }
}
