use bytesstr::BytesStr;
use std::fmt;
use std::hash::{Hash, Hasher};

/// A SIP header name, used as key inside [`Headers`](crate::Headers).
///
/// Known names carry their canonical print form plus all aliases (including
/// the RFC 3261 compact forms) they are matched against, case insensitively.
/// Unknown names are stored as received so they are forwarded untouched.
#[derive(Debug, Clone)]
pub struct Name(Repr);

macro_rules! header_names {
    ($($print:literal, $ident:ident, [$($alias:literal),+], $konst:ident;)+) => {
        #[derive(Debug, Clone)]
        enum Repr {
            $($ident,)+
            Unknown(BytesStr),
        }

        impl Name {
            $(pub const $konst: Name = Name(Repr::$ident);)+

            /// Canonical print form of the name
            pub fn as_print_str(&self) -> &str {
                match &self.0 {
                    $(Repr::$ident => $print,)+
                    Repr::Unknown(name) => name.as_ref(),
                }
            }

            fn aliases(&self) -> &'static [&'static str] {
                match &self.0 {
                    $(Repr::$ident => &[$($alias),+],)+
                    Repr::Unknown(_) => &[],
                }
            }

            fn from_slice(name: impl Into<BytesStr> + AsRef<str>) -> Name {
                let slice = name.as_ref();

                $(
                if [$($alias),+].iter().any(|alias| alias.eq_ignore_ascii_case(slice)) {
                    return Name::$konst;
                }
                )+

                Name(Repr::Unknown(name.into()))
            }
        }
    };
}

header_names! {
    "Via", Via, ["via", "v"], VIA;
    "From", From, ["from", "f"], FROM;
    "To", To, ["to", "t"], TO;
    "Call-ID", CallId, ["call-id", "i"], CALL_ID;
    "CSeq", CSeq, ["cseq"], CSEQ;
    "Contact", Contact, ["contact", "m"], CONTACT;
    "Max-Forwards", MaxForwards, ["max-forwards"], MAX_FORWARDS;
    "Route", Route, ["route"], ROUTE;
    "Record-Route", RecordRoute, ["record-route"], RECORD_ROUTE;
    "Content-Type", ContentType, ["content-type", "c"], CONTENT_TYPE;
    "Content-Length", ContentLength, ["content-length", "l"], CONTENT_LENGTH;
    "Expires", Expires, ["expires"], EXPIRES;
    "Allow", Allow, ["allow"], ALLOW;
    "Supported", Supported, ["supported", "k"], SUPPORTED;
    "User-Agent", UserAgent, ["user-agent"], USER_AGENT;
    "WWW-Authenticate", WwwAuthenticate, ["www-authenticate"], WWW_AUTHENTICATE;
    "Authorization", Authorization, ["authorization"], AUTHORIZATION;
    "Proxy-Authenticate", ProxyAuthenticate, ["proxy-authenticate"], PROXY_AUTHENTICATE;
    "Proxy-Authorization", ProxyAuthorization, ["proxy-authorization"], PROXY_AUTHORIZATION;
    "Reason", Reason, ["reason"], REASON;
    "Refer-To", ReferTo, ["refer-to", "r"], REFER_TO;
    "Referred-By", ReferredBy, ["referred-by", "b"], REFERRED_BY;
    "Event", Event, ["event", "o"], EVENT;
    "RSeq", RSeq, ["rseq"], RSEQ;
    "RAck", RAck, ["rack"], RACK;
    "Min-Expires", MinExpires, ["min-expires"], MIN_EXPIRES;
    "Retry-After", RetryAfter, ["retry-after"], RETRY_AFTER;
    "Timestamp", Timestamp, ["timestamp"], TIMESTAMP;
}

impl PartialEq for Name {
    fn eq(&self, other: &Self) -> bool {
        self.as_print_str().eq_ignore_ascii_case(other.as_print_str())
            || other
                .aliases()
                .iter()
                .any(|alias| alias.eq_ignore_ascii_case(self.as_print_str()))
            || self
                .aliases()
                .iter()
                .any(|alias| alias.eq_ignore_ascii_case(other.as_print_str()))
    }
}

impl Eq for Name {}

impl Hash for Name {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for b in self.as_print_str().as_bytes() {
            state.write_u8(b.to_ascii_lowercase());
        }
    }
}

impl PartialEq<str> for Name {
    fn eq(&self, other: &str) -> bool {
        self.as_print_str().eq_ignore_ascii_case(other)
            || self
                .aliases()
                .iter()
                .any(|alias| alias.eq_ignore_ascii_case(other))
    }
}

impl<T> From<T> for Name
where
    T: Into<BytesStr> + AsRef<str>,
{
    fn from(name: T) -> Self {
        Name::from_slice(name)
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_print_str())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn compact_form_matches() {
        assert_eq!(Name::from("v"), Name::VIA);
        assert_eq!(Name::from("i"), Name::CALL_ID);
        assert_eq!(Name::from("l"), Name::CONTENT_LENGTH);
    }

    #[test]
    fn case_insensitive() {
        assert_eq!(Name::from("CALL-ID"), Name::CALL_ID);
        assert_eq!(Name::VIA, *"VIA");
    }

    #[test]
    fn unknown_preserved() {
        let name = Name::from("X-Custom-Header");
        assert_eq!(name.as_print_str(), "X-Custom-Header");
        assert_eq!(name, Name::from("x-custom-header"));
    }
}
