use bytesstr::BytesStr;
use std::fmt;

/// Represents a SIP request method.
///
/// Well known methods are implemented as constants, anything else is carried
/// verbatim as an extension method.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Method(Repr);

macro_rules! methods {
    ($($print:literal, $ident:ident;)+) => {
        #[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
        #[allow(clippy::upper_case_acronyms)]
        enum Repr {
            $($ident,)+
            Other(BytesStr),
        }

        impl Method {
            $(pub const $ident: Self = Self(Repr::$ident);)+

            fn from_slice(slice: &str) -> Self {
                match slice {
                    $(_ if slice.eq_ignore_ascii_case($print) => Self(Repr::$ident),)+
                    _ => Self(Repr::Other(BytesStr::from(slice))),
                }
            }
        }

        impl fmt::Display for Method {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match &self.0 {
                    $(Repr::$ident => f.write_str($print),)+
                    Repr::Other(other) => f.write_str(other),
                }
            }
        }
    };
}

methods! {
    "INVITE",   INVITE;
    "ACK",      ACK;
    "CANCEL",   CANCEL;
    "BYE",      BYE;
    "REGISTER", REGISTER;
    "OPTIONS",  OPTIONS;
    "UPDATE",   UPDATE;
    "INFO",     INFO;
    "REFER",    REFER;
    "MESSAGE",  MESSAGE;
    "PRACK",    PRACK;
    "SUBSCRIBE", SUBSCRIBE;
    "NOTIFY",   NOTIFY;
}

impl From<&str> for Method {
    fn from(s: &str) -> Self {
        Self::from_slice(s)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn known_method() {
        assert_eq!(Method::from("INVITE"), Method::INVITE);
        assert_eq!(Method::INVITE.to_string(), "INVITE");
    }

    #[test]
    fn extension_method() {
        let method = Method::from("SOMEOBSCUREMETHOD");

        assert_ne!(method, Method::INVITE);
        assert_eq!(method.to_string(), "SOMEOBSCUREMETHOD");
    }
}
