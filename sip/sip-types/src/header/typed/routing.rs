use crate::header::{HeaderError, HeaderValue};
use crate::uri::NameAddr;
use crate::Name;
use std::fmt;

macro_rules! routing_header {
    ($(#[$meta:meta])* $struct_name:ident, $header_name:expr) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash)]
        pub struct $struct_name(pub NameAddr);

        impl HeaderValue for $struct_name {
            fn name() -> Name {
                $header_name
            }

            fn parse(value: &bytesstr::BytesStr) -> Result<Self, HeaderError> {
                let (addr, _) = NameAddr::parse(value)
                    .map_err(|e| HeaderError::malformed($header_name, e.to_string()))?;

                Ok(Self(addr))
            }

            fn print(&self) -> String {
                self.to_string()
            }
        }

        impl fmt::Display for $struct_name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

routing_header!(
    /// Single `Record-Route` header entry
    RecordRoute,
    Name::RECORD_ROUTE
);

routing_header!(
    /// Single `Route` header entry
    Route,
    Name::ROUTE
);

impl From<RecordRoute> for Route {
    fn from(rr: RecordRoute) -> Self {
        Route(rr.0)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use bytesstr::BytesStr;

    #[test]
    fn record_route_keeps_lr() {
        let input = BytesStr::from_static("<sip:proxy.example.com;lr>");

        let rr = RecordRoute::parse(&input).unwrap();

        assert!(rr.0.uri.params.contains("lr"));
        assert_eq!(rr.to_string(), "<sip:proxy.example.com;lr>");
    }
}
