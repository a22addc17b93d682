use std::fmt;

/// Classifies a [`StatusCode`] by its hundreds digit.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum CodeKind {
    Provisional,
    Success,
    Redirection,
    RequestFailure,
    ServerFailure,
    GlobalFailure,
}

/// A SIP response status code.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct StatusCode(u16);

macro_rules! status_codes {
    ($($code:literal, $text:literal, $konst:ident;)+) => {
        impl StatusCode {
            $(pub const $konst: StatusCode = StatusCode($code);)+

            /// The canonical reason phrase, if the code is well known
            pub fn text(&self) -> Option<&'static str> {
                match self.0 {
                    $($code => Some($text),)+
                    _ => None,
                }
            }
        }
    };
}

status_codes! {
    100, "Trying", TRYING;
    180, "Ringing", RINGING;
    181, "Call Is Being Forwarded", CALL_IS_BEING_FORWARDED;
    183, "Session Progress", SESSION_PROGRESS;
    200, "OK", OK;
    202, "Accepted", ACCEPTED;
    300, "Multiple Choices", MULTIPLE_CHOICES;
    301, "Moved Permanently", MOVED_PERMANENTLY;
    302, "Moved Temporarily", MOVED_TEMPORARILY;
    400, "Bad Request", BAD_REQUEST;
    401, "Unauthorized", UNAUTHORIZED;
    403, "Forbidden", FORBIDDEN;
    404, "Not Found", NOT_FOUND;
    405, "Method Not Allowed", METHOD_NOT_ALLOWED;
    408, "Request Timeout", REQUEST_TIMEOUT;
    481, "Call/Transaction Does Not Exist", CALL_OR_TRANSACTION_DOES_NOT_EXIST;
    482, "Loop Detected", LOOP_DETECTED;
    483, "Too Many Hops", TOO_MANY_HOPS;
    486, "Busy Here", BUSY_HERE;
    487, "Request Terminated", REQUEST_TERMINATED;
    488, "Not Acceptable Here", NOT_ACCEPTABLE_HERE;
    500, "Server Internal Error", SERVER_INTERNAL_ERROR;
    501, "Not Implemented", NOT_IMPLEMENTED;
    503, "Service Unavailable", SERVICE_UNAVAILABLE;
    504, "Server Time-out", SERVER_TIMEOUT;
    600, "Busy Everywhere", BUSY_EVERYWHERE;
    603, "Decline", DECLINE;
    604, "Does Not Exist Anywhere", DOES_NOT_EXIST_ANYWHERE;
}

impl StatusCode {
    pub fn kind(&self) -> CodeKind {
        match self.0 {
            100..=199 => CodeKind::Provisional,
            200..=299 => CodeKind::Success,
            300..=399 => CodeKind::Redirection,
            400..=499 => CodeKind::RequestFailure,
            500..=599 => CodeKind::ServerFailure,
            _ => CodeKind::GlobalFailure,
        }
    }

    pub fn into_u16(self) -> u16 {
        self.0
    }

    pub fn is_final(&self) -> bool {
        self.0 >= 200
    }
}

impl From<u16> for StatusCode {
    fn from(code: u16) -> Self {
        Self(code)
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn kind() {
        assert_eq!(StatusCode::TRYING.kind(), CodeKind::Provisional);
        assert_eq!(StatusCode::OK.kind(), CodeKind::Success);
        assert_eq!(StatusCode::DECLINE.kind(), CodeKind::GlobalFailure);
        assert_eq!(StatusCode::from(599).kind(), CodeKind::ServerFailure);
    }

    #[test]
    fn text() {
        assert_eq!(StatusCode::NOT_FOUND.text(), Some("Not Found"));
        assert_eq!(StatusCode::from(299).text(), None);
    }
}
