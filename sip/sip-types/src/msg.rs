//! Message lines and the message-head scanner

use crate::parse::{token, whitespace};
use crate::uri::SipUri;
use crate::{Method, Name, StatusCode};
use bytesstr::BytesStr;
use memchr::memchr;
use nom::branch::alt;
use nom::bytes::complete::{tag, take_while, take_while1};
use nom::character::complete::char;
use nom::combinator::{map, map_res, rest};
use nom::sequence::{preceded, terminated, tuple};
use nom::IResult;
use std::fmt;
use std::str::FromStr;

/// Header `name: value` line inside a message head
pub struct Line {
    pub name: Name,
    pub value: BytesStr,
}

impl Line {
    pub fn parse(i: &str) -> IResult<&str, Self> {
        map(
            tuple((
                take_while1(token),
                take_while(whitespace),
                char(':'),
                rest,
            )),
            |(name, _, _, value): (&str, _, _, &str)| Line {
                name: Name::from(name),
                value: BytesStr::from(value.trim()),
            },
        )(i)
    }
}

/// The leading line of any SIP message
#[derive(Debug, Clone)]
pub enum MessageLine {
    Request(RequestLine),
    Response(StatusLine),
}

impl MessageLine {
    pub fn parse(i: &str) -> IResult<&str, Self> {
        alt((
            map(StatusLine::parse, MessageLine::Response),
            map(RequestLine::parse, MessageLine::Request),
        ))(i)
    }

    pub fn is_request(&self) -> bool {
        matches!(self, Self::Request(..))
    }

    pub fn request_method(&self) -> Option<&Method> {
        match self {
            MessageLine::Request(line) => Some(&line.method),
            MessageLine::Response(_) => None,
        }
    }
}

impl fmt::Display for MessageLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageLine::Request(line) => line.fmt(f),
            MessageLine::Response(line) => line.fmt(f),
        }
    }
}

/// The leading line of a SIP request
#[derive(Debug, Clone)]
pub struct RequestLine {
    pub method: Method,
    pub uri: SipUri,
}

impl RequestLine {
    fn parse(i: &str) -> IResult<&str, Self> {
        map(
            tuple((
                map(take_while1(token), Method::from),
                take_while1(whitespace),
                map_res(take_while1(|c| !whitespace(c)), SipUri::from_str),
                take_while(whitespace),
                tag("SIP/2.0"),
            )),
            |(method, _, uri, _, _)| RequestLine { method, uri },
        )(i)
    }
}

impl fmt::Display for RequestLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} SIP/2.0", self.method, self.uri)
    }
}

/// The leading line of a SIP response
#[derive(Debug, Clone)]
pub struct StatusLine {
    pub code: StatusCode,
    pub reason: Option<BytesStr>,
}

impl StatusLine {
    pub fn new(code: StatusCode, reason: Option<BytesStr>) -> Self {
        Self { code, reason }
    }

    fn parse(i: &str) -> IResult<&str, Self> {
        map(
            preceded(
                terminated(tag("SIP/2.0"), take_while1(whitespace)),
                tuple((
                    map_res(take_while1(|c: char| c.is_ascii_digit()), u16::from_str),
                    rest,
                )),
            ),
            |(code, reason): (u16, &str)| StatusLine {
                code: StatusCode::from(code),
                reason: match reason.trim() {
                    "" => None,
                    reason => Some(BytesStr::from(reason)),
                },
            },
        )(i)
    }
}

impl fmt::Display for StatusLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SIP/2.0 {}", self.code)?;

        if let Some(reason) = &self.reason {
            write!(f, " {reason}")?;
        }

        Ok(())
    }
}

/// Signals that the input does not yet contain a complete message head
#[derive(Debug, PartialEq, Eq)]
pub struct Incomplete;

/// Pull scanner over the lines of a SIP message head.
///
/// Lines are terminated by `\n` or `\r\n`; a terminator followed by a space
/// or tab folds the next line into the current one (multi-line headers). The
/// head ends at an empty line.
///
/// The scanner is restartable: [`HeadScanner::progress`] can be fed back into
/// a new scanner over a longer buffer so streaming transports do not rescan
/// completed lines.
#[derive(Clone)]
pub struct HeadScanner<'i> {
    input: &'i [u8],
    progress: usize,
    head_end: Option<usize>,
}

impl<'i> HeadScanner<'i> {
    pub fn new(input: &'i [u8], progress: usize) -> Self {
        Self {
            input,
            progress,
            head_end: None,
        }
    }

    /// Index of the first body byte. Only valid after the scanner returned
    /// `None`.
    pub fn head_end(&self) -> usize {
        self.head_end.unwrap_or(self.progress)
    }

    /// Offset of the first unscanned byte
    pub fn progress(&self) -> usize {
        self.progress
    }

    /// Scan all remaining lines, reporting whether the head is complete
    pub fn check_complete(&mut self) -> Result<(), Incomplete> {
        for line in self {
            let _ = line?;
        }

        Ok(())
    }
}

impl<'i> Iterator for HeadScanner<'i> {
    type Item = Result<&'i [u8], Incomplete>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.head_end.is_some() {
            return None;
        }

        let line_begin = self.progress;
        let mut search_from = line_begin;

        loop {
            let nl = match memchr(b'\n', &self.input[search_from..]) {
                Some(nl) => search_from + nl,
                None => return Some(Err(Incomplete)),
            };

            let term_begin = if nl > line_begin && self.input[nl - 1] == b'\r' {
                nl - 1
            } else {
                nl
            };

            // an empty line ends the head
            if term_begin == line_begin {
                self.head_end = Some(nl + 1);
                return None;
            }

            match self.input.get(nl + 1) {
                // folded continuation line, keep scanning
                Some(b' ' | b'\t') => search_from = nl + 1,
                Some(_) => {
                    self.progress = nl + 1;
                    return Some(Ok(&self.input[line_begin..term_begin]));
                }
                // cannot yet tell whether the next line is a continuation
                None => return Some(Err(Incomplete)),
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn request_line() {
        let (_, line) = MessageLine::parse("INVITE sip:999@example.com SIP/2.0").unwrap();

        match line {
            MessageLine::Request(line) => {
                assert_eq!(line.method, Method::INVITE);
                assert_eq!(line.uri.to_string(), "sip:999@example.com");
            }
            MessageLine::Response(_) => panic!("expected request"),
        }
    }

    #[test]
    fn status_line() {
        let (_, line) = MessageLine::parse("SIP/2.0 180 Ringing").unwrap();

        match line {
            MessageLine::Response(line) => {
                assert_eq!(line.code, StatusCode::RINGING);
                assert_eq!(line.reason.as_deref(), Some("Ringing"));
            }
            MessageLine::Request(_) => panic!("expected response"),
        }
    }

    #[test]
    fn scanner_full_head() {
        let msg = b"OPTIONS sip:user@example.com SIP/2.0\r\n\
                    Max-Forwards: 70\r\n\
                    Accept: application/sdp,\r\n \
                    message/sipfrag\r\n\
                    \r\nbody";

        let mut scanner = HeadScanner::new(msg, 0);

        assert_eq!(
            scanner.next(),
            Some(Ok(&b"OPTIONS sip:user@example.com SIP/2.0"[..]))
        );
        assert_eq!(scanner.next(), Some(Ok(&b"Max-Forwards: 70"[..])));
        assert_eq!(
            scanner.next(),
            Some(Ok(&b"Accept: application/sdp,\r\n message/sipfrag"[..]))
        );
        assert_eq!(scanner.next(), None);
        assert_eq!(&msg[scanner.head_end()..], b"body");
    }

    #[test]
    fn scanner_incomplete() {
        let msg = b"OPTIONS sip:user@example.com SIP/2.0\r\nTo: sip:user@exa";

        let mut scanner = HeadScanner::new(msg, 0);

        assert!(scanner.next().unwrap().is_ok());
        assert_eq!(scanner.next(), Some(Err(Incomplete)));
    }

    #[test]
    fn scanner_resume() {
        let part = b"INVITE sip:a@b SIP/2.0\r\nVia: SIP";
        let mut scanner = HeadScanner::new(part, 0);
        assert!(scanner.next().unwrap().is_ok());
        assert_eq!(scanner.next(), Some(Err(Incomplete)));

        let progress = scanner.progress();

        let full = b"INVITE sip:a@b SIP/2.0\r\nVia: SIP/2.0/UDP a\r\n\r\n";
        let mut scanner = HeadScanner::new(full, progress);
        assert_eq!(scanner.next(), Some(Ok(&b"Via: SIP/2.0/UDP a"[..])));
        assert_eq!(scanner.next(), None);
        assert_eq!(scanner.head_end(), full.len());
    }
}
