use bytes::Bytes;
use sip_types::msg::{HeadScanner, Line, MessageLine};
use sip_types::Headers;
use std::str::from_utf8;

#[derive(Debug, thiserror::Error)]
#[error("received message is malformed")]
pub(crate) struct MalformedMessage;

pub(crate) enum CompleteItem {
    KeepAliveRequest,
    KeepAliveResponse,
    Sip {
        line: MessageLine,
        headers: Headers,
        body: Bytes,
        buffer: Bytes,
    },
}

/// Parse a datagram that must contain a complete message
pub(crate) fn parse_complete(bytes: &[u8]) -> Result<CompleteItem, MalformedMessage> {
    if bytes.starts_with(b"\r\n\r\n") {
        return Ok(CompleteItem::KeepAliveRequest);
    }

    if bytes.starts_with(b"\r\n") {
        return Ok(CompleteItem::KeepAliveResponse);
    }

    let buffer = Bytes::copy_from_slice(bytes);

    let mut scanner = HeadScanner::new(&buffer, 0);

    let mut message_line = None;
    let mut headers = Headers::new();

    for line in &mut scanner {
        let line = line.map_err(|_| MalformedMessage)?;
        let line = from_utf8(line).map_err(|_| MalformedMessage)?;

        if message_line.is_none() {
            match MessageLine::parse(line) {
                Ok((_, line)) => message_line = Some(line),
                Err(_) => return Err(MalformedMessage),
            }
        } else {
            match Line::parse(line) {
                Ok((_, line)) => headers.insert(line.name, line.value),
                Err(e) => {
                    log::warn!("incoming message has malformed header line, {e}");
                }
            }
        }
    }

    let body = buffer.slice(scanner.head_end()..);

    Ok(CompleteItem::Sip {
        line: message_line.ok_or(MalformedMessage)?,
        headers,
        body,
        buffer,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use sip_types::Name;

    #[test]
    fn complete_invite() {
        let msg = b"INVITE sip:999@example.com SIP/2.0\r\n\
                    Via: SIP/2.0/UDP 198.51.100.4;branch=z9hG4bK776asdhds\r\n\
                    From: <sip:787@example.com>;tag=1928301774\r\n\
                    To: <sip:999@example.com>\r\n\
                    Call-ID: abc@host\r\n\
                    CSeq: 1 INVITE\r\n\
                    Content-Length: 4\r\n\
                    \r\nsdp!";

        match parse_complete(msg).unwrap() {
            CompleteItem::Sip {
                line,
                headers,
                body,
                ..
            } => {
                assert!(line.is_request());
                assert_eq!(headers.get(&Name::CALL_ID).unwrap(), "abc@host");
                assert_eq!(&body[..], b"sdp!");
            }
            _ => panic!("expected sip message"),
        }
    }

    #[test]
    fn keep_alive() {
        assert!(matches!(
            parse_complete(b"\r\n\r\n").unwrap(),
            CompleteItem::KeepAliveRequest
        ));
        assert!(matches!(
            parse_complete(b"\r\n").unwrap(),
            CompleteItem::KeepAliveResponse
        ));
    }

    #[test]
    fn malformed_is_rejected() {
        assert!(parse_complete(b"garbage without structure").is_err());
    }
}
