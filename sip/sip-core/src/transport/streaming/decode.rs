use bytes::{Buf, Bytes, BytesMut};
use sip_types::msg::{HeadScanner, Line, MessageLine};
use sip_types::{Headers, Name};
use std::io;
use std::str::{from_utf8, Utf8Error};
use tokio_util::codec::Decoder;

const MAX_MSG_SIZE: usize = u16::MAX as usize;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Io(io::Error),
    #[error("received message too large")]
    MessageTooLarge,
    #[error("received message is malformed")]
    Malformed,
}

impl From<Utf8Error> for Error {
    fn from(_: Utf8Error) -> Self {
        Self::Malformed
    }
}

impl From<io::Error> for Error {
    fn from(error: io::Error) -> Self {
        Self::Io(error)
    }
}

#[allow(clippy::large_enum_variant)]
pub enum Item {
    DecodedMessage(DecodedMessage),
    KeepAliveRequest,
    KeepAliveResponse,
}

pub struct DecodedMessage {
    pub line: MessageLine,
    pub headers: Headers,
    pub body: Bytes,

    pub buffer: Bytes,
}

/// Frames SIP messages on a stream transport.
///
/// The message head is scanned up to the terminating CRLFCRLF while tracking
/// the Content-Length header, then head + body are cut from the stream as
/// one message buffer. Scan progress survives partial reads.
#[derive(Default)]
pub struct StreamingDecoder {
    head_progress: usize,
}

impl Decoder for StreamingDecoder {
    type Item = Item;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // strip leading newlines, answering keep-alives
        let whitespace_count = src.iter().take_while(|b| b.is_ascii_whitespace()).count();
        if whitespace_count > 0 {
            let is_keep_alive_request = src.starts_with(b"\r\n\r\n");
            let is_keep_alive_response = src.starts_with(b"\r\n");

            src.advance(whitespace_count);
            self.head_progress = 0;

            if is_keep_alive_request {
                return Ok(Some(Item::KeepAliveRequest));
            } else if is_keep_alive_response {
                return Ok(Some(Item::KeepAliveResponse));
            }
        }

        if src.len() > MAX_MSG_SIZE {
            src.clear();

            return Err(Error::MessageTooLarge);
        }

        let mut scanner = HeadScanner::new(src, self.head_progress);

        let mut content_len = 0;

        for line in &mut scanner {
            let Ok(line) = line else {
                // cannot parse the complete message head yet
                self.head_progress = scanner.progress();
                return Ok(None);
            };

            // track content-length so the complete message size is known
            let mut split = line.splitn(2, |&c| c == b':');

            let Some(name) = split.next() else {
                continue;
            };

            let name = from_utf8(name)?.trim();

            if Name::CONTENT_LENGTH == *name {
                let value = split.next().ok_or(Error::Malformed)?;
                let value = from_utf8(value)?;

                content_len = value
                    .trim()
                    .parse::<usize>()
                    .map_err(|_| Error::Malformed)?;

                if content_len > MAX_MSG_SIZE {
                    return Err(Error::MessageTooLarge);
                }
            }
        }

        // head is complete
        let expected_complete_message_size = scanner.head_end() + content_len;

        if src.len() < expected_complete_message_size {
            src.reserve(expected_complete_message_size - src.len());
            return Ok(None);
        }

        let src_bytes = src.split_to(expected_complete_message_size).freeze();

        self.head_progress = 0;

        // now properly parse the message
        let mut scanner = HeadScanner::new(&src_bytes, 0);

        let mut message_line = None;
        let mut headers = Headers::new();

        for item in &mut scanner {
            let item = item.expect("input was already checked");

            let line = from_utf8(item)?;

            if message_line.is_none() {
                match MessageLine::parse(line) {
                    Ok((_, line)) => message_line = Some(line),
                    Err(_) => return Err(Error::Malformed),
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

        let head_end = scanner.head_end();
        let body = src_bytes.slice(head_end..head_end + content_len);

        Ok(Some(Item::DecodedMessage(DecodedMessage {
            line: message_line.ok_or(Error::Malformed)?,
            headers,
            body,
            buffer: src_bytes,
        })))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn decode_all(chunks: &[&[u8]]) -> Vec<Item> {
        let mut decoder = StreamingDecoder::default();
        let mut buffer = BytesMut::new();
        let mut items = Vec::new();

        for chunk in chunks {
            buffer.extend_from_slice(chunk);

            while let Some(item) = decoder.decode(&mut buffer).unwrap() {
                items.push(item);
            }
        }

        items
    }

    #[test]
    fn message_split_across_reads() {
        let items = decode_all(&[
            b"BYE sip:999@example.com SIP/2.0\r\nCall-ID: ab",
            b"c@host\r\nContent-Length: 5\r\n\r\nhel",
            b"lo!!",
        ]);

        assert_eq!(items.len(), 1);

        match &items[0] {
            Item::DecodedMessage(msg) => {
                assert!(msg.line.is_request());
                assert_eq!(&msg.body[..], b"hello");
            }
            _ => panic!("expected message"),
        }
    }

    #[test]
    fn two_messages_in_one_read() {
        let items = decode_all(&[
            b"OPTIONS sip:a@b SIP/2.0\r\nContent-Length: 0\r\n\r\n\
              OPTIONS sip:c@d SIP/2.0\r\nContent-Length: 0\r\n\r\n",
        ]);

        assert_eq!(items.len(), 2);
    }

    #[test]
    fn keep_alive_ping() {
        let items = decode_all(&[b"\r\n\r\n"]);

        assert!(matches!(items[0], Item::KeepAliveRequest));
    }

    #[test]
    fn compact_content_length() {
        let items = decode_all(&[b"OPTIONS sip:a@b SIP/2.0\r\nl: 2\r\n\r\nok"]);

        match &items[0] {
            Item::DecodedMessage(msg) => assert_eq!(&msg.body[..], b"ok"),
            _ => panic!("expected message"),
        }
    }

    #[test]
    fn oversized_message_errors() {
        let mut decoder = StreamingDecoder::default();
        let mut buffer = BytesMut::new();

        buffer.extend_from_slice(&vec![b'a'; MAX_MSG_SIZE + 1]);

        assert!(decoder.decode(&mut buffer).is_err());
    }
}
