use super::{Direction, ReceivedMessage, TpHandle, Transport};
use crate::Endpoint;
use std::fmt;
use std::net::SocketAddr;
use std::{io, io::ErrorKind};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio_stream::StreamExt;
use tokio_util::codec::FramedRead;

mod decode;

pub use decode::{DecodedMessage, Item, StreamingDecoder};

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// A connection oriented transport (TCP, TLS, ...).
///
/// Reading happens in a task spawned by [`spawn_connection`], writes go
/// through the shared write half.
pub struct StreamingTransport {
    name: &'static str,
    secure: bool,
    bound: SocketAddr,
    sent_by: SocketAddr,
    direction: Direction,
    write: Mutex<BoxedWriter>,
}

impl fmt::Debug for StreamingTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamingTransport")
            .field("name", &self.name)
            .field("bound", &self.bound)
            .field("direction", &self.direction)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for StreamingTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:bound={}", self.name.to_ascii_lowercase(), self.bound)
    }
}

#[async_trait::async_trait]
impl Transport for StreamingTransport {
    fn name(&self) -> &'static str {
        self.name
    }

    fn matches_transport_param(&self, name: &str) -> bool {
        // TLS connections are addressed with `transport=tcp` in sips uris
        self.name.eq_ignore_ascii_case(name) || (self.secure && name.eq_ignore_ascii_case("tcp"))
    }

    fn secure(&self) -> bool {
        self.secure
    }

    fn reliable(&self) -> bool {
        true
    }

    fn bound(&self) -> SocketAddr {
        self.bound
    }

    fn sent_by(&self) -> SocketAddr {
        self.sent_by
    }

    fn direction(&self) -> Direction {
        self.direction
    }

    async fn send(&self, bytes: &[u8], _target: SocketAddr) -> io::Result<()> {
        let mut write = self.write.lock().await;

        write.write_all(bytes).await?;
        write.flush().await
    }
}

/// Parameters of a freshly established stream connection
pub struct Connection<S> {
    pub name: &'static str,
    pub secure: bool,
    pub stream: S,
    /// Address to advertise in Via/Contact headers, usually the listener
    pub sent_by: SocketAddr,
    pub local: SocketAddr,
    pub remote: SocketAddr,
    pub direction: Direction,
}

/// Register a connection with the endpoint and spawn its framing task.
///
/// The task owns the read half, decodes messages off the stream and hands
/// them to the endpoint. The connection deregisters itself when the stream
/// ends or decoding fails.
pub fn spawn_connection<S>(endpoint: Endpoint, connection: Connection<S>) -> TpHandle
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let Connection {
        name,
        secure,
        stream,
        sent_by,
        local,
        remote,
        direction,
    } = connection;

    let (read, write) = tokio::io::split(stream);

    let handle = TpHandle::new(StreamingTransport {
        name,
        secure,
        bound: local,
        sent_by,
        direction,
        write: Mutex::new(Box::new(write)),
    });

    endpoint.transports().add_connection(handle.clone());

    tokio::spawn(read_task(endpoint, handle.clone(), read, remote));

    handle
}

async fn read_task<R>(endpoint: Endpoint, handle: TpHandle, read: R, remote: SocketAddr)
where
    R: AsyncRead + Send + Unpin + 'static,
{
    let mut framed = FramedRead::new(read, StreamingDecoder::default());

    while let Some(item) = framed.next().await {
        match item {
            Ok(Item::DecodedMessage(message)) => {
                endpoint.receive(ReceivedMessage::new(
                    remote,
                    message.buffer,
                    handle.clone(),
                    message.line,
                    message.headers,
                    message.body,
                ));
            }
            Ok(Item::KeepAliveRequest) => {
                if let Err(e) = handle.send(b"\r\n", remote).await {
                    log::debug!("failed to answer keep-alive on {handle}, {e}");
                    break;
                }
            }
            Ok(Item::KeepAliveResponse) => {
                // nothing to do
            }
            Err(e) => {
                // stream transports cannot resynchronize after a framing
                // error, close the connection
                endpoint.record_parse_error();

                if !matches!(&e, decode::Error::Io(e) if e.kind() == ErrorKind::UnexpectedEof) {
                    log::warn!("closing {handle} after receive error, {e}");
                }

                break;
            }
        }
    }

    endpoint.transports().remove_connection(&handle.key());
}
