//! SIP over WebSocket (RFC 7118).
//!
//! Unlike the byte stream transports every WebSocket message carries exactly
//! one SIP message, so framing does not use Content-Length.

use super::parse::{parse_complete, CompleteItem};
use super::{Direction, ReceivedMessage, TpHandle, Transport};
use crate::{Endpoint, EndpointBuilder};
use futures_util::stream::{SplitSink, StreamExt};
use futures_util::SinkExt;
use std::net::SocketAddr;
use std::{fmt, io};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio::sync::{broadcast, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

const WS: &str = "WS";
#[cfg(feature = "tls-rustls")]
const WSS: &str = "WSS";

struct WsTransport<S> {
    name: &'static str,
    secure: bool,
    bound: SocketAddr,
    sent_by: SocketAddr,
    remote: SocketAddr,
    sink: Mutex<SplitSink<WebSocketStream<S>, Message>>,
}

impl<S> fmt::Debug for WsTransport<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WsTransport")
            .field("name", &self.name)
            .field("remote", &self.remote)
            .finish_non_exhaustive()
    }
}

impl<S> fmt::Display for WsTransport<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:remote={}",
            self.name.to_ascii_lowercase(),
            self.remote
        )
    }
}

#[async_trait::async_trait]
impl<S> Transport for WsTransport<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    fn name(&self) -> &'static str {
        self.name
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
        Direction::Incoming(self.remote)
    }

    async fn send(&self, bytes: &[u8], _target: SocketAddr) -> io::Result<()> {
        self.sink
            .lock()
            .await
            .send(Message::binary(bytes.to_vec()))
            .await
            .map_err(io::Error::other)
    }
}

/// Plain WebSocket listener
pub struct Ws;

impl Ws {
    pub async fn spawn<A>(builder: &mut EndpointBuilder, addr: A) -> io::Result<SocketAddr>
    where
        A: ToSocketAddrs,
    {
        let listener = TcpListener::bind(addr).await?;
        let bound = listener.local_addr()?;

        log::info!("bound WS to {bound}");

        let mut endpoint = builder.subscribe();

        tokio::spawn(async move {
            let Ok(endpoint) = endpoint.recv().await else {
                return;
            };

            loop {
                let (stream, remote) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        log::warn!("WS accept error, {e}");
                        continue;
                    }
                };

                let endpoint = endpoint.clone();

                tokio::spawn(handshake(endpoint, stream, WS, false, bound, remote));
            }
        });

        Ok(bound)
    }

    /// WebSocket over TLS
    #[cfg(feature = "tls-rustls")]
    pub async fn spawn_secure<A>(
        builder: &mut EndpointBuilder,
        addr: A,
        acceptor: tokio_rustls::TlsAcceptor,
    ) -> io::Result<SocketAddr>
    where
        A: ToSocketAddrs,
    {
        let listener = TcpListener::bind(addr).await?;
        let bound = listener.local_addr()?;

        log::info!("bound WSS to {bound}");

        let mut endpoint: broadcast::Receiver<Endpoint> = builder.subscribe();

        tokio::spawn(async move {
            let Ok(endpoint) = endpoint.recv().await else {
                return;
            };

            loop {
                let (stream, remote) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        log::warn!("WSS accept error, {e}");
                        continue;
                    }
                };

                let endpoint = endpoint.clone();
                let acceptor = acceptor.clone();

                // handshakes happen off the accept loop
                tokio::spawn(async move {
                    match acceptor.accept(stream).await {
                        Ok(stream) => {
                            handshake(endpoint, stream, WSS, true, bound, remote).await;
                        }
                        Err(e) => {
                            log::debug!("TLS handshake with {remote} failed, {e}");
                        }
                    }
                });
            }
        });

        Ok(bound)
    }
}

async fn handshake<S>(
    endpoint: Endpoint,
    stream: S,
    name: &'static str,
    secure: bool,
    bound: SocketAddr,
    remote: SocketAddr,
) where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let websocket = match tokio_tungstenite::accept_async(stream).await {
        Ok(websocket) => websocket,
        Err(e) => {
            log::debug!("WS handshake with {remote} failed, {e}");
            return;
        }
    };

    let (sink, mut source) = websocket.split();

    let handle = TpHandle::new(WsTransport {
        name,
        secure,
        bound,
        sent_by: bound,
        remote,
        sink: Mutex::new(sink),
    });

    endpoint.transports().add_connection(handle.clone());

    while let Some(message) = source.next().await {
        let payload = match message {
            Ok(Message::Binary(payload)) => payload.to_vec(),
            Ok(Message::Text(payload)) => payload.as_bytes().to_vec(),
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        };

        match parse_complete(&payload) {
            Ok(CompleteItem::Sip {
                line,
                headers,
                body,
                buffer,
            }) => {
                endpoint.receive(ReceivedMessage::new(
                    remote,
                    buffer,
                    handle.clone(),
                    line,
                    headers,
                    body,
                ));
            }
            Ok(_) => {
                // keep-alives are handled by the websocket layer itself
            }
            Err(_) => {
                // one message per frame, a malformed frame closes the connection
                endpoint.record_parse_error();
                break;
            }
        }
    }

    endpoint.transports().remove_connection(&handle.key());
}
