use super::streaming::{spawn_connection, Connection};
use super::{Direction, Factory, TpHandle};
use crate::{Endpoint, EndpointBuilder};
use sip_types::uri::SipUri;
use std::net::SocketAddr;
use std::sync::Arc;
use std::{fmt, io};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::broadcast;

const TCP: &str = "TCP";

/// TCP listener. Accepted connections register themselves with the endpoint
/// and live until the stream ends.
pub struct Tcp {
    bound: SocketAddr,
}

impl fmt::Display for Tcp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tcp:listen={}", self.bound)
    }
}

impl Tcp {
    pub async fn spawn<A>(builder: &mut EndpointBuilder, addr: A) -> io::Result<SocketAddr>
    where
        A: ToSocketAddrs,
    {
        let listener = TcpListener::bind(addr).await?;
        let bound = listener.local_addr()?;

        log::info!("bound TCP to {bound}");

        tokio::spawn(accept_task(builder.subscribe(), listener, bound));

        builder.add_transport_factory(Arc::new(TcpConnector { bound: Some(bound) }));

        Ok(bound)
    }
}

async fn accept_task(
    mut endpoint: broadcast::Receiver<Endpoint>,
    listener: TcpListener,
    bound: SocketAddr,
) {
    let Ok(endpoint) = endpoint.recv().await else {
        return;
    };

    loop {
        match listener.accept().await {
            Ok((stream, remote)) => {
                let local = match stream.local_addr() {
                    Ok(local) => local,
                    Err(e) => {
                        log::warn!("failed to get local addr of accepted connection, {e}");
                        continue;
                    }
                };

                spawn_connection(
                    endpoint.clone(),
                    Connection {
                        name: TCP,
                        secure: false,
                        stream,
                        sent_by: bound,
                        local,
                        remote,
                        direction: Direction::Incoming(remote),
                    },
                );
            }
            Err(e) => {
                log::warn!("TCP accept error, {e}");
            }
        }
    }
}

/// Creates outbound TCP connections
pub struct TcpConnector {
    /// Listener address advertised on outbound connections, when one exists
    bound: Option<SocketAddr>,
}

impl TcpConnector {
    pub fn new() -> Self {
        Self { bound: None }
    }
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Factory for TcpConnector {
    fn name(&self) -> &'static str {
        TCP
    }

    fn secure(&self) -> bool {
        false
    }

    async fn create(
        &self,
        endpoint: Endpoint,
        _uri: &SipUri,
        addr: SocketAddr,
    ) -> io::Result<TpHandle> {
        let stream = TcpStream::connect(addr).await?;

        let local = stream.local_addr()?;
        let remote = stream.peer_addr()?;

        Ok(spawn_connection(
            endpoint,
            Connection {
                name: TCP,
                secure: false,
                stream,
                sent_by: self.bound.unwrap_or(local),
                local,
                remote,
                direction: Direction::Outgoing(remote),
            },
        ))
    }
}
