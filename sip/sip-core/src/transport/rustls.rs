use super::streaming::{spawn_connection, Connection};
use super::{Direction, Factory, TpHandle};
use crate::{Endpoint, EndpointBuilder};
use rustls_pki_types::ServerName;
use sip_types::host::Host;
use sip_types::uri::SipUri;
use std::net::SocketAddr;
use std::sync::Arc;
use std::{fmt, io};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::broadcast;
use tokio_rustls::{TlsAcceptor, TlsConnector};

const TLS: &str = "TLS";

/// TLS listener on top of TCP
pub struct Tls {
    bound: SocketAddr,
}

impl fmt::Display for Tls {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tls:listen={}", self.bound)
    }
}

impl Tls {
    pub async fn spawn<A>(
        builder: &mut EndpointBuilder,
        addr: A,
        acceptor: TlsAcceptor,
    ) -> io::Result<SocketAddr>
    where
        A: ToSocketAddrs,
    {
        let listener = TcpListener::bind(addr).await?;
        let bound = listener.local_addr()?;

        log::info!("bound TLS to {bound}");

        tokio::spawn(accept_task(builder.subscribe(), listener, acceptor, bound));

        Ok(bound)
    }
}

async fn accept_task(
    mut endpoint: broadcast::Receiver<Endpoint>,
    listener: TcpListener,
    acceptor: TlsAcceptor,
    bound: SocketAddr,
) {
    let Ok(endpoint) = endpoint.recv().await else {
        return;
    };

    loop {
        match listener.accept().await {
            Ok((stream, remote)) => {
                let endpoint = endpoint.clone();
                let acceptor = acceptor.clone();

                // handshakes happen off the accept loop
                tokio::spawn(async move {
                    let local = match stream.local_addr() {
                        Ok(local) => local,
                        Err(e) => {
                            log::warn!("failed to get local addr of accepted connection, {e}");
                            return;
                        }
                    };

                    match acceptor.accept(stream).await {
                        Ok(stream) => {
                            spawn_connection(
                                endpoint,
                                Connection {
                                    name: TLS,
                                    secure: true,
                                    stream,
                                    sent_by: bound,
                                    local,
                                    remote,
                                    direction: Direction::Incoming(remote),
                                },
                            );
                        }
                        Err(e) => {
                            log::debug!("TLS handshake with {remote} failed, {e}");
                        }
                    }
                });
            }
            Err(e) => {
                log::warn!("TLS accept error, {e}");
            }
        }
    }
}

/// Creates outbound TLS connections
pub struct TlsConnectorFactory {
    connector: TlsConnector,
    bound: Option<SocketAddr>,
}

impl TlsConnectorFactory {
    pub fn new(connector: TlsConnector, bound: Option<SocketAddr>) -> Self {
        Self { connector, bound }
    }
}

#[async_trait::async_trait]
impl Factory for TlsConnectorFactory {
    fn name(&self) -> &'static str {
        TLS
    }

    fn matches_transport_param(&self, name: &str) -> bool {
        // sips uris commonly carry `transport=tcp`
        name.eq_ignore_ascii_case(TLS) || name.eq_ignore_ascii_case("tcp")
    }

    fn secure(&self) -> bool {
        true
    }

    async fn create(
        &self,
        endpoint: Endpoint,
        uri: &SipUri,
        addr: SocketAddr,
    ) -> io::Result<TpHandle> {
        let server_name = match &uri.host_port.host {
            Host::Name(name) => ServerName::try_from(name.clone())
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?,
            Host::Ip4(ip) => ServerName::from(std::net::IpAddr::from(*ip)),
            Host::Ip6(ip) => ServerName::from(std::net::IpAddr::from(*ip)),
        };

        let stream = TcpStream::connect(addr).await?;

        let local = stream.local_addr()?;
        let remote = stream.peer_addr()?;

        let stream = self.connector.connect(server_name, stream).await?;

        Ok(spawn_connection(
            endpoint,
            Connection {
                name: TLS,
                secure: true,
                stream,
                sent_by: self.bound.unwrap_or(local),
                local,
                remote,
                direction: Direction::Outgoing(remote),
            },
        ))
    }
}
