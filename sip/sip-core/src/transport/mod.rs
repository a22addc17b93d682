use crate::{Endpoint, Request, Response, Result};
use bytes::Bytes;
use parking_lot::Mutex;
use sip_types::host::{Host, HostPort};
use sip_types::msg::MessageLine;
use sip_types::uri::SipUri;
use sip_types::Headers;
use std::collections::HashMap;
use std::fmt::{Debug, Display};
use std::mem::take;
use std::net::SocketAddr;
use std::ops::Deref;
use std::sync::Arc;
use std::time::SystemTime;
use std::{fmt, io};

pub(crate) mod parse;
mod resolver;
pub mod streaming;
pub mod tcp;
pub mod udp;

#[cfg(feature = "tls-rustls")]
pub mod rustls;
#[cfg(feature = "websocket")]
pub mod websocket;

/// Abstraction over a transport factory.
///
/// Used to create connection oriented transports on demand.
#[async_trait::async_trait]
pub trait Factory: Send + Sync + 'static {
    /// Name of the transport this factory produces (e.g. TCP, TLS)
    fn name(&self) -> &'static str;

    /// Checks if the factory is eligible for the transport specified inside
    /// an uri. Overridable since some transports (like TLS) must accept the
    /// `tcp` string.
    fn matches_transport_param(&self, name: &str) -> bool {
        self.name().eq_ignore_ascii_case(name)
    }

    /// Indicates if the created transport is secure
    fn secure(&self) -> bool;

    /// Connect a transport to the resolved address
    async fn create(
        &self,
        endpoint: Endpoint,
        uri: &SipUri,
        addr: SocketAddr,
    ) -> io::Result<TpHandle>;
}

/// Abstraction over a transport
#[async_trait::async_trait]
pub trait Transport: Debug + Display + Send + Sync + 'static {
    /// Name of the transport (e.g. UDP, TCP, TLS, WS)
    fn name(&self) -> &'static str;

    /// Checks if the transport is eligible for the transport specified
    /// inside an uri
    fn matches_transport_param(&self, name: &str) -> bool {
        self.name().eq_ignore_ascii_case(name)
    }

    /// Indicates if the transport is a secure connection
    fn secure(&self) -> bool;

    /// Is the transport reliable. Changes how retransmissions are handled
    /// in transactions.
    fn reliable(&self) -> bool;

    /// The local address of the transport
    fn bound(&self) -> SocketAddr;

    /// The address peers can reach this endpoint from (e.g. the listener
    /// address of a tcp stream)
    fn sent_by(&self) -> SocketAddr;

    /// The direction of the transport
    fn direction(&self) -> Direction;

    /// Send `message` to `target`.
    ///
    /// Connection oriented transports may discard the `target` parameter.
    async fn send(&self, message: &[u8], target: SocketAddr) -> io::Result<()>;
}

/// Cheaply clonable handle to a [`Transport`]
#[derive(Debug, Clone)]
pub struct TpHandle {
    transport: Arc<dyn Transport>,
}

impl Deref for TpHandle {
    type Target = dyn Transport;

    fn deref(&self) -> &Self::Target {
        &*self.transport
    }
}

impl PartialEq for TpHandle {
    fn eq(&self, other: &Self) -> bool {
        TpKey::from_dyn(&*self.transport) == TpKey::from_dyn(&*other.transport)
    }
}

impl fmt::Display for TpHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.transport.direction() {
            Direction::None => write!(f, "{}", self.transport),
            Direction::Outgoing(_) => write!(f, "outgoing:{}", self.transport),
            Direction::Incoming(_) => write!(f, "incoming:{}", self.transport),
        }
    }
}

impl TpHandle {
    pub fn new<T: Transport>(transport: T) -> Self {
        Self {
            transport: Arc::new(transport),
        }
    }

    /// Get the [`TpKey`] identifying this transport
    pub fn key(&self) -> TpKey {
        TpKey::from_dyn(&*self.transport)
    }
}

/// Direction of a transport
#[derive(Debug, Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash)]
pub enum Direction {
    /// No direction because it is datagram based (e.g. UDP)
    None,

    /// A connection established by this endpoint
    Outgoing(SocketAddr),

    /// A connection accepted by this endpoint
    Incoming(SocketAddr),
}

/// Information saved for subsequent requests to the same target.
///
/// Caches the transport & resolved socket address of an uri. Can also be
/// used to configure the host-port printed into the Via header.
#[derive(Debug, Default, Clone)]
pub struct TargetTransportInfo {
    /// Optional host port to use in the via header
    pub via_host_port: Option<HostPort>,

    /// Transport and remote address used to send requests. Populated from
    /// the request-uri when unset.
    pub transport: Option<(TpHandle, SocketAddr)>,
}

/// Transport related info attached to every received message
#[derive(Debug)]
pub struct MessageTpInfo {
    /// Timestamp the message was received at
    pub timestamp: SystemTime,

    /// Source address
    pub source: SocketAddr,

    /// Complete buffer containing the message
    pub buffer: Bytes,

    /// Handle to the transport the message was received on
    pub transport: TpHandle,
}

/// Message received directly from a transport
pub struct ReceivedMessage {
    pub tp_info: MessageTpInfo,

    /// Leading line, notates if the message is a request or response
    pub line: MessageLine,

    /// All headers found inside the message, neither parsed nor validated
    pub headers: Headers,

    /// Body as raw bytes
    pub body: Bytes,
}

impl fmt::Display for ReceivedMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.line)
    }
}

impl ReceivedMessage {
    pub fn new(
        source: SocketAddr,
        buffer: Bytes,
        transport: TpHandle,
        line: MessageLine,
        headers: Headers,
        body: Bytes,
    ) -> Self {
        Self {
            tp_info: MessageTpInfo {
                timestamp: SystemTime::now(),
                source,
                buffer,
                transport,
            },
            line,
            headers,
            body,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OutgoingResponse {
    pub msg: Response,
    pub parts: OutgoingParts,
}

#[derive(Debug, Clone)]
pub struct OutgoingRequest {
    pub msg: Request,
    pub parts: OutgoingParts,
}

#[derive(Debug, Clone)]
pub struct OutgoingParts {
    /// Transport the message will be sent with
    pub transport: TpHandle,

    /// Address the message will be sent to
    pub destination: SocketAddr,

    /// Buffer the message got printed into
    pub buffer: Bytes,
}

/// Key used to identify and store transports
#[derive(Debug, Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash)]
pub struct TpKey {
    pub name: &'static str,
    pub bound: SocketAddr,
    pub direction: Direction,
}

impl TpKey {
    fn from_dyn(transport: &dyn Transport) -> Self {
        Self {
            name: transport.name(),
            bound: transport.bound(),
            direction: transport.direction(),
        }
    }
}

pub(crate) struct Transports {
    unmanaged: Box<[TpHandle]>,
    factories: Box<[Arc<dyn Factory>]>,

    /// Connection oriented transports, alive as long as their read task runs
    connections: Mutex<HashMap<TpKey, TpHandle>>,

    dns_resolver: hickory_resolver::TokioResolver,
}

impl Transports {
    async fn resolve_uri(&self, uri: &SipUri) -> io::Result<Vec<SocketAddr>> {
        let port = uri.host_port.port_or(uri.default_port());

        match &uri.host_port.host {
            Host::Ip4(ip) => Ok(vec![SocketAddr::from((*ip, port))]),
            Host::Ip6(ip) => Ok(vec![SocketAddr::from((*ip, port))]),
            Host::Name(name) => resolver::resolve_host(&self.dns_resolver, name, port).await,
        }
    }

    /// Find or create a suitable transport for the given uri
    #[tracing::instrument(name = "select_transport", level = "trace", skip(self, endpoint))]
    pub(crate) async fn select(
        &self,
        endpoint: &Endpoint,
        uri: &SipUri,
    ) -> Result<(TpHandle, SocketAddr)> {
        log::trace!("select transport for {uri}");

        let addrs = self.resolve_uri(uri).await?;

        for addr in addrs {
            if let Some(transport) = self.find_matching_unmanaged(uri, addr) {
                log::trace!("selected connectionless: {transport}");

                return Ok((transport.clone(), addr));
            }

            if let Some(transport) = self.find_matching_connection(uri, addr) {
                log::trace!("selected connection: {transport}");

                return Ok((transport, addr));
            }

            if let Some(transport) = self.connect(endpoint, uri, addr).await {
                return Ok((transport, addr));
            }
        }

        Err(crate::Error::NoTransport(uri.to_string()))
    }

    fn find_matching_unmanaged(&self, uri: &SipUri, addr: SocketAddr) -> Option<&TpHandle> {
        self.unmanaged.iter().find(|tp| {
            let addr_family_supported = tp.bound().is_ipv4() == addr.is_ipv4();
            let security_level_matches = !uri.sips || tp.secure();
            let transport_param_matches = uri
                .params
                .get_val("transport")
                .is_none_or(|t| tp.matches_transport_param(t));

            addr_family_supported && security_level_matches && transport_param_matches
        })
    }

    fn find_matching_connection(&self, uri: &SipUri, addr: SocketAddr) -> Option<TpHandle> {
        let connections = self.connections.lock();

        connections.values().find_map(|tp| {
            let remote = match tp.direction() {
                Direction::None => return None,
                Direction::Outgoing(remote) | Direction::Incoming(remote) => remote,
            };

            if remote != addr {
                return None;
            }

            if uri.sips && !tp.secure() {
                return None;
            }

            if let Some(param) = uri.params.get_val("transport") {
                if !tp.matches_transport_param(param) {
                    return None;
                }
            }

            Some(tp.clone())
        })
    }

    async fn connect(
        &self,
        endpoint: &Endpoint,
        uri: &SipUri,
        addr: SocketAddr,
    ) -> Option<TpHandle> {
        for factory in self.factories.iter() {
            if uri.sips && !factory.secure() {
                continue;
            }

            if let Some(param) = uri.params.get_val("transport") {
                if !factory.matches_transport_param(param) {
                    continue;
                }
            }

            match factory.create(endpoint.clone(), uri, addr).await {
                Ok(transport) => {
                    log::debug!("created new transport {transport}");

                    return Some(transport);
                }
                Err(e) => {
                    log::debug!(
                        "failed to connect to {addr} with {}, reason = {e}",
                        factory.name()
                    );
                }
            }
        }

        None
    }

    pub(crate) fn add_connection(&self, transport: TpHandle) {
        self.connections.lock().insert(transport.key(), transport);
    }

    pub(crate) fn remove_connection(&self, tp_key: &TpKey) {
        log::trace!("drop transport {tp_key:?}");

        self.connections.lock().remove(tp_key);
    }
}

#[derive(Default)]
pub(crate) struct TransportsBuilder {
    unmanaged: Vec<TpHandle>,
    factories: Vec<Arc<dyn Factory>>,
    dns_resolver: Option<hickory_resolver::TokioResolver>,
}

impl TransportsBuilder {
    pub(crate) fn insert_unmanaged(&mut self, transport: TpHandle) {
        assert_eq!(transport.direction(), Direction::None);

        self.unmanaged.push(transport);
    }

    pub(crate) fn insert_factory(&mut self, factory: Arc<dyn Factory>) {
        self.factories.push(factory);
    }

    pub(crate) fn set_dns_resolver(&mut self, dns_resolver: hickory_resolver::TokioResolver) {
        self.dns_resolver = Some(dns_resolver);
    }

    pub(crate) fn build(&mut self) -> Transports {
        let dns_resolver = self.dns_resolver.take().unwrap_or_else(|| {
            hickory_resolver::TokioResolver::builder_tokio()
                .expect("failed to create default system DNS resolver")
                .build()
        });

        Transports {
            unmanaged: take(&mut self.unmanaged).into_boxed_slice(),
            factories: take(&mut self.factories).into_boxed_slice(),
            connections: Default::default(),
            dns_resolver,
        }
    }
}
