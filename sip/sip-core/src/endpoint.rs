use crate::transaction::{
    ClientInvTsx, ClientTsx, ServerInvTsx, ServerTsx, Transactions, TsxKey, TsxMessage,
};
use crate::transport::{
    Direction, Factory, OutgoingParts, OutgoingRequest, OutgoingResponse, ReceivedMessage,
    TargetTransportInfo, TpHandle, Transports, TransportsBuilder,
};
use crate::{BaseHeaders, IncomingRequest, Layer, MayTake, Request, Response, Result};
use bytes::{Bytes, BytesMut};
use bytesstr::BytesStr;
use sip_types::header::typed::Via;
use sip_types::host::{Host, HostPort};
use sip_types::msg::{MessageLine, StatusLine};
use sip_types::uri::SipUri;
use sip_types::{Headers, Method, Name, StatusCode};
use std::any::type_name;
use std::fmt::Write;
use std::mem::take;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::{fmt, io};
use tokio::sync::broadcast;
use tracing::Instrument;

/// The endpoint is the centerpiece of the SIP stack. It owns the enabled
/// transports, the transaction registry and the stack of layered modules
/// that make up the application logic.
///
/// It is a cheap to clone wrapper around an inner `Arc`, but must never be
/// stored inside a layer to avoid cyclic references.
#[derive(Clone)]
pub struct Endpoint {
    inner: Arc<Inner>,
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("inner_refcount", &Arc::strong_count(&self.inner))
            .finish_non_exhaustive()
    }
}

struct Inner {
    allow: Vec<Method>,

    transports: Transports,
    transactions: Transactions,

    parse_errors: AtomicU64,

    layer: Box<[Box<dyn Layer>]>,
}

impl Endpoint {
    /// Construct a new [`EndpointBuilder`]
    pub fn builder() -> EndpointBuilder {
        EndpointBuilder::new()
    }

    /// Send an INVITE request. Returns a [`ClientInvTsx`] which MUST be used
    /// to drive the transaction.
    pub async fn send_invite(
        &self,
        request: Request,
        target: &mut TargetTransportInfo,
    ) -> Result<ClientInvTsx> {
        ClientInvTsx::send(self.clone(), request, target).await
    }

    /// Send a non-INVITE request. Returns a [`ClientTsx`] which MUST be used
    /// to drive the transaction.
    pub async fn send_request(
        &self,
        request: Request,
        target: &mut TargetTransportInfo,
    ) -> Result<ClientTsx> {
        ClientTsx::send(self.clone(), request, target).await
    }

    /// Create a [`ServerTsx`] from an [`IncomingRequest`] to respond to it
    pub fn create_server_tsx(&self, request: &mut IncomingRequest) -> ServerTsx {
        ServerTsx::new(request)
    }

    /// Create a [`ServerInvTsx`] from an INVITE [`IncomingRequest`] to
    /// respond to it
    pub fn create_server_inv_tsx(&self, request: &mut IncomingRequest) -> ServerInvTsx {
        ServerInvTsx::new(request)
    }

    /// All methods handled by this endpoint, printed into `Allow` headers
    pub fn allowed(&self) -> &Vec<Method> {
        &self.inner.allow
    }

    /// Create a Via header for the given transport and transaction key
    pub fn create_via(
        &self,
        transport: &TpHandle,
        tsx_key: &TsxKey,
        via_host_port: Option<HostPort>,
    ) -> Via {
        Via::new(
            transport.name(),
            via_host_port.unwrap_or_else(|| transport.sent_by().into()),
            tsx_key.branch().clone(),
        )
    }

    /// Find or create a suitable transport for the given uri, returning it
    /// together with the resolved destination address
    pub async fn select_transport(&self, uri: &SipUri) -> Result<(TpHandle, SocketAddr)> {
        self.transports().select(self, uri).await
    }

    /// Take a request and convert it to an [`OutgoingRequest`] by resolving
    /// the destination and selecting a transport
    pub async fn create_outgoing(
        &self,
        request: Request,
        target: &mut TargetTransportInfo,
    ) -> Result<OutgoingRequest> {
        let (transport, destination) = if let Some((transport, destination)) = &target.transport {
            (transport.clone(), *destination)
        } else {
            let (transport, destination) = self.select_transport(&request.line.uri).await?;
            target.transport = Some((transport.clone(), destination));
            (transport, destination)
        };

        Ok(OutgoingRequest {
            msg: request,
            parts: OutgoingParts {
                transport,
                destination,
                buffer: Default::default(),
            },
        })
    }

    /// Print the request to its buffer (if needed) and send it
    pub async fn send_outgoing_request(&self, message: &mut OutgoingRequest) -> io::Result<()> {
        if message.parts.buffer.is_empty() {
            message
                .msg
                .headers
                .replace(Name::CONTENT_LENGTH, message.msg.body.len().to_string());

            let mut buffer = BytesMut::new();

            write!(buffer, "{}\r\n{}\r\n", message.msg.line, message.msg.headers)
                .map_err(io::Error::other)?;

            buffer.extend_from_slice(&message.msg.body);

            message.parts.buffer = buffer.freeze();
        }

        log::trace!(
            "sending request to {}:\n{}",
            message.parts.destination,
            String::from_utf8_lossy(&message.parts.buffer)
        );

        message
            .parts
            .transport
            .send(&message.parts.buffer, message.parts.destination)
            .await
    }

    /// Print the response to its buffer (if needed) and send it
    pub async fn send_outgoing_response(&self, message: &mut OutgoingResponse) -> io::Result<()> {
        if message.parts.buffer.is_empty() {
            message
                .msg
                .headers
                .replace(Name::CONTENT_LENGTH, message.msg.body.len().to_string());

            let mut buffer = BytesMut::new();

            write!(buffer, "{}\r\n{}\r\n", message.msg.line, message.msg.headers)
                .map_err(io::Error::other)?;

            buffer.extend_from_slice(&message.msg.body);

            message.parts.buffer = buffer.freeze();
        }

        log::trace!(
            "sending response to {}:\n{}",
            message.parts.destination,
            String::from_utf8_lossy(&message.parts.buffer)
        );

        message
            .parts
            .transport
            .send(&message.parts.buffer, message.parts.destination)
            .await
    }

    /// Create a response to an incoming request with the given status code
    /// and optional reason
    pub fn create_response(
        &self,
        request: &IncomingRequest,
        code: StatusCode,
        reason: Option<BytesStr>,
    ) -> OutgoingResponse {
        assert_ne!(request.line.method, Method::ACK, "cannot respond to an ACK");

        let mut headers = Headers::with_capacity(5);

        for via in &request.base_headers.via {
            headers.insert_named(via);
        }

        headers.insert(Name::FROM, request.base_headers.from.to_string());
        headers.insert(Name::TO, request.base_headers.to.to_string());
        headers.insert_named(&request.base_headers.call_id);
        headers.insert_named(&request.base_headers.cseq);

        if code == StatusCode::TRYING {
            request.headers.clone_into(&mut headers, Name::TIMESTAMP);
        }

        let destination = response_destination(request);

        OutgoingResponse {
            msg: Response {
                line: StatusLine {
                    code,
                    reason: reason.or_else(|| code.text().map(BytesStr::from_static)),
                },
                headers,
                body: Bytes::new(),
            },
            parts: OutgoingParts {
                transport: request.tp_info.transport.clone(),
                destination,
                buffer: Default::default(),
            },
        }
    }

    /// Pass a received message to the endpoint for further processing.
    ///
    /// Spawns a task internally which gives every registered layer a look at
    /// the message, letting it decide if it is going to handle it.
    pub fn receive(&self, message: ReceivedMessage) {
        tokio::spawn(self.clone().do_receive(message));
    }

    #[tracing::instrument(level = "debug", skip(self, message), fields(%message))]
    async fn do_receive(self, mut message: ReceivedMessage) {
        log::trace!(
            "received message from {}:\n{}",
            message.tp_info.source,
            String::from_utf8_lossy(&message.tp_info.buffer)
        );

        let mut base_headers = match BaseHeaders::extract_from(&message.headers) {
            Ok(base_headers) => base_headers,
            Err(e) => {
                self.record_parse_error();
                log::warn!("failed to get base headers for incoming message, {e}");
                return;
            }
        };

        if message.line.is_request() {
            add_received_rport(&mut base_headers.via[0], message.tp_info.source);
        }

        let tsx_key = match TsxKey::from_message_parts(&message.line, &base_headers) {
            Ok(tsx_key) => tsx_key,
            Err(e) => {
                self.record_parse_error();
                log::warn!("failed to get tsx key for incoming message, {e}");
                return;
            }
        };

        let mut tsx = None;

        // Look for a transaction able to handle the message
        match self.transactions().get_handler(&self, &tsx_key) {
            Ok(handler) => {
                let tsx_message = TsxMessage {
                    tp_info: message.tp_info,
                    line: message.line,
                    base_headers,
                    headers: message.headers,
                    body: message.body,
                };

                log::debug!("delegating message to transaction {tsx_key}");

                if let Some(rejected) = handler(tsx_message) {
                    log::trace!("transaction {tsx_key} rejected message");

                    base_headers = rejected.base_headers;
                    message = ReceivedMessage {
                        tp_info: rejected.tp_info,
                        line: rejected.line,
                        headers: rejected.headers,
                        body: rejected.body,
                    };
                } else {
                    return;
                }
            }
            Err(registration) => {
                log::debug!("no transaction for {tsx_key} found, created registration");
                tsx = Some(registration);
            }
        }

        // No transaction handled it, treat it as a new incoming request

        let line = match message.line {
            MessageLine::Request(line) => line,
            _ => {
                log::debug!("dropping orphaned response");
                return;
            }
        };

        let incoming = IncomingRequest {
            tp_info: message.tp_info,
            tsx,
            tsx_key,
            line,
            base_headers,
            headers: message.headers,
            body: message.body,
        };

        let mut request = Some(incoming);

        for layer in self.inner.layer.iter() {
            let span = tracing::info_span!("receive", layer = %layer.name());

            layer
                .receive(&self, MayTake::new(&mut request))
                .instrument(span)
                .await;

            if request.is_none() {
                return;
            }
        }

        log::debug!("no layer handled the request");

        // Safe unwrap, the loop above checks every iteration
        let request = request.unwrap();

        if let Err(e) = self.handle_unwanted_request(request).await {
            log::error!("failed to respond to unhandled incoming request, {e:?}");
        }
    }

    async fn handle_unwanted_request(&self, mut request: IncomingRequest) -> Result<()> {
        if request.line.method == Method::ACK {
            // cannot respond to unhandled ACK requests
            return Ok(());
        }

        let response = self.create_response(
            &request,
            StatusCode::CALL_OR_TRANSACTION_DOES_NOT_EXIST,
            None,
        );

        if request.line.method == Method::INVITE {
            let tsx = self.create_server_inv_tsx(&mut request);

            tsx.respond_failure(response).await
        } else {
            let tsx = self.create_server_tsx(&mut request);

            tsx.respond(response).await
        }
    }

    /// Count a dropped unparseable message
    pub fn record_parse_error(&self) {
        self.inner.parse_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Number of messages dropped because they could not be parsed
    pub fn parse_errors(&self) -> u64 {
        self.inner.parse_errors.load(Ordering::Relaxed)
    }

    pub(crate) fn transactions(&self) -> &Transactions {
        &self.inner.transactions
    }

    pub(crate) fn transports(&self) -> &Transports {
        &self.inner.transports
    }

    /// Access a layer inside the endpoint.
    ///
    /// Panics if the layer does not exist in the endpoint.
    pub fn layer<L: Layer>(&self) -> &L {
        self.inner
            .layer
            .iter()
            .find_map(|l| l.downcast_ref())
            .unwrap_or_else(|| panic!("endpoint is missing layer {}", type_name::<L>()))
    }
}

fn response_destination(request: &IncomingRequest) -> SocketAddr {
    match request.tp_info.transport.direction() {
        Direction::None => {
            let via = request.base_headers.top_via();

            if let Some(maddr) = via
                .params
                .get_val("maddr")
                .and_then(|maddr| maddr.parse::<IpAddr>().ok())
            {
                SocketAddr::new(maddr, via.sent_by.port_or(5060))
            } else if let Some(rport) = via
                .params
                .get_val("rport")
                .and_then(|rport| rport.parse::<u16>().ok())
            {
                SocketAddr::new(request.tp_info.source.ip(), rport)
            } else {
                request.tp_info.source
            }
        }
        Direction::Outgoing(remote) | Direction::Incoming(remote) => {
            // connection oriented transports answer on the same connection
            remote
        }
    }
}

fn add_received_rport(via: &mut Via, source: SocketAddr) {
    let source_host: Host = source.ip().into();

    if source_host != via.sent_by.host {
        via.params.push_or_edit("received", source.ip().to_string());
    }

    if via.params.contains("rport") {
        via.params.push_or_edit("rport", source.port().to_string());
    }
}

/// Builder instance for [`Endpoint`]
pub struct EndpointBuilder {
    sender: broadcast::Sender<Endpoint>,

    allow: Vec<Method>,

    transports: TransportsBuilder,
    layer: Vec<Box<dyn Layer>>,
}

impl Default for EndpointBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl EndpointBuilder {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1);

        Self {
            sender,
            allow: vec![],
            transports: Default::default(),
            layer: Default::default(),
        }
    }

    /// Announce support for a method in `Allow` headers
    pub fn add_allow(&mut self, allowed: Method) {
        if !self.allow.contains(&allowed) {
            self.allow.push(allowed);
        }
    }

    /// Add an unmanaged transport which never vanishes or breaks (e.g. UDP)
    pub fn add_unmanaged_transport(&mut self, transport: TpHandle) -> &mut Self {
        self.transports.insert_unmanaged(transport);
        self
    }

    /// Add a transport factory to the endpoint
    pub fn add_transport_factory(&mut self, factory: Arc<dyn Factory>) -> &mut Self {
        self.transports.insert_factory(factory);
        self
    }

    /// Set the DNS resolver used to resolve next hop names.
    ///
    /// Uses the system config by default.
    pub fn set_dns_resolver(&mut self, dns_resolver: hickory_resolver::TokioResolver) {
        self.transports.set_dns_resolver(dns_resolver)
    }

    /// Add an implementation of [`Layer`] to the endpoint.
    ///
    /// The insertion order is relevant, as it is the order in which layers
    /// are offered incoming requests.
    pub fn add_layer<L>(&mut self, layer: L)
    where
        L: Layer,
    {
        self.layer.push(Box::new(layer));
    }

    /// "Subscribe" to the creation of the endpoint.
    ///
    /// The broadcast channel receives the endpoint on successful creation,
    /// or an error when the builder is dropped prematurely. On error any
    /// task waiting for the endpoint should exit.
    pub fn subscribe(&self) -> broadcast::Receiver<Endpoint> {
        self.sender.subscribe()
    }

    /// Complete building the endpoint
    pub fn build(&mut self) -> Endpoint {
        let mut layer = take(&mut self.layer).into_boxed_slice();
        for layer in layer.iter_mut() {
            layer.init(self);
        }

        let inner = Inner {
            allow: take(&mut self.allow),
            transports: self.transports.build(),
            transactions: Default::default(),
            parse_errors: AtomicU64::new(0),
            layer,
        };

        let endpoint = Endpoint {
            inner: Arc::new(inner),
        };

        let _ = self.sender.send(endpoint.clone());

        endpoint
    }
}
