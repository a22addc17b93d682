//! The B2BUA itself: terminates inbound dialogs, originates outbound ones
//! and stitches the two together.

use crate::config::SipConfig;
use crate::dialog::DialogKey;
use crate::error::B2buaError;
use crate::metrics::Metrics;
use crate::routing::{RoutingEngine, SourceAcl};
use crate::session::SessionManager;
use bytesstr::BytesStr;
use dashmap::DashMap;
use sip_auth::DigestAuthenticator;
use sip_core::transport::OutgoingResponse;
use sip_core::{Endpoint, EndpointBuilder, IncomingRequest, Layer, MayTake};
use sip_types::header::typed::{Contact, DigestChallenge, Expires};
use sip_types::uri::{NameAddr, SipUri};
use sip_types::{Method, Name, StatusCode};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Notify;

mod in_dialog;
mod invite;

pub(crate) use invite::in_dialog_send_ack as send_loose_ack;

/// Per source IP INVITE counter over a one second window
struct RateWindow {
    window_start: Instant,
    count: u32,
}

pub struct B2buaLayer {
    pub(crate) sessions: Arc<SessionManager>,
    pub(crate) engine: Arc<RoutingEngine>,
    pub(crate) authenticator: Option<Arc<DigestAuthenticator>>,
    pub(crate) metrics: Arc<Metrics>,
    pub(crate) config: SipConfig,

    /// Local address of record placed in the From of outbound legs
    pub(crate) local_identity: NameAddr,

    /// Source gate checked before anything else looks at an INVITE
    pub(crate) acl: SourceAcl,

    /// Initial INVITEs that can still be cancelled, keyed by Via branch
    cancellables: DashMap<BytesStr, Arc<Notify>>,

    rate: DashMap<IpAddr, RateWindow>,
}

impl B2buaLayer {
    pub fn new(
        config: SipConfig,
        sessions: Arc<SessionManager>,
        engine: Arc<RoutingEngine>,
        authenticator: Option<Arc<DigestAuthenticator>>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let local_identity = SipUri::parse(&config.local_identity)
            .map(NameAddr::uri)
            .unwrap_or_else(|_| {
                log::warn!(
                    "local identity {:?} is not a valid uri, using a placeholder",
                    config.local_identity
                );

                NameAddr::uri(SipUri::new(sip_types::host::HostPort {
                    host: sip_types::host::Host::Name("invalid".into()),
                    port: None,
                }))
            });

        let acl = SourceAcl::new(&config.acl.allow, &config.acl.deny);

        Self {
            sessions,
            engine,
            authenticator,
            metrics,
            config,
            local_identity,
            acl,
            cancellables: DashMap::new(),
            rate: DashMap::new(),
        }
    }

    /// Contact advertising the transport the request came in on
    pub(crate) fn local_contact(&self, request: &IncomingRequest) -> Contact {
        let sent_by = request.tp_info.transport.sent_by();

        Contact::new(NameAddr::uri(SipUri::new(sent_by.into())))
    }

    /// True when the source already spent its INVITE allowance this second
    fn rate_limited(&self, source: IpAddr) -> bool {
        let mut entry = self.rate.entry(source).or_insert(RateWindow {
            window_start: Instant::now(),
            count: 0,
        });

        if entry.window_start.elapsed().as_secs() >= 1 {
            entry.window_start = Instant::now();
            entry.count = 0;
        }

        entry.count += 1;
        entry.count > self.config.invite_rate_limit
    }

    pub(crate) fn register_cancellable(&self, branch: BytesStr) -> Arc<Notify> {
        let notify = Arc::new(Notify::new());
        self.cancellables.insert(branch, notify.clone());
        notify
    }

    pub(crate) fn unregister_cancellable(&self, branch: &BytesStr) {
        self.cancellables.remove(branch);
    }

    async fn handle_options(&self, endpoint: &Endpoint, mut request: IncomingRequest) {
        let mut response = endpoint.create_response(&request, StatusCode::OK, None);

        for method in endpoint.allowed() {
            response
                .msg
                .headers
                .insert(Name::ALLOW, method.to_string());
        }

        let tsx = endpoint.create_server_tsx(&mut request);

        if let Err(e) = tsx.respond(response).await {
            log::warn!("failed to answer OPTIONS, {e}");
        }
    }

    /// Best effort REGISTER handling: no binding storage, just a 200
    /// echoing the Contact with its expiry
    async fn handle_register(&self, endpoint: &Endpoint, mut request: IncomingRequest) {
        let mut response = endpoint.create_response(&request, StatusCode::OK, None);

        if let Ok(contact) = request.headers.get_named::<Contact>() {
            let expires = contact
                .expires()
                .or_else(|| {
                    request
                        .headers
                        .get_named::<Expires>()
                        .ok()
                        .map(|expires| expires.0)
                })
                .unwrap_or(3600);

            let mut echoed = contact;
            echoed.params.push_or_edit("expires", expires.to_string());

            response.msg.headers.insert_named(&echoed);
        }

        let tsx = endpoint.create_server_tsx(&mut request);

        if let Err(e) = tsx.respond(response).await {
            log::warn!("failed to answer REGISTER, {e}");
        }
    }

    /// CANCEL for an INVITE we are still working on: answer 200 and nudge
    /// the INVITE task, which cancels leg B and relays the 487
    async fn handle_cancel(&self, endpoint: &Endpoint, mut request: IncomingRequest) {
        let notify = self
            .cancellables
            .get(request.tsx_key.branch())
            .map(|entry| entry.clone());

        let code = if notify.is_some() {
            StatusCode::OK
        } else {
            // nothing left to cancel
            StatusCode::CALL_OR_TRANSACTION_DOES_NOT_EXIST
        };

        let response = endpoint.create_response(&request, code, None);
        let tsx = endpoint.create_server_tsx(&mut request);

        if let Err(e) = tsx.respond(response).await {
            log::warn!("failed to answer CANCEL, {e}");
        }

        if let Some(notify) = notify {
            notify.notify_one();
        }
    }

    pub(crate) fn record_error(&self, error: &B2buaError) {
        self.metrics.record_error(error.kind());
    }
}

#[async_trait::async_trait]
impl Layer for B2buaLayer {
    fn name(&self) -> &'static str {
        "b2bua"
    }

    fn init(&mut self, endpoint: &mut EndpointBuilder) {
        for method in [
            Method::INVITE,
            Method::ACK,
            Method::CANCEL,
            Method::BYE,
            Method::OPTIONS,
            Method::REGISTER,
            Method::UPDATE,
            Method::INFO,
            Method::REFER,
            Method::MESSAGE,
            Method::PRACK,
        ] {
            endpoint.add_allow(method);
        }
    }

    #[tracing::instrument(name = "b2bua", level = "debug", skip_all)]
    async fn receive(&self, endpoint: &Endpoint, request: MayTake<'_, IncomingRequest>) {
        let method = request.line.method.clone();
        let has_to_tag = request.base_headers.to.tag.is_some();

        // in-dialog requests are matched through the dialog index
        if has_to_tag || method == Method::ACK {
            let Some(key) = DialogKey::from_incoming(&request) else {
                return;
            };

            let Some((handle, leg)) = self.sessions.registry().find_by_dialog(&key) else {
                // not ours, another layer or the 481 default may take it
                return;
            };

            let request = request.take();

            in_dialog::handle(self, endpoint, request, handle, leg).await;
            return;
        }

        match method {
            Method::INVITE => {
                let request = request.take();
                invite::handle_initial_invite(self, endpoint, request).await;
            }
            Method::CANCEL => {
                let request = request.take();
                self.handle_cancel(endpoint, request).await;
            }
            Method::OPTIONS => {
                let request = request.take();
                self.handle_options(endpoint, request).await;
            }
            Method::REGISTER => {
                let request = request.take();
                self.handle_register(endpoint, request).await;
            }
            _ => {
                // leave everything else to the endpoint's default handling
            }
        }
    }
}

/// Helper: set the tag on the To header of a response we author
pub(crate) fn set_to_tag(response: &mut OutgoingResponse, tag: &BytesStr) {
    if let Some(to) = response.msg.headers.get(&Name::TO) {
        if !to.contains(";tag=") {
            let tagged = format!("{to};tag={tag}");
            response.msg.headers.replace(Name::TO, tagged);
        }
    }
}

impl B2buaLayer {
    /// Source IP gate shared by the INVITE path
    pub(crate) fn admission_check(&self, source: IpAddr) -> Result<(), StatusCode> {
        if self.rate_limited(source) {
            log::warn!("INVITE rate limit hit for {source}");
            self.metrics.record_error("rate_limited");

            return Err(StatusCode::SERVICE_UNAVAILABLE);
        }

        if self.sessions.registry().len() >= self.config.max_active_calls {
            log::warn!("global active call cap reached");
            self.metrics.record_error("call_cap");

            return Err(StatusCode::SERVICE_UNAVAILABLE);
        }

        Ok(())
    }

    /// 401 challenge carrying a fresh nonce bound to the client
    pub(crate) fn challenge_for(&self, source: IpAddr) -> Option<DigestChallenge> {
        self.authenticator
            .as_ref()
            .map(|authenticator| authenticator.create_challenge(source))
    }
}
