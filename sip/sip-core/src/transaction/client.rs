use super::consts::{T1, T2, T4};
use super::key::TsxKey;
use super::{TsxRegistration, TsxResponse};
use crate::error::Error;
use crate::transport::{OutgoingRequest, TargetTransportInfo};
use crate::{Endpoint, Request, Result};
use sip_types::{CodeKind, Method};
use std::time::Instant;
use tokio::time::{timeout, timeout_at};

/// Client non-INVITE transaction. Used to receive responses to a sent
/// request.
///
/// Runs the retransmission schedule for unreliable transports and the
/// overall Timer F deadline; dropping it prematurely cannot guarantee the
/// peer has received the request.
#[must_use]
#[derive(Debug)]
pub struct ClientTsx {
    registration: Option<TsxRegistration>,
    request: OutgoingRequest,
    timeout: Instant,
    state: State,
}

#[derive(Debug)]
enum State {
    Init,
    Proceeding,
    Completed,
    Terminated,
}

impl ClientTsx {
    /// Internal: used by [`Endpoint::send_request`]
    pub(crate) async fn send(
        endpoint: Endpoint,
        request: Request,
        target: &mut TargetTransportInfo,
    ) -> Result<Self> {
        let method = request.line.method.clone();

        assert!(
            !matches!(method, Method::INVITE | Method::ACK),
            "tried to create client transaction from {} request",
            method
        );

        let mut request = endpoint.create_outgoing(request, target).await?;

        let registration = TsxRegistration::create(endpoint, TsxKey::client(&method));

        let via = registration.endpoint.create_via(
            &request.parts.transport,
            &registration.tsx_key,
            target.via_host_port.clone(),
        );

        request.msg.headers.insert_named_front(&via);
        registration
            .endpoint
            .send_outgoing_request(&mut request)
            .await?;

        // Timer F
        let timeout = Instant::now() + T1 * 64;

        Ok(Self {
            registration: Some(registration),
            request,
            timeout,
            state: State::Init,
        })
    }

    /// Returns the request the transaction was created from
    pub fn request(&self) -> &OutgoingRequest {
        &self.request
    }

    /// Receive one or more responses.
    ///
    /// Must be called until a final response or error is returned.
    ///
    /// # Panics
    /// Panics when called again after the final response was received.
    pub async fn receive(&mut self) -> Result<TsxResponse> {
        let registration = self
            .registration
            .as_mut()
            .expect("transaction already received a final response");

        match self.state {
            State::Init if !self.request.parts.transport.reliable() => loop {
                let receive = timeout(T2, registration.receive_response());

                match timeout_at(self.timeout.into(), receive).await {
                    Ok(Ok(msg)) => return self.handle_msg(msg),
                    Ok(Err(_)) => {
                        // retransmit
                        registration
                            .endpoint
                            .send_outgoing_request(&mut self.request)
                            .await?;
                    }
                    Err(_) => return Err(Error::RequestTimedOut),
                }
            },
            State::Init | State::Proceeding => {
                match timeout_at(self.timeout.into(), registration.receive_response()).await {
                    Ok(msg) => self.handle_msg(msg),
                    Err(_) => Err(Error::RequestTimedOut),
                }
            }
            State::Completed | State::Terminated => {
                panic!("transaction already received a final response");
            }
        }
    }

    /// Calls [`ClientTsx::receive`] discarding provisional responses until
    /// the final one
    pub async fn receive_final(&mut self) -> Result<TsxResponse> {
        loop {
            let response = self.receive().await?;

            if let CodeKind::Provisional = response.line.code.kind() {
                continue;
            }

            return Ok(response);
        }
    }

    fn handle_msg(&mut self, response: TsxResponse) -> Result<TsxResponse> {
        match response.line.code.kind() {
            CodeKind::Provisional => {
                self.state = State::Proceeding;
            }
            _ => {
                let mut registration = self.registration.take().expect("already checked");

                if self.request.parts.transport.reliable() {
                    self.state = State::Terminated;
                } else {
                    self.state = State::Completed;

                    // linger for Timer K, absorbing response retransmissions
                    tokio::spawn(async move {
                        let timeout = Instant::now() + T4;

                        while timeout_at(timeout.into(), registration.receive())
                            .await
                            .is_ok()
                        {}
                    });
                }
            }
        }

        Ok(response)
    }
}
