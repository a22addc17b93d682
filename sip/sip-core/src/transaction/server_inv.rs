use super::consts::{T1, T2};
use super::TsxRegistration;
use crate::error::Error;
use crate::transport::OutgoingResponse;
use crate::{IncomingRequest, Result};
use sip_types::msg::MessageLine;
use sip_types::{CodeKind, Method};
use std::io;
use std::time::Instant;
use tokio::time::timeout_at;

/// Server INVITE transaction. Used to respond to the incoming request.
///
/// The different response classes need different handling, so provisional,
/// success and failure responses each have their own method.
#[derive(Debug)]
pub struct ServerInvTsx {
    registration: TsxRegistration,
}

impl ServerInvTsx {
    /// Internal: used by [`Endpoint::create_server_inv_tsx`](crate::Endpoint::create_server_inv_tsx)
    pub(crate) fn new(request: &mut IncomingRequest) -> Self {
        assert_eq!(
            request.line.method,
            Method::INVITE,
            "tried to create invite transaction from {} request",
            request.line.method
        );

        Self {
            registration: request.take_tsx_registration(),
        }
    }

    /// Respond with a provisional response (1XX)
    pub async fn respond_provisional(&mut self, response: &mut OutgoingResponse) -> Result<()> {
        assert_eq!(response.msg.line.code.kind(), CodeKind::Provisional);

        self.registration
            .endpoint
            .send_outgoing_response(response)
            .await?;

        Ok(())
    }

    /// Respond with a success response (2XX).
    ///
    /// Returns [`Accepted`], which the transaction user must use to
    /// retransmit the response until it receives the ACK request, as for 2xx
    /// responses the ACK forms its own transaction.
    pub async fn respond_success(self, mut response: OutgoingResponse) -> Result<Accepted> {
        assert_eq!(response.msg.line.code.kind(), CodeKind::Success);

        self.registration
            .endpoint
            .send_outgoing_response(&mut response)
            .await?;

        Ok(Accepted {
            registration: self.registration,
            response,
        })
    }

    /// Respond with a failure response (3XX-6XX) and wait for the ACK,
    /// retransmitting on the Timer G schedule until Timer H fires
    pub async fn respond_failure(mut self, mut response: OutgoingResponse) -> Result<()> {
        assert!(!matches!(
            response.msg.line.code.kind(),
            CodeKind::Provisional | CodeKind::Success
        ));

        self.registration
            .endpoint
            .send_outgoing_response(&mut response)
            .await?;

        // Timer H, give up waiting for the ACK after this instant
        let abandon_retransmit = Instant::now() + T1 * 64;

        // Timer G, doubles with every retransmit up to T2
        let mut retransmit_delta = T1;
        let mut retransmit = Instant::now() + retransmit_delta;

        loop {
            match timeout_at(retransmit.into(), self.registration.receive()).await {
                Ok(inc_msg) => {
                    match &inc_msg.line {
                        MessageLine::Request(line) if line.method == Method::INVITE => {
                            // peer retransmitted the INVITE, retransmit the response
                            self.registration
                                .endpoint
                                .send_outgoing_response(&mut response)
                                .await?;
                        }
                        MessageLine::Request(line) if line.method == Method::ACK => {
                            return Ok(());
                        }
                        _ => {
                            // everything else gets ignored
                        }
                    }
                }
                Err(_) => {
                    if Instant::now() > abandon_retransmit {
                        return Err(Error::RequestTimedOut);
                    }

                    self.registration
                        .endpoint
                        .send_outgoing_response(&mut response)
                        .await?;

                    retransmit_delta = (retransmit_delta * 2).min(T2);
                    retransmit = Instant::now() + retransmit_delta;
                }
            }
        }
    }
}

/// Represents the `Accepted` state of an INVITE server transaction. Used to
/// retransmit the final success response until the peer's ACK arrives.
#[must_use]
pub struct Accepted {
    registration: TsxRegistration,
    response: OutgoingResponse,
}

impl Accepted {
    /// Retransmit the final response
    pub async fn retransmit(&mut self) -> io::Result<()> {
        self.registration
            .endpoint
            .send_outgoing_response(&mut self.response)
            .await
    }

    /// Drive retransmissions of the 2xx on the Timer G schedule until
    /// `ack_received` resolves or Timer H fires
    pub async fn retransmit_until_ack(
        mut self,
        ack_received: impl std::future::Future<Output = ()>,
    ) -> Result<()> {
        let deadline = Instant::now() + T1 * 64;
        let mut delta = T1;

        tokio::pin!(ack_received);

        loop {
            let retransmit_at = Instant::now() + delta;

            tokio::select! {
                _ = &mut ack_received => return Ok(()),
                _ = tokio::time::sleep_until(retransmit_at.into()) => {
                    if Instant::now() > deadline {
                        return Err(Error::RequestTimedOut);
                    }

                    self.retransmit().await?;
                    delta = (delta * 2).min(T2);
                }
            }
        }
    }
}
