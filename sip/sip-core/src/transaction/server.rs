use super::consts::T1;
use super::TsxRegistration;
use crate::transport::OutgoingResponse;
use crate::{IncomingRequest, Result};
use sip_types::{CodeKind, Method};
use std::time::Instant;
use tokio::time::timeout_at;

/// Server non-INVITE transaction. Used to respond to the incoming request.
///
/// On unreliable transports the final response is retransmitted whenever the
/// request is received again, until Timer J fires.
#[derive(Debug)]
pub struct ServerTsx {
    registration: TsxRegistration,
}

impl ServerTsx {
    /// Internal: used by [`Endpoint::create_server_tsx`](crate::Endpoint::create_server_tsx)
    pub(crate) fn new(request: &mut IncomingRequest) -> Self {
        assert!(
            !matches!(request.line.method, Method::INVITE | Method::ACK),
            "tried to create server transaction from {} request",
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

    /// Respond with a final response, consuming the transaction
    pub async fn respond(mut self, mut response: OutgoingResponse) -> Result<()> {
        assert_ne!(response.msg.line.code.kind(), CodeKind::Provisional);

        self.registration
            .endpoint
            .send_outgoing_response(&mut response)
            .await?;

        if response.parts.transport.reliable() {
            return Ok(());
        }

        // Timer J
        let abandon = Instant::now() + T1 * 64;

        tokio::spawn(async move {
            while let Ok(msg) = timeout_at(abandon.into(), self.registration.receive()).await {
                if msg.line.is_request() {
                    if let Err(e) = self
                        .registration
                        .endpoint
                        .send_outgoing_response(&mut response)
                        .await
                    {
                        log::warn!("failed to retransmit response, {}", e);
                    }
                }
            }
        });

        Ok(())
    }
}
