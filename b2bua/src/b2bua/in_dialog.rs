//! Relay of mid-dialog traffic between the two legs of a call.
//!
//! Requests are never forwarded verbatim: the equivalent request is built
//! in the peer dialog's namespace with the peer's Call-ID, tags, CSeq and
//! route set, carrying over only the end-to-end headers and the body.

use super::invite::in_dialog_send_ack;
use super::{set_to_tag, B2buaLayer};
use crate::call::{CallHandle, CallState, Leg};
use crate::error::B2buaError;
use bytes::Bytes;
use sip_core::transport::TargetTransportInfo;
use sip_core::{Endpoint, IncomingRequest, Request};
use sip_types::header::typed::ContentType;
use sip_types::{CodeKind, Headers, Method, Name, StatusCode};
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Headers owned by the dialog layer which never cross between legs
fn is_leg_local(name: &Name) -> bool {
    const LEG_LOCAL: [Name; 12] = [
        Name::VIA,
        Name::FROM,
        Name::TO,
        Name::CALL_ID,
        Name::CSEQ,
        Name::CONTACT,
        Name::ROUTE,
        Name::RECORD_ROUTE,
        Name::MAX_FORWARDS,
        Name::CONTENT_LENGTH,
        Name::AUTHORIZATION,
        Name::PROXY_AUTHORIZATION,
    ];

    LEG_LOCAL.iter().any(|local| local == name)
}

/// Copy the end-to-end headers of the incoming request onto the rebuilt one
fn carry_headers(src: &Headers, dst: &mut Request) {
    let preexisting: Vec<Name> = dst.headers.iter().map(|(name, _)| name.clone()).collect();

    for (name, value) in src.iter() {
        if is_leg_local(name) || preexisting.iter().any(|existing| existing == name) {
            continue;
        }

        dst.headers.insert(name.clone(), value.clone());
    }
}

/// Final response of a relayed request, ready to be mapped onto the
/// originating leg
struct RelayedFinal {
    code: StatusCode,
    reason: Option<String>,
    body: Option<String>,
}

#[tracing::instrument(
    name = "in_dialog",
    level = "debug",
    skip(layer, endpoint, request, handle, leg),
    fields(%request, ?leg)
)]
pub(super) async fn handle(
    layer: &B2buaLayer,
    endpoint: &Endpoint,
    mut request: IncomingRequest,
    handle: Arc<CallHandle>,
    leg: Leg,
) {
    let method = request.line.method.clone();

    if method == Method::ACK {
        handle_ack(endpoint, request, handle, leg).await;
        return;
    }

    // CSeq discipline per dialog direction
    let in_order = {
        let mut call = handle.call.lock().await;
        let cseq = request.base_headers.cseq.cseq;

        call.touch();
        call.dialog_mut(leg)
            .map(|dialog| dialog.record_remote_cseq(cseq))
            .unwrap_or(false)
    };

    if !in_order {
        log::debug!("out of order in-dialog {method} answered with 500");
        respond_only(endpoint, request, StatusCode::SERVER_INTERNAL_ERROR).await;
        return;
    }

    match method {
        Method::BYE => handle_bye(layer, endpoint, request, handle, leg).await,
        Method::INVITE | Method::UPDATE => {
            handle_renegotiation(layer, endpoint, request, handle, leg).await;
        }
        _ => relay_transparent(layer, endpoint, request, handle, leg).await,
    }
}

/// ACK from the caller: complete our 2xx on leg A, and for the initial
/// INVITE regenerate the ACK on leg B with fresh Via and CSeq, since the
/// legs are independent dialogs.
async fn handle_ack(endpoint: &Endpoint, _request: IncomingRequest, handle: Arc<CallHandle>, leg: Leg) {
    // stop any pending 2xx retransmissions toward this leg
    handle.ack_received.notify_one();

    if leg != Leg::A || handle.initial_ack_done.swap(true, Ordering::SeqCst) {
        // renegotiation ACKs stop here, we acknowledged the peer leg
        // ourselves when its 200 arrived
        return;
    }

    let (ack, mut target) = {
        let mut call = handle.call.lock().await;
        call.touch();

        let Some(dialog_b) = &mut call.callee else {
            return;
        };

        (dialog_b.create_ack(), dialog_b.target.clone())
    };

    if let Err(e) = in_dialog_send_ack(endpoint, ack, &mut target).await {
        log::warn!("failed to stitch ACK through to leg B, {e}");
    }
}

/// BYE from either side: relay it into the peer dialog, answer the
/// originating side and tear the whole session down.
async fn handle_bye(
    layer: &B2buaLayer,
    endpoint: &Endpoint,
    mut request: IncomingRequest,
    handle: Arc<CallHandle>,
    leg: Leg,
) {
    let (session_id, relayed_bye) = {
        let mut call = handle.call.lock().await;
        call.state = CallState::Terminating;

        let session_id = call.id.clone();

        let relayed_bye = call.dialog_mut(leg.peer()).map(|peer| {
            let mut bye = peer.create_request(Method::BYE);
            bye.headers.remove(&Name::CONTACT);

            (bye, peer.target.clone())
        });

        (session_id, relayed_bye)
    };

    if let Some((mut bye, mut target)) = relayed_bye {
        carry_headers(&request.headers, &mut bye);

        match endpoint.send_request(bye, &mut target).await {
            Ok(mut tsx) => {
                tokio::spawn(async move {
                    if let Err(e) = tsx.receive_final().await {
                        log::debug!("relayed BYE got no final response, {e}");
                    }
                });
            }
            Err(e) => log::warn!("failed to relay BYE, {e}"),
        }
    }

    let response = endpoint.create_response(&request, StatusCode::OK, None);
    let tsx = endpoint.create_server_tsx(&mut request);

    if let Err(e) = tsx.respond(response).await {
        log::warn!("failed to answer BYE, {e}");
    }

    layer.sessions.terminate(&session_id).await;
}

/// reINVITE / UPDATE: renegotiate media through the relay and pipe the
/// rebuilt request into the peer dialog
async fn handle_renegotiation(
    layer: &B2buaLayer,
    endpoint: &Endpoint,
    mut request: IncomingRequest,
    handle: Arc<CallHandle>,
    leg: Leg,
) {
    let method = request.line.method.clone();
    let session_id = handle.call.lock().await.id.clone();

    // pass the new offer through the relay with the same call-id and side
    // tag as the original offer, so the relay refreshes its session
    let offer = std::str::from_utf8(&request.body)
        .ok()
        .filter(|sdp| !sdp.is_empty());

    let rewritten_offer = match offer {
        Some(sdp) => match layer.sessions.process_offer(&session_id, sdp, "", leg).await {
            Ok(rewritten) => Some(rewritten),
            Err(error) => {
                layer.record_error(&error);
                log::error!("relay offer for renegotiation on {session_id} failed: {error}");

                respond_only(endpoint, request, StatusCode::SERVER_INTERNAL_ERROR).await;
                return;
            }
        },
        None => None,
    };

    // rebuild the request in the peer dialog's namespace
    let (peer_request, mut target) = {
        let mut call = handle.call.lock().await;

        let Some(peer) = call.dialog_mut(leg.peer()) else {
            drop(call);
            respond_only(
                endpoint,
                request,
                StatusCode::CALL_OR_TRANSACTION_DOES_NOT_EXIST,
            )
            .await;
            return;
        };

        let mut rebuilt = peer.create_request(method.clone());
        carry_headers(&request.headers, &mut rebuilt);

        if let Some(sdp) = &rewritten_offer {
            rebuilt
                .headers
                .replace(Name::CONTENT_TYPE, ContentType::sdp().0);
            rebuilt.body = Bytes::copy_from_slice(sdp.as_bytes());
        }

        (rebuilt, peer.target.clone())
    };

    let outcome = if method == Method::INVITE {
        relay_reinvite(
            layer,
            endpoint,
            peer_request,
            &handle,
            &session_id,
            leg,
            &mut target,
        )
        .await
    } else {
        relay_update(layer, endpoint, peer_request, &session_id, leg, &mut target).await
    };

    match outcome {
        Ok(relayed) => {
            pipe_back_final(layer, endpoint, request, &handle, leg, relayed).await;
        }
        Err(error) => {
            layer.record_error(&error);
            respond_only(endpoint, request, error.status_code()).await;
        }
    }
}

/// Map the peer's final response into the originating dialog and answer
async fn pipe_back_final(
    layer: &B2buaLayer,
    endpoint: &Endpoint,
    mut request: IncomingRequest,
    handle: &Arc<CallHandle>,
    leg: Leg,
    relayed: RelayedFinal,
) {
    let local_tag = {
        let call = handle.call.lock().await;
        call.dialog(leg)
            .map(|dialog| dialog.local_tag.clone())
            .unwrap_or_default()
    };

    let mut response =
        endpoint.create_response(&request, relayed.code, relayed.reason.map(Into::into));
    set_to_tag(&mut response, &local_tag);
    response
        .msg
        .headers
        .insert_named(&layer.local_contact(&request));

    if let Some(body) = &relayed.body {
        response.msg.headers.insert_named(&ContentType::sdp());
        response.msg.body = Bytes::copy_from_slice(body.as_bytes());
    }

    if request.line.method == Method::INVITE {
        let tsx = endpoint.create_server_inv_tsx(&mut request);

        if relayed.code.kind() == CodeKind::Success {
            match tsx.respond_success(response).await {
                Ok(accepted) => {
                    let handle = handle.clone();

                    tokio::spawn(async move {
                        let ack = handle.ack_received.notified();

                        if accepted.retransmit_until_ack(ack).await.is_err() {
                            log::warn!("renegotiation 200 was never acknowledged");
                        }
                    });
                }
                Err(e) => log::warn!("failed to relay renegotiation response, {e}"),
            }
        } else if let Err(e) = tsx.respond_failure(response).await {
            log::warn!("failed to relay renegotiation response, {e}");
        }
    } else {
        let tsx = endpoint.create_server_tsx(&mut request);

        if let Err(e) = tsx.respond(response).await {
            log::warn!("failed to relay renegotiation response, {e}");
        }
    }
}

/// Drive a relayed reINVITE on the peer leg to its final response,
/// acknowledging a 2xx ourselves and anchoring the renegotiated answer
async fn relay_reinvite(
    layer: &B2buaLayer,
    endpoint: &Endpoint,
    peer_request: Request,
    handle: &Arc<CallHandle>,
    session_id: &str,
    origin: Leg,
    target: &mut TargetTransportInfo,
) -> Result<RelayedFinal, B2buaError> {
    let mut tsx = endpoint.send_invite(peer_request, target).await?;

    loop {
        let Some(response) = tsx.receive().await? else {
            return Err(B2buaError::TxnTimeout);
        };

        match response.line.code.kind() {
            CodeKind::Provisional => continue,
            CodeKind::Success => {
                // acknowledge on the peer leg right away, the originating
                // leg runs its own ACK exchange with us
                let (ack, mut ack_target) = {
                    let mut call = handle.call.lock().await;

                    let Some(peer) = call.dialog_mut(origin.peer()) else {
                        return Err(B2buaError::Internal("peer dialog vanished".into()));
                    };

                    (peer.create_ack(), peer.target.clone())
                };

                if let Err(e) = in_dialog_send_ack(endpoint, ack, &mut ack_target).await {
                    log::warn!("failed to acknowledge renegotiation 200, {e}");
                }

                let answer = std::str::from_utf8(&response.body)
                    .ok()
                    .filter(|sdp| !sdp.is_empty());

                let rewritten = match answer {
                    Some(sdp) => Some(
                        layer
                            .sessions
                            .process_answer(session_id, sdp, "", origin)
                            .await?,
                    ),
                    None => None,
                };

                return Ok(RelayedFinal {
                    code: response.line.code,
                    reason: response.line.reason.as_ref().map(|r| r.to_string()),
                    body: rewritten,
                });
            }
            _ => {
                return Ok(RelayedFinal {
                    code: response.line.code,
                    reason: response.line.reason.as_ref().map(|r| r.to_string()),
                    body: None,
                });
            }
        }
    }
}

/// Relay a rebuilt UPDATE and anchor the answer SDP its 2xx may carry
async fn relay_update(
    layer: &B2buaLayer,
    endpoint: &Endpoint,
    peer_request: Request,
    session_id: &str,
    origin: Leg,
    target: &mut TargetTransportInfo,
) -> Result<RelayedFinal, B2buaError> {
    let mut tsx = endpoint.send_request(peer_request, target).await?;

    let response = tsx.receive_final().await?;

    let body = if response.line.code.kind() == CodeKind::Success {
        let answer = std::str::from_utf8(&response.body)
            .ok()
            .filter(|sdp| !sdp.is_empty());

        match answer {
            Some(sdp) => Some(
                layer
                    .sessions
                    .process_answer(session_id, sdp, "", origin)
                    .await?,
            ),
            None => None,
        }
    } else {
        None
    };

    Ok(RelayedFinal {
        code: response.line.code,
        reason: response.line.reason.as_ref().map(|r| r.to_string()),
        body,
    })
}

/// INFO, MESSAGE, REFER, PRACK and friends pass between the legs with a
/// rebuilt envelope and an untouched payload
async fn relay_transparent(
    layer: &B2buaLayer,
    endpoint: &Endpoint,
    mut request: IncomingRequest,
    handle: Arc<CallHandle>,
    leg: Leg,
) {
    let method = request.line.method.clone();

    let (peer_request, mut target) = {
        let mut call = handle.call.lock().await;

        let Some(peer) = call.dialog_mut(leg.peer()) else {
            drop(call);
            respond_only(
                endpoint,
                request,
                StatusCode::CALL_OR_TRANSACTION_DOES_NOT_EXIST,
            )
            .await;
            return;
        };

        let mut rebuilt = peer.create_request(method);

        // carries the Content-Type along with the other end-to-end headers
        carry_headers(&request.headers, &mut rebuilt);
        rebuilt.body = request.body.clone();

        (rebuilt, peer.target.clone())
    };

    let outcome = async {
        let mut tsx = endpoint.send_request(peer_request, &mut target).await?;
        Ok::<_, sip_core::Error>(tsx.receive_final().await?)
    }
    .await;

    match outcome {
        Ok(response) => {
            let mut relayed =
                endpoint.create_response(&request, response.line.code, response.line.reason.clone());

            if !response.body.is_empty() {
                response
                    .headers
                    .clone_into(&mut relayed.msg.headers, Name::CONTENT_TYPE);
                relayed.msg.body = response.body.clone();
            }

            let tsx = endpoint.create_server_tsx(&mut request);

            if let Err(e) = tsx.respond(relayed).await {
                log::warn!("failed to pipe back final response, {e}");
            }
        }
        Err(error) => {
            let error = B2buaError::from(error);
            layer.record_error(&error);
            respond_only(endpoint, request, error.status_code()).await;
        }
    }
}

/// Final response with no further processing, for both INVITE and
/// non-INVITE server transactions
async fn respond_only(endpoint: &Endpoint, mut request: IncomingRequest, code: StatusCode) {
    let response = endpoint.create_response(&request, code, None);

    let result = if request.line.method == Method::INVITE {
        let tsx = endpoint.create_server_inv_tsx(&mut request);
        tsx.respond_failure(response).await
    } else {
        let tsx = endpoint.create_server_tsx(&mut request);
        tsx.respond(response).await
    };

    if let Err(e) = result {
        log::warn!("failed to send response, {e}");
    }
}
