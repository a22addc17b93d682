//! Handling of initial INVITEs: the A leg is answered here, the B leg is
//! originated and supervised until the call is connected or dead.

use super::{set_to_tag, B2buaLayer};
use crate::call::{Call, CallHandle, CallRegistry, CallState, Leg};
use crate::dialog::Dialog;
use crate::error::B2buaError;
use crate::routing::{RouteDecision, RouteInput};
use bytes::Bytes;
use bytesstr::BytesStr;
use sip_core::transaction::{ClientInvTsx, ServerInvTsx, TsxResponse};
use sip_core::transport::TargetTransportInfo;
use sip_core::{Endpoint, IncomingRequest};
use sip_types::header::typed::{ContentType, DigestResponse, MaxForwards};
use sip_types::header::HeaderValue;
use sip_types::uri::SipUri;
use sip_types::{CodeKind, Method, Name, StatusCode};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Notify;

/// Outcome of the digest gate
enum Gate {
    Continue(String),
    Challenge,
    Deny,
}

#[tracing::instrument(
    name = "invite",
    level = "debug",
    skip(layer, endpoint, invite),
    fields(%invite, source = %invite.tp_info.source)
)]
pub(super) async fn handle_initial_invite(
    layer: &B2buaLayer,
    endpoint: &Endpoint,
    mut invite: IncomingRequest,
) {
    layer.metrics.invites_received.inc();

    let source_ip = invite.tp_info.source.ip();

    // source gate ahead of everything, including the rate window
    if !layer.acl.permits(source_ip) {
        let error = B2buaError::AclDeny;
        layer.record_error(&error);
        log::info!("source {source_ip} denied by acl");

        reject(endpoint, invite, error.status_code(), None).await;
        return;
    }

    if let Err(code) = layer.admission_check(source_ip) {
        reject(endpoint, invite, code, None).await;
        return;
    }

    // forwarding the request will decrement Max-Forwards, reject when that
    // would reach zero
    let max_forwards = invite
        .headers
        .get_named::<MaxForwards>()
        .map(|mf| mf.0)
        .unwrap_or(70);

    if max_forwards <= 1 {
        layer.metrics.record_error("loop_detected");
        reject(endpoint, invite, StatusCode::TOO_MANY_HOPS, None).await;
        return;
    }

    // digest gate
    let identity = match authenticate(layer, &invite) {
        Gate::Continue(identity) => identity,
        Gate::Challenge => {
            challenge(layer, endpoint, invite).await;
            return;
        }
        Gate::Deny => {
            layer.metrics.record_error("auth_failure");
            reject(endpoint, invite, StatusCode::FORBIDDEN, None).await;
            return;
        }
    };

    let mut tsx = endpoint.create_server_inv_tsx(&mut invite);

    let mut trying = endpoint.create_response(&invite, StatusCode::TRYING, None);
    if let Err(e) = tsx.respond_provisional(&mut trying).await {
        log::warn!("failed to send 100 Trying, {e}");
        return;
    }

    // dialog A and the composite call
    let contact = layer.local_contact(&invite);
    let dialog_a = Dialog::new_uas(&invite, contact.clone());
    let a_local_tag = dialog_a.local_tag.clone();

    let session_id = CallRegistry::session_id(&dialog_a.call_id);
    let call = Call::new(session_id.clone(), identity, dialog_a);

    let handle = match layer.sessions.create_session(call).await {
        Ok(handle) => handle,
        Err(error) => {
            layer.record_error(&error);

            let reason = match &error {
                B2buaError::LimitExceeded => Some(BytesStr::from_static("Maximum Sessions Exceeded")),
                _ => None,
            };

            let mut response = endpoint.create_response(&invite, error.status_code(), reason);
            set_to_tag(&mut response, &a_local_tag);

            if let Err(e) = tsx.respond_failure(response).await {
                log::warn!("failed to reject INVITE, {e}");
            }

            return;
        }
    };

    // routing decision
    let from_raw = invite.headers.get(&Name::FROM).cloned().unwrap_or_default();
    let to_raw = invite.headers.get(&Name::TO).cloned().unwrap_or_default();

    let decision = layer.engine.route(&RouteInput {
        request_uri: invite.line.uri.to_string(),
        from: &from_raw[..],
        to: &to_raw[..],
        source_ip,
        headers: &invite.headers,
    });

    let (rule_id, next_hop, add_headers, remove_headers, media_flags) = match decision {
        RouteDecision::NoMatch => {
            layer.metrics.record_error("no_route_match");
            log::info!("no route for {} from {source_ip}", invite.line.uri);

            finish_rejected(layer, endpoint, &invite, tsx, &a_local_tag, &session_id, StatusCode::NOT_FOUND, None, None).await;
            return;
        }
        RouteDecision::Reject {
            rule_id,
            code,
            reason,
        } => {
            layer.metrics.record_error("rule_reject");
            log::info!("rule {rule_id} rejects call with {code} {reason}");

            finish_rejected(
                layer,
                endpoint,
                &invite,
                tsx,
                &a_local_tag,
                &session_id,
                StatusCode::from(code),
                Some(BytesStr::from(reason)),
                None,
            )
            .await;
            return;
        }
        RouteDecision::Redirect { rule_id, target } => {
            log::info!("rule {rule_id} redirects call to {target}");

            finish_rejected(
                layer,
                endpoint,
                &invite,
                tsx,
                &a_local_tag,
                &session_id,
                StatusCode::MOVED_TEMPORARILY,
                None,
                Some(target),
            )
            .await;
            return;
        }
        RouteDecision::Forward {
            rule_id,
            next_hop,
            add_headers,
            remove_headers,
            media_flags,
        } => (rule_id, next_hop, add_headers, remove_headers, media_flags),
    };

    let next_hop = match SipUri::parse(&next_hop) {
        Ok(uri) => uri,
        Err(e) => {
            log::error!("rule {rule_id} has unusable next hop: {e}");

            finish_rejected(layer, endpoint, &invite, tsx, &a_local_tag, &session_id, StatusCode::SERVER_INTERNAL_ERROR, None, None).await;
            return;
        }
    };

    // anchor media before the outbound leg exists
    let offer = std::str::from_utf8(&invite.body).ok().filter(|sdp| !sdp.is_empty());

    let rewritten_offer = match offer {
        Some(sdp) => {
            match layer
                .sessions
                .process_offer(&session_id, sdp, &media_flags, Leg::A)
                .await
            {
                Ok(rewritten) => Some(rewritten),
                Err(error) => {
                    layer.record_error(&error);
                    log::error!("media relay offer failed for {session_id}: {error}");

                    finish_rejected(layer, endpoint, &invite, tsx, &a_local_tag, &session_id, StatusCode::SERVER_INTERNAL_ERROR, None, None).await;
                    return;
                }
            }
        }
        None => None,
    };

    // build the outbound leg
    let mut dialog_b = Dialog::new_uac(layer.local_identity.clone(), next_hop, contact);

    let mut request_b = dialog_b.create_request(Method::INVITE);

    request_b
        .headers
        .replace(Name::MAX_FORWARDS, (max_forwards - 1).to_string());

    for (name, value) in &add_headers {
        request_b.headers.insert(name.as_str(), value.as_str());
    }

    for name in &remove_headers {
        request_b.headers.remove(&Name::from(name.as_str()));
    }

    if let Some(sdp) = &rewritten_offer {
        request_b.headers.insert_named(&ContentType::sdp());
        request_b.body = Bytes::copy_from_slice(sdp.as_bytes());
    }

    let callee_key = dialog_b.key();

    if let Err(error) = layer.sessions.attach_callee_dialog(&session_id, dialog_b).await {
        layer.record_error(&error);

        finish_rejected(layer, endpoint, &invite, tsx, &a_local_tag, &session_id, StatusCode::SERVER_INTERNAL_ERROR, None, None).await;
        return;
    }

    // from here on a CANCEL from the caller can abort the call
    let cancel_branch = invite.tsx_key.branch().clone();
    let cancelled = layer.register_cancellable(cancel_branch.clone());

    let mut target = TargetTransportInfo::default();

    let tsx_b = match endpoint.send_invite(request_b, &mut target).await {
        Ok(tsx_b) => tsx_b,
        Err(e) => {
            log::error!("failed to send outbound INVITE for {session_id}: {e}");
            layer.metrics.record_error("sip");
            layer.unregister_cancellable(&cancel_branch);

            finish_rejected(layer, endpoint, &invite, tsx, &a_local_tag, &session_id, StatusCode::SERVER_INTERNAL_ERROR, None, None).await;
            return;
        }
    };

    log::info!(
        "session {session_id} calling out via rule {rule_id}, relay key {callee_key:?}"
    );

    supervise_outbound(
        layer,
        endpoint,
        invite,
        tsx,
        tsx_b,
        handle,
        cancelled,
        a_local_tag,
        session_id,
        media_flags,
        target,
    )
    .await;

    layer.unregister_cancellable(&cancel_branch);
}

fn authenticate(layer: &B2buaLayer, invite: &IncomingRequest) -> Gate {
    let Some(authenticator) = &layer.authenticator else {
        return Gate::Continue(from_user(invite));
    };

    let Some(raw) = invite.headers.get(&Name::AUTHORIZATION) else {
        return Gate::Challenge;
    };

    let authorization = match DigestResponse::parse(raw) {
        Ok(authorization) => authorization,
        Err(e) => {
            log::debug!("unreadable Authorization header: {e}");
            return Gate::Deny;
        }
    };

    match authenticator.verify(
        &invite.line.method,
        &authorization,
        invite.tp_info.source.ip(),
    ) {
        Ok(username) => Gate::Continue(username),
        Err(e) => {
            log::info!(
                "digest authentication of {} from {} failed: {e}",
                authorization.username,
                invite.tp_info.source
            );

            Gate::Deny
        }
    }
}

fn from_user(invite: &IncomingRequest) -> String {
    invite
        .base_headers
        .from
        .addr
        .uri
        .user
        .as_ref()
        .map(|user| user.to_string())
        .unwrap_or_else(|| "anonymous".to_owned())
}

/// Answer a request we never created state for
async fn reject(
    endpoint: &Endpoint,
    mut invite: IncomingRequest,
    code: StatusCode,
    reason: Option<BytesStr>,
) {
    let response = endpoint.create_response(&invite, code, reason);
    let tsx = endpoint.create_server_inv_tsx(&mut invite);

    if let Err(e) = tsx.respond_failure(response).await {
        log::warn!("failed to reject INVITE, {e}");
    }
}

/// 401 with a fresh challenge, no dialog is created
async fn challenge(layer: &B2buaLayer, endpoint: &Endpoint, mut invite: IncomingRequest) {
    let mut response =
        endpoint.create_response(&invite, StatusCode::UNAUTHORIZED, None);

    if let Some(challenge) = layer.challenge_for(invite.tp_info.source.ip()) {
        response
            .msg
            .headers
            .insert(Name::WWW_AUTHENTICATE, challenge.to_string());
    }

    let tsx = endpoint.create_server_inv_tsx(&mut invite);

    if let Err(e) = tsx.respond_failure(response).await {
        log::warn!("failed to send digest challenge, {e}");
    }
}

/// Send a final failure on the A leg and release the session again
#[allow(clippy::too_many_arguments)]
async fn finish_rejected(
    layer: &B2buaLayer,
    endpoint: &Endpoint,
    invite: &IncomingRequest,
    tsx: ServerInvTsx,
    a_local_tag: &BytesStr,
    session_id: &str,
    code: StatusCode,
    reason: Option<BytesStr>,
    redirect_contact: Option<String>,
) {
    let mut response = endpoint.create_response(invite, code, reason);
    set_to_tag(&mut response, a_local_tag);

    if let Some(contact) = redirect_contact {
        response.msg.headers.insert(Name::CONTACT, format!("<{contact}>"));
    }

    if let Err(e) = tsx.respond_failure(response).await {
        log::warn!("failed to send final response, {e}");
    }

    layer.sessions.terminate(session_id).await;
}

/// Drive the B leg INVITE transaction, relaying everything the callee says
/// to the caller until the call is connected, rejected, cancelled or timed
/// out.
#[allow(clippy::too_many_arguments)]
async fn supervise_outbound(
    layer: &B2buaLayer,
    endpoint: &Endpoint,
    invite: IncomingRequest,
    tsx_a: ServerInvTsx,
    mut tsx_b: ClientInvTsx,
    handle: Arc<CallHandle>,
    cancelled: Arc<Notify>,
    a_local_tag: BytesStr,
    session_id: String,
    media_flags: String,
    target_b: TargetTransportInfo,
) {
    let ring_deadline = Instant::now() + layer.config.ring_timeout;
    let mut caller_cancelled = false;
    let mut tsx_a = Some(tsx_a);

    loop {
        let event = tokio::select! {
            _ = cancelled.notified(), if !caller_cancelled => {
                caller_cancelled = true;

                log::info!("caller cancelled session {session_id}");

                if let Err(e) = tsx_b.cancel().await {
                    log::warn!("failed to cancel outbound INVITE, {e}");
                }

                // now wait for the 487 from the callee
                continue;
            }
            _ = tokio::time::sleep_until(ring_deadline.into()) => {
                Err(sip_core::Error::RequestTimedOut)
            }
            received = tsx_b.receive() => received,
        };

        match event {
            Ok(Some(response)) => {
                let code = response.line.code;

                match code.kind() {
                    CodeKind::Provisional => {
                        if code == StatusCode::TRYING {
                            // we answered 100 ourselves already
                            continue;
                        }

                        relay_provisional(
                            layer,
                            endpoint,
                            &invite,
                            tsx_a.as_mut().expect("final response not sent yet"),
                            &a_local_tag,
                            &session_id,
                            &response,
                        )
                        .await;
                    }
                    CodeKind::Success => {
                        let tsx_a = tsx_a.take().expect("final response not sent yet");

                        connect_call(
                            layer,
                            endpoint,
                            &invite,
                            tsx_a,
                            &handle,
                            &a_local_tag,
                            &session_id,
                            &media_flags,
                            response,
                            caller_cancelled,
                            target_b,
                        )
                        .await;

                        return;
                    }
                    _ => {
                        // final failure from the callee side
                        let tsx_a = tsx_a.take().expect("final response not sent yet");

                        let mut relayed = endpoint.create_response(
                            &invite,
                            code,
                            response.line.reason.clone(),
                        );
                        set_to_tag(&mut relayed, &a_local_tag);

                        if let Err(e) = tsx_a.respond_failure(relayed).await {
                            log::warn!("failed to relay final response, {e}");
                        }

                        layer.sessions.terminate(&session_id).await;

                        return;
                    }
                }
            }
            Ok(None) => {
                // transaction ended without a final response reaching us
                let tsx_a = tsx_a.take().expect("final response not sent yet");

                layer.metrics.record_error("txn_timeout");
                timeout_call(layer, endpoint, &invite, tsx_a, &a_local_tag, &session_id).await;

                return;
            }
            Err(sip_core::Error::RequestTimedOut) => {
                let tsx_a = tsx_a.take().expect("final response not sent yet");

                layer.metrics.record_error("txn_timeout");
                timeout_call(layer, endpoint, &invite, tsx_a, &a_local_tag, &session_id).await;

                return;
            }
            Err(e) => {
                let tsx_a = tsx_a.take().expect("final response not sent yet");

                log::error!("outbound leg of {session_id} failed: {e}");
                layer.metrics.record_error("sip");

                let mut response = endpoint.create_response(
                    &invite,
                    StatusCode::SERVER_INTERNAL_ERROR,
                    None,
                );
                set_to_tag(&mut response, &a_local_tag);

                if let Err(e) = tsx_a.respond_failure(response).await {
                    log::warn!("failed to send final response, {e}");
                }

                layer.sessions.terminate(&session_id).await;

                return;
            }
        }
    }
}

/// Forward a provisional (not 100) from the callee into the caller's dialog
async fn relay_provisional(
    layer: &B2buaLayer,
    endpoint: &Endpoint,
    invite: &IncomingRequest,
    tsx_a: &mut ServerInvTsx,
    a_local_tag: &BytesStr,
    session_id: &str,
    response: &TsxResponse,
) {
    let mut relayed =
        endpoint.create_response(invite, response.line.code, response.line.reason.clone());

    set_to_tag(&mut relayed, a_local_tag);
    relayed
        .msg
        .headers
        .insert_named(&layer.local_contact(invite));

    if !response.body.is_empty() {
        response
            .headers
            .clone_into(&mut relayed.msg.headers, Name::CONTENT_TYPE);
        relayed.msg.body = response.body.clone();
    }

    if let Err(e) = tsx_a.respond_provisional(&mut relayed).await {
        log::warn!("failed to relay provisional response, {e}");
    }

    if response.line.code == StatusCode::RINGING {
        layer
            .sessions
            .update_state(session_id, CallState::Ringing)
            .await;
    }
}

/// The callee answered: commit dialog B, anchor the answer SDP and relay
/// the 200 onto leg A
#[allow(clippy::too_many_arguments)]
async fn connect_call(
    layer: &B2buaLayer,
    endpoint: &Endpoint,
    invite: &IncomingRequest,
    tsx_a: ServerInvTsx,
    handle: &Arc<CallHandle>,
    a_local_tag: &BytesStr,
    session_id: &str,
    media_flags: &str,
    response: TsxResponse,
    caller_cancelled: bool,
    target_b: TargetTransportInfo,
) {
    let Some(to_tag) = response.base_headers.to.tag.clone() else {
        log::warn!("2xx without To tag on leg B of {session_id}, tearing down");

        let mut relayed =
            endpoint.create_response(invite, StatusCode::SERVER_INTERNAL_ERROR, None);
        set_to_tag(&mut relayed, a_local_tag);

        let _ = tsx_a.respond_failure(relayed).await;
        layer.sessions.terminate(session_id).await;

        return;
    };

    // commit the outbound dialog with the callee's tag and contact
    let reindex = {
        let mut call = handle.call.lock().await;

        call.callee.as_mut().map(|dialog_b| {
            let old_key = dialog_b.key();

            dialog_b.confirm_uac(to_tag, &response.headers);
            dialog_b.target = target_b;

            (old_key, dialog_b.key())
        })
    };

    if let Some((old_key, new_key)) = reindex {
        layer.sessions.reindex_callee(session_id, &old_key, new_key);
    }

    // the caller gave up in the meantime, unwind the answered leg
    if caller_cancelled {
        acknowledge_and_hangup(endpoint, handle).await;

        let mut relayed =
            endpoint.create_response(invite, StatusCode::REQUEST_TERMINATED, None);
        set_to_tag(&mut relayed, a_local_tag);

        if let Err(e) = tsx_a.respond_failure(relayed).await {
            log::warn!("failed to answer cancelled INVITE, {e}");
        }

        layer.sessions.terminate(session_id).await;

        return;
    }

    // anchor the callee's answer
    let answer = std::str::from_utf8(&response.body)
        .ok()
        .filter(|sdp| !sdp.is_empty());

    let rewritten_answer = match answer {
        Some(sdp) => {
            match layer
                .sessions
                .process_answer(session_id, sdp, media_flags, Leg::A)
                .await
            {
                Ok(rewritten) => Some(rewritten),
                Err(error) => {
                    layer.record_error(&error);
                    log::error!("media relay answer failed for {session_id}: {error}");

                    acknowledge_and_hangup(endpoint, handle).await;

                    let mut relayed = endpoint.create_response(
                        invite,
                        StatusCode::SERVER_INTERNAL_ERROR,
                        None,
                    );
                    set_to_tag(&mut relayed, a_local_tag);

                    let _ = tsx_a.respond_failure(relayed).await;
                    layer.sessions.terminate(session_id).await;

                    return;
                }
            }
        }
        None => None,
    };

    // relay the 200 into the caller's dialog
    let mut relayed = endpoint.create_response(invite, response.line.code, None);
    set_to_tag(&mut relayed, a_local_tag);
    relayed
        .msg
        .headers
        .insert_named(&layer.local_contact(invite));

    if let Some(sdp) = &rewritten_answer {
        relayed.msg.headers.insert_named(&ContentType::sdp());
        relayed.msg.body = Bytes::copy_from_slice(sdp.as_bytes());
    }

    let accepted = match tsx_a.respond_success(relayed).await {
        Ok(accepted) => accepted,
        Err(e) => {
            log::warn!("failed to relay 200 OK, {e}");
            layer.sessions.terminate(session_id).await;
            return;
        }
    };

    layer
        .sessions
        .update_state(session_id, CallState::Connected)
        .await;

    log::info!("session {session_id} connected");

    // retransmit the 200 until the caller acknowledges it
    let handle = handle.clone();
    let sessions = layer.sessions.clone();
    let session_id = session_id.to_owned();

    tokio::spawn(async move {
        let ack = handle.ack_received.notified();

        if accepted.retransmit_until_ack(ack).await.is_err() {
            log::warn!("caller never acknowledged 200 OK on {session_id}, tearing down");

            sessions.terminate(&session_id).await;
        }
    });
}

/// 408 toward the caller after the outbound leg went unanswered
async fn timeout_call(
    layer: &B2buaLayer,
    endpoint: &Endpoint,
    invite: &IncomingRequest,
    tsx_a: ServerInvTsx,
    a_local_tag: &BytesStr,
    session_id: &str,
) {
    log::info!("outbound leg of {session_id} timed out");

    let mut response = endpoint.create_response(invite, StatusCode::REQUEST_TIMEOUT, None);
    set_to_tag(&mut response, a_local_tag);

    if let Err(e) = tsx_a.respond_failure(response).await {
        log::warn!("failed to send 408, {e}");
    }

    layer.sessions.terminate(session_id).await;
}

/// ACK an answered outbound leg and immediately hang it up again. Used when
/// the callee's 2xx lost a race against cancellation or a relay failure.
pub(super) async fn acknowledge_and_hangup(endpoint: &Endpoint, handle: &Arc<CallHandle>) {
    let (ack, bye, mut target) = {
        let mut call = handle.call.lock().await;

        let Some(dialog_b) = &mut call.callee else {
            return;
        };

        (
            dialog_b.create_ack(),
            dialog_b.create_request(Method::BYE),
            dialog_b.target.clone(),
        )
    };

    if let Err(e) = in_dialog_send_ack(endpoint, ack, &mut target).await {
        log::warn!("failed to acknowledge orphaned 2xx, {e}");
    }

    match endpoint.send_request(bye, &mut target).await {
        Ok(mut tsx) => {
            tokio::spawn(async move {
                if let Err(e) = tsx.receive_final().await {
                    log::debug!("hangup of orphaned leg got no answer, {e}");
                }
            });
        }
        Err(e) => log::warn!("failed to hang up orphaned leg, {e}"),
    }
}

/// Send an ACK outside any transaction, with its own Via branch
pub(crate) async fn in_dialog_send_ack(
    endpoint: &Endpoint,
    ack: sip_core::Request,
    target: &mut TargetTransportInfo,
) -> Result<(), sip_core::Error> {
    use sip_core::transaction::TsxKey;

    let mut outgoing = endpoint.create_outgoing(ack, target).await?;

    let via = endpoint.create_via(
        &outgoing.parts.transport,
        &TsxKey::client(&Method::ACK),
        target.via_host_port.clone(),
    );

    outgoing.msg.headers.insert_named_front(&via);
    endpoint.send_outgoing_request(&mut outgoing).await?;

    Ok(())
}
