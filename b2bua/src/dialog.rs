use bytesstr::BytesStr;
use rand::distr::Alphanumeric;
use rand::{rng, Rng};
use sip_core::transport::TargetTransportInfo;
use sip_core::{IncomingRequest, Request};
use sip_types::header::typed::{CSeq, CallId, Contact, FromTo, MaxForwards, RecordRoute, Route};
use sip_types::uri::{NameAddr, SipUri};
use sip_types::{Headers, Method, Name};
use std::time::Instant;

pub fn random_string() -> BytesStr {
    rng()
        .sample_iter(Alphanumeric)
        .take(30)
        .map(char::from)
        .collect::<String>()
        .into()
}

pub fn random_sequence_number() -> u32 {
    rng().random_range(0..(u32::MAX >> 1))
}

/// Which end of the dialog this B2BUA leg plays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialogRole {
    /// Inbound leg, we answered the dialog forming request
    Uas,
    /// Outbound leg, we sent the dialog forming request
    Uac,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialogState {
    Early,
    Confirmed,
    Terminated,
}

/// Index key of a dialog: Call-ID plus the tag pair.
///
/// The remote tag is optional so early UAC dialogs can be found before the
/// peer committed its tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DialogKey {
    pub call_id: BytesStr,
    pub local_tag: BytesStr,
    pub remote_tag: Option<BytesStr>,
}

impl DialogKey {
    /// Key of the dialog an in-dialog request belongs to. The To tag is the
    /// local tag from the receiver's point of view.
    pub fn from_incoming(request: &IncomingRequest) -> Option<Self> {
        Some(Self {
            call_id: request.base_headers.call_id.0.clone(),
            local_tag: request.base_headers.to.tag.clone()?,
            remote_tag: request.base_headers.from.tag.clone(),
        })
    }
}

/// One leg of a call.
///
/// Dialogs are owned exclusively by their [`Call`](crate::call::Call); the
/// peer dialog is referenced by the call, never directly, so teardown cannot
/// leave cycles.
#[derive(Debug)]
pub struct Dialog {
    pub role: DialogRole,
    pub state: DialogState,

    pub call_id: BytesStr,
    pub local_tag: BytesStr,
    pub remote_tag: Option<BytesStr>,

    /// Address of record we put into From of our requests
    pub local_addr: NameAddr,
    /// Address of record for the To of our requests
    pub remote_addr: NameAddr,

    /// CSeq of the next request this side originates, strictly increasing
    pub local_cseq: u32,
    /// Highest CSeq seen from the peer, non decreasing
    pub remote_cseq: u32,

    /// Where in-dialog requests are sent, the peer's Contact
    pub remote_target: SipUri,
    pub local_contact: Contact,

    /// Route set in the order it applies to outgoing requests
    pub route_set: Vec<Route>,

    /// Extra headers applied to every forwarded request on this leg,
    /// maintained through the management API
    pub header_overrides: Vec<(String, Option<String>)>,

    /// CSeq of the last INVITE this side sent, the ACK must reuse it
    pub last_invite_cseq: Option<u32>,

    /// Cached transport selection for the remote target
    pub target: TargetTransportInfo,

    pub created_at: Instant,
    pub last_activity: Instant,
}

impl Dialog {
    /// Build the UAS side dialog from a dialog forming request.
    ///
    /// The route set is the request's Record-Route list in received order,
    /// per RFC 3261 12.1.1 (the topmost entry is the proxy closest to us).
    pub fn new_uas(request: &IncomingRequest, local_contact: Contact) -> Self {
        let record_routes: Vec<RecordRoute> = request.headers.get_named_list().unwrap_or_default();

        let route_set = record_routes.into_iter().map(Route::from).collect();

        let remote_target = request
            .headers
            .get_named::<Contact>()
            .map(|contact| contact.addr.uri)
            .unwrap_or_else(|_| request.line.uri.clone());

        let now = Instant::now();

        Self {
            role: DialogRole::Uas,
            state: DialogState::Early,
            call_id: request.base_headers.call_id.0.clone(),
            local_tag: random_string(),
            remote_tag: request.base_headers.from.tag.clone(),
            // seen from this side, the request's From is the remote party
            local_addr: request.base_headers.to.addr.clone(),
            remote_addr: request.base_headers.from.addr.clone(),
            local_cseq: random_sequence_number(),
            remote_cseq: request.base_headers.cseq.cseq,
            remote_target,
            local_contact,
            route_set,
            header_overrides: Vec::new(),
            last_invite_cseq: None,
            target: TargetTransportInfo::default(),
            created_at: now,
            last_activity: now,
        }
    }

    /// Build the UAC side dialog for a fresh outbound leg. Call-ID, From
    /// tag and CSeq space are newly generated, nothing leaks over from the
    /// paired inbound leg.
    pub fn new_uac(local_addr: NameAddr, target: SipUri, local_contact: Contact) -> Self {
        let now = Instant::now();

        Self {
            role: DialogRole::Uac,
            state: DialogState::Early,
            call_id: random_string(),
            local_tag: random_string(),
            remote_tag: None,
            local_addr,
            remote_addr: NameAddr::uri(target.clone()),
            local_cseq: random_sequence_number(),
            remote_cseq: 0,
            remote_target: target,
            local_contact,
            route_set: Vec::new(),
            header_overrides: Vec::new(),
            last_invite_cseq: None,
            target: TargetTransportInfo::default(),
            created_at: now,
            last_activity: now,
        }
    }

    pub fn key(&self) -> DialogKey {
        DialogKey {
            call_id: self.call_id.clone(),
            local_tag: self.local_tag.clone(),
            remote_tag: self.remote_tag.clone(),
        }
    }

    /// Commit a UAC dialog with the peer's final response: adopt the remote
    /// tag, the Contact as remote target and the route set from
    /// Record-Route in reverse order (RFC 3261 12.1.2)
    pub fn confirm_uac(&mut self, to_tag: BytesStr, headers: &Headers) {
        debug_assert_eq!(self.role, DialogRole::Uac);

        self.remote_tag = Some(to_tag);
        self.state = DialogState::Confirmed;

        if let Ok(contact) = headers.get_named::<Contact>() {
            self.remote_target = contact.addr.uri;
        }

        let record_routes: Vec<RecordRoute> = headers.get_named_list().unwrap_or_default();
        self.route_set = record_routes.into_iter().rev().map(Route::from).collect();
    }

    /// Construct the next request this side originates inside the dialog
    pub fn create_request(&mut self, method: Method) -> Request {
        let cseq = CSeq::new(self.local_cseq, method.clone());

        if method == Method::INVITE {
            self.last_invite_cseq = Some(self.local_cseq);
        }

        self.local_cseq += 1;
        self.touch();

        let mut request = Request::new(method, self.remote_target.clone());

        request.headers.insert_named(&MaxForwards(70));
        request.headers.insert(
            Name::FROM,
            FromTo::new(self.local_addr.clone(), Some(self.local_tag.clone())).to_string(),
        );
        request.headers.insert(
            Name::TO,
            FromTo::new(self.remote_addr.clone(), self.remote_tag.clone()).to_string(),
        );
        request.headers.insert_named(&CallId(self.call_id.clone()));
        request.headers.insert_named(&cseq);
        request.headers.insert_named(&self.local_contact);

        for route in &self.route_set {
            request.headers.insert_named(route);
        }

        for (name, value) in &self.header_overrides {
            match value {
                Some(value) => request.headers.replace(name.as_str(), value.as_str()),
                None => {
                    request.headers.remove(&Name::from(name.as_str()));
                }
            }
        }

        request
    }

    /// The ACK completing our last INVITE's 2xx handshake. It reuses the
    /// INVITE's CSeq number with the ACK method and does not advance the
    /// local CSeq.
    pub fn create_ack(&mut self) -> Request {
        let cseq = CSeq::new(
            self.last_invite_cseq.unwrap_or(self.local_cseq),
            Method::ACK,
        );
        self.touch();

        let mut request = Request::new(Method::ACK, self.remote_target.clone());

        request.headers.insert_named(&MaxForwards(70));
        request.headers.insert(
            Name::FROM,
            FromTo::new(self.local_addr.clone(), Some(self.local_tag.clone())).to_string(),
        );
        request.headers.insert(
            Name::TO,
            FromTo::new(self.remote_addr.clone(), self.remote_tag.clone()).to_string(),
        );
        request.headers.insert_named(&CallId(self.call_id.clone()));
        request.headers.insert_named(&cseq);

        for route in &self.route_set {
            request.headers.insert_named(route);
        }

        request
    }

    /// Record a valid in-dialog request from the peer.
    ///
    /// Returns false when the CSeq went backwards, which the caller answers
    /// with 500 per RFC 3261 12.2.2.
    pub fn record_remote_cseq(&mut self, cseq: u32) -> bool {
        if cseq < self.remote_cseq {
            return false;
        }

        self.remote_cseq = cseq;
        self.touch();

        true
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn is_terminated(&self) -> bool {
        self.state == DialogState::Terminated
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use sip_types::host::HostPort;

    fn contact() -> Contact {
        let uri = SipUri::new(HostPort::parse("198.51.100.1:5060").unwrap());
        Contact::new(NameAddr::uri(uri))
    }

    #[test]
    fn uac_dialog_has_fresh_identifiers() {
        let target = SipUri::parse("sip:gw@192.0.2.1:5060").unwrap();
        let local = NameAddr::parse("<sip:tandem@198.51.100.1>").unwrap().0;

        let a = Dialog::new_uac(local.clone(), target.clone(), contact());
        let b = Dialog::new_uac(local, target, contact());

        assert_ne!(a.call_id, b.call_id);
        assert_ne!(a.local_tag, b.local_tag);
        assert!(a.remote_tag.is_none());
    }

    #[test]
    fn local_cseq_strictly_increases() {
        let target = SipUri::parse("sip:gw@192.0.2.1").unwrap();
        let local = NameAddr::parse("<sip:tandem@198.51.100.1>").unwrap().0;

        let mut dialog = Dialog::new_uac(local, target, contact());

        let first = dialog.create_request(Method::INVITE);
        let second = dialog.create_request(Method::BYE);

        let first_cseq: CSeq = first.headers.get_named().unwrap();
        let second_cseq: CSeq = second.headers.get_named().unwrap();

        assert_eq!(second_cseq.cseq, first_cseq.cseq + 1);
    }

    #[test]
    fn remote_cseq_must_not_go_backwards() {
        let target = SipUri::parse("sip:gw@192.0.2.1").unwrap();
        let local = NameAddr::parse("<sip:tandem@198.51.100.1>").unwrap().0;

        let mut dialog = Dialog::new_uac(local, target, contact());

        assert!(dialog.record_remote_cseq(10));
        assert!(dialog.record_remote_cseq(10));
        assert!(dialog.record_remote_cseq(11));
        assert!(!dialog.record_remote_cseq(9));
    }

    #[test]
    fn confirm_uac_adopts_response_route_set() {
        let target = SipUri::parse("sip:gw@192.0.2.1").unwrap();
        let local = NameAddr::parse("<sip:tandem@198.51.100.1>").unwrap().0;

        let mut dialog = Dialog::new_uac(local, target, contact());

        let mut headers = Headers::new();
        headers.insert(Name::RECORD_ROUTE, "<sip:p1.example.com;lr>");
        headers.insert(Name::RECORD_ROUTE, "<sip:p2.example.com;lr>");
        headers.insert(Name::CONTACT, "<sip:gw-contact@192.0.2.1:5080>");

        dialog.confirm_uac("peer-tag".into(), &headers);

        assert_eq!(dialog.state, DialogState::Confirmed);
        assert_eq!(dialog.remote_tag.as_deref(), Some("peer-tag"));
        assert_eq!(
            dialog.remote_target.to_string(),
            "sip:gw-contact@192.0.2.1:5080"
        );

        // reversed, so the proxy closest to us comes first
        assert_eq!(dialog.route_set.len(), 2);
        assert_eq!(
            dialog.route_set[0].to_string(),
            "<sip:p2.example.com;lr>"
        );
    }

    #[test]
    fn header_overrides_apply_to_requests() {
        let target = SipUri::parse("sip:gw@192.0.2.1").unwrap();
        let local = NameAddr::parse("<sip:tandem@198.51.100.1>").unwrap().0;

        let mut dialog = Dialog::new_uac(local, target, contact());

        dialog
            .header_overrides
            .push(("X-Carrier".into(), Some("gold".into())));
        dialog.header_overrides.push(("User-Agent".into(), None));

        let request = dialog.create_request(Method::INFO);

        assert_eq!(
            request.headers.get(&Name::from("X-Carrier")).unwrap(),
            "gold"
        );
        assert!(request.headers.get(&Name::USER_AGENT).is_none());
    }
}
