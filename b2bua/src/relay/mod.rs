//! Client for the external media relay's UDP control protocol.
//!
//! Each request is a cookie-prefixed bencoded dictionary; responses echo the
//! cookie so requests correlate across retransmissions. A call is pinned to
//! one relay instance for its whole lifetime, instances are picked by
//! weighted round robin among the enabled ones.

use crate::config::RelayConfig;
use crate::error::B2buaError;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tokio::time::timeout;

pub mod bencode;

use bencode::Value;

const MAX_CONTROL_MSG: usize = 64 * 1024;

/// One configured relay process
pub struct RelayInstance {
    pub id: String,
    pub addr: SocketAddr,
    pub weight: u32,
    enabled: AtomicBool,
    healthy: AtomicBool,
}

impl RelayInstance {
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }
}

pub struct MediaRelayClient {
    socket: Arc<UdpSocket>,
    instances: Vec<Arc<RelayInstance>>,
    /// Weighted schedule of instance indices walked round robin
    schedule: Vec<usize>,
    next: AtomicUsize,
    /// call-id to pinned instance index
    pins: DashMap<String, usize>,
    pending: Arc<DashMap<String, oneshot::Sender<Value>>>,
    timeout: Duration,
}

impl MediaRelayClient {
    pub async fn new(config: &RelayConfig) -> std::io::Result<Self> {
        let socket = Arc::new(UdpSocket::bind("0.0.0.0:0").await?);

        let instances: Vec<Arc<RelayInstance>> = config
            .instances
            .iter()
            .map(|instance| {
                Arc::new(RelayInstance {
                    id: instance.id.clone(),
                    addr: instance.addr,
                    weight: instance.weight.max(1),
                    enabled: AtomicBool::new(instance.enabled),
                    healthy: AtomicBool::new(true),
                })
            })
            .collect();

        let mut schedule = Vec::new();
        for (index, instance) in instances.iter().enumerate() {
            schedule.extend(std::iter::repeat(index).take(instance.weight as usize));
        }

        let pending: Arc<DashMap<String, oneshot::Sender<Value>>> = Arc::new(DashMap::new());

        tokio::spawn(receive_task(socket.clone(), pending.clone()));

        Ok(Self {
            socket,
            instances,
            schedule,
            next: AtomicUsize::new(0),
            pins: DashMap::new(),
            pending,
            timeout: config.timeout,
        })
    }

    pub fn instances(&self) -> &[Arc<RelayInstance>] {
        &self.instances
    }

    pub fn instance_by_id(&self, id: &str) -> Option<&Arc<RelayInstance>> {
        self.instances.iter().find(|instance| instance.id == id)
    }

    /// The instance `call_id` is pinned to, pinning a fresh one if needed
    fn pick_instance(&self, call_id: &str) -> Result<usize, B2buaError> {
        if let Some(pinned) = self.pins.get(call_id) {
            return Ok(*pinned);
        }

        if self.schedule.is_empty() {
            return Err(B2buaError::RelayError("no relay instances configured".into()));
        }

        for _ in 0..self.schedule.len() {
            let position = self.next.fetch_add(1, Ordering::Relaxed) % self.schedule.len();
            let index = self.schedule[position];

            if self.instances[index].is_enabled() {
                self.pins.insert(call_id.to_owned(), index);
                return Ok(index);
            }
        }

        Err(B2buaError::RelayError("no enabled relay instance".into()))
    }

    /// Send `request` to `addr`, retransmitting with exponential backoff
    /// until the configured deadline
    async fn request(&self, addr: SocketAddr, request: Value) -> Result<Value, B2buaError> {
        let cookie = uuid::Uuid::new_v4().simple().to_string();

        let mut payload = Vec::with_capacity(cookie.len() + 1 + 128);
        payload.extend_from_slice(cookie.as_bytes());
        payload.push(b' ');
        payload.extend_from_slice(&request.encode());

        let (sender, mut receiver) = oneshot::channel();
        self.pending.insert(cookie.clone(), sender);

        let result = async {
            let deadline = tokio::time::Instant::now() + self.timeout;
            let mut backoff = Duration::from_millis(250);

            loop {
                self.socket.send_to(&payload, addr).await?;

                let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());

                if remaining.is_zero() {
                    return Err(B2buaError::RelayTimeout);
                }

                match timeout(backoff.min(remaining), &mut receiver).await {
                    Ok(Ok(response)) => return Ok(response),
                    Ok(Err(_)) => {
                        return Err(B2buaError::Internal("relay receiver vanished".into()));
                    }
                    Err(_) => {
                        // no answer yet, retransmit
                        backoff *= 2;
                    }
                }
            }
        }
        .await;

        self.pending.remove(&cookie);

        result
    }

    async fn command(
        &self,
        instance: usize,
        request: Value,
    ) -> Result<Value, B2buaError> {
        let addr = self.instances[instance].addr;

        self.request(addr, request).await
    }

    /// Health probe against one instance
    pub async fn ping(&self, instance: &Arc<RelayInstance>) -> Result<(), B2buaError> {
        let response = self
            .request(instance.addr, Value::dict([("command", Value::str("ping"))]))
            .await;

        let healthy = matches!(&response, Ok(value) if value.get_str("result") == Some("pong"));
        instance.healthy.store(healthy, Ordering::Relaxed);

        match response {
            Ok(value) if value.get_str("result") == Some("pong") => Ok(()),
            Ok(value) => Err(B2buaError::RelayError(format!(
                "unexpected ping response: {value}"
            ))),
            Err(e) => Err(e),
        }
    }

    /// Submit the caller's SDP offer. Repeated offers for the same call
    /// refresh the relay's media parameters.
    pub async fn offer(
        &self,
        call_id: &str,
        from_tag: &str,
        sdp: &str,
        flags: &str,
    ) -> Result<String, B2buaError> {
        let instance = self.pick_instance(call_id)?;

        let request = Value::dict([
            ("command", Value::str("offer")),
            ("call-id", Value::str(call_id)),
            ("from-tag", Value::str(from_tag)),
            ("sdp", Value::str(sdp)),
            ("flags", Value::str(flags)),
        ]);

        let response = self.command(instance, request).await?;

        expect_sdp(response, "offer")
    }

    /// Submit the callee's SDP answer
    pub async fn answer(
        &self,
        call_id: &str,
        from_tag: &str,
        to_tag: &str,
        sdp: &str,
        flags: &str,
    ) -> Result<String, B2buaError> {
        let instance = self.pick_instance(call_id)?;

        let request = Value::dict([
            ("command", Value::str("answer")),
            ("call-id", Value::str(call_id)),
            ("from-tag", Value::str(from_tag)),
            ("to-tag", Value::str(to_tag)),
            ("sdp", Value::str(sdp)),
            ("flags", Value::str(flags)),
        ]);

        let response = self.command(instance, request).await?;

        expect_sdp(response, "answer")
    }

    /// Tear down the relay session. Idempotent, a session the relay no
    /// longer knows still deletes cleanly.
    pub async fn delete(
        &self,
        call_id: &str,
        from_tag: &str,
        to_tag: Option<&str>,
    ) -> Result<(), B2buaError> {
        let Some(instance) = self.pins.remove(call_id).map(|(_, index)| index) else {
            // never offered, nothing to delete
            return Ok(());
        };

        let mut entries = vec![
            ("command", Value::str("delete")),
            ("call-id", Value::str(call_id)),
            ("from-tag", Value::str(from_tag)),
        ];

        if let Some(to_tag) = to_tag {
            entries.push(("to-tag", Value::str(to_tag)));
        }

        let response = self.command(instance, Value::dict(entries)).await?;

        match response.get_str("result") {
            Some("ok") => Ok(()),
            _ => {
                // deleting an unknown session must not fail teardown
                log::warn!("relay delete for {call_id} answered {response}");
                Ok(())
            }
        }
    }
}

fn expect_sdp(response: Value, command: &str) -> Result<String, B2buaError> {
    match response.get_str("result") {
        Some("ok") => response
            .get_str("sdp")
            .map(str::to_owned)
            .ok_or_else(|| B2buaError::RelayError(format!("{command} response without sdp"))),
        _ => {
            let reason = response
                .get_str("error-reason")
                .unwrap_or("unspecified error")
                .to_owned();

            Err(B2buaError::RelayError(reason))
        }
    }
}

async fn receive_task(
    socket: Arc<UdpSocket>,
    pending: Arc<DashMap<String, oneshot::Sender<Value>>>,
) {
    let mut buffer = vec![0u8; MAX_CONTROL_MSG];

    loop {
        let (len, source) = match socket.recv_from(&mut buffer).await {
            Ok(received) => received,
            Err(e) => {
                log::error!("relay control socket receive error, {e}");
                continue;
            }
        };

        let datagram = &buffer[..len];

        let Some(space) = datagram.iter().position(|&b| b == b' ') else {
            log::debug!("relay response from {source} without cookie");
            continue;
        };

        let Ok(cookie) = std::str::from_utf8(&datagram[..space]) else {
            continue;
        };

        let value = match Value::decode(&datagram[space + 1..]) {
            Ok((value, _)) => value,
            Err(e) => {
                log::warn!("undecodable relay response from {source}, {e}");
                continue;
            }
        };

        if let Some((_, sender)) = pending.remove(cookie) {
            let _ = sender.send(value);
        } else {
            // response to a request that already timed out
            log::debug!("relay response for unknown cookie from {source}");
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::RelayInstanceConfig;

    /// A relay double answering control commands on loopback
    async fn fake_relay(behaviour: fn(&Value) -> Option<Value>) -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();

        tokio::spawn(async move {
            let mut buffer = vec![0u8; MAX_CONTROL_MSG];

            loop {
                let (len, source) = socket.recv_from(&mut buffer).await.unwrap();
                let datagram = &buffer[..len];

                let space = datagram.iter().position(|&b| b == b' ').unwrap();
                let cookie = &datagram[..space];
                let (request, _) = Value::decode(&datagram[space + 1..]).unwrap();

                if let Some(response) = behaviour(&request) {
                    let mut payload = cookie.to_vec();
                    payload.push(b' ');
                    payload.extend_from_slice(&response.encode());

                    socket.send_to(&payload, source).await.unwrap();
                }
            }
        });

        addr
    }

    fn echo_behaviour(request: &Value) -> Option<Value> {
        match request.get_str("command") {
            Some("ping") => Some(Value::dict([("result", Value::str("pong"))])),
            Some("offer") | Some("answer") => Some(Value::dict([
                ("result", Value::str("ok")),
                (
                    "sdp",
                    Value::str(format!("rewritten:{}", request.get_str("sdp").unwrap())),
                ),
            ])),
            Some("delete") => Some(Value::dict([("result", Value::str("ok"))])),
            _ => None,
        }
    }

    async fn client_for(addrs: &[SocketAddr], timeout: Duration) -> MediaRelayClient {
        let config = RelayConfig {
            instances: addrs
                .iter()
                .enumerate()
                .map(|(i, addr)| RelayInstanceConfig {
                    id: format!("relay-{i}"),
                    addr: *addr,
                    weight: 1,
                    enabled: true,
                })
                .collect(),
            timeout,
        };

        MediaRelayClient::new(&config).await.unwrap()
    }

    #[tokio::test]
    async fn offer_answer_delete_roundtrip() {
        let relay = fake_relay(echo_behaviour).await;
        let client = client_for(&[relay], Duration::from_secs(2)).await;

        let sdp = client
            .offer("abc@host", "tag-a", "v=0 caller", "")
            .await
            .unwrap();
        assert_eq!(sdp, "rewritten:v=0 caller");

        let sdp = client
            .answer("abc@host", "tag-a", "tag-b", "v=0 callee", "")
            .await
            .unwrap();
        assert_eq!(sdp, "rewritten:v=0 callee");

        client
            .delete("abc@host", "tag-a", Some("tag-b"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn delete_without_session_is_ok() {
        let relay = fake_relay(echo_behaviour).await;
        let client = client_for(&[relay], Duration::from_secs(2)).await;

        client.delete("never-offered", "tag-a", None).await.unwrap();
    }

    #[tokio::test]
    async fn calls_pin_to_one_instance() {
        let relay_a = fake_relay(echo_behaviour).await;
        let relay_b = fake_relay(echo_behaviour).await;
        let client = client_for(&[relay_a, relay_b], Duration::from_secs(2)).await;

        client.offer("call-1", "t", "v=0", "").await.unwrap();
        let pinned = *client.pins.get("call-1").unwrap();

        // repeated offers stay on the pinned instance
        client.offer("call-1", "t", "v=0 again", "").await.unwrap();
        assert_eq!(*client.pins.get("call-1").unwrap(), pinned);
    }

    #[tokio::test]
    async fn unresponsive_relay_times_out() {
        let silent = fake_relay(|_| None).await;
        let client = client_for(&[silent], Duration::from_millis(200)).await;

        let result = client.offer("abc@host", "tag-a", "v=0", "").await;

        assert!(matches!(result, Err(B2buaError::RelayTimeout)));
    }

    #[tokio::test]
    async fn ping_marks_health() {
        let relay = fake_relay(echo_behaviour).await;
        let client = client_for(&[relay], Duration::from_secs(2)).await;

        let instance = client.instances()[0].clone();
        client.ping(&instance).await.unwrap();

        assert!(instance.is_healthy());
    }
}
