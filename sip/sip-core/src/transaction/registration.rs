use super::{TsxMessage, TsxResponse};
use crate::transaction::key::TsxKey;
use crate::Endpoint;
use sip_types::msg::MessageLine;
use tokio::sync::mpsc;

/// Internal: used by every transaction impl to register itself inside an
/// endpoint and receive transactional messages from it
#[derive(Debug)]
pub(crate) struct TsxRegistration {
    pub endpoint: Endpoint,
    pub tsx_key: TsxKey,

    pub(super) receiver: mpsc::UnboundedReceiver<TsxMessage>,
}

impl TsxRegistration {
    pub(crate) fn create(endpoint: Endpoint, tsx_key: TsxKey) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();

        endpoint.transactions().register_transaction(
            tsx_key.clone(),
            Box::new(move |msg| sender.send(msg).map_err(|e| e.0).err()),
        );

        Self {
            endpoint,
            tsx_key,
            receiver,
        }
    }

    pub(crate) async fn receive(&mut self) -> TsxMessage {
        self.receiver
            .recv()
            .await
            .expect("registration is responsible of handler lifetime inside endpoint")
    }

    pub(crate) async fn receive_response(&mut self) -> TsxResponse {
        loop {
            match self.receive().await {
                TsxMessage {
                    line: MessageLine::Request(_),
                    ..
                } => {
                    // a request must never match a client transaction, toss it
                    continue;
                }
                TsxMessage {
                    tp_info,
                    line: MessageLine::Response(line),
                    base_headers,
                    headers,
                    body,
                } => {
                    return TsxResponse {
                        tp_info,
                        line,
                        base_headers,
                        headers,
                        body,
                    };
                }
            }
        }
    }
}

impl Drop for TsxRegistration {
    fn drop(&mut self) {
        self.endpoint
            .transactions()
            .remove_transaction(&self.tsx_key);
    }
}
