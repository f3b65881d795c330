// Blocking client: the async client driven by its own runtime
//
// For callers without an async context. Every call blocks the calling
// thread; listeners still run on the runtime's worker threads.

use super::{SendEventOptions, SendResult, SendToGroupOptions, WebPubSubClient};
use super::options::WebPubSubClientOptions;
use super::state::ConnectionState;
use crate::credential::ClientCredential;
use crate::error::ClientError;
use crate::message::MessageData;
use crate::transport::Transport;
use std::io;
use std::sync::Arc;
use tokio::runtime::{Builder, Runtime};

pub struct BlockingClient {
    // Declared first so it drops while the runtime is still alive
    client: WebPubSubClient,
    runtime: Runtime,
}

impl BlockingClient {
    /// Blocking client over WebSockets
    pub fn new(
        credential: impl ClientCredential,
        options: WebPubSubClientOptions,
    ) -> io::Result<Self> {
        Ok(Self {
            client: WebPubSubClient::new(credential, options),
            runtime: Self::runtime()?,
        })
    }

    pub fn with_transport(
        credential: Arc<dyn ClientCredential>,
        transport: Arc<dyn Transport>,
        options: WebPubSubClientOptions,
    ) -> io::Result<Self> {
        Ok(Self {
            client: WebPubSubClient::with_transport(credential, transport, options),
            runtime: Self::runtime()?,
        })
    }

    fn runtime() -> io::Result<Runtime> {
        Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("webpubsub-client")
            .enable_all()
            .build()
    }

    /// The async handle, for registering listeners or reading state
    pub fn client(&self) -> &WebPubSubClient {
        &self.client
    }

    pub fn state(&self) -> ConnectionState {
        self.client.state()
    }

    pub fn start(&self) -> Result<(), ClientError> {
        self.runtime.block_on(self.client.start())
    }

    pub fn stop(&self) {
        self.runtime.block_on(self.client.stop())
    }

    pub fn join_group(&self, group: &str) -> Result<SendResult, ClientError> {
        self.runtime.block_on(self.client.join_group(group))
    }

    pub fn leave_group(&self, group: &str) -> Result<SendResult, ClientError> {
        self.runtime.block_on(self.client.leave_group(group))
    }

    pub fn send_to_group(
        &self,
        group: &str,
        data: MessageData,
        options: SendToGroupOptions,
    ) -> Result<SendResult, ClientError> {
        self.runtime
            .block_on(self.client.send_to_group(group, data, options))
    }

    pub fn send_event(
        &self,
        event: &str,
        data: MessageData,
        options: SendEventOptions,
    ) -> Result<SendResult, ClientError> {
        self.runtime
            .block_on(self.client.send_event(event, data, options))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::StaticUrlCredential;
    use crate::message::OutboundMessage;
    use crate::transport::MemoryTransport;

    #[test]
    fn test_blocking_round_trip() {
        let transport = MemoryTransport::new();
        let client = BlockingClient::with_transport(
            Arc::new(StaticUrlCredential::new("ws://memory/client")),
            Arc::new(transport.clone()),
            WebPubSubClientOptions::default(),
        )
        .unwrap();

        assert!(client
            .send_event("e", MessageData::text("early"), SendEventOptions::default())
            .unwrap_err()
            .is_not_connected());

        client.start().unwrap();
        assert_eq!(client.state(), ConnectionState::Connected);
        client.join_group("g").unwrap();
        let result = client
            .send_to_group("g", MessageData::text("hi"), SendToGroupOptions::default())
            .unwrap();
        assert!(result.ack_id.is_some());

        client.stop();
        assert_eq!(client.state(), ConnectionState::Stopped);
        assert!(transport
            .sent_messages()
            .iter()
            .any(|m| matches!(m, OutboundMessage::JoinGroup { group, .. } if group == "g")));
    }
}
