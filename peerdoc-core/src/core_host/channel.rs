//! Channel contract between the host and transport adapters
//!
//! The host calls [`Channel::send`] for outbound messages. Adapters push
//! inbound messages through the [`ChannelSink`] they were built with; the sink
//! runs middleware and queues accepted messages for the host loop, in the
//! order they were delivered.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::warn;

use super::codec;
use super::errors::{HostError, HostResult};
use super::host::HostEvent;
use super::middleware::{MiddlewareChain, Verdict};
use crate::core_sync::{ChannelId, ChannelMsg, Message};
use crate::metrics::{record_counter, MESSAGES_RECEIVED, MESSAGES_REJECTED};

#[async_trait]
pub trait Channel: Send + Sync {
    async fn send(&self, message: ChannelMsg) -> HostResult<()>;

    /// Release transport resources; called once when the host removes the channel
    async fn stop(&self);
}

pub type ChannelHandle = Arc<dyn Channel>;

/// Inbound half of a channel, owned by its adapter
#[derive(Clone, Debug)]
pub struct ChannelSink {
    channel_id: ChannelId,
    events: mpsc::UnboundedSender<HostEvent>,
    middleware: Arc<MiddlewareChain>,
}

impl ChannelSink {
    pub(crate) fn new(
        channel_id: ChannelId,
        events: mpsc::UnboundedSender<HostEvent>,
        middleware: Arc<MiddlewareChain>,
    ) -> Self {
        ChannelSink {
            channel_id,
            events,
            middleware,
        }
    }

    pub fn channel_id(&self) -> ChannelId {
        self.channel_id
    }

    /// Hand one inbound message to the host. Batches are unpacked so that
    /// middleware sees every inner message.
    pub async fn deliver(&self, message: ChannelMsg) -> HostResult<()> {
        let messages = match message {
            ChannelMsg::Batch { messages } => messages,
            other => vec![other],
        };

        for message in messages {
            match self.middleware.evaluate(self.channel_id, &message).await {
                Verdict::Accept => {
                    record_counter(MESSAGES_RECEIVED, 1);
                    self.push(Message::ChannelReceived {
                        channel_id: self.channel_id,
                        message,
                    })?;
                }
                Verdict::Reject(reason) => {
                    warn!(
                        channel = %self.channel_id,
                        kind = message.kind(),
                        %reason,
                        "inbound message rejected"
                    );
                    record_counter(MESSAGES_REJECTED, 1);
                }
            }
        }
        Ok(())
    }

    /// Decode a wire frame and deliver it
    pub async fn deliver_frame(&self, frame: &[u8]) -> HostResult<()> {
        let message = codec::decode(frame)?;
        self.deliver(message).await
    }

    /// Report a transport error; the channel stays registered
    pub fn fail(&self, reason: impl Into<String>) -> HostResult<()> {
        self.push(Message::ChannelFailed {
            channel_id: self.channel_id,
            reason: reason.into(),
        })
    }

    /// Ask the host to remove this channel, e.g. after the remote end hung up
    pub fn close(&self) -> HostResult<()> {
        self.events
            .send(HostEvent::RemoveChannel {
                channel_id: self.channel_id,
            })
            .map_err(|_| HostError::Closed)
    }

    fn push(&self, message: Message) -> HostResult<()> {
        self.events
            .send(HostEvent::Core(message))
            .map_err(|_| HostError::Closed)
    }
}
