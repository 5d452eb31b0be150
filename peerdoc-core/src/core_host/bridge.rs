//! In-process transport joining two hosts
//!
//! Each message is encoded with the wire codec and decoded on the other side,
//! so frames behave exactly as they would on a socket. Removing either end
//! removes the other.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use tracing::{debug, warn};

use super::channel::{Channel, ChannelHandle, ChannelSink};
use super::codec;
use super::errors::{HostError, HostResult};
use super::host::SyncHost;
use crate::core_sync::{ChannelId, ChannelKind, ChannelMsg};

/// One end of a bridge; delivers into the sink of the other end
struct BridgeEndpoint {
    channel_id: OnceLock<ChannelId>,
    remote: Arc<OnceLock<ChannelSink>>,
    stopped: AtomicBool,
}

impl BridgeEndpoint {
    fn new(remote: Arc<OnceLock<ChannelSink>>) -> Self {
        BridgeEndpoint {
            channel_id: OnceLock::new(),
            remote,
            stopped: AtomicBool::new(false),
        }
    }

    fn send_error(&self, reason: impl Into<String>) -> HostError {
        HostError::Send {
            channel_id: self.channel_id.get().copied().unwrap_or(ChannelId(0)),
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl Channel for BridgeEndpoint {
    async fn send(&self, message: ChannelMsg) -> HostResult<()> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(self.send_error("bridge stopped"));
        }
        let frame = codec::encode(&message)?;
        let remote = self
            .remote
            .get()
            .ok_or_else(|| self.send_error("remote end not attached"))?;

        match remote.deliver_frame(&frame).await {
            Ok(()) => Ok(()),
            Err(HostError::Codec(e)) => {
                // Malformed on arrival: the receiver drops it
                warn!(channel = %remote.channel_id(), error = %e, "undecodable frame dropped");
                Ok(())
            }
            Err(e) => Err(self.send_error(e.to_string())),
        }
    }

    async fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(remote) = self.remote.get() {
            debug!(channel = %remote.channel_id(), "bridge closed, detaching remote end");
            // The remote host may already be gone
            let _ = remote.close();
        }
    }
}

/// Connects hosts in-process
#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryBridge;

impl MemoryBridge {
    /// Register a network channel on both hosts and start the handshake from
    /// `initiator`. Returns the channel ids on (initiator, responder).
    pub async fn connect(initiator: &SyncHost, responder: &SyncHost) -> HostResult<(ChannelId, ChannelId)> {
        let to_responder: Arc<OnceLock<ChannelSink>> = Arc::new(OnceLock::new());
        let to_initiator: Arc<OnceLock<ChannelSink>> = Arc::new(OnceLock::new());

        let initiator_end = Arc::new(BridgeEndpoint::new(to_responder.clone()));
        let responder_end = Arc::new(BridgeEndpoint::new(to_initiator.clone()));

        let endpoint = initiator_end.clone();
        let initiator_id = initiator
            .add_channel(ChannelKind::Network, |sink| {
                let _ = endpoint.channel_id.set(sink.channel_id());
                let _ = to_initiator.set(sink);
                endpoint as ChannelHandle
            })
            .await?;

        let endpoint = responder_end.clone();
        let responder_id = responder
            .add_channel(ChannelKind::Network, |sink| {
                let _ = endpoint.channel_id.set(sink.channel_id());
                let _ = to_responder.set(sink);
                endpoint as ChannelHandle
            })
            .await?;

        initiator.establish(initiator_id).await?;
        Ok((initiator_id, responder_id))
    }
}
