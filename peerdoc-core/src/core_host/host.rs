/*
   SyncHost

   Runs a synchronizer on a tokio task and executes the commands it returns.

   Every input (inbound channel messages, timer expiries, local API calls,
   import results) is funnelled through one mpsc queue, so exactly one
   `update` runs at a time and the model needs no lock. Command results that
   the core cares about are fed back before the next queued event.

   E.G: host.ensure_doc(doc_id) -> DocHandle
        host.wait_until_ready(doc_id)
        host.set_presence(doc_id, "cursor", Some(bytes))

    ┌──────────────┐  HostEvent   ┌───────────────────────────────┐
    │  SyncHost    │─────────────►│ HostLoop                      │
    │  (handle)    │              │  update(model, msg)           │
    └──────────────┘              │    -> Send / timers / Import  │
    ┌──────────────┐  deliver()   │    -> DocReady (watch)        │
    │ ChannelSink  │─────────────►│    -> notifications           │
    └──────────────┘              └──────────────┬────────────────┘
                                                 │ Channel::send
                                                 ▼
                                          transport adapters
*/

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, trace, warn};

use super::channel::{ChannelHandle, ChannelSink};
use super::errors::{CodecError, HostError, HostResult};
use super::middleware::{Middleware, MiddlewareChain};
use super::storage::Storage;
use super::storage_adapter::{StorageAdapter, StorageAdapterConfig};
use crate::config::{Config, PresenceConfig, SyncConfig};
use crate::core_doc::{DocHandle, DocId, DocumentFactory, MemoryDocFactory};
use crate::core_sync::{
    update, ChannelId, ChannelKind, Command, Message, Model, PeerIdentity, PresenceRecord,
    RequestKey, Rules, Timestamp,
};
use crate::metrics::{
    record_counter, record_gauge, CHANNELS_ACTIVE, IMPORTS_FAILED, IMPORTS_TOTAL, MESSAGES_SENT,
    TIMEOUTS_TOTAL,
};

const NOTIFICATION_CAPACITY: usize = 256;

/// Observable changes, for UIs and tests
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostNotification {
    DocReady(DocId),
    DocRemoved(DocId),
    PresenceChanged(DocId),
}

/// Everything the host loop reacts to
pub(crate) enum HostEvent {
    Core(Message),
    AddChannel {
        channel_id: ChannelId,
        kind: ChannelKind,
        handle: ChannelHandle,
    },
    RemoveChannel {
        channel_id: ChannelId,
    },
    TimerFired {
        key: RequestKey,
        generation: u64,
    },
    EnsureDoc {
        doc_id: DocId,
        reply: oneshot::Sender<Option<DocHandle>>,
    },
    Readiness {
        doc_id: DocId,
        reply: oneshot::Sender<Option<watch::Receiver<bool>>>,
    },
    Presence {
        doc_id: DocId,
        reply: oneshot::Sender<Vec<PresenceRecord>>,
    },
    DocIds {
        reply: oneshot::Sender<Vec<DocId>>,
    },
    Shutdown,
}

impl fmt::Debug for HostEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostEvent::Core(message) => f.debug_tuple("Core").field(message).finish(),
            HostEvent::AddChannel {
                channel_id, kind, ..
            } => f
                .debug_struct("AddChannel")
                .field("channel_id", channel_id)
                .field("kind", kind)
                .finish(),
            HostEvent::RemoveChannel { channel_id } => f
                .debug_struct("RemoveChannel")
                .field("channel_id", channel_id)
                .finish(),
            HostEvent::TimerFired { key, generation } => f
                .debug_struct("TimerFired")
                .field("key", key)
                .field("generation", generation)
                .finish(),
            HostEvent::EnsureDoc { doc_id, .. } => {
                f.debug_struct("EnsureDoc").field("doc_id", doc_id).finish()
            }
            HostEvent::Readiness { doc_id, .. } => {
                f.debug_struct("Readiness").field("doc_id", doc_id).finish()
            }
            HostEvent::Presence { doc_id, .. } => {
                f.debug_struct("Presence").field("doc_id", doc_id).finish()
            }
            HostEvent::DocIds { .. } => f.write_str("DocIds"),
            HostEvent::Shutdown => f.write_str("Shutdown"),
        }
    }
}

/// Configures and starts a [`SyncHost`]
pub struct SyncHostBuilder {
    identity: PeerIdentity,
    factory: Arc<dyn DocumentFactory>,
    storage_factory: Option<Arc<dyn DocumentFactory>>,
    rules: Rules,
    sync_config: SyncConfig,
    presence_config: PresenceConfig,
    middleware: MiddlewareChain,
}

impl SyncHostBuilder {
    pub fn new(identity: PeerIdentity) -> Self {
        SyncHostBuilder {
            identity,
            factory: Arc::new(MemoryDocFactory),
            storage_factory: None,
            rules: Rules::new(),
            sync_config: SyncConfig::default(),
            presence_config: PresenceConfig::default(),
            middleware: MiddlewareChain::new(),
        }
    }

    pub fn with_factory(mut self, factory: Arc<dyn DocumentFactory>) -> Self {
        self.factory = factory;
        self
    }

    /// Factory storage adapters use for their scratch replicas. Defaults to
    /// the document factory.
    pub fn with_storage_factory(mut self, factory: Arc<dyn DocumentFactory>) -> Self {
        self.storage_factory = Some(factory);
        self
    }

    pub fn with_rules(mut self, rules: Rules) -> Self {
        self.rules = rules;
        self
    }

    /// Take the sync and presence sections of an application config
    pub fn with_config(mut self, config: &Config) -> Self {
        self.sync_config = config.sync.clone();
        self.presence_config = config.presence.clone();
        self
    }

    pub fn with_sync_config(mut self, config: SyncConfig) -> Self {
        self.sync_config = config;
        self
    }

    pub fn with_presence_config(mut self, config: PresenceConfig) -> Self {
        self.presence_config = config;
        self
    }

    pub fn with_middleware<M: Middleware + 'static>(mut self, step: M) -> Self {
        self.middleware = self.middleware.with(step);
        self
    }

    /// Spawn the host loop. Must be called inside a tokio runtime.
    ///
    /// Fails with [`HostError::Config`] when the sync or presence settings
    /// cannot drive the loop (zero timeouts or intervals).
    pub fn spawn(self) -> HostResult<(SyncHost, JoinHandle<()>)> {
        self.sync_config.validate()?;
        self.presence_config.validate()?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);

        let heartbeat_every = self.presence_config.heartbeat_interval;
        let sweep_every = self.presence_config.sweep_period();
        let model = Model::new(self.identity.clone(), self.factory.clone())
            .with_rules(self.rules)
            .with_sync_config(self.sync_config)
            .with_presence_config(self.presence_config);

        let host_loop = HostLoop {
            model: Some(model),
            events_tx: events_tx.clone(),
            events_rx,
            channels: HashMap::new(),
            timers: HashMap::new(),
            next_generation: 0,
            ready: HashMap::new(),
            notifications: notifications.clone(),
            heartbeat_every,
            sweep_every,
        };
        let join = tokio::spawn(host_loop.run());

        let host = SyncHost {
            identity: self.identity,
            storage_factory: self.storage_factory.unwrap_or(self.factory),
            events: events_tx,
            middleware: Arc::new(self.middleware),
            next_channel: Arc::new(AtomicU64::new(1)),
            notifications,
        };
        Ok((host, join))
    }
}

/// Cloneable handle to a running host
#[derive(Clone)]
pub struct SyncHost {
    identity: PeerIdentity,
    storage_factory: Arc<dyn DocumentFactory>,
    events: mpsc::UnboundedSender<HostEvent>,
    middleware: Arc<MiddlewareChain>,
    next_channel: Arc<AtomicU64>,
    notifications: broadcast::Sender<HostNotification>,
}

impl SyncHost {
    pub fn identity(&self) -> &PeerIdentity {
        &self.identity
    }

    fn send(&self, event: HostEvent) -> HostResult<()> {
        self.events.send(event).map_err(|_| HostError::Closed)
    }

    async fn ask<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> HostEvent) -> HostResult<T> {
        let (reply, rx) = oneshot::channel();
        self.send(make(reply))?;
        rx.await.map_err(|_| HostError::Closed)
    }

    /// Register a transport endpoint. `make` receives the sink the adapter
    /// must use for inbound messages. The channel is not established until
    /// one side calls [`SyncHost::establish`].
    pub async fn add_channel<F>(&self, kind: ChannelKind, make: F) -> HostResult<ChannelId>
    where
        F: FnOnce(ChannelSink) -> ChannelHandle,
    {
        let channel_id = ChannelId(self.next_channel.fetch_add(1, Ordering::Relaxed));
        let sink = ChannelSink::new(channel_id, self.events.clone(), self.middleware.clone());
        let handle = make(sink);
        self.send(HostEvent::AddChannel {
            channel_id,
            kind,
            handle,
        })?;
        Ok(channel_id)
    }

    /// Start the handshake on a registered channel
    pub async fn establish(&self, channel_id: ChannelId) -> HostResult<()> {
        self.send(HostEvent::Core(Message::EstablishChannel { channel_id }))
    }

    /// Attach a storage backend as a channel and pull everything it holds
    pub async fn add_storage(
        &self,
        storage: Arc<dyn Storage>,
        config: StorageAdapterConfig,
    ) -> HostResult<ChannelId> {
        let factory = self.storage_factory.clone();
        let channel_id = self
            .add_channel(ChannelKind::Storage, move |sink| {
                let adapter: ChannelHandle =
                    Arc::new(StorageAdapter::spawn(sink, storage, factory, config));
                adapter
            })
            .await?;
        self.establish(channel_id).await?;
        Ok(channel_id)
    }

    pub async fn remove_channel(&self, channel_id: ChannelId) -> HostResult<()> {
        self.send(HostEvent::RemoveChannel { channel_id })
    }

    /// Open a document, creating it locally when unknown
    pub async fn ensure_doc(&self, doc_id: DocId) -> HostResult<DocHandle> {
        let requested = doc_id.clone();
        self.ask(|reply| HostEvent::EnsureDoc { doc_id, reply })
            .await?
            .ok_or(HostError::UnknownDoc(requested))
    }

    /// Resolve once no channel is still loading the document
    pub async fn wait_until_ready(&self, doc_id: DocId) -> HostResult<()> {
        let requested = doc_id.clone();
        let Some(mut ready) = self
            .ask(|reply| HostEvent::Readiness { doc_id, reply })
            .await?
        else {
            return Err(HostError::UnknownDoc(requested));
        };
        ready
            .wait_for(|ready| *ready)
            .await
            .map_err(|_| HostError::DocRemoved(requested))?;
        Ok(())
    }

    /// Set one of our presence entries; `None` clears it
    pub async fn set_presence(
        &self,
        doc_id: DocId,
        namespace: impl Into<String>,
        value: Option<Vec<u8>>,
    ) -> HostResult<()> {
        self.send(HostEvent::Core(Message::LocalPresence {
            doc_id,
            namespace: namespace.into(),
            value,
            now: Timestamp::now(),
        }))
    }

    pub async fn presence(&self, doc_id: DocId) -> HostResult<Vec<PresenceRecord>> {
        self.ask(|reply| HostEvent::Presence { doc_id, reply }).await
    }

    pub async fn delete_doc(&self, doc_id: DocId) -> HostResult<()> {
        self.send(HostEvent::Core(Message::DocDelete { doc_id }))
    }

    pub async fn doc_ids(&self) -> HostResult<Vec<DocId>> {
        self.ask(|reply| HostEvent::DocIds { reply }).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HostNotification> {
        self.notifications.subscribe()
    }

    /// Stop every channel and end the loop
    pub async fn shutdown(&self) -> HostResult<()> {
        self.send(HostEvent::Shutdown)
    }
}

impl fmt::Debug for SyncHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncHost")
            .field("peer_id", &self.identity.peer_id)
            .field("middleware", &self.middleware)
            .finish()
    }
}

struct HostLoop {
    /// `None` only while `update` holds it
    model: Option<Model>,
    events_tx: mpsc::UnboundedSender<HostEvent>,
    events_rx: mpsc::UnboundedReceiver<HostEvent>,
    channels: HashMap<ChannelId, ChannelHandle>,
    timers: HashMap<RequestKey, (u64, AbortHandle)>,
    next_generation: u64,
    ready: HashMap<DocId, watch::Sender<bool>>,
    notifications: broadcast::Sender<HostNotification>,
    heartbeat_every: Duration,
    sweep_every: Duration,
}

impl HostLoop {
    async fn run(mut self) {
        let mut heartbeat = tokio::time::interval(self.heartbeat_every);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut sweep = tokio::time::interval(self.sweep_every);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        heartbeat.tick().await;
        sweep.tick().await;

        if let Some(model) = &self.model {
            info!(peer = %model.identity.peer_id, name = %model.identity.name, "sync host started");
        }

        loop {
            tokio::select! {
                event = self.events_rx.recv() => match event {
                    None | Some(HostEvent::Shutdown) => break,
                    Some(event) => self.handle_event(event).await,
                },
                _ = heartbeat.tick() => {
                    self.dispatch(Message::HeartbeatTick { now: Timestamp::now() }).await;
                }
                _ = sweep.tick() => {
                    self.dispatch(Message::PresenceSweep { now: Timestamp::now() }).await;
                }
            }
        }

        self.stop().await;
    }

    async fn handle_event(&mut self, event: HostEvent) {
        match event {
            HostEvent::Core(message) => self.dispatch(message).await,
            HostEvent::AddChannel {
                channel_id,
                kind,
                handle,
            } => {
                self.channels.insert(channel_id, handle);
                record_gauge(CHANNELS_ACTIVE, self.channels.len() as f64);
                self.dispatch(Message::ChannelAdded { channel_id, kind })
                    .await;
            }
            HostEvent::RemoveChannel { channel_id } => {
                let Some(handle) = self.channels.remove(&channel_id) else {
                    debug!(channel = %channel_id, "channel already removed");
                    return;
                };
                handle.stop().await;
                record_gauge(CHANNELS_ACTIVE, self.channels.len() as f64);
                self.dispatch(Message::ChannelRemoved {
                    channel_id,
                    now: Timestamp::now(),
                })
                .await;
            }
            HostEvent::TimerFired { key, generation } => {
                match self.timers.get(&key) {
                    Some((current, _)) if *current == generation => {
                        self.timers.remove(&key);
                    }
                    _ => {
                        trace!(?key, "stale timer ignored");
                        return;
                    }
                }
                record_counter(TIMEOUTS_TOTAL, 1);
                self.dispatch(Message::Timeout { key }).await;
            }
            HostEvent::EnsureDoc { doc_id, reply } => {
                self.ready
                    .entry(doc_id.clone())
                    .or_insert_with(|| watch::channel(false).0);
                self.dispatch(Message::DocEnsure {
                    doc_id: doc_id.clone(),
                })
                .await;
                let handle = self
                    .model
                    .as_ref()
                    .and_then(|model| model.documents.get(&doc_id))
                    .map(|state| state.doc.clone());
                let _ = reply.send(handle);
            }
            HostEvent::Readiness { doc_id, reply } => {
                let _ = reply.send(self.ready.get(&doc_id).map(|tx| tx.subscribe()));
            }
            HostEvent::Presence { doc_id, reply } => {
                let records = self
                    .model
                    .as_ref()
                    .map(|model| model.presence.records(&doc_id))
                    .unwrap_or_default();
                let _ = reply.send(records);
            }
            HostEvent::DocIds { reply } => {
                let ids = self
                    .model
                    .as_ref()
                    .map(|model| model.doc_ids())
                    .unwrap_or_default();
                let _ = reply.send(ids);
            }
            HostEvent::Shutdown => {}
        }
    }

    /// Run `update` for a message and everything its commands feed back
    async fn dispatch(&mut self, message: Message) {
        let mut queue = VecDeque::from([message]);
        while let Some(message) = queue.pop_front() {
            let Some(model) = self.model.take() else {
                error!("sync model missing, dropping message");
                return;
            };
            trace!(kind = message.kind(), "dispatching");
            let (model, commands) = update(model, message);
            self.model = Some(model);

            for command in commands {
                self.execute(command, &mut queue).await;
            }
        }
    }

    async fn execute(&mut self, command: Command, queue: &mut VecDeque<Message>) {
        match command {
            Command::Send {
                channel_id,
                message,
            } => {
                let Some(handle) = self.channels.get(&channel_id).cloned() else {
                    debug!(channel = %channel_id, "send to removed channel dropped");
                    return;
                };
                let kind = message.kind();
                let doc_id = message.doc_id().cloned();
                match handle.send(message).await {
                    Ok(()) => {
                        record_counter(MESSAGES_SENT, 1);
                        trace!(channel = %channel_id, kind, "sent");
                    }
                    Err(e @ HostError::Codec(CodecError::FrameTooLarge { .. })) => {
                        warn!(channel = %channel_id, kind, error = %e, "message too large to send");
                        queue.push_back(Message::SendRejected {
                            channel_id,
                            doc_id,
                            reason: e.to_string(),
                        });
                    }
                    Err(e) => {
                        warn!(channel = %channel_id, kind, error = %e, "send failed");
                        queue.push_back(Message::ChannelFailed {
                            channel_id,
                            reason: e.to_string(),
                        });
                    }
                }
            }
            Command::StartTimer { key, after } => {
                if let Some((_, previous)) = self.timers.remove(&key) {
                    previous.abort();
                }
                self.next_generation += 1;
                let generation = self.next_generation;
                let events = self.events_tx.clone();
                let fired = key.clone();
                let task = tokio::spawn(async move {
                    tokio::time::sleep(after).await;
                    let _ = events.send(HostEvent::TimerFired {
                        key: fired,
                        generation,
                    });
                });
                self.timers.insert(key, (generation, task.abort_handle()));
            }
            Command::CancelTimer { key } => {
                if let Some((_, timer)) = self.timers.remove(&key) {
                    timer.abort();
                }
            }
            Command::Import {
                channel_id,
                doc_id,
                doc,
                data,
                peer_version,
            } => {
                record_counter(IMPORTS_TOTAL, 1);
                let result = doc.import(&data).map_err(|e| {
                    record_counter(IMPORTS_FAILED, 1);
                    e.to_string()
                });
                queue.push_back(Message::ImportCompleted {
                    channel_id,
                    doc_id,
                    peer_version,
                    result,
                });
            }
            Command::Subscribe { doc_id, doc } => {
                let events = self.events_tx.clone();
                doc.subscribe_local(Box::new(move || {
                    let _ = events.send(HostEvent::Core(Message::LocalDocChange {
                        doc_id: doc_id.clone(),
                    }));
                }));
            }
            Command::DocReady { doc_id } => {
                self.ready
                    .entry(doc_id.clone())
                    .or_insert_with(|| watch::channel(false).0)
                    .send_replace(true);
                self.notify(HostNotification::DocReady(doc_id));
            }
            Command::DocRemoved { doc_id } => {
                // Dropping the sender wakes waiters with an error
                self.ready.remove(&doc_id);
                self.notify(HostNotification::DocRemoved(doc_id));
            }
            Command::PresenceChanged { doc_id } => {
                self.notify(HostNotification::PresenceChanged(doc_id));
            }
        }
    }

    fn notify(&self, notification: HostNotification) {
        // No subscribers is fine
        let _ = self.notifications.send(notification);
    }

    async fn stop(&mut self) {
        for (_, (_, timer)) in self.timers.drain() {
            timer.abort();
        }
        for (channel_id, handle) in self.channels.drain() {
            debug!(channel = %channel_id, "stopping channel");
            handle.stop().await;
        }
        record_gauge(CHANNELS_ACTIVE, 0.0);
        info!("sync host stopped");
    }
}
