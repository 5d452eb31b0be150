/*
    sim.rs - Deterministic in-process network of synchronizers

    Executes commands synchronously: sends are queued for the linked peer,
    imports run immediately and feed back `ImportCompleted`, timers are only
    recorded until a test fires them. `run` drains the queue until nothing
    moves, which makes multi-peer scenarios reproducible without tokio.
*/

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::core_doc::MemoryDocRegistry;
use crate::core_doc::{DocId, MemoryDoc};
use crate::core_sync::{
    update, ChannelId, ChannelKind, ChannelMsg, Command, Message, Model, RequestKey, Timestamp,
};

const MAX_STEPS: usize = 100_000;

pub type NodeId = usize;

/// One synchronizer and the side effects observed from it
pub struct SimNode {
    model: Option<Model>,
    pub factory: Arc<MemoryDocRegistry>,
    pub timers: BTreeMap<RequestKey, Duration>,
    pub ready: Vec<DocId>,
    pub removed: Vec<DocId>,
    pub presence_changes: Vec<DocId>,
}

impl SimNode {
    pub fn model(&self) -> &Model {
        match &self.model {
            Some(model) => model,
            None => panic!("model taken during a step"),
        }
    }
}

/// A message that crossed a link
#[derive(Debug, Clone)]
pub struct Delivery {
    pub from: NodeId,
    pub to: NodeId,
    pub message: ChannelMsg,
}

#[derive(Default)]
pub struct SimNetwork {
    nodes: Vec<SimNode>,
    links: HashMap<(NodeId, ChannelId), (NodeId, ChannelId)>,
    severed: HashSet<(NodeId, ChannelId)>,
    queue: VecDeque<(NodeId, Message)>,
    local_changes: Arc<Mutex<VecDeque<(NodeId, DocId)>>>,
    next_channel: u64,
    pub log: Vec<Delivery>,
}

impl SimNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, (model, factory): (Model, Arc<MemoryDocRegistry>)) -> NodeId {
        self.nodes.push(SimNode {
            model: Some(model),
            factory,
            timers: BTreeMap::new(),
            ready: Vec::new(),
            removed: Vec::new(),
            presence_changes: Vec::new(),
        });
        self.nodes.len() - 1
    }

    pub fn node(&self, node: NodeId) -> &SimNode {
        &self.nodes[node]
    }

    pub fn node_mut(&mut self, node: NodeId) -> &mut SimNode {
        &mut self.nodes[node]
    }

    pub fn model(&self, node: NodeId) -> &Model {
        self.nodes[node].model()
    }

    /// The concrete replica a node holds for `doc_id`
    pub fn doc(&self, node: NodeId, doc_id: &DocId) -> Option<Arc<MemoryDoc>> {
        self.nodes[node].factory.doc(doc_id)
    }

    fn allocate_channel(&mut self) -> ChannelId {
        self.next_channel += 1;
        ChannelId(self.next_channel)
    }

    /// Link two nodes with the given kinds; `a` initiates the handshake.
    /// Returns the channel ids as seen by `a` and `b`.
    pub fn connect_with(
        &mut self,
        a: NodeId,
        a_kind: ChannelKind,
        b: NodeId,
        b_kind: ChannelKind,
    ) -> (ChannelId, ChannelId) {
        let a_channel = self.allocate_channel();
        let b_channel = self.allocate_channel();
        self.links.insert((a, a_channel), (b, b_channel));
        self.links.insert((b, b_channel), (a, a_channel));
        self.push(
            a,
            Message::ChannelAdded {
                channel_id: a_channel,
                kind: a_kind,
            },
        );
        self.push(
            b,
            Message::ChannelAdded {
                channel_id: b_channel,
                kind: b_kind,
            },
        );
        self.push(
            a,
            Message::EstablishChannel {
                channel_id: a_channel,
            },
        );
        (a_channel, b_channel)
    }

    pub fn connect(&mut self, a: NodeId, b: NodeId) -> (ChannelId, ChannelId) {
        self.connect_with(a, ChannelKind::Network, b, ChannelKind::Network)
    }

    /// Drop everything `node` sends on `channel_id` from now on
    pub fn sever(&mut self, node: NodeId, channel_id: ChannelId) {
        self.severed.insert((node, channel_id));
    }

    pub fn heal(&mut self, node: NodeId, channel_id: ChannelId) {
        self.severed.remove(&(node, channel_id));
    }

    /// Remove a link on both ends
    pub fn disconnect(&mut self, node: NodeId, channel_id: ChannelId, now: Timestamp) {
        if let Some((peer, peer_channel)) = self.links.remove(&(node, channel_id)) {
            self.links.remove(&(peer, peer_channel));
            self.push(
                peer,
                Message::ChannelRemoved {
                    channel_id: peer_channel,
                    now,
                },
            );
        }
        self.push(node, Message::ChannelRemoved { channel_id, now });
    }

    pub fn push(&mut self, node: NodeId, message: Message) {
        self.queue.push_back((node, message));
    }

    pub fn ensure_doc(&mut self, node: NodeId, doc_id: &DocId) {
        self.push(
            node,
            Message::DocEnsure {
                doc_id: doc_id.clone(),
            },
        );
    }

    /// Deliver one message and execute its commands without draining the queue
    pub fn step(&mut self, node: NodeId, message: Message) -> Vec<Command> {
        let model = self.nodes[node].model.take();
        let Some(model) = model else {
            panic!("node {} has no model", node);
        };
        let (model, cmds) = update(model, message);
        self.nodes[node].model = Some(model);
        for cmd in &cmds {
            self.execute(node, cmd.clone());
        }
        cmds
    }

    /// Process queued messages until the network is quiet
    pub fn run(&mut self) {
        for _ in 0..MAX_STEPS {
            self.collect_local_changes();
            let Some((node, message)) = self.queue.pop_front() else {
                return;
            };
            self.step(node, message);
        }
        panic!("network did not quiesce after {} steps", MAX_STEPS);
    }

    /// Fire every armed timer of `node`, then run
    pub fn fire_timers(&mut self, node: NodeId) {
        let keys: Vec<RequestKey> = self.nodes[node].timers.keys().cloned().collect();
        self.nodes[node].timers.clear();
        for key in keys {
            self.push(node, Message::Timeout { key });
        }
        self.run();
    }

    /// Messages `from` sent to `to` since the log was last cleared
    pub fn sent(&self, from: NodeId, to: NodeId) -> Vec<&ChannelMsg> {
        self.log
            .iter()
            .filter(|d| d.from == from && d.to == to)
            .map(|d| &d.message)
            .collect()
    }

    pub fn clear_log(&mut self) {
        self.log.clear();
    }

    fn collect_local_changes(&mut self) {
        let drained: Vec<(NodeId, DocId)> = self
            .local_changes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for (node, doc_id) in drained {
            self.push(node, Message::LocalDocChange { doc_id });
        }
    }

    fn execute(&mut self, node: NodeId, cmd: Command) {
        match cmd {
            Command::Send {
                channel_id,
                message,
            } => {
                let Some(&(peer, peer_channel)) = self.links.get(&(node, channel_id)) else {
                    return;
                };
                self.log.push(Delivery {
                    from: node,
                    to: peer,
                    message: message.clone(),
                });
                if self.severed.contains(&(node, channel_id)) {
                    return;
                }
                self.push(
                    peer,
                    Message::ChannelReceived {
                        channel_id: peer_channel,
                        message,
                    },
                );
            }
            Command::StartTimer { key, after } => {
                self.nodes[node].timers.insert(key, after);
            }
            Command::CancelTimer { key } => {
                self.nodes[node].timers.remove(&key);
            }
            Command::Import {
                channel_id,
                doc_id,
                doc,
                data,
                peer_version,
            } => {
                let result = doc.import(&data).map_err(|e| e.to_string());
                self.push(
                    node,
                    Message::ImportCompleted {
                        channel_id,
                        doc_id,
                        peer_version,
                        result,
                    },
                );
            }
            Command::Subscribe { doc_id, doc } => {
                let sink = self.local_changes.clone();
                doc.subscribe_local(Box::new(move || {
                    sink.lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .push_back((node, doc_id.clone()));
                }));
            }
            Command::DocReady { doc_id } => self.nodes[node].ready.push(doc_id),
            Command::DocRemoved { doc_id } => self.nodes[node].removed.push(doc_id),
            Command::PresenceChanged { doc_id } => self.nodes[node].presence_changes.push(doc_id),
        }
    }
}
