//! The context: type registries, node map, and the local router.
//!
//! A [`Context`] binds together everything a running graph needs — the
//! registered node/signal/policy/extension types, the storage backend, the
//! group-membership read model, and the map of live nodes. It is scoped
//! and explicitly passed; there is no process-wide singleton, and tests
//! construct a fresh context per case.
//!
//! Routing is deliberately thin: [`Context::send`] resolves the
//! destination (loading it from storage when it is not live), then
//! enqueues without blocking. No signature verification and no policy
//! evaluation happen here — both are the receiver's job, which keeps the
//! router O(1) and keeps signing concerns inside the node's run loop.

use std::backtrace::Backtrace;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use crate::config::{ConfigError, RuntimeConfig};
use crate::crypto::{ClientAuthorization, NodeId, NodeKey};
use crate::ext::{ExtKind, ExtensionSlot};
use crate::message::Message;
use crate::node::NodeState;
use crate::policy::{GroupIndex, Policy, PolicyKind};
use crate::signal::{Signal, SignalKind};
use crate::store::{NodeRecord, NodeStore, StoreError};
use crate::types::{ExtType, NodeType};
use crate::wire::WireError;

/// Errors from type registration.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Two registered names hashed to the same 64-bit identity.
    #[error("hash collision registering {domain} \"{name}\"")]
    HashCollision {
        /// Which registry the collision occurred in.
        domain: &'static str,
        /// The name whose hash was already taken.
        name: String,
    },

    /// The node type name is already registered.
    #[error("node type \"{name}\" already registered")]
    DuplicateNodeType {
        /// The repeated name.
        name: String,
    },

    /// A required extension type is not registered.
    #[error("required extension {0} is not registered")]
    UnknownExtension(ExtType),

    /// The same extension appears twice in a requirement list.
    #[error("duplicate extension {0} in requirement list")]
    DuplicateExtension(ExtType),
}

/// Errors from context construction and node creation.
#[derive(Debug, Error)]
pub enum ContextError {
    /// Invalid runtime configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Storage backend failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Type registration failure.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// The node type was never registered.
    #[error("unknown node type {0}")]
    UnknownNodeType(NodeType),

    /// The extension list does not match the node type's declared set.
    #[error("extension set does not match requirements of node type {node_type}")]
    ExtensionMismatch {
        /// The node type being instantiated.
        node_type: NodeType,
    },

    /// A node with this id is already live in the context.
    #[error("node {0} already exists in context")]
    DuplicateNode(NodeId),
}

/// Errors from routing messages.
#[derive(Debug, Error)]
pub enum SendError {
    /// The reserved all-zero id is never a valid destination.
    #[error("cannot send to the zero node id")]
    ZeroDestination,

    /// The destination is neither live nor in storage.
    #[error("node {0} not found")]
    NodeNotFound(NodeId),

    /// The destination mailbox was full.
    #[error("mailbox overflow sending to {dest}")]
    Overflow {
        /// The overflowing destination.
        dest: NodeId,
        /// Where the send came from, for diagnostics.
        backtrace: String,
    },

    /// The destination existed in storage but failed to load.
    #[error("failed to load node {id}: {source}")]
    Load {
        /// The node that failed to load.
        id: NodeId,
        /// The underlying failure.
        source: StoreError,
    },
}

struct NodeTypeEntry {
    name: String,
    required: Vec<ExtType>,
}

/// The process-wide type registries.
///
/// All built-in kinds are registered at context construction; registering
/// a name whose hash is already taken is a configuration error, caught
/// here rather than at dispatch time.
pub struct Registry {
    signals: HashMap<u64, SignalKind>,
    policies: HashMap<u64, PolicyKind>,
    extensions: HashMap<u64, ExtKind>,
    node_types: HashMap<u64, NodeTypeEntry>,
}

impl Registry {
    fn with_builtins() -> Result<Self, RegistryError> {
        let mut registry = Self {
            signals: HashMap::new(),
            policies: HashMap::new(),
            extensions: HashMap::new(),
            node_types: HashMap::new(),
        };
        for kind in SignalKind::ALL {
            if registry
                .signals
                .insert(kind.signal_type().raw(), kind)
                .is_some()
            {
                return Err(RegistryError::HashCollision {
                    domain: "signal type",
                    name: kind.name().to_string(),
                });
            }
        }
        for kind in PolicyKind::ALL {
            if registry
                .policies
                .insert(kind.policy_type().raw(), kind)
                .is_some()
            {
                return Err(RegistryError::HashCollision {
                    domain: "policy type",
                    name: kind.name().to_string(),
                });
            }
        }
        for kind in ExtKind::ALL {
            if registry
                .extensions
                .insert(kind.ext_type().raw(), kind)
                .is_some()
            {
                return Err(RegistryError::HashCollision {
                    domain: "extension type",
                    name: kind.name().to_string(),
                });
            }
        }
        registry.register_node_type("BASE", Vec::new())?;
        registry.register_node_type("GROUP", vec![ExtKind::Group.ext_type()])?;
        registry.register_node_type("ACL", vec![ExtKind::Acl.ext_type()])?;
        registry.register_node_type("LISTENER", vec![ExtKind::Listener.ext_type()])?;
        Ok(registry)
    }

    fn register_node_type(
        &mut self,
        name: &str,
        required: Vec<ExtType>,
    ) -> Result<NodeType, RegistryError> {
        let node_type = NodeType::new(name);
        if let Some(existing) = self.node_types.get(&node_type.raw()) {
            if existing.name == name {
                return Err(RegistryError::DuplicateNodeType {
                    name: name.to_string(),
                });
            }
            return Err(RegistryError::HashCollision {
                domain: "node type",
                name: name.to_string(),
            });
        }
        let mut seen = Vec::new();
        for ext in &required {
            if !self.extensions.contains_key(&ext.raw()) {
                return Err(RegistryError::UnknownExtension(*ext));
            }
            if seen.contains(ext) {
                return Err(RegistryError::DuplicateExtension(*ext));
            }
            seen.push(*ext);
        }
        self.node_types.insert(
            node_type.raw(),
            NodeTypeEntry {
                name: name.to_string(),
                required,
            },
        );
        Ok(node_type)
    }

    fn required_extensions(&self, node_type: NodeType) -> Option<&[ExtType]> {
        self.node_types
            .get(&node_type.raw())
            .map(|entry| entry.required.as_slice())
    }
}

struct NodeHandle {
    sender: mpsc::Sender<Message>,
}

pub(crate) struct Shared {
    pub(crate) config: RuntimeConfig,
    pub(crate) store: NodeStore,
    pub(crate) groups: GroupIndex,
    registry: RwLock<Registry>,
    nodes: RwLock<HashMap<NodeId, NodeHandle>>,
}

impl Shared {
    /// Routes messages to local mailboxes; see [`Context::send`].
    pub(crate) fn send(self: &Arc<Self>, messages: Vec<Message>) -> Result<(), SendError> {
        for message in messages {
            if message.dest.is_zero() {
                return Err(SendError::ZeroDestination);
            }
            let sender = self.resolve(message.dest)?;
            let dest = message.dest;
            match sender.try_send(message) {
                Ok(()) => {
                    debug!(target: "router", dest = %dest, "message enqueued");
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    return Err(SendError::Overflow {
                        dest,
                        backtrace: Backtrace::force_capture().to_string(),
                    });
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    return Err(SendError::NodeNotFound(dest));
                }
            }
        }
        Ok(())
    }

    fn resolve(self: &Arc<Self>, id: NodeId) -> Result<mpsc::Sender<Message>, SendError> {
        if let Some(handle) = self
            .nodes
            .read()
            .expect("node map lock poisoned")
            .get(&id)
        {
            return Ok(handle.sender.clone());
        }
        self.load_node(id)
    }

    /// Loads a node from storage and starts its run loop.
    fn load_node(self: &Arc<Self>, id: NodeId) -> Result<mpsc::Sender<Message>, SendError> {
        let bytes = self
            .store
            .read(id)
            .map_err(|source| SendError::Load { id, source })?
            .ok_or(SendError::NodeNotFound(id))?;
        let record = NodeRecord::decode(&bytes).map_err(|source| SendError::Load { id, source })?;

        {
            let registry = self.registry.read().expect("registry lock poisoned");
            let Some(required) = registry.required_extensions(record.node_type) else {
                return Err(SendError::Load {
                    id,
                    source: StoreError::Wire(WireError::UnknownNodeType(record.node_type.raw())),
                });
            };
            let stored: Vec<ExtType> = record
                .extensions
                .iter()
                .map(|(kind, _)| kind.ext_type())
                .collect();
            if stored != required {
                return Err(SendError::Load {
                    id,
                    source: StoreError::Wire(WireError::ShapeMismatch {
                        context: "stored extension list",
                    }),
                });
            }
        }

        let mut slots = Vec::with_capacity(record.extensions.len());
        for (kind, state) in &record.extensions {
            let slot = ExtensionSlot::from_value(*kind, state)
                .map_err(|source| SendError::Load {
                    id,
                    source: StoreError::Wire(source),
                })?;
            slots.push(slot);
        }

        let mut state = NodeState::from_record(record, slots);
        state.load(self);

        let mut nodes = self.nodes.write().expect("node map lock poisoned");
        if let Some(existing) = nodes.get(&id) {
            // Another sender loaded it concurrently; use theirs.
            return Ok(existing.sender.clone());
        }
        let (tx, rx) = mpsc::channel(self.config.mailbox_capacity);
        nodes.insert(id, NodeHandle { sender: tx.clone() });
        drop(nodes);

        debug!(target: "db", node = %id, "node loaded from storage");
        tokio::spawn(state.run(Arc::clone(self), rx));
        Ok(tx)
    }

    pub(crate) fn remove_node(&self, id: NodeId) {
        self.nodes
            .write()
            .expect("node map lock poisoned")
            .remove(&id);
    }
}

/// The process-local runtime binding nodes, types, and storage together.
#[derive(Clone)]
pub struct Context {
    shared: Arc<Shared>,
}

impl Context {
    /// Creates a context with the built-in types registered.
    ///
    /// # Errors
    ///
    /// Invalid configuration, storage backend failure, or a hash collision
    /// among the built-in type names.
    pub fn new(config: RuntimeConfig) -> Result<Self, ContextError> {
        config.validate()?;
        let store = NodeStore::open(&config.storage)?;
        let registry = Registry::with_builtins()?;
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                store,
                groups: GroupIndex::new(),
                registry: RwLock::new(registry),
                nodes: RwLock::new(HashMap::new()),
            }),
        })
    }

    /// Registers a node type with its exact required extension list.
    ///
    /// The list order is the dispatch order of every node of this type.
    ///
    /// # Errors
    ///
    /// Duplicate names, hash collisions, and unknown or repeated
    /// extensions are all configuration errors.
    pub fn register_node_type(
        &self,
        name: &str,
        required: Vec<ExtType>,
    ) -> Result<NodeType, ContextError> {
        let mut registry = self
            .shared
            .registry
            .write()
            .expect("registry lock poisoned");
        Ok(registry.register_node_type(name, required)?)
    }

    /// Creates a node, registers it, starts its run loop, and emits its
    /// `Create` signal.
    ///
    /// A fresh key is generated when none is supplied. The extension list
    /// must match the node type's declared set exactly, in order.
    ///
    /// # Errors
    ///
    /// Unknown node type, extension mismatch, duplicate node, or a
    /// storage failure writing the initial record.
    pub fn new_node(
        &self,
        key: Option<NodeKey>,
        node_type: NodeType,
        policies: Vec<Policy>,
        extensions: Vec<ExtensionSlot>,
    ) -> Result<NodeId, ContextError> {
        {
            let registry = self
                .shared
                .registry
                .read()
                .expect("registry lock poisoned");
            let Some(required) = registry.required_extensions(node_type) else {
                return Err(ContextError::UnknownNodeType(node_type));
            };
            let given: Vec<ExtType> = extensions.iter().map(ExtensionSlot::ext_type).collect();
            if given != required {
                return Err(ContextError::ExtensionMismatch { node_type });
            }
        }

        let key = key.unwrap_or_else(NodeKey::generate);
        let id = key.node_id();

        let mut state = NodeState::new(key, node_type, policies, extensions);
        state.load(&self.shared);
        self.shared.store.write(id, &state.initial_record())?;

        let creation = state.creation_message();
        let (tx, rx) = {
            let mut nodes = self
                .shared
                .nodes
                .write()
                .expect("node map lock poisoned");
            if nodes.contains_key(&id) {
                return Err(ContextError::DuplicateNode(id));
            }
            let (tx, rx) = mpsc::channel(self.shared.config.mailbox_capacity);
            nodes.insert(id, NodeHandle { sender: tx.clone() });
            (tx, rx)
        };

        tokio::spawn(state.run(Arc::clone(&self.shared), rx));
        if tx.try_send(creation).is_err() {
            debug!(target: "node", node = %id, "creation signal dropped");
        }
        debug!(target: "node", node = %id, node_type = %node_type, "node created");
        Ok(id)
    }

    /// Routes messages to their destinations' mailboxes.
    ///
    /// Enqueueing never blocks: a full mailbox fails the send with
    /// [`SendError::Overflow`] instead of waiting, and earlier queued
    /// messages are untouched.
    ///
    /// # Errors
    ///
    /// See [`SendError`].
    pub fn send(&self, messages: Vec<Message>) -> Result<(), SendError> {
        self.shared.send(messages)
    }

    /// Signs `signal` with `key` and routes it to `dest`, returning the
    /// signal id for response correlation.
    ///
    /// # Errors
    ///
    /// See [`SendError`].
    pub fn send_as(
        &self,
        key: &NodeKey,
        dest: NodeId,
        signal: Signal,
    ) -> Result<Uuid, SendError> {
        let id = signal.id;
        self.send(vec![Message::new(dest, key, signal)])?;
        Ok(id)
    }

    /// Signs `signal` under a delegated authorization and routes it.
    ///
    /// # Errors
    ///
    /// See [`SendError`].
    pub fn send_with_authorization(
        &self,
        client: &ClientAuthorization,
        dest: NodeId,
        signal: Signal,
    ) -> Result<Uuid, SendError> {
        let id = signal.id;
        self.send(vec![Message::with_authorization(dest, client, signal)])?;
        Ok(id)
    }

    /// Returns true while `id` is live in this context.
    #[must_use]
    pub fn contains(&self, id: NodeId) -> bool {
        self.shared
            .nodes
            .read()
            .expect("node map lock poisoned")
            .contains_key(&id)
    }

    /// The runtime configuration this context was built with.
    #[must_use]
    pub fn config(&self) -> &RuntimeConfig {
        &self.shared.config
    }
}
