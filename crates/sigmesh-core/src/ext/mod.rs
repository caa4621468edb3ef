//! Pluggable node extensions.
//!
//! Extensions are the behavior attached to nodes. They are a closed
//! variant set — adding behavior means adding a variant, not injecting
//! types at runtime — dispatched through [`ExtensionSlot`]. Every variant
//! implements the same contract: process a signal, return outbound
//! messages plus the set of changed field names, and optionally request a
//! local timer. Extensions never touch the fabric directly; the owning
//! node's run loop signs and routes whatever they emit.

mod acl;
mod group;
mod listener;
mod lockable;

use std::collections::{BTreeMap, HashMap};
use std::sync::LazyLock;
use std::time::Duration;

use uuid::Uuid;

pub use acl::AclExt;
pub use group::GroupExt;
pub use listener::{ListenerExt, SignalReceiver};
pub use lockable::{LockState, LockableExt, Requirement};

use crate::config::RuntimeConfig;
use crate::crypto::NodeId;
use crate::policy::GroupIndex;
use crate::signal::{Changes, Signal};
use crate::types::{ExtType, NodeType};
use crate::wire::{SerializedValue, WireError};

/// The closed set of extension kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExtKind {
    /// Two-phase locking over requirement nodes.
    Lockable,
    /// Group membership.
    Group,
    /// Delegated ACL evaluation.
    Acl,
    /// Bounded signal feed for external observers.
    Listener,
}

impl ExtKind {
    /// Every extension kind, in registration order.
    pub const ALL: [Self; 4] = [Self::Lockable, Self::Group, Self::Acl, Self::Listener];

    /// The registered name of this kind.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Lockable => "LOCKABLE",
            Self::Group => "GROUP",
            Self::Acl => "ACL",
            Self::Listener => "LISTENER",
        }
    }

    /// The wire/storage identity of this kind.
    #[must_use]
    pub fn ext_type(self) -> ExtType {
        ExtType::new(self.name())
    }
}

static EXT_KINDS: LazyLock<HashMap<u64, ExtKind>> = LazyLock::new(|| {
    ExtKind::ALL
        .iter()
        .map(|kind| (kind.ext_type().raw(), *kind))
        .collect()
});

/// Looks up an extension kind by its storage type hash.
#[must_use]
pub fn ext_kind_for(type_hash: u64) -> Option<ExtKind> {
    EXT_KINDS.get(&type_hash).copied()
}

/// A message an extension wants sent, before signing.
#[derive(Debug, Clone)]
pub struct Outbound {
    /// Destination node.
    pub dest: NodeId,
    /// The signal to deliver.
    pub signal: Signal,
}

/// A local timer an extension wants scheduled.
///
/// When it fires, the node synthesizes `AclTimeout(req_id)` and dispatches
/// it back through the extension chain.
#[derive(Debug, Clone, Copy)]
pub struct TimerRequest {
    /// Correlates the expiry tick with the pending work.
    pub req_id: Uuid,
    /// Delay until the tick fires.
    pub fire_in: Duration,
}

/// Everything an extension returns from processing one signal.
#[derive(Debug, Default)]
pub struct ProcessOutput {
    /// Messages to sign and route.
    pub messages: Vec<Outbound>,
    /// Field names this extension modified.
    pub changes: Changes,
    /// Timers to schedule.
    pub timers: Vec<TimerRequest>,
}

impl ProcessOutput {
    /// An empty output.
    #[must_use]
    pub fn none() -> Self {
        Self::default()
    }

    /// Queues a message.
    pub fn send(&mut self, dest: NodeId, signal: Signal) {
        self.messages.push(Outbound { dest, signal });
    }

    /// Records a changed field.
    pub fn change(&mut self, field: &str) {
        self.changes.add(field);
    }

    /// Schedules a timer.
    pub fn timer(&mut self, req_id: Uuid, fire_in: Duration) {
        self.timers.push(TimerRequest { req_id, fire_in });
    }
}

/// The node-side view an extension processes against.
pub struct ProcessEnv<'a> {
    /// The owning node's id.
    pub node_id: NodeId,
    /// The owning node's type.
    pub node_type: NodeType,
    /// Shared runtime configuration.
    pub config: &'a RuntimeConfig,
    /// Shared group-membership read model.
    pub groups: &'a GroupIndex,
}

/// An extension instance attached to a node.
///
/// Enum dispatch keeps the variant set closed and the per-signal hot path
/// free of dynamic downcasts.
#[derive(Debug)]
pub enum ExtensionSlot {
    /// Two-phase locking state machine.
    Lockable(LockableExt),
    /// Group membership state.
    Group(GroupExt),
    /// Delegated ACL evaluation state.
    Acl(AclExt),
    /// External observer feed.
    Listener(ListenerExt),
}

impl ExtensionSlot {
    /// The kind discriminant of this slot.
    #[must_use]
    pub const fn kind(&self) -> ExtKind {
        match self {
            Self::Lockable(_) => ExtKind::Lockable,
            Self::Group(_) => ExtKind::Group,
            Self::Acl(_) => ExtKind::Acl,
            Self::Listener(_) => ExtKind::Listener,
        }
    }

    /// The wire/storage identity of this slot.
    #[must_use]
    pub fn ext_type(&self) -> ExtType {
        self.kind().ext_type()
    }

    /// Processes one signal, in dispatch order with the node's other
    /// extensions.
    pub fn process(&mut self, env: &ProcessEnv<'_>, source: NodeId, signal: &Signal) -> ProcessOutput {
        match self {
            Self::Lockable(ext) => ext.process(env, source, signal),
            Self::Group(ext) => ext.process(env, source, signal),
            Self::Acl(ext) => ext.process(env, source, signal),
            Self::Listener(ext) => ext.process(env, source, signal),
        }
    }

    /// Hook invoked when the owning node enters a context (creation or
    /// load from storage).
    pub fn load(&mut self, env: &ProcessEnv<'_>) {
        match self {
            Self::Group(ext) => ext.load(env),
            Self::Listener(ext) => ext.load(env),
            Self::Lockable(_) | Self::Acl(_) => {}
        }
    }

    /// Hook invoked when the owning node leaves the context.
    pub fn unload(&mut self, env: &ProcessEnv<'_>) {
        match self {
            Self::Group(ext) => ext.unload(env),
            Self::Lockable(_) | Self::Acl(_) | Self::Listener(_) => {}
        }
    }

    /// Serializes the named fields for a read request. Unknown names are
    /// skipped; the reply simply omits them.
    #[must_use]
    pub fn read_fields(&self, names: &[String]) -> BTreeMap<String, SerializedValue> {
        let mut out = BTreeMap::new();
        for name in names {
            let value = match self {
                Self::Lockable(ext) => ext.read_field(name),
                Self::Group(ext) => ext.read_field(name),
                Self::Acl(ext) => ext.read_field(name),
                Self::Listener(ext) => ext.read_field(name),
            };
            if let Some(value) = value {
                out.insert(name.clone(), value);
            }
        }
        out
    }

    /// Serializes this extension's persistent state.
    #[must_use]
    pub fn to_value(&self) -> SerializedValue {
        match self {
            Self::Lockable(ext) => ext.to_value(),
            Self::Group(ext) => ext.to_value(),
            Self::Acl(ext) => ext.to_value(),
            Self::Listener(ext) => ext.to_value(),
        }
    }

    /// Rebuilds an extension from its persistent state.
    ///
    /// # Errors
    ///
    /// Any [`WireError`] from the state decoder.
    pub fn from_value(kind: ExtKind, value: &SerializedValue) -> Result<Self, WireError> {
        Ok(match kind {
            ExtKind::Lockable => Self::Lockable(LockableExt::from_value(value)?),
            ExtKind::Group => Self::Group(GroupExt::from_value(value)?),
            ExtKind::Acl => Self::Acl(AclExt::from_value(value)?),
            ExtKind::Listener => Self::Listener(ListenerExt::from_value(value)?),
        })
    }
}
