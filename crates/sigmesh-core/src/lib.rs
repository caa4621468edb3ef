//! # sigmesh-core
//!
//! A programmable graph of addressable, signed, stateful nodes that
//! exchange typed signals through a local routing fabric, compose
//! behavior via pluggable extensions, and coordinate multi-party resource
//! ownership through a distributed two-phase locking protocol.
//!
//! ## Architecture
//!
//! - **Identity**: a node is its Ed25519 keypair; its 128-bit id derives
//!   from the public key ([`crypto`]).
//! - **Transport**: signed [`message::Message`] envelopes carry typed
//!   [`signal::Signal`]s; the [`context::Context`] router enqueues them
//!   into bounded per-node mailboxes without blocking.
//! - **Runtime**: one task per node pulls its mailbox, verifies
//!   signatures, evaluates [`policy`] admission, and dispatches through
//!   the node's [`ext`] chain in declaration order.
//! - **Locking**: the lockable extension implements two-phase lock/unlock
//!   over a requirement fan-out with partial-failure rollback.
//! - **Persistence**: node records serialize through the [`wire`] value
//!   encoding into a memory or directory [`store`].
//!
//! ## Example
//!
//! ```rust,no_run
//! use sigmesh_core::config::RuntimeConfig;
//! use sigmesh_core::context::Context;
//! use sigmesh_core::ext::{ExtKind, ExtensionSlot, ListenerExt, LockableExt};
//! use sigmesh_core::policy::{Policy, Tree};
//! use sigmesh_core::signal::{LockAction, Signal};
//!
//! # #[tokio::main] async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let ctx = Context::new(RuntimeConfig::default())?;
//! let lockable = ctx.register_node_type(
//!     "RESOURCE",
//!     vec![ExtKind::Listener.ext_type(), ExtKind::Lockable.ext_type()],
//! )?;
//!
//! let (listener, mut feed) = ListenerExt::channel(64);
//! let node = ctx.new_node(
//!     None,
//!     lockable,
//!     vec![Policy::AllNodes(Tree::leaf())],
//!     vec![
//!         ExtensionSlot::Listener(listener),
//!         ExtensionSlot::Lockable(LockableExt::new([])),
//!     ],
//! )?;
//! # let _ = (node, &mut feed);
//! # Ok(()) }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod context;
pub mod crypto;
pub mod ext;
pub mod message;
mod node;
pub mod policy;
pub mod signal;
pub mod store;
pub mod types;
pub mod wire;

pub use config::{RuntimeConfig, StorageConfig};
pub use context::{Context, ContextError, SendError};
pub use crypto::{Authorization, ClientAuthorization, NodeId, NodeKey};
pub use message::Message;
pub use policy::{Policy, Tree};
pub use signal::{Signal, SignalBody, SignalKind};
