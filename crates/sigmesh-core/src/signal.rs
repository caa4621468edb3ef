//! Typed signals: the messages nodes exchange.
//!
//! A [`Signal`] is a header (v4 UUID plus a [`Direction`]) over a closed
//! body variant set. Response variants additionally carry the UUID of the
//! request they answer, which is how callers correlate outcomes regardless
//! of interleaving.
//!
//! Every signal names the capability it requires via
//! [`Signal::permission`]; the policy engine decides admission against
//! that tree. Locally synthesized ticks ([`SignalBody::AclTimeout`],
//! [`SignalBody::Timeout`]) expose no permission at all — no policy can
//! grant them, so they can never be injected from outside.

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use uuid::Uuid;

use crate::crypto::NodeId;
use crate::policy::Tree;
use crate::types::{
    field_tag, type_hash, ExtType, NodeType, SignalType, LINK_ACTION_BASE, LOCK_ACTION_BASE,
};
use crate::wire::SerializedValue;

/// Well-known error codes carried by [`SignalBody::Error`].
pub mod codes {
    /// Policy did not grant the signal's permission.
    pub const ACL_DENIED: &str = "acl_denied";
    /// Delegated policy evaluation did not complete in the window.
    pub const ACL_TIMEOUT: &str = "acl_timeout";
    /// A lockable state-machine precondition required `Unlocked`.
    pub const NOT_UNLOCKED: &str = "not_unlocked";
    /// A lockable state-machine precondition required `Locked`.
    pub const NOT_LOCKED: &str = "not_locked";
    /// Link add named a node that is already a requirement.
    pub const ALREADY_REQUIREMENT: &str = "already_requirement";
    /// Link remove named a node that is not a requirement.
    pub const NOT_REQUIREMENT: &str = "not_requirement";
    /// Message signature verification failed at the receiver.
    pub const SIGNATURE_INVALID: &str = "signature_invalid";
    /// Add-subgroup named a subgroup that already exists.
    pub const ALREADY_SUBGROUP: &str = "already_subgroup";
    /// Add-member named a subgroup that does not exist.
    pub const NOT_SUBGROUP: &str = "not_subgroup";
    /// Add-member named a node that is already a member.
    pub const ALREADY_MEMBER: &str = "already_member";
    /// Remove-member named a node that is not a member.
    pub const NOT_MEMBER: &str = "not_member";
}

/// Routing direction of a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Toward owners: forwarded up the dependency tree.
    Up,
    /// Toward requirements: fanned out down the dependency tree.
    Down,
    /// Peer to peer; handled at the destination only.
    Direct,
}

impl Direction {
    /// Wire byte for this direction.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        match self {
            Self::Up => 0,
            Self::Down => 1,
            Self::Direct => 2,
        }
    }

    /// Parses a wire byte.
    #[must_use]
    pub const fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::Up),
            1 => Some(Self::Down),
            2 => Some(Self::Direct),
            _ => None,
        }
    }
}

/// The two lock protocol actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockAction {
    /// Acquire the lock.
    Lock,
    /// Release the lock.
    Unlock,
}

impl LockAction {
    /// The hashed action name, used in permission trees.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Lock => "lock",
            Self::Unlock => "unlock",
        }
    }

    /// Wire byte for this action.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        match self {
            Self::Lock => 0,
            Self::Unlock => 1,
        }
    }

    /// Parses a wire byte.
    #[must_use]
    pub const fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::Lock),
            1 => Some(Self::Unlock),
            _ => None,
        }
    }
}

/// The two requirement-link actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkAction {
    /// Add a requirement.
    Add,
    /// Remove a requirement.
    Remove,
}

impl LinkAction {
    /// The hashed action name, used in permission trees.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Remove => "remove",
        }
    }

    /// Wire byte for this action.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        match self {
            Self::Add => 0,
            Self::Remove => 1,
        }
    }

    /// Parses a wire byte.
    #[must_use]
    pub const fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::Add),
            1 => Some(Self::Remove),
            _ => None,
        }
    }
}

/// Field names an extension reported as modified while processing a signal.
///
/// Additions are visible to the caller immediately; merged sets drive both
/// persistence and [`SignalBody::Status`] propagation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Changes(std::collections::BTreeSet<String>);

impl Changes {
    /// An empty change set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a changed field name.
    pub fn add(&mut self, field: &str) {
        self.0.insert(field.to_string());
    }

    /// Merges another change set into this one.
    pub fn merge(&mut self, other: Self) {
        self.0.extend(other.0);
    }

    /// Returns true when nothing changed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates the changed field names in sorted order.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

impl FromIterator<String> for Changes {
    fn from_iter<I: IntoIterator<Item = String>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// The closed set of signal variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalKind {
    /// Node creation announcement.
    Create,
    /// Node start announcement.
    Start,
    /// Stop request; the node drains its mailbox and terminates.
    Stop,
    /// Response to [`SignalKind::Stop`].
    Stopped,
    /// Change notification propagated up the dependency tree.
    Status,
    /// Requirement link mutation.
    Link,
    /// Lock protocol request.
    Lock,
    /// Field read request.
    Read,
    /// Response to [`SignalKind::Read`].
    ReadResult,
    /// Positive outcome of a request.
    Success,
    /// Negative outcome of a request.
    Error,
    /// Delegated ACL evaluation query.
    Acl,
    /// Group: declare a subgroup.
    AddSubGroup,
    /// Group: add a member under a subgroup.
    AddMember,
    /// Group: remove a member.
    RemoveMember,
    /// Locally synthesized: a delegated ACL evaluation expired.
    AclTimeout,
    /// Locally synthesized: an external waiter's deadline expired.
    Timeout,
}

impl SignalKind {
    /// Every signal kind, in registration order.
    pub const ALL: [Self; 17] = [
        Self::Create,
        Self::Start,
        Self::Stop,
        Self::Stopped,
        Self::Status,
        Self::Link,
        Self::Lock,
        Self::Read,
        Self::ReadResult,
        Self::Success,
        Self::Error,
        Self::Acl,
        Self::AddSubGroup,
        Self::AddMember,
        Self::RemoveMember,
        Self::AclTimeout,
        Self::Timeout,
    ];

    /// The registered name of this kind.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Create => "CREATE",
            Self::Start => "START",
            Self::Stop => "STOP",
            Self::Stopped => "STOPPED",
            Self::Status => "STATUS",
            Self::Link => "LINK",
            Self::Lock => "LOCK",
            Self::Read => "READ",
            Self::ReadResult => "READ_RESULT",
            Self::Success => "SUCCESS",
            Self::Error => "ERROR",
            Self::Acl => "ACL",
            Self::AddSubGroup => "ADD_SUBGROUP",
            Self::AddMember => "ADD_MEMBER",
            Self::RemoveMember => "REMOVE_MEMBER",
            Self::AclTimeout => "ACL_TIMEOUT",
            Self::Timeout => "TIMEOUT",
        }
    }

    /// The wire identity of this kind.
    #[must_use]
    pub fn signal_type(self) -> SignalType {
        SignalType::new(self.name())
    }
}

/// The pseudo signal-type tag grouping response capabilities in permission
/// trees: responses require `{RESPONSE: {<kind>: {}}}`.
#[must_use]
pub fn response_tag() -> u64 {
    SignalType::new("RESPONSE").raw()
}

/// A typed message body with its routing header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signal {
    /// Unique id of this signal (v4 UUID).
    pub id: Uuid,
    /// Routing direction.
    pub direction: Direction,
    /// The typed payload.
    pub body: SignalBody,
}

/// Payload variants of a [`Signal`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalBody {
    /// Node creation announcement.
    Create,
    /// Node start announcement.
    Start,
    /// Stop request.
    Stop,
    /// Response to a stop request.
    Stopped {
        /// The stop request being answered.
        req_id: Uuid,
        /// The node that stopped.
        source: NodeId,
    },
    /// Change notification.
    Status {
        /// The node whose state changed.
        source: NodeId,
        /// The changed field names.
        changes: Changes,
    },
    /// Requirement link mutation.
    Link {
        /// Add or remove.
        action: LinkAction,
        /// The requirement node.
        node: NodeId,
    },
    /// Lock protocol request.
    Lock {
        /// Lock or unlock.
        action: LockAction,
    },
    /// Field read request: extension type → field names.
    Read {
        /// The fields requested, per extension.
        fields: BTreeMap<ExtType, Vec<String>>,
    },
    /// Field read response.
    ReadResult {
        /// The read request being answered.
        req_id: Uuid,
        /// The node that was read.
        node: NodeId,
        /// Its node type.
        node_type: NodeType,
        /// Serialized field values, per extension.
        fields: BTreeMap<ExtType, BTreeMap<String, SerializedValue>>,
    },
    /// Positive outcome of a request.
    Success {
        /// The request being answered.
        req_id: Uuid,
    },
    /// Negative outcome of a request.
    Error {
        /// The request being answered.
        req_id: Uuid,
        /// Machine-readable error code (see [`codes`]).
        code: String,
    },
    /// Delegated ACL evaluation query: may `principal` exercise `required`?
    Acl {
        /// The principal being evaluated.
        principal: NodeId,
        /// The capability tree the principal wants to exercise.
        required: Tree,
    },
    /// Declare a subgroup on a group node.
    AddSubGroup {
        /// The subgroup name.
        name: String,
    },
    /// Add a member to a group node under a subgroup.
    AddMember {
        /// The subgroup the member joins.
        subgroup: String,
        /// The member node.
        member: NodeId,
    },
    /// Remove a member from a group node.
    RemoveMember {
        /// The member node.
        member: NodeId,
    },
    /// Locally synthesized expiry of a delegated ACL evaluation.
    AclTimeout {
        /// The pending evaluation that expired.
        req_id: Uuid,
    },
    /// Locally synthesized expiry of an external wait.
    Timeout {
        /// The awaited request that expired.
        req_id: Uuid,
    },
}

impl Signal {
    fn fresh(direction: Direction, body: SignalBody) -> Self {
        Self {
            id: Uuid::new_v4(),
            direction,
            body,
        }
    }

    /// A creation announcement.
    #[must_use]
    pub fn create() -> Self {
        Self::fresh(Direction::Direct, SignalBody::Create)
    }

    /// A start announcement.
    #[must_use]
    pub fn start() -> Self {
        Self::fresh(Direction::Direct, SignalBody::Start)
    }

    /// A stop request.
    #[must_use]
    pub fn stop() -> Self {
        Self::fresh(Direction::Direct, SignalBody::Stop)
    }

    /// The response to a stop request.
    #[must_use]
    pub fn stopped(req_id: Uuid, source: NodeId) -> Self {
        Self::fresh(Direction::Up, SignalBody::Stopped { req_id, source })
    }

    /// A change notification from `source`.
    #[must_use]
    pub fn status(source: NodeId, changes: Changes) -> Self {
        Self::fresh(Direction::Up, SignalBody::Status { source, changes })
    }

    /// A requirement link mutation.
    #[must_use]
    pub fn link(action: LinkAction, node: NodeId) -> Self {
        Self::fresh(Direction::Direct, SignalBody::Link { action, node })
    }

    /// A lock protocol request.
    #[must_use]
    pub fn lock(action: LockAction) -> Self {
        Self::fresh(Direction::Direct, SignalBody::Lock { action })
    }

    /// A field read request.
    #[must_use]
    pub fn read(fields: BTreeMap<ExtType, Vec<String>>) -> Self {
        Self::fresh(Direction::Direct, SignalBody::Read { fields })
    }

    /// A field read response.
    #[must_use]
    pub fn read_result(
        req_id: Uuid,
        node: NodeId,
        node_type: NodeType,
        fields: BTreeMap<ExtType, BTreeMap<String, SerializedValue>>,
    ) -> Self {
        Self::fresh(
            Direction::Direct,
            SignalBody::ReadResult {
                req_id,
                node,
                node_type,
                fields,
            },
        )
    }

    /// A positive response to `req_id`.
    #[must_use]
    pub fn success(req_id: Uuid) -> Self {
        Self::fresh(Direction::Direct, SignalBody::Success { req_id })
    }

    /// A negative response to `req_id` with a machine-readable code.
    #[must_use]
    pub fn error(req_id: Uuid, code: impl Into<String>) -> Self {
        Self::fresh(
            Direction::Direct,
            SignalBody::Error {
                req_id,
                code: code.into(),
            },
        )
    }

    /// A delegated ACL evaluation query.
    #[must_use]
    pub fn acl(principal: NodeId, required: Tree) -> Self {
        Self::fresh(
            Direction::Direct,
            SignalBody::Acl {
                principal,
                required,
            },
        )
    }

    /// A subgroup declaration.
    #[must_use]
    pub fn add_subgroup(name: impl Into<String>) -> Self {
        Self::fresh(Direction::Direct, SignalBody::AddSubGroup { name: name.into() })
    }

    /// A member addition under a subgroup.
    #[must_use]
    pub fn add_member(subgroup: impl Into<String>, member: NodeId) -> Self {
        Self::fresh(
            Direction::Direct,
            SignalBody::AddMember {
                subgroup: subgroup.into(),
                member,
            },
        )
    }

    /// A member removal.
    #[must_use]
    pub fn remove_member(member: NodeId) -> Self {
        Self::fresh(Direction::Direct, SignalBody::RemoveMember { member })
    }

    /// A locally synthesized ACL expiry tick.
    #[must_use]
    pub fn acl_timeout(req_id: Uuid) -> Self {
        Self::fresh(Direction::Direct, SignalBody::AclTimeout { req_id })
    }

    /// A locally synthesized wait expiry.
    #[must_use]
    pub fn timeout(req_id: Uuid) -> Self {
        Self::fresh(Direction::Direct, SignalBody::Timeout { req_id })
    }

    /// The kind discriminant of this signal.
    #[must_use]
    pub const fn kind(&self) -> SignalKind {
        match &self.body {
            SignalBody::Create => SignalKind::Create,
            SignalBody::Start => SignalKind::Start,
            SignalBody::Stop => SignalKind::Stop,
            SignalBody::Stopped { .. } => SignalKind::Stopped,
            SignalBody::Status { .. } => SignalKind::Status,
            SignalBody::Link { .. } => SignalKind::Link,
            SignalBody::Lock { .. } => SignalKind::Lock,
            SignalBody::Read { .. } => SignalKind::Read,
            SignalBody::ReadResult { .. } => SignalKind::ReadResult,
            SignalBody::Success { .. } => SignalKind::Success,
            SignalBody::Error { .. } => SignalKind::Error,
            SignalBody::Acl { .. } => SignalKind::Acl,
            SignalBody::AddSubGroup { .. } => SignalKind::AddSubGroup,
            SignalBody::AddMember { .. } => SignalKind::AddMember,
            SignalBody::RemoveMember { .. } => SignalKind::RemoveMember,
            SignalBody::AclTimeout { .. } => SignalKind::AclTimeout,
            SignalBody::Timeout { .. } => SignalKind::Timeout,
        }
    }

    /// The request this signal answers, when it is a response.
    #[must_use]
    pub const fn response_id(&self) -> Option<Uuid> {
        match &self.body {
            SignalBody::Stopped { req_id, .. }
            | SignalBody::ReadResult { req_id, .. }
            | SignalBody::Success { req_id }
            | SignalBody::Error { req_id, .. }
            | SignalBody::AclTimeout { req_id }
            | SignalBody::Timeout { req_id } => Some(*req_id),
            _ => None,
        }
    }

    /// The capability tree this signal requires of its sender.
    ///
    /// `None` means no policy can grant the signal: it exists only as a
    /// locally synthesized tick and is rejected when it arrives from the
    /// fabric.
    #[must_use]
    pub fn permission(&self) -> Option<Tree> {
        let own_type = self.kind().signal_type().raw();
        let response = |kind: SignalKind| {
            Tree::single(response_tag(), Tree::tags([kind.signal_type().raw()]))
        };
        match &self.body {
            SignalBody::Create
            | SignalBody::Start
            | SignalBody::Stop
            | SignalBody::Acl { .. }
            | SignalBody::AddSubGroup { .. }
            | SignalBody::AddMember { .. }
            | SignalBody::RemoveMember { .. }
            | SignalBody::Status { .. } => Some(Tree::tags([own_type])),
            SignalBody::Link { action, .. } => Some(Tree::single(
                own_type,
                Tree::tags([type_hash(LINK_ACTION_BASE, action.name())]),
            )),
            SignalBody::Lock { action } => Some(Tree::single(
                own_type,
                Tree::tags([type_hash(LOCK_ACTION_BASE, action.name())]),
            )),
            SignalBody::Read { fields } => {
                let mut per_ext = BTreeMap::new();
                for (ext, names) in fields {
                    per_ext.insert(
                        ext.raw(),
                        Tree::tags(names.iter().map(|name| field_tag(name))),
                    );
                }
                Some(Tree::single(own_type, Tree(per_ext)))
            }
            SignalBody::Stopped { .. } => Some(response(SignalKind::Stopped)),
            SignalBody::ReadResult { .. } => Some(response(SignalKind::ReadResult)),
            SignalBody::Success { .. } => Some(response(SignalKind::Success)),
            SignalBody::Error { .. } => Some(response(SignalKind::Error)),
            SignalBody::AclTimeout { .. } | SignalBody::Timeout { .. } => None,
        }
    }
}

impl std::fmt::Display for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.body {
            SignalBody::Error { req_id, code } => {
                write!(f, "Error({code}, {} -> {req_id})", self.id)
            }
            SignalBody::Success { req_id } => write!(f, "Success({} -> {req_id})", self.id),
            SignalBody::Status { source, .. } => {
                write!(f, "Status({} from {source})", self.id)
            }
            _ => write!(f, "{}({})", self.kind().name(), self.id),
        }
    }
}

/// Errors from the external wait helpers.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum WaitError {
    /// The listener channel closed before a match arrived.
    #[error("listener channel closed")]
    Closed,
    /// The deadline expired before a match arrived.
    #[error("timed out waiting for signal")]
    Timeout,
}

/// Waits for the response to `req_id` on a listener channel.
///
/// Non-matching signals received while waiting are returned alongside the
/// response so callers can inspect them. Expiry does not cancel any work on
/// the receiver; it is purely a local deadline.
///
/// # Errors
///
/// [`WaitError::Timeout`] on expiry, [`WaitError::Closed`] if the channel
/// closes first.
pub async fn wait_for_response(
    rx: &mut mpsc::Receiver<Signal>,
    timeout: Duration,
    req_id: Uuid,
) -> Result<(Signal, Vec<Signal>), WaitError> {
    let deadline = Instant::now() + timeout;
    let mut others = Vec::new();
    loop {
        let signal = recv_until(rx, deadline).await?;
        if signal.response_id() == Some(req_id) {
            return Ok((signal, others));
        }
        others.push(signal);
    }
}

/// Waits for the first signal matching `pred` on a listener channel.
///
/// # Errors
///
/// [`WaitError::Timeout`] on expiry, [`WaitError::Closed`] if the channel
/// closes first.
pub async fn wait_for_signal(
    rx: &mut mpsc::Receiver<Signal>,
    timeout: Duration,
    mut pred: impl FnMut(&Signal) -> bool,
) -> Result<Signal, WaitError> {
    let deadline = Instant::now() + timeout;
    loop {
        let signal = recv_until(rx, deadline).await?;
        if pred(&signal) {
            return Ok(signal);
        }
    }
}

async fn recv_until(
    rx: &mut mpsc::Receiver<Signal>,
    deadline: Instant,
) -> Result<Signal, WaitError> {
    match tokio::time::timeout_at(deadline, rx.recv()).await {
        Ok(Some(signal)) => Ok(signal),
        Ok(None) => Err(WaitError::Closed),
        Err(_) => Err(WaitError::Timeout),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_ids_only_on_responses() {
        assert!(Signal::create().response_id().is_none());
        assert!(Signal::lock(LockAction::Lock).response_id().is_none());
        let req = Uuid::new_v4();
        assert_eq!(Signal::success(req).response_id(), Some(req));
        assert_eq!(
            Signal::error(req, codes::ACL_DENIED).response_id(),
            Some(req)
        );
    }

    #[test]
    fn lock_permission_distinguishes_actions() {
        let lock = Signal::lock(LockAction::Lock).permission().unwrap();
        let unlock = Signal::lock(LockAction::Unlock).permission().unwrap();
        assert_ne!(lock, unlock);
        // A grant for "lock" does not cover "unlock".
        assert!(!lock.covers(&unlock));
        // The bare LOCK capability covers both.
        let bare = Tree::tags([SignalKind::Lock.signal_type().raw()]);
        assert!(bare.covers(&lock));
        assert!(bare.covers(&unlock));
    }

    #[test]
    fn read_permission_names_fields() {
        let ext = ExtType::new("LOCKABLE");
        let sig = Signal::read(BTreeMap::from([(ext, vec!["state".to_string()])]));
        let required = sig.permission().unwrap();
        let granted = Tree::single(
            SignalKind::Read.signal_type().raw(),
            Tree::single(ext.raw(), Tree::tags([field_tag("state")])),
        );
        assert!(granted.covers(&required));
        let other_field = Tree::single(
            SignalKind::Read.signal_type().raw(),
            Tree::single(ext.raw(), Tree::tags([field_tag("owner")])),
        );
        assert!(!other_field.covers(&required));
    }

    #[test]
    fn timeouts_have_no_permission() {
        assert!(Signal::timeout(Uuid::new_v4()).permission().is_none());
        assert!(Signal::acl_timeout(Uuid::new_v4()).permission().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_response_skips_unrelated() {
        let (tx, mut rx) = mpsc::channel(8);
        let req = Uuid::new_v4();
        tx.send(Signal::create()).await.unwrap();
        tx.send(Signal::success(req)).await.unwrap();

        let (response, others) = wait_for_response(&mut rx, Duration::from_millis(10), req)
            .await
            .expect("response arrives");
        assert_eq!(response.response_id(), Some(req));
        assert_eq!(others.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_response_times_out() {
        let (tx, mut rx) = mpsc::channel::<Signal>(1);
        let err = wait_for_response(&mut rx, Duration::from_millis(5), Uuid::new_v4())
            .await
            .unwrap_err();
        assert_eq!(err, WaitError::Timeout);
        drop(tx);
    }

    #[tokio::test]
    async fn wait_for_signal_reports_closed_channel() {
        let (tx, mut rx) = mpsc::channel::<Signal>(1);
        drop(tx);
        let err = wait_for_signal(&mut rx, Duration::from_millis(5), |_| true)
            .await
            .unwrap_err();
        assert_eq!(err, WaitError::Closed);
    }
}
