//! Two-phase distributed locking over requirement nodes.
//!
//! A lockable node can only be locked once every node in its requirement
//! set is locked on its behalf. Locking fans `Lock` requests out to all
//! requirements and waits for their responses; any refusal aborts the
//! transaction and releases whatever was already acquired, so a failed
//! lock never leaves a requirement held.
//!
//! State machine (per node):
//!
//! ```text
//! Unlocked --lock, no reqs--> Locked
//! Unlocked --lock, reqs-----> Locking      [fan out Lock]
//! Locking  --all Success----> Locked       [reply Success to pending owner]
//! Locking  --any Error------> AbortingLock [fan out Unlock to Locked reqs]
//! AbortingLock --drained----> Unlocked     [reply Error("not_unlocked")]
//! Locked   --unlock by owner-> Unlocking   [fan out Unlock]
//! Unlocking --all Success---> Unlocked     [reply Success to old owner]
//! ```
//!
//! While a transaction is outstanding (`Locking`, `Unlocking`,
//! `AbortingLock`), lock and unlock requests from other owners are refused
//! with `not_unlocked` / `not_locked`, so there is at most one transaction
//! per lockable at a time.
//!
//! Requirement sub-states mirror the parent's intent and carry the UUID of
//! the in-flight request; a response only matches when its correlation id
//! equals that UUID. Mismatches are logged and ignored.

use std::collections::BTreeMap;

use tracing::{debug, warn};
use uuid::Uuid;

use super::{ProcessEnv, ProcessOutput};
use crate::crypto::NodeId;
use crate::signal::{codes, Direction, LinkAction, LockAction, Signal, SignalBody};
use crate::wire::{value_tags, SerializedValue, ValueReader, ValueWriter, WireError};

/// Lock progress of a lockable or of one of its requirements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    /// Not held and no transaction outstanding.
    Unlocked,
    /// Unlock requests are in flight.
    Unlocking,
    /// Held by `owner`.
    Locked,
    /// Lock requests are in flight.
    Locking,
    /// A failed lock is being rolled back.
    AbortingLock,
}

impl LockState {
    /// Storage byte for this state.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        match self {
            Self::Unlocked => 0,
            Self::Unlocking => 1,
            Self::Locked => 2,
            Self::Locking => 3,
            Self::AbortingLock => 4,
        }
    }

    /// Parses a storage byte.
    #[must_use]
    pub const fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::Unlocked),
            1 => Some(Self::Unlocking),
            2 => Some(Self::Locked),
            3 => Some(Self::Locking),
            4 => Some(Self::AbortingLock),
            _ => None,
        }
    }

    /// Lowercase name, used in read-out and logs.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Unlocked => "unlocked",
            Self::Unlocking => "unlocking",
            Self::Locked => "locked",
            Self::Locking => "locking",
            Self::AbortingLock => "aborting_lock",
        }
    }
}

/// Per-requirement mirror of the parent transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Requirement {
    /// This requirement's progress.
    pub state: LockState,
    /// Correlation id of the outstanding request, if any.
    pub in_flight: Option<Uuid>,
}

impl Requirement {
    const fn idle() -> Self {
        Self {
            state: LockState::Unlocked,
            in_flight: None,
        }
    }
}

/// The lockable extension state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockableExt {
    /// Transaction state of this lockable.
    pub state: LockState,
    /// Holder of the lock. Non-null exactly while the lock is held, being
    /// released, or a failed acquisition is rolling back (then it names
    /// the pending acquirer).
    pub owner: Option<NodeId>,
    /// The node acquiring the lock while a transaction runs.
    pub pending_owner: Option<NodeId>,
    /// Id of the request that opened the current transaction; responses to
    /// the requester are correlated with it.
    pub request_id: Option<Uuid>,
    /// Requirement fan-out, keyed by node id.
    pub requirements: BTreeMap<NodeId, Requirement>,
}

impl LockableExt {
    /// Creates an unlocked lockable over the given requirements.
    #[must_use]
    pub fn new<I: IntoIterator<Item = NodeId>>(requirements: I) -> Self {
        Self {
            state: LockState::Unlocked,
            owner: None,
            pending_owner: None,
            request_id: None,
            requirements: requirements
                .into_iter()
                .map(|id| (id, Requirement::idle()))
                .collect(),
        }
    }

    fn all_requirements(&self, state: LockState) -> bool {
        self.requirements.values().all(|req| req.state == state)
    }

    /// Dispatch entry point.
    pub fn process(
        &mut self,
        env: &ProcessEnv<'_>,
        source: NodeId,
        signal: &Signal,
    ) -> ProcessOutput {
        let mut out = ProcessOutput::none();
        match signal.direction {
            Direction::Up => {
                if let Some(owner) = self.owner {
                    if owner != env.node_id {
                        out.send(owner, signal.clone());
                    }
                }
            }
            Direction::Down => {
                for requirement in self.requirements.keys() {
                    out.send(*requirement, signal.clone());
                }
            }
            Direction::Direct => match &signal.body {
                SignalBody::Link { action, node } => {
                    self.handle_link(source, signal.id, *action, *node, &mut out);
                }
                SignalBody::Lock { action } => {
                    self.handle_lock(source, signal.id, *action, &mut out);
                }
                SignalBody::Success { req_id } => {
                    self.handle_success(env, source, *req_id, &mut out);
                }
                SignalBody::Error { req_id, code } => {
                    self.handle_error(env, source, *req_id, code, &mut out);
                }
                _ => {}
            },
        }
        out
    }

    fn handle_link(
        &mut self,
        source: NodeId,
        id: Uuid,
        action: LinkAction,
        node: NodeId,
        out: &mut ProcessOutput,
    ) {
        if self.state != LockState::Unlocked {
            out.send(source, Signal::error(id, codes::NOT_UNLOCKED));
            return;
        }
        match action {
            LinkAction::Add => {
                if self.requirements.contains_key(&node) {
                    out.send(source, Signal::error(id, codes::ALREADY_REQUIREMENT));
                } else {
                    self.requirements.insert(node, Requirement::idle());
                    out.change("requirements");
                    out.send(source, Signal::success(id));
                }
            }
            LinkAction::Remove => {
                if self.requirements.remove(&node).is_none() {
                    out.send(source, Signal::error(id, codes::NOT_REQUIREMENT));
                } else {
                    out.change("requirements");
                    out.send(source, Signal::success(id));
                }
            }
        }
    }

    fn handle_lock(
        &mut self,
        source: NodeId,
        id: Uuid,
        action: LockAction,
        out: &mut ProcessOutput,
    ) {
        match action {
            LockAction::Lock => {
                if self.state != LockState::Unlocked {
                    out.send(source, Signal::error(id, codes::NOT_UNLOCKED));
                    return;
                }
                if self.requirements.is_empty() {
                    self.state = LockState::Locked;
                    self.owner = Some(source);
                    self.pending_owner = Some(source);
                    out.change("state");
                    out.change("owner");
                    out.send(source, Signal::success(id));
                    return;
                }
                self.state = LockState::Locking;
                self.request_id = Some(id);
                self.pending_owner = Some(source);
                out.change("state");
                for (node, requirement) in &mut self.requirements {
                    if requirement.state != LockState::Unlocked {
                        warn!(
                            target: "lockable",
                            requirement = %node,
                            state = requirement.state.name(),
                            "requirement not unlocked when locking"
                        );
                    }
                    let lock_signal = Signal::lock(LockAction::Lock);
                    requirement.state = LockState::Locking;
                    requirement.in_flight = Some(lock_signal.id);
                    out.send(*node, lock_signal);
                }
            }
            LockAction::Unlock => {
                if self.state != LockState::Locked {
                    out.send(source, Signal::error(id, codes::NOT_LOCKED));
                    return;
                }
                if self.owner != Some(source) {
                    out.send(source, Signal::error(id, codes::NOT_LOCKED));
                    return;
                }
                if self.requirements.is_empty() {
                    self.state = LockState::Unlocked;
                    self.owner = None;
                    self.pending_owner = None;
                    out.change("state");
                    out.change("owner");
                    out.send(source, Signal::success(id));
                    return;
                }
                self.state = LockState::Unlocking;
                self.request_id = Some(id);
                self.pending_owner = None;
                out.change("state");
                for (node, requirement) in &mut self.requirements {
                    if requirement.state != LockState::Locked {
                        warn!(
                            target: "lockable",
                            requirement = %node,
                            state = requirement.state.name(),
                            "requirement not locked when unlocking"
                        );
                    }
                    let unlock_signal = Signal::lock(LockAction::Unlock);
                    requirement.state = LockState::Unlocking;
                    requirement.in_flight = Some(unlock_signal.id);
                    out.send(*node, unlock_signal);
                }
            }
        }
    }

    fn handle_success(
        &mut self,
        env: &ProcessEnv<'_>,
        source: NodeId,
        req_id: Uuid,
        out: &mut ProcessOutput,
    ) {
        if source == env.node_id {
            return;
        }
        let Some(requirement) = self.requirements.get_mut(&source) else {
            debug!(target: "lockable", requirement = %source, "success from non-requirement");
            return;
        };
        if requirement.in_flight != Some(req_id) {
            debug!(
                target: "lockable",
                requirement = %source,
                response = %req_id,
                "success for a request that is not in flight"
            );
            return;
        }

        match requirement.state {
            LockState::Locking => match self.state {
                LockState::Locking => {
                    requirement.state = LockState::Locked;
                    requirement.in_flight = None;
                    out.change("requirements");
                    if self.all_requirements(LockState::Locked) {
                        self.state = LockState::Locked;
                        self.owner = self.pending_owner;
                        out.change("state");
                        out.change("owner");
                        let owner = self.owner.expect("lock completed with no pending owner");
                        let request_id = self
                            .request_id
                            .take()
                            .expect("lock completed with no request id");
                        debug!(target: "lockable", node = %env.node_id, "whole lock");
                        out.send(owner, Signal::success(request_id));
                    } else {
                        debug!(target: "lockable", node = %env.node_id, "partial lock");
                    }
                }
                LockState::AbortingLock => {
                    // This requirement locked after the abort began; release
                    // it again.
                    let unlock_signal = Signal::lock(LockAction::Unlock);
                    requirement.state = LockState::Unlocking;
                    requirement.in_flight = Some(unlock_signal.id);
                    out.send(source, unlock_signal);
                }
                _ => {
                    debug!(
                        target: "lockable",
                        state = self.state.name(),
                        "stale lock success ignored"
                    );
                }
            },
            LockState::Unlocking => {
                requirement.state = LockState::Unlocked;
                requirement.in_flight = None;
                out.change("requirements");
                self.finish_release(env, out);
            }
            _ => {
                debug!(
                    target: "lockable",
                    requirement = %source,
                    state = requirement.state.name(),
                    "success for requirement with no transaction"
                );
            }
        }
    }

    fn handle_error(
        &mut self,
        env: &ProcessEnv<'_>,
        source: NodeId,
        req_id: Uuid,
        code: &str,
        out: &mut ProcessOutput,
    ) {
        let Some(requirement) = self.requirements.get_mut(&source) else {
            debug!(target: "lockable", requirement = %source, code, "error from non-requirement");
            return;
        };
        if requirement.in_flight != Some(req_id) {
            debug!(
                target: "lockable",
                requirement = %source,
                response = %req_id,
                code,
                "error for a request that is not in flight"
            );
            return;
        }

        if requirement.state == LockState::Unlocking && code == codes::NOT_LOCKED {
            // We only send unlocks for locks we believe we hold; the
            // requirement disagreeing means local state is corrupt.
            panic!("requirement {source} reported not_locked for a held lock");
        }

        match requirement.state {
            LockState::Locking => {
                requirement.state = LockState::Unlocked;
                requirement.in_flight = None;
                out.change("requirements");
                if self.state == LockState::Locking {
                    self.state = LockState::AbortingLock;
                    // The pending acquirer owns the rollback until it
                    // resolves; owner stays non-null for the whole abort.
                    self.owner = self.pending_owner;
                    out.change("state");
                    out.change("owner");
                    for (node, other) in &mut self.requirements {
                        if other.state == LockState::Locked {
                            let unlock_signal = Signal::lock(LockAction::Unlock);
                            other.state = LockState::Unlocking;
                            other.in_flight = Some(unlock_signal.id);
                            debug!(
                                target: "lockable",
                                requirement = %node,
                                "abort unlock sent"
                            );
                            out.send(*node, unlock_signal);
                        }
                    }
                }
                self.finish_release(env, out);
            }
            LockState::Unlocking => {
                warn!(
                    target: "lockable",
                    requirement = %source,
                    code,
                    "requirement failed to unlock"
                );
            }
            _ => {
                debug!(
                    target: "lockable",
                    requirement = %source,
                    code,
                    "error for requirement with no transaction"
                );
            }
        }
    }

    /// Completes an `Unlocking` or `AbortingLock` transaction once every
    /// requirement has drained back to `Unlocked`.
    fn finish_release(&mut self, env: &ProcessEnv<'_>, out: &mut ProcessOutput) {
        if !self.all_requirements(LockState::Unlocked) {
            debug!(target: "lockable", node = %env.node_id, "partial unlock");
            return;
        }
        match self.state {
            LockState::Unlocking => {
                self.state = LockState::Unlocked;
                out.change("state");
                out.change("owner");
                let previous_owner = self.owner.take().expect("unlock completed with no owner");
                let request_id = self
                    .request_id
                    .take()
                    .expect("unlock completed with no request id");
                self.pending_owner = None;
                debug!(target: "lockable", node = %env.node_id, "whole unlock");
                out.send(previous_owner, Signal::success(request_id));
            }
            LockState::AbortingLock => {
                self.state = LockState::Unlocked;
                self.owner = None;
                out.change("state");
                out.change("owner");
                let pending_owner = self
                    .pending_owner
                    .take()
                    .expect("lock abort completed with no pending owner");
                let request_id = self
                    .request_id
                    .take()
                    .expect("lock abort completed with no request id");
                debug!(target: "lockable", node = %env.node_id, "lock aborted");
                out.send(
                    pending_owner,
                    Signal::error(request_id, codes::NOT_UNLOCKED),
                );
            }
            _ => {}
        }
    }

    /// Serializes one readable field.
    #[must_use]
    pub fn read_field(&self, name: &str) -> Option<SerializedValue> {
        let mut w = ValueWriter::new();
        match name {
            "state" => w.push_string(self.state.name()),
            "owner" => w.push_option_node_id(self.owner),
            "pending_owner" => w.push_option_node_id(self.pending_owner),
            "requirements" => {
                let names: Vec<String> =
                    self.requirements.keys().map(ToString::to_string).collect();
                w.push_string_list(names.iter().map(String::as_str));
            }
            _ => return None,
        }
        Some(w.finish())
    }

    /// Serializes the persistent state.
    #[must_use]
    pub fn to_value(&self) -> SerializedValue {
        let t = value_tags();
        let mut w = ValueWriter::new();
        w.push_u8(self.state.as_u8());
        w.push_option_node_id(self.owner);
        w.push_option_node_id(self.pending_owner);
        w.push_option_uuid(self.request_id);
        w.tag(t.map);
        w.tag(t.node_id);
        w.tag(t.u8_);
        w.tag(t.option);
        w.tag(t.uuid);
        w.raw_u64(self.requirements.len() as u64);
        for (node, requirement) in &self.requirements {
            w.raw_node_id(*node);
            w.raw_u8(requirement.state.as_u8());
            w.raw_flag(requirement.in_flight.is_some());
            if let Some(id) = requirement.in_flight {
                w.raw_uuid(id);
            }
        }
        w.finish()
    }

    /// Rebuilds the state from storage.
    ///
    /// # Errors
    ///
    /// Any [`WireError`] from the decoder, including unknown state bytes.
    pub fn from_value(value: &SerializedValue) -> Result<Self, WireError> {
        let t = value_tags();
        let mut r = ValueReader::new(value);
        let state_byte = r.take_u8("lockable state")?;
        let state = LockState::from_u8(state_byte).ok_or(WireError::BadEnumByte {
            context: "lockable state",
            value: state_byte,
        })?;
        let owner = r.take_option_node_id("lockable owner")?;
        let pending_owner = r.take_option_node_id("lockable pending owner")?;
        let request_id = r.take_option_uuid("lockable request id")?;
        r.expect_tag(t.map, "lockable requirements")?;
        r.expect_tag(t.node_id, "lockable requirements")?;
        r.expect_tag(t.u8_, "lockable requirements")?;
        r.expect_tag(t.option, "lockable requirements")?;
        r.expect_tag(t.uuid, "lockable requirements")?;
        let count = r.raw_u64("lockable requirements")? as usize;
        let mut requirements = BTreeMap::new();
        for _ in 0..count {
            let node = r.raw_node_id("requirement node")?;
            let req_state_byte = r.raw_u8("requirement state")?;
            let req_state = LockState::from_u8(req_state_byte).ok_or(WireError::BadEnumByte {
                context: "requirement state",
                value: req_state_byte,
            })?;
            let in_flight = if r.raw_flag("requirement in flight")? {
                Some(r.raw_uuid("requirement in flight id")?)
            } else {
                None
            };
            requirements.insert(
                node,
                Requirement {
                    state: req_state,
                    in_flight,
                },
            );
        }
        r.finish()?;
        Ok(Self {
            state,
            owner,
            pending_owner,
            request_id,
            requirements,
        })
    }
}
