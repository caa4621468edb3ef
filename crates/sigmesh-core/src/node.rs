//! The per-node run loop.
//!
//! Every node is owned by exactly one task, which holds the node's state
//! and is the only reader of its mailbox. The loop pulls a message (or a
//! locally scheduled deadline tick), verifies the envelope signature,
//! resolves the effective principal, evaluates policy, and dispatches the
//! signal to each extension in declaration order. Nothing else ever
//! touches node state, so no step of the loop contends on locks and no
//! suspension happens mid-dispatch.
//!
//! Denied signals may pend instead of failing when an `AclProxy` policy
//! delegates the decision: the original message parks in the pending
//! table, proxy queries go out, and exactly one ACL timeout deadline is
//! armed. A proxy grant releases the parked message through the normal
//! dispatch path; refusals and the deadline answer the sender with
//! `acl_denied` / `acl_timeout`.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::context::Shared;
use crate::crypto::{NodeId, NodeKey};
use crate::ext::{ExtensionSlot, ProcessEnv, ProcessOutput};
use crate::message::Message;
use crate::policy::{admit, Admission, EvalContext, Policy, Tree};
use crate::signal::{codes, Signal, SignalBody};
use crate::store::NodeRecord;
use crate::types::NodeType;

/// A message parked while proxies decide its admission.
struct PendingAdmission {
    message: Message,
    outstanding: HashSet<Uuid>,
    deadline: Instant,
}

/// What a scheduled deadline means when it fires.
enum Deadline {
    /// A parked admission (keyed by the parked signal's id) expired.
    Admission(Uuid),
    /// An extension asked for an `AclTimeout(req_id)` tick.
    ExtTimer(Uuid),
}

enum Flow {
    Continue,
    Stop,
}

pub(crate) struct NodeState {
    pub(crate) id: NodeId,
    pub(crate) key: NodeKey,
    pub(crate) node_type: NodeType,
    pub(crate) policies: Vec<Policy>,
    pub(crate) extensions: Vec<ExtensionSlot>,
    version: u64,
    stopping: bool,
    pending: HashMap<Uuid, PendingAdmission>,
    /// Proxy query id → parked signal id.
    outstanding: HashMap<Uuid, Uuid>,
    deadlines: BTreeMap<(Instant, Uuid), Deadline>,
}

impl NodeState {
    pub(crate) fn new(
        key: NodeKey,
        node_type: NodeType,
        policies: Vec<Policy>,
        extensions: Vec<ExtensionSlot>,
    ) -> Self {
        Self {
            id: key.node_id(),
            key,
            node_type,
            policies,
            extensions,
            version: 0,
            stopping: false,
            pending: HashMap::new(),
            outstanding: HashMap::new(),
            deadlines: BTreeMap::new(),
        }
    }

    pub(crate) fn from_record(record: NodeRecord, extensions: Vec<ExtensionSlot>) -> Self {
        Self::new(record.key, record.node_type, record.policies, extensions)
    }

    fn env<'a>(&self, shared: &'a Shared) -> ProcessEnv<'a> {
        ProcessEnv {
            node_id: self.id,
            node_type: self.node_type,
            config: &shared.config,
            groups: &shared.groups,
        }
    }

    fn own_members(&self) -> Option<&BTreeMap<NodeId, String>> {
        self.extensions.iter().find_map(|slot| match slot {
            ExtensionSlot::Group(group) => Some(&group.members),
            _ => None,
        })
    }

    /// Runs load hooks; called once when the node enters the context.
    pub(crate) fn load(&mut self, shared: &Shared) {
        let env = self.env(shared);
        for slot in &mut self.extensions {
            slot.load(&env);
        }
    }

    /// The node task: owns the state until stop or channel close.
    pub(crate) async fn run(mut self, shared: Arc<Shared>, mut rx: mpsc::Receiver<Message>) {
        debug!(target: "node", node = %self.id, "run loop started");
        loop {
            let next = self.deadlines.keys().next().map(|(at, _)| *at);
            let parked = next.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));
            tokio::select! {
                received = rx.recv() => match received {
                    Some(message) => {
                        if matches!(self.handle_message(&shared, &mut rx, message), Flow::Stop) {
                            break;
                        }
                    }
                    None => break,
                },
                () = sleep_until(parked), if next.is_some() => {
                    self.fire_deadlines(&shared);
                }
            }
        }
        debug!(target: "node", node = %self.id, "run loop finished");
    }

    fn handle_message(
        &mut self,
        shared: &Arc<Shared>,
        rx: &mut mpsc::Receiver<Message>,
        message: Message,
    ) -> Flow {
        if let Err(err) = message.verify() {
            warn!(target: "node", node = %self.id, %err, "dropping message with bad signature");
            let reply = Message::new(
                message.sender_id(),
                &self.key,
                Signal::error(message.signal.id, codes::SIGNATURE_INVALID),
            );
            self.route(shared, vec![reply]);
            return Flow::Continue;
        }

        // Responses to our own proxy queries resolve parked admissions and
        // never reach the extensions.
        if let Some(req_id) = message.signal.response_id() {
            if self.outstanding.contains_key(&req_id) {
                let granted = matches!(message.signal.body, SignalBody::Success { .. });
                self.resolve_admission(shared, rx, req_id, granted);
                return Flow::Continue;
            }
        }

        let principal = message.principal();
        let admitted = if principal == self.id {
            // A node (or an external holder of its key) may do anything to
            // itself.
            true
        } else {
            match message.signal.permission() {
                // Locally synthesized ticks can never be granted remotely.
                None => false,
                Some(required) => {
                    if message.signal.response_id().is_some() {
                        // Responses correlate to requests this node already
                        // made; admitting them structurally is the default
                        // ACL rule.
                        true
                    } else {
                        let ctx = EvalContext {
                            principal,
                            node: self.id,
                            groups: &shared.groups,
                            own_members: self.own_members(),
                        };
                        match admit(&self.policies, &required, &ctx) {
                            Admission::Granted => true,
                            Admission::Denied => false,
                            Admission::Deferred(proxies) => {
                                self.park(shared, message, &required, principal, proxies);
                                return Flow::Continue;
                            }
                        }
                    }
                }
            }
        };

        if !admitted {
            debug!(
                target: "node",
                node = %self.id,
                principal = %principal,
                signal = %message.signal,
                "signal denied"
            );
            let reply = Message::new(
                message.sender_id(),
                &self.key,
                Signal::error(message.signal.id, codes::ACL_DENIED),
            );
            self.route(shared, vec![reply]);
            return Flow::Continue;
        }

        self.deliver(shared, rx, &message)
    }

    /// Parks a denied message while proxies evaluate it.
    fn park(
        &mut self,
        shared: &Arc<Shared>,
        message: Message,
        required: &Tree,
        principal: NodeId,
        proxies: Vec<NodeId>,
    ) {
        let key = message.signal.id;
        let deadline = Instant::now() + shared.config.acl_timeout;
        let mut queries = Vec::new();
        let mut outstanding = HashSet::new();
        for proxy in proxies {
            let query = Signal::acl(principal, required.clone());
            self.outstanding.insert(query.id, key);
            outstanding.insert(query.id);
            queries.push(Message::new(proxy, &self.key, query));
        }
        debug!(
            target: "node",
            node = %self.id,
            principal = %principal,
            queries = queries.len(),
            "admission deferred to proxies"
        );
        self.pending.insert(
            key,
            PendingAdmission {
                message,
                outstanding,
                deadline,
            },
        );
        self.deadlines
            .insert((deadline, key), Deadline::Admission(key));
        self.route(shared, queries);
    }

    fn resolve_admission(
        &mut self,
        shared: &Arc<Shared>,
        rx: &mut mpsc::Receiver<Message>,
        query_id: Uuid,
        granted: bool,
    ) {
        let Some(key) = self.outstanding.remove(&query_id) else {
            return;
        };
        if granted {
            let Some(parked) = self.pending.remove(&key) else {
                return;
            };
            for other in &parked.outstanding {
                self.outstanding.remove(other);
            }
            self.deadlines.remove(&(parked.deadline, key));
            debug!(target: "node", node = %self.id, signal = %parked.message.signal, "proxy granted parked signal");
            let _ = self.deliver(shared, rx, &parked.message);
        } else if let Some(parked) = self.pending.get_mut(&key) {
            parked.outstanding.remove(&query_id);
            if parked.outstanding.is_empty() {
                let parked = self.pending.remove(&key).expect("pending entry present");
                self.deadlines.remove(&(parked.deadline, key));
                let reply = Message::new(
                    parked.message.sender_id(),
                    &self.key,
                    Signal::error(parked.message.signal.id, codes::ACL_DENIED),
                );
                self.route(shared, vec![reply]);
            }
        }
    }

    fn fire_deadlines(&mut self, shared: &Arc<Shared>) {
        let now = Instant::now();
        loop {
            let Some(((at, id), _)) = self.deadlines.first_key_value() else {
                break;
            };
            if *at > now {
                break;
            }
            let key = (*at, *id);
            let Some(deadline) = self.deadlines.remove(&key) else {
                break;
            };
            match deadline {
                Deadline::Admission(pending_key) => {
                    if let Some(parked) = self.pending.remove(&pending_key) {
                        for other in &parked.outstanding {
                            self.outstanding.remove(other);
                        }
                        debug!(
                            target: "node",
                            node = %self.id,
                            signal = %parked.message.signal,
                            "delegated admission timed out"
                        );
                        let reply = Message::new(
                            parked.message.sender_id(),
                            &self.key,
                            Signal::error(parked.message.signal.id, codes::ACL_TIMEOUT),
                        );
                        self.route(shared, vec![reply]);
                    }
                }
                Deadline::ExtTimer(req_id) => {
                    let tick = Signal::acl_timeout(req_id);
                    let output = self.dispatch(shared, self.id, &tick);
                    self.finish_dispatch(shared, output);
                }
            }
        }
    }

    /// Delivers an admitted message: node-level handling plus extension
    /// dispatch, persistence, and status propagation.
    fn deliver(
        &mut self,
        shared: &Arc<Shared>,
        rx: &mut mpsc::Receiver<Message>,
        message: &Message,
    ) -> Flow {
        let source = message.sender_id();
        let signal = &message.signal;

        let output = self.dispatch(shared, source, signal);

        let flow = match &signal.body {
            SignalBody::Stop => {
                self.stop(shared, rx, source, signal.id);
                Flow::Stop
            }
            SignalBody::Read { fields } => {
                let mut result = BTreeMap::new();
                for (ext_type, names) in fields {
                    if let Some(slot) = self
                        .extensions
                        .iter()
                        .find(|slot| slot.ext_type() == *ext_type)
                    {
                        result.insert(*ext_type, slot.read_fields(names));
                    } else {
                        debug!(
                            target: "node",
                            node = %self.id,
                            ext = %ext_type,
                            "read for extension this node does not carry"
                        );
                    }
                }
                let reply = Message::new(
                    source,
                    &self.key,
                    Signal::read_result(signal.id, self.id, self.node_type, result),
                );
                self.route(shared, vec![reply]);
                Flow::Continue
            }
            _ => Flow::Continue,
        };

        self.finish_dispatch(shared, output);
        flow
    }

    /// Runs the signal through every extension in declaration order.
    fn dispatch(&mut self, shared: &Arc<Shared>, source: NodeId, signal: &Signal) -> ProcessOutput {
        let env = self.env(shared);
        let mut merged = ProcessOutput::none();
        for slot in &mut self.extensions {
            let output = slot.process(&env, source, signal);
            merged.messages.extend(output.messages);
            merged.changes.merge(output.changes);
            merged.timers.extend(output.timers);
        }
        merged
    }

    /// Applies a dispatch result: timers, persistence + status on change,
    /// and outbound routing.
    fn finish_dispatch(&mut self, shared: &Arc<Shared>, output: ProcessOutput) {
        for timer in &output.timers {
            let at = Instant::now() + timer.fire_in;
            self.deadlines
                .insert((at, timer.req_id), Deadline::ExtTimer(timer.req_id));
        }

        let mut messages: Vec<Message> = output
            .messages
            .into_iter()
            .map(|outbound| Message::new(outbound.dest, &self.key, outbound.signal))
            .collect();

        if !output.changes.is_empty() {
            self.persist(shared);
            let status = Signal::status(self.id, output.changes);
            let follow_up = self.dispatch(shared, self.id, &status);
            if !follow_up.changes.is_empty() {
                debug!(
                    target: "node",
                    node = %self.id,
                    "status dispatch produced changes; not propagated again"
                );
            }
            messages.extend(
                follow_up
                    .messages
                    .into_iter()
                    .map(|outbound| Message::new(outbound.dest, &self.key, outbound.signal)),
            );
        }

        self.route(shared, messages);
    }

    fn route(&self, shared: &Arc<Shared>, messages: Vec<Message>) {
        if messages.is_empty() {
            return;
        }
        if let Err(err) = shared.send(messages) {
            warn!(target: "node", node = %self.id, %err, "outbound send failed");
        }
    }

    fn persist(&mut self, shared: &Arc<Shared>) {
        self.version += 1;
        let record = NodeRecord {
            node_type: self.node_type,
            key: self.key.clone(),
            policies: self.policies.clone(),
            extensions: self
                .extensions
                .iter()
                .map(|slot| (slot.kind(), slot.to_value()))
                .collect(),
        };
        match shared.store.write(self.id, &record.encode()) {
            Ok(()) => {
                debug!(target: "db", node = %self.id, version = self.version, "node persisted");
            }
            Err(err) => {
                error!(target: "db", node = %self.id, %err, "node persist failed");
            }
        }
    }

    /// Stop protocol: drain the mailbox, answer `Stopped`, persist, unload.
    fn stop(
        &mut self,
        shared: &Arc<Shared>,
        rx: &mut mpsc::Receiver<Message>,
        source: NodeId,
        stop_id: Uuid,
    ) {
        if self.stopping {
            return;
        }
        self.stopping = true;
        rx.close();

        // Drain what producers already enqueued; new sends fail at the
        // router once the handle disappears.
        while let Ok(message) = rx.try_recv() {
            let _ = self.handle_message(shared, rx, message);
        }

        let reply = Message::new(source, &self.key, Signal::stopped(stop_id, self.id));
        self.route(shared, vec![reply]);
        self.persist(shared);

        let env = self.env(shared);
        for slot in &mut self.extensions {
            slot.unload(&env);
        }
        shared.remove_node(self.id);
        debug!(target: "node", node = %self.id, "node stopped");
    }

    /// Emits the creation announcement to the node itself.
    pub(crate) fn creation_message(&self) -> Message {
        Message::new(self.id, &self.key, Signal::create())
    }

    /// Serializes the node's initial record.
    pub(crate) fn initial_record(&self) -> Vec<u8> {
        NodeRecord {
            node_type: self.node_type,
            key: self.key.clone(),
            policies: self.policies.clone(),
            extensions: self
                .extensions
                .iter()
                .map(|slot| (slot.kind(), slot.to_value()))
                .collect(),
        }
        .encode()
    }
}

