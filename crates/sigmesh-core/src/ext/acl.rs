//! Delegated ACL evaluation extension.
//!
//! An ACL proxy node carries this extension and a local policy list. When
//! another node delegates admission via an `AclProxy` policy, the proxy
//! receives `Acl(principal, required)`, re-evaluates against its own
//! policies, and answers `Success` or `Error("acl_denied")`.
//!
//! A proxy may itself delegate to further proxies, so evaluation can pend
//! here too. Proxy graphs are allowed to cycle; every pending evaluation
//! schedules one ACL timeout tick, which breaks the cycle by answering
//! `Error("acl_timeout")` when no downstream proxy resolves in the window.
//!
//! Pending evaluation state is runtime-only; only the policy list
//! persists.

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;
use uuid::Uuid;

use super::{ProcessEnv, ProcessOutput};
use crate::crypto::NodeId;
use crate::policy::{admit, Admission, EvalContext, Policy};
use crate::signal::{codes, Direction, Signal, SignalBody};
use crate::wire::{value_tags, SerializedValue, ValueReader, ValueWriter, WireError};

/// One delegated evaluation waiting on downstream proxies.
#[derive(Debug)]
struct Pending {
    /// Who asked us (reply address).
    requester: NodeId,
    /// Ids of the `Acl` queries still outstanding downstream.
    outstanding: BTreeSet<Uuid>,
}

/// The ACL extension state.
#[derive(Debug, Default)]
pub struct AclExt {
    /// The local policy list evaluated for delegated queries.
    pub policies: Vec<Policy>,
    /// Pending evaluations, keyed by the incoming query id.
    pending: BTreeMap<Uuid, Pending>,
    /// Downstream query id → incoming query id.
    downstream: BTreeMap<Uuid, Uuid>,
}

impl AclExt {
    /// Creates an ACL extension over the given policies.
    #[must_use]
    pub fn new(policies: Vec<Policy>) -> Self {
        Self {
            policies,
            pending: BTreeMap::new(),
            downstream: BTreeMap::new(),
        }
    }

    /// Dispatch entry point.
    pub fn process(
        &mut self,
        env: &ProcessEnv<'_>,
        source: NodeId,
        signal: &Signal,
    ) -> ProcessOutput {
        let mut out = ProcessOutput::none();
        if signal.direction != Direction::Direct {
            return out;
        }
        match &signal.body {
            SignalBody::Acl {
                principal,
                required,
            } => {
                let ctx = EvalContext {
                    principal: *principal,
                    node: env.node_id,
                    groups: env.groups,
                    own_members: None,
                };
                match admit(&self.policies, required, &ctx) {
                    Admission::Granted => {
                        debug!(target: "acl", node = %env.node_id, principal = %principal, "delegated grant");
                        out.send(source, Signal::success(signal.id));
                    }
                    Admission::Denied => {
                        debug!(target: "acl", node = %env.node_id, principal = %principal, "delegated deny");
                        out.send(source, Signal::error(signal.id, codes::ACL_DENIED));
                    }
                    Admission::Deferred(proxies) => {
                        let mut outstanding = BTreeSet::new();
                        for proxy in proxies {
                            let query = Signal::acl(*principal, required.clone());
                            self.downstream.insert(query.id, signal.id);
                            outstanding.insert(query.id);
                            out.send(proxy, query);
                        }
                        self.pending.insert(
                            signal.id,
                            Pending {
                                requester: source,
                                outstanding,
                            },
                        );
                        out.timer(signal.id, env.config.acl_timeout);
                        debug!(
                            target: "acl",
                            node = %env.node_id,
                            principal = %principal,
                            "delegated evaluation deferred downstream"
                        );
                    }
                }
            }
            SignalBody::Success { req_id } => {
                if let Some(upstream) = self.downstream.remove(req_id) {
                    if let Some(pending) = self.pending.remove(&upstream) {
                        for other in &pending.outstanding {
                            self.downstream.remove(other);
                        }
                        out.send(pending.requester, Signal::success(upstream));
                    }
                }
            }
            SignalBody::Error { req_id, .. } => {
                if let Some(upstream) = self.downstream.remove(req_id) {
                    if let Some(pending) = self.pending.get_mut(&upstream) {
                        pending.outstanding.remove(req_id);
                        if pending.outstanding.is_empty() {
                            let pending = self
                                .pending
                                .remove(&upstream)
                                .expect("pending entry present");
                            out.send(pending.requester, Signal::error(upstream, codes::ACL_DENIED));
                        }
                    }
                }
            }
            SignalBody::AclTimeout { req_id } => {
                if let Some(pending) = self.pending.remove(req_id) {
                    for other in &pending.outstanding {
                        self.downstream.remove(other);
                    }
                    debug!(target: "acl", node = %env.node_id, query = %req_id, "delegated evaluation timed out");
                    out.send(pending.requester, Signal::error(*req_id, codes::ACL_TIMEOUT));
                }
            }
            _ => {}
        }
        out
    }

    /// Serializes one readable field.
    #[must_use]
    pub fn read_field(&self, name: &str) -> Option<SerializedValue> {
        let mut w = ValueWriter::new();
        match name {
            "policies" => {
                let names: Vec<&str> = self.policies.iter().map(|p| p.kind().name()).collect();
                w.push_string_list(names);
            }
            _ => return None,
        }
        Some(w.finish())
    }

    /// Serializes the persistent state (the policy list).
    #[must_use]
    pub fn to_value(&self) -> SerializedValue {
        let t = value_tags();
        let mut w = ValueWriter::new();
        w.tag(t.vec);
        w.tag(t.value);
        w.raw_u64(self.policies.len() as u64);
        for policy in &self.policies {
            w.raw_value(&policy.to_value());
        }
        w.finish()
    }

    /// Rebuilds the state from storage with no pending evaluations.
    ///
    /// # Errors
    ///
    /// Any [`WireError`] from the decoder.
    pub fn from_value(value: &SerializedValue) -> Result<Self, WireError> {
        let t = value_tags();
        let mut r = ValueReader::new(value);
        r.expect_tag(t.vec, "acl policies")?;
        r.expect_tag(t.value, "acl policies")?;
        let count = r.raw_u64("acl policies")? as usize;
        let mut policies = Vec::new();
        for _ in 0..count {
            let nested = r.raw_value("acl policy")?;
            policies.push(Policy::from_value(&nested)?);
        }
        r.finish()?;
        Ok(Self::new(policies))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::crypto::NodeKey;
    use crate::policy::{GroupIndex, Tree};
    use crate::types::NodeType;

    struct Fixture {
        config: RuntimeConfig,
        groups: GroupIndex,
        node_id: NodeId,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                config: RuntimeConfig::default(),
                groups: GroupIndex::new(),
                node_id: NodeKey::generate().node_id(),
            }
        }

        fn env(&self) -> ProcessEnv<'_> {
            ProcessEnv {
                node_id: self.node_id,
                node_type: NodeType::new("BASE"),
                config: &self.config,
                groups: &self.groups,
            }
        }
    }

    fn id() -> NodeId {
        NodeKey::generate().node_id()
    }

    fn reply(out: &ProcessOutput) -> &SignalBody {
        &out.messages.first().expect("reply present").signal.body
    }

    #[test]
    fn empty_policy_list_denies() {
        let fx = Fixture::new();
        let mut ext = AclExt::new(Vec::new());
        let requester = id();
        let query = Signal::acl(id(), Tree::tags([1]));
        let out = ext.process(&fx.env(), requester, &query);
        assert!(matches!(
            reply(&out),
            SignalBody::Error { req_id, code } if *req_id == query.id && code == codes::ACL_DENIED
        ));
    }

    #[test]
    fn all_nodes_policy_grants() {
        let fx = Fixture::new();
        let mut ext = AclExt::new(vec![Policy::AllNodes(Tree::leaf())]);
        let query = Signal::acl(id(), Tree::tags([1]));
        let out = ext.process(&fx.env(), id(), &query);
        assert!(matches!(
            reply(&out),
            SignalBody::Success { req_id } if *req_id == query.id
        ));
    }

    #[test]
    fn nested_proxy_defers_and_resolves_on_success() {
        let fx = Fixture::new();
        let downstream_proxy = id();
        let mut ext = AclExt::new(vec![Policy::AclProxy(vec![downstream_proxy])]);
        let requester = id();
        let query = Signal::acl(id(), Tree::tags([1]));

        let out = ext.process(&fx.env(), requester, &query);
        assert_eq!(out.messages.len(), 1);
        assert_eq!(out.messages[0].dest, downstream_proxy);
        assert_eq!(out.timers.len(), 1);
        let downstream_id = out.messages[0].signal.id;

        let resolved = ext.process(&fx.env(), downstream_proxy, &Signal::success(downstream_id));
        assert!(matches!(
            reply(&resolved),
            SignalBody::Success { req_id } if *req_id == query.id
        ));
        assert_eq!(resolved.messages[0].dest, requester);
    }

    #[test]
    fn all_downstream_denials_deny() {
        let fx = Fixture::new();
        let (p1, p2) = (id(), id());
        let mut ext = AclExt::new(vec![Policy::AclProxy(vec![p1, p2])]);
        let requester = id();
        let query = Signal::acl(id(), Tree::tags([1]));

        let out = ext.process(&fx.env(), requester, &query);
        let ids: Vec<Uuid> = out.messages.iter().map(|m| m.signal.id).collect();

        let first = ext.process(&fx.env(), p1, &Signal::error(ids[0], codes::ACL_DENIED));
        assert!(first.messages.is_empty());

        let second = ext.process(&fx.env(), p2, &Signal::error(ids[1], codes::ACL_DENIED));
        assert!(matches!(
            reply(&second),
            SignalBody::Error { req_id, code } if *req_id == query.id && code == codes::ACL_DENIED
        ));
    }

    #[test]
    fn timeout_answers_acl_timeout() {
        let fx = Fixture::new();
        let mut ext = AclExt::new(vec![Policy::AclProxy(vec![id()])]);
        let requester = id();
        let query = Signal::acl(id(), Tree::tags([1]));
        ext.process(&fx.env(), requester, &query);

        let out = ext.process(&fx.env(), fx.node_id, &Signal::acl_timeout(query.id));
        assert!(matches!(
            reply(&out),
            SignalBody::Error { req_id, code } if *req_id == query.id && code == codes::ACL_TIMEOUT
        ));

        // A late downstream response finds nothing pending.
        let late = ext.process(&fx.env(), id(), &Signal::success(Uuid::new_v4()));
        assert!(late.messages.is_empty());
    }

    #[test]
    fn policies_round_trip_pending_does_not() {
        let fx = Fixture::new();
        let mut ext = AclExt::new(vec![
            Policy::AllNodes(Tree::tags([9])),
            Policy::AclProxy(vec![id()]),
        ]);
        // Create pending state that must not persist.
        ext.process(&fx.env(), id(), &Signal::acl(id(), Tree::tags([1])));
        assert!(!ext.pending.is_empty());

        let restored = AclExt::from_value(&ext.to_value()).expect("decode acl");
        assert_eq!(restored.policies, ext.policies);
        assert!(restored.pending.is_empty());
    }
}
