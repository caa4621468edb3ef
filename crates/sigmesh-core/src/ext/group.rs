//! Group membership extension.
//!
//! A group node holds declared subgroup names and a member map
//! (node id → subgroup name). Membership is the substrate the
//! `MemberOf` policy evaluates against: every change is published into the
//! shared [`GroupIndex`](crate::policy::GroupIndex) read model, which only
//! this node's task writes.

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use super::{ProcessEnv, ProcessOutput};
use crate::crypto::NodeId;
use crate::signal::{codes, Direction, Signal, SignalBody};
use crate::wire::{value_tags, SerializedValue, ValueReader, ValueWriter, WireError};

/// The group extension state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupExt {
    /// Declared subgroup names.
    pub subgroups: BTreeSet<String>,
    /// Member node → subgroup name.
    pub members: BTreeMap<NodeId, String>,
}

impl GroupExt {
    /// Creates a group with the given members already present.
    ///
    /// Each member's subgroup is declared implicitly.
    #[must_use]
    pub fn new<I: IntoIterator<Item = (NodeId, String)>>(members: I) -> Self {
        let members: BTreeMap<NodeId, String> = members.into_iter().collect();
        let subgroups = members.values().cloned().collect();
        Self { subgroups, members }
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
            SignalBody::AddSubGroup { name } => {
                if self.subgroups.contains(name) {
                    out.send(source, Signal::error(signal.id, codes::ALREADY_SUBGROUP));
                } else {
                    self.subgroups.insert(name.clone());
                    debug!(target: "group", node = %env.node_id, subgroup = %name, "subgroup added");
                    out.change("subgroups");
                    out.send(source, Signal::success(signal.id));
                }
            }
            SignalBody::AddMember { subgroup, member } => {
                if !self.subgroups.contains(subgroup) {
                    out.send(source, Signal::error(signal.id, codes::NOT_SUBGROUP));
                } else if self.members.contains_key(member) {
                    out.send(source, Signal::error(signal.id, codes::ALREADY_MEMBER));
                } else {
                    self.members.insert(*member, subgroup.clone());
                    env.groups.publish(env.node_id, self.members.clone());
                    debug!(
                        target: "group",
                        node = %env.node_id,
                        member = %member,
                        subgroup = %subgroup,
                        "member added"
                    );
                    out.change("members");
                    out.send(source, Signal::success(signal.id));
                }
            }
            SignalBody::RemoveMember { member } => {
                if self.members.remove(member).is_none() {
                    out.send(source, Signal::error(signal.id, codes::NOT_MEMBER));
                } else {
                    env.groups.publish(env.node_id, self.members.clone());
                    debug!(target: "group", node = %env.node_id, member = %member, "member removed");
                    out.change("members");
                    out.send(source, Signal::success(signal.id));
                }
            }
            _ => {}
        }
        out
    }

    /// Publishes membership into the shared read model on node load.
    pub fn load(&mut self, env: &ProcessEnv<'_>) {
        env.groups.publish(env.node_id, self.members.clone());
    }

    /// Withdraws membership from the shared read model on node unload.
    pub fn unload(&mut self, env: &ProcessEnv<'_>) {
        env.groups.forget(env.node_id);
    }

    /// Serializes one readable field.
    #[must_use]
    pub fn read_field(&self, name: &str) -> Option<SerializedValue> {
        let t = value_tags();
        let mut w = ValueWriter::new();
        match name {
            "subgroups" => {
                w.push_string_list(self.subgroups.iter().map(String::as_str));
            }
            "members" => {
                w.tag(t.map);
                w.tag(t.node_id);
                w.tag(t.string);
                w.raw_u64(self.members.len() as u64);
                for (member, subgroup) in &self.members {
                    w.raw_node_id(*member);
                    w.raw_string(subgroup);
                }
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
        w.push_string_list(self.subgroups.iter().map(String::as_str));
        w.tag(t.map);
        w.tag(t.node_id);
        w.tag(t.string);
        w.raw_u64(self.members.len() as u64);
        for (member, subgroup) in &self.members {
            w.raw_node_id(*member);
            w.raw_string(subgroup);
        }
        w.finish()
    }

    /// Rebuilds the state from storage.
    ///
    /// # Errors
    ///
    /// Any [`WireError`] from the decoder.
    pub fn from_value(value: &SerializedValue) -> Result<Self, WireError> {
        let t = value_tags();
        let mut r = ValueReader::new(value);
        let subgroups = r.take_string_list("group subgroups")?.into_iter().collect();
        r.expect_tag(t.map, "group members")?;
        r.expect_tag(t.node_id, "group members")?;
        r.expect_tag(t.string, "group members")?;
        let count = r.raw_u64("group members")? as usize;
        let mut members = BTreeMap::new();
        for _ in 0..count {
            let member = r.raw_node_id("group member")?;
            let subgroup = r.raw_string("group member subgroup")?;
            members.insert(member, subgroup);
        }
        r.finish()?;
        Ok(Self { subgroups, members })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::crypto::NodeKey;
    use crate::policy::GroupIndex;
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
                node_type: NodeType::new("GROUP"),
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
    fn subgroup_then_member_flow() {
        let fx = Fixture::new();
        let mut ext = GroupExt::default();
        let caller = id();
        let member = id();

        let declare = Signal::add_subgroup("test_group");
        let out = ext.process(&fx.env(), caller, &declare);
        assert!(matches!(reply(&out), SignalBody::Success { .. }));

        let join = Signal::add_member("test_group", member);
        let out = ext.process(&fx.env(), caller, &join);
        assert!(matches!(reply(&out), SignalBody::Success { .. }));
        assert_eq!(ext.members[&member], "test_group");

        // The read model sees the change immediately.
        assert_eq!(
            fx.groups.member_name(fx.node_id, member),
            Some("test_group".to_string())
        );
    }

    #[test]
    fn duplicate_subgroup_is_refused() {
        let fx = Fixture::new();
        let mut ext = GroupExt::default();
        let caller = id();
        ext.process(&fx.env(), caller, &Signal::add_subgroup("crew"));
        let out = ext.process(&fx.env(), caller, &Signal::add_subgroup("crew"));
        assert!(matches!(
            reply(&out),
            SignalBody::Error { code, .. } if code == codes::ALREADY_SUBGROUP
        ));
    }

    #[test]
    fn member_requires_declared_subgroup() {
        let fx = Fixture::new();
        let mut ext = GroupExt::default();
        let out = ext.process(&fx.env(), id(), &Signal::add_member("ghost", id()));
        assert!(matches!(
            reply(&out),
            SignalBody::Error { code, .. } if code == codes::NOT_SUBGROUP
        ));
    }

    #[test]
    fn duplicate_member_is_refused() {
        let fx = Fixture::new();
        let mut ext = GroupExt::default();
        let member = id();
        ext.process(&fx.env(), id(), &Signal::add_subgroup("crew"));
        ext.process(&fx.env(), id(), &Signal::add_member("crew", member));
        let out = ext.process(&fx.env(), id(), &Signal::add_member("crew", member));
        assert!(matches!(
            reply(&out),
            SignalBody::Error { code, .. } if code == codes::ALREADY_MEMBER
        ));
    }

    #[test]
    fn remove_member_updates_read_model() {
        let fx = Fixture::new();
        let mut ext = GroupExt::default();
        let member = id();
        ext.process(&fx.env(), id(), &Signal::add_subgroup("crew"));
        ext.process(&fx.env(), id(), &Signal::add_member("crew", member));

        let out = ext.process(&fx.env(), id(), &Signal::remove_member(member));
        assert!(matches!(reply(&out), SignalBody::Success { .. }));
        assert_eq!(fx.groups.member_name(fx.node_id, member), None);

        let out = ext.process(&fx.env(), id(), &Signal::remove_member(member));
        assert!(matches!(
            reply(&out),
            SignalBody::Error { code, .. } if code == codes::NOT_MEMBER
        ));
    }

    #[test]
    fn load_publishes_and_unload_forgets() {
        let fx = Fixture::new();
        let member = id();
        let mut ext = GroupExt::new([(member, "crew".to_string())]);

        ext.load(&fx.env());
        assert_eq!(
            fx.groups.member_name(fx.node_id, member),
            Some("crew".to_string())
        );

        ext.unload(&fx.env());
        assert_eq!(fx.groups.member_name(fx.node_id, member), None);
    }

    #[test]
    fn state_round_trips_through_storage() {
        let ext = GroupExt::new([
            (id(), "crew".to_string()),
            (id(), "officers".to_string()),
        ]);
        let restored = GroupExt::from_value(&ext.to_value()).expect("decode group");
        assert_eq!(ext, restored);
    }
}
