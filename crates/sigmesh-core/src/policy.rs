//! Capability trees and the policy engine.
//!
//! Authorization is a tree-subsumption test. Every signal names the
//! capability it requires as a [`Tree`]; every policy produces a granted
//! tree for a given principal. A granted tree `G` covers a required tree
//! `T` iff, for every `(tag → subtree)` in `T`, `G` contains `tag` and
//! `G[tag]` covers `T[tag]` — with a leaf on `G`'s side absorbing any
//! subtree on `T`'s side. The model is default-deny: a signal is admitted
//! only if some policy on the receiving node grants its required tree.
//!
//! Evaluation is immediate for [`Policy::AllNodes`], [`Policy::PerNode`],
//! [`Policy::MemberOf`], [`Policy::DefaultAcl`] and
//! [`Policy::DefaultGroup`]. [`Policy::AclProxy`] defers: the receiving
//! node delegates the decision to proxy nodes over the signal fabric and
//! resolves the original message when a proxy answers (or the ACL timeout
//! fires).

use std::collections::{BTreeMap, HashMap};
use std::sync::{LazyLock, RwLock};

use crate::crypto::NodeId;
use crate::ext::ExtKind;
use crate::signal::SignalKind;
use crate::types::PolicyType;
use crate::wire::{value_tags, SerializedValue, ValueReader, ValueWriter, WireError};

/// A finite capability tree over 64-bit type tags.
///
/// The empty mapping is a leaf and denotes "unconditionally granted at
/// this level": `{A: {}}` grants everything under `A`, while `{A: {B: {}}}`
/// grants only `A → B`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tree(pub BTreeMap<u64, Tree>);

impl Tree {
    /// The leaf tree: grants (or requires) everything at this level.
    #[must_use]
    pub fn leaf() -> Self {
        Self(BTreeMap::new())
    }

    /// A tree with a single child.
    #[must_use]
    pub fn single(tag: u64, child: Self) -> Self {
        Self(BTreeMap::from([(tag, child)]))
    }

    /// A tree granting the given tags unconditionally.
    #[must_use]
    pub fn tags<I: IntoIterator<Item = u64>>(tags: I) -> Self {
        Self(tags.into_iter().map(|t| (t, Self::leaf())).collect())
    }

    /// Returns true when this tree is a leaf.
    #[must_use]
    pub fn is_leaf(&self) -> bool {
        self.0.is_empty()
    }

    /// Subsumption test: does this granted tree cover `required`?
    #[must_use]
    pub fn covers(&self, required: &Self) -> bool {
        if self.is_leaf() {
            return true;
        }
        required
            .0
            .iter()
            .all(|(tag, sub)| self.0.get(tag).is_some_and(|granted| granted.covers(sub)))
    }

    /// Tag-wise union. A leaf on either side absorbs the other subtree.
    pub fn merge(&mut self, other: &Self) {
        if self.is_leaf() && !other.is_leaf() {
            // A leaf already grants everything at this level; keep it.
            return;
        }
        for (tag, sub) in &other.0 {
            match self.0.get_mut(tag) {
                Some(existing) => {
                    if sub.is_leaf() {
                        *existing = Self::leaf();
                    } else if !existing.is_leaf() {
                        existing.merge(sub);
                    }
                }
                None => {
                    self.0.insert(*tag, sub.clone());
                }
            }
        }
    }
}

/// The closed set of policy variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PolicyKind {
    /// [`Policy::AllNodes`].
    AllNodes,
    /// [`Policy::PerNode`].
    PerNode,
    /// [`Policy::MemberOf`].
    MemberOf,
    /// [`Policy::AclProxy`].
    AclProxy,
    /// [`Policy::DefaultAcl`].
    DefaultAcl,
    /// [`Policy::DefaultGroup`].
    DefaultGroup,
}

impl PolicyKind {
    /// Every policy kind, in registration order.
    pub const ALL: [Self; 6] = [
        Self::AllNodes,
        Self::PerNode,
        Self::MemberOf,
        Self::AclProxy,
        Self::DefaultAcl,
        Self::DefaultGroup,
    ];

    /// The registered name of this kind.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::AllNodes => "ALL_NODES",
            Self::PerNode => "PER_NODE",
            Self::MemberOf => "MEMBER_OF",
            Self::AclProxy => "ACL_PROXY",
            Self::DefaultAcl => "DEFAULT_ACL",
            Self::DefaultGroup => "DEFAULT_GROUP",
        }
    }

    /// The wire/storage identity of this kind.
    #[must_use]
    pub fn policy_type(self) -> PolicyType {
        PolicyType::new(self.name())
    }
}

/// A node-attached authorization rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Policy {
    /// Grants the same tree to every principal.
    AllNodes(Tree),
    /// Grants a per-principal tree; absent principals are denied.
    PerNode(BTreeMap<NodeId, Tree>),
    /// Grants trees conditioned on group membership: for each
    /// `(group, name → tree)`, the tree applies when the group node
    /// currently lists the principal under that membership name.
    MemberOf(BTreeMap<NodeId, BTreeMap<String, Tree>>),
    /// Denies locally but delegates the decision to the listed ACL proxy
    /// nodes; the proxy's answer (or the ACL timeout) resolves the request.
    AclProxy(Vec<NodeId>),
    /// Grants ACL evaluation queries to every principal. Response signals
    /// correlated to a requester are admitted structurally by the node
    /// runtime and need no policy.
    DefaultAcl,
    /// Grants current members of this group node read access to the group
    /// membership.
    DefaultGroup,
}

impl Policy {
    /// Returns the kind discriminant of this policy.
    #[must_use]
    pub const fn kind(&self) -> PolicyKind {
        match self {
            Self::AllNodes(_) => PolicyKind::AllNodes,
            Self::PerNode(_) => PolicyKind::PerNode,
            Self::MemberOf(_) => PolicyKind::MemberOf,
            Self::AclProxy(_) => PolicyKind::AclProxy,
            Self::DefaultAcl => PolicyKind::DefaultAcl,
            Self::DefaultGroup => PolicyKind::DefaultGroup,
        }
    }

    /// Immediate evaluation: does this policy grant `required` to the
    /// principal in `ctx`? Deferred variants always answer `false` here.
    #[must_use]
    pub fn grants(&self, required: &Tree, ctx: &EvalContext<'_>) -> bool {
        match self {
            Self::AllNodes(granted) => granted.covers(required),
            Self::PerNode(map) => map
                .get(&ctx.principal)
                .is_some_and(|granted| granted.covers(required)),
            Self::MemberOf(map) => {
                let mut granted = Tree(BTreeMap::new());
                let mut any = false;
                for (group, names) in map {
                    let Some(member_name) = ctx.groups.member_name(*group, ctx.principal) else {
                        continue;
                    };
                    if let Some(tree) = names.get(&member_name) {
                        if !any {
                            granted = tree.clone();
                            any = true;
                        } else {
                            granted.merge(tree);
                        }
                    }
                }
                any && granted.covers(required)
            }
            Self::AclProxy(_) => false,
            Self::DefaultAcl => {
                Tree::tags([SignalKind::Acl.signal_type().raw()]).covers(required)
            }
            Self::DefaultGroup => {
                let is_member = ctx
                    .own_members
                    .is_some_and(|members| members.contains_key(&ctx.principal));
                is_member
                    && Tree::single(
                        SignalKind::Read.signal_type().raw(),
                        Tree::tags([ExtKind::Group.ext_type().raw()]),
                    )
                    .covers(required)
            }
        }
    }

    /// The proxy nodes this policy delegates to, if any.
    #[must_use]
    pub fn proxies(&self) -> &[NodeId] {
        match self {
            Self::AclProxy(proxies) => proxies,
            _ => &[],
        }
    }
}

static POLICY_KINDS: LazyLock<HashMap<u64, PolicyKind>> = LazyLock::new(|| {
    PolicyKind::ALL
        .iter()
        .map(|kind| (kind.policy_type().raw(), *kind))
        .collect()
});

/// Looks up a policy kind by its storage type hash.
#[must_use]
pub fn policy_kind_for(type_hash: u64) -> Option<PolicyKind> {
    POLICY_KINDS.get(&type_hash).copied()
}

impl Policy {
    /// Serializes this policy for storage. The first field is the policy
    /// type hash, so [`Policy::from_value`] is self-describing.
    #[must_use]
    pub fn to_value(&self) -> SerializedValue {
        let t = value_tags();
        let mut w = ValueWriter::new();
        w.push_u64(self.kind().policy_type().raw());
        match self {
            Self::AllNodes(tree) => w.push_tree(tree),
            Self::PerNode(map) => {
                w.tag(t.map);
                w.tag(t.node_id);
                w.tag(t.tree);
                w.raw_u64(map.len() as u64);
                for (node, tree) in map {
                    w.raw_node_id(*node);
                    w.raw_tree(tree);
                }
            }
            Self::MemberOf(map) => {
                w.tag(t.map);
                w.tag(t.node_id);
                w.tag(t.map);
                w.tag(t.string);
                w.tag(t.tree);
                w.raw_u64(map.len() as u64);
                for (group, names) in map {
                    w.raw_node_id(*group);
                    w.raw_u64(names.len() as u64);
                    for (name, tree) in names {
                        w.raw_string(name);
                        w.raw_tree(tree);
                    }
                }
            }
            Self::AclProxy(proxies) => {
                w.tag(t.vec);
                w.tag(t.node_id);
                w.raw_u64(proxies.len() as u64);
                for proxy in proxies {
                    w.raw_node_id(*proxy);
                }
            }
            Self::DefaultAcl | Self::DefaultGroup => {}
        }
        w.finish()
    }

    /// Rebuilds a policy from storage.
    ///
    /// # Errors
    ///
    /// [`WireError::UnknownPolicyType`] for an unregistered type hash, or
    /// any decoder error.
    pub fn from_value(value: &SerializedValue) -> Result<Self, WireError> {
        let t = value_tags();
        let mut r = ValueReader::new(value);
        let type_hash = r.take_u64("policy type")?;
        let kind = policy_kind_for(type_hash).ok_or(WireError::UnknownPolicyType(type_hash))?;
        let policy = match kind {
            PolicyKind::AllNodes => Self::AllNodes(r.take_tree("all-nodes tree")?),
            PolicyKind::PerNode => {
                r.expect_tag(t.map, "per-node map")?;
                r.expect_tag(t.node_id, "per-node map")?;
                r.expect_tag(t.tree, "per-node map")?;
                let count = r.raw_u64("per-node map")? as usize;
                let mut map = BTreeMap::new();
                for _ in 0..count {
                    let node = r.raw_node_id("per-node principal")?;
                    let tree = r.raw_tree("per-node tree")?;
                    map.insert(node, tree);
                }
                Self::PerNode(map)
            }
            PolicyKind::MemberOf => {
                r.expect_tag(t.map, "member-of map")?;
                r.expect_tag(t.node_id, "member-of map")?;
                r.expect_tag(t.map, "member-of map")?;
                r.expect_tag(t.string, "member-of map")?;
                r.expect_tag(t.tree, "member-of map")?;
                let count = r.raw_u64("member-of map")? as usize;
                let mut map = BTreeMap::new();
                for _ in 0..count {
                    let group = r.raw_node_id("member-of group")?;
                    let names_len = r.raw_u64("member-of names")? as usize;
                    let mut names = BTreeMap::new();
                    for _ in 0..names_len {
                        let name = r.raw_string("member-of name")?;
                        let tree = r.raw_tree("member-of tree")?;
                        names.insert(name, tree);
                    }
                    map.insert(group, names);
                }
                Self::MemberOf(map)
            }
            PolicyKind::AclProxy => {
                r.expect_tag(t.vec, "acl-proxy list")?;
                r.expect_tag(t.node_id, "acl-proxy list")?;
                let count = r.raw_u64("acl-proxy list")? as usize;
                let mut proxies = Vec::new();
                for _ in 0..count {
                    proxies.push(r.raw_node_id("acl-proxy node")?);
                }
                Self::AclProxy(proxies)
            }
            PolicyKind::DefaultAcl => Self::DefaultAcl,
            PolicyKind::DefaultGroup => Self::DefaultGroup,
        };
        r.finish()?;
        Ok(policy)
    }
}

/// Inputs to policy evaluation for one inbound signal.
pub struct EvalContext<'a> {
    /// The effective principal (authorization issuer, or message sender).
    pub principal: NodeId,
    /// The node the signal is addressed to.
    pub node: NodeId,
    /// Shared group-membership read model.
    pub groups: &'a GroupIndex,
    /// The receiving node's own group membership, when it carries a group
    /// extension ([`Policy::DefaultGroup`] reads it).
    pub own_members: Option<&'a BTreeMap<NodeId, String>>,
}

/// Outcome of evaluating a node's policy list against one signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Some policy granted the required tree.
    Granted,
    /// No policy granted and no proxy was available to ask.
    Denied,
    /// No policy granted locally; ask these proxy nodes.
    Deferred(Vec<NodeId>),
}

/// Evaluates `policies` in order and reports the admission outcome.
///
/// Grant short-circuits. When nothing grants, proxies from every
/// [`Policy::AclProxy`] are collected (in declaration order, deduplicated)
/// into [`Admission::Deferred`].
#[must_use]
pub fn admit(policies: &[Policy], required: &Tree, ctx: &EvalContext<'_>) -> Admission {
    for policy in policies {
        if policy.grants(required, ctx) {
            return Admission::Granted;
        }
    }

    let mut proxies: Vec<NodeId> = Vec::new();
    for policy in policies {
        for proxy in policy.proxies() {
            if !proxies.contains(proxy) {
                proxies.push(*proxy);
            }
        }
    }

    if proxies.is_empty() {
        Admission::Denied
    } else {
        Admission::Deferred(proxies)
    }
}

/// Shared read model of group membership, keyed by group node id.
///
/// Only the group node's own task writes its entry (on load and on every
/// membership change); policy evaluation on other nodes takes read locks.
#[derive(Debug, Default)]
pub struct GroupIndex {
    inner: RwLock<HashMap<NodeId, BTreeMap<NodeId, String>>>,
}

impl GroupIndex {
    /// Creates an empty index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the published membership of `group`.
    pub fn publish(&self, group: NodeId, members: BTreeMap<NodeId, String>) {
        self.inner
            .write()
            .expect("group index lock poisoned")
            .insert(group, members);
    }

    /// Drops the published membership of `group` (node unload).
    pub fn forget(&self, group: NodeId) {
        self.inner
            .write()
            .expect("group index lock poisoned")
            .remove(&group);
    }

    /// Returns the membership name of `member` in `group`, if any.
    #[must_use]
    pub fn member_name(&self, group: NodeId, member: NodeId) -> Option<String> {
        self.inner
            .read()
            .expect("group index lock poisoned")
            .get(&group)
            .and_then(|members| members.get(&member).cloned())
    }
}
