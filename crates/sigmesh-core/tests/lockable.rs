//! End-to-end tests of the two-phase locking protocol over the fabric.

use std::collections::BTreeMap;
use std::time::Duration;

use sigmesh_core::config::RuntimeConfig;
use sigmesh_core::context::Context;
use sigmesh_core::crypto::{NodeId, NodeKey};
use sigmesh_core::ext::{ExtKind, ExtensionSlot, ListenerExt, LockableExt, SignalReceiver};
use sigmesh_core::policy::{Policy, Tree};
use sigmesh_core::signal::{
    wait_for_response, wait_for_signal, Direction, LinkAction, LockAction, Signal, SignalBody,
    SignalKind,
};
use sigmesh_core::types::NodeType;
use sigmesh_core::wire::ValueReader;

const WAIT: Duration = Duration::from_millis(500);

struct Fabric {
    ctx: Context,
    node_type: NodeType,
}

impl Fabric {
    fn new(config: RuntimeConfig) -> Self {
        let ctx = Context::new(config).expect("context");
        let node_type = ctx
            .register_node_type(
                "TEST_LOCKABLE",
                vec![ExtKind::Listener.ext_type(), ExtKind::Lockable.ext_type()],
            )
            .expect("register test node type");
        Self { ctx, node_type }
    }

    fn lockable(
        &self,
        key: Option<NodeKey>,
        policies: Vec<Policy>,
        requirements: Vec<NodeId>,
        buffer: usize,
    ) -> (NodeKey, NodeId, SignalReceiver) {
        let key = key.unwrap_or_else(NodeKey::generate);
        let (listener, feed) = ListenerExt::channel(buffer);
        let id = self
            .ctx
            .new_node(
                Some(key.clone()),
                self.node_type,
                policies,
                vec![
                    ExtensionSlot::Listener(listener),
                    ExtensionSlot::Lockable(LockableExt::new(requirements)),
                ],
            )
            .expect("lockable node");
        (key, id, feed)
    }
}

fn allow(principal: NodeId) -> Vec<Policy> {
    vec![Policy::PerNode(BTreeMap::from([(principal, Tree::leaf())]))]
}

fn allow_everyone() -> Vec<Policy> {
    vec![Policy::AllNodes(Tree::leaf())]
}

async fn read_lock_state(
    fabric: &Fabric,
    reader_key: &NodeKey,
    reader_feed: &mut SignalReceiver,
    target: NodeId,
) -> (String, Option<NodeId>) {
    let read = Signal::read(BTreeMap::from([(
        ExtKind::Lockable.ext_type(),
        vec!["state".to_string(), "owner".to_string()],
    )]));
    let req = fabric
        .ctx
        .send_as(reader_key, target, read)
        .expect("send read");
    let (response, _) = wait_for_response(reader_feed, WAIT, req)
        .await
        .expect("read result");
    let SignalBody::ReadResult { fields, .. } = &response.body else {
        panic!("expected read result, got {response}");
    };
    let values = &fields[&ExtKind::Lockable.ext_type()];
    let mut state = ValueReader::new(&values["state"]);
    let mut owner = ValueReader::new(&values["owner"]);
    (
        state.take_string("state").expect("state string"),
        owner.take_option_node_id("owner").expect("owner option"),
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn link_add_and_remove_control_fan_out() {
    let fabric = Fabric::new(RuntimeConfig::default());
    let (l1_key, l1, mut l1_feed) = fabric.lockable(None, Vec::new(), Vec::new(), 256);
    let (_, l2, mut l2_feed) = fabric.lockable(None, allow(l1), Vec::new(), 256);

    let add = fabric
        .ctx
        .send_as(&l1_key, l1, Signal::link(LinkAction::Add, l2))
        .expect("send link add");
    let (response, _) = wait_for_response(&mut l1_feed, WAIT, add)
        .await
        .expect("link add response");
    assert!(matches!(response.body, SignalBody::Success { .. }));

    // A Down signal now reaches the requirement.
    let mut probe = Signal::start();
    probe.direction = Direction::Down;
    let probe_id = probe.id;
    fabric.ctx.send_as(&l1_key, l1, probe).expect("send probe");
    let forwarded = wait_for_signal(&mut l2_feed, WAIT, |s| s.id == probe_id)
        .await
        .expect("probe forwarded to requirement");
    assert_eq!(forwarded.kind(), SignalKind::Start);

    let remove = fabric
        .ctx
        .send_as(&l1_key, l1, Signal::link(LinkAction::Remove, l2))
        .expect("send link remove");
    let (response, _) = wait_for_response(&mut l1_feed, WAIT, remove)
        .await
        .expect("link remove response");
    assert!(matches!(response.body, SignalBody::Success { .. }));

    // After removal the requirement no longer sees broadcasts.
    let mut probe = Signal::start();
    probe.direction = Direction::Down;
    let probe_id = probe.id;
    fabric.ctx.send_as(&l1_key, l1, probe).expect("send probe");
    assert!(
        wait_for_signal(&mut l2_feed, Duration::from_millis(100), |s| s.id == probe_id)
            .await
            .is_err(),
        "removed requirement must not receive broadcasts"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn duplicate_link_replies_already_requirement() {
    let fabric = Fabric::new(RuntimeConfig::default());
    let (l1_key, l1, mut l1_feed) = fabric.lockable(None, Vec::new(), Vec::new(), 256);
    let (_, l2, _l2_feed) = fabric.lockable(None, allow(l1), Vec::new(), 256);

    let first = fabric
        .ctx
        .send_as(&l1_key, l1, Signal::link(LinkAction::Add, l2))
        .expect("send");
    wait_for_response(&mut l1_feed, WAIT, first)
        .await
        .expect("first add succeeds");

    let second = fabric
        .ctx
        .send_as(&l1_key, l1, Signal::link(LinkAction::Add, l2))
        .expect("send");
    let (response, _) = wait_for_response(&mut l1_feed, WAIT, second)
        .await
        .expect("second add answered");
    assert!(matches!(
        &response.body,
        SignalBody::Error { code, .. } if code == "already_requirement"
    ));

    let missing = fabric
        .ctx
        .send_as(
            &l1_key,
            l1,
            Signal::link(LinkAction::Remove, NodeKey::generate().node_id()),
        )
        .expect("send");
    let (response, _) = wait_for_response(&mut l1_feed, WAIT, missing)
        .await
        .expect("remove answered");
    assert!(matches!(
        &response.body,
        SignalBody::Error { code, .. } if code == "not_requirement"
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn lock_acquires_every_requirement() {
    let fabric = Fabric::new(RuntimeConfig::default());
    let root_key = NodeKey::generate();
    let root_id = root_key.node_id();

    let mut requirements = Vec::new();
    for _ in 0..4 {
        let (_, req, _feed) = fabric.lockable(None, allow(root_id), Vec::new(), 256);
        requirements.push(req);
    }
    let (root_key, root, mut root_feed) =
        fabric.lockable(Some(root_key), allow_everyone(), requirements.clone(), 256);

    let lock = fabric
        .ctx
        .send_as(&root_key, root, Signal::lock(LockAction::Lock))
        .expect("send lock");
    let (response, _) = wait_for_response(&mut root_feed, WAIT, lock)
        .await
        .expect("lock outcome");
    assert!(matches!(response.body, SignalBody::Success { .. }));

    // Every requirement is locked and owned by the root.
    for req in &requirements {
        let (state, owner) = read_lock_state(&fabric, &root_key, &mut root_feed, *req).await;
        assert_eq!(state, "locked");
        assert_eq!(owner, Some(root));
    }

    let unlock = fabric
        .ctx
        .send_as(&root_key, root, Signal::lock(LockAction::Unlock))
        .expect("send unlock");
    let (response, _) = wait_for_response(&mut root_feed, WAIT, unlock)
        .await
        .expect("unlock outcome");
    assert!(matches!(response.body, SignalBody::Success { .. }));

    for req in &requirements {
        let (state, owner) = read_lock_state(&fabric, &root_key, &mut root_feed, *req).await;
        assert_eq!(state, "unlocked");
        assert_eq!(owner, None);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_owners_get_exactly_one_lock() {
    let fabric = Fabric::new(RuntimeConfig::default());
    let (_, shared, _sf) = fabric.lockable(None, allow_everyone(), Vec::new(), 256);
    let (a_key, _, mut a_feed) = fabric.lockable(None, Vec::new(), Vec::new(), 256);
    let (b_key, _, mut b_feed) = fabric.lockable(None, Vec::new(), Vec::new(), 256);

    let a_req = fabric
        .ctx
        .send_as(&a_key, shared, Signal::lock(LockAction::Lock))
        .expect("a lock");
    let b_req = fabric
        .ctx
        .send_as(&b_key, shared, Signal::lock(LockAction::Lock))
        .expect("b lock");

    let (a_response, _) = wait_for_response(&mut a_feed, WAIT, a_req)
        .await
        .expect("a outcome");
    let (b_response, _) = wait_for_response(&mut b_feed, WAIT, b_req)
        .await
        .expect("b outcome");

    let a_won = matches!(a_response.body, SignalBody::Success { .. });
    let b_won = matches!(b_response.body, SignalBody::Success { .. });
    assert_ne!(a_won, b_won, "exactly one owner must win");
    let loser = if a_won { &b_response } else { &a_response };
    assert!(matches!(
        &loser.body,
        SignalBody::Error { code, .. } if code == "not_unlocked"
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_lock_restores_acquired_requirements() {
    let fabric = Fabric::new(RuntimeConfig::default());
    let root_key = NodeKey::generate();

    // r1 accepts; r2 is pre-held by another owner.
    let (_, r1, _r1f) = fabric.lockable(None, allow_everyone(), Vec::new(), 256);
    let (_, r2, _r2f) = fabric.lockable(None, allow_everyone(), Vec::new(), 256);
    let (holder_key, _, mut holder_feed) = fabric.lockable(None, Vec::new(), Vec::new(), 256);

    let held = fabric
        .ctx
        .send_as(&holder_key, r2, Signal::lock(LockAction::Lock))
        .expect("pre-hold r2");
    let (response, _) = wait_for_response(&mut holder_feed, WAIT, held)
        .await
        .expect("r2 held");
    assert!(matches!(response.body, SignalBody::Success { .. }));

    let (root_key, root, mut root_feed) =
        fabric.lockable(Some(root_key), allow_everyone(), vec![r1, r2], 256);

    let lock = fabric
        .ctx
        .send_as(&root_key, root, Signal::lock(LockAction::Lock))
        .expect("send lock");
    let (response, _) = wait_for_response(&mut root_feed, WAIT, lock)
        .await
        .expect("lock refused");
    assert!(matches!(
        &response.body,
        SignalBody::Error { code, .. } if code == "not_unlocked"
    ));

    // r1 was acquired during the attempt and must be restored.
    let (state, owner) = read_lock_state(&fabric, &root_key, &mut root_feed, r1).await;
    assert_eq!(state, "unlocked");
    assert_eq!(owner, None);

    // r2 still belongs to its original holder.
    let (state, owner) = read_lock_state(&fabric, &root_key, &mut root_feed, r2).await;
    assert_eq!(state, "locked");
    assert_eq!(owner, Some(holder_key.node_id()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn lock_fans_out_to_a_thousand_requirements() {
    let mut config = RuntimeConfig::default();
    config.mailbox_capacity = 4096;
    let fabric = Fabric::new(config);

    let root_key = NodeKey::generate();
    let root_id = root_key.node_id();
    let child_policy = vec![Policy::PerNode(BTreeMap::from([(root_id, Tree::leaf())]))];

    let mut requirements = Vec::with_capacity(1000);
    for _ in 0..1000 {
        let (_, req, _feed) = fabric.lockable(None, child_policy.clone(), Vec::new(), 8);
        requirements.push(req);
    }

    let (root_key, root, mut root_feed) =
        fabric.lockable(Some(root_key), allow_everyone(), requirements, 4096);

    let lock = fabric
        .ctx
        .send_as(&root_key, root, Signal::lock(LockAction::Lock))
        .expect("send lock");
    let (response, _) = wait_for_response(&mut root_feed, Duration::from_secs(1), lock)
        .await
        .expect("whole lock within a second");
    assert!(matches!(response.body, SignalBody::Success { .. }));
}
