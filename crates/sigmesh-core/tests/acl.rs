//! End-to-end tests of policy admission: delegated ACL evaluation, proxy
//! chains, timeouts, and group-membership policies.

use std::collections::BTreeMap;
use std::time::Duration;

use sigmesh_core::config::RuntimeConfig;
use sigmesh_core::context::Context;
use sigmesh_core::crypto::{NodeId, NodeKey};
use sigmesh_core::ext::{AclExt, ExtensionSlot, GroupExt, ListenerExt, SignalReceiver};
use sigmesh_core::policy::{Policy, Tree};
use sigmesh_core::signal::{wait_for_response, wait_for_signal, Signal, SignalBody, SignalKind};
use sigmesh_core::types::NodeType;

const WAIT: Duration = Duration::from_millis(500);

fn listener_node(
    ctx: &Context,
    policies: Vec<Policy>,
) -> (NodeKey, NodeId, SignalReceiver) {
    let key = NodeKey::generate();
    let (listener, feed) = ListenerExt::channel(256);
    let id = ctx
        .new_node(
            Some(key.clone()),
            NodeType::new("LISTENER"),
            policies,
            vec![ExtensionSlot::Listener(listener)],
        )
        .expect("listener node");
    (key, id, feed)
}

fn acl_node(ctx: &Context, policies: Vec<Policy>) -> NodeId {
    ctx.new_node(
        None,
        NodeType::new("ACL"),
        vec![Policy::DefaultAcl],
        vec![ExtensionSlot::Acl(AclExt::new(policies))],
    )
    .expect("acl node")
}

/// Asks `proxy` whether `principal` may exercise `action` and returns the
/// response observed on the requester's feed.
async fn query_acl(
    ctx: &Context,
    requester_key: &NodeKey,
    requester_feed: &mut SignalReceiver,
    proxy: NodeId,
    principal: NodeId,
    action: Tree,
) -> SignalBody {
    let req = ctx
        .send_as(requester_key, proxy, Signal::acl(principal, action))
        .expect("send acl query");
    let (response, _) = wait_for_response(requester_feed, WAIT, req)
        .await
        .expect("acl response");
    response.body
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn acl_node_denies_then_grants() {
    let ctx = Context::new(RuntimeConfig::default()).expect("context");
    let (requester_key, requester, mut feed) = listener_node(&ctx, Vec::new());

    // No policies: denied.
    let empty = acl_node(&ctx, Vec::new());
    let response = query_acl(
        &ctx,
        &requester_key,
        &mut feed,
        empty,
        requester,
        Tree::tags([7]),
    )
    .await;
    assert!(matches!(
        &response,
        SignalBody::Error { code, .. } if code == "acl_denied"
    ));

    // An all-nodes policy flips the same query to success.
    let open = acl_node(&ctx, vec![Policy::AllNodes(Tree::leaf())]);
    let response = query_acl(
        &ctx,
        &requester_key,
        &mut feed,
        open,
        requester,
        Tree::tags([7]),
    )
    .await;
    assert!(matches!(response, SignalBody::Success { .. }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn proxy_chain_resolves_through_downstream_policy() {
    let ctx = Context::new(RuntimeConfig::default()).expect("context");
    let (requester_key, requester, mut feed) = listener_node(&ctx, Vec::new());

    // A proxy whose only policy delegates to a second proxy that grants.
    let granting = acl_node(&ctx, vec![Policy::AllNodes(Tree::leaf())]);
    let delegating = acl_node(&ctx, vec![Policy::AclProxy(vec![granting])]);
    let response = query_acl(
        &ctx,
        &requester_key,
        &mut feed,
        delegating,
        requester,
        Tree::tags([7]),
    )
    .await;
    assert!(matches!(response, SignalBody::Success { .. }));

    // Delegating to a proxy with no policies denies.
    let empty = acl_node(&ctx, Vec::new());
    let dead_end = acl_node(&ctx, vec![Policy::AclProxy(vec![empty])]);
    let response = query_acl(
        &ctx,
        &requester_key,
        &mut feed,
        dead_end,
        requester,
        Tree::tags([7]),
    )
    .await;
    assert!(matches!(
        &response,
        SignalBody::Error { code, .. } if code == "acl_denied"
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unresolvable_delegation_times_out() {
    let mut config = RuntimeConfig::default();
    config.acl_timeout = Duration::from_millis(100);
    let ctx = Context::new(config).expect("context");
    let (requester_key, requester, mut feed) = listener_node(&ctx, Vec::new());

    // The proxy delegates to a node that does not exist, so no answer can
    // ever arrive and the window must close the request.
    let unreachable = NodeKey::generate().node_id();
    let stuck = acl_node(&ctx, vec![Policy::AclProxy(vec![unreachable])]);
    let response = query_acl(
        &ctx,
        &requester_key,
        &mut feed,
        stuck,
        requester,
        Tree::tags([7]),
    )
    .await;
    assert!(matches!(
        &response,
        SignalBody::Error { code, .. } if code == "acl_timeout"
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn proxy_policy_on_a_node_gates_inbound_signals() {
    let ctx = Context::new(RuntimeConfig::default()).expect("context");
    let (requester_key, _, mut requester_feed) = listener_node(&ctx, Vec::new());

    let granting = acl_node(&ctx, vec![Policy::AllNodes(Tree::leaf())]);
    let (_, guarded, mut guarded_feed) =
        listener_node(&ctx, vec![Policy::AclProxy(vec![granting])]);

    // The signal is parked, the proxy grants, and dispatch proceeds.
    let start = ctx
        .send_as(&requester_key, guarded, Signal::start())
        .expect("send start");
    let admitted = wait_for_signal(&mut guarded_feed, WAIT, |s| s.id == start)
        .await
        .expect("start admitted after proxy grant");
    assert_eq!(admitted.kind(), SignalKind::Start);

    // A denying proxy answers the sender with acl_denied.
    let denying = acl_node(&ctx, Vec::new());
    let (_, sealed, _sealed_feed) = listener_node(&ctx, vec![Policy::AclProxy(vec![denying])]);
    let refused = ctx
        .send_as(&requester_key, sealed, Signal::start())
        .expect("send start");
    let (response, _) = wait_for_response(&mut requester_feed, WAIT, refused)
        .await
        .expect("denial response");
    assert!(matches!(
        &response.body,
        SignalBody::Error { code, .. } if code == "acl_denied"
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn group_membership_gates_member_of_policy() {
    let ctx = Context::new(RuntimeConfig::default()).expect("context");
    let (member_key, member, mut member_feed) = listener_node(&ctx, Vec::new());

    // Group node: the member may manage subgroups and membership.
    let group = ctx
        .new_node(
            None,
            NodeType::new("GROUP"),
            vec![
                Policy::DefaultGroup,
                Policy::PerNode(BTreeMap::from([(
                    member,
                    Tree::tags([
                        SignalKind::AddSubGroup.signal_type().raw(),
                        SignalKind::AddMember.signal_type().raw(),
                    ]),
                )])),
            ],
            vec![ExtensionSlot::Group(GroupExt::default())],
        )
        .expect("group node");

    // A target guarded by membership in "test_group".
    let member_of = Policy::MemberOf(BTreeMap::from([(
        group,
        BTreeMap::from([("test_group".to_string(), Tree::leaf())]),
    )]));
    let (_, target, mut target_feed) = listener_node(&ctx, vec![member_of]);

    // Before membership exists the member is a stranger.
    let early = ctx
        .send_as(&member_key, target, Signal::start())
        .expect("send start");
    let (response, _) = wait_for_response(&mut member_feed, WAIT, early)
        .await
        .expect("denial");
    assert!(matches!(
        &response.body,
        SignalBody::Error { code, .. } if code == "acl_denied"
    ));

    // Declare the subgroup and join it.
    let declare = ctx
        .send_as(&member_key, group, Signal::add_subgroup("test_group"))
        .expect("send add subgroup");
    let (response, _) = wait_for_response(&mut member_feed, WAIT, declare)
        .await
        .expect("subgroup declared");
    assert!(matches!(response.body, SignalBody::Success { .. }));

    let join = ctx
        .send_as(&member_key, group, Signal::add_member("test_group", member))
        .expect("send add member");
    let (response, _) = wait_for_response(&mut member_feed, WAIT, join)
        .await
        .expect("member added");
    assert!(matches!(response.body, SignalBody::Success { .. }));

    // Membership now admits the member at the target.
    let late = ctx
        .send_as(&member_key, target, Signal::start())
        .expect("send start");
    let admitted = wait_for_signal(&mut target_feed, WAIT, |s| s.id == late)
        .await
        .expect("start admitted through membership");
    assert_eq!(admitted.kind(), SignalKind::Start);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn member_of_policy_works_behind_a_proxy() {
    let ctx = Context::new(RuntimeConfig::default()).expect("context");
    let (member_key, member, mut member_feed) = listener_node(&ctx, Vec::new());

    let group = ctx
        .new_node(
            None,
            NodeType::new("GROUP"),
            vec![
                Policy::DefaultGroup,
                Policy::PerNode(BTreeMap::from([(member, Tree::leaf())])),
            ],
            vec![ExtensionSlot::Group(GroupExt::default())],
        )
        .expect("group node");

    for (signal, what) in [
        (Signal::add_subgroup("crew"), "subgroup"),
        (Signal::add_member("crew", member), "member"),
    ] {
        let req = ctx.send_as(&member_key, group, signal).expect("send");
        let (response, _) = wait_for_response(&mut member_feed, WAIT, req)
            .await
            .unwrap_or_else(|e| panic!("{what}: {e}"));
        assert!(matches!(response.body, SignalBody::Success { .. }), "{what}");
    }

    // The proxy's own policy list consults the group's membership.
    let membership_proxy = acl_node(
        &ctx,
        vec![Policy::MemberOf(BTreeMap::from([(
            group,
            BTreeMap::from([("crew".to_string(), Tree::leaf())]),
        )]))],
    );

    let granted = query(&ctx, &member_key, &mut member_feed, membership_proxy, member).await;
    assert!(matches!(granted, SignalBody::Success { .. }));

    let stranger = NodeKey::generate().node_id();
    let denied = query(&ctx, &member_key, &mut member_feed, membership_proxy, stranger).await;
    assert!(matches!(
        &denied,
        SignalBody::Error { code, .. } if code == "acl_denied"
    ));
}

async fn query(
    ctx: &Context,
    key: &NodeKey,
    feed: &mut SignalReceiver,
    proxy: NodeId,
    principal: NodeId,
) -> SignalBody {
    let req = ctx
        .send_as(key, proxy, Signal::acl(principal, Tree::tags([7])))
        .expect("send acl query");
    let (response, _) = wait_for_response(feed, WAIT, req)
        .await
        .expect("acl response");
    response.body
}
