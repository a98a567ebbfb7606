//! Multi-node scenarios on loopback: discovery, delivery guarantees,
//! fault aggregation and departure.

use std::net::TcpListener as StdListener;
use std::sync::Arc;
use std::time::Duration;

use cluster_node::channel::{options, ChannelListener, GroupChannel, Reliability, SendFault};
use cluster_node::config::NodeConfig;
use cluster_node::lifecycle::startup::start_node;
use cluster_node::membership::{Member, MemberId, MembershipListener};

mod common;

use common::{eventually, node_config, within, Inbox, MemberLog};

const SETTLE: Duration = Duration::from_secs(3);

async fn node(config: NodeConfig, inbox: Arc<Inbox>, log: Arc<MemberLog>) -> GroupChannel {
    let listeners: Vec<Arc<dyn ChannelListener>> = vec![inbox];
    let membership: Vec<Arc<dyn MembershipListener>> = vec![log];
    start_node(config, listeners, membership).await.unwrap()
}

fn seeded(seed: &GroupChannel) -> NodeConfig {
    let mut config = node_config();
    config.membership.peers = vec![seed.membership().udp_addr().unwrap().to_string()];
    config
}

async fn converge(nodes: &[&GroupChannel]) {
    let expected = nodes.len() - 1;
    let ok = eventually(SETTLE, || nodes.iter().all(|n| n.members().len() == expected)).await;
    assert!(ok, "membership did not converge");
}

fn find(channel: &GroupChannel, id: MemberId) -> Member {
    channel
        .members()
        .into_iter()
        .find(|m| m.id == id)
        .expect("member known")
}

#[tokio::test]
async fn nodes_discover_each_other_through_a_seed() {
    let a_log = Arc::new(MemberLog::default());
    let a = node(node_config(), Arc::default(), a_log.clone()).await;
    let b = node(seeded(&a), Arc::default(), Arc::default()).await;
    let c = node(seeded(&a), Arc::default(), Arc::default()).await;

    // B and C only know A; A's heartbeats introduce them to each other.
    converge(&[&a, &b, &c]).await;
    assert!(b.members().iter().any(|m| m.id == c.local_member().id));

    let added: Vec<MemberId> = a_log.added.lock().unwrap().iter().map(|m| m.id).collect();
    assert!(added.contains(&b.local_member().id));
    assert!(added.contains(&c.local_member().id));

    c.stop().await;
    b.stop().await;
    a.stop().await;
}

#[tokio::test]
async fn ack_after_processing_reaches_listener() {
    let inbox = Arc::new(Inbox::default());
    let a = node(node_config(), inbox.clone(), Arc::default()).await;
    let b = node(seeded(&a), Arc::default(), Arc::default()).await;
    converge(&[&a, &b]).await;

    let target = find(&b, a.local_member().id);
    within(SETTLE, b.send(&[target], b"hello".to_vec(), Reliability::AckAfterProcessing, 0))
        .await
        .unwrap();
    assert_eq!(inbox.received(), vec![b"hello".to_vec()]);

    b.stop().await;
    a.stop().await;
}

#[tokio::test]
async fn processing_failure_becomes_a_fault_after_retry() {
    let inbox = Inbox::failing("disk full");
    let a = node(node_config(), inbox.clone(), Arc::default()).await;
    let b = node(seeded(&a), Arc::default(), Arc::default()).await;
    converge(&[&a, &b]).await;

    let target = find(&b, a.local_member().id);
    let err = within(SETTLE, b.send(&[target], b"x".to_vec(), Reliability::AckAfterProcessing, 0))
        .await
        .unwrap_err();

    let faults = err.faulty_members();
    assert_eq!(faults.len(), 1);
    assert_eq!(faults[0].member.id, a.local_member().id);
    assert_eq!(faults[0].cause, SendFault::Nack("disk full".into()));
    // First attempt plus one retry.
    assert_eq!(inbox.received().len(), 2);

    b.stop().await;
    a.stop().await;
}

#[tokio::test]
async fn ack_to_three_with_one_unreachable_reports_one_fault() {
    let a = node(node_config(), Arc::default(), Arc::default()).await;
    let b = node(seeded(&a), Arc::default(), Arc::default()).await;
    let c = node(seeded(&a), Arc::default(), Arc::default()).await;
    converge(&[&a, &b, &c]).await;

    let dead_port = {
        let spare = StdListener::bind("127.0.0.1:0").unwrap();
        spare.local_addr().unwrap().port()
    };
    let dead = Member::new(MemberId::new(), "127.0.0.1".parse().unwrap(), dead_port);
    let destinations = vec![
        find(&a, b.local_member().id),
        dead.clone(),
        find(&a, c.local_member().id),
    ];

    let err = within(SETTLE, a.send(&destinations, b"x".to_vec(), Reliability::Ack, 0))
        .await
        .unwrap_err();
    let faults = err.faulty_members();
    assert_eq!(faults.len(), 1);
    assert_eq!(faults[0].member.id, dead.id);

    c.stop().await;
    b.stop().await;
    a.stop().await;
}

#[tokio::test]
async fn zero_destinations_is_a_quiet_success() {
    let a = node(node_config(), Arc::default(), Arc::default()).await;

    a.send(&[], b"nobody".to_vec(), Reliability::Ack, 0).await.unwrap();
    a.broadcast(b"nobody".to_vec(), Reliability::AckAfterProcessing, 0)
        .await
        .unwrap();
    assert_eq!(a.sender().connected_peers(), 0);

    a.stop().await;
}

#[tokio::test]
async fn sending_to_self_is_rejected() {
    let a = node(node_config(), Arc::default(), Arc::default()).await;
    let me = a.local_member().clone();

    let err = a.send(&[me], b"loop".to_vec(), Reliability::None, 0).await.unwrap_err();
    assert!(matches!(err, cluster_node::ChannelError::SelfLoopback));

    a.stop().await;
}

#[tokio::test]
async fn leave_notice_removes_member_before_expiry() {
    let mut slow_expiry = node_config();
    slow_expiry.membership.expiration_ms = 30_000;
    let a_log = Arc::new(MemberLog::default());
    let a = node(slow_expiry, Arc::default(), a_log.clone()).await;

    let mut b_config = seeded(&a);
    b_config.membership.expiration_ms = 30_000;
    let b = node(b_config, Arc::default(), Arc::default()).await;
    converge(&[&a, &b]).await;

    let b_id = b.local_member().id;
    b.stop().await;

    assert!(eventually(Duration::from_secs(2), || a.members().is_empty()).await);
    let gone: Vec<MemberId> = a_log.gone.lock().unwrap().iter().map(|m| m.id).collect();
    assert_eq!(gone, vec![b_id]);

    a.stop().await;
}

#[tokio::test]
async fn compressed_payload_arrives_intact() {
    let mut a_config = node_config();
    a_config.interceptors.compression = true;
    let inbox = Arc::new(Inbox::default());
    let a = node(a_config, inbox.clone(), Arc::default()).await;

    let mut b_config = seeded(&a);
    b_config.interceptors.compression = true;
    b_config.interceptors.statistics = true;
    let b = node(b_config, Arc::default(), Arc::default()).await;
    converge(&[&a, &b]).await;

    let payload = vec![b'z'; 64 * 1024];
    let target = find(&b, a.local_member().id);
    within(
        SETTLE,
        b.send(&[target], payload.clone(), Reliability::Ack, options::COMPRESS),
    )
    .await
    .unwrap();

    assert!(eventually(SETTLE, || inbox.received().len() == 1).await);
    assert_eq!(inbox.received()[0], payload);

    b.stop().await;
    a.stop().await;
}
