//! End-to-end statement sessions between two nodes on an in-memory network.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use proofnet::core::{Keypair, Person, PersonDetails, StatementBuilder, StatementKind, Uuid};
use proofnet::store::MemoryStore;
use proofnet::sync::{LockConfig, LoopDialogType, MemoryNetwork, SyncConfig};
use proofnet::{ConnectionHandle, Node, NodeConfig, NodeId, SessionOutcome, SessionStage};

fn addr(host: u8) -> SocketAddr {
    SocketAddr::from(([10, 0, 0, host], 7400))
}

fn node(network: &Arc<MemoryNetwork>, host: u8) -> Node {
    let mut config = NodeConfig::new(NodeId::from_bytes([host; 16]));
    config.sync = SyncConfig {
        dialog_budget_ms: 5_000,
        idle_timeout_ms: 10_000,
        lock: LockConfig {
            base_timeout_ms: 20,
            jitter_ms: 20,
        },
        ..SyncConfig::default()
    };
    Node::new(
        config,
        Arc::new(MemoryStore::new()),
        Arc::new(network.transport(addr(host))),
    )
}

async fn reach(handle: &ConnectionHandle, mut done: impl FnMut(&SessionStage) -> bool) {
    let mut stage = handle.stage();
    tokio::time::timeout(Duration::from_secs(10), stage.wait_for(|s| done(s)))
        .await
        .expect("stage not reached in time")
        .expect("connection state dropped");
}

fn report(outcome: SessionOutcome) -> proofnet::sync::ConnectionReport {
    match outcome {
        SessionOutcome::Statement(report) => report,
        other => panic!("expected a statement session, got {other:?}"),
    }
}

#[tokio::test]
async fn test_subscription_loop_and_clean_valediction() -> anyhow::Result<()> {
    proofnet::logging::init_with("proofnet=debug");
    let network = MemoryNetwork::new();
    let a = node(&network, 1);
    let b = node(&network, 2);
    let mut server = b.serve(network.listen(addr(2)).await);

    let first = StatementBuilder::root_context().build();
    let nested = StatementBuilder::new(StatementKind::Context).context(first.uuid).build();
    let axiom = StatementBuilder::new(StatementKind::Axiom).context(nested.uuid).build();
    let second = StatementBuilder::root_context().build();
    let lemma = StatementBuilder::new(StatementKind::Declaration)
        .context(second.uuid)
        .depends_on(axiom.uuid)
        .build();
    a.put_statements(vec![
        first.clone(),
        nested.clone(),
        axiom.clone(),
        second.clone(),
        lemma.clone(),
    ])
    .await?;
    b.subscribe(first.uuid, true).await?;

    let dialer = a.connect(addr(2), Some(b.id())).await?;
    let acceptor = server.next().await.expect("acceptor handle");

    // The initial pass pulls the first root context.
    reach(&acceptor, |s| matches!(s, SessionStage::Loop { .. })).await;
    for uuid in [first.uuid, nested.uuid, axiom.uuid] {
        assert!(b.statement(&uuid).await?.is_some());
    }
    assert!(b.statement(&lemma.uuid).await?.is_none());

    // A new subscription runs one loop iteration.
    b.subscribe(second.uuid, true).await?;
    reach(&dialer, |s| matches!(s, SessionStage::Loop { completed } if *completed >= 1)).await;
    assert!(b.statement(&second.uuid).await?.is_some());
    assert!(b.statement(&lemma.uuid).await?.is_some());

    dialer.request_valediction();
    let dialer_state = Arc::clone(dialer.state());
    let acceptor_state = Arc::clone(acceptor.state());
    let ra = report(dialer.join().await?);
    let rb = report(acceptor.join().await?);

    assert!(ra.valediction && rb.valediction);
    assert_eq!(ra.peer, b.id());
    assert_eq!(rb.peer, a.id());
    assert_eq!(ra.dialogs, vec![LoopDialogType::StatementSubscription]);
    assert_eq!(ra.dialogs, rb.dialogs);
    assert_eq!(rb.statements_received, 5);
    assert_eq!(ra.remote_contexts, [first.uuid, second.uuid].into_iter().collect());

    for state in [&dialer_state, &acceptor_state] {
        assert!(state.remote().is_empty());
        assert!(state.pending().is_empty());
        assert_eq!(*state.stage().borrow(), SessionStage::Closed);
    }
    server.shutdown();
    Ok(())
}

#[tokio::test]
async fn test_persons_pushed_while_looping() -> anyhow::Result<()> {
    let network = MemoryNetwork::new();
    let a = node(&network, 1);
    let b = node(&network, 2);
    let mut server = b.serve(network.listen(addr(2)).await);

    let kp = Keypair::generate();
    let uuid = Uuid::new_v4();
    a.put_person(Person::signed(uuid, &kp, PersonDetails::nick("before"), 1))
        .await?;

    let dialer = a.connect(addr(2), None).await?;
    let acceptor = server.next().await.expect("acceptor handle");
    reach(&acceptor, |s| matches!(s, SessionStage::Loop { .. })).await;
    assert_eq!(b.person(&uuid).await?.map(|p| p.version()), Some(proofnet::core::PersonInfoVersion::Signed(1)));

    let renamed = Person::signed(uuid, &kp, PersonDetails::nick("after"), 2);
    a.put_person(renamed.clone()).await?;
    reach(&acceptor, |s| matches!(s, SessionStage::Loop { completed } if *completed >= 1)).await;
    assert_eq!(b.person(&uuid).await?, Some(renamed));

    acceptor.request_valediction();
    let ra = report(dialer.join().await?);
    assert!(ra.dialogs.contains(&LoopDialogType::Persons));
    report(acceptor.join().await?);
    Ok(())
}

#[tokio::test]
async fn test_signature_request_sub_root() -> anyhow::Result<()> {
    let network = MemoryNetwork::new();
    let a = node(&network, 1);
    let b = node(&network, 2);
    let _server = b.serve(network.listen(addr(2)).await);

    let root = StatementBuilder::root_context().build();
    let axiom = StatementBuilder::new(StatementKind::Axiom).context(root.uuid).build();
    b.put_statements(vec![root.clone(), axiom.clone()]).await?;

    let request = proofnet::SignatureRequest::new(root.uuid, vec![axiom.uuid], "please sign");
    assert!(a.request_signatures(addr(2), Some(b.id()), request.clone()).await?);
    assert_eq!(b.signature_requests().await?, vec![request.clone()]);

    // Already known.
    assert!(!a.request_signatures(addr(2), Some(b.id()), request).await?);

    // References a statement the responder lacks.
    let unknown = proofnet::SignatureRequest::new(root.uuid, vec![Uuid::new_v4()], "");
    assert!(!a.request_signatures(addr(2), Some(b.id()), unknown).await?);
    assert_eq!(b.signature_requests().await?.len(), 1);
    Ok(())
}
