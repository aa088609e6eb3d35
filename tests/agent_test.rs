// tests/agent_test.rs
//! End-to-end agent tests over loopback UDP.
//!
//! Two agents are wired together with real sockets and reader tasks; the
//! tests then drive the public API the way an application would.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::time::{sleep, timeout};

use ice_agent::stun::{Attribute, AttributeType, AttributeValue, Message, MessageType};
use ice_agent::transport::{self, UdpConn};
use ice_agent::CandidateConn;
use ice_agent::{
    Agent, AgentConfig, Candidate, CandidateType, ConnectionState, NetworkType, COMPONENT_RTP,
};

fn setup_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("ice_agent=debug")
        .with_test_writer()
        .try_init();
}

/// Configuration with timers scaled down for tests
fn fast_config() -> AgentConfig {
    AgentConfig {
        check_interval: Some(Duration::from_millis(50)),
        ..Default::default()
    }
}

/// Lite agent configuration: host candidates only, fast timers so the
/// no-outbound-checks assertions cover several tick intervals
fn lite_config() -> AgentConfig {
    AgentConfig {
        lite: true,
        candidate_types: vec![CandidateType::Host],
        check_interval: Some(Duration::from_millis(50)),
        keepalive_interval: Some(Duration::from_millis(50)),
        ..Default::default()
    }
}

/// Bind a loopback UDP socket, register it as a host candidate and spawn
/// its reader task
async fn wire_host_candidate(agent: &Arc<Agent>) -> (Arc<Candidate>, SocketAddr) {
    let conn = UdpConn::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
    let addr = conn.local_addr().unwrap();
    let socket = conn.socket();

    let candidate = Arc::new(Candidate::new_host(
        addr,
        NetworkType::Udp4,
        COMPONENT_RTP,
        None,
    ));

    agent
        .add_local_candidate(candidate.clone(), Arc::new(conn))
        .await
        .unwrap();
    transport::spawn_udp_reader(agent.clone(), candidate.clone(), socket);

    (candidate, addr)
}

/// Exchange credentials and candidates, then start checks on both sides.
/// Returns ((controlling, its addr), (controlled, its addr)).
async fn connect_agents(
    config_a: AgentConfig,
    config_b: AgentConfig,
) -> ((Arc<Agent>, SocketAddr), (Arc<Agent>, SocketAddr)) {
    let agent_a = Agent::new(config_a).await.unwrap();
    let agent_b = Agent::new(config_b).await.unwrap();

    let (_cand_a, addr_a) = wire_host_candidate(&agent_a).await;
    let (_cand_b, addr_b) = wire_host_candidate(&agent_b).await;

    let (ufrag_a, pwd_a) = agent_a.get_local_user_credentials().await.unwrap();
    let (ufrag_b, pwd_b) = agent_b.get_local_user_credentials().await.unwrap();

    agent_a
        .add_remote_candidate(Arc::new(Candidate::new_host(
            addr_b,
            NetworkType::Udp4,
            COMPONENT_RTP,
            None,
        )))
        .unwrap();
    agent_b
        .add_remote_candidate(Arc::new(Candidate::new_host(
            addr_a,
            NetworkType::Udp4,
            COMPONENT_RTP,
            None,
        )))
        .unwrap();

    agent_a
        .start_connectivity_checks(true, ufrag_b, pwd_b)
        .await
        .unwrap();
    agent_b
        .start_connectivity_checks(false, ufrag_a, pwd_a)
        .await
        .unwrap();

    ((agent_a, addr_a), (agent_b, addr_b))
}

#[tokio::test]
async fn test_happy_path_controlling() {
    setup_test_logging();

    let agent_a = Agent::new(fast_config()).await.unwrap();
    let agent_b = Agent::new(fast_config()).await.unwrap();

    let states_a = Arc::new(Mutex::new(Vec::new()));
    let selected_events_a = Arc::new(AtomicUsize::new(0));
    let selected_events_b = Arc::new(AtomicUsize::new(0));

    {
        let states_a = states_a.clone();
        agent_a.on_connection_state_change(move |state| states_a.lock().push(state));
    }
    {
        let selected_events_a = selected_events_a.clone();
        agent_a.on_selected_candidate_pair_change(move |_| {
            selected_events_a.fetch_add(1, Ordering::SeqCst);
        });
    }
    {
        let selected_events_b = selected_events_b.clone();
        agent_b.on_selected_candidate_pair_change(move |_| {
            selected_events_b.fetch_add(1, Ordering::SeqCst);
        });
    }

    let (cand_a, addr_a) = wire_host_candidate(&agent_a).await;
    let (_cand_b, addr_b) = wire_host_candidate(&agent_b).await;

    let (ufrag_a, pwd_a) = agent_a.get_local_user_credentials().await.unwrap();
    let (ufrag_b, pwd_b) = agent_b.get_local_user_credentials().await.unwrap();

    agent_a
        .add_remote_candidate(Arc::new(Candidate::new_host(
            addr_b,
            NetworkType::Udp4,
            COMPONENT_RTP,
            None,
        )))
        .unwrap();
    agent_b
        .add_remote_candidate(Arc::new(Candidate::new_host(
            addr_a,
            NetworkType::Udp4,
            COMPONENT_RTP,
            None,
        )))
        .unwrap();

    agent_a
        .start_connectivity_checks(true, ufrag_b, pwd_b)
        .await
        .unwrap();
    agent_b
        .start_connectivity_checks(false, ufrag_a, pwd_a)
        .await
        .unwrap();

    timeout(Duration::from_secs(10), agent_a.wait_until_connected())
        .await
        .expect("controlling agent should connect")
        .unwrap();
    timeout(Duration::from_secs(10), agent_b.wait_until_connected())
        .await
        .expect("controlled agent should connect")
        .unwrap();

    // The selected pair is (our local, their address) with nominated set
    let selected_a = agent_a.get_selected_candidate_pair().unwrap();
    assert!(selected_a.nominated);
    assert_eq!(selected_a.local.addr(), cand_a.addr());
    assert_eq!(selected_a.remote.addr(), Some(addr_b));

    let selected_b = agent_b.get_selected_candidate_pair().unwrap();
    assert!(selected_b.nominated);
    assert_eq!(selected_b.remote.addr(), Some(addr_a));

    // Give the notifiers a moment to drain before inspecting them
    sleep(Duration::from_millis(300)).await;

    // States advanced New -> Checking -> Connected
    {
        let states = states_a.lock();
        assert!(states.starts_with(&[ConnectionState::Checking, ConnectionState::Connected]));
    }

    // Exactly one selected-pair event on each side
    assert_eq!(selected_events_a.load(Ordering::SeqCst), 1);
    assert_eq!(selected_events_b.load(Ordering::SeqCst), 1);

    agent_a.close().await.unwrap();
    agent_b.close().await.unwrap();
}

#[tokio::test]
async fn test_data_flows_on_selected_pair() {
    setup_test_logging();

    let ((agent_a, _), (agent_b, _)) = connect_agents(fast_config(), fast_config()).await;

    timeout(Duration::from_secs(10), agent_a.wait_until_connected())
        .await
        .unwrap()
        .unwrap();
    timeout(Duration::from_secs(10), agent_b.wait_until_connected())
        .await
        .unwrap()
        .unwrap();

    agent_a.send(b"hello from a").unwrap();
    let received = timeout(Duration::from_secs(5), agent_b.recv())
        .await
        .expect("controlled agent should receive data")
        .unwrap();
    assert_eq!(received, b"hello from a");

    agent_b.send(b"hello from b").unwrap();
    let received = timeout(Duration::from_secs(5), agent_a.recv())
        .await
        .expect("controlling agent should receive data")
        .unwrap();
    assert_eq!(received, b"hello from b");

    agent_a.close().await.unwrap();
    agent_b.close().await.unwrap();
}

#[tokio::test]
async fn test_disconnect_then_fail() {
    setup_test_logging();

    let config_a = AgentConfig {
        check_interval: Some(Duration::from_millis(50)),
        keepalive_interval: Some(Duration::from_millis(50)),
        disconnected_timeout: Some(Duration::from_millis(300)),
        failed_timeout: Some(Duration::from_millis(500)),
        ..Default::default()
    };

    let ((agent_a, _), (agent_b, _)) = connect_agents(config_a, fast_config()).await;

    let states_a = Arc::new(Mutex::new(Vec::new()));
    {
        let states_a = states_a.clone();
        agent_a.on_connection_state_change(move |state| states_a.lock().push(state));
    }

    timeout(Duration::from_secs(10), agent_a.wait_until_connected())
        .await
        .unwrap()
        .unwrap();

    // The remote goes away: its candidates close and stop answering
    agent_b.close().await.unwrap();

    // Silence on the selected pair demotes Connected -> Disconnected ->
    // Failed as the timeouts elapse
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let states = states_a.lock().clone();
        if states.contains(&ConnectionState::Failed) {
            let disconnected = states
                .iter()
                .position(|s| *s == ConnectionState::Disconnected)
                .expect("must pass through Disconnected");
            let failed = states
                .iter()
                .position(|s| *s == ConnectionState::Failed)
                .unwrap();
            assert!(disconnected < failed);
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for Failed, saw {:?}",
            states
        );
        sleep(Duration::from_millis(50)).await;
    }

    // Failure cleared the session: no selected pair, no candidates
    assert!(agent_a.get_selected_candidate_pair().is_none());
    assert!(agent_a.get_local_candidates().await.unwrap().is_empty());

    agent_a.close().await.unwrap();
}

#[tokio::test]
async fn test_restart_after_connected() {
    setup_test_logging();

    let ((agent_a, _), (agent_b, _)) = connect_agents(fast_config(), fast_config()).await;

    timeout(Duration::from_secs(10), agent_a.wait_until_connected())
        .await
        .unwrap()
        .unwrap();

    let (old_ufrag, _) = agent_a.get_local_user_credentials().await.unwrap();

    agent_a
        .restart("fresh-ufrag".to_string(), "fresh-password-128-bits!".to_string())
        .await
        .unwrap();

    let (new_ufrag, new_pwd) = agent_a.get_local_user_credentials().await.unwrap();
    assert_ne!(old_ufrag, new_ufrag);
    assert_eq!(new_ufrag, "fresh-ufrag");
    assert_eq!(new_pwd, "fresh-password-128-bits!");

    assert!(agent_a.get_selected_candidate_pair().is_none());
    assert!(agent_a.get_local_candidates().await.unwrap().is_empty());
    assert!(agent_a.get_remote_candidates().await.unwrap().is_empty());
    assert_eq!(
        agent_a.get_connection_state().await.unwrap(),
        ConnectionState::Checking
    );

    agent_a.close().await.unwrap();
    agent_b.close().await.unwrap();
}

#[tokio::test]
async fn test_add_remote_candidate_is_idempotent() {
    setup_test_logging();

    let agent = Agent::new(fast_config()).await.unwrap();
    let addr: SocketAddr = "198.51.100.3:5000".parse().unwrap();

    for _ in 0..2 {
        agent
            .add_remote_candidate(Arc::new(Candidate::new_host(
                addr,
                NetworkType::Udp4,
                COMPONENT_RTP,
                None,
            )))
            .unwrap();
    }

    // Additions are applied asynchronously on the loop
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let remotes = agent.get_remote_candidates().await.unwrap();
        if !remotes.is_empty() {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline);
        sleep(Duration::from_millis(10)).await;
    }
    sleep(Duration::from_millis(100)).await;

    assert_eq!(agent.get_remote_candidates().await.unwrap().len(), 1);

    agent.close().await.unwrap();
}

#[tokio::test]
async fn test_graceful_close_delivers_pending_events() {
    setup_test_logging();

    let agent = Agent::new(fast_config()).await.unwrap();
    let delivered = Arc::new(AtomicUsize::new(0));

    {
        let delivered = delivered.clone();
        agent.on_candidate(move |_| {
            std::thread::sleep(Duration::from_millis(5));
            delivered.fetch_add(1, Ordering::SeqCst);
        });
    }

    for _ in 0..3 {
        wire_host_candidate(&agent).await;
    }

    agent.graceful_close().await.unwrap();
    assert_eq!(delivered.load(Ordering::SeqCst), 3);

    // Close after graceful close is a no-op
    agent.close().await.unwrap();
}

#[tokio::test]
async fn test_mdns_remote_dropped_when_disabled() {
    setup_test_logging();

    let config = AgentConfig {
        multicast_dns_mode: ice_agent::MulticastDnsMode::Disabled,
        ..fast_config()
    };
    let agent = Agent::new(config).await.unwrap();

    agent
        .add_remote_candidate(Arc::new(Candidate::new_mdns_host(
            "peer.local".to_string(),
            40000,
            NetworkType::Udp4,
            COMPONENT_RTP,
        )))
        .unwrap();

    sleep(Duration::from_millis(200)).await;
    assert!(agent.get_remote_candidates().await.unwrap().is_empty());

    agent.close().await.unwrap();
}

#[tokio::test]
async fn test_lite_controlling_agent_never_initiates_checks() {
    setup_test_logging();

    let agent = Agent::new(lite_config()).await.unwrap();
    wire_host_candidate(&agent).await;

    // A bare peer socket; any outbound check would land here
    let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let peer_addr = peer.local_addr().unwrap();

    agent
        .add_remote_candidate(Arc::new(Candidate::new_host(
            peer_addr,
            NetworkType::Udp4,
            COMPONENT_RTP,
            None,
        )))
        .unwrap();
    agent
        .start_connectivity_checks(true, "peer-ufrag".to_string(), "peer-password".to_string())
        .await
        .unwrap();

    // Many check intervals pass without a single outbound request
    let mut buf = [0u8; 1500];
    let got = timeout(Duration::from_millis(500), peer.recv_from(&mut buf)).await;
    assert!(got.is_err(), "lite agent sent traffic unprompted");

    agent.close().await.unwrap();
}

#[tokio::test]
async fn test_lite_controlled_agent_only_responds() {
    setup_test_logging();

    let agent = Agent::new(lite_config()).await.unwrap();
    let (_candidate, agent_addr) = wire_host_candidate(&agent).await;
    let (ufrag, pwd) = agent.get_local_user_credentials().await.unwrap();

    let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    agent
        .start_connectivity_checks(false, "peer-ufrag".to_string(), "peer-password".to_string())
        .await
        .unwrap();

    // Authenticated check from the peer
    let mut request = Message::binding_request();
    request.add_attribute(Attribute::new(
        AttributeType::Username,
        AttributeValue::Username(format!("{}:peer-ufrag", ufrag)),
    ));
    request.add_attribute(Attribute::new(
        AttributeType::IceControlling,
        AttributeValue::IceControlling(42),
    ));
    request.add_attribute(Attribute::new(
        AttributeType::Priority,
        AttributeValue::Priority(123_456),
    ));
    let encoded = request.encode(Some(pwd.as_bytes()), true);
    peer.send_to(&encoded, agent_addr).await.unwrap();

    // The answer is a Binding success for our transaction
    let mut buf = [0u8; 1500];
    let (n, _) = timeout(Duration::from_secs(5), peer.recv_from(&mut buf))
        .await
        .expect("lite agent should answer the check")
        .unwrap();
    let response = Message::decode(&buf[..n]).unwrap();
    assert_eq!(response.message_type, MessageType::BindingSuccess);
    assert_eq!(response.transaction_id, request.transaction_id);

    // And nothing further: no triggered check, no pings toward the learned
    // peer-reflexive candidate
    let got = timeout(Duration::from_millis(500), peer.recv_from(&mut buf)).await;
    assert!(got.is_err(), "lite agent initiated a check");

    agent.close().await.unwrap();
}
