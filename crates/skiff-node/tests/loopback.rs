//! # Loopback tests: two endpoints over real UDP sockets on 127.0.0.1
//!
//! Every test binds ephemeral ports, so they run in parallel safely.

mod common;

use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use common::TestCrypto;
use rand::RngExt as _;
use skiff_node::socket::{bind_udp, DatagramSocket};
use skiff_node::{Endpoint, MessageFailure, NodeConfig, NodeEvent};
use skiff_transport::clock::MonotonicClock;

// ─── Helpers ────────────────────────────────────────────────────────────────

const EVENT_TIMEOUT: Duration = Duration::from_secs(20);

fn config(protocol_version: u8) -> NodeConfig {
    NodeConfig::from_toml_str(&format!(
        r#"
            bind = "127.0.0.1:0"
            protocol_version = {protocol_version}

            [pool]
            capacity = 256
        "#
    ))
    .unwrap()
}

fn endpoint(name: &str, protocol_version: u8) -> Endpoint {
    skiff_node::init_tracing("warn");
    Endpoint::bind(config(protocol_version), Arc::new(TestCrypto::new(name))).unwrap()
}

fn identity(name: &str) -> Bytes {
    Bytes::copy_from_slice(name.as_bytes())
}

/// Wait for the first event matching `pred`, skipping others.
fn wait_for(endpoint: &Endpoint, what: &str, pred: impl Fn(&NodeEvent) -> bool) -> NodeEvent {
    let deadline = Instant::now() + EVENT_TIMEOUT;
    loop {
        let left = deadline.saturating_duration_since(Instant::now());
        match endpoint.events().recv_timeout(left) {
            Ok(event) if pred(&event) => return event,
            Ok(_) => {}
            Err(_) => panic!("timed out waiting for {what}"),
        }
    }
}

fn random_payload(len: usize) -> Bytes {
    let mut rng = rand::rng();
    Bytes::from((0..len).map(|_| rng.random::<u8>()).collect::<Vec<u8>>())
}

/// Drops every `nth` outgoing datagram once the first `spare` have gone out.
struct LossySocket {
    inner: UdpSocket,
    nth: usize,
    spare: usize,
    sent: AtomicUsize,
}

impl DatagramSocket for LossySocket {
    fn send_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize> {
        let n = self.sent.fetch_add(1, Ordering::Relaxed);
        if n >= self.spare && n % self.nth == 0 {
            return Ok(buf.len());
        }
        self.inner.send_to(buf, addr)
    }

    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.inner.recv_from(buf)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }
}

// ─── Handshake + Delivery Tests ─────────────────────────────────────────────

#[test]
fn handshake_then_multi_fragment_message() {
    let alice = endpoint("alice", 1);
    let bob = endpoint("bob", 1);
    let payload = random_payload(5_000);

    alice.connect(bob.local_addr(), identity("bob")).unwrap();
    let handle = alice.submit_message(bob.local_addr(), payload.clone()).unwrap();

    let NodeEvent::HandshakeComplete { peer, peer_id } =
        wait_for(&bob, "bob handshake", |e| matches!(e, NodeEvent::HandshakeComplete { .. }))
    else {
        unreachable!()
    };
    assert_eq!(peer, alice.local_addr());
    assert_eq!(peer_id, TestCrypto::peer_id_of("alice"));

    let NodeEvent::MessageComplete { peer, payload: got, .. } =
        wait_for(&bob, "message", |e| matches!(e, NodeEvent::MessageComplete { .. }))
    else {
        unreachable!()
    };
    assert_eq!(peer, alice.local_addr());
    assert_eq!(got, payload);

    let acked = wait_for(&alice, "ack", |e| matches!(e, NodeEvent::MessageAcked { .. }));
    assert_eq!(
        acked,
        NodeEvent::MessageAcked {
            peer: bob.local_addr(),
            handle
        }
    );

    assert!(alice.is_connected(bob.local_addr()));
    assert!(bob.is_connected(alice.local_addr()));
    let stats = bob.peer_stats(alice.local_addr()).unwrap();
    assert_eq!(stats.receiver.messages_completed, 1);
    assert_eq!(stats.receiver.bytes_delivered, 5_000);
}

#[test]
fn initiator_sees_responder_identity() {
    let alice = endpoint("alice", 1);
    let bob = endpoint("bob", 1);
    alice.connect(bob.local_addr(), identity("bob")).unwrap();

    let event = wait_for(&alice, "handshake", |e| matches!(e, NodeEvent::HandshakeComplete { .. }));
    assert_eq!(
        event,
        NodeEvent::HandshakeComplete {
            peer: bob.local_addr(),
            peer_id: TestCrypto::peer_id_of("bob"),
        }
    );
}

#[test]
fn responder_replies_over_the_same_session() {
    let alice = endpoint("alice", 1);
    let bob = endpoint("bob", 1);

    alice.submit_message(bob.local_addr(), Bytes::new()).unwrap_err();
    alice.connect(bob.local_addr(), identity("bob")).unwrap();
    alice
        .submit_message(bob.local_addr(), Bytes::from_static(b"ping"))
        .unwrap();

    wait_for(&bob, "ping", |e| {
        matches!(e, NodeEvent::MessageComplete { payload, .. } if payload.as_ref() == b"ping")
    });
    // Bob never called connect; the session alone is enough.
    bob.submit_message(alice.local_addr(), Bytes::from_static(b"pong"))
        .unwrap();
    wait_for(&alice, "pong", |e| {
        matches!(e, NodeEvent::MessageComplete { payload, .. } if payload.as_ref() == b"pong")
    });
    assert_eq!(alice.stats().peers, 1);
    assert_eq!(bob.stats().handshakes.inbound_started, 1);
}

#[test]
fn token_handshake_redeems_retry_token() {
    let alice = endpoint("alice", 2);
    let bob = endpoint("bob", 2);

    alice.connect(bob.local_addr(), identity("bob")).unwrap();
    alice
        .submit_message(bob.local_addr(), random_payload(2_500))
        .unwrap();
    wait_for(&bob, "message", |e| matches!(e, NodeEvent::MessageComplete { .. }));

    let stats = bob.stats().handshakes;
    assert_eq!(stats.tokens_issued, 1);
    assert_eq!(stats.tokens_redeemed, 1);
    assert_eq!(stats.tokens_rejected, 0);
}

#[test]
fn messages_survive_datagram_loss() {
    let lossy = LossySocket {
        inner: bind_udp("127.0.0.1:0".parse().unwrap()).unwrap(),
        nth: 5,
        spare: 4,
        sent: AtomicUsize::new(0),
    };
    let alice = Endpoint::with_socket(
        config(1),
        Arc::new(lossy),
        Arc::new(TestCrypto::new("alice")),
        Arc::new(MonotonicClock::new()),
    )
    .unwrap();
    let bob = endpoint("bob", 1);

    alice.connect(bob.local_addr(), identity("bob")).unwrap();
    let payloads: Vec<Bytes> = (0..3).map(|i| random_payload(1_500 + i * 700)).collect();
    for p in &payloads {
        alice.submit_message(bob.local_addr(), p.clone()).unwrap();
    }

    let mut received = Vec::new();
    while received.len() < payloads.len() {
        if let NodeEvent::MessageComplete { payload, .. } =
            wait_for(&bob, "messages", |e| matches!(e, NodeEvent::MessageComplete { .. }))
        {
            received.push(payload);
        }
    }
    for p in &payloads {
        assert!(received.contains(p));
    }
    let sender = alice.peer_stats(bob.local_addr()).unwrap().sender;
    assert!(sender.fragments_retransmitted > 0);
}

#[test]
fn stalled_application_still_gets_every_message() {
    let bob_config = NodeConfig::from_toml_str(
        r#"
            bind = "127.0.0.1:0"

            [delivery]
            queue_capacity = 1
        "#,
    )
    .unwrap();
    let (gate_tx, gate_rx) = crossbeam_channel::bounded::<()>(0);
    let (stalled_tx, stalled_rx) = crossbeam_channel::bounded::<()>(1);
    let (events_tx, events_rx) = crossbeam_channel::unbounded::<NodeEvent>();
    let bob = Endpoint::with_handler(
        bob_config,
        Arc::new(bind_udp("127.0.0.1:0".parse().unwrap()).unwrap()),
        Arc::new(TestCrypto::new("bob")),
        Arc::new(MonotonicClock::new()),
        move |event: NodeEvent| {
            if matches!(event, NodeEvent::MessageComplete { .. }) {
                let _ = stalled_tx.try_send(());
                // Returns once the gate is dropped.
                let _ = gate_rx.recv_timeout(EVENT_TIMEOUT);
            }
            let _ = events_tx.send(event);
        },
    )
    .unwrap();
    let alice = endpoint("alice", 1);

    alice.connect(bob.local_addr(), identity("bob")).unwrap();
    let payloads: Vec<Bytes> = (0..4).map(|_| random_payload(16)).collect();
    for p in &payloads {
        alice.submit_message(bob.local_addr(), p.clone()).unwrap();
    }

    stalled_rx.recv_timeout(EVENT_TIMEOUT).unwrap();
    std::thread::sleep(Duration::from_millis(300));
    drop(gate_tx);

    let mut received = Vec::new();
    let deadline = Instant::now() + EVENT_TIMEOUT;
    while received.len() < payloads.len() {
        let left = deadline.saturating_duration_since(Instant::now());
        match events_rx.recv_timeout(left) {
            Ok(NodeEvent::MessageComplete { payload, .. }) => received.push(payload),
            Ok(_) => {}
            Err(_) => panic!("bob got {} of {} messages", received.len(), payloads.len()),
        }
    }
    for p in &payloads {
        assert!(received.contains(p));
    }
    for _ in 0..payloads.len() {
        wait_for(&alice, "ack", |e| matches!(e, NodeEvent::MessageAcked { .. }));
    }

    let stats = bob.peer_stats(alice.local_addr()).unwrap().receiver;
    assert_eq!(stats.messages_completed, 4);
    assert!(stats.messages_deferred >= 1);
    assert_eq!(bob.stats().dropped_events, 0);
}

// ─── Teardown Tests ─────────────────────────────────────────────────────────

#[test]
fn disconnect_closes_both_sides() {
    let alice = endpoint("alice", 1);
    let bob = endpoint("bob", 1);
    alice.connect(bob.local_addr(), identity("bob")).unwrap();
    wait_for(&bob, "handshake", |e| matches!(e, NodeEvent::HandshakeComplete { .. }));
    wait_for(&alice, "handshake", |e| matches!(e, NodeEvent::HandshakeComplete { .. }));

    assert!(alice.disconnect(bob.local_addr()));
    assert!(!alice.is_connected(bob.local_addr()));
    wait_for(&bob, "close", |e| {
        *e == NodeEvent::SessionClosed {
            peer: alice.local_addr(),
        }
    });
    assert!(!bob.is_connected(alice.local_addr()));
    assert!(!alice.disconnect(bob.local_addr()));
}

#[test]
fn unreachable_peer_fails_queued_messages() {
    let silent = UdpSocket::bind("127.0.0.1:0").unwrap();
    let silent_addr = silent.local_addr().unwrap();
    let alice = endpoint("alice", 1);

    alice.connect(silent_addr, identity("nobody")).unwrap();
    let handle = alice
        .submit_message(silent_addr, Bytes::from_static(b"lost"))
        .unwrap();
    assert!(alice.disconnect(silent_addr));

    let failed = wait_for(&alice, "failure", |e| matches!(e, NodeEvent::MessageFailed { .. }));
    let NodeEvent::MessageFailed {
        handle: got,
        failure,
        ..
    } = failed
    else {
        unreachable!()
    };
    assert_eq!(got, handle);
    assert!(matches!(failure, MessageFailure::Handshake(_)));
}

#[test]
fn shutdown_is_idempotent_and_rejects_new_work() {
    let mut alice = endpoint("alice", 1);
    let addr = alice.local_addr();
    alice.shutdown();
    alice.shutdown();
    assert!(alice.connect(addr, identity("self")).is_err());
    assert!(alice.submit_message(addr, Bytes::from_static(b"x")).is_err());
}
