//! Session scenarios over a real relay server on loopback

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Runtime;

use aoo_transport::clock::DejitterClock;
use aoo_transport::config::{ClientConfig, DejitterConfig, ServerConfig};
use aoo_transport::network::NodeRegistry;
use aoo_transport::protocol::RelayTarget;
use aoo_transport::session::{Client, ClientState, IncomingMessage, Server, SessionEvent};
use aoo_transport::TimeTag;

const WAIT: Duration = Duration::from_secs(5);

struct Harness {
    runtime: Runtime,
    server: Server,
    registry: NodeRegistry,
}

impl Harness {
    fn start() -> Self {
        let runtime = Runtime::new().unwrap();
        let config = ServerConfig { bind_address: "127.0.0.1".into(), port: 0, ..ServerConfig::default() };
        let server = runtime.block_on(Server::bind(config)).unwrap();
        let runner = server.clone();
        runtime.spawn(async move {
            let _ = runner.run().await;
        });
        Self { runtime, server, registry: NodeRegistry::new() }
    }

    /// A logged-in client that joined `group`
    fn member(&self, user: &str, group: &str) -> Client {
        let client = Client::new(ClientConfig::default());
        client.bind(&self.registry, 0).unwrap();
        let port = self.server.local_addr().port();
        client.connect("127.0.0.1", port, user, "").wait_timeout(WAIT).unwrap();
        client.join_group(group, "").wait_timeout(WAIT).unwrap();
        client
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.server.shutdown();
    }
}

fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..500 {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    false
}

#[test]
fn test_disconnect_drops_peers_immediately() {
    let harness = Harness::start();
    let alice = harness.member("alice", "demo");
    let bob = harness.member("bob", "demo");

    assert!(wait_for(|| alice.find_peer("demo", "bob").is_some()));
    let events = alice.poll_events();
    assert!(events.iter().any(|e| matches!(e, SessionEvent::PeerJoin(p) if p.user == "bob")));

    alice.disconnect();
    assert!(alice.list_peers().is_empty());
    assert!(alice.groups().is_empty());
    assert_eq!(alice.state(), ClientState::Disconnected);

    // The other side learns about it from the server
    assert!(wait_for(|| bob.list_peers().is_empty()));
    assert!(bob.poll_events().iter().any(|e| matches!(e, SessionEvent::PeerLeave(p) if p.user == "alice")));
}

#[test]
fn test_reconnect_after_disconnect() {
    let harness = Harness::start();
    let alice = harness.member("alice", "demo");
    alice.disconnect();

    let port = harness.server.local_addr().port();
    let user_id = alice.connect("127.0.0.1", port, "alice", "").wait_timeout(WAIT);
    assert!(user_id.is_ok(), "{:?}", user_id);
    assert_eq!(alice.state(), ClientState::Connected);
}

#[test]
fn test_scheduled_message_not_delivered_early() {
    let harness = Harness::start();
    let alice = harness.member("alice", "demo");
    let bob = harness.member("bob", "demo");
    assert!(wait_for(|| alice.find_peer("demo", "bob").is_some()));

    let delivered: Arc<Mutex<Vec<(TimeTag, IncomingMessage)>>> = Arc::new(Mutex::new(Vec::new()));
    let current = Arc::new(Mutex::new(TimeTag::default()));
    {
        let delivered = Arc::clone(&delivered);
        let current = Arc::clone(&current);
        bob.set_message_handler(move |m| delivered.lock().push((*current.lock(), m.clone())));
    }

    // Simulated audio callback time line, independent of the wall clock
    let start = TimeTag::from_seconds(100_000.0);
    let due = start.add_seconds(0.2);
    alice.send_message(&RelayTarget::Group("demo".into()), b"downbeat", due, true).unwrap();

    *current.lock() = start;
    assert!(wait_for(|| {
        bob.process(start);
        bob.scheduled() == 1
    }));
    assert!(delivered.lock().is_empty());

    // Callbacks come in bursts of five, 50 ms apart
    let mut clock = DejitterClock::new(48000, 480, &DejitterConfig::default());
    clock.tick(start);
    for k in 1..60 {
        let burst = (k / 5) as f64 * 0.05;
        let raw = start.add_seconds(burst + (k % 5) as f64 * 0.0002);
        let now = clock.tick(raw);
        *current.lock() = now;
        bob.process(now);
    }

    let delivered = delivered.lock();
    assert_eq!(delivered.len(), 1);
    let (at, message) = &delivered[0];
    assert_eq!(message.payload, b"downbeat");
    assert!(message.reliable);
    assert!(*at >= due, "delivered at {:?}, due {:?}", at, due);
    assert!(TimeTag::duration(due, *at) < 0.06);
    assert!(message.delay >= 0.0);
}

#[test]
fn test_unreliable_message_between_nodes() {
    let harness = Harness::start();
    let alice = harness.member("alice", "demo");
    let bob = harness.member("bob", "demo");
    assert!(wait_for(|| alice.find_peer("demo", "bob").is_some() && bob.find_peer("demo", "alice").is_some()));

    alice.send_message(&RelayTarget::Broadcast, b"ping", TimeTag::IMMEDIATE, false).unwrap();
    let mut received = None;
    assert!(wait_for(|| {
        bob.dispatch_replies();
        received = bob.poll_events().into_iter().find_map(|e| match e {
            SessionEvent::Message(m) => Some(m),
            _ => None,
        });
        received.is_some()
    }));
    let message = received.unwrap();
    assert_eq!(message.user, "alice");
    assert!(!message.reliable);
}
