use mwsync_core::SharedMode;
use mwsync_proto::{PropertyAddress, TopicScheme};
use mwsync_replica::{
    ConnectionManager, ConnectionPhase, ConnectionSettings, Heartbeat, HeartbeatEvent, PropertyOptions,
    ReplicatedProperty, SetRegistry,
};
use mwsync_transport::LoopbackBroker;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::BTreeSet;
use std::rc::Rc;
use std::time::{Duration, Instant};
use uuid::Uuid;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Light {
    on: bool,
    brightness: u8,
}

fn address() -> PropertyAddress {
    PropertyAddress::new("", "lamp", "LightBehaviour", "state")
}

fn connected_peer(broker: &LoopbackBroker, now: Instant) -> ConnectionManager {
    connected_peer_with_id(broker, Uuid::new_v4(), now)
}

fn connected_peer_with_id(broker: &LoopbackBroker, client_id: Uuid, now: Instant) -> ConnectionManager {
    let mut manager =
        ConnectionManager::with_client_id(Box::new(broker.clone()), ConnectionSettings::default(), client_id);
    manager.connect().unwrap();
    manager.tick(now);
    assert!(manager.is_connected());
    manager
}

fn light(manager: &mut ConnectionManager) -> ReplicatedProperty<Light> {
    ReplicatedProperty::new(
        manager,
        &TopicScheme::default(),
        address(),
        Light::default(),
        PropertyOptions::default(),
    )
    .unwrap()
}

fn settle(manager: &mut ConnectionManager, property: &mut ReplicatedProperty<Light>, now: Instant) {
    for _ in 0..3 {
        manager.tick(now);
        property.update(manager, now).unwrap();
    }
}

#[test]
fn update_reaches_other_peer_with_sender_id() {
    let broker = LoopbackBroker::new();
    let now = Instant::now();

    let mut alice = connected_peer(&broker, now);
    let mut bob = connected_peer(&broker, now);
    let mut alice_light = light(&mut alice);
    let mut bob_light = light(&mut bob);

    let changes = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&changes);
    bob_light.on_change(move |value: &Light, sender| sink.borrow_mut().push((value.clone(), sender.to_string())));

    alice_light.set(Light { on: true, brightness: 80 });
    settle(&mut alice, &mut alice_light, now);
    settle(&mut bob, &mut bob_light, now);

    assert_eq!(*bob_light.get(), Light { on: true, brightness: 80 });
    assert_eq!(
        *changes.borrow(),
        vec![(Light { on: true, brightness: 80 }, alice.peer_id().to_string())]
    );
    // own echo suppressed
    assert_eq!(*alice_light.get(), Light { on: true, brightness: 80 });
}

#[test]
fn late_joiner_receives_retained_state() {
    let broker = LoopbackBroker::new();
    let now = Instant::now();

    let mut alice = connected_peer(&broker, now);
    let mut alice_light = light(&mut alice);
    alice_light.set(Light { on: true, brightness: 10 });
    settle(&mut alice, &mut alice_light, now);
    assert!(broker.retained(alice_light.topic()).is_some());

    let mut carol = connected_peer(&broker, now);
    let mut carol_light = light(&mut carol);
    settle(&mut carol, &mut carol_light, now);
    assert_eq!(*carol_light.get(), Light { on: true, brightness: 10 });
}

#[test]
fn restarted_peer_restores_own_retained_state_once() {
    let broker = LoopbackBroker::new();
    let now = Instant::now();
    let client_id = Uuid::new_v4();

    {
        let mut first = connected_peer_with_id(&broker, client_id, now);
        let mut state = light(&mut first);
        state.set(Light { on: false, brightness: 42 });
        settle(&mut first, &mut state, now);
        first.disconnect();
    }

    let mut second = connected_peer_with_id(&broker, client_id, now);
    let mut restored = light(&mut second);
    settle(&mut second, &mut restored, now);
    assert_eq!(*restored.get(), Light { on: false, brightness: 42 });
    assert!(restored.is_established());
}

#[test]
fn offline_registry_edits_merge_across_peers() {
    let broker = LoopbackBroker::new();
    let scheme = TopicScheme::default();
    let now = Instant::now();

    let mut alice = ConnectionManager::new(Box::new(broker.clone()), ConnectionSettings::default());
    let mut alice_peers = SetRegistry::peers(&mut alice, &scheme).unwrap();
    alice_peers.add("alice");
    alice_peers.add("alice");
    alice_peers.add("ghost");
    alice_peers.remove("ghost");

    alice.connect().unwrap();
    for _ in 0..3 {
        alice.tick(now);
        alice_peers.update(&mut alice, now).unwrap();
    }
    assert_eq!(alice_peers.ids().iter().collect::<Vec<_>>(), vec!["alice"]);

    let mut bob = ConnectionManager::new(Box::new(broker.clone()), ConnectionSettings::default());
    let mut bob_peers = SetRegistry::peers(&mut bob, &scheme).unwrap();
    bob_peers.add("bob");
    bob.connect().unwrap();
    for _ in 0..3 {
        bob.tick(now);
        bob_peers.update(&mut bob, now).unwrap();
        alice.tick(now);
        alice_peers.update(&mut alice, now).unwrap();
    }

    let expected: BTreeSet<String> = ["alice", "bob"].iter().map(|s| (*s).to_string()).collect();
    assert_eq!(*bob_peers.ids(), expected);
    assert_eq!(*alice_peers.ids(), expected);
}

#[test]
fn outage_triggers_reconnect_and_replay() {
    let broker = LoopbackBroker::new();
    let now = Instant::now();
    let mut manager = connected_peer(&broker, now);
    let _state = light(&mut manager);
    let client_id = manager.client_id().to_string();
    assert_eq!(broker.subscriptions(&client_id).len(), 2);

    broker.set_online(false);
    manager.tick(now);
    assert!(matches!(manager.phase(), ConnectionPhase::ReconnectWait { .. }));

    broker.set_online(true);
    let later = now + Duration::from_secs(3);
    manager.tick(later);
    manager.tick(later);
    assert!(manager.is_connected());
    assert_eq!(broker.subscriptions(&client_id).len(), 2);
}

#[test]
fn heartbeat_expires_when_sender_disappears() {
    let broker = LoopbackBroker::new();
    let scheme = TopicScheme::default();
    let now = Instant::now();
    let interval = Duration::from_secs(2);
    let grace = Duration::from_secs(2);

    let mut owner = connected_peer(&broker, now);
    let mut watcher = connected_peer(&broker, now);
    let mut sender = Heartbeat::new(&mut owner, &scheme, "", "lamp", SharedMode::Sender, interval, grace, now).unwrap();
    let mut receiver =
        Heartbeat::new(&mut watcher, &scheme, "", "lamp", SharedMode::Receiver, interval, grace, now).unwrap();

    let mut expired = false;
    for second in 0..6 {
        let at = now + Duration::from_secs(second);
        owner.tick(at);
        assert_ne!(sender.update(&mut owner, at).unwrap(), HeartbeatEvent::RefreshRequested);
        watcher.tick(at);
        expired |= receiver.update(&mut watcher, at).unwrap() == HeartbeatEvent::Expired;
    }
    assert!(!expired);

    owner.disconnect();
    let mut events = Vec::new();
    for second in 6..12 {
        let at = now + Duration::from_secs(second);
        watcher.tick(at);
        events.push(receiver.update(&mut watcher, at).unwrap());
    }
    assert!(events.contains(&HeartbeatEvent::Expired));
}
