// Два (и три) участника в одной комнате через ретранслятор в процессе.

mod common;

use common::{drain, states, wait_for, wait_for_state};
use ssc_call::media::VirtualDevices;
use ssc_call::peer::{LoopbackConnector, PeerConnectionState};
use ssc_call::{
    CallConfig, CallDeps, CallError, CallOptions, CallSession, LocalSignaling, Relay, Role,
    RoleAssignment, SessionEvent, SessionState, SignalingError,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

struct Member {
    session: CallSession,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    devices: Arc<VirtualDevices>,
    connector: Arc<LoopbackConnector>,
}

fn join_room(relay: &Arc<Relay>, room: &str, user: &str) -> Member {
    let devices = Arc::new(VirtualDevices::new());
    let connector = LoopbackConnector::new();
    let deps = CallDeps {
        signaling: LocalSignaling::connect(relay, user),
        devices: devices.clone(),
        connector: connector.clone(),
    };
    let options = CallOptions::new(room, user, RoleAssignment::ByUserId);
    let (session, events) = CallSession::start(CallConfig::default(), deps, options).unwrap();
    Member {
        session,
        events,
        devices,
        connector,
    }
}

#[tokio::test(start_paused = true)]
async fn two_participants_connect_and_tick_independently() {
    let relay = Relay::new();
    let mut alice = join_room(&relay, "r1", "alice");
    let mut bob = join_room(&relay, "r1", "bob");

    let alice_seen = wait_for_state(&mut alice.events, SessionState::Connected).await;
    let bob_seen = wait_for_state(&mut bob.events, SessionState::Connected).await;
    assert!(states(&alice_seen).contains(&SessionState::Offering));
    assert!(states(&bob_seen).contains(&SessionState::Answering));

    wait_for(&mut alice.events, |e| matches!(e, SessionEvent::DurationTick(2))).await;
    wait_for(&mut bob.events, |e| matches!(e, SessionEvent::DurationTick(2))).await;
    assert!(alice.session.duration_secs() >= 2);
    assert!(bob.session.duration_secs() >= 2);

    let alice_snapshot = alice.session.snapshot().await.unwrap();
    let bob_snapshot = bob.session.snapshot().await.unwrap();
    assert_eq!(alice_snapshot.local.role, Some(Role::Initiator));
    assert_eq!(bob_snapshot.local.role, Some(Role::Responder));
    assert_eq!(relay.members("r1").len(), 2);

    // alice кладёт трубку, bob получает endCall и тоже завершает звонок
    alice.session.end().await;
    wait_for(&mut bob.events, |e| matches!(e, SessionEvent::NavigateAway)).await;
    assert_eq!(bob.session.state(), SessionState::Ended);
    assert_eq!(alice.devices.live_tracks(), 0);
    assert_eq!(bob.devices.live_tracks(), 0);
    assert_eq!(relay.room_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn one_sided_failure_recovers_through_rejoin() {
    let relay = Relay::new();
    let mut alice = join_room(&relay, "r1", "alice");
    let mut bob = join_room(&relay, "r1", "bob");
    wait_for_state(&mut alice.events, SessionState::Connected).await;
    wait_for_state(&mut bob.events, SessionState::Connected).await;

    // обрыв видит только bob, у alice соединение остаётся Connected
    bob.connector
        .last_peer()
        .unwrap()
        .force_state(PeerConnectionState::Failed);

    let bob_seen = wait_for(&mut bob.events, |e| {
        matches!(e, SessionEvent::ConnectionRecovered)
    })
    .await;
    let attempts = bob_seen
        .iter()
        .filter(|e| matches!(e, SessionEvent::Reconnecting { .. }))
        .count();
    assert_eq!(attempts, 1);
    assert_eq!(
        states(&bob_seen),
        vec![
            SessionState::AcquiringMedia,
            SessionState::Joining,
            SessionState::WaitingForPeer,
            SessionState::Answering,
            SessionState::Connected
        ]
    );

    let alice_seen = wait_for_state(&mut alice.events, SessionState::Connected).await;
    assert_eq!(
        states(&alice_seen),
        vec![
            SessionState::WaitingForPeer,
            SessionState::Offering,
            SessionState::Connected
        ]
    );
    let alice_peers = alice.connector.peers();
    assert_eq!(alice_peers.len(), 2);
    assert_eq!(alice_peers[0].close_count(), 1);
    assert_eq!(bob.connector.peers().len(), 2);
    // медиа не перезахватывалось
    assert_eq!(alice.devices.stopped_tracks(), 0);
    assert_eq!(bob.devices.stopped_tracks(), 0);

    tokio::time::sleep(Duration::from_secs(30)).await;
    for member in [&mut alice, &mut bob] {
        let seen = drain(&mut member.events);
        assert!(!states(&seen).contains(&SessionState::Failed));
        assert_eq!(member.session.state(), SessionState::Connected);
        let snapshot = member.session.snapshot().await.unwrap();
        assert_eq!(snapshot.reconnect_attempts, 0);
    }
    assert_eq!(relay.members("r1").len(), 2);
}

#[tokio::test(start_paused = true)]
async fn third_participant_is_rejected() {
    let relay = Relay::new();
    let mut alice = join_room(&relay, "r1", "alice");
    let mut bob = join_room(&relay, "r1", "bob");
    wait_for_state(&mut alice.events, SessionState::Connected).await;
    wait_for_state(&mut bob.events, SessionState::Connected).await;

    let mut carol = join_room(&relay, "r1", "carol");
    let seen = wait_for_state(&mut carol.events, SessionState::Failed).await;
    assert!(!states(&seen).contains(&SessionState::WaitingForPeer));
    let error = wait_for(&mut carol.events, |e| matches!(e, SessionEvent::Error(_))).await;
    assert!(matches!(
        error.last(),
        Some(SessionEvent::Error(CallError::Signaling(SignalingError::RoomFull(_))))
    ));
    assert_eq!(carol.session.state(), SessionState::Failed);
    assert_eq!(carol.devices.live_tracks(), 0);
    let mut members = relay.members("r1");
    members.sort();
    assert_eq!(members, vec!["alice".to_string(), "bob".to_string()]);
}
