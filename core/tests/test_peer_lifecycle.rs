// Integration test: peer departure and channel loss
//
// A departing peer takes its session, channel and every transfer with it,
// each transfer failing exactly once on both ends. A broken channel fails
// every transfer riding it, whatever its state, and leaves transfers to
// other peers untouched.

use peermesh_core::{
    Collaborators, Event, EventStream, FileHandle, LoopbackNetwork, MediaConstraints, MemoryRelay,
    MemorySink, MeshConfig, MeshEngine, MeshError, MeshHandle, PeerId, SendId,
};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};

const RELAY: &str = "mem://relay";
const WAIT: Duration = Duration::from_secs(10);
const CONNECTION_CLOSED: &str = "Connection has been closed";

struct Client {
    id: PeerId,
    handle: MeshHandle,
    events: EventStream,
    sink: MemorySink,
}

async fn next_event(events: &mut EventStream) -> Event {
    timeout(WAIT, events.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("event stream closed")
}

async fn wait_for(events: &mut EventStream, want: impl Fn(&Event) -> bool) -> Event {
    loop {
        let event = next_event(events).await;
        if want(&event) {
            return event;
        }
    }
}

async fn start_client(relay: &MemoryRelay, network: &LoopbackNetwork) -> Client {
    let config = MeshConfig {
        chunk_interval_ms: 2,
        ..MeshConfig::for_room("lifecycle")
    };
    let sink = MemorySink::new();
    let collaborators = Collaborators::loopback(relay, network, Arc::new(sink.clone()));
    let handle = MeshEngine::new(config, collaborators).spawn();
    let mut events = handle.subscribe();
    handle.connect(RELAY).await.expect("connect");
    handle
        .create_stream(MediaConstraints::audio_video())
        .expect("create stream");
    wait_for(&mut events, |e| matches!(e, Event::Ready { .. })).await;
    let id = handle
        .local_identity()
        .await
        .expect("engine running")
        .expect("roster received")
        .id;
    Client {
        id,
        handle,
        events,
        sink,
    }
}

async fn wait_channels(client: &mut Client, count: usize) {
    let mut open = HashSet::new();
    while open.len() < count {
        if let Event::ChannelOpened { peer_id } = next_event(&mut client.events).await {
            open.insert(peer_id);
        }
    }
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 256) as u8).collect()
}

/// Offer `bytes` from `sender` to `receiver` and have it accepted.
async fn start_transfer(sender: &Client, receiver: &mut Client, name: &str, bytes: Vec<u8>) -> SendId {
    let send_id = sender
        .handle
        .send_file(receiver.id.clone(), FileHandle::from_bytes(name, bytes))
        .await
        .expect("offer file");
    wait_for(&mut receiver.events, |e| {
        matches!(e, Event::TransferIncoming { send_id: id, .. } if *id == send_id)
    })
    .await;
    receiver
        .handle
        .accept_transfer(sender.id.clone(), send_id.clone())
        .await
        .expect("accept");
    send_id
}

async fn first_progress(events: &mut EventStream, send_id: &SendId) {
    wait_for(events, |e| {
        matches!(e, Event::TransferProgress { send_id: id, .. } if id == send_id)
    })
    .await;
}

/// Count transfer errors for `send_id` still queued on `events`.
fn drain_errors(events: &mut EventStream, send_id: &SendId) -> usize {
    let mut count = 0;
    while let Ok(event) = events.try_recv() {
        match event {
            Event::TransferSendError { send_id: id, .. }
            | Event::TransferReceiveError { send_id: id, .. }
                if &id == send_id =>
            {
                count += 1
            }
            _ => {}
        }
    }
    count
}

#[tokio::test]
async fn test_departure_mid_transfer_fails_once_on_both_ends() {
    tracing_subscriber::fmt()
        .with_env_filter("peermesh_core=debug")
        .try_init()
        .ok();

    let relay = MemoryRelay::new();
    let network = LoopbackNetwork::new();
    let mut alice = start_client(&relay, &network).await;
    let mut bob = start_client(&relay, &network).await;
    wait_channels(&mut alice, 1).await;
    wait_channels(&mut bob, 1).await;

    let send_id = start_transfer(&alice, &mut bob, "movie.mkv", pattern(300_000)).await;
    first_progress(&mut alice.events, &send_id).await;
    println!("✓ Transfer {} in flight", send_id);

    assert!(relay.drop_client(&bob.id));

    match wait_for(&mut alice.events, |e| {
        matches!(e, Event::TransferSendError { .. })
    })
    .await
    {
        Event::TransferSendError {
            send_id: id,
            peer_id,
            error,
        } => {
            assert_eq!(id, send_id);
            assert_eq!(peer_id, bob.id);
            assert!(matches!(
                error,
                MeshError::TransferSend { ref reason, .. } if reason == CONNECTION_CLOSED
            ));
        }
        _ => unreachable!(),
    }
    match wait_for(&mut alice.events, |e| matches!(e, Event::PeerRemoved { .. })).await {
        Event::PeerRemoved { peer_id } => assert_eq!(peer_id, bob.id),
        _ => unreachable!(),
    }

    match wait_for(&mut bob.events, |e| {
        matches!(e, Event::TransferReceiveError { .. })
    })
    .await
    {
        Event::TransferReceiveError { send_id: id, error, .. } => {
            assert_eq!(id, send_id);
            assert!(matches!(
                error,
                MeshError::TransferReceive { ref reason, .. } if reason == CONNECTION_CLOSED
            ));
        }
        _ => unreachable!(),
    }
    println!("✓ Both ends reported the failure");

    // Nothing left behind, and no second error on either side.
    assert!(alice.handle.sessions().await.unwrap().is_empty());
    assert!(alice.handle.peers().await.unwrap().is_empty());
    assert!(alice.handle.transfers().await.unwrap().is_empty());
    assert!(bob.handle.sessions().await.unwrap().is_empty());
    assert!(bob.handle.transfers().await.unwrap().is_empty());
    assert!(!network.is_connected(&alice.id, &bob.id));

    sleep(Duration::from_millis(100)).await;
    assert_eq!(drain_errors(&mut alice.events, &send_id), 0);
    assert_eq!(drain_errors(&mut bob.events, &send_id), 0);
    assert!(bob.sink.is_empty());

    alice.handle.shutdown().await.unwrap();
    bob.handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_departure_leaves_no_session_or_channel() {
    let relay = MemoryRelay::new();
    let network = LoopbackNetwork::new();
    let mut alice = start_client(&relay, &network).await;
    let mut bob = start_client(&relay, &network).await;
    let mut carol = start_client(&relay, &network).await;
    wait_channels(&mut alice, 2).await;
    wait_channels(&mut bob, 2).await;
    wait_channels(&mut carol, 2).await;

    bob.handle.shutdown().await.unwrap();

    for client in [&mut alice, &mut carol] {
        let mut closed = false;
        let mut session_closed = false;
        loop {
            match next_event(&mut client.events).await {
                Event::ChannelClosed { peer_id } if peer_id == bob.id => closed = true,
                Event::SessionClosed { peer_id } if peer_id == bob.id => session_closed = true,
                Event::PeerRemoved { peer_id } if peer_id == bob.id => break,
                _ => {}
            }
        }
        assert!(closed && session_closed);

        let sessions = client.handle.sessions().await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert!(sessions.iter().all(|s| s.peer_id != bob.id && s.has_channel));
        let peers = client.handle.peers().await.unwrap();
        assert_eq!(peers.len(), 1);
        assert!(peers.iter().all(|p| p.id != bob.id));
    }

    // The survivors still talk to each other.
    let reached = alice.handle.broadcast_message("still here").await.unwrap();
    assert_eq!(reached, vec![carol.id.clone()]);
    wait_for(&mut carol.events, |e| {
        matches!(e, Event::ChatMessage { text, .. } if text == "still here")
    })
    .await;

    alice.handle.shutdown().await.unwrap();
    carol.handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_channel_failure_is_isolated_to_one_peer() {
    let relay = MemoryRelay::new();
    let network = LoopbackNetwork::new();
    let mut alice = start_client(&relay, &network).await;
    let mut bob = start_client(&relay, &network).await;
    let mut carol = start_client(&relay, &network).await;
    wait_channels(&mut alice, 2).await;
    wait_channels(&mut bob, 2).await;
    wait_channels(&mut carol, 2).await;

    let to_bob = start_transfer(&alice, &mut bob, "big.iso", pattern(300_000)).await;
    first_progress(&mut alice.events, &to_bob).await;
    let carol_bytes = pattern(20_000);
    let to_carol = start_transfer(&alice, &mut carol, "small.iso", carol_bytes.clone()).await;

    assert!(network.fail_channel(&alice.id, &bob.id, "cable cut"));

    let mut bob_failed = false;
    let mut carol_sent = false;
    let mut channel_error = false;
    while !(bob_failed && carol_sent) {
        match next_event(&mut alice.events).await {
            Event::ChannelError { peer_id, error } => {
                assert_eq!(peer_id, bob.id);
                assert!(matches!(
                    error,
                    MeshError::ChannelFailed { ref reason, .. } if reason == "cable cut"
                ));
                channel_error = true;
            }
            Event::TransferSendError { send_id, .. } => {
                assert_eq!(send_id, to_bob);
                assert!(!bob_failed, "a transfer fails only once");
                bob_failed = true;
            }
            Event::TransferSent { send_id, .. } => {
                assert_eq!(send_id, to_carol);
                carol_sent = true;
            }
            _ => {}
        }
    }
    assert!(channel_error);

    wait_for(&mut carol.events, |e| {
        matches!(e, Event::TransferReceived { send_id, .. } if *send_id == to_carol)
    })
    .await;
    assert_eq!(carol.sink.get("small.iso"), Some(carol_bytes));

    // The session to bob survives without its channel.
    let sessions = alice.handle.sessions().await.unwrap();
    let bob_session = sessions.iter().find(|s| s.peer_id == bob.id).unwrap();
    assert!(!bob_session.has_channel);
    let carol_session = sessions.iter().find(|s| s.peer_id == carol.id).unwrap();
    assert!(carol_session.has_channel);
    assert!(alice.handle.transfers().await.unwrap().is_empty());

    for client in [alice, bob, carol] {
        client.handle.shutdown().await.unwrap();
    }
}

#[tokio::test]
async fn test_channel_loss_purges_transfers_in_every_state() {
    let relay = MemoryRelay::new();
    let network = LoopbackNetwork::new();
    let mut alice = start_client(&relay, &network).await;
    let mut bob = start_client(&relay, &network).await;
    wait_channels(&mut alice, 1).await;
    wait_channels(&mut bob, 1).await;

    // One transfer mid-flight, one still waiting for an answer.
    let moving = start_transfer(&alice, &mut bob, "archive.tar", pattern(300_000)).await;
    first_progress(&mut alice.events, &moving).await;
    let waiting = alice
        .handle
        .send_file(bob.id.clone(), FileHandle::from_bytes("later.txt", pattern(100)))
        .await
        .expect("offer file");
    wait_for(&mut bob.events, |e| {
        matches!(e, Event::TransferIncoming { send_id, .. } if *send_id == waiting)
    })
    .await;
    println!("✓ One transfer sending, one awaiting an answer");

    assert!(network.fail_channel(&alice.id, &bob.id, "link reset"));

    let mut alice_failed = HashSet::new();
    while alice_failed.len() < 2 {
        if let Event::TransferSendError { send_id, .. } = next_event(&mut alice.events).await {
            assert!(alice_failed.insert(send_id), "a transfer fails only once");
        }
    }
    let mut bob_failed = HashSet::new();
    while bob_failed.len() < 2 {
        if let Event::TransferReceiveError { send_id, .. } = next_event(&mut bob.events).await {
            assert!(bob_failed.insert(send_id), "a transfer fails only once");
        }
    }
    let expected: HashSet<SendId> = [moving.clone(), waiting.clone()].into_iter().collect();
    assert_eq!(alice_failed, expected);
    assert_eq!(bob_failed, expected);
    println!("✓ Both transfers failed on both ends");

    assert!(alice.handle.transfers().await.unwrap().is_empty());
    assert!(bob.handle.transfers().await.unwrap().is_empty());

    sleep(Duration::from_millis(100)).await;
    for events in [&mut alice.events, &mut bob.events] {
        while let Ok(event) = events.try_recv() {
            assert!(
                !matches!(
                    event,
                    Event::TransferSendError { .. } | Event::TransferReceiveError { .. }
                ),
                "unexpected {:?}",
                event
            );
        }
    }
    assert!(bob.sink.is_empty());

    alice.handle.shutdown().await.unwrap();
    bob.handle.shutdown().await.unwrap();
}
