//! Inbound and outbound message channels against mock transports.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use flare_core::credentials::CredentialRequirements;
use flare_core::crypto::aead_encrypt;
use flare_core::errors::TransportError;
use flare_core::identity::{ContactIdentity, IdentityKeyPair, IdentityStore};
use flare_core::transport::{StreamSocket, UnaryTransport};
use flare_core::wire::{
    self, ClientFrame, DenyReason, InboundUserMessage, MessageAck, RegisterResponse, UnaryRequest,
    UnaryResponse, UsernameOpinion,
};
use flare_harness::{MockStreamSocket, MockUnaryTransport};
use flare_runtime::inbound::InboundService;
use flare_runtime::outbound::{OutboundEvent, OutboundMessage, OutboundService, OutboundState};
use flare_runtime::service::{spawn_service, Service};
use flare_runtime::session::SessionIntent;
use flare_runtime::{ClientConfig, FlareClient, MessageQueue};
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn fast_config() -> ClientConfig {
    init_tracing();
    ClientConfig {
        server_host: "flare.example".into(),
        connect_timeout: Duration::from_millis(500),
        call_timeout: Duration::from_millis(500),
        read_timeout: Duration::from_millis(50),
        ping_interval: Duration::from_millis(100),
        reconnect_attempts: 3,
        reconnect_pause: Duration::from_millis(10),
        argon_memory_cost_kib: 1024,
        argon_time_cost: 1,
        credential_wait_timeout: Duration::from_millis(100),
        credential_dump_path: None,
    }
}

fn encrypted_message(
    sender: &IdentityKeyPair,
    recipient: &IdentityKeyPair,
    server_time: u64,
    body: &str,
) -> InboundUserMessage {
    let shared = sender.agree(recipient.public_key());
    InboundUserMessage {
        sender_username: "bob".into(),
        server_time,
        envelope: aead_encrypt(&shared, body.as_bytes()).unwrap(),
        sender_public_key: sender.public_key_bytes(),
    }
}

// ----------------------------------------------------------------------------
// Inbound
// ----------------------------------------------------------------------------

#[tokio::test]
async fn inbound_subscribes_with_the_session_token() {
    let socket = Arc::new(MockStreamSocket::new(4096));
    let (_token_tx, token_rx) = {
        let (tx, rx) = watch::channel(Some("tok-sub".to_string()));
        (tx, rx)
    };
    let received = MessageQueue::new();

    let handle = spawn_service(InboundService::new(
        Arc::clone(&socket) as Arc<dyn StreamSocket>,
        fast_config(),
        token_rx,
        received,
    ));

    // Give the service time to connect and subscribe.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let frames = socket.sent_frames();
    assert!(!frames.is_empty(), "no subscribe frame was sent");
    let subscribe: ClientFrame = wire::decode(&frames[0]).unwrap();
    match subscribe {
        ClientFrame::Subscribe(request) => {
            assert_eq!(request.token, "tok-sub");
            assert_eq!(request.begin_timestamp, 0);
        }
        other => panic!("expected subscribe frame, got {:?}", other),
    }

    // The keep-alive should have fired at least once by now.
    let pings = socket
        .sent_frames()
        .iter()
        .skip(1)
        .filter(|f| matches!(wire::decode::<ClientFrame>(f), Ok(ClientFrame::Ping)))
        .count();
    assert!(pings >= 1, "no ping frames observed");

    handle.request_shutdown();
    handle.join().await.unwrap();
}

#[tokio::test]
async fn inbound_queues_messages_and_drops_replayed_duplicates() {
    let alice = IdentityKeyPair::generate();
    let bob = IdentityKeyPair::generate();

    let socket = Arc::new(MockStreamSocket::new(4096));
    let (_token_tx, token_rx) = {
        let (tx, rx) = watch::channel(Some("tok-sub".to_string()));
        (tx, rx)
    };
    let received = MessageQueue::new();

    let first = encrypted_message(&bob, &alice, 10, "labas");
    let second = encrypted_message(&bob, &alice, 11, "kaip sekasi?");
    socket.push_frame(wire::encode(&first).unwrap());
    // Replay of the first message, as a resubscription would produce.
    socket.push_frame(wire::encode(&first).unwrap());
    socket.push_frame(wire::encode(&second).unwrap());

    let handle = spawn_service(InboundService::new(
        Arc::clone(&socket) as Arc<dyn StreamSocket>,
        fast_config(),
        token_rx,
        received.clone(),
    ));

    tokio::time::sleep(Duration::from_millis(300)).await;
    handle.request_shutdown();
    handle.join().await.unwrap();

    let queued = received.drain();
    assert_eq!(queued.len(), 2, "duplicate was not dropped");
    assert_eq!(queued[0].server_time, 10);
    assert_eq!(queued[1].server_time, 11);

    // Fetch-side decryption recovers the plaintext.
    let mut store = IdentityStore::new();
    store.set_local(alice);
    assert_eq!(
        flare_runtime::decrypt_received(&mut store, &queued[0]).unwrap(),
        "labas"
    );
}

#[tokio::test]
async fn inbound_gives_up_after_exhausted_reconnects() {
    let socket = Arc::new(MockStreamSocket::new(4096));
    socket.fail_next_connects(100);
    let (_token_tx, token_rx) = {
        let (tx, rx) = watch::channel(Some("tok-sub".to_string()));
        (tx, rx)
    };

    let handle = spawn_service(InboundService::new(
        Arc::clone(&socket) as Arc<dyn StreamSocket>,
        fast_config(),
        token_rx,
        MessageQueue::new(),
    ));

    // The service burns its reconnection budget and ends on its own.
    timeout(Duration::from_secs(5), handle.join())
        .await
        .expect("inbound service did not give up")
        .unwrap();
}

#[tokio::test]
async fn inbound_reconnects_pause_between_attempts() {
    let socket = Arc::new(MockStreamSocket::new(4096));
    socket.fail_next_connects(100);
    let (_token_tx, token_rx) = watch::channel(Some("tok-sub".to_string()));
    let config = ClientConfig {
        reconnect_pause: Duration::from_millis(50),
        ..fast_config()
    };

    let started = std::time::Instant::now();
    let handle = spawn_service(InboundService::new(
        Arc::clone(&socket) as Arc<dyn StreamSocket>,
        config,
        token_rx,
        MessageQueue::new(),
    ));
    timeout(Duration::from_secs(5), handle.join())
        .await
        .expect("inbound service did not give up")
        .unwrap();

    // Three retries, each preceded by the pause.
    assert!(
        started.elapsed() >= Duration::from_millis(150),
        "attempts were not paced: {:?}",
        started.elapsed()
    );
}

// ----------------------------------------------------------------------------
// Outbound
// ----------------------------------------------------------------------------

struct OutboundRig {
    pending: MessageQueue<OutboundMessage>,
    sent: MessageQueue<flare_runtime::SentMessage>,
    events: mpsc::UnboundedReceiver<OutboundEvent>,
    handle: flare_runtime::ServiceHandle,
    _token_tx: watch::Sender<Option<String>>,
}

fn launch_outbound(
    transport: Arc<MockUnaryTransport>,
    identity: Arc<Mutex<IdentityStore>>,
) -> OutboundRig {
    let pending = MessageQueue::new();
    let sent = MessageQueue::new();
    let (token_tx, token_rx) = watch::channel(Some("tok-out".to_string()));
    let (event_tx, events) = mpsc::unbounded_channel();

    let handle = spawn_service(OutboundService::new(
        transport,
        fast_config(),
        identity,
        pending.clone(),
        sent.clone(),
        token_rx,
        event_tx,
    ));
    OutboundRig {
        pending,
        sent,
        events,
        handle,
        _token_tx: token_tx,
    }
}

#[tokio::test]
async fn outbound_encrypts_submits_and_records_history() {
    let alice = IdentityKeyPair::generate();
    let bob = IdentityKeyPair::generate();
    let bob_public = bob.public_key_bytes();

    let submitted = Arc::new(Mutex::new(Vec::new()));
    let submitted_in = Arc::clone(&submitted);
    let transport = Arc::new(MockUnaryTransport::new(move |request, _| match request {
        UnaryRequest::Message(message) => {
            submitted_in.lock().unwrap().push(message.clone());
            Ok(UnaryResponse::Message(MessageAck { server_time: 42 }))
        }
        other => Err(TransportError::ReceiveFailed {
            reason: format!("unscripted request {:?}", other),
        }),
    }));

    let mut store = IdentityStore::new();
    let alice_public = alice.public_key().to_owned();
    store.set_local(alice);
    store.upsert_contact(ContactIdentity::from_sec1_bytes("bob", &bob_public).unwrap());
    let identity = Arc::new(Mutex::new(store));

    let mut rig = launch_outbound(transport, identity);
    rig.pending.push(OutboundMessage {
        recipient_username: "bob".into(),
        body: "susitinkam penktadieni".into(),
    });

    let event = timeout(Duration::from_secs(5), rig.events.recv())
        .await
        .expect("no outbound event")
        .unwrap();
    match event {
        OutboundEvent::Sent(sent) => {
            assert_eq!(sent.recipient_username, "bob");
            assert_eq!(sent.server_time, 42);
        }
        other => panic!("expected sent event, got {:?}", other),
    }

    assert!(rig.pending.is_empty());
    assert_eq!(rig.sent.len(), 1);

    // The server saw only ciphertext, and the recipient can open it.
    let captured = submitted.lock().unwrap().remove(0);
    assert_ne!(captured.envelope.ciphertext, b"susitinkam penktadieni");
    let shared = bob.agree(&alice_public);
    let plaintext = flare_core::crypto::aead_decrypt(&shared, &captured.envelope).unwrap();
    assert_eq!(plaintext, b"susitinkam penktadieni");

    rig.handle.request_shutdown();
    rig.handle.join().await.unwrap();
}

#[tokio::test]
async fn outbound_fetches_an_unknown_recipient_key_first() {
    let alice = IdentityKeyPair::generate();
    let bob = IdentityKeyPair::generate();
    let bob_public = bob.public_key_bytes();

    let transport = Arc::new(MockUnaryTransport::new(move |request, _| match request {
        UnaryRequest::ContactKey { username } => {
            assert_eq!(username, "bob");
            Ok(UnaryResponse::ContactKey(bob_public.clone()))
        }
        UnaryRequest::Message(_) => Ok(UnaryResponse::Message(MessageAck { server_time: 7 })),
        other => Err(TransportError::ReceiveFailed {
            reason: format!("unscripted request {:?}", other),
        }),
    }));

    let mut store = IdentityStore::new();
    store.set_local(alice);
    let identity = Arc::new(Mutex::new(store));

    let mut rig = launch_outbound(Arc::clone(&transport), Arc::clone(&identity));
    rig.pending.push(OutboundMessage {
        recipient_username: "bob".into(),
        body: "labas".into(),
    });

    let event = timeout(Duration::from_secs(5), rig.events.recv())
        .await
        .expect("no outbound event")
        .unwrap();
    assert!(matches!(event, OutboundEvent::Sent(_)));
    assert_eq!(identity.lock().unwrap().contact_count(), 1);

    rig.handle.request_shutdown();
    rig.handle.join().await.unwrap();
}

#[tokio::test]
async fn outbound_discards_when_the_recipient_is_unreachable() {
    let alice = IdentityKeyPair::generate();

    let transport = Arc::new(MockUnaryTransport::new(|request, _| match request {
        UnaryRequest::ContactKey { .. } => Ok(UnaryResponse::Deny(DenyReason::Other {
            detail: "no such user".into(),
        })),
        other => Err(TransportError::ReceiveFailed {
            reason: format!("unscripted request {:?}", other),
        }),
    }));

    let mut store = IdentityStore::new();
    store.set_local(alice);
    let identity = Arc::new(Mutex::new(store));

    let mut rig = launch_outbound(transport, identity);
    rig.pending.push(OutboundMessage {
        recipient_username: "nobody".into(),
        body: "aidas".into(),
    });

    let event = timeout(Duration::from_secs(5), rig.events.recv())
        .await
        .expect("no outbound event")
        .unwrap();
    match event {
        OutboundEvent::Discarded { message, .. } => {
            assert_eq!(message.recipient_username, "nobody");
        }
        other => panic!("expected discard event, got {:?}", other),
    }
    assert!(rig.pending.is_empty());
    assert!(rig.sent.is_empty());

    rig.handle.request_shutdown();
    rig.handle.join().await.unwrap();
}

#[tokio::test]
async fn outbound_delivers_three_messages_in_order_despite_a_mid_run_failure() {
    let alice = IdentityKeyPair::generate();
    let bob = IdentityKeyPair::generate();
    let bob_public = bob.public_key_bytes();

    // The second submission overall is dropped; everything else succeeds.
    let attempts = AtomicU32::new(0);
    let transport = Arc::new(MockUnaryTransport::new(move |request, _| match request {
        UnaryRequest::Message(_) => {
            if attempts.fetch_add(1, Ordering::SeqCst) == 1 {
                Err(TransportError::SendFailed {
                    reason: "scripted drop".into(),
                })
            } else {
                Ok(UnaryResponse::Message(MessageAck { server_time: 1 }))
            }
        }
        other => Err(TransportError::ReceiveFailed {
            reason: format!("unscripted request {:?}", other),
        }),
    }));

    let mut store = IdentityStore::new();
    store.set_local(alice);
    store.upsert_contact(ContactIdentity::from_sec1_bytes("bob", &bob_public).unwrap());
    let identity = Arc::new(Mutex::new(store));

    let mut rig = launch_outbound(transport, identity);
    for body in ["pirmas", "antras", "trecias"] {
        rig.pending.push(OutboundMessage {
            recipient_username: "bob".into(),
            body: body.into(),
        });
    }

    let mut delivered = Vec::new();
    while delivered.len() < 3 {
        let event = timeout(Duration::from_secs(10), rig.events.recv())
            .await
            .expect("delivery stalled")
            .unwrap();
        match event {
            OutboundEvent::Sent(sent) => delivered.push(sent.body),
            other => panic!("unexpected event {:?}", other),
        }
    }
    assert_eq!(delivered, vec!["pirmas", "antras", "trecias"]);
    assert!(rig.pending.is_empty());
    assert_eq!(rig.sent.len(), 3);

    rig.handle.request_shutdown();
    rig.handle.join().await.unwrap();
}

#[tokio::test]
async fn outbound_ends_when_the_transport_reports_a_lost_connection() {
    let transport = Arc::new(MockUnaryTransport::new(|request, _| {
        Err(TransportError::ReceiveFailed {
            reason: format!("unscripted request {:?}", request),
        })
    }));
    let mut store = IdentityStore::new();
    store.set_local(IdentityKeyPair::generate());

    let rig = launch_outbound(Arc::clone(&transport), Arc::new(Mutex::new(store)));
    transport.mark_lost(true);

    timeout(Duration::from_secs(5), rig.handle.join())
        .await
        .expect("outbound service kept running on a dead transport")
        .unwrap();
}

#[tokio::test]
async fn aborted_outbound_service_restarts_with_a_fresh_budget() {
    let alice = IdentityKeyPair::generate();
    let bob = IdentityKeyPair::generate();
    let bob_public = bob.public_key_bytes();

    // Submissions always fail and so do reconnects, so the service aborts.
    let transport = Arc::new(MockUnaryTransport::new(|request, _| match request {
        UnaryRequest::Message(_) => Err(TransportError::SendFailed {
            reason: "scripted outage".into(),
        }),
        other => Err(TransportError::ReceiveFailed {
            reason: format!("unscripted request {:?}", other),
        }),
    }));
    transport.fail_next_connects(100);

    let mut store = IdentityStore::new();
    store.set_local(alice);
    store.upsert_contact(ContactIdentity::from_sec1_bytes("bob", &bob_public).unwrap());

    let pending = MessageQueue::new();
    pending.push(OutboundMessage {
        recipient_username: "bob".into(),
        body: "ar girdi?".into(),
    });
    let (_token_tx, token_rx) = watch::channel(Some("tok-out".to_string()));
    let (event_tx, _events) = mpsc::unbounded_channel();

    let mut service = OutboundService::new(
        Arc::clone(&transport) as Arc<dyn UnaryTransport>,
        fast_config(),
        Arc::new(Mutex::new(store)),
        pending.clone(),
        MessageQueue::new(),
        token_rx,
        event_tx,
    );

    while !service.ended() {
        let _ = service.step().await;
    }
    assert_eq!(service.state(), OutboundState::Aborted);
    // The undelivered message survived the abort.
    assert_eq!(pending.len(), 1);

    service.restart().unwrap();
    assert_eq!(service.state(), OutboundState::Connected);
    assert!(!service.ended());
}

#[tokio::test]
async fn client_restarts_message_channels_after_abort() {
    let unary = Arc::new(MockUnaryTransport::new(|request, _| match request {
        UnaryRequest::Requirements => Ok(UnaryResponse::Requirements(
            CredentialRequirements::default(),
        )),
        UnaryRequest::UsernameOpinion { .. } => {
            Ok(UnaryResponse::UsernameOpinion(UsernameOpinion::Available))
        }
        UnaryRequest::Register(_) => Ok(UnaryResponse::Register(RegisterResponse::Token(
            "tok-sub".into(),
        ))),
        other => Err(TransportError::ReceiveFailed {
            reason: format!("unscripted request {:?}", other),
        }),
    }));
    let socket = Arc::new(MockStreamSocket::new(4096));
    // The initial connect and the whole retry budget fail.
    socket.fail_next_connects(4);

    let mut client = FlareClient::start(fast_config(), unary, Arc::clone(&socket) as Arc<dyn StreamSocket>);
    client
        .submit_credentials("herkus", "obuoliai-ir-kriauses-2024", SessionIntent::Register)
        .unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !client.inbound_finished() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "inbound service never gave up"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    client.restart_messaging();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!client.inbound_finished());

    let frames = socket.sent_frames();
    let resubscribed = frames.iter().any(|f| {
        matches!(
            wire::decode::<ClientFrame>(f),
            Ok(ClientFrame::Subscribe(request)) if request.token == "tok-sub"
        )
    });
    assert!(resubscribed, "no subscribe frame after the restart");

    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn outbound_retries_after_a_transport_failure_without_losing_the_message() {
    let alice = IdentityKeyPair::generate();
    let bob = IdentityKeyPair::generate();
    let bob_public = bob.public_key_bytes();

    let attempts = AtomicU32::new(0);
    let transport = Arc::new(MockUnaryTransport::new(move |request, _| match request {
        UnaryRequest::Message(_) => {
            if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(TransportError::SendFailed {
                    reason: "scripted drop".into(),
                })
            } else {
                Ok(UnaryResponse::Message(MessageAck { server_time: 9 }))
            }
        }
        other => Err(TransportError::ReceiveFailed {
            reason: format!("unscripted request {:?}", other),
        }),
    }));

    let mut store = IdentityStore::new();
    store.set_local(alice);
    store.upsert_contact(ContactIdentity::from_sec1_bytes("bob", &bob_public).unwrap());
    let identity = Arc::new(Mutex::new(store));

    let mut rig = launch_outbound(Arc::clone(&transport), identity);
    rig.pending.push(OutboundMessage {
        recipient_username: "bob".into(),
        body: "antras bandymas".into(),
    });

    let event = timeout(Duration::from_secs(5), rig.events.recv())
        .await
        .expect("no outbound event")
        .unwrap();
    assert!(matches!(event, OutboundEvent::Sent(_)));

    // Two submissions: the dropped one and the retry.
    let message_calls = transport
        .calls()
        .iter()
        .filter(|c| matches!(c, UnaryRequest::Message(_)))
        .count();
    assert_eq!(message_calls, 2);

    rig.handle.request_shutdown();
    rig.handle.join().await.unwrap();
}
