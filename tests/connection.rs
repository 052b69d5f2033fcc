mod common;

use std::{collections::HashSet, sync::Arc, time::Duration};

use bytes::{BufMut, Bytes, BytesMut};
use common::{context, pair, RawPeer, RecordingObserver};
use futures::future::join_all;
use parking_lot::Mutex;
use tether::{
    adapter_fn,
    context::ConnectionObserver,
    protocol::{
        encode_control, encode_reply, read_i32, CompressionStatus, Header, MessageType,
        ReplyStatus, HEADER_SIZE,
    },
    CloseMode, Connection, ConnectionConfig, Endpoint, Error, InvocationMode, RuntimeContext,
    SendStatus, State,
};
use tokio::sync::{mpsc, Semaphore};

const WAIT: Duration = Duration::from_secs(5);

fn echo() -> Arc<dyn tether::Adapter> {
    adapter_fn("echo", |req| async move { Ok(req.body) })
}

#[tokio::test]
async fn request_round_trip() {
    let ctx = RuntimeContext::default();
    let (client, server) = pair(&ctx, &ctx, Some(echo())).await;
    assert_eq!(client.state(), State::Active);
    assert_eq!(server.state(), State::Active);

    let reply = client.request(b"hello").await.unwrap();
    assert_eq!(reply.status, ReplyStatus::Ok);
    assert_eq!(reply.into_result().unwrap(), Bytes::from_static(b"hello"));
    assert_eq!(client.pending_requests(), 0);
}

#[tokio::test]
async fn request_without_adapter_fails_with_object_not_exist() {
    let ctx = RuntimeContext::default();
    let (client, _server) = pair(&ctx, &ctx, None).await;

    let reply = client.request(b"anyone?").await.unwrap();
    assert_eq!(reply.status, ReplyStatus::ObjectNotExist);
    assert!(matches!(
        reply.into_result(),
        Err(Error::Dispatch {
            status: ReplyStatus::ObjectNotExist,
            ..
        })
    ));
}

#[tokio::test]
async fn dispatch_panic_replies_unknown_exception() {
    let ctx = RuntimeContext::default();
    let adapter = adapter_fn("panics", |_req| async move {
        if true {
            panic!("servant failed");
        }
        Ok(Bytes::new())
    });
    let (client, server) = pair(&ctx, &ctx, Some(adapter)).await;

    let reply = client.request(b"boom").await.unwrap();
    assert_eq!(reply.status, ReplyStatus::UnknownException);
    assert_eq!(server.state(), State::Active);
    assert_eq!(server.dispatch_count(), 0);
}

#[tokio::test]
async fn concurrent_requests_get_unique_ids_and_matching_replies() {
    let ctx = RuntimeContext::default();
    let (client, _server) = pair(&ctx, &ctx, Some(echo())).await;

    let invocations: Vec<_> = (0..100u32)
        .map(|i| {
            client
                .invoke(InvocationMode::Twoway, &i.to_be_bytes(), false)
                .unwrap()
        })
        .collect();
    let ids: HashSet<i32> = invocations.iter().map(|inv| inv.request_id()).collect();
    assert_eq!(ids.len(), 100);
    assert!(!ids.contains(&0));

    let replies = join_all(invocations).await;
    for (i, reply) in replies.into_iter().enumerate() {
        let body = reply.unwrap().into_result().unwrap();
        assert_eq!(body.as_ref(), (i as u32).to_be_bytes());
    }
}

#[tokio::test]
async fn messages_are_written_in_send_order() {
    let ctx = RuntimeContext::default();
    let (client, mut peer) = RawPeer::serve(&ctx, 256).await;

    let mut invocations = Vec::new();
    for i in 0..50u8 {
        invocations.push(
            client
                .invoke(InvocationMode::Oneway, &[i; 40], false)
                .unwrap(),
        );
    }

    for i in 0..50u8 {
        let (header, body) = peer.expect_frame(WAIT).await;
        assert_eq!(header.message_type, MessageType::Request);
        assert_eq!(read_i32(&body, 0), Some(0));
        assert_eq!(&body[4..], &[i; 40]);
    }
    for invocation in join_all(invocations).await {
        invocation.unwrap();
    }
}

#[tokio::test]
async fn observer_sees_monotonic_transitions() {
    let observer = Arc::new(RecordingObserver::default());
    let ctx = RuntimeContext::builder()
        .with_observer(observer.clone())
        .build()
        .unwrap();
    let (client, server) = pair(&ctx, &ctx, Some(echo())).await;

    client.request(b"ping").await.unwrap();
    server.hold();
    server.activate();
    client.close(CloseMode::Gracefully);
    tokio::time::timeout(WAIT, client.wait_finished()).await.unwrap();
    tokio::time::timeout(WAIT, server.wait_finished()).await.unwrap();

    for (_, old, new) in observer.transitions.lock().iter() {
        let swap = matches!(
            (old, new),
            (State::Holding, State::Active) | (State::Active, State::Holding)
        );
        assert!(swap || new > old, "{old} -> {new}");
    }
    assert_eq!(
        observer.states_of(client.id()),
        vec![
            State::NotValidated,
            State::Active,
            State::Closing,
            State::ClosingPending,
            State::Closed,
            State::Finished,
        ]
    );
    assert!(matches!(
        client.last_error(),
        Some(Error::ConnectionClosedLocally { graceful: true })
    ));
    assert!(matches!(
        server.last_error(),
        Some(Error::ConnectionClosedByPeer)
    ));
}

#[tokio::test]
async fn connection_ids_are_unique() {
    let ctx = RuntimeContext::default();
    let mut ids = HashSet::new();
    for _ in 0..5 {
        let (client, server) = pair(&ctx, &ctx, None).await;
        assert!(ids.insert(client.id()));
        assert!(ids.insert(server.id()));
    }
}

#[tokio::test]
async fn invoke_on_closed_connection_fails_without_sending() {
    let ctx = RuntimeContext::default();
    let (client, _server) = pair(&ctx, &ctx, Some(echo())).await;
    client.close(CloseMode::Forcefully);
    assert_eq!(client.state(), State::Closed);

    let err = client.request(b"late").await.unwrap_err();
    assert!(!err.was_sent());
    assert!(matches!(
        err.error,
        Error::ConnectionClosedLocally { graceful: false }
    ));
    assert!(client.batch_request(Bytes::from_static(b"x"), false).is_err());
}

#[tokio::test]
async fn forceful_close_fails_pending_requests() {
    let ctx = RuntimeContext::default();
    let gate = Arc::new(Semaphore::new(0));
    let adapter = {
        let gate = gate.clone();
        adapter_fn("gated", move |req| {
            let gate = gate.clone();
            async move {
                let _permit = gate.acquire().await;
                Ok(req.body)
            }
        })
    };
    let (client, _server) = pair(&ctx, &ctx, Some(adapter)).await;

    let mut invocation = client
        .invoke(InvocationMode::Twoway, b"stuck", false)
        .unwrap();
    invocation.sent().await.unwrap();
    assert_eq!(client.pending_requests(), 1);

    client.close(CloseMode::Forcefully);
    let err = invocation.await.unwrap_err();
    assert!(err.was_sent());
    assert_eq!(client.pending_requests(), 0);
    gate.add_permits(1);
}

#[tokio::test]
async fn canceled_request_is_never_written() {
    let ctx = RuntimeContext::default();
    let (client, mut peer) = RawPeer::serve(&ctx, 64).await;

    let first = client
        .invoke(InvocationMode::Twoway, &[1; 1024], false)
        .unwrap();
    assert_eq!(first.send_status(), SendStatus::Queued);
    let second = client
        .invoke(InvocationMode::Twoway, &[2; 16], false)
        .unwrap();
    let third = client
        .invoke(InvocationMode::Twoway, &[3; 16], false)
        .unwrap();
    assert_eq!(second.send_status(), SendStatus::Queued);

    second.cancel();
    let err = second.await.unwrap_err();
    assert!(matches!(err.error, Error::InvocationCanceled));
    assert!(!err.was_sent());

    let (_, body) = peer.expect_frame(WAIT).await;
    assert_eq!(read_i32(&body, 0), Some(first.request_id()));
    let (_, body) = peer.expect_frame(WAIT).await;
    assert_eq!(read_i32(&body, 0), Some(third.request_id()));
    assert_eq!(&body[4..], &[3; 16]);
    assert_eq!(client.state(), State::Active);
}

#[tokio::test]
async fn request_timeout_cancels_invocation() {
    let ctx = RuntimeContext::default();
    let (client, mut peer) = RawPeer::serve(&ctx, common::BUFFER).await;

    let invocation = client
        .invoke(InvocationMode::Twoway, b"slow", false)
        .unwrap();
    let request_id = invocation.request_id();
    let err = invocation
        .timeout(Duration::from_millis(20))
        .await
        .unwrap_err();
    assert!(matches!(err.error, Error::InvocationTimeout(_)));
    assert!(err.was_sent());
    assert_eq!(client.pending_requests(), 0);

    // A late reply for the canceled request is discarded.
    let (_, body) = peer.expect_frame(WAIT).await;
    assert_eq!(read_i32(&body, 0), Some(request_id));
    peer.send(&encode_reply(request_id, ReplyStatus::Ok, b"late"))
        .await;
    client.heartbeat().unwrap();
    peer.expect_frame(WAIT).await;
    assert_eq!(client.state(), State::Active);
}

#[tokio::test]
async fn compressed_frame_without_compressor_closes_connection() {
    let ctx = RuntimeContext::builder()
        .with_compressor(None)
        .build()
        .unwrap();
    let (client, mut peer) = RawPeer::serve(&ctx, common::BUFFER).await;

    let payload = [7u8; 32];
    let size = HEADER_SIZE + 4 + payload.len();
    let mut frame = BytesMut::new();
    frame.put_slice(
        &Header {
            message_type: MessageType::Request,
            compression: CompressionStatus::Compressed,
            size: size as i32,
        }
        .encode(),
    );
    frame.put_u32(64);
    frame.put_slice(&payload);
    peer.send(&frame).await;

    let mut states = client.subscribe_state();
    tokio::time::timeout(WAIT, states.wait_for(|state| *state >= State::Closed))
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(
        client.last_error(),
        Some(Error::FeatureNotSupported(_))
    ));
}

#[tokio::test]
async fn bad_magic_closes_connection() {
    let ctx = RuntimeContext::default();
    let (client, mut peer) = RawPeer::serve(&ctx, common::BUFFER).await;

    peer.send(b"HTTP/1.1 200 OK\r\n").await;
    tokio::time::timeout(WAIT, client.wait_finished()).await.unwrap();
    assert!(matches!(client.last_error(), Some(Error::BadMagic(magic)) if &magic == b"HTTP"));
}

#[tokio::test]
async fn oversized_message_closes_connection() {
    let ctx = context(ConnectionConfig::default().with_max_message_size(64));
    let (client, mut peer) = RawPeer::serve(&ctx, common::BUFFER).await;

    peer.send_request(1, &[0; 128]).await;
    tokio::time::timeout(WAIT, client.wait_finished()).await.unwrap();
    assert!(matches!(
        client.last_error(),
        Some(Error::MessageTooLarge { max: 64, .. })
    ));
}

#[tokio::test]
async fn validation_rejects_unexpected_first_frame() {
    let ctx = RuntimeContext::default();
    let (client_io, server_io) = tokio::io::duplex(common::BUFFER);
    let mut peer = RawPeer::new(server_io);
    peer.send(&encode_control(MessageType::CloseConnection)).await;

    let err = tether::Connection::connect(&ctx, common::endpoint(), None, Box::new(client_io))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Protocol(_)));
}

#[tokio::test(start_paused = true)]
async fn validation_times_out() {
    let ctx = context(ConnectionConfig::default().with_connect_timeout(Duration::from_secs(1)));
    let (client_io, _server_io) = tokio::io::duplex(common::BUFFER);

    let err = tether::Connection::connect(&ctx, common::endpoint(), None, Box::new(client_io))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ConnectTimeout));
}

#[tokio::test(start_paused = true)]
async fn inactive_connection_closes_gracefully() {
    let client_ctx = context(
        ConnectionConfig::default()
            .with_inactivity_timeout(Duration::from_secs(1))
            .with_idle_timeout(None)
            .with_heartbeats(false),
    );
    let server_ctx = RuntimeContext::default();
    let (client, server) = pair(&client_ctx, &server_ctx, Some(echo())).await;

    client.request(b"once").await.unwrap();
    tokio::time::timeout(Duration::from_secs(30), client.wait_finished())
        .await
        .unwrap();
    assert!(matches!(
        client.last_error(),
        Some(Error::ConnectionInactive(_))
    ));
    tokio::time::timeout(Duration::from_secs(30), server.wait_finished())
        .await
        .unwrap();
    assert!(matches!(
        server.last_error(),
        Some(Error::ConnectionClosedByPeer)
    ));
}

#[tokio::test(start_paused = true)]
async fn idle_connection_closes_forcefully() {
    let ctx = context(
        ConnectionConfig::default()
            .with_idle_timeout(Duration::from_secs(2))
            .with_heartbeats(false),
    );
    let (client, _peer) = RawPeer::serve(&ctx, common::BUFFER).await;

    tokio::time::timeout(Duration::from_secs(30), client.wait_finished())
        .await
        .unwrap();
    assert!(matches!(client.last_error(), Some(Error::ConnectionIdle(_))));
}

#[tokio::test(start_paused = true)]
async fn heartbeats_keep_idle_peers_alive() {
    let ctx = context(
        ConnectionConfig::default()
            .with_idle_timeout(Duration::from_secs(10))
            .with_inactivity_timeout(None),
    );
    let (client, server) = pair(&ctx, &ctx, None).await;

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(client.state(), State::Active);
    assert_eq!(server.state(), State::Active);
}

#[tokio::test]
async fn peer_close_waits_for_dispatches_before_replying_close() {
    let observer = Arc::new(RecordingObserver::default());
    let ctx = RuntimeContext::builder()
        .with_observer(observer.clone())
        .build()
        .unwrap();
    let gate = Arc::new(Semaphore::new(0));
    let (started_tx, mut started_rx) = mpsc::unbounded_channel();
    let adapter = {
        let gate = gate.clone();
        adapter_fn("gated", move |req| {
            let gate = gate.clone();
            let started_tx = started_tx.clone();
            async move {
                let _ = started_tx.send(req.request_id);
                let _permit = gate.acquire().await;
                Ok(req.body)
            }
        })
    };
    let (server, mut peer) = RawPeer::connect(&ctx, Some(adapter)).await;
    server.activate();

    for id in 1..=3 {
        peer.send_request(id, &[id as u8]).await;
    }
    peer.send(&encode_control(MessageType::CloseConnection)).await;
    for _ in 0..3 {
        tokio::time::timeout(WAIT, started_rx.recv()).await.unwrap();
    }

    let mut states = server.subscribe_state();
    tokio::time::timeout(WAIT, states.wait_for(|state| *state == State::Closing))
        .await
        .unwrap()
        .unwrap();
    assert!(peer.is_silent(Duration::from_millis(50)).await);
    assert_eq!(server.dispatch_count(), 3);

    gate.add_permits(3);
    let mut replied = HashSet::new();
    for _ in 0..3 {
        let (header, body) = peer.expect_frame(WAIT).await;
        assert_eq!(header.message_type, MessageType::Reply);
        replied.insert(read_i32(&body, 0).unwrap());
    }
    assert_eq!(replied, HashSet::from([1, 2, 3]));
    let (header, _) = peer.expect_frame(WAIT).await;
    assert_eq!(header.message_type, MessageType::CloseConnection);

    drop(peer);
    tokio::time::timeout(WAIT, server.wait_finished()).await.unwrap();
    let states = observer.states_of(server.id());
    assert_eq!(
        &states[states.len() - 4..],
        &[
            State::Closing,
            State::ClosingPending,
            State::Closed,
            State::Finished
        ]
    );
}

#[tokio::test]
async fn finished_waits_for_in_flight_dispatches() {
    let ctx = RuntimeContext::default();
    let gate = Arc::new(Semaphore::new(0));
    let (started_tx, mut started_rx) = mpsc::unbounded_channel();
    let adapter = {
        let gate = gate.clone();
        adapter_fn("gated", move |req| {
            let gate = gate.clone();
            let started_tx = started_tx.clone();
            async move {
                let _ = started_tx.send(());
                let _permit = gate.acquire().await;
                Ok(req.body)
            }
        })
    };
    let (client, server) = pair(&ctx, &ctx, Some(adapter)).await;

    let invocation = client
        .invoke(InvocationMode::Twoway, b"work", false)
        .unwrap();
    tokio::time::timeout(WAIT, started_rx.recv()).await.unwrap();
    client.close(CloseMode::Forcefully);
    drop(invocation);

    let mut states = server.subscribe_state();
    tokio::time::timeout(WAIT, states.wait_for(|state| *state >= State::Closed))
        .await
        .unwrap()
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(server.state(), State::Closed);

    gate.add_permits(1);
    tokio::time::timeout(WAIT, server.wait_finished()).await.unwrap();
    assert_eq!(server.dispatch_count(), 0);
}

#[tokio::test]
async fn holding_connection_defers_requests() {
    let ctx = RuntimeContext::default();
    let (client_io, server_io) = tokio::io::duplex(common::BUFFER);
    let (client, server) = tokio::join!(
        tether::Connection::connect(&ctx, common::endpoint(), None, Box::new(client_io)),
        tether::Connection::accept(&ctx, common::endpoint(), Box::new(server_io), Some(echo())),
    );
    let (client, server) = (client.unwrap(), server.unwrap());
    assert_eq!(server.state(), State::Holding);

    let invocation = client
        .invoke(InvocationMode::Twoway, b"wait for it", false)
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(server.dispatch_count(), 0);
    assert_eq!(client.pending_requests(), 1);

    server.activate();
    let reply = tokio::time::timeout(WAIT, invocation).await.unwrap().unwrap();
    assert_eq!(reply.body, Bytes::from_static(b"wait for it"));
}

#[tokio::test]
async fn batch_requests_are_dispatched_in_one_frame() {
    let ctx = RuntimeContext::default();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let adapter = adapter_fn("sink", move |req| {
        let tx = tx.clone();
        async move {
            assert!(req.is_oneway());
            let _ = tx.send(req.body);
            Ok(Bytes::new())
        }
    });
    let (client, _server) = pair(&ctx, &ctx, Some(adapter)).await;

    for body in ["a", "bb", "ccc"] {
        client
            .batch_request(Bytes::from_static(body.as_bytes()), false)
            .unwrap();
    }
    assert_eq!(client.batch_len(), 3);
    assert!(client.flush_batch().unwrap().is_some());
    assert_eq!(client.batch_len(), 0);
    assert!(client.flush_batch().unwrap().is_none());

    let mut received = Vec::new();
    for _ in 0..3 {
        received.push(tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap());
    }
    assert_eq!(received, vec!["a", "bb", "ccc"]);
}

#[cfg(feature = "deflate")]
#[tokio::test]
async fn compressed_requests_round_trip() {
    let ctx = RuntimeContext::default();
    let (client, _server) = pair(&ctx, &ctx, Some(echo())).await;

    let body = vec![42u8; 4096];
    let reply = client
        .invoke(InvocationMode::Twoway, &body, true)
        .unwrap()
        .await
        .unwrap();
    assert_eq!(reply.into_result().unwrap().as_ref(), &body[..]);
}

#[tokio::test]
async fn close_callback_fires_once_closed() {
    let ctx = RuntimeContext::default();
    let (client, _server) = pair(&ctx, &ctx, None).await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    client.set_close_callback(move |connection| {
        let _ = tx.send(connection.state());
    });

    client.close(CloseMode::Forcefully);
    assert_eq!(rx.recv().await, Some(State::Closed));
}

/// Records the state each notified connection reports from inside the observer.
#[derive(Default)]
struct QueryingObserver {
    connection: Mutex<Option<Connection>>,
    seen: Mutex<Vec<State>>,
}

impl ConnectionObserver for QueryingObserver {
    fn state_changed(&self, connection_id: u64, _old: State, _new: State) {
        let connection = self.connection.lock().clone();
        if let Some(connection) = connection.filter(|conn| conn.id() == connection_id) {
            self.seen.lock().push(connection.state());
        }
    }
}

#[tokio::test]
async fn observer_may_query_the_connection() {
    let observer = Arc::new(QueryingObserver::default());
    let ctx = RuntimeContext::builder()
        .with_observer(observer.clone())
        .build()
        .unwrap();
    let (client, _server) = pair(&ctx, &ctx, None).await;
    *observer.connection.lock() = Some(client.clone());

    client.close(CloseMode::Forcefully);
    tokio::time::timeout(WAIT, client.wait_finished()).await.unwrap();
    assert_eq!(*observer.seen.lock(), vec![State::Closed, State::Finished]);
    observer.connection.lock().take();
}

#[tokio::test]
async fn datagram_close_skips_the_handshake() {
    let observer = Arc::new(RecordingObserver::default());
    let ctx = RuntimeContext::builder()
        .with_observer(observer.clone())
        .build()
        .unwrap();
    let (client_io, server_io) = tokio::io::duplex(common::BUFFER);
    let mut peer = RawPeer::new(server_io);
    let client = Connection::connect(
        &ctx,
        Endpoint::udp("127.0.0.1", 4061),
        None,
        Box::new(client_io),
    )
    .await
    .unwrap();
    assert_eq!(client.state(), State::Active);

    // A close frame from the peer is ignored on datagram connections.
    peer.send(&encode_control(MessageType::CloseConnection)).await;
    peer.send_request(5, b"still there?").await;
    let (header, body) = peer.expect_frame(WAIT).await;
    assert_eq!(header.message_type, MessageType::Reply);
    assert_eq!(read_i32(&body, 0), Some(5));
    assert_eq!(client.state(), State::Active);

    client.close(CloseMode::Gracefully);
    assert_eq!(client.state(), State::Closed);
    tokio::time::timeout(WAIT, client.wait_finished()).await.unwrap();
    assert!(tokio::time::timeout(WAIT, peer.read_frame())
        .await
        .unwrap()
        .is_none());
    assert_eq!(
        observer.states_of(client.id()),
        vec![
            State::NotValidated,
            State::Active,
            State::Closed,
            State::Finished
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn close_timeout_closes_when_peer_never_answers() {
    let observer = Arc::new(RecordingObserver::default());
    let ctx = RuntimeContext::builder()
        .with_config(ConnectionConfig::default().with_close_timeout(Duration::from_secs(1)))
        .with_observer(observer.clone())
        .build()
        .unwrap();
    let (client, mut peer) = RawPeer::serve(&ctx, common::BUFFER).await;

    client.close(CloseMode::Gracefully);
    let (header, _) = peer.expect_frame(WAIT).await;
    assert_eq!(header.message_type, MessageType::CloseConnection);
    assert_eq!(client.state(), State::ClosingPending);

    tokio::time::timeout(Duration::from_secs(30), client.wait_finished())
        .await
        .unwrap();
    let states = observer.states_of(client.id());
    assert_eq!(
        &states[states.len() - 4..],
        &[
            State::Closing,
            State::ClosingPending,
            State::Closed,
            State::Finished
        ]
    );
    assert!(matches!(
        client.last_error(),
        Some(Error::ConnectionClosedLocally { graceful: true })
    ));
}

#[tokio::test]
async fn reading_pauses_at_max_dispatches() {
    let ctx = context(ConnectionConfig::default().with_max_dispatches(1));
    let gate = Arc::new(Semaphore::new(0));
    let (started_tx, mut started_rx) = mpsc::unbounded_channel();
    let adapter = {
        let gate = gate.clone();
        adapter_fn("gated", move |req| {
            let gate = gate.clone();
            let started_tx = started_tx.clone();
            async move {
                let _ = started_tx.send(req.request_id);
                let _permit = gate.acquire().await;
                Ok(req.body)
            }
        })
    };
    let (server, mut peer) = RawPeer::connect(&ctx, Some(adapter)).await;
    server.activate();

    for id in 1..=3 {
        peer.send_request(id, &[id as u8]).await;
    }
    let first = tokio::time::timeout(WAIT, started_rx.recv()).await.unwrap();
    assert_eq!(first, Some(1));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(started_rx.try_recv().is_err());
    assert_eq!(server.dispatch_count(), 1);

    gate.add_permits(3);
    for id in 1..=3 {
        let (header, body) = peer.expect_frame(WAIT).await;
        assert_eq!(header.message_type, MessageType::Reply);
        assert_eq!(read_i32(&body, 0), Some(id));
    }
    assert_eq!(server.dispatch_count(), 0);
}

#[tokio::test]
async fn close_with_wait_holds_close_frame_until_replies_arrive() {
    let ctx = RuntimeContext::default();
    let (client, mut peer) = RawPeer::serve(&ctx, common::BUFFER).await;

    let invocation = client
        .invoke(InvocationMode::Twoway, b"in flight", false)
        .unwrap();
    let (_, body) = peer.expect_frame(WAIT).await;
    let request_id = read_i32(&body, 0).unwrap();

    client.close(CloseMode::GracefullyWithWait);
    assert_eq!(client.state(), State::Closing);
    assert!(peer.is_silent(Duration::from_millis(50)).await);

    peer.send(&encode_reply(request_id, ReplyStatus::Ok, b"done"))
        .await;
    let reply = tokio::time::timeout(WAIT, invocation)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply.body, Bytes::from_static(b"done"));

    let (header, _) = peer.expect_frame(WAIT).await;
    assert_eq!(header.message_type, MessageType::CloseConnection);
    peer.send(&encode_control(MessageType::CloseConnection)).await;
    tokio::time::timeout(WAIT, client.wait_finished()).await.unwrap();
    assert!(matches!(
        client.last_error(),
        Some(Error::ConnectionClosedLocally { graceful: true })
    ));
}

#[tokio::test]
async fn fatal_cancel_closes_the_connection() {
    let ctx = RuntimeContext::default();
    let (client, _peer) = RawPeer::serve(&ctx, common::BUFFER).await;

    let invocation = client
        .invoke(InvocationMode::Twoway, b"doomed", false)
        .unwrap();
    invocation
        .cancel_handle()
        .cancel_with(Error::ConnectionLost("transport reset".into()));
    assert!(client.state() >= State::Closed);
    assert_eq!(client.pending_requests(), 0);

    let err = invocation.await.unwrap_err();
    assert!(matches!(err.error, Error::ConnectionLost(_)));
    tokio::time::timeout(WAIT, client.wait_finished()).await.unwrap();
    assert!(matches!(
        client.last_error(),
        Some(Error::ConnectionLost(_))
    ));
}

#[tokio::test]
async fn canceled_partial_write_still_completes_the_frame() {
    let ctx = RuntimeContext::default();
    let (client, mut peer) = RawPeer::serve(&ctx, 64).await;

    let first = client
        .invoke(InvocationMode::Twoway, &[1; 1024], false)
        .unwrap();
    assert_eq!(first.send_status(), SendStatus::Queued);
    let first_id = first.request_id();
    first.cancel();
    let err = first.await.unwrap_err();
    assert!(matches!(err.error, Error::InvocationCanceled));
    assert!(err.was_sent());

    let second = client
        .invoke(InvocationMode::Twoway, b"after", false)
        .unwrap();

    let (header, body) = peer.expect_frame(WAIT).await;
    assert_eq!(header.size as usize, HEADER_SIZE + 4 + 1024);
    assert_eq!(read_i32(&body, 0), Some(first_id));
    assert_eq!(&body[4..], &[1; 1024]);
    let (_, body) = peer.expect_frame(WAIT).await;
    assert_eq!(read_i32(&body, 0), Some(second.request_id()));
    assert_eq!(&body[4..], b"after");

    peer.send(&encode_reply(first_id, ReplyStatus::Ok, b"ignored"))
        .await;
    peer.send(&encode_reply(second.request_id(), ReplyStatus::Ok, b"ok"))
        .await;
    let reply = tokio::time::timeout(WAIT, second).await.unwrap().unwrap();
    assert_eq!(reply.body, Bytes::from_static(b"ok"));
    assert_eq!(client.pending_requests(), 0);
    assert_eq!(client.state(), State::Active);
}
