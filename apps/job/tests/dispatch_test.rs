//! Dispatch tests against a recording stub gateway.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::post;
use axum::Router;
use bytes::Bytes;
use prost::Message;
use relay_common::{Bus, Instance, MemoryBus};
use relay_job::config::Config;
use relay_job::consumer;
use relay_job::job::Job;
use relay_protocol::push::{PushMsg, PushType};
use relay_protocol::rpc::{
    BroadcastReply, BroadcastReq, BroadcastRoomReply, BroadcastRoomReq, PushMsgReply, PushMsgReq,
};
use relay_protocol::{ops, Proto};
use tokio::sync::mpsc;
use tokio::time::timeout;

#[derive(Debug)]
enum Recorded {
    Push(PushMsgReq),
    Broadcast(BroadcastReq),
    Room(BroadcastRoomReq),
}

type Recorder = mpsc::UnboundedSender<Recorded>;

fn proto_reply<T: Message>(msg: T) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "application/x-protobuf")],
        msg.encode_to_vec(),
    )
}

/// Gateway stand-in that records every RPC it receives.
async fn stub_comet() -> (String, mpsc::UnboundedReceiver<Recorded>) {
    let (tx, rx) = mpsc::unbounded_channel();

    async fn push(State(tx): State<Recorder>, body: Bytes) -> impl IntoResponse {
        let _ = tx.send(Recorded::Push(PushMsgReq::decode(body).unwrap()));
        proto_reply(PushMsgReply {})
    }
    async fn broadcast(State(tx): State<Recorder>, body: Bytes) -> impl IntoResponse {
        let _ = tx.send(Recorded::Broadcast(BroadcastReq::decode(body).unwrap()));
        proto_reply(BroadcastReply {})
    }
    async fn broadcast_room(State(tx): State<Recorder>, body: Bytes) -> impl IntoResponse {
        let _ = tx.send(Recorded::Room(BroadcastRoomReq::decode(body).unwrap()));
        proto_reply(BroadcastRoomReply {})
    }

    let app = Router::new()
        .route("/rpc/push", post(push))
        .route("/rpc/broadcast", post(broadcast))
        .route("/rpc/broadcast-room", post(broadcast_room))
        .with_state(tx);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}"), rx)
}

fn job(room_batch: usize, room_signal: Duration) -> Arc<Job> {
    Job::new(Arc::new(Config {
        discovery_url: String::new(),
        comet_app_id: "comet".into(),
        discovery_watch: Duration::from_secs(5),
        discovery_refresh: Duration::from_secs(10),
        bus_url: String::new(),
        bus_topic: "test".into(),
        bus_group: "test".into(),
        comet_rpc_timeout: Duration::from_millis(500),
        room_batch,
        room_signal,
    }))
}

fn register(job: &Job, hostnames: &[&str], addr: &str) {
    let instances: HashMap<String, Instance> = hostnames
        .iter()
        .map(|h| {
            (
                h.to_string(),
                Instance {
                    hostname: h.to_string(),
                    addr: addr.to_string(),
                    updated: 0,
                },
            )
        })
        .collect();
    job.reconcile(&instances);
}

async fn recv(rx: &mut mpsc::UnboundedReceiver<Recorded>) -> Recorded {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for rpc")
        .expect("recorder closed")
}

#[tokio::test]
async fn push_wraps_payload_as_framed_raw() {
    let (addr, mut rx) = stub_comet().await;
    let job = job(20, Duration::from_millis(500));
    register(&job, &["comet-1"], &addr);

    job.dispatch(PushMsg {
        r#type: PushType::Push as i32,
        operation: 1000,
        speed: 0,
        server: "comet-1".into(),
        room: String::new(),
        keys: vec!["uuid-1".into()],
        msg: b"hello".to_vec(),
    })
    .await;

    let Recorded::Push(req) = recv(&mut rx).await else {
        panic!("expected push rpc");
    };
    assert_eq!(req.keys, vec!["uuid-1".to_string()]);
    assert_eq!(req.proto_op, 1000);

    let raw = req.proto.unwrap();
    assert_eq!(raw.op, ops::OP_RAW);
    // The raw body is the exact frame the client will receive.
    let inner = Proto::read_frame(&raw.body).unwrap();
    assert_eq!(inner.op, 1000);
    assert_eq!(inner.body, b"hello");
}

#[tokio::test]
async fn push_to_unknown_server_is_dropped() {
    let job = job(20, Duration::from_millis(500));
    // No gateways registered at all: the dispatch must simply return.
    job.dispatch(PushMsg {
        r#type: PushType::Push as i32,
        operation: 1000,
        server: "comet-ghost".into(),
        keys: vec!["k".into()],
        msg: b"x".to_vec(),
        ..Default::default()
    })
    .await;
}

#[tokio::test]
async fn broadcast_splits_speed_across_gateways() {
    let (addr, mut rx) = stub_comet().await;
    let job = job(20, Duration::from_millis(500));
    register(&job, &["comet-1", "comet-2"], &addr);

    job.dispatch(PushMsg {
        r#type: PushType::Broadcast as i32,
        operation: 1000,
        speed: 10,
        msg: b"everyone".to_vec(),
        ..Default::default()
    })
    .await;

    for _ in 0..2 {
        let Recorded::Broadcast(req) = recv(&mut rx).await else {
            panic!("expected broadcast rpc");
        };
        assert_eq!(req.speed, 5);
        assert_eq!(req.proto_op, 1000);
    }
}

#[tokio::test]
async fn room_messages_batch_into_one_raw_buffer() {
    let (addr, mut rx) = stub_comet().await;
    let job = job(2, Duration::from_secs(5));
    register(&job, &["comet-1"], &addr);

    for body in [b"one".to_vec(), b"two".to_vec()] {
        job.dispatch(PushMsg {
            r#type: PushType::Room as i32,
            operation: 1000,
            room: "chat://7".into(),
            msg: body,
            ..Default::default()
        })
        .await;
    }

    let Recorded::Room(req) = recv(&mut rx).await else {
        panic!("expected room rpc");
    };
    assert_eq!(req.room_id, "chat://7");
    let raw = req.proto.unwrap();
    assert_eq!(raw.op, ops::OP_RAW);

    // Two complete frames, concatenated.
    let (first, used) = Proto::read_prefix(&raw.body).unwrap();
    let (second, used2) = Proto::read_prefix(&raw.body[used..]).unwrap();
    assert_eq!(first.body, b"one");
    assert_eq!(second.body, b"two");
    assert_eq!(used + used2, raw.body.len());
}

#[tokio::test]
async fn room_flushes_on_signal_window() {
    let (addr, mut rx) = stub_comet().await;
    let job = job(100, Duration::from_millis(50));
    register(&job, &["comet-1"], &addr);

    job.dispatch(PushMsg {
        r#type: PushType::Room as i32,
        operation: 1000,
        room: "chat://7".into(),
        msg: b"lonely".to_vec(),
        ..Default::default()
    })
    .await;

    // Far below the batch size, so only the window flushes it.
    let Recorded::Room(req) = recv(&mut rx).await else {
        panic!("expected room rpc");
    };
    let inner = Proto::read_frame(&req.proto.unwrap().body).unwrap();
    assert_eq!(inner.body, b"lonely");
}

#[tokio::test]
async fn retry_gives_up_on_dead_gateway() {
    let job = job(20, Duration::from_millis(500));
    register(&job, &["comet-dead"], "http://127.0.0.1:9");

    // Three attempts, then drop — must terminate, not hang or panic.
    timeout(
        Duration::from_secs(5),
        job.dispatch(PushMsg {
            r#type: PushType::Push as i32,
            operation: 1000,
            server: "comet-dead".into(),
            keys: vec!["k".into()],
            msg: b"x".to_vec(),
            ..Default::default()
        }),
    )
    .await
    .expect("dispatch hung");
}

#[tokio::test]
async fn consumer_pulls_from_gateway_partition() {
    let (addr, mut rx) = stub_comet().await;
    let job = job(20, Duration::from_millis(500));
    register(&job, &["comet-1"], &addr);

    let bus = MemoryBus::new();
    let msg = PushMsg {
        r#type: PushType::Push as i32,
        operation: 1000,
        server: "comet-1".into(),
        keys: vec!["uuid-1".into()],
        msg: b"via-bus".to_vec(),
        ..Default::default()
    };
    bus.publish("comet-1", msg.encode_to_vec()).await.unwrap();

    tokio::spawn(consumer::consume(job.clone(), bus.clone()));

    let Recorded::Push(req) = recv(&mut rx).await else {
        panic!("expected push rpc");
    };
    let inner = Proto::read_frame(&req.proto.unwrap().body).unwrap();
    assert_eq!(inner.body, b"via-bus");
}
