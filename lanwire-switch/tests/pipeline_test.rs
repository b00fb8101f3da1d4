//! Hook pipeline behaviour over in-memory sessions.

use async_trait::async_trait;
use lanwire_socket::{Action, Frame, Session};
use lanwire_switch::config::UserConfig;
use lanwire_switch::hook::{AccessHook, Hook, HookError, OnlineHook, Pipeline};
use lanwire_switch::message::{Ping, SignResponse, SignResult, SignStatus};
use lanwire_switch::point::Point;
use lanwire_switch::test_util::{
    MemoryTap, RecordingPublisher, create_arp_reply, create_arp_request, create_udp_packet,
    memory_session,
};
use lanwire_switch::{NetworkConfig, Neighbors};
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const HW: [u8; 6] = [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff];

struct Reject;

#[async_trait]
impl Hook for Reject {
    fn name(&self) -> &'static str {
        "reject"
    }

    async fn on_frame(&self, _session: &Session, _frame: &Frame) -> lanwire_switch::hook::Result<()> {
        Err(HookError::NotSigned)
    }
}

#[derive(Default)]
struct Recorder {
    seen: Mutex<Vec<Frame>>,
    closed: Mutex<usize>,
}

#[async_trait]
impl Hook for Recorder {
    fn name(&self) -> &'static str {
        "recorder"
    }

    async fn on_frame(&self, _session: &Session, frame: &Frame) -> lanwire_switch::hook::Result<()> {
        self.seen.lock().unwrap().push(frame.clone());
        Ok(())
    }

    async fn on_close(&self, _session: &Session) {
        *self.closed.lock().unwrap() += 1;
    }
}

fn network() -> NetworkConfig {
    let mut network = NetworkConfig::new("default");
    network.users.push(UserConfig {
        name: "alice".to_string(),
        password: "secret".to_string(),
    });
    network
}

fn sign_response(password: &str) -> Frame {
    let body = SignResponse {
        username: "alice".to_string(),
        password: password.to_string(),
        network: "default".to_string(),
        uuid: "point-1".to_string(),
        alias: String::new(),
    };
    Frame::control(Action::SignResponse, &body).unwrap()
}

#[tokio::test]
async fn test_short_circuit() {
    let (session, _peer) = memory_session("192.0.2.1:4000");
    let recorder = Arc::new(Recorder::default());
    let mut pipeline = Pipeline::new();
    pipeline.push(Arc::new(Reject));
    pipeline.push(recorder.clone());
    assert_eq!(pipeline.names(), vec!["reject", "recorder"]);

    let frame = Frame::data(&create_arp_request(HW, [10, 0, 0, 5], [10, 0, 0, 1])).unwrap();
    let err = pipeline.process(&session, &frame).await.unwrap_err();
    assert!(matches!(err, HookError::NotSigned));
    assert!(recorder.seen.lock().unwrap().is_empty());

    // Close notifications still reach every hook.
    pipeline.on_close(&session).await;
    assert_eq!(*recorder.closed.lock().unwrap(), 1);
}

#[tokio::test]
async fn test_passing_frame_reaches_all_hooks() {
    let (session, _peer) = memory_session("192.0.2.1:4000");
    let first = Arc::new(Recorder::default());
    let second = Arc::new(Recorder::default());
    let mut pipeline = Pipeline::new();
    pipeline.push(first.clone());
    pipeline.push(second.clone());

    let frame = Frame::control(Action::PingRequest, &Ping::now()).unwrap();
    pipeline.process(&session, &frame).await.unwrap();
    assert_eq!(first.seen.lock().unwrap().len(), 1);
    assert_eq!(second.seen.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_access_requires_sign_in() {
    let (session, _peer) = memory_session("192.0.2.1:4000");
    let access = AccessHook::new(&[network()]);

    let ping = Frame::control(Action::PingRequest, &Ping::now()).unwrap();
    assert!(matches!(
        access.on_frame(&session, &ping).await,
        Err(HookError::NotSigned)
    ));

    let data = Frame::data(&create_arp_request(HW, [10, 0, 0, 5], [10, 0, 0, 1])).unwrap();
    assert!(access.on_frame(&session, &data).await.is_err());

    // Once a point is attached the session passes.
    let tap = Arc::new(MemoryTap::new("tap0"));
    let point = Point::new("point-1", "", "alice", "default", session.clone(), tap);
    session.set_private(Arc::new(point));
    access.on_frame(&session, &ping).await.unwrap();
    access.on_frame(&session, &data).await.unwrap();
}

#[tokio::test]
async fn test_access_checks_credentials() {
    let (session, mut peer) = memory_session("192.0.2.1:4000");
    let access = AccessHook::new(&[network()]);

    access.on_frame(&session, &sign_response("secret")).await.unwrap();
    assert!(peer.rx.try_recv().is_err());

    let err = access
        .on_frame(&session, &sign_response("wrong"))
        .await
        .unwrap_err();
    assert!(matches!(err, HookError::Denied { .. }));

    let reply = peer.recv().await.unwrap();
    assert_eq!(reply.action(), Some(Action::SignResult));
    let result: SignResult = reply.parse_body().unwrap();
    assert_eq!(result.status, SignStatus::Failed);
    assert_eq!(result.network, "default");
}

#[tokio::test]
async fn test_neighbor_through_pipeline() {
    let (first, _p1) = memory_session("192.0.2.1:4000");
    let (second, _p2) = memory_session("192.0.2.2:4000");
    let publisher = Arc::new(RecordingPublisher::default());
    let neighbors = Arc::new(Neighbors::new(publisher.clone()));
    let mut pipeline = Pipeline::new();
    pipeline.push(neighbors.clone());

    let reply = create_arp_reply(HW, [10, 0, 0, 5], [0x52, 0x54, 0, 0, 0, 1], [10, 0, 0, 1]);
    pipeline
        .process(&first, &Frame::data(&reply).unwrap())
        .await
        .unwrap();
    let entry = neighbors.get_neighbor("aa:bb:cc:dd:ee:ff").unwrap();
    assert_eq!(entry.ipaddr, Ipv4Addr::new(10, 0, 0, 5));
    assert_eq!(entry.session, first.id());

    tokio::time::sleep(Duration::from_millis(5)).await;
    let reply = create_arp_reply(HW, [10, 0, 0, 9], [0x52, 0x54, 0, 0, 0, 1], [10, 0, 0, 1]);
    pipeline
        .process(&second, &Frame::data(&reply).unwrap())
        .await
        .unwrap();

    assert_eq!(neighbors.len(), 1);
    let updated = neighbors.get_neighbor("AA:BB:CC:DD:EE:FF").unwrap();
    assert_eq!(updated.ipaddr, Ipv4Addr::new(10, 0, 0, 9));
    assert_eq!(updated.session, second.id());
    assert_eq!(updated.new_time, entry.new_time);
    assert!(updated.hit_time >= entry.hit_time);
    assert_eq!(publisher.records().len(), 2);

    // Control frames are ignored.
    let ping = Frame::control(Action::PingRequest, &Ping::now()).unwrap();
    pipeline.process(&first, &ping).await.unwrap();
    assert_eq!(publisher.records().len(), 2);

    // Closing the first session leaves the entry now owned by the second.
    pipeline.on_close(&first).await;
    assert_eq!(neighbors.len(), 1);
    pipeline.on_close(&second).await;
    assert!(neighbors.is_empty());
}

#[tokio::test]
async fn test_online_counts_flows() {
    let (session, _peer) = memory_session("192.0.2.1:4000");
    let online = Arc::new(OnlineHook::new(16, Duration::from_secs(60)));
    let mut pipeline = Pipeline::new();
    pipeline.push(online.clone());

    let packet = create_udp_packet(
        HW,
        [0x52, 0x54, 0, 0, 0, 1],
        [10, 0, 0, 5],
        [10, 0, 0, 1],
        4000,
        53,
        b"q",
    );
    for _ in 0..3 {
        pipeline
            .process(&session, &Frame::data(&packet).unwrap())
            .await
            .unwrap();
    }
    let flows = online.flows();
    assert_eq!(flows.len(), 1);
    assert_eq!(flows[0].packets, 3);
    assert_eq!(flows[0].session, session.id());
}
