//! Mesos HTTP binding against a mock master.

mod common;

use std::time::Duration;

use relay_id::{AgentId, OfferId, TaskId};
use relay_mesos::driver::recordio::encode;
use relay_mesos::driver::{ClusterDriver, DriverError, DriverEvent, MesosDriver, TaskState};
use relay_mesos::scheduler::TaskTemplate;
use relay_mesos::Direction;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use common::framework;

const STREAM_ID: &str = "stream-1";
const SCHEDULER_PATH: &str = "/api/v1/scheduler";

fn event_stream(events: &[Value]) -> Vec<u8> {
    events
        .iter()
        .flat_map(|event| encode(&serde_json::to_vec(event).unwrap()))
        .collect()
}

fn subscribed() -> Value {
    json!({
        "type": "SUBSCRIBED",
        "subscribed": {
            "framework_id": { "value": "fw-1" },
            "heartbeat_interval_seconds": 15.0
        }
    })
}

fn offers() -> Value {
    json!({
        "type": "OFFERS",
        "offers": { "offers": [{
            "id": { "value": "offer-1" },
            "agent_id": { "value": "agent-1" },
            "hostname": "agent1.example.com",
            "resources": [
                { "name": "cpus", "type": "SCALAR", "scalar": { "value": 2.0 } },
                { "name": "mem", "type": "SCALAR", "scalar": { "value": 1024.0 } },
                { "name": "ports", "type": "RANGES",
                  "ranges": { "range": [{ "begin": 31000, "end": 32000 }] } }
            ]
        }]}
    })
}

fn update(task_id: TaskId, state: &str, uuid: Option<&str>) -> Value {
    let mut status = json!({
        "task_id": { "value": task_id.to_string() },
        "state": state,
        "agent_id": { "value": "agent-1" },
        "message": "command exited with 1"
    });
    if let Some(uuid) = uuid {
        status["uuid"] = json!(uuid);
    }
    json!({ "type": "UPDATE", "update": { "status": status } })
}

async fn mount_subscribe(server: &MockServer, events: &[Value]) {
    Mock::given(method("POST"))
        .and(path(SCHEDULER_PATH))
        .and(body_partial_json(json!({ "type": "SUBSCRIBE" })))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Mesos-Stream-Id", STREAM_ID)
                .set_body_raw(event_stream(events), "application/json"),
        )
        .expect(1)
        .mount(server)
        .await;
}

async fn next(rx: &mut mpsc::Receiver<DriverEvent>) -> DriverEvent {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("event stream closed")
}

#[tokio::test]
async fn test_event_stream_translation() {
    let server = MockServer::start().await;
    let failed = TaskId::new();
    let foreign_task = json!({
        "type": "UPDATE",
        "update": { "status": {
            "task_id": { "value": "someone-elses-task" },
            "state": "TASK_RUNNING"
        }}
    });
    mount_subscribe(
        &server,
        &[
            subscribed(),
            json!({ "type": "HEARTBEAT" }),
            offers(),
            foreign_task,
            update(failed, "TASK_KILLING", None),
            update(failed, "TASK_FAILED", Some("dXVpZA==")),
        ],
    )
    .await;
    Mock::given(method("POST"))
        .and(path(SCHEDULER_PATH))
        .and(header("Mesos-Stream-Id", STREAM_ID))
        .and(body_partial_json(json!({
            "type": "ACKNOWLEDGE",
            "framework_id": { "value": "fw-1" },
            "acknowledge": {
                "agent_id": { "value": "agent-1" },
                "task_id": { "value": failed.to_string() },
                "uuid": "dXVpZA=="
            }
        })))
        .respond_with(ResponseTemplate::new(202))
        .expect(1)
        .mount(&server)
        .await;

    let driver = MesosDriver::connect(&server.uri()).unwrap();
    let mut events = driver.subscribe(&framework()).await.unwrap();

    match next(&mut events).await {
        DriverEvent::Registered { framework_id } => assert_eq!(framework_id.as_str(), "fw-1"),
        other => panic!("expected registration, got {other:?}"),
    }

    match next(&mut events).await {
        DriverEvent::Offers(offers) => {
            assert_eq!(offers.len(), 1);
            let offer = &offers[0];
            assert_eq!(offer.id.as_str(), "offer-1");
            assert_eq!(offer.agent_id.as_str(), "agent-1");
            assert_eq!(offer.hostname, "agent1.example.com");
            assert_eq!(offer.resources.get("cpus"), 2.0);
            assert_eq!(offer.resources.get("mem"), 1024.0);
            assert_eq!(offer.resources.get("ports"), 0.0);
        }
        other => panic!("expected offers, got {other:?}"),
    }

    match next(&mut events).await {
        DriverEvent::Update(update) => {
            assert_eq!(update.task_id, failed);
            assert_eq!(update.state, TaskState::Failed);
            assert_eq!(update.message.as_deref(), Some("command exited with 1"));
        }
        other => panic!("expected a status update, got {other:?}"),
    }

    // The master closing the stream without a stop is abnormal.
    assert!(matches!(
        next(&mut events).await,
        DriverEvent::Disconnected { .. }
    ));
}

#[tokio::test]
async fn test_launch_and_decline_calls() {
    let server = MockServer::start().await;
    mount_subscribe(&server, &[subscribed()]).await;

    Mock::given(method("POST"))
        .and(path(SCHEDULER_PATH))
        .and(header("Mesos-Stream-Id", STREAM_ID))
        .and(body_partial_json(json!({
            "type": "ACCEPT",
            "framework_id": { "value": "fw-1" },
            "accept": { "offer_ids": [{ "value": "offer-1" }] }
        })))
        .respond_with(ResponseTemplate::new(202))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(SCHEDULER_PATH))
        .and(header("Mesos-Stream-Id", STREAM_ID))
        .and(body_partial_json(json!({
            "type": "DECLINE",
            "decline": {
                "offer_ids": [{ "value": "offer-2" }],
                "filters": { "refuse_seconds": 5.0 }
            }
        })))
        .respond_with(ResponseTemplate::new(202))
        .expect(1)
        .mount(&server)
        .await;

    let driver = MesosDriver::connect(&server.uri()).unwrap();
    let mut events = driver.subscribe(&framework()).await.unwrap();
    assert!(matches!(
        next(&mut events).await,
        DriverEvent::Registered { .. }
    ));

    let template = TaskTemplate {
        resources: "cpus=0.5 mem=64".parse().unwrap(),
        image: Some("busybox".to_string()),
        warmer: Some("./warm.sh".to_string()),
        cooler: None,
    };
    let agent = AgentId::parse("agent-1").unwrap();
    let task = template.build(Direction::Warmer, &agent).unwrap();

    driver
        .launch(&[OfferId::parse("offer-1").unwrap()], vec![task])
        .await
        .unwrap();
    driver
        .decline(&[OfferId::parse("offer-2").unwrap()])
        .await
        .unwrap();

    let accept = server
        .received_requests()
        .await
        .unwrap()
        .into_iter()
        .map(|request| serde_json::from_slice::<Value>(&request.body).unwrap())
        .find(|body| body["type"] == "ACCEPT")
        .unwrap();
    let info = &accept["accept"]["operations"][0]["launch"]["task_infos"][0];
    assert_eq!(info["name"], "relay.warmer");
    assert_eq!(info["command"]["value"], "./warm.sh");
    assert_eq!(info["container"]["docker"]["image"], "busybox");
}

#[tokio::test]
async fn test_rejected_call() {
    let server = MockServer::start().await;
    mount_subscribe(&server, &[subscribed()]).await;
    Mock::given(method("POST"))
        .and(path(SCHEDULER_PATH))
        .and(body_partial_json(json!({ "type": "DECLINE" })))
        .respond_with(ResponseTemplate::new(400).set_body_string("unknown offer"))
        .mount(&server)
        .await;

    let driver = MesosDriver::connect(&server.uri()).unwrap();
    let mut events = driver.subscribe(&framework()).await.unwrap();
    next(&mut events).await;

    let err = driver
        .decline(&[OfferId::parse("offer-9").unwrap()])
        .await
        .unwrap_err();
    match err {
        DriverError::Rejected { call, status, body } => {
            assert_eq!(call, "DECLINE");
            assert_eq!(status, 400);
            assert_eq!(body, "unknown offer");
        }
        other => panic!("expected a rejection, got {other:?}"),
    }
}

#[tokio::test]
async fn test_subscribe_rejected() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(SCHEDULER_PATH))
        .respond_with(ResponseTemplate::new(401).set_body_string("unauthorized"))
        .mount(&server)
        .await;

    let driver = MesosDriver::connect(&server.uri()).unwrap();
    let err = driver.subscribe(&framework()).await.unwrap_err();
    assert!(matches!(
        err,
        DriverError::Rejected {
            call: "SUBSCRIBE",
            status: 401,
            ..
        }
    ));
}

#[tokio::test]
async fn test_subscribe_without_stream_id() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(SCHEDULER_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_raw(
            event_stream(&[subscribed()]),
            "application/json",
        ))
        .mount(&server)
        .await;

    let driver = MesosDriver::connect(&server.uri()).unwrap();
    let err = driver.subscribe(&framework()).await.unwrap_err();
    assert!(matches!(err, DriverError::Protocol(_)), "{err}");
}

#[tokio::test]
async fn test_calls_before_subscribe() {
    let driver = MesosDriver::connect("http://127.0.0.1:5050").unwrap();
    let err = driver
        .decline(&[OfferId::parse("offer-1").unwrap()])
        .await
        .unwrap_err();
    assert!(matches!(err, DriverError::NotSubscribed));
    // Nothing to tear down yet.
    driver.stop().await.unwrap();
}

#[tokio::test]
async fn test_stop_tears_down_framework() {
    let server = MockServer::start().await;
    mount_subscribe(&server, &[subscribed()]).await;
    Mock::given(method("POST"))
        .and(path(SCHEDULER_PATH))
        .and(body_partial_json(json!({
            "type": "TEARDOWN",
            "framework_id": { "value": "fw-1" }
        })))
        .respond_with(ResponseTemplate::new(202))
        .expect(1)
        .mount(&server)
        .await;

    let driver = MesosDriver::connect(&server.uri()).unwrap();
    let mut events = driver.subscribe(&framework()).await.unwrap();
    next(&mut events).await;

    driver.stop().await.unwrap();
    // A second stop is a no-op.
    driver.stop().await.unwrap();
}
