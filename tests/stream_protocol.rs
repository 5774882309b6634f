use std::net::TcpStream;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use serde_json::{json, Value};

use ward_motion::api::{AlertServer, StreamServer};
use ward_motion::storage::{InMemoryPatientStore, NewPatient, PatientStore};
use ward_motion::transport::wire::{read_message, write_message, Message};
use ward_motion::{
    alerts::movement_message, Actor, Acuity, AlertDispatcher, AlertRequest, ChannelRegistry,
    DetectorRegistry, LogAlarm, LogContext, PatientId, SegmentationParams, SessionDeps,
    SeverityTier, StaffRole, TokenDirectory, TrackerParams, UserId, Zone,
};

const W: u32 = 64;
const H: u32 = 48;

struct Harness {
    store: Arc<InMemoryPatientStore>,
    dispatcher: Arc<AlertDispatcher>,
    deps: SessionDeps,
    patient: PatientId,
    nurse: UserId,
}

fn harness() -> Harness {
    let log = LogContext::new("wire-test");
    let store = Arc::new(InMemoryPatientStore::new());
    let nurse = store.insert_user("N. Park", StaffRole::Nurse).unwrap();
    let patient = store
        .insert_patient(&NewPatient::new("P", Acuity::Stable).room("7A"))
        .unwrap();
    let dispatcher = Arc::new(AlertDispatcher::new(
        store.clone(),
        Arc::new(ChannelRegistry::new(log.clone())),
        Arc::new(LogAlarm::new(log.clone())),
        log.clone(),
    ));
    let deps = SessionDeps {
        store: store.clone(),
        registry: DetectorRegistry::new(
            SegmentationParams::default(),
            TrackerParams {
                min_area: 4,
                ..TrackerParams::default()
            },
            log.clone(),
        ),
        alerts: dispatcher.clone(),
        log,
    };
    Harness {
        store,
        dispatcher,
        deps,
        patient,
        nurse,
    }
}

fn connect(addr: std::net::SocketAddr) -> TcpStream {
    let stream = TcpStream::connect(addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    stream
}

fn send_json(stream: &mut TcpStream, value: Value) {
    write_message(stream, &Message::Text(value.to_string())).unwrap();
}

fn recv(stream: &mut TcpStream) -> Message {
    read_message(stream).unwrap().expect("message")
}

fn recv_json(stream: &mut TcpStream) -> Value {
    match recv(stream) {
        Message::Text(text) => serde_json::from_str(&text).unwrap(),
        other => panic!("expected text, got {:?}", other),
    }
}

fn frame(blob: bool) -> Vec<u8> {
    let mut data = vec![20u8; (W * H) as usize];
    if blob {
        for y in 4..12 {
            for x in 28..36 {
                data[(y * W + x) as usize] = 220;
            }
        }
    }
    data
}

#[test]
fn unknown_patient_is_closed_normally() -> Result<()> {
    let h = harness();
    let server = StreamServer::new(h.deps.clone()).spawn("127.0.0.1:0")?;
    let mut client = connect(server.addr);

    send_json(
        &mut client,
        json!({"patient_id": 9999, "width": W, "height": H, "format": "gray8"}),
    );
    assert_eq!(recv(&mut client), Message::close(1000, "Patient not found"));

    server.stop()?;
    Ok(())
}

#[test]
fn invalid_geometry_is_closed_with_reason() -> Result<()> {
    let h = harness();
    let server = StreamServer::new(h.deps.clone()).spawn("127.0.0.1:0")?;
    let mut client = connect(server.addr);

    send_json(
        &mut client,
        json!({"patient_id": h.patient.0, "width": 0, "height": H}),
    );
    match recv(&mut client) {
        Message::Close { code, reason } => {
            assert_eq!(code, 1000);
            assert!(!reason.is_empty());
        }
        other => panic!("expected close, got {:?}", other),
    }

    let mut oversized = connect(server.addr);
    send_json(
        &mut oversized,
        json!({"patient_id": h.patient.0, "width": 4096, "height": 4096, "format": "rgb24"}),
    );
    match recv(&mut oversized) {
        Message::Close { code, reason } => {
            assert_eq!(code, 1000);
            assert!(reason.contains("message limit"));
        }
        other => panic!("expected close, got {:?}", other),
    }
    server.stop()?;
    Ok(())
}

#[test]
fn frames_get_annotated_replies_until_client_closes() -> Result<()> {
    let h = harness();
    let server = StreamServer::new(h.deps.clone()).spawn("127.0.0.1:0")?;
    let mut client = connect(server.addr);

    send_json(
        &mut client,
        json!({"patient_id": h.patient.0, "width": W, "height": H, "format": "gray8", "encoding": "raw"}),
    );
    let ready = recv_json(&mut client);
    assert_eq!(ready["type"], "ready");
    assert!(ready["session_id"].is_u64());

    write_message(&mut client, &Message::Binary(frame(false)))?;
    assert_eq!(recv(&mut client), Message::Binary(frame(false)));
    let seeded = recv_json(&mut client);
    assert_eq!(seeded["type"], "movements");
    assert_eq!(seeded["motion_detected"], false);
    assert_eq!(seeded["movements"], json!([]));

    write_message(&mut client, &Message::Binary(vec![0; 5]))?;
    let error = recv_json(&mut client);
    assert_eq!(error["type"], "frame_error");
    assert!(error["reason"].as_str().unwrap().contains("expected"));

    write_message(&mut client, &Message::Binary(frame(true)))?;
    match recv(&mut client) {
        Message::Binary(annotated) => {
            assert_eq!(annotated.len(), (W * H) as usize);
            assert_ne!(annotated, frame(true));
        }
        other => panic!("expected annotated frame, got {:?}", other),
    }
    let moving = recv_json(&mut client);
    assert_eq!(moving["motion_detected"], true);
    assert_eq!(moving["movements"][0]["zone"], "head");
    assert_eq!(moving["movements"][0]["severity"], "normal");

    write_message(&mut client, &Message::close(1000, ""))?;
    match recv(&mut client) {
        Message::Close { code, .. } => assert_eq!(code, 1000),
        other => panic!("expected close echo, got {:?}", other),
    }

    let deadline = Instant::now() + Duration::from_secs(5);
    while h.deps.registry.viewer_count(h.patient)? > 0 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(h.deps.registry.viewer_count(h.patient)?, 0);
    assert_eq!(h.store.movement_total()?, 1);

    server.stop()?;
    Ok(())
}

#[test]
fn alert_subscription_push_and_acknowledge() -> Result<()> {
    let h = harness();
    let tokens = TokenDirectory::new();
    let token = tokens.mint(Actor {
        user_id: h.nurse,
        role: StaffRole::Nurse,
    })?;
    let server = AlertServer::new(h.dispatcher.clone(), Arc::new(tokens), LogContext::new("wire-test"))
        .spawn("127.0.0.1:0")?;

    let mut intruder = connect(server.addr);
    send_json(&mut intruder, json!({"token": "00ff"}));
    assert_eq!(recv(&mut intruder), Message::close(1008, "Unauthorized"));

    let mut client = connect(server.addr);
    send_json(&mut client, json!({ "token": token }));
    let subscribed = recv_json(&mut client);
    assert_eq!(subscribed["type"], "subscribed");
    assert_eq!(subscribed["user_id"], h.nurse.0);

    let patient = h.store.fetch_patient(h.patient)?.unwrap();
    let report = h.dispatcher.dispatch(&AlertRequest {
        patient,
        movement_id: None,
        severity: SeverityTier::Attention,
        message: movement_message(SeverityTier::Attention, Zone::RightArm, 5.5, 1.0),
        created_at: 1_700_000_000,
    });
    assert_eq!(report.deliveries, 1);
    let alert_id = report.alerts_created[0];

    let pushed = recv_json(&mut client);
    assert_eq!(pushed["type"], "alert");
    assert_eq!(pushed["alert_id"], alert_id.0);
    assert_eq!(pushed["patient_id"], h.patient.0);
    assert_eq!(pushed["severity"], "attention");
    assert_eq!(pushed["timestamp"], 1_700_000_000u64);

    send_json(&mut client, json!({"action": "pending"}));
    let pending = recv_json(&mut client);
    assert_eq!(pending["type"], "pending");
    assert_eq!(pending["alerts"].as_array().unwrap().len(), 1);

    send_json(&mut client, json!({"action": "acknowledge", "alert_id": alert_id.0}));
    let ack = recv_json(&mut client);
    assert_eq!(ack["type"], "ack_result");
    assert_eq!(ack["outcome"], "acknowledged");

    send_json(&mut client, json!({"action": "acknowledge", "alert_id": alert_id.0}));
    assert_eq!(recv_json(&mut client)["outcome"], "denied");
    send_json(&mut client, json!({"action": "acknowledge", "alert_id": 424242}));
    assert_eq!(recv_json(&mut client)["outcome"], "not_found");

    send_json(&mut client, json!({"action": "pending"}));
    assert_eq!(recv_json(&mut client)["alerts"], json!([]));

    drop(client);
    let deadline = Instant::now() + Duration::from_secs(5);
    while h.dispatcher.channels().channel_count(h.nurse)? > 0 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(h.dispatcher.channels().channel_count(h.nurse)?, 0);

    server.stop()?;
    Ok(())
}
