//! Request routing on the command surface

mod common;

use std::time::Duration;

use common::*;
use rvoip_call_manager::listen::{Method, Request, Response};
use rvoip_call_manager::groupcall::GroupcallRequest;
use rvoip_call_manager::models::{
    Action, ActionType, Address, Call, CallStatus, Confbridge, EventType, Groupcall, Recording, RecordingStatus,
    ReferenceType, RingMethod,
};
use rvoip_call_manager::transport::Command;
use serde_json::{json, Value};
use uuid::Uuid;

async fn request(h: &Harness, method: Method, uri: impl Into<String>, data: Option<Value>) -> Response {
    h.listen().process_request(Request::new(method, uri, data)).await
}

fn decode<T: serde::de::DeserializeOwned>(response: Response) -> T {
    assert_eq!(response.status_code, 200);
    serde_json::from_value(response.data.expect("response body")).unwrap()
}

/// Wait for detached request work to finish
async fn settle(h: &Harness) {
    for _ in 0..100 {
        if h.ctx.tasks.active_count() == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("detached work did not finish");
}

#[tokio::test]
async fn test_call_create_get_and_list() {
    let h = Harness::new();
    let customer_id = Uuid::new_v4();

    let created: Call = decode(
        request(
            &h,
            Method::Post,
            "/v1/calls",
            Some(json!({
                "customer_id": customer_id,
                "source": { "type": "tel", "target": "+15550001" },
                "destination": { "type": "tel", "target": "+15550002" },
            })),
        )
        .await,
    );
    assert_eq!(created.status, CallStatus::Dialing);
    assert_eq!(created.customer_id, customer_id);

    let fetched: Call = decode(request(&h, Method::Get, format!("/v1/calls/{}", created.id), None).await);
    assert_eq!(fetched.id, created.id);

    let mine: Vec<Call> =
        decode(request(&h, Method::Get, format!("/v1/calls?customer_id={}", customer_id), None).await);
    assert_eq!(mine.len(), 1);
    let theirs: Vec<Call> =
        decode(request(&h, Method::Get, format!("/v1/calls?customer_id={}", Uuid::new_v4()), None).await);
    assert!(theirs.is_empty());
}

#[tokio::test]
async fn test_error_status_codes() {
    let h = Harness::new();

    assert_eq!(request(&h, Method::Post, "/v1/calls", None).await.status_code, 400);
    assert_eq!(
        request(&h, Method::Post, "/v1/calls", Some(json!({ "destination": 5 }))).await.status_code,
        400
    );
    assert_eq!(
        request(&h, Method::Get, format!("/v1/calls/{}", Uuid::new_v4()), None).await.status_code,
        404
    );
    assert_eq!(request(&h, Method::Get, "/v1/calls/not-a-uuid", None).await.status_code, 400);
    assert_eq!(request(&h, Method::Put, "/v1/calls", None).await.status_code, 404);
    assert_eq!(request(&h, Method::Get, "/v1/conferencecalls", None).await.status_code, 404);
    assert_eq!(request(&h, Method::Get, "/v1/unknown/thing", None).await.status_code, 404);

    let failed = request(&h, Method::Get, "/v1/calls/not-a-uuid", None).await;
    assert!(failed.data.is_none());

    let requests = h.ctx.metrics.snapshot().requests;
    assert_eq!(requests.get(&400), Some(&4));
    assert_eq!(requests.get(&404), Some(&4));
}

#[tokio::test]
async fn test_hangup_route() {
    let h = Harness::new();
    let call = h.outgoing_call(Uuid::nil()).await;

    let hung: Call = decode(request(&h, Method::Post, format!("/v1/calls/{}/hangup", call.id), None).await);
    assert_eq!(hung.status, CallStatus::Canceling);
}

#[tokio::test]
async fn test_action_next_is_fire_and_forget() {
    let h = Harness::new();
    let flow_id = h.flow(vec![
        Action::new(ActionType::Sleep, json!({ "duration": 60000 })),
        Action::new(ActionType::Beep, Value::Null),
    ]);
    let call = h.answered_call(flow_id).await;

    let response = request(
        &h,
        Method::Post,
        format!("/v1/calls/{}/action-next", call.id),
        Some(json!({ "force": true })),
    )
    .await;
    assert_eq!(response, Response { status_code: 200, data: None });

    settle(&h).await;
    let call = h.calls().get(call.id).await.unwrap();
    assert_eq!(call.action.map(|a| a.action_type), Some(ActionType::Beep));
}

#[tokio::test]
async fn test_action_timeout_requires_body() {
    let h = Harness::new();
    let call = h.outgoing_call(Uuid::nil()).await;
    let uri = format!("/v1/calls/{}/action-timeout", call.id);

    assert_eq!(request(&h, Method::Post, uri.clone(), None).await.status_code, 400);

    let stale = Action::new(ActionType::Sleep, json!({ "duration": 1000 }));
    let response = request(&h, Method::Post, uri, Some(json!({ "action": stale }))).await;
    assert_eq!(response.status_code, 200);
    settle(&h).await;
    assert_eq!(h.ctx.metrics.snapshot().stale_timers, 1);
}

#[tokio::test]
async fn test_channel_health_check_route() {
    let h = Harness::new();
    h.dispatch(
        rvoip_call_manager::models::EventType::ChannelCreated,
        channel_payload("hc-1", "Up", "call-in"),
    )
    .await;
    h.requester.clear();
    h.pbx.fail_lookups(1);

    let response = request(
        &h,
        Method::Post,
        "/v1/channels/hc-1/health-check",
        Some(json!({ "retry_count": 0, "retry_count_max": 3, "delay_ms": 500 })),
    )
    .await;
    assert_eq!(response.status_code, 200);
    settle(&h).await;

    assert_eq!(h.requester.channel_health_checks(), vec![("hc-1".to_string(), 1)]);
    assert!(matches!(
        h.requester.delayed()[0],
        (Command::ChannelHealthCheck { retry_count_max: 3, delay_ms: 500, .. }, d) if d == Duration::from_millis(500)
    ));
}

#[tokio::test]
async fn test_chained_call_routes() {
    let h = Harness::new();
    let master = h.outgoing_call(Uuid::nil()).await;
    let chained = h.outgoing_call(Uuid::nil()).await;

    let updated: Call = decode(
        request(
            &h,
            Method::Post,
            format!("/v1/calls/{}/chained-call-ids", master.id),
            Some(json!({ "chained_call_id": chained.id })),
        )
        .await,
    );
    assert_eq!(updated.chained_call_ids, vec![chained.id]);
    assert_eq!(h.calls().get(chained.id).await.unwrap().master_call_id, Some(master.id));

    let updated: Call = decode(
        request(
            &h,
            Method::Delete,
            format!("/v1/calls/{}/chained-call-ids/{}", master.id, chained.id),
            None,
        )
        .await,
    );
    assert!(updated.chained_call_ids.is_empty());
    assert_eq!(h.calls().get(chained.id).await.unwrap().master_call_id, None);
}

#[tokio::test]
async fn test_call_external_media_routes() {
    let h = Harness::new();
    let flow_id = h.flow(vec![Action::new(ActionType::Sleep, json!({ "duration": 60000 }))]);
    let call = h.answered_call(flow_id).await;
    let uri = format!("/v1/calls/{}/external-media", call.id);

    assert_eq!(request(&h, Method::Delete, uri.clone(), None).await.status_code, 404);

    let started = request(&h, Method::Post, uri.clone(), Some(json!({ "external_host": "media.example:9000" }))).await;
    assert_eq!(started.status_code, 200);
    let em_id = h.calls().get(call.id).await.unwrap().external_media_id.unwrap();

    let stopped: Call = decode(request(&h, Method::Delete, uri, None).await);
    assert_eq!(stopped.external_media_id, None);

    let em = request(&h, Method::Get, format!("/v1/external-medias/{}", em_id), None).await;
    assert_eq!(em.status_code, 200);
}

#[tokio::test]
async fn test_confbridge_routes() {
    let h = Harness::new();
    let flow_id = h.flow(vec![Action::new(ActionType::Sleep, json!({ "duration": 60000 }))]);
    let call = h.answered_call(flow_id).await;

    let confbridge: Confbridge = decode(
        request(
            &h,
            Method::Post,
            "/v1/confbridges",
            Some(json!({ "customer_id": call.customer_id, "reference_id": Uuid::new_v4(), "confbridge_type": "conference" })),
        )
        .await,
    );

    let joined: Confbridge = decode(
        request(
            &h,
            Method::Post,
            format!("/v1/confbridges/{}/calls/{}", confbridge.id, call.id),
            None,
        )
        .await,
    );
    assert!(joined.contains_call(call.id));

    let kicked: Confbridge = decode(
        request(
            &h,
            Method::Delete,
            format!("/v1/confbridges/{}/calls/{}", confbridge.id, call.id),
            None,
        )
        .await,
    );
    assert!(!kicked.contains_call(call.id));

    let recording: Confbridge = decode(
        request(&h, Method::Post, format!("/v1/confbridges/{}/recording_start", confbridge.id), None).await,
    );
    assert!(recording.recording_id.is_some());

    let terminated: Confbridge = decode(
        request(&h, Method::Post, format!("/v1/confbridges/{}/terminate", confbridge.id), None).await,
    );
    assert!(terminated.recording_id.is_none());
    assert_eq!(h.pbx.count(|op| matches!(op, PbxOp::RecordingStop { .. })), 1);
}

#[tokio::test]
async fn test_groupcall_routes() {
    let h = Harness::new();
    let groupcall: Groupcall = decode(
        request(
            &h,
            Method::Post,
            "/v1/groupcalls",
            Some(json!({
                "customer_id": Uuid::new_v4(),
                "destinations": [
                    { "type": "tel", "target": "+15550010" },
                    { "type": "tel", "target": "+15550011" },
                ],
                "ring_method": "ring-all",
            })),
        )
        .await,
    );
    assert_eq!(groupcall.call_ids.len(), 2);

    let hung: Groupcall = decode(
        request(&h, Method::Post, format!("/v1/groupcalls/{}/hangup", groupcall.id), None).await,
    );
    assert_eq!(hung.status, rvoip_call_manager::models::GroupcallStatus::Hangingup);

    let listed: Vec<Groupcall> = decode(request(&h, Method::Get, "/v1/groupcalls", None).await);
    assert_eq!(listed.len(), 1);
}

#[tokio::test]
async fn test_call_recording_routes() {
    let h = Harness::new();
    let flow_id = h.flow(vec![Action::new(ActionType::Sleep, json!({ "duration": 60000 }))]);
    let call = h.answered_call(flow_id).await;

    let recording: Call = decode(
        request(
            &h,
            Method::Post,
            format!("/v1/calls/{}/recording_start", call.id),
            Some(json!({ "format": "mp3", "end_of_key": "#" })),
        )
        .await,
    );
    let recording_id = recording.recording_id.unwrap();

    let stored: Recording = decode(request(&h, Method::Get, format!("/v1/recordings/{}", recording_id), None).await);
    assert_eq!(stored.format, "mp3");
    assert_eq!(stored.end_of_key, "#");
    assert_eq!(stored.reference_type, ReferenceType::Call);
    assert_eq!(stored.reference_id, call.id);
    assert_eq!(stored.channel_id, call.channel_id);

    let mine: Vec<Recording> = decode(
        request(&h, Method::Get, format!("/v1/recordings?customer_id={}", call.customer_id), None).await,
    );
    assert_eq!(mine.len(), 1);

    let stopped: Call =
        decode(request(&h, Method::Post, format!("/v1/calls/{}/recording_stop", call.id), None).await);
    assert!(stopped.recording_id.is_none());
    assert_eq!(stopped.recording_ids, vec![recording_id]);

    // stopping again through the recording resource is a no-op
    let again: Recording =
        decode(request(&h, Method::Post, format!("/v1/recordings/{}/stop", recording_id), None).await);
    assert_eq!(again.status, RecordingStatus::Stopping);
    assert_eq!(h.pbx.count(|op| matches!(op, PbxOp::RecordingStop { .. })), 1);

    let deleted: Recording =
        decode(request(&h, Method::Delete, format!("/v1/recordings/{}", recording_id), None).await);
    assert!(deleted.tm_delete.is_some());
    let listed: Vec<Recording> = decode(request(&h, Method::Get, "/v1/recordings", None).await);
    assert!(listed.is_empty());
}

#[tokio::test]
async fn test_recording_resource_start() {
    let h = Harness::new();
    let flow_id = h.flow(vec![Action::new(ActionType::Sleep, json!({ "duration": 60000 }))]);
    let call = h.answered_call(flow_id).await;

    let started: Recording = decode(
        request(
            &h,
            Method::Post,
            "/v1/recordings",
            Some(json!({ "reference_type": "call", "reference_id": call.id, "duration": 30 })),
        )
        .await,
    );
    assert_eq!(started.status, RecordingStatus::Initiating);
    assert_eq!(started.format, "wav");
    assert_eq!(started.customer_id, call.customer_id);
    assert_eq!(h.calls().get(call.id).await.unwrap().recording_id, Some(started.id));

    let busy = request(
        &h,
        Method::Post,
        "/v1/recordings",
        Some(json!({ "reference_type": "call", "reference_id": call.id })),
    )
    .await;
    assert_eq!(busy.status_code, 500);

    let missing = request(
        &h,
        Method::Post,
        "/v1/recordings",
        Some(json!({ "reference_type": "confbridge", "reference_id": Uuid::new_v4() })),
    )
    .await;
    assert_eq!(missing.status_code, 404);
    assert_eq!(
        request(&h, Method::Get, format!("/v1/recordings/{}", Uuid::new_v4()), None).await.status_code,
        404
    );
}

#[tokio::test]
async fn test_call_digits_routes() {
    let h = Harness::new();
    let flow_id = h.flow(vec![Action::new(ActionType::Sleep, json!({ "duration": 60000 }))]);
    let call = h.answered_call(flow_id).await;
    let uri = format!("/v1/calls/{}/digits", call.id);

    h.dispatch(EventType::ChannelDtmfReceived, dtmf(&call.channel_id, "4")).await;
    h.dispatch(EventType::ChannelDtmfReceived, dtmf(&call.channel_id, "2")).await;
    let collected: Value = decode(request(&h, Method::Get, uri.clone(), None).await);
    assert_eq!(collected, json!({ "digits": "42" }));

    let sent = request(&h, Method::Post, uri.clone(), Some(json!({ "digits": "123" }))).await;
    assert_eq!(sent, Response { status_code: 200, data: None });
    assert_eq!(
        h.pbx.count(|op| matches!(op, PbxOp::DtmfSend { digits, .. } if digits == "123")),
        1
    );

    assert_eq!(request(&h, Method::Post, uri.clone(), Some(json!({ "digits": "" }))).await.status_code, 400);
    assert_eq!(request(&h, Method::Post, uri, None).await.status_code, 400);

    // no flow, nothing collected
    let idle = h.outgoing_call(Uuid::nil()).await;
    let collected: Value = decode(request(&h, Method::Get, format!("/v1/calls/{}/digits", idle.id), None).await);
    assert_eq!(collected, json!({ "digits": "" }));
}

#[tokio::test]
async fn test_groupcall_member_callbacks() {
    let h = Harness::new();
    let groupcall = h
        .groupcalls()
        .start(GroupcallRequest {
            customer_id: Uuid::new_v4(),
            source: Address::tel("+15550001"),
            destinations: vec![Address::tel("+15550010"), Address::tel("+15550011")],
            ring_method: RingMethod::RingAll,
            ..Default::default()
        })
        .await
        .unwrap();
    let ids = groupcall.call_ids.clone();

    let stranger = request(
        &h,
        Method::Post,
        format!("/v1/groupcalls/{}/hangup_call", groupcall.id),
        Some(json!({ "call_id": Uuid::new_v4() })),
    )
    .await;
    assert_eq!(stranger.status_code, 400);
    assert_eq!(
        request(&h, Method::Post, format!("/v1/groupcalls/{}/hangup_call", groupcall.id), None)
            .await
            .status_code,
        400
    );

    let answered: Groupcall = decode(
        request(
            &h,
            Method::Post,
            format!("/v1/groupcalls/{}/answer_call_id", groupcall.id),
            Some(json!({ "answer_call_id": ids[0] })),
        )
        .await,
    );
    assert_eq!(answered.answer_call_id, Some(ids[0]));
    assert!(h.calls().get(ids[1]).await.unwrap().status.is_hanging_up());

    let released: Groupcall = decode(
        request(
            &h,
            Method::Post,
            format!("/v1/groupcalls/{}/hangup_call", groupcall.id),
            Some(json!({ "call_id": ids[1] })),
        )
        .await,
    );
    assert_eq!(released.call_count, 1);
    assert_eq!(released.status, rvoip_call_manager::models::GroupcallStatus::Progressing);
}
