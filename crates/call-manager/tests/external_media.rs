//! External media legs on calls and confbridges

mod common;

use common::*;
use rvoip_call_manager::confbridge::ConfbridgeRequest;
use rvoip_call_manager::external_media::ExternalMediaRequest;
use rvoip_call_manager::models::{
    Action, ActionType, ChannelCause, ConfbridgeStatus, Encapsulation, EventType, ExternalMediaStatus,
    ReferenceType,
};
use serde_json::json;
use uuid::Uuid;

const HOST: &str = "media.example:9000";

fn sleep_flow(h: &Harness) -> Uuid {
    h.flow(vec![Action::new(ActionType::Sleep, json!({ "duration": 60000 }))])
}

fn for_call(call_id: Uuid) -> ExternalMediaRequest {
    ExternalMediaRequest {
        reference_type: ReferenceType::Call,
        reference_id: call_id,
        external_host: HOST.to_string(),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_start_on_call_bridges_call_and_media() {
    let h = Harness::new();
    let call = h.answered_call(sleep_flow(&h)).await;
    let before = h.pbx.ops().len();

    let em = h.external_medias().start(for_call(call.id)).await.unwrap();

    assert_eq!(em.status, ExternalMediaStatus::Running);
    assert_eq!(em.local_ip, "10.0.0.5");
    assert_eq!(em.local_port, 40000);
    assert_eq!(em.format, "ulaw");
    assert_eq!(em.asterisk_id, NODE);
    assert!(!em.bridge_id.is_empty());
    assert_eq!(h.calls().get(call.id).await.unwrap().external_media_id, Some(em.id));

    let ops = h.pbx.ops().split_off(before);
    assert_eq!(
        ops,
        vec![
            PbxOp::ExternalMediaCreate {
                channel_id: em.channel_id.clone(),
                external_host: HOST.to_string(),
            },
            PbxOp::BridgeCreate {
                bridge_id: em.bridge_id.clone(),
            },
            PbxOp::BridgeAdd {
                bridge_id: em.bridge_id.clone(),
                channel_id: call.channel_id.clone(),
            },
            PbxOp::BridgeAdd {
                bridge_id: em.bridge_id.clone(),
                channel_id: em.channel_id.clone(),
            },
        ]
    );

    let err = h.external_medias().start(for_call(call.id)).await.unwrap_err();
    assert_eq!(err.status_code(), 500);
}

#[tokio::test]
async fn test_start_validates_request() {
    let h = Harness::new();
    let call = h.answered_call(sleep_flow(&h)).await;

    let mut request = for_call(call.id);
    request.external_host.clear();
    assert_eq!(h.external_medias().start(request).await.unwrap_err().status_code(), 400);

    let err = h.external_medias().start(for_call(Uuid::new_v4())).await.unwrap_err();
    assert_eq!(err.status_code(), 404);

    h.calls().hangup(call.id).await.unwrap();
    let err = h.external_medias().start(for_call(call.id)).await.unwrap_err();
    assert_eq!(err.status_code(), 500);
    assert_eq!(h.pbx.count(|op| matches!(op, PbxOp::ExternalMediaCreate { .. })), 0);
}

#[tokio::test]
async fn test_stop_releases_leg_once() {
    let h = Harness::new();
    let call = h.answered_call(sleep_flow(&h)).await;
    let em = h.external_medias().start(for_call(call.id)).await.unwrap();

    let stopped = h.external_medias().stop(em.id).await.unwrap();
    assert_eq!(stopped.status, ExternalMediaStatus::Terminated);
    assert_eq!(h.calls().get(call.id).await.unwrap().external_media_id, None);
    assert!(h
        .pbx
        .hangups()
        .contains(&(em.channel_id.clone(), ChannelCause::NORMAL_CLEARING)));
    assert_eq!(
        h.pbx.count(|op| matches!(op, PbxOp::BridgeDelete { bridge_id } if *bridge_id == em.bridge_id)),
        1
    );

    let ops = h.pbx.ops().len();
    let again = h.external_medias().stop(em.id).await.unwrap();
    assert_eq!(again.status, ExternalMediaStatus::Terminated);
    assert_eq!(h.pbx.ops().len(), ops);
}

#[tokio::test]
async fn test_media_channel_destroyed_terminates_leg() {
    let h = Harness::new();
    let call = h.answered_call(sleep_flow(&h)).await;
    let em = h.external_medias().start(for_call(call.id)).await.unwrap();

    h.dispatch(
        EventType::ChannelDestroyed,
        channel_destroyed(&em.channel_id, ChannelCause::NORMAL_CLEARING),
    )
    .await;

    assert_eq!(
        h.external_medias().get(em.id).await.unwrap().status,
        ExternalMediaStatus::Terminated
    );
    let call = h.calls().get(call.id).await.unwrap();
    assert_eq!(call.external_media_id, None);
    assert!(!call.status.is_hanging_up());
    assert_eq!(h.pbx.count(|op| matches!(op, PbxOp::BridgeDelete { .. })), 1);
}

#[tokio::test]
async fn test_call_hangup_stops_external_media() {
    let h = Harness::new();
    let call = h.answered_call(sleep_flow(&h)).await;
    let em = h.external_medias().start(for_call(call.id)).await.unwrap();

    h.dispatch(
        EventType::ChannelDestroyed,
        channel_destroyed(&call.channel_id, ChannelCause::NORMAL_CLEARING),
    )
    .await;

    assert_eq!(
        h.external_medias().get(em.id).await.unwrap().status,
        ExternalMediaStatus::Terminated
    );
    assert!(h
        .pbx
        .hangups()
        .contains(&(em.channel_id.clone(), ChannelCause::NORMAL_CLEARING)));
}

#[tokio::test]
async fn test_confbridge_media_rides_on_its_bridge() {
    let h = Harness::new();
    let confbridge = h
        .confbridges()
        .create(ConfbridgeRequest {
            customer_id: Uuid::new_v4(),
            reference_id: Uuid::new_v4(),
            ..Default::default()
        })
        .await
        .unwrap();

    let em = h
        .confbridges()
        .external_media_start(
            confbridge.id,
            ExternalMediaRequest {
                external_host: HOST.to_string(),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(em.reference_type, ReferenceType::Confbridge);
    assert_eq!(em.reference_id, confbridge.id);
    assert!(em.bridge_id.is_empty());
    assert_eq!(h.pbx.count(|op| matches!(op, PbxOp::BridgeCreate { .. })), 1);
    assert_eq!(
        h.pbx.count(|op| matches!(
            op,
            PbxOp::BridgeAdd { bridge_id, channel_id } if *bridge_id == confbridge.bridge_id && *channel_id == em.channel_id
        )),
        1
    );
    assert_eq!(
        h.confbridges().get(confbridge.id).await.unwrap().external_media_id,
        Some(em.id)
    );

    let terminated = h.confbridges().terminate(confbridge.id).await.unwrap();
    assert_eq!(terminated.status, ConfbridgeStatus::Terminated);
    assert_eq!(terminated.external_media_id, None);
    assert_eq!(
        h.external_medias().get(em.id).await.unwrap().status,
        ExternalMediaStatus::Terminated
    );
}

#[tokio::test]
async fn test_external_media_action() {
    let h = Harness::new();
    let flow_id = h.flow(vec![
        Action::new(
            ActionType::ExternalMediaStart,
            json!({ "external_host": HOST, "encapsulation": "audiosocket" }),
        ),
        Action::new(ActionType::Sleep, json!({ "duration": 60000 })),
    ]);
    let call = h.answered_call(flow_id).await;

    assert_eq!(call.action.as_ref().map(|a| a.action_type), Some(ActionType::Sleep));
    let em = h.external_medias().get(call.external_media_id.unwrap()).await.unwrap();
    assert_eq!(em.encapsulation, Encapsulation::Audiosocket);
    assert_eq!(em.reference_id, call.id);
}
