//! Activeflow execution on answered calls

mod common;

use common::*;
use rvoip_call_manager::flow::variables::VAR_CALL_DIGITS;
use rvoip_call_manager::models::{Action, ActionType, CallStatus, ChannelCause, EventType};
use rvoip_call_manager::action::MAX_ADVANCE_STEPS;
use serde_json::{json, Value};
use uuid::Uuid;

fn sleep(ms: u64) -> Action {
    Action::new(ActionType::Sleep, json!({ "duration": ms }))
}

fn current_type(call: &rvoip_call_manager::models::Call) -> Option<ActionType> {
    call.action.as_ref().map(|a| a.action_type)
}

async fn hold(h: &Harness, call_id: Uuid) {
    let mut call = h.calls().get(call_id).await.unwrap();
    call.action_next_hold = true;
    h.ctx.db.call_save(&call).await.unwrap();
}

#[tokio::test]
async fn test_action_next_is_noop_while_held() {
    let h = Harness::new();
    let flow_id = h.flow(vec![sleep(60_000), Action::new(ActionType::Beep, Value::Null)]);
    let call = h.answered_call(flow_id).await;
    assert_eq!(current_type(&call), Some(ActionType::Sleep));

    hold(&h, call.id).await;
    h.actions().action_next(call.id, false).await.unwrap();
    let held = h.calls().get(call.id).await.unwrap();
    assert_eq!(held.action, call.action);
    assert!(held.action_next_hold);

    h.actions().action_next(call.id, true).await.unwrap();
    let forced = h.calls().get(call.id).await.unwrap();
    assert_eq!(current_type(&forced), Some(ActionType::Beep));
    assert!(!forced.action_next_hold);
}

#[tokio::test]
async fn test_forced_next_stops_current_playback() {
    let h = Harness::new();
    let flow_id = h.flow(vec![Action::new(ActionType::Beep, Value::Null), sleep(60_000)]);
    let call = h.answered_call(flow_id).await;
    let beep_id = call.action.as_ref().unwrap().playback_id();

    h.actions().action_next(call.id, true).await.unwrap();

    assert_eq!(
        h.pbx.count(|op| matches!(op, PbxOp::PlaybackStop { playback_id } if *playback_id == beep_id)),
        1
    );
    assert_eq!(
        current_type(&h.calls().get(call.id).await.unwrap()),
        Some(ActionType::Sleep)
    );
}

#[tokio::test]
async fn test_stale_timeout_is_dropped() {
    let h = Harness::new();
    let flow_id = h.flow(vec![sleep(1000), sleep(2000)]);
    let call = h.answered_call(flow_id).await;

    h.actions().action_next(call.id, true).await.unwrap();
    let timeouts = h.requester.action_timeouts();
    assert_eq!(timeouts.len(), 2);
    let (_, first, _) = &timeouts[0];
    let (_, second, _) = &timeouts[1];

    h.calls().action_timeout(call.id, first).await.unwrap();
    let after_stale = h.calls().get(call.id).await.unwrap();
    assert_eq!(after_stale.action.as_ref().map(|a| a.id), Some(second.id));
    assert_eq!(h.ctx.metrics.snapshot().stale_timers, 1);

    // the live timer runs the flow off its end, which hangs up
    h.calls().action_timeout(call.id, second).await.unwrap();
    let finished = h.calls().get(call.id).await.unwrap();
    assert!(finished.action.as_ref().unwrap().is_finish());
    assert_eq!(finished.status, CallStatus::Terminating);
    assert_eq!(
        h.pbx.hangups(),
        vec![(call.channel_id.clone(), ChannelCause::NORMAL_CLEARING)]
    );
}

#[tokio::test]
async fn test_playback_finished_advances_only_current_action() {
    let h = Harness::new();
    let flow_id = h.flow(vec![
        Action::new(ActionType::Play, json!({ "stream_urls": ["https://media.example/a.wav"] })),
        sleep(5000),
    ]);
    let call = h.answered_call(flow_id).await;
    let play_id = call.action.as_ref().unwrap().playback_id();

    h.dispatch(EventType::PlaybackFinished, playback(&Uuid::new_v4().to_string(), &call.channel_id))
        .await;
    assert_eq!(
        current_type(&h.calls().get(call.id).await.unwrap()),
        Some(ActionType::Play)
    );

    h.dispatch(EventType::PlaybackFinished, playback(&play_id, &call.channel_id)).await;
    assert_eq!(
        current_type(&h.calls().get(call.id).await.unwrap()),
        Some(ActionType::Sleep)
    );

    // a duplicate completion does not skip the sleep
    h.dispatch(EventType::PlaybackFinished, playback(&play_id, &call.channel_id)).await;
    assert_eq!(
        current_type(&h.calls().get(call.id).await.unwrap()),
        Some(ActionType::Sleep)
    );
}

#[tokio::test]
async fn test_digits_receive_completes_on_length() {
    let h = Harness::new();
    let flow_id = h.flow(vec![
        Action::new(ActionType::DigitsReceive, json!({ "duration": 5000, "length": 2 })),
        sleep(5000),
    ]);
    let call = h.answered_call(flow_id).await;
    assert_eq!(current_type(&call), Some(ActionType::DigitsReceive));

    h.dispatch(EventType::ChannelDtmfReceived, dtmf(&call.channel_id, "1")).await;
    assert_eq!(
        current_type(&h.calls().get(call.id).await.unwrap()),
        Some(ActionType::DigitsReceive)
    );

    h.dispatch(EventType::ChannelDtmfReceived, dtmf(&call.channel_id, "2")).await;
    let call = h.calls().get(call.id).await.unwrap();
    assert_eq!(current_type(&call), Some(ActionType::Sleep));

    let variables = h.ctx.variables.variables(call.activeflow_id.unwrap()).await.unwrap();
    assert_eq!(variables.get(VAR_CALL_DIGITS).map(String::as_str), Some("12"));
}

#[tokio::test]
async fn test_digits_collected_early_complete_receive_immediately() {
    let h = Harness::new();
    let flow_id = h.flow(vec![
        sleep(1000),
        Action::new(ActionType::DigitsReceive, json!({ "duration": 5000, "length": 1 })),
        Action::new(ActionType::Beep, Value::Null),
    ]);
    let call = h.answered_call(flow_id).await;
    h.dispatch(EventType::ChannelDtmfReceived, dtmf(&call.channel_id, "5")).await;
    assert_eq!(
        current_type(&h.calls().get(call.id).await.unwrap()),
        Some(ActionType::Sleep)
    );

    let (_, sleep_action, _) = h.requester.action_timeouts().remove(0);
    h.calls().action_timeout(call.id, &sleep_action).await.unwrap();

    assert_eq!(
        current_type(&h.calls().get(call.id).await.unwrap()),
        Some(ActionType::Beep)
    );
}

#[tokio::test]
async fn test_branch_on_collected_digits() {
    let h = Harness::new();
    let one = Action::new(ActionType::Talk, json!({ "text": "you chose one" }));
    let other = Action::new(ActionType::Beep, Value::Null);
    let branch = Action::new(
        ActionType::Branch,
        json!({
            "variable": VAR_CALL_DIGITS,
            "default_target_id": other.id,
            "target_ids": { "1": one.id },
        }),
    );
    let flow_id = h.flow(vec![
        Action::new(ActionType::DigitsReceive, json!({ "duration": 5000, "length": 1 })),
        branch,
        other.clone(),
        one.clone(),
    ]);
    let call = h.answered_call(flow_id).await;

    h.dispatch(EventType::ChannelDtmfReceived, dtmf(&call.channel_id, "1")).await;

    let call = h.calls().get(call.id).await.unwrap();
    assert_eq!(call.action.as_ref().map(|a| a.id), Some(one.id));
    assert_eq!(
        h.pbx.count(|op| matches!(op, PbxOp::Play { urls, .. } if urls[0].ends_with("you chose one"))),
        1
    );
}

#[tokio::test]
async fn test_goto_honours_loop_count() {
    let h = Harness::new();
    let answer = Action::new(ActionType::Answer, Value::Null);
    let flow_id = h.flow(vec![
        answer.clone(),
        Action::new(ActionType::Goto, json!({ "target_id": answer.id, "loop_count": 2 })),
        sleep(5000),
    ]);
    let call = h.answered_call(flow_id).await;

    assert_eq!(current_type(&call), Some(ActionType::Sleep));
    assert_eq!(h.pbx.count(|op| matches!(op, PbxOp::Answer { .. })), 3);
}

#[tokio::test]
async fn test_late_playback_end_from_previous_loop_is_ignored() {
    let h = Harness::new();
    let play = Action::new(ActionType::Play, json!({ "stream_urls": ["https://media.example/menu.wav"] }));
    let flow_id = h.flow(vec![
        play.clone(),
        Action::new(ActionType::Goto, json!({ "target_id": play.id, "loop_count": 1 })),
        sleep(5000),
    ]);
    let call = h.answered_call(flow_id).await;
    let first_pass = call.action.as_ref().unwrap().playback_id();

    tokio::time::sleep(std::time::Duration::from_millis(2)).await;
    h.dispatch(EventType::PlaybackFinished, playback(&first_pass, &call.channel_id))
        .await;
    let looped = h.calls().get(call.id).await.unwrap();
    let second_pass = looped.action.as_ref().unwrap().playback_id();
    assert_eq!(current_type(&looped), Some(ActionType::Play));
    assert_ne!(second_pass, first_pass);
    assert_eq!(h.pbx.count(|op| matches!(op, PbxOp::Play { .. })), 2);

    // a duplicate end of the first pass must not cut the second one short
    h.dispatch(EventType::PlaybackFinished, playback(&first_pass, &call.channel_id))
        .await;
    assert_eq!(
        h.calls().get(call.id).await.unwrap().action.unwrap().playback_id(),
        second_pass
    );

    h.dispatch(EventType::PlaybackFinished, playback(&second_pass, &call.channel_id))
        .await;
    assert_eq!(
        current_type(&h.calls().get(call.id).await.unwrap()),
        Some(ActionType::Sleep)
    );
}

#[tokio::test]
async fn test_runaway_flow_is_hung_up() {
    let h = Harness::new();
    let answer = Action::new(ActionType::Answer, Value::Null);
    let flow_id = h.flow(vec![
        answer.clone(),
        Action::new(ActionType::Goto, json!({ "target_id": answer.id, "loop_count": 10_000 })),
    ]);
    let call = h.answered_call(flow_id).await;

    assert_eq!(call.status, CallStatus::Terminating);
    assert!(h.pbx.count(|op| matches!(op, PbxOp::Answer { .. })) <= MAX_ADVANCE_STEPS);
    assert_eq!(h.pbx.hangups().len(), 1);
}

#[tokio::test]
async fn test_failed_action_is_skipped() {
    let h = Harness::new();
    let flow_id = h.flow(vec![Action::new(ActionType::Play, json!({})), sleep(5000)]);
    let call = h.answered_call(flow_id).await;

    assert_eq!(current_type(&call), Some(ActionType::Sleep));
    let metrics = h.ctx.metrics.snapshot();
    assert_eq!(metrics.actions_failed.get("play"), Some(&1));
    assert_eq!(metrics.actions_ok.get("sleep"), Some(&1));
}

#[tokio::test]
async fn test_hangup_action_uses_reason() {
    let h = Harness::new();
    let flow_id = h.flow(vec![Action::new(ActionType::Hangup, json!({ "reason": "busy" }))]);
    let call = h.answered_call(flow_id).await;

    assert_eq!(call.status, CallStatus::Terminating);
    assert_eq!(h.pbx.hangups(), vec![(call.channel_id.clone(), ChannelCause::USER_BUSY)]);
}

#[tokio::test]
async fn test_digits_send_waits_for_tones() {
    let h = Harness::new();
    let flow_id = h.flow(vec![Action::new(ActionType::DigitsSend, json!({ "digits": "1234" }))]);
    let call = h.answered_call(flow_id).await;

    assert_eq!(
        h.pbx.count(|op| matches!(op, PbxOp::DtmfSend { digits, .. } if digits == "1234")),
        1
    );
    let timeouts = h.requester.action_timeouts();
    assert_eq!(timeouts.len(), 1);
    assert_eq!(timeouts[0].0, call.id);
    // 4 tones of 100ms with 3 gaps of 500ms
    assert_eq!(timeouts[0].2.as_millis(), 1900);
}

#[tokio::test]
async fn test_echo_uses_configured_default() {
    let h = Harness::new();
    let flow_id = h.flow(vec![Action::new(ActionType::Echo, Value::Null)]);
    let call = h.answered_call(flow_id).await;

    assert_eq!(
        h.pbx.count(|op| matches!(op, PbxOp::Continue { channel_id, context } if *channel_id == call.channel_id && context == "svc-echo")),
        1
    );
    assert_eq!(h.requester.action_timeouts()[0].2.as_millis(), 180_000);
}
