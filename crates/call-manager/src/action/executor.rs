//! One executor per action type, resolved through a static table

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use serde::de::DeserializeOwned;
use tracing::debug;

use super::timeout::{digits_send_timeout, echo_timeout, optional_ms};
use crate::call::CallHandler;
use crate::confbridge::ConfbridgeHandler;
use crate::context::ServiceContext;
use crate::error::{CallManagerError, Result};
use crate::external_media::{ExternalMediaHandler, ExternalMediaRequest};
use crate::flow::variables::VAR_CALL_DIGITS;
use crate::flow::substitute_json;
use crate::models::{
    Action, ActionType, BeepOption, BranchOption, Call, ChannelCause, ConfbridgeJoinOption, DigitsReceiveOption,
    DigitsSendOption, EchoOption, ExternalMediaStartOption, GotoOption, HangupOption, PlayOption,
    RecordingStartOption, ReferenceType, SleepOption, TalkOption,
};

pub const MEDIA_BEEP: &str = "sound:beep";
pub const CONTEXT_SVC_ECHO: &str = "svc-echo";
pub const CONTEXT_SVC_STREAM_ECHO: &str = "svc-stream_echo";

/// What the engine does after an action was dispatched
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecOutcome {
    /// Action completed synchronously; move on
    Advance,
    /// Wait for a completion event, bounded by an optional timeout
    Wait { timeout: Option<Duration> },
    /// The flow ends here
    Stop,
}

/// Everything an executor needs about the call it runs on
pub struct ExecContext<'a> {
    pub ctx: &'a Arc<ServiceContext>,
    pub call: &'a Call,
    pub node_id: String,
    pub variables: HashMap<String, String>,
}

impl ExecContext<'_> {
    /// Option with `${var}` placeholders resolved
    fn option<T: DeserializeOwned + Default>(&self, action: &Action) -> Result<T> {
        let resolved = Action {
            option: substitute_json(&action.option, &self.variables),
            ..action.clone()
        };
        resolved.option_as()
    }

    fn activeflow_id(&self) -> Result<uuid::Uuid> {
        self.call
            .activeflow_id
            .ok_or_else(|| CallManagerError::invalid_state(format!("call {} has no activeflow", self.call.id)))
    }
}

#[async_trait]
pub trait ActionExecutor: Send + Sync {
    async fn execute(&self, exec: &ExecContext<'_>, action: &Action) -> Result<ExecOutcome>;
}

/// Digits collected so far satisfy the receive condition
pub fn digits_condition_met(digits: &str, option: &DigitsReceiveOption) -> bool {
    if option.length > 0 && digits.chars().count() >= option.length {
        return true;
    }
    digits.chars().last().map_or(false, |last| option.key.contains(last))
}

/// Media URL handed to the PBX for synthesized speech
pub fn tts_media_url(option: &TalkOption) -> String {
    format!("tts:{}:{}:{}", option.language, option.gender, option.text)
}

/// Map a hangup option reason onto a cause
pub fn hangup_cause_for(reason: &str) -> ChannelCause {
    match reason {
        "busy" => ChannelCause::USER_BUSY,
        "noanswer" => ChannelCause::NO_ANSWER,
        "failed" => ChannelCause::NORMAL_UNSPECIFIED,
        _ => ChannelCause::NORMAL_CLEARING,
    }
}

/// Decode a wire enum from its option string; empty means the default
fn parse_enum<T: DeserializeOwned + Default>(field: &str, value: &str) -> Result<T> {
    if value.is_empty() {
        return Ok(T::default());
    }
    serde_json::from_value(serde_json::Value::String(value.to_string()))
        .map_err(|_| CallManagerError::invalid_input(format!("invalid {}: {}", field, value)))
}

struct AnswerExecutor;

#[async_trait]
impl ActionExecutor for AnswerExecutor {
    async fn execute(&self, exec: &ExecContext<'_>, _action: &Action) -> Result<ExecOutcome> {
        exec.ctx.pbx.channel_answer(&exec.node_id, &exec.call.channel_id).await?;
        Ok(ExecOutcome::Advance)
    }
}

/// Play, talk and beep all become a playback keyed by the action dispatch
struct PlaybackExecutor;

#[async_trait]
impl ActionExecutor for PlaybackExecutor {
    async fn execute(&self, exec: &ExecContext<'_>, action: &Action) -> Result<ExecOutcome> {
        let (urls, duration) = match action.action_type {
            ActionType::Play => {
                let option: PlayOption = exec.option(action)?;
                if option.stream_urls.is_empty() {
                    return Err(CallManagerError::invalid_input("play action without stream urls"));
                }
                (option.stream_urls, option.duration)
            }
            ActionType::Talk => {
                let option: TalkOption = exec.option(action)?;
                if option.text.is_empty() {
                    return Err(CallManagerError::invalid_input("talk action without text"));
                }
                (vec![tts_media_url(&option)], option.duration)
            }
            _ => {
                let option: BeepOption = exec.option(action)?;
                (vec![MEDIA_BEEP.to_string()], option.duration)
            }
        };

        exec.ctx
            .pbx
            .channel_play(&exec.node_id, &exec.call.channel_id, &action.playback_id(), &urls)
            .await?;
        Ok(ExecOutcome::Wait {
            timeout: optional_ms(duration),
        })
    }
}

struct EchoExecutor;

#[async_trait]
impl ActionExecutor for EchoExecutor {
    async fn execute(&self, exec: &ExecContext<'_>, action: &Action) -> Result<ExecOutcome> {
        let option: EchoOption = exec.option(action)?;
        let context = if action.action_type == ActionType::StreamEcho {
            CONTEXT_SVC_STREAM_ECHO
        } else {
            CONTEXT_SVC_ECHO
        };
        exec.ctx
            .pbx
            .channel_continue(&exec.node_id, &exec.call.channel_id, context, "s")
            .await?;
        Ok(ExecOutcome::Wait {
            timeout: Some(echo_timeout(option.duration, exec.ctx.config.call.default_echo_duration_ms)),
        })
    }
}

struct SleepExecutor;

#[async_trait]
impl ActionExecutor for SleepExecutor {
    async fn execute(&self, exec: &ExecContext<'_>, action: &Action) -> Result<ExecOutcome> {
        let option: SleepOption = exec.option(action)?;
        Ok(ExecOutcome::Wait {
            timeout: Some(Duration::from_millis(option.duration)),
        })
    }
}

struct DigitsReceiveExecutor;

#[async_trait]
impl ActionExecutor for DigitsReceiveExecutor {
    async fn execute(&self, exec: &ExecContext<'_>, action: &Action) -> Result<ExecOutcome> {
        let option: DigitsReceiveOption = exec.option(action)?;
        let digits = exec.variables.get(VAR_CALL_DIGITS).map(String::as_str).unwrap_or_default();
        if digits_condition_met(digits, &option) {
            debug!(call_id = %exec.call.id, digits, "digits already collected");
            return Ok(ExecOutcome::Advance);
        }
        Ok(ExecOutcome::Wait {
            timeout: optional_ms(Some(option.duration)),
        })
    }
}

struct DigitsSendExecutor;

#[async_trait]
impl ActionExecutor for DigitsSendExecutor {
    async fn execute(&self, exec: &ExecContext<'_>, action: &Action) -> Result<ExecOutcome> {
        let option: DigitsSendOption = exec.option(action)?;
        let digits = option.digits;
        if digits.is_empty() {
            return Err(CallManagerError::invalid_input("digits_send action without digits"));
        }
        let cfg = &exec.ctx.config.call;
        let duration = option.duration.unwrap_or(cfg.default_digit_duration_ms);
        let interval = option.interval.unwrap_or(cfg.default_digit_interval_ms);

        exec.ctx
            .pbx
            .channel_dtmf_send(&exec.node_id, &exec.call.channel_id, &digits, duration, interval)
            .await?;
        Ok(ExecOutcome::Wait {
            timeout: Some(digits_send_timeout(digits.chars().count(), duration, interval)),
        })
    }
}

struct ConfbridgeJoinExecutor;

#[async_trait]
impl ActionExecutor for ConfbridgeJoinExecutor {
    async fn execute(&self, exec: &ExecContext<'_>, action: &Action) -> Result<ExecOutcome> {
        let option: ConfbridgeJoinOption = exec.option(action)?;
        ConfbridgeHandler::new(exec.ctx.clone())
            .join(option.confbridge_id, exec.call.id)
            .await?;
        // completes when the channel leaves the bridge
        Ok(ExecOutcome::Wait { timeout: None })
    }
}

struct RecordingExecutor;

#[async_trait]
impl ActionExecutor for RecordingExecutor {
    async fn execute(&self, exec: &ExecContext<'_>, action: &Action) -> Result<ExecOutcome> {
        let calls = CallHandler::new(exec.ctx.clone());
        if action.action_type == ActionType::RecordingStart {
            let option: RecordingStartOption = exec.option(action)?;
            calls.recording_start(exec.call.id, &option).await?;
        } else {
            calls.recording_stop(exec.call.id).await?;
        }
        Ok(ExecOutcome::Advance)
    }
}

struct ExternalMediaExecutor;

#[async_trait]
impl ActionExecutor for ExternalMediaExecutor {
    async fn execute(&self, exec: &ExecContext<'_>, action: &Action) -> Result<ExecOutcome> {
        let handler = ExternalMediaHandler::new(exec.ctx.clone());
        if action.action_type == ActionType::ExternalMediaStart {
            let option: ExternalMediaStartOption = exec.option(action)?;
            handler
                .start(ExternalMediaRequest {
                    id: None,
                    reference_type: ReferenceType::Call,
                    reference_id: exec.call.id,
                    external_host: option.external_host,
                    encapsulation: parse_enum("encapsulation", &option.encapsulation)?,
                    transport: parse_enum("transport", &option.transport)?,
                    connection_type: parse_enum("connection_type", &option.connection_type)?,
                    format: option.format,
                    direction: parse_enum("direction", &option.direction)?,
                })
                .await?;
        } else if let Some(id) = exec.call.external_media_id {
            handler.stop(id).await?;
        }
        Ok(ExecOutcome::Advance)
    }
}

struct HangupExecutor;

#[async_trait]
impl ActionExecutor for HangupExecutor {
    async fn execute(&self, exec: &ExecContext<'_>, action: &Action) -> Result<ExecOutcome> {
        let option: HangupOption = exec.option(action)?;
        CallHandler::new(exec.ctx.clone())
            .hanging_up(exec.call.id, hangup_cause_for(&option.reason))
            .await?;
        Ok(ExecOutcome::Stop)
    }
}

struct GotoExecutor;

#[async_trait]
impl ActionExecutor for GotoExecutor {
    async fn execute(&self, exec: &ExecContext<'_>, action: &Action) -> Result<ExecOutcome> {
        let option: GotoOption = exec.option(action)?;
        let activeflow_id = exec.activeflow_id()?;

        let _guard = exec.ctx.locks.lock(format!("activeflow:{}", activeflow_id)).await;
        let mut activeflow = exec
            .ctx
            .db
            .activeflow_get(activeflow_id)
            .await?
            .ok_or_else(|| CallManagerError::not_found(format!("activeflow {} not found", activeflow_id)))?;

        let taken = activeflow.goto_counts.get(&action.id).copied().unwrap_or(0);
        if taken >= option.loop_count {
            debug!(call_id = %exec.call.id, action_id = %action.id, taken, "goto loop count reached");
            return Ok(ExecOutcome::Advance);
        }

        activeflow.set_forward(option.target_id)?;
        activeflow.goto_counts.insert(action.id, taken + 1);
        exec.ctx.db.activeflow_save(&activeflow).await?;
        Ok(ExecOutcome::Advance)
    }
}

struct BranchExecutor;

#[async_trait]
impl ActionExecutor for BranchExecutor {
    async fn execute(&self, exec: &ExecContext<'_>, action: &Action) -> Result<ExecOutcome> {
        // the branch variable itself must not be substituted away
        let option: BranchOption = action.option_as()?;
        let value = exec.variables.get(&option.variable).cloned().unwrap_or_default();
        let Some(target) = option.target_ids.get(&value).copied().or(option.default_target_id) else {
            debug!(call_id = %exec.call.id, value, "branch without matching target");
            return Ok(ExecOutcome::Advance);
        };

        let activeflow_id = exec.activeflow_id()?;
        let _guard = exec.ctx.locks.lock(format!("activeflow:{}", activeflow_id)).await;
        let mut activeflow = exec
            .ctx
            .db
            .activeflow_get(activeflow_id)
            .await?
            .ok_or_else(|| CallManagerError::not_found(format!("activeflow {} not found", activeflow_id)))?;
        activeflow.set_forward(target)?;
        exec.ctx.db.activeflow_save(&activeflow).await?;
        Ok(ExecOutcome::Advance)
    }
}

static EXECUTORS: Lazy<HashMap<ActionType, Arc<dyn ActionExecutor>>> = Lazy::new(|| {
    let playback: Arc<dyn ActionExecutor> = Arc::new(PlaybackExecutor);
    let echo: Arc<dyn ActionExecutor> = Arc::new(EchoExecutor);
    let recording: Arc<dyn ActionExecutor> = Arc::new(RecordingExecutor);
    let external_media: Arc<dyn ActionExecutor> = Arc::new(ExternalMediaExecutor);

    let mut table: HashMap<ActionType, Arc<dyn ActionExecutor>> = HashMap::new();
    table.insert(ActionType::Answer, Arc::new(AnswerExecutor));
    table.insert(ActionType::Beep, playback.clone());
    table.insert(ActionType::Play, playback.clone());
    table.insert(ActionType::Talk, playback);
    table.insert(ActionType::Echo, echo.clone());
    table.insert(ActionType::StreamEcho, echo);
    table.insert(ActionType::Sleep, Arc::new(SleepExecutor));
    table.insert(ActionType::DigitsReceive, Arc::new(DigitsReceiveExecutor));
    table.insert(ActionType::DigitsSend, Arc::new(DigitsSendExecutor));
    table.insert(ActionType::ConfbridgeJoin, Arc::new(ConfbridgeJoinExecutor));
    table.insert(ActionType::RecordingStart, recording.clone());
    table.insert(ActionType::RecordingStop, recording);
    table.insert(ActionType::ExternalMediaStart, external_media.clone());
    table.insert(ActionType::ExternalMediaStop, external_media);
    table.insert(ActionType::Hangup, Arc::new(HangupExecutor));
    table.insert(ActionType::Goto, Arc::new(GotoExecutor));
    table.insert(ActionType::Branch, Arc::new(BranchExecutor));
    table
});

pub fn executor_for(action_type: ActionType) -> Result<Arc<dyn ActionExecutor>> {
    EXECUTORS
        .get(&action_type)
        .cloned()
        .ok_or_else(|| CallManagerError::internal(format!("no executor for {}", action_type.as_str())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Encapsulation, MediaDirection};

    #[test]
    fn test_every_action_type_has_an_executor() {
        let all = [
            ActionType::Answer,
            ActionType::Beep,
            ActionType::Branch,
            ActionType::ConfbridgeJoin,
            ActionType::DigitsReceive,
            ActionType::DigitsSend,
            ActionType::Echo,
            ActionType::ExternalMediaStart,
            ActionType::ExternalMediaStop,
            ActionType::Goto,
            ActionType::Hangup,
            ActionType::Play,
            ActionType::RecordingStart,
            ActionType::RecordingStop,
            ActionType::Sleep,
            ActionType::StreamEcho,
            ActionType::Talk,
        ];
        for action_type in all {
            assert!(executor_for(action_type).is_ok(), "{}", action_type.as_str());
        }
    }

    #[test]
    fn test_digits_condition() {
        let by_length = DigitsReceiveOption {
            duration: 5000,
            length: 3,
            key: String::new(),
        };
        assert!(!digits_condition_met("12", &by_length));
        assert!(digits_condition_met("123", &by_length));

        let by_key = DigitsReceiveOption {
            duration: 5000,
            length: 0,
            key: "#*".to_string(),
        };
        assert!(!digits_condition_met("", &by_key));
        assert!(!digits_condition_met("12", &by_key));
        assert!(digits_condition_met("12#", &by_key));
    }

    #[test]
    fn test_parse_enum() {
        assert_eq!(parse_enum::<Encapsulation>("encapsulation", "").unwrap(), Encapsulation::Rtp);
        assert_eq!(
            parse_enum::<Encapsulation>("encapsulation", "audiosocket").unwrap(),
            Encapsulation::Audiosocket
        );
        assert_eq!(parse_enum::<MediaDirection>("direction", "in").unwrap(), MediaDirection::In);
        assert!(parse_enum::<MediaDirection>("direction", "sideways").is_err());
    }

    #[test]
    fn test_hangup_cause_for() {
        assert_eq!(hangup_cause_for("busy"), ChannelCause::USER_BUSY);
        assert_eq!(hangup_cause_for(""), ChannelCause::NORMAL_CLEARING);
    }
}
