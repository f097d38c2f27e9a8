//! Command surface
//!
//! Resource-oriented requests (`/v1/calls`, `/v1/confbridges`, ...) arrive
//! from the transport as a uri, a method and an optional JSON body. Routing
//! is done here; the work is done by the component handlers.
//!
//! Health-check, action-next and action-timeout requests are accepted
//! immediately and run on a detached task. Their outcome is only visible
//! through logs, metrics and later state.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::action::ActionEngine;
use crate::call::{CallHandler, OutgoingCallRequest};
use crate::channel::ChannelHandler;
use crate::confbridge::{ConfbridgeHandler, ConfbridgeRequest};
use crate::context::ServiceContext;
use crate::error::{CallManagerError, Result};
use crate::external_media::{ExternalMediaHandler, ExternalMediaRequest};
use crate::groupcall::{GroupcallHandler, GroupcallRequest};
use crate::models::{Action, RecordingStartOption, ReferenceType};
use crate::recording::{RecordingHandler, RecordingRequest};
use crate::store::ListFilter;

static RE_PATH: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^/v1/(?P<resource>calls|channels|confbridges|groupcalls|external-medias|recordings)(?:/(?P<id>[^/]+))?(?:/(?P<op>[a-z_-]+))?(?:/(?P<sub>[^/]+))?$",
    )
    .unwrap()
});
static RE_CUSTOMER_ID: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?:^|&)customer_id=(?P<id>[^&]*)").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub uri: String,
    pub method: Method,
    #[serde(default)]
    pub data: Option<Value>,
}

impl Request {
    pub fn new(method: Method, uri: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            uri: uri.into(),
            method,
            data,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub status_code: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl Response {
    fn ok(data: Option<Value>) -> Self {
        Self { status_code: 200, data }
    }

    fn error(status_code: u16) -> Self {
        Self {
            status_code,
            data: None,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CallHealthCheckBody {
    retry_count: u32,
    delay_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ChannelHealthCheckBody {
    retry_count: u32,
    retry_count_max: Option<u32>,
    delay_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ActionNextBody {
    force: bool,
}

#[derive(Debug, Deserialize)]
struct ActionTimeoutBody {
    action: Action,
}

#[derive(Debug, Deserialize)]
struct ChainedCallBody {
    chained_call_id: Uuid,
}

#[derive(Debug, Deserialize)]
struct DigitsSendBody {
    digits: String,
    #[serde(default)]
    duration: Option<u64>,
    #[serde(default)]
    interval: Option<u64>,
}

#[derive(Debug, Serialize)]
struct DigitsReply {
    digits: String,
}

#[derive(Debug, Deserialize)]
struct GroupcallMemberBody {
    call_id: Uuid,
}

#[derive(Debug, Deserialize)]
struct GroupcallAnswerBody {
    answer_call_id: Uuid,
}

/// Parsed route: resource, optional id, optional sub-operation and its argument
struct Route<'a> {
    resource: &'a str,
    id: Option<&'a str>,
    op: Option<&'a str>,
    sub: Option<&'a str>,
    query: Option<&'a str>,
}

impl<'a> Route<'a> {
    fn parse(uri: &'a str) -> Option<Self> {
        let (path, query) = match uri.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (uri, None),
        };
        let caps = RE_PATH.captures(path)?;
        Some(Self {
            resource: caps.name("resource")?.as_str(),
            id: caps.name("id").map(|m| m.as_str()),
            op: caps.name("op").map(|m| m.as_str()),
            sub: caps.name("sub").map(|m| m.as_str()),
            query,
        })
    }

    fn id(&self) -> Result<Uuid> {
        parse_uuid(self.id.unwrap_or_default())
    }

    fn sub_id(&self) -> Result<Uuid> {
        parse_uuid(self.sub.unwrap_or_default())
    }

    fn filter(&self) -> Result<ListFilter> {
        let Some(caps) = self.query.and_then(|q| RE_CUSTOMER_ID.captures(q)) else {
            return Ok(ListFilter::default());
        };
        let customer_id = parse_uuid(caps.name("id").map_or("", |m| m.as_str()))?;
        Ok(ListFilter::customer(customer_id))
    }
}

fn parse_uuid(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).map_err(|_| CallManagerError::invalid_input(format!("invalid id: {:?}", raw)))
}

fn body<T: DeserializeOwned>(data: &Option<Value>) -> Result<T> {
    let data = data
        .clone()
        .ok_or_else(|| CallManagerError::invalid_input("request body is required"))?;
    Ok(serde_json::from_value(data)?)
}

fn body_or_default<T: DeserializeOwned + Default>(data: &Option<Value>) -> Result<T> {
    match data {
        None | Some(Value::Null) => Ok(T::default()),
        Some(value) => Ok(serde_json::from_value(value.clone())?),
    }
}

fn reply<T: Serialize>(value: T) -> Result<Option<Value>> {
    Ok(Some(serde_json::to_value(value)?))
}

fn no_route(method: Method, uri: &str) -> CallManagerError {
    CallManagerError::not_found(format!("no route for {:?} {}", method, uri))
}

#[derive(Clone)]
pub struct ListenHandler {
    ctx: Arc<ServiceContext>,
}

impl ListenHandler {
    pub fn new(ctx: Arc<ServiceContext>) -> Self {
        Self { ctx }
    }

    pub async fn process_request(&self, request: Request) -> Response {
        let response = match self.route(&request).await {
            Ok(data) => Response::ok(data),
            Err(e) => {
                let status_code = e.status_code();
                if status_code >= 500 {
                    warn!(uri = %request.uri, method = ?request.method, error = %e, "request failed");
                } else {
                    debug!(uri = %request.uri, method = ?request.method, error = %e, "request rejected");
                }
                Response::error(status_code)
            }
        };
        self.ctx.metrics.record_request(response.status_code);
        response
    }

    async fn route(&self, request: &Request) -> Result<Option<Value>> {
        let route = Route::parse(&request.uri).ok_or_else(|| no_route(request.method, &request.uri))?;
        match route.resource {
            "calls" => self.route_calls(&route, request).await,
            "channels" => self.route_channels(&route, request).await,
            "confbridges" => self.route_confbridges(&route, request).await,
            "groupcalls" => self.route_groupcalls(&route, request).await,
            "external-medias" => self.route_external_medias(&route, request).await,
            "recordings" => self.route_recordings(&route, request).await,
            _ => Err(no_route(request.method, &request.uri)),
        }
    }

    async fn route_calls(&self, route: &Route<'_>, request: &Request) -> Result<Option<Value>> {
        let calls = CallHandler::new(self.ctx.clone());
        match (request.method, route.id.is_some(), route.op, route.sub.is_some()) {
            (Method::Post, false, None, false) => {
                let req: OutgoingCallRequest = body(&request.data)?;
                reply(calls.create_call_outgoing(req).await?)
            }
            (Method::Get, false, None, false) => reply(calls.list(&route.filter()?).await?),
            (Method::Get, true, None, false) => reply(calls.get(route.id()?).await?),
            (Method::Delete, true, None, false) => reply(calls.delete(route.id()?).await?),
            (Method::Post, true, Some("hangup"), false) => reply(calls.hangup(route.id()?).await?),
            (Method::Post, true, Some("health-check"), false) => {
                let id = route.id()?;
                let req: CallHealthCheckBody = body_or_default(&request.data)?;
                let delay = req
                    .delay_ms
                    .map(Duration::from_millis)
                    .unwrap_or_else(|| self.ctx.config.call.health_check_delay());
                self.detach("call-health-check", async move {
                    calls.health_check(id, req.retry_count, delay).await
                })?;
                Ok(None)
            }
            (Method::Post, true, Some("action-next"), false) => {
                let id = route.id()?;
                let req: ActionNextBody = body_or_default(&request.data)?;
                let engine = ActionEngine::new(self.ctx.clone());
                self.detach("call-action-next", async move { engine.action_next(id, req.force).await })?;
                Ok(None)
            }
            (Method::Post, true, Some("action-timeout"), false) => {
                let id = route.id()?;
                let req: ActionTimeoutBody = body(&request.data)?;
                self.detach("call-action-timeout", async move {
                    calls.action_timeout(id, &req.action).await
                })?;
                Ok(None)
            }
            (Method::Post, true, Some("chained-call-ids"), false) => {
                let req: ChainedCallBody = body(&request.data)?;
                reply(calls.chained_call_id_add(route.id()?, req.chained_call_id).await?)
            }
            (Method::Delete, true, Some("chained-call-ids"), true) => {
                reply(calls.chained_call_id_remove(route.id()?, route.sub_id()?).await?)
            }
            (Method::Post, true, Some("external-media"), false) => {
                let mut req: ExternalMediaRequest = body(&request.data)?;
                req.reference_type = ReferenceType::Call;
                req.reference_id = route.id()?;
                reply(ExternalMediaHandler::new(self.ctx.clone()).start(req).await?)
            }
            (Method::Delete, true, Some("external-media"), false) => {
                let call = calls.get(route.id()?).await?;
                let external_media_id = call.external_media_id.ok_or_else(|| {
                    CallManagerError::not_found(format!("call {} has no external media", call.id))
                })?;
                ExternalMediaHandler::new(self.ctx.clone()).stop(external_media_id).await?;
                reply(calls.get(call.id).await?)
            }
            (Method::Post, true, Some("recording_start"), false) => {
                let option: RecordingStartOption = body_or_default(&request.data)?;
                reply(calls.recording_start(route.id()?, &option).await?)
            }
            (Method::Post, true, Some("recording_stop"), false) => reply(calls.recording_stop(route.id()?).await?),
            (Method::Get, true, Some("digits"), false) => reply(DigitsReply {
                digits: calls.digits_get(route.id()?).await?,
            }),
            (Method::Post, true, Some("digits"), false) => {
                let req: DigitsSendBody = body(&request.data)?;
                calls
                    .digits_send(route.id()?, &req.digits, req.duration, req.interval)
                    .await?;
                Ok(None)
            }
            _ => Err(no_route(request.method, &request.uri)),
        }
    }

    async fn route_channels(&self, route: &Route<'_>, request: &Request) -> Result<Option<Value>> {
        match (request.method, route.id, route.op, route.sub.is_some()) {
            (Method::Post, Some(id), Some("health-check"), false) => {
                let id = id.to_string();
                let req: ChannelHealthCheckBody = body_or_default(&request.data)?;
                let config = &self.ctx.config.channel;
                let retry_count_max = req.retry_count_max.unwrap_or(config.health_check_retry_max);
                let delay = req
                    .delay_ms
                    .map(Duration::from_millis)
                    .unwrap_or_else(|| config.health_check_delay());
                let channels = ChannelHandler::new(self.ctx.clone());
                self.detach("channel-health-check", async move {
                    channels
                        .health_check(&id, req.retry_count, retry_count_max, delay)
                        .await
                        .map(|_| ())
                })?;
                Ok(None)
            }
            _ => Err(no_route(request.method, &request.uri)),
        }
    }

    async fn route_confbridges(&self, route: &Route<'_>, request: &Request) -> Result<Option<Value>> {
        let confbridges = ConfbridgeHandler::new(self.ctx.clone());
        match (request.method, route.id.is_some(), route.op, route.sub.is_some()) {
            (Method::Post, false, None, false) => {
                let req: ConfbridgeRequest = body(&request.data)?;
                reply(confbridges.create(req).await?)
            }
            (Method::Get, false, None, false) => reply(confbridges.list(&route.filter()?).await?),
            (Method::Get, true, None, false) => reply(confbridges.get(route.id()?).await?),
            (Method::Delete, true, None, false) => reply(confbridges.delete(route.id()?).await?),
            (Method::Post, true, Some("terminate"), false) => reply(confbridges.terminate(route.id()?).await?),
            (Method::Post, true, Some("calls"), true) => {
                reply(confbridges.join(route.id()?, route.sub_id()?).await?)
            }
            (Method::Delete, true, Some("calls"), true) => {
                reply(confbridges.kick(route.id()?, route.sub_id()?).await?)
            }
            (Method::Post, true, Some("external-media"), false) => {
                let req: ExternalMediaRequest = body(&request.data)?;
                reply(confbridges.external_media_start(route.id()?, req).await?)
            }
            (Method::Delete, true, Some("external-media"), false) => {
                reply(confbridges.external_media_stop(route.id()?).await?)
            }
            (Method::Post, true, Some("recording_start"), false) => {
                reply(confbridges.recording_start(route.id()?).await?)
            }
            (Method::Post, true, Some("recording_stop"), false) => {
                reply(confbridges.recording_stop(route.id()?).await?)
            }
            _ => Err(no_route(request.method, &request.uri)),
        }
    }

    async fn route_groupcalls(&self, route: &Route<'_>, request: &Request) -> Result<Option<Value>> {
        let groupcalls = GroupcallHandler::new(self.ctx.clone());
        match (request.method, route.id.is_some(), route.op, route.sub.is_some()) {
            (Method::Post, false, None, false) => {
                let req: GroupcallRequest = body(&request.data)?;
                reply(groupcalls.start(req).await?)
            }
            (Method::Get, false, None, false) => reply(groupcalls.list(&route.filter()?).await?),
            (Method::Get, true, None, false) => reply(groupcalls.get(route.id()?).await?),
            (Method::Delete, true, None, false) => reply(groupcalls.delete(route.id()?).await?),
            (Method::Post, true, Some("hangup"), false) => reply(groupcalls.hanging_up(route.id()?).await?),
            (Method::Post, true, Some("hangup_call"), false) => {
                let id = route.id()?;
                let req: GroupcallMemberBody = body(&request.data)?;
                groupcalls.member(id, req.call_id).await?;
                reply(groupcalls.hangup_call(id, req.call_id).await?)
            }
            (Method::Post, true, Some("answer_call_id"), false) => {
                let id = route.id()?;
                let req: GroupcallAnswerBody = body(&request.data)?;
                groupcalls.member(id, req.answer_call_id).await?;
                groupcalls.answer_call(id, req.answer_call_id).await?;
                reply(groupcalls.get(id).await?)
            }
            _ => Err(no_route(request.method, &request.uri)),
        }
    }

    async fn route_external_medias(&self, route: &Route<'_>, request: &Request) -> Result<Option<Value>> {
        let external_medias = ExternalMediaHandler::new(self.ctx.clone());
        match (request.method, route.id.is_some(), route.op, route.sub.is_some()) {
            (Method::Post, false, None, false) => {
                let req: ExternalMediaRequest = body(&request.data)?;
                reply(external_medias.start(req).await?)
            }
            (Method::Get, false, None, false) => reply(external_medias.list(&route.filter()?).await?),
            (Method::Get, true, None, false) => reply(external_medias.get(route.id()?).await?),
            (Method::Delete, true, None, false) => reply(external_medias.delete(route.id()?).await?),
            _ => Err(no_route(request.method, &request.uri)),
        }
    }

    async fn route_recordings(&self, route: &Route<'_>, request: &Request) -> Result<Option<Value>> {
        let recordings = RecordingHandler::new(self.ctx.clone());
        match (request.method, route.id.is_some(), route.op, route.sub.is_some()) {
            (Method::Post, false, None, false) => {
                let req: RecordingRequest = body(&request.data)?;
                reply(recordings.start(req).await?)
            }
            (Method::Get, false, None, false) => reply(recordings.list(&route.filter()?).await?),
            (Method::Get, true, None, false) => reply(recordings.get(route.id()?).await?),
            (Method::Delete, true, None, false) => reply(recordings.delete(route.id()?).await?),
            (Method::Post, true, Some("stop"), false) => reply(recordings.stop(route.id()?).await?),
            _ => Err(no_route(request.method, &request.uri)),
        }
    }

    /// Run accepted work on a tracked task; failures are logged only
    fn detach<F>(&self, name: &'static str, work: F) -> Result<()>
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        self.ctx.tasks.spawn_tracked(name, async move {
            if let Err(e) = work.await {
                warn!(task = name, error = %e, "detached request failed");
            }
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_parse() {
        let id = Uuid::new_v4();
        let uri = format!("/v1/confbridges/{}/calls/{}", id, Uuid::nil());
        let route = Route::parse(&uri).unwrap();
        assert_eq!(route.resource, "confbridges");
        assert_eq!(route.id().unwrap(), id);
        assert_eq!(route.op, Some("calls"));
        assert_eq!(route.sub_id().unwrap(), Uuid::nil());

        let route = Route::parse("/v1/calls/abc/recording_start").unwrap();
        assert_eq!(route.op, Some("recording_start"));
        assert!(route.id().is_err());

        assert!(Route::parse("/v1/conferencecalls").is_none());
        assert!(Route::parse("/v2/calls").is_none());
    }

    #[test]
    fn test_customer_filter() {
        let customer_id = Uuid::new_v4();
        let uri = format!("/v1/calls?page_size=10&customer_id={}", customer_id);
        let route = Route::parse(&uri).unwrap();
        assert_eq!(route.filter().unwrap(), ListFilter::customer(customer_id));

        let route = Route::parse("/v1/calls").unwrap();
        assert_eq!(route.filter().unwrap(), ListFilter::default());

        let route = Route::parse("/v1/calls?customer_id=nope").unwrap();
        assert_eq!(route.filter().unwrap_err().status_code(), 400);
    }

    #[test]
    fn test_request_wire_format() {
        let request: Request = serde_json::from_value(serde_json::json!({
            "uri": "/v1/calls",
            "method": "POST",
        }))
        .unwrap();
        assert_eq!(request.method, Method::Post);
        assert!(request.data.is_none());

        let json = serde_json::to_value(Response::ok(None)).unwrap();
        assert_eq!(json, serde_json::json!({ "status_code": 200 }));
    }
}
