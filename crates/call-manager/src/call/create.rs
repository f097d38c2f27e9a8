use std::collections::HashMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use super::CallHandler;
use crate::error::{CallManagerError, Result};
use crate::flow::variables::{VAR_CALL_DESTINATION, VAR_CALL_DIRECTION, VAR_CALL_ID, VAR_CALL_SOURCE};
use crate::models::call::{DATA_EARLY_EXECUTION, DATA_EXECUTE_NEXT_MASTER_ON_HANGUP};
use crate::models::channel::{CONTEXT_CALL_OUT, VAR_CUSTOMER_ID, VAR_FLOW_ID};
use crate::models::{Activeflow, Address, Call, CallDirection, CallStatus, CallType, Channel, ChannelCause};
use crate::pbx::OriginateRequest;
use crate::transport::Command;

/// Request to dial out
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutgoingCallRequest {
    /// Pre-allocated call id; generated when absent
    pub id: Option<Uuid>,
    pub customer_id: Uuid,
    /// Nil flow means the call runs no actions and hangs up once answered
    pub flow_id: Uuid,
    pub activeflow_id: Option<Uuid>,
    pub master_call_id: Option<Uuid>,
    pub source: Address,
    pub destination: Address,
    pub groupcall_id: Option<Uuid>,
    /// Start the flow on ringing instead of on answer
    pub early_execution: bool,
    pub execute_next_master_on_hangup: bool,
}

impl CallHandler {
    /// Dial out. The call is returned in `dialing`; PBX events move it on.
    pub async fn create_call_outgoing(&self, request: OutgoingCallRequest) -> Result<Call> {
        if request.destination.is_empty() {
            return Err(CallManagerError::invalid_input("destination is empty"));
        }

        let id = request.id.unwrap_or_else(Uuid::new_v4);
        if self.ctx.db.call_get(id).await?.is_some() {
            return Err(CallManagerError::invalid_state(format!("call {} already exists", id)));
        }
        if let Some(master_call_id) = request.master_call_id {
            let master = self.get(master_call_id).await?;
            if master.status.is_hanging_up() {
                return Err(CallManagerError::invalid_state(format!(
                    "master call {} is hanging up",
                    master_call_id
                )));
            }
        }

        let activeflow = self
            .create_activeflow(
                request.customer_id,
                request.flow_id,
                request.activeflow_id,
                id,
                &request.source,
                &request.destination,
                CallDirection::Outgoing,
            )
            .await?;

        let now = Utc::now();
        let mut call = Call {
            id,
            customer_id: request.customer_id,
            channel_id: Uuid::new_v4().to_string(),
            flow_id: request.flow_id,
            activeflow_id: activeflow.map(|af| af.id),
            call_type: CallType::Flow,
            master_call_id: request.master_call_id,
            groupcall_id: request.groupcall_id,
            source: request.source,
            destination: request.destination,
            status: CallStatus::Dialing,
            direction: CallDirection::Outgoing,
            tm_create: Some(now),
            tm_update: Some(now),
            ..Default::default()
        };
        call.set_data_flag(DATA_EARLY_EXECUTION, request.early_execution);
        call.set_data_flag(DATA_EXECUTE_NEXT_MASTER_ON_HANGUP, request.execute_next_master_on_hangup);
        self.ctx.db.call_save(&call).await?;

        if let Some(master_call_id) = call.master_call_id {
            self.chained_call_id_add(master_call_id, id).await?;
        }

        // scheduled before originate so a call whose channel never shows up still gets torn down
        self.schedule_health_check(id, 0).await?;

        let mut variables = HashMap::new();
        variables.insert(VAR_CUSTOMER_ID.to_string(), call.customer_id.to_string());
        variables.insert(VAR_FLOW_ID.to_string(), call.flow_id.to_string());
        let originate = OriginateRequest {
            channel_id: call.channel_id.clone(),
            endpoint: call.destination.endpoint(),
            app_args: format!("context={},call_id={}", CONTEXT_CALL_OUT, id),
            caller_id: call.source.target.clone(),
            variables,
        };
        if let Err(e) = self
            .ctx
            .pbx
            .channel_create(self.ctx.default_node_id(), &originate)
            .await
        {
            warn!(call_id = %id, channel_id = %call.channel_id, error = %e, "originate failed");
            return Err(e);
        }

        info!(
            call_id = %id,
            channel_id = %call.channel_id,
            destination = %call.destination.target,
            "outgoing call created"
        );
        Ok(call)
    }

    /// Adopt an inbound channel. Channels without routing variables are hung up.
    pub(crate) async fn create_call_incoming(&self, channel: &Channel) -> Result<Option<Call>> {
        let parse = |key: &str| channel.variable(key).and_then(|v| Uuid::parse_str(v).ok());
        let (Some(customer_id), Some(flow_id)) = (parse(VAR_CUSTOMER_ID), parse(VAR_FLOW_ID)) else {
            warn!(channel_id = %channel.id, "inbound channel without routing, hanging up");
            self.ctx
                .pbx
                .channel_hangup(&channel.asterisk_id, &channel.id, ChannelCause::NO_ROUTE_DESTINATION)
                .await?;
            return Ok(None);
        };

        let id = Uuid::new_v4();
        let source = Address::tel(channel.source_number.clone());
        let destination = Address::tel(channel.destination_number.clone());

        let activeflow = match self
            .create_activeflow(customer_id, flow_id, None, id, &source, &destination, CallDirection::Incoming)
            .await
        {
            Ok(activeflow) => activeflow,
            Err(e) => {
                warn!(channel_id = %channel.id, flow_id = %flow_id, error = %e, "could not start flow, hanging up");
                self.ctx
                    .pbx
                    .channel_hangup(&channel.asterisk_id, &channel.id, ChannelCause::NO_ROUTE_DESTINATION)
                    .await?;
                return Err(e);
            }
        };

        let now = Utc::now();
        let mut call = Call {
            id,
            customer_id,
            channel_id: channel.id.clone(),
            flow_id,
            activeflow_id: activeflow.map(|af| af.id),
            call_type: CallType::Flow,
            source,
            destination,
            status: CallStatus::Dialing,
            direction: CallDirection::Incoming,
            tm_create: Some(now),
            tm_update: Some(now),
            ..Default::default()
        };
        call.apply_status(CallStatus::Ringing, now);
        self.ctx.db.call_save(&call).await?;
        self.schedule_health_check(id, 0).await?;

        info!(call_id = %id, channel_id = %channel.id, "incoming call created");
        Ok(Some(call))
    }

    async fn create_activeflow(
        &self,
        customer_id: Uuid,
        flow_id: Uuid,
        activeflow_id: Option<Uuid>,
        call_id: Uuid,
        source: &Address,
        destination: &Address,
        direction: CallDirection,
    ) -> Result<Option<Activeflow>> {
        if flow_id.is_nil() {
            return Ok(None);
        }

        let actions = self.ctx.flows.flow_actions(flow_id).await?;
        let mut activeflow = Activeflow::new(customer_id, flow_id, call_id, actions);
        if let Some(id) = activeflow_id {
            activeflow.id = id;
        }
        self.ctx.db.activeflow_save(&activeflow).await?;

        let direction = match direction {
            CallDirection::Incoming => "incoming",
            CallDirection::Outgoing => "outgoing",
        };
        let variables = HashMap::from([
            (VAR_CALL_ID.to_string(), call_id.to_string()),
            (VAR_CALL_SOURCE.to_string(), source.target.clone()),
            (VAR_CALL_DESTINATION.to_string(), destination.target.clone()),
            (VAR_CALL_DIRECTION.to_string(), direction.to_string()),
        ]);
        self.ctx.variables.set_variables(activeflow.id, variables).await?;

        Ok(Some(activeflow))
    }

    pub(crate) async fn schedule_health_check(&self, call_id: Uuid, retry_count: u32) -> Result<()> {
        let cfg = &self.ctx.config.call;
        self.ctx
            .requester
            .send_delayed(
                Command::CallHealthCheck {
                    call_id,
                    retry_count,
                    delay_ms: cfg.health_check_delay_ms,
                },
                cfg.health_check_delay(),
            )
            .await
    }
}
