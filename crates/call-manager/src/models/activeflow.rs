use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::action::Action;
use crate::error::{CallManagerError, Result};

/// Per-call cursor over an ordered action list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Activeflow {
    pub id: Uuid,
    pub customer_id: Uuid,
    pub flow_id: Uuid,
    pub reference_call_id: Uuid,

    pub actions: Vec<Action>,
    pub current_action: Option<Action>,
    /// Jump target taking precedence over the natural sequence; consumed on use
    pub forward_action_id: Option<Uuid>,
    /// Jumps taken per goto action, used to honour loop counts
    pub goto_counts: HashMap<Uuid, u32>,
    pub execute_count: u64,

    pub tm_create: Option<DateTime<Utc>>,
    pub tm_update: Option<DateTime<Utc>>,
    pub tm_delete: Option<DateTime<Utc>>,
}

impl Activeflow {
    pub fn new(customer_id: Uuid, flow_id: Uuid, reference_call_id: Uuid, actions: Vec<Action>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            customer_id,
            flow_id,
            reference_call_id,
            actions,
            tm_create: Some(now),
            tm_update: Some(now),
            ..Default::default()
        }
    }

    fn position(&self, action_id: Uuid) -> Option<usize> {
        self.actions.iter().position(|a| a.id == action_id)
    }

    /// Set the forward pointer. The target must be part of this flow.
    pub fn set_forward(&mut self, action_id: Uuid) -> Result<()> {
        if self.position(action_id).is_none() {
            return Err(CallManagerError::invalid_input(format!(
                "action {} is not part of activeflow {}",
                action_id, self.id
            )));
        }
        self.forward_action_id = Some(action_id);
        Ok(())
    }

    /// Move the cursor and return the action now current.
    ///
    /// Order: forward pointer, then the action after the current one, then the finish action.
    pub fn advance(&mut self) -> Action {
        let next = match self.forward_action_id.take().and_then(|id| self.position(id)) {
            Some(idx) => self.actions[idx].clone(),
            None => {
                let idx = match &self.current_action {
                    Some(current) => self.position(current.id).map(|i| i + 1),
                    None => Some(0),
                };
                match idx.and_then(|i| self.actions.get(i)) {
                    Some(action) => action.clone(),
                    None => Action::finish(),
                }
            }
        };

        self.current_action = Some(next.clone());
        self.execute_count += 1;
        self.tm_update = Some(Utc::now());
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::action::ActionType;
    use serde_json::Value;

    fn flow() -> Activeflow {
        let actions = vec![
            Action::new(ActionType::Answer, Value::Null),
            Action::new(ActionType::Play, Value::Null),
            Action::new(ActionType::Sleep, Value::Null),
        ];
        Activeflow::new(Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), actions)
    }

    #[test]
    fn test_advance_in_order_then_finish() {
        let mut af = flow();
        let ids: Vec<Uuid> = af.actions.iter().map(|a| a.id).collect();
        assert_eq!(af.advance().id, ids[0]);
        assert_eq!(af.advance().id, ids[1]);
        assert_eq!(af.advance().id, ids[2]);
        assert!(af.advance().is_finish());
        assert!(af.advance().is_finish());
    }

    #[test]
    fn test_forward_pointer_wins_and_is_consumed() {
        let mut af = flow();
        let ids: Vec<Uuid> = af.actions.iter().map(|a| a.id).collect();
        af.advance();
        af.set_forward(ids[2]).unwrap();
        assert_eq!(af.advance().id, ids[2]);
        assert!(af.forward_action_id.is_none());
        assert!(af.advance().is_finish());
    }

    #[test]
    fn test_forward_to_unknown_action_rejected() {
        let mut af = flow();
        assert!(af.set_forward(Uuid::new_v4()).is_err());
    }
}
