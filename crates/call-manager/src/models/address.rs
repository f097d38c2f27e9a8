use serde::{Deserialize, Serialize};

/// Kind of dialable target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AddressType {
    #[default]
    None,
    Tel,
    Sip,
    Agent,
    Extension,
}

/// Source or destination of a call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Address {
    #[serde(rename = "type", default)]
    pub address_type: AddressType,
    #[serde(default)]
    pub target: String,
    #[serde(default)]
    pub target_name: String,
}

impl Address {
    pub fn new(address_type: AddressType, target: impl Into<String>) -> Self {
        Self {
            address_type,
            target: target.into(),
            target_name: String::new(),
        }
    }

    pub fn tel(target: impl Into<String>) -> Self {
        Self::new(AddressType::Tel, target)
    }

    pub fn sip(target: impl Into<String>) -> Self {
        Self::new(AddressType::Sip, target)
    }

    pub fn is_empty(&self) -> bool {
        self.target.is_empty()
    }

    /// Endpoint string handed to the PBX when originating
    pub fn endpoint(&self) -> String {
        match self.address_type {
            AddressType::Tel => format!("tel:{}", self.target),
            AddressType::Sip => format!("sip:{}", self.target),
            AddressType::Agent => format!("agent:{}", self.target),
            AddressType::Extension => format!("extension:{}", self.target),
            AddressType::None => self.target.clone(),
        }
    }
}
