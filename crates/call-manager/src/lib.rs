//! # Call Manager
//!
//! Call-control core for a PBX-backed telephony platform. PBX events and
//! internal commands drive the lifecycle of channels, calls, groupcalls,
//! conference bridges and external media legs, and each call's flow of
//! actions is executed one step at a time.
//!
//! - [`dispatcher`]: routes PBX event envelopes to per-type handlers
//! - [`channel`]: channel registry and health monitor
//! - [`call`]: call state machine
//! - [`action`]: action execution engine
//! - [`groupcall`]: ring-all / linear dialing with an answer race
//! - [`confbridge`]: conference bridge membership
//! - [`external_media`]: RTP legs bridged to calls and confbridges
//! - [`recording`]: channel and bridge recordings
//! - [`listen`]: resource-oriented command surface
//!
//! Persistence, the PBX connection, the transport and the flow service are
//! collaborators behind the traits in [`store`], [`pbx`], [`transport`] and
//! [`flow`]. In-memory implementations of all but the PBX are bundled.
//!
//! ```ignore
//! use rvoip_call_manager::prelude::*;
//!
//! let manager = CallManager::builder()
//!     .with_config(CallManagerConfig::load(None)?)
//!     .with_pbx(pbx)
//!     .build()?;
//! manager.start()?;
//! manager.dispatch_event(envelope).await?;
//! ```

pub mod error;
pub mod config;
pub mod models;
pub mod store;
pub mod pbx;
pub mod flow;
pub mod transport;
pub mod monitoring;
pub mod context;

pub mod channel;
pub mod call;
pub mod action;
pub mod groupcall;
pub mod confbridge;
pub mod external_media;
pub mod recording;
pub mod dispatcher;
pub mod listen;

mod engine;

pub use config::CallManagerConfig;
pub use context::ServiceContext;
pub use engine::{init_logging, CallManager, CallManagerBuilder};
pub use error::{CallManagerError, Result};

pub mod prelude {
    pub use crate::action::ActionEngine;
    pub use crate::call::{CallHandler, OutgoingCallRequest};
    pub use crate::channel::ChannelHandler;
    pub use crate::confbridge::{ConfbridgeHandler, ConfbridgeRequest};
    pub use crate::config::CallManagerConfig;
    pub use crate::dispatcher::EventDispatcher;
    pub use crate::error::{CallManagerError, Result};
    pub use crate::external_media::{ExternalMediaHandler, ExternalMediaRequest};
    pub use crate::groupcall::{GroupcallHandler, GroupcallRequest};
    pub use crate::listen::{ListenHandler, Method, Request, Response};
    pub use crate::models::*;
    pub use crate::pbx::PbxClient;
    pub use crate::recording::{RecordingHandler, RecordingRequest};
    pub use crate::store::{Database, ListFilter, MemoryDatabase};
    pub use crate::transport::{Command, Requester};
    pub use crate::{CallManager, CallManagerBuilder};
}
