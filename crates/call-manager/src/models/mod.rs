//! Records owned by the call manager and the PBX events it consumes

pub mod address;
pub mod channel;
pub mod call;
pub mod action;
pub mod activeflow;
pub mod groupcall;
pub mod confbridge;
pub mod external_media;
pub mod recording;
pub mod event;

pub use address::{Address, AddressType};
pub use channel::{Channel, ChannelCause, ChannelDirection, ChannelState, ChannelType};
pub use call::{Call, CallDirection, CallStatus, CallType, HangupBy, HangupReason};
pub use action::{
    Action, ActionType, BeepOption, BranchOption, ConfbridgeJoinOption, DigitsReceiveOption, DigitsSendOption,
    EchoOption, ExternalMediaStartOption, GotoOption, HangupOption, PlayOption, RecordingStartOption, SleepOption,
    TalkOption,
};
pub use activeflow::Activeflow;
pub use groupcall::{AnswerMethod, Groupcall, GroupcallStatus, RingMethod};
pub use confbridge::{Confbridge, ConfbridgeFlag, ConfbridgeReferenceType, ConfbridgeStatus, ConfbridgeType};
pub use external_media::{
    ConnectionType, Encapsulation, ExternalMedia, ExternalMediaStatus, MediaDirection, ReferenceType, Transport,
};
pub use recording::{Recording, RecordingStatus};
pub use event::{synthetic_channel_destroyed, EventEnvelope, EventType, PbxEvent};
