//! WSN Testbed Common Types
//!
//! Wire-level types shared by the control server and field gateways.

pub mod frame;
pub mod node;
pub mod protocol;

pub use frame::{
    encode_response, encode_sized, sized_chunks, Frame, FrameBuffer, FrameError, Heartbeat,
    ResponseBuffer, CHUNK_SIZE, HEARTBEAT_LEN, MAX_PAYLOAD,
};
pub use node::{FlashState, NodeStatus};
pub use protocol::{
    Action, DayQuery, GatewayNodeRequest, GatewayNodeResult, ImageDeleteRequest, ImageSaveRequest,
    LoginRequest, NodeOperationRequest, NodeOutcome, NodeReport, SignupRequest, SlotRequest,
    SlotWindow, SlotsSaveRequest, Telemetry, TokenRequest,
};
