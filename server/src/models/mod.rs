pub mod gateway;
pub mod node;
pub mod slot;
pub mod user;

pub use gateway::GatewayRecord;
pub use node::{NewNode, NodeRecord};
pub use slot::TimeSlot;
pub use user::User;
