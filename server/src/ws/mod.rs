pub mod actor;
pub mod broadcast;
pub mod handler;
pub mod protocol;
pub mod registry;

pub use registry::{ConnectionId, ConnectionRegistry, ConnectionSender, Outbound};
