pub mod hub;
pub mod messages;

pub use hub::{BroadcastHub, IndicatorStatus, SubscriberId};
pub use messages::{Channel, ClientMessage, ServerMessage};
