pub mod feed;
pub mod parser;
pub mod price_history;
pub mod reconnect;

pub use feed::{FeedConnectionManager, FeedStatus, TickHandler, WebSocketTransport};
pub use price_history::PriceHistoryStore;
pub use reconnect::{ReconnectConfig, ReconnectPolicy};
