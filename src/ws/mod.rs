mod bus;
mod client;
mod messages;

pub use bus::{EventBus, Subscription};
pub use client::{WsClient, WsClientConfig};
pub use messages::{ClientMessage, MessageKind, ServerMessage};
