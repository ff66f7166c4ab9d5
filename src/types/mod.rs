pub mod events;
pub mod frames;
pub mod message;

pub use frames::{ClientFrame, ServerFrame, WireMessage};
pub use message::{Message, ProvisionalMessage, SendStatus};
