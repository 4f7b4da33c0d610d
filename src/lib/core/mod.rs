pub mod channel_log;
pub mod error;
pub mod message;
pub mod event_bus;

pub use channel_log::*;
pub use error::*;
pub use message::*;
pub use event_bus::*;
