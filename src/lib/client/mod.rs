pub mod error;
pub mod message_store;
pub mod publisher;
pub mod subscriber;

pub use error::ClientError;
pub use message_store::{MessageStore, Mismatch, ReceivedMessage};
pub use publisher::Publisher;
pub use subscriber::{Subscriber, SubscriberConfig, SubscriberHandle};
