pub mod http;
pub mod long_poll;

pub use http::{HttpConfig, HttpTransport};
pub use long_poll::{PollOutcome, wait_for_message};
