pub mod connection;
pub mod error;
pub mod registry;
pub mod session;

pub use registry::ChannelRegistry;
pub use session::{Caller, ChatSession};
