pub mod auth;
pub mod chat;
pub mod conversations;
pub mod error;
pub mod middleware;
pub mod users;

pub use auth::{AppState, AppStateInner};
