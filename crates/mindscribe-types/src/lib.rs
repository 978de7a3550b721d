pub mod auth;
pub mod message;

pub use auth::*;
pub use message::*;
