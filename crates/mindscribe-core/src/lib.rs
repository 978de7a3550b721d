pub mod cache;
pub mod chat;
pub mod config;
pub mod deadline;
pub mod event_bus;
pub mod paths;
pub mod session;
pub mod store;
pub mod title;

pub use cache::*;
pub use chat::*;
pub use config::*;
pub use deadline::*;
pub use event_bus::*;
pub use paths::*;
pub use session::*;
pub use store::*;
pub use title::*;
