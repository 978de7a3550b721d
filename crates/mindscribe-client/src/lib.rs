pub mod decode;
pub mod error;
pub mod rag;

pub use decode::*;
pub use error::*;
pub use rag::*;
