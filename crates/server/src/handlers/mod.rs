//! HTTP request handlers.

pub mod chunks;
pub mod common;
pub mod fallback;
pub mod health;
pub mod sessions;

pub use chunks::*;
pub use fallback::*;
pub use health::*;
pub use sessions::*;
