//! WaveForge upload server library.
//!
//! The protocol handlers, session registry, assembler, completion
//! coordinator, and sweeper live here; `main.rs` wires them together.

pub mod assembler;
pub mod coordinator;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod registry;
pub mod routes;
pub mod state;
pub mod sweeper;

pub use coordinator::CompletionCoordinator;
pub use error::{ApiError, ApiResult};
pub use registry::SessionRegistry;
pub use routes::create_router;
pub use state::{AppState, AssemblyTaskRegistry};
