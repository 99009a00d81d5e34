pub mod admission;
pub mod engine;
pub mod error;
pub mod state;
pub mod upstream_client;

pub use engine::{EngineBody, EngineResponse, GuardEngine};
pub use error::{ErrorDialect, GuardError};
pub use state::AppState;
