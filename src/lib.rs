pub mod crypto;
pub mod error;
pub mod services;
pub mod state;

pub use error::{ChatError, Result};
pub use state::AppState;
