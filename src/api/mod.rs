//! REST surface: a thin adapter over the core.

pub mod error;
pub mod models;
pub mod server;
pub mod services;
pub mod state;

pub use server::{build_router, build_state, build_state_with_thumbnailer, run};
pub use state::AppState;
