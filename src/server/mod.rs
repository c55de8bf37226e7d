//! HTTP control API.
//!
//! Handlers are thin: they decode the request, hop onto the blocking pool
//! with `spawn_blocking` and call into [`crate::app_context::AppContext`].

mod router;
mod state;

pub use router::build_router;
pub use state::ServeState;
