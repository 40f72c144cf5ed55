//! HTTP edge surface.

pub mod error;
pub mod handlers;
pub mod proxy;
pub mod routes;
pub mod state;

pub use error::{ApiError, ApiResult, Envelope};
pub use routes::router;
pub use state::{AppState, LogMenuSink, MenuSink};
