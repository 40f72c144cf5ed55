//! Session model and persistence.

pub mod models;
pub mod repository;

pub use models::{BackendKind, SessionRecord, SessionSpec, SessionStatus};
pub use repository::SessionRepository;
