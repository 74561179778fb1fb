//! HTTP API handlers for segloop-server
//!
//! JSON in, JSON out. Errors use `{"error": {"code", "message"}}` (see
//! `crate::error::ApiError`).

pub mod auth;
pub mod cvat;
pub mod health;
pub mod inference;
pub mod root;
pub mod training;

pub use auth::auth_routes;
pub use cvat::cvat_routes;
pub use health::health_routes;
pub use inference::inference_routes;
pub use root::root_routes;
pub use training::training_routes;
