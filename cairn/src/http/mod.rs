pub mod api;
pub mod auth;
pub mod error;
pub mod rate_limit;
pub mod server;

pub use api::AppState;
pub use error::ApiError;
pub use server::{build_router, run_http_server};
