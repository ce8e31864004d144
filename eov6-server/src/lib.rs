pub mod auth;
pub mod context;
pub mod error;
pub mod http;
pub mod subsystems;

pub use context::AppContext;
pub use error::ApiError;
