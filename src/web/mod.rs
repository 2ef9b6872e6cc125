pub mod api;
pub mod server;

pub use api::{ApiError, AppState};
pub use server::{create_router, run_server};
