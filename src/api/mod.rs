pub mod error;
pub mod response;
pub mod route;
pub mod state;

pub use error::ApiError;
pub use response::ApiResponse;
pub use route::create_router;
pub use state::AppState;
