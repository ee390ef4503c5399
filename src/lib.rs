pub mod api;
pub mod blockchain;
pub mod cache;
pub mod config;
pub mod db;
pub mod indexing;
pub mod models;
pub mod service;
pub mod validation;

#[cfg(test)]
pub mod tests;

// Re-export specific items for convenience
pub use db::connection;
pub use models::{Document, DocumentRef, Hint};
pub use validation::{checksum_address, normalize_address, validate_ethereum_address};
pub use api::error::ApiError;
pub use api::response::ApiResponse;
pub use api::route::create_router;
pub use indexing::{IndexingCoordinator, UpdateRequest};
pub use service::HubService;
