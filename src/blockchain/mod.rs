pub mod abi;
pub mod client;
pub mod models;
pub mod subscription;
pub mod transport;

// Re-exports for convenience
pub use client::{ChainClient, ChainClientSettings, ChainError};
pub use subscription::LiveFilter;
pub use transport::{HttpTransport, RpcTransport};
