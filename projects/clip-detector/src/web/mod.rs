pub mod api;
pub mod assets;
pub mod download;
pub mod error;
pub mod server;
pub mod state;
pub mod upload;
