pub mod cache;
pub mod config;
pub mod error;
pub mod index;
pub mod model;
pub mod query;
pub mod store;

pub use error::IndexError;
pub use index::engine::IndexEngine;
