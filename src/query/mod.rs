pub mod http;
pub mod service;

pub use service::QueryService;
