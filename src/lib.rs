pub mod aggregate;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod fallback;
pub mod mode;
pub mod response;
pub mod selector;
pub mod server;
