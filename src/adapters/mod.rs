pub mod config;
pub mod cursor;
pub mod http;
pub mod providers;
pub mod rate_limiter;
