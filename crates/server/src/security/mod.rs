pub mod access;
pub mod limiter;
pub mod sessions;
