pub mod auth;
pub mod cache;
pub mod config;
pub mod drive;
pub mod errors;
pub mod fuse;
pub mod http;
pub mod logging;
pub mod posix;
pub mod queue;
pub mod tree;
