pub mod archive;
pub mod backup;
pub mod config;
pub mod error;
pub mod restore;
pub mod server;
pub mod storage;
