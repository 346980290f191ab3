pub mod api;
pub mod backup;
pub mod error;
pub mod preferences;
pub mod storage;
pub mod utils;
pub mod web;

pub use error::{Result, ZipBackupError};
