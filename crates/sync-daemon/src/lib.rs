//! sync-daemon library: native pieces for running sync passes outside the
//! editor.

pub mod config;
pub mod native_fs;
pub mod store;

pub use config::{Config, ConfigError, Overrides, expand_tilde};
pub use native_fs::NativeFs;
pub use store::JsonFileStore;
