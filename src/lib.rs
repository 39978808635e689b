//! Engine handle, configuration surface and scanner for ClamAV-style
//! signature databases.
//!
//! ```no_run
//! use clamav_engine::{init, DbOptions, Engine, InitFlags, ScanOptions};
//!
//! # fn main() -> clamav_engine::Result<()> {
//! init(InitFlags::DEFAULT)?;
//! let engine = Engine::new()?;
//! engine.load(clamav_engine::db_dir(), DbOptions::STDOPT)?;
//! engine.compile()?;
//! let result = engine.scan_file("/tmp/sample", &ScanOptions::default())?;
//! println!("{}", result.virus_name());
//! engine.free()?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod core;
pub mod scanner;
pub mod utils;


pub use crate::core::{
    count_sigs, db_dir, init, is_initialized, retflevel, retver, strerror, CountSigsMask, Error,
    ErrorCategory, ErrorCode, InitFlags, Result, FUNCTIONALITY_LEVEL,
};
pub use crate::scanner::{
    free_settings, DbOptions, Engine, EngineField, EngineState, FieldValue, ScanOptions, ScanResult,
    Settings, COUNT_PRECISION,
};
pub use config::EngineConfig;
