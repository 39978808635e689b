pub mod database;
pub mod engine;
pub mod fields;
pub mod matcher;
pub mod options;
pub mod settings;
pub mod unpack;

#[cfg(test)]
mod tests;

pub use database::{BodySignature, CvdHeader, HashSignature, HashType, LineError, SignatureDatabase};
pub use engine::{Engine, EngineState, ScanResult};
pub use fields::{EngineField, FieldAccess, FieldKind, FieldSpec, FieldValue, FieldWidth, ALL_FIELDS};
pub use options::{DbOptions, ScanOptions, COUNT_PRECISION};
pub use settings::{free_settings, Settings};
