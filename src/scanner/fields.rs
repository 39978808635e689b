//! Engine configuration fields and the descriptor table that validates them.
//!
//! Every field id is fixed; configuration files and existing callers rely on
//! the numeric values. All width, mutability and zero checks go through
//! [`FieldSpec::validate_num`] so the rules live in one place.

use crate::core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u32)]
pub enum EngineField {
    MaxScansize = 0,
    MaxFilesize = 1,
    MaxRecursion = 2,
    MaxFiles = 3,
    MinCcCount = 4,
    MinSsnCount = 5,
    PuaCategories = 6,
    DbOptions = 7,
    DbVersion = 8,
    DbTime = 9,
    AcOnly = 10,
    AcMindepth = 11,
    AcMaxdepth = 12,
    Tmpdir = 13,
    Keeptmp = 14,
    BytecodeSecurity = 15,
    BytecodeTimeout = 16,
    BytecodeMode = 17,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Num,
    Str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldWidth {
    Bits32,
    Bits64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldAccess {
    ReadWrite,
    ReadOnly,
}

#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    pub kind: FieldKind,
    pub width: FieldWidth,
    pub access: FieldAccess,
    pub zero_allowed: bool,
}

const fn num(width: FieldWidth, zero_allowed: bool) -> FieldSpec {
    FieldSpec {
        kind: FieldKind::Num,
        width,
        access: FieldAccess::ReadWrite,
        zero_allowed,
    }
}

const fn read_only(width: FieldWidth) -> FieldSpec {
    FieldSpec {
        kind: FieldKind::Num,
        width,
        access: FieldAccess::ReadOnly,
        zero_allowed: true,
    }
}

const STRING: FieldSpec = FieldSpec {
    kind: FieldKind::Str,
    width: FieldWidth::Bits64,
    access: FieldAccess::ReadWrite,
    zero_allowed: true,
};

pub const ALL_FIELDS: [EngineField; 18] = [
    EngineField::MaxScansize,
    EngineField::MaxFilesize,
    EngineField::MaxRecursion,
    EngineField::MaxFiles,
    EngineField::MinCcCount,
    EngineField::MinSsnCount,
    EngineField::PuaCategories,
    EngineField::DbOptions,
    EngineField::DbVersion,
    EngineField::DbTime,
    EngineField::AcOnly,
    EngineField::AcMindepth,
    EngineField::AcMaxdepth,
    EngineField::Tmpdir,
    EngineField::Keeptmp,
    EngineField::BytecodeSecurity,
    EngineField::BytecodeTimeout,
    EngineField::BytecodeMode,
];

impl EngineField {
    pub fn spec(self) -> FieldSpec {
        use FieldWidth::*;
        match self {
            EngineField::MaxScansize | EngineField::MaxFilesize => num(Bits64, true),
            EngineField::MaxRecursion => num(Bits32, false),
            EngineField::MaxFiles
            | EngineField::MinCcCount
            | EngineField::MinSsnCount
            | EngineField::AcOnly
            | EngineField::AcMindepth
            | EngineField::AcMaxdepth
            | EngineField::Keeptmp
            | EngineField::BytecodeSecurity
            | EngineField::BytecodeTimeout
            | EngineField::BytecodeMode => num(Bits32, true),
            EngineField::DbOptions | EngineField::DbVersion => read_only(Bits32),
            EngineField::DbTime => read_only(Bits64),
            EngineField::PuaCategories | EngineField::Tmpdir => STRING,
        }
    }

    pub fn id(self) -> u32 {
        self as u32
    }

    pub fn name(self) -> &'static str {
        match self {
            EngineField::MaxScansize => "max_scansize",
            EngineField::MaxFilesize => "max_filesize",
            EngineField::MaxRecursion => "max_recursion",
            EngineField::MaxFiles => "max_files",
            EngineField::MinCcCount => "min_cc_count",
            EngineField::MinSsnCount => "min_ssn_count",
            EngineField::PuaCategories => "pua_categories",
            EngineField::DbOptions => "db_options",
            EngineField::DbVersion => "db_version",
            EngineField::DbTime => "db_time",
            EngineField::AcOnly => "ac_only",
            EngineField::AcMindepth => "ac_mindepth",
            EngineField::AcMaxdepth => "ac_maxdepth",
            EngineField::Tmpdir => "tmpdir",
            EngineField::Keeptmp => "keeptmp",
            EngineField::BytecodeSecurity => "bytecode_security",
            EngineField::BytecodeTimeout => "bytecode_timeout",
            EngineField::BytecodeMode => "bytecode_mode",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        ALL_FIELDS.iter().copied().find(|f| f.name() == name)
    }

    pub fn is_read_only(self) -> bool {
        self.spec().access == FieldAccess::ReadOnly
    }

    pub fn is_string(self) -> bool {
        self.spec().kind == FieldKind::Str
    }

    /// Value a freshly created engine starts with.
    pub(crate) fn default_value(self) -> FieldValue {
        match self {
            EngineField::MaxScansize => FieldValue::Num(100 * 1024 * 1024),
            EngineField::MaxFilesize => FieldValue::Num(25 * 1024 * 1024),
            EngineField::MaxRecursion => FieldValue::Num(16),
            EngineField::MaxFiles => FieldValue::Num(10_000),
            EngineField::MinCcCount | EngineField::MinSsnCount => FieldValue::Num(3),
            EngineField::AcMindepth => FieldValue::Num(2),
            EngineField::AcMaxdepth => FieldValue::Num(3),
            EngineField::BytecodeSecurity => FieldValue::Num(1),
            EngineField::BytecodeTimeout => FieldValue::Num(5000),
            EngineField::PuaCategories | EngineField::Tmpdir => FieldValue::Str(String::new()),
            _ => FieldValue::Num(0),
        }
    }
}

impl TryFrom<u32> for EngineField {
    type Error = Error;

    fn try_from(id: u32) -> Result<Self> {
        ALL_FIELDS
            .get(id as usize)
            .copied()
            .ok_or_else(|| Error::arg(format!("unknown engine field {}", id)))
    }
}

impl fmt::Display for EngineField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name(), self.id())
    }
}

impl FieldSpec {
    /// Checks a numeric write against the field's declared rules.
    pub fn validate_num(&self, field: EngineField, value: u64) -> Result<()> {
        if self.kind != FieldKind::Num {
            return Err(Error::arg(format!("{} is a string field", field)));
        }
        if self.access == FieldAccess::ReadOnly {
            return Err(Error::arg(format!("{} is read-only", field)));
        }
        if self.width == FieldWidth::Bits32 && value > u32::MAX as u64 {
            return Err(Error::arg(format!(
                "{} is 32 bits wide; {} does not fit",
                field, value
            )));
        }
        if !self.zero_allowed && value == 0 {
            return Err(Error::arg(format!("{} must not be zero", field)));
        }
        Ok(())
    }

    pub fn validate_str(&self, field: EngineField) -> Result<()> {
        if self.kind != FieldKind::Str {
            return Err(Error::arg(format!("{} is a numeric field", field)));
        }
        if self.access == FieldAccess::ReadOnly {
            return Err(Error::arg(format!("{} is read-only", field)));
        }
        Ok(())
    }

    pub fn validate(&self, field: EngineField, value: &FieldValue) -> Result<()> {
        match value {
            FieldValue::Num(n) => self.validate_num(field, *n),
            FieldValue::Str(_) => self.validate_str(field),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Num(u64),
    Str(String),
}

impl FieldValue {
    pub fn as_num(&self) -> Option<u64> {
        match self {
            FieldValue::Num(n) => Some(*n),
            FieldValue::Str(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Num(_) => None,
            FieldValue::Str(s) => Some(s),
        }
    }
}

impl From<u64> for FieldValue {
    fn from(n: u64) -> Self {
        FieldValue::Num(n)
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        FieldValue::Str(s.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(s: String) -> Self {
        FieldValue::Str(s)
    }
}
