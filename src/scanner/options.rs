use serde::{Deserialize, Serialize};

/// Bytes per scanned unit reported by scans.
pub const COUNT_PRECISION: u64 = 4096;

pub mod general {
    pub const ALLMATCHES: u32 = 0x1;
    pub const COLLECT_METADATA: u32 = 0x2;
    pub const HEURISTICS: u32 = 0x4;
    pub const HEURISTIC_PRECEDENCE: u32 = 0x8;
    pub const UNPRIVILEGED: u32 = 0x10;
}

pub mod parse {
    pub const ARCHIVE: u32 = 0x1;
    pub const ELF: u32 = 0x2;
    pub const PDF: u32 = 0x4;
    pub const SWF: u32 = 0x8;
    pub const HWP3: u32 = 0x10;
    pub const XMLDOCS: u32 = 0x20;
    pub const MAIL: u32 = 0x40;
    pub const OLE2: u32 = 0x80;
    pub const HTML: u32 = 0x100;
    pub const PE: u32 = 0x200;
    pub const ALL: u32 = !0;
}

pub mod heuristic {
    pub const EXCEEDS_MAX: u32 = 0x80;
}

/// Per-call scan flags. Passed by value; never changes the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanOptions {
    pub general: u32,
    pub parse: u32,
    pub heuristic: u32,
    pub mail: u32,
    pub dev: u32,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            general: 0,
            parse: parse::ALL,
            heuristic: 0,
            mail: 0,
            dev: 0,
        }
    }
}

impl ScanOptions {
    pub fn all_matches() -> Self {
        Self {
            general: general::ALLMATCHES,
            ..Self::default()
        }
    }

    pub fn all_matches_enabled(&self) -> bool {
        self.general & general::ALLMATCHES != 0
    }

    pub fn archives_enabled(&self) -> bool {
        self.parse & parse::ARCHIVE != 0
    }

    pub fn report_exceeded_limits(&self) -> bool {
        self.heuristic & heuristic::EXCEEDS_MAX != 0
    }
}

/// Database load options (`Engine::load`), accumulated into the read-only
/// `DbOptions` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DbOptions(pub u32);

impl DbOptions {
    pub const NONE: DbOptions = DbOptions(0);
    pub const PHISHING: DbOptions = DbOptions(0x2);
    pub const PHISHING_URLS: DbOptions = DbOptions(0x8);
    pub const PUA: DbOptions = DbOptions(0x10);
    pub const CVDNOTMP: DbOptions = DbOptions(0x20);
    pub const OFFICIAL: DbOptions = DbOptions(0x40);
    pub const PUA_MODE: DbOptions = DbOptions(0x80);
    pub const PUA_INCLUDE: DbOptions = DbOptions(0x100);
    pub const PUA_EXCLUDE: DbOptions = DbOptions(0x200);
    pub const COMPILED: DbOptions = DbOptions(0x400);
    pub const DIRECTORY: DbOptions = DbOptions(0x800);
    pub const OFFICIAL_ONLY: DbOptions = DbOptions(0x1000);
    pub const BYTECODE: DbOptions = DbOptions(0x2000);
    pub const SIGNED: DbOptions = DbOptions(0x4000);
    pub const BYTECODE_UNSIGNED: DbOptions = DbOptions(0x8000);
    pub const UNSIGNED: DbOptions = DbOptions(0x10000);
    pub const BYTECODE_STATS: DbOptions = DbOptions(0x20000);
    pub const ENHANCED: DbOptions = DbOptions(0x40000);
    pub const PCRE_STATS: DbOptions = DbOptions(0x80000);
    pub const YARA_EXCLUDE: DbOptions = DbOptions(0x100000);
    pub const YARA_ONLY: DbOptions = DbOptions(0x200000);

    /// The recommended option set.
    pub const STDOPT: DbOptions = DbOptions(0x2 | 0x8 | 0x2000);

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, other: DbOptions) -> bool {
        self.0 & other.0 == other.0
    }
}

impl Default for DbOptions {
    fn default() -> Self {
        DbOptions::STDOPT
    }
}

impl std::ops::BitOr for DbOptions {
    type Output = DbOptions;

    fn bitor(self, rhs: DbOptions) -> DbOptions {
        DbOptions(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for DbOptions {
    fn bitor_assign(&mut self, rhs: DbOptions) {
        self.0 |= rhs.0;
    }
}
