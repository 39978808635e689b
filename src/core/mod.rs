pub mod error;

pub use error::{strerror, Error, ErrorCategory, ErrorCode, Result};

use crate::scanner::database;
use once_cell::sync::OnceCell;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Capability generation of this engine. Databases declaring a higher level
/// carry signatures this engine skips.
pub const FUNCTIONALITY_LEVEL: u32 = 160;

const DEFAULT_DB_DIR: &str = "/var/lib/clamav";
const DB_DIR_ENV: &str = "CLAMAV_DBDIR";

static LIBRARY: OnceCell<InitFlags> = OnceCell::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitFlags(u32);

impl InitFlags {
    pub const DEFAULT: InitFlags = InitFlags(0);
    const KNOWN: u32 = 0;

    pub fn from_bits(bits: u32) -> Option<Self> {
        if bits & !Self::KNOWN != 0 {
            return None;
        }
        Some(InitFlags(bits))
    }

    pub fn bits(self) -> u32 {
        self.0
    }
}

impl Default for InitFlags {
    fn default() -> Self {
        InitFlags::DEFAULT
    }
}

/// Initializes the library. Must run before the first `Engine::new`.
///
/// Calling it again is a no-op: the flags of the first call stay in effect.
pub fn init(flags: InitFlags) -> Result<()> {
    init_cell(&LIBRARY, flags)
}

fn init_cell(cell: &OnceCell<InitFlags>, flags: InitFlags) -> Result<()> {
    let mut first = false;
    let active = cell.get_or_init(|| {
        first = true;
        flags
    });

    if first {
        log::debug!("engine library initialized (flags {:#x})", flags.bits());
    } else if *active != flags {
        log::debug!(
            "engine library already initialized with flags {:#x}; ignoring {:#x}",
            active.bits(),
            flags.bits()
        );
    }
    Ok(())
}

pub fn is_initialized() -> bool {
    LIBRARY.get().is_some()
}

pub(crate) fn ensure_initialized() -> Result<()> {
    check_initialized(&LIBRARY)
}

/// `Estate` unless `cell` has been initialized.
pub(crate) fn check_initialized(cell: &OnceCell<InitFlags>) -> Result<()> {
    match cell.get() {
        Some(_) => Ok(()),
        None => Err(Error::state("library not initialized; call init() first")),
    }
}

pub fn retflevel() -> u32 {
    FUNCTIONALITY_LEVEL
}

pub fn retver() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Default signature database directory.
pub fn db_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(DB_DIR_ENV) {
        if !dir.is_empty() {
            return PathBuf::from(dir);
        }
    }
    match option_env!("CLAMAV_DBDIR") {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => PathBuf::from(DEFAULT_DB_DIR),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CountSigsMask(u32);

impl CountSigsMask {
    pub const OFFICIAL: CountSigsMask = CountSigsMask(0x1);
    pub const UNOFFICIAL: CountSigsMask = CountSigsMask(0x2);
    pub const ALL: CountSigsMask = CountSigsMask(0x3);

    pub fn from_bits(bits: u32) -> Self {
        CountSigsMask(bits)
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn official(self) -> bool {
        self.0 & Self::OFFICIAL.0 != 0
    }

    pub fn unofficial(self) -> bool {
        self.0 & Self::UNOFFICIAL.0 != 0
    }
}

/// Counts signatures under `path` without loading them into an engine.
///
/// Containers report the count declared in their header; plain databases are
/// counted line by line. An empty directory counts zero.
pub fn count_sigs(path: impl AsRef<Path>, mask: CountSigsMask) -> Result<u64> {
    let path = path.as_ref();
    if !mask.official() && !mask.unofficial() {
        return Err(Error::arg(format!("count mask {:#x} selects nothing", mask.bits())));
    }

    let metadata = std::fs::metadata(path).map_err(|e| Error::io(ErrorCode::Estat, path, e))?;
    if metadata.is_file() {
        return database::count_file_sigs(path, mask);
    }

    let mut total = 0u64;
    for entry in WalkDir::new(path).min_depth(1).max_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            let source = std::io::Error::new(std::io::ErrorKind::Other, e.to_string());
            Error::io(ErrorCode::Eopen, path, source)
        })?;
        if entry.file_type().is_file() {
            total += database::count_file_sigs(entry.path(), mask)?;
        }
    }

    log::debug!("counted {} signatures under {:?}", total, path);
    Ok(total)
}
