//! Result codes and the typed error returned by every engine operation.
//!
//! `ErrorCode` keeps the engine's numeric code space stable; `Error` wraps a code
//! with whatever context was available where it was raised.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

const UNKNOWN_ERROR: &str = "Unknown error code";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(i32)]
pub enum ErrorCode {
    Success = 0,
    Virus = 1,
    Enullarg = 2,
    Earg = 3,
    Emalfdb = 4,
    Ecvd = 5,
    Everify = 6,
    Eunpack = 7,
    Eopen = 8,
    Ecreat = 9,
    Eunlink = 10,
    Estat = 11,
    Eread = 12,
    Eseek = 13,
    Ewrite = 14,
    Edup = 15,
    Eacces = 16,
    Etmpfile = 17,
    Etmpdir = 18,
    Emap = 19,
    Emem = 20,
    Etimeout = 21,
    Break = 22,
    Emaxrec = 23,
    Emaxsize = 24,
    Emaxfiles = 25,
    Eformat = 26,
    Eparse = 27,
    Ebytecode = 28,
    EbytecodeTestfail = 29,
    Elock = 30,
    Ebusy = 31,
    Estate = 32,
    /// Sentinel; never returned by an operation.
    ELast = 33,
}

const ALL_CODES: [ErrorCode; 34] = [
    ErrorCode::Success,
    ErrorCode::Virus,
    ErrorCode::Enullarg,
    ErrorCode::Earg,
    ErrorCode::Emalfdb,
    ErrorCode::Ecvd,
    ErrorCode::Everify,
    ErrorCode::Eunpack,
    ErrorCode::Eopen,
    ErrorCode::Ecreat,
    ErrorCode::Eunlink,
    ErrorCode::Estat,
    ErrorCode::Eread,
    ErrorCode::Eseek,
    ErrorCode::Ewrite,
    ErrorCode::Edup,
    ErrorCode::Eacces,
    ErrorCode::Etmpfile,
    ErrorCode::Etmpdir,
    ErrorCode::Emap,
    ErrorCode::Emem,
    ErrorCode::Etimeout,
    ErrorCode::Break,
    ErrorCode::Emaxrec,
    ErrorCode::Emaxsize,
    ErrorCode::Emaxfiles,
    ErrorCode::Eformat,
    ErrorCode::Eparse,
    ErrorCode::Ebytecode,
    ErrorCode::EbytecodeTestfail,
    ErrorCode::Elock,
    ErrorCode::Ebusy,
    ErrorCode::Estate,
    ErrorCode::ELast,
];

impl ErrorCode {
    pub fn from_raw(code: i64) -> Option<Self> {
        if code < 0 || code >= ALL_CODES.len() as i64 {
            return None;
        }
        Some(ALL_CODES[code as usize])
    }

    pub fn as_raw(self) -> i32 {
        self as i32
    }

    pub fn description(self) -> &'static str {
        match self {
            ErrorCode::Success => "No viruses detected",
            ErrorCode::Virus => "Virus(es) detected",
            ErrorCode::Enullarg => "Null argument passed to function",
            ErrorCode::Earg => "Invalid argument passed to function",
            ErrorCode::Emalfdb => "Malformed database",
            ErrorCode::Ecvd => "Broken or not a CVD file",
            ErrorCode::Everify => "Can't verify database integrity",
            ErrorCode::Eunpack => "Can't unpack some data",
            ErrorCode::Eopen => "Can't open file or directory",
            ErrorCode::Ecreat => "Can't create new file",
            ErrorCode::Eunlink => "Can't unlink file",
            ErrorCode::Estat => "Can't get file status",
            ErrorCode::Eread => "Can't read file",
            ErrorCode::Eseek => "Can't set file offset",
            ErrorCode::Ewrite => "Can't write to file",
            ErrorCode::Edup => "Can't duplicate file descriptor",
            ErrorCode::Eacces => "Can't access file",
            ErrorCode::Etmpfile => "Can't create temporary file",
            ErrorCode::Etmpdir => "Can't create temporary directory",
            ErrorCode::Emap => "Can't map file into memory",
            ErrorCode::Emem => "Can't allocate memory",
            ErrorCode::Etimeout => "Time limit reached",
            ErrorCode::Emaxrec => "CL_EMAXREC",
            ErrorCode::Emaxsize => "CL_EMAXSIZE",
            ErrorCode::Emaxfiles => "CL_EMAXFILES",
            ErrorCode::Eformat => "CL_EFORMAT: Bad format or broken data",
            ErrorCode::Eparse => "Can't parse data",
            ErrorCode::Ebytecode => "Error during bytecode execution",
            ErrorCode::EbytecodeTestfail => "Failure in bytecode testmode",
            ErrorCode::Elock => "Mutex lock failed",
            ErrorCode::Ebusy => "Scanner still active",
            ErrorCode::Estate => "Bad state (engine not initialized, or already initialized)",
            // Break is an internal control code and has no message of its own.
            ErrorCode::Break | ErrorCode::ELast => UNKNOWN_ERROR,
        }
    }

    pub fn category(self) -> ErrorCategory {
        match self {
            ErrorCode::Success | ErrorCode::Virus => ErrorCategory::Detection,
            ErrorCode::Enullarg | ErrorCode::Earg => ErrorCategory::Argument,
            ErrorCode::Emalfdb
            | ErrorCode::Ecvd
            | ErrorCode::Everify
            | ErrorCode::Eunpack
            | ErrorCode::Eformat
            | ErrorCode::Eparse
            | ErrorCode::Ebytecode
            | ErrorCode::EbytecodeTestfail => ErrorCategory::Data,
            ErrorCode::Eopen
            | ErrorCode::Ecreat
            | ErrorCode::Eunlink
            | ErrorCode::Estat
            | ErrorCode::Eread
            | ErrorCode::Eseek
            | ErrorCode::Ewrite
            | ErrorCode::Edup
            | ErrorCode::Eacces
            | ErrorCode::Etmpfile
            | ErrorCode::Etmpdir
            | ErrorCode::Emap
            | ErrorCode::Emem
            | ErrorCode::Etimeout
            | ErrorCode::Emaxrec
            | ErrorCode::Emaxsize
            | ErrorCode::Emaxfiles
            | ErrorCode::Elock => ErrorCategory::Resource,
            ErrorCode::Ebusy | ErrorCode::Estate => ErrorCategory::State,
            ErrorCode::Break | ErrorCode::ELast => ErrorCategory::Unknown,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// Describes any integer as an engine result code. Never fails.
pub fn strerror(code: i64) -> &'static str {
    match ErrorCode::from_raw(code) {
        Some(code) => code.description(),
        None => UNKNOWN_ERROR,
    }
}

/// Coarse classification of a result code, used by callers deciding whether
/// a failure is their fault, the input's, or the environment's.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Argument,
    Resource,
    Data,
    State,
    /// `Success` and `Virus`: outcomes, not failures.
    Detection,
    Unknown,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("{code}: {detail}")]
    Engine { code: ErrorCode, detail: String },

    #[error("{code}: {}", path.display())]
    Io {
        code: ErrorCode,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl Error {
    pub fn new(code: ErrorCode, detail: impl Into<String>) -> Self {
        Error::Engine {
            code,
            detail: detail.into(),
        }
    }

    pub fn io(code: ErrorCode, path: impl AsRef<Path>, source: io::Error) -> Self {
        Error::Io {
            code,
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    pub fn arg(detail: impl Into<String>) -> Self {
        Self::new(ErrorCode::Earg, detail)
    }

    pub fn state(detail: impl Into<String>) -> Self {
        Self::new(ErrorCode::Estate, detail)
    }

    pub fn malformed(detail: impl Into<String>) -> Self {
        Self::new(ErrorCode::Emalfdb, detail)
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            Error::Engine { code, .. } | Error::Io { code, .. } => *code,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        self.code().category()
    }

    pub fn is_virus(&self) -> bool {
        self.code() == ErrorCode::Virus
    }
}
