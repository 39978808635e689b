//! The engine handle.
//!
//! An engine moves through `Created -> Configured -> Compiled` and is released
//! by the last matching `free`. Field writes, database loads and settings
//! applications are only accepted before `compile`; scans only after.
//!
//! Scans take `&self` and may run concurrently on a compiled engine. Callers
//! must finish all configuration before compiling and must not interleave it
//! with scanning; the internal lock keeps that misuse memory safe, it does not
//! order it.

use crate::core::{self, Error, ErrorCode, Result};
use crate::scanner::database::{LoadContext, SignatureDatabase};
use crate::scanner::fields::{EngineField, FieldValue, ALL_FIELDS};
use crate::scanner::matcher::Matcher;
use crate::scanner::options::{DbOptions, ScanOptions, COUNT_PRECISION};
use crate::scanner::settings::Settings;
use crate::scanner::unpack::{self, ExtractLimits, MemberLimit};
use crate::utils::format_bytes;
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::io::Read;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

const CLEAN_CACHE_SIZE: usize = 65536;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Created,
    Configured,
    Compiled,
    Freed,
}

/// Outcome of one scan call. A detection is a successful scan.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ScanResult {
    /// First detected signature, `None` when clean.
    pub virus: Option<String>,
    /// Every detected signature when scanning with `ALLMATCHES`.
    pub matches: Vec<String>,
    /// Inspected data in units of `COUNT_PRECISION` bytes.
    pub scanned: u64,
}

impl ScanResult {
    pub fn is_infected(&self) -> bool {
        self.virus.is_some()
    }

    pub fn virus_name(&self) -> &str {
        self.virus.as_deref().unwrap_or("")
    }

    pub fn status(&self) -> ErrorCode {
        if self.is_infected() {
            ErrorCode::Virus
        } else {
            ErrorCode::Success
        }
    }
}

type CacheKey = ([u8; 16], ScanOptions);

/// Clean verdicts, mapped to the units the original scan inspected.
type CleanCache = LruCache<CacheKey, u64>;

struct EngineCore {
    state: EngineState,
    values: BTreeMap<EngineField, FieldValue>,
    database: SignatureDatabase,
    matcher: Option<Matcher>,
    clean_cache: Mutex<CleanCache>,
}

impl EngineCore {
    fn new() -> Self {
        let values = ALL_FIELDS
            .iter()
            .filter(|f| !f.is_read_only())
            .map(|f| (*f, f.default_value()))
            .collect();
        let capacity = NonZeroUsize::new(CLEAN_CACHE_SIZE).unwrap_or(NonZeroUsize::MIN);

        Self {
            state: EngineState::Created,
            values,
            database: SignatureDatabase::new(),
            matcher: None,
            clean_cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    fn ensure_mutable(&self, what: &str) -> Result<()> {
        if self.state == EngineState::Compiled {
            return Err(Error::state(format!("cannot {} a compiled engine", what)));
        }
        Ok(())
    }

    fn num(&self, field: EngineField) -> u64 {
        match field {
            EngineField::DbOptions => self.database.options().bits() as u64,
            EngineField::DbVersion => self.database.version() as u64,
            EngineField::DbTime => self.database.time(),
            _ => self
                .values
                .get(&field)
                .and_then(FieldValue::as_num)
                .unwrap_or(0),
        }
    }

    fn string(&self, field: EngineField) -> &str {
        self.values
            .get(&field)
            .and_then(FieldValue::as_str)
            .unwrap_or("")
    }

    fn limits(&self) -> ScanLimits {
        ScanLimits {
            max_scansize: self.num(EngineField::MaxScansize),
            max_filesize: self.num(EngineField::MaxFilesize),
            max_recursion: self.num(EngineField::MaxRecursion),
            max_files: self.num(EngineField::MaxFiles),
        }
    }
}

/// A reference counted engine handle. See the module docs for the lifecycle.
pub struct Engine {
    refs: AtomicUsize,
    core: RwLock<Option<EngineCore>>,
}

impl Engine {
    /// Creates an engine with default field values. Requires `core::init`.
    pub fn new() -> Result<Self> {
        core::ensure_initialized()?;
        log::debug!("engine created");
        Ok(Self {
            refs: AtomicUsize::new(1),
            core: RwLock::new(Some(EngineCore::new())),
        })
    }

    fn with_core<R>(&self, f: impl FnOnce(&EngineCore) -> Result<R>) -> Result<R> {
        let guard = self.core.read();
        match guard.as_ref() {
            Some(core) => f(core),
            None => Err(Error::state("engine has been freed")),
        }
    }

    fn with_core_mut<R>(&self, f: impl FnOnce(&mut EngineCore) -> Result<R>) -> Result<R> {
        let mut guard = self.core.write();
        match guard.as_mut() {
            Some(core) => f(core),
            None => Err(Error::state("engine has been freed")),
        }
    }

    pub fn state(&self) -> EngineState {
        self.core
            .read()
            .as_ref()
            .map_or(EngineState::Freed, |core| core.state)
    }

    pub fn set_num(&self, field: EngineField, value: u64) -> Result<()> {
        self.with_core_mut(|core| {
            core.ensure_mutable("configure")?;
            field.spec().validate_num(field, value)?;
            core.values.insert(field, FieldValue::Num(value));
            core.state = EngineState::Configured;
            Ok(())
        })
    }

    pub fn get_num(&self, field: EngineField) -> Result<u64> {
        if field.is_string() {
            return Err(Error::arg(format!("{} is a string field", field)));
        }
        self.with_core(|core| Ok(core.num(field)))
    }

    pub fn set_string(&self, field: EngineField, value: &str) -> Result<()> {
        self.with_core_mut(|core| {
            core.ensure_mutable("configure")?;
            field.spec().validate_str(field)?;
            core.values.insert(field, FieldValue::Str(value.to_owned()));
            core.state = EngineState::Configured;
            Ok(())
        })
    }

    pub fn get_string(&self, field: EngineField) -> Result<String> {
        if !field.is_string() {
            return Err(Error::arg(format!("{} is a numeric field", field)));
        }
        self.with_core(|core| Ok(core.string(field).to_owned()))
    }

    /// Snapshot of every field, read-only ones included.
    pub fn copy_settings(&self) -> Result<Settings> {
        self.with_core(|core| {
            let values = ALL_FIELDS
                .iter()
                .map(|f| {
                    let value = if f.is_string() {
                        FieldValue::Str(core.string(*f).to_owned())
                    } else {
                        FieldValue::Num(core.num(*f))
                    };
                    (*f, value)
                })
                .collect();
            Ok(Settings::from_values(values))
        })
    }

    /// Writes a snapshot's writable fields. Either every entry is applied or
    /// none is.
    pub fn apply_settings(&self, settings: &Settings) -> Result<()> {
        let entries = settings.writable_entries()?;
        self.with_core_mut(|core| {
            core.ensure_mutable("apply settings to")?;
            for (field, value) in entries {
                core.values.insert(field, value);
            }
            core.state = EngineState::Configured;
            log::debug!("applied {} settings", settings.len());
            Ok(())
        })
    }

    /// Loads signatures from a database file or directory. Returns how many
    /// this call added.
    pub fn load(&self, path: impl AsRef<Path>, options: DbOptions) -> Result<u64> {
        let path = path.as_ref();
        self.with_core_mut(|core| {
            core.ensure_mutable("load signatures into")?;
            let pua_categories = core.string(EngineField::PuaCategories).to_owned();
            let ctx = LoadContext {
                options,
                pua_categories: &pua_categories,
            };
            let loaded = core.database.load(path, ctx)?;
            core.state = EngineState::Configured;
            Ok(loaded)
        })
    }

    pub fn signature_count(&self) -> Result<u64> {
        self.with_core(|core| Ok(core.database.signature_count()))
    }

    /// Builds the matcher and freezes configuration.
    pub fn compile(&self) -> Result<()> {
        self.with_core_mut(|core| {
            if core.state == EngineState::Compiled {
                return Err(Error::state("engine is already compiled"));
            }
            let (min, max) = (core.num(EngineField::AcMindepth), core.num(EngineField::AcMaxdepth));
            if min > max {
                return Err(Error::arg(format!(
                    "ac_mindepth {} exceeds ac_maxdepth {}",
                    min, max
                )));
            }

            let matcher = Matcher::build(&core.database);
            log::debug!(
                "engine compiled with {} signatures",
                core.database.signature_count()
            );
            core.matcher = Some(matcher);
            core.state = EngineState::Compiled;
            Ok(())
        })
    }

    pub fn addref(&self) -> Result<()> {
        self.refs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                if n == 0 {
                    None
                } else {
                    Some(n + 1)
                }
            })
            .map_err(|_| Error::state("engine has been freed"))?;
        Ok(())
    }

    /// Drops one reference; the last one releases the engine's resources.
    pub fn free(&self) -> Result<()> {
        let previous = self
            .refs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .map_err(|_| Error::state("engine has already been freed"))?;

        if previous == 1 {
            self.core.write().take();
            log::debug!("engine released");
        }
        Ok(())
    }

    pub fn ref_count(&self) -> usize {
        self.refs.load(Ordering::Acquire)
    }

    pub fn scan_file(&self, path: impl AsRef<Path>, options: &ScanOptions) -> Result<ScanResult> {
        let path = path.as_ref();
        self.with_core(|core| {
            let matcher = compiled(core)?;
            let metadata = std::fs::metadata(path).map_err(|e| Error::io(ErrorCode::Eopen, path, e))?;
            if metadata.is_dir() {
                return Err(Error::arg(format!("{} is a directory", path.display())));
            }

            let limits = core.limits();
            if limits.max_filesize != 0 && metadata.len() > limits.max_filesize {
                log::debug!(
                    "{} is {}, above the file size limit",
                    path.display(),
                    format_bytes(metadata.len())
                );
                let mut scan = Scan::new(matcher, limits, options);
                scan.exceeded("MaxFileSize");
                return Ok(scan.finish());
            }

            let mut file = std::fs::File::open(path).map_err(|e| Error::io(ErrorCode::Eopen, path, e))?;
            let mut data = Vec::with_capacity(metadata.len() as usize);
            file.read_to_end(&mut data)
                .map_err(|e| Error::io(ErrorCode::Eread, path, e))?;

            let result = scan_data(core, matcher, &data, options);
            if let Some(name) = &result.virus {
                log::info!("{}: {} FOUND", path.display(), name);
            }
            Ok(result)
        })
    }

    pub fn scan_buffer(&self, data: &[u8], options: &ScanOptions) -> Result<ScanResult> {
        self.with_core(|core| {
            let matcher = compiled(core)?;
            Ok(scan_data(core, matcher, data, options))
        })
    }

    /// Scans everything readable from `reader`.
    pub fn scan_reader<R: Read>(&self, mut reader: R, options: &ScanOptions) -> Result<ScanResult> {
        let mut data = Vec::new();
        reader
            .read_to_end(&mut data)
            .map_err(|e| Error::new(ErrorCode::Eread, e.to_string()))?;
        self.scan_buffer(&data, options)
    }

    /// Scans several files in parallel.
    pub fn scan_paths(&self, paths: &[PathBuf], options: &ScanOptions) -> Vec<(PathBuf, Result<ScanResult>)> {
        paths
            .par_iter()
            .map(|path| (path.clone(), self.scan_file(path, options)))
            .collect()
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("state", &self.state())
            .field("refs", &self.ref_count())
            .finish()
    }
}

fn compiled(core: &EngineCore) -> Result<&Matcher> {
    core.matcher
        .as_ref()
        .ok_or_else(|| Error::state("engine must be compiled before scanning"))
}

fn scan_data(core: &EngineCore, matcher: &Matcher, data: &[u8], options: &ScanOptions) -> ScanResult {
    let digest = md5::compute(data).0;
    let key = (digest, *options);
    if let Some(scanned) = core.clean_cache.lock().get(&key).copied() {
        return ScanResult {
            virus: None,
            matches: Vec::new(),
            scanned,
        };
    }

    let mut scan = Scan::new(matcher, core.limits(), options);
    scan.unit(data, Some(digest), 0);
    let cacheable = !scan.limit_hit;
    let result = scan.finish();
    if cacheable && !result.is_infected() {
        core.clean_cache.lock().put(key, result.scanned);
    }
    result
}

fn units(len: usize) -> u64 {
    (len as u64 + COUNT_PRECISION - 1) / COUNT_PRECISION
}

#[derive(Debug, Clone, Copy)]
struct ScanLimits {
    max_scansize: u64,
    max_filesize: u64,
    max_recursion: u64,
    max_files: u64,
}

fn unlimited_if_zero(limit: u64) -> u64 {
    if limit == 0 {
        u64::MAX
    } else {
        limit
    }
}

/// State of one recursive scan.
struct Scan<'a> {
    matcher: &'a Matcher,
    limits: ScanLimits,
    options: &'a ScanOptions,
    found: Vec<String>,
    scanned_bytes: u64,
    scanned: u64,
    files: u64,
    limit_hit: bool,
}

impl<'a> Scan<'a> {
    fn new(matcher: &'a Matcher, limits: ScanLimits, options: &'a ScanOptions) -> Self {
        Self {
            matcher,
            limits,
            options,
            found: Vec::new(),
            scanned_bytes: 0,
            scanned: 0,
            files: 0,
            limit_hit: false,
        }
    }

    fn done(&self) -> bool {
        !self.options.all_matches_enabled() && !self.found.is_empty()
    }

    fn exceeded(&mut self, limit: &str) {
        self.limit_hit = true;
        log::debug!("scan limit {} reached", limit);
        if self.options.report_exceeded_limits() {
            let name = format!("Heuristics.Limits.Exceeded.{}", limit);
            if !self.found.contains(&name) {
                self.found.push(name);
            }
        }
    }

    /// Bytes that may still be scanned.
    fn budget(&self) -> u64 {
        unlimited_if_zero(self.limits.max_scansize).saturating_sub(self.scanned_bytes)
    }

    fn account(&mut self, len: usize) {
        self.scanned_bytes = self.scanned_bytes.saturating_add(len as u64);
        self.scanned += units(len);
    }

    /// Scans the leading part of an object that did not fit the scan budget.
    fn partial(&mut self, head: &[u8]) {
        if head.is_empty() {
            return;
        }
        self.account(head.len());
        self.matcher
            .scan(head, None, self.options.all_matches_enabled(), &mut self.found);
    }

    fn unit(&mut self, data: &[u8], digest: Option<[u8; 16]>, depth: u64) {
        if self.done() {
            return;
        }
        let budget = self.budget();
        if data.len() as u64 > budget {
            // budget < data.len(), so it fits in usize
            self.partial(&data[..budget as usize]);
            self.exceeded("MaxScanSize");
            return;
        }
        self.account(data.len());

        let digest = digest.unwrap_or_else(|| md5::compute(data).0);
        if self.matcher.is_allowed(data, &digest) {
            return;
        }
        self.matcher
            .scan(data, Some(&digest), self.options.all_matches_enabled(), &mut self.found);
        if self.done() || !self.options.archives_enabled() {
            return;
        }

        let kind = match unpack::detect(data) {
            Some(kind) => kind,
            None => return,
        };
        if depth + 1 >= unlimited_if_zero(self.limits.max_recursion) {
            self.exceeded("MaxRecursion");
            return;
        }

        let max_files = unlimited_if_zero(self.limits.max_files);
        let extract_limits = ExtractLimits {
            max_member_size: unlimited_if_zero(self.limits.max_filesize),
            max_members: max_files.saturating_sub(self.files),
            scan_budget: self.budget(),
        };
        let outcome = unpack::extract(kind, data, extract_limits, |member| {
            self.files += 1;
            match member.limit {
                Some(MemberLimit::FileSize) => {
                    log::debug!("{:?} member {} exceeds the file size limit", kind, member.name);
                    self.exceeded("MaxFileSize");
                }
                Some(MemberLimit::ScanSize) => {
                    log::debug!("{:?} member {} scanned up to the scan size limit", kind, member.name);
                    self.partial(&member.data);
                    self.exceeded("MaxScanSize");
                }
                None => self.unit(&member.data, None, depth + 1),
            }
            if self.done() {
                None
            } else {
                Some(self.budget())
            }
        });

        match outcome {
            Ok(extracted) => {
                if extracted.more {
                    self.exceeded("MaxFiles");
                }
                if extracted.budget_spent {
                    self.exceeded("MaxScanSize");
                }
            }
            Err(e) => log::debug!("{:?} container could not be unpacked: {}", kind, e),
        }
    }

    fn finish(self) -> ScanResult {
        ScanResult {
            virus: self.found.first().cloned(),
            matches: self.found,
            scanned: self.scanned,
        }
    }
}
