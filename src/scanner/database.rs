//! Signature database loading.
//!
//! Plain databases are line oriented: hash databases (`.hdb`, `.hsb` and the
//! `.fp`/`.sfp` allow-lists), PE section hashes (`.mdb`, `.msb`) and body
//! signatures (`.ndb`). Lines using features this engine cannot evaluate are
//! skipped; lines that do not parse fail the load. Containers
//! (`.cvd`, `.cld`, `.cud`) carry a 512 byte header followed by a tar archive,
//! gzip compressed for `.cvd`/`.cud`, holding plain databases.

use crate::core::{CountSigsMask, Error, ErrorCode, Result, FUNCTIONALITY_LEVEL};
use crate::scanner::options::DbOptions;
use flate2::read::GzDecoder;
use std::io::{Cursor, Read};
use std::path::Path;
use walkdir::WalkDir;

pub const CVD_HEADER_LEN: usize = 512;
const CVD_MAGIC: &str = "ClamAV-VDB:";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashType {
    Md5,
    Sha256,
}

/// Why a database line was not loaded.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LineError {
    /// Not valid signature syntax. Fails the load.
    #[error("{0}")]
    Malformed(String),
    /// Valid syntax for a feature this engine does not evaluate. Skipped.
    #[error("unsupported: {0}")]
    Unsupported(String),
}

impl From<String> for LineError {
    fn from(reason: String) -> Self {
        LineError::Malformed(reason)
    }
}

pub type LineResult<T> = std::result::Result<T, LineError>;

#[derive(Debug, Clone)]
pub struct HashSignature {
    pub name: String,
    pub hash_type: HashType,
    pub digest: Vec<u8>,
    /// `None` matches any size.
    pub size: Option<u64>,
}

/// Where a body signature may start. `span` widens the position to a range
/// of `span + 1` starts (`n,m` in signature text).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigOffset {
    Any,
    Absolute { at: u64, span: u64 },
    FromEof { back: u64, span: u64 },
}

/// A run of bytes (`None` is a `??` wildcard) preceded by a gap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub min_gap: usize,
    pub max_gap: Option<usize>,
    pub bytes: Vec<Option<u8>>,
}

#[derive(Debug, Clone)]
pub struct BodySignature {
    pub name: String,
    pub target: u32,
    pub offset: SigOffset,
    pub segments: Vec<Segment>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DbKind {
    Hash,
    AllowList,
    SectionHash,
    Body,
    Container { compressed: bool },
}

impl DbKind {
    fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "hdb" | "hsb" => Some(DbKind::Hash),
            "fp" | "sfp" => Some(DbKind::AllowList),
            "mdb" | "msb" => Some(DbKind::SectionHash),
            "ndb" => Some(DbKind::Body),
            "cvd" | "cud" => Some(DbKind::Container { compressed: true }),
            "cld" => Some(DbKind::Container { compressed: false }),
            _ => None,
        }
    }

    fn is_container(self) -> bool {
        matches!(self, DbKind::Container { .. })
    }
}

/// Parsed container header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CvdHeader {
    pub time: String,
    pub version: u32,
    pub sigs: u64,
    pub flevel: u32,
    pub md5: String,
    pub dsig: String,
    pub builder: String,
    pub stime: u64,
}

impl CvdHeader {
    pub fn parse(raw: &[u8]) -> Result<Self> {
        if raw.len() < CVD_HEADER_LEN {
            return Err(Error::new(ErrorCode::Ecvd, "container header is truncated"));
        }
        let text = std::str::from_utf8(&raw[..CVD_HEADER_LEN])
            .map_err(|_| Error::new(ErrorCode::Ecvd, "container header is not text"))?;
        let text = text.trim_end_matches(|c: char| c == ' ' || c == '\0' || c == '\n');
        if !text.starts_with(CVD_MAGIC) {
            return Err(Error::new(ErrorCode::Ecvd, "missing container magic"));
        }

        let fields: Vec<&str> = text.split(':').collect();
        if fields.len() < 9 {
            return Err(Error::new(
                ErrorCode::Ecvd,
                format!("container header has {} fields, need 9", fields.len()),
            ));
        }

        let number = |idx: usize, what: &str| -> Result<u64> {
            fields[idx]
                .trim()
                .parse::<u64>()
                .map_err(|_| Error::new(ErrorCode::Ecvd, format!("bad {} in container header", what)))
        };

        Ok(CvdHeader {
            time: fields[1].to_string(),
            version: number(2, "version")? as u32,
            sigs: number(3, "signature count")?,
            flevel: number(4, "functionality level")? as u32,
            md5: fields[5].to_ascii_lowercase(),
            dsig: fields[6].to_string(),
            builder: fields[7].to_string(),
            stime: number(8, "build time")?,
        })
    }
}

/// Options in force while loading one batch of databases.
#[derive(Debug, Clone, Copy)]
pub struct LoadContext<'a> {
    pub options: DbOptions,
    pub pua_categories: &'a str,
}

impl LoadContext<'_> {
    fn accepts(&self, name: &str) -> bool {
        if !name.starts_with("PUA.") {
            return true;
        }
        if !self.options.contains(DbOptions::PUA) {
            return false;
        }

        let include = self.options.contains(DbOptions::PUA_INCLUDE);
        let exclude = self.options.contains(DbOptions::PUA_EXCLUDE);
        if !include && !exclude {
            return true;
        }

        // PUA.<platform>.<category>.<name>
        let mut parts = name.split('.').skip(1);
        let category = match (parts.next(), parts.next()) {
            (Some(_), Some(cat)) => cat,
            (Some(cat), None) => cat,
            _ => return !include,
        };
        let listed = self
            .pua_categories
            .split('.')
            .filter(|c| !c.is_empty())
            .any(|c| c == category);

        if include {
            listed
        } else {
            !listed
        }
    }
}

/// All signatures loaded into one engine. Merged across `load` calls.
#[derive(Debug, Default)]
pub struct SignatureDatabase {
    pub(crate) hashes: Vec<HashSignature>,
    pub(crate) allow_list: Vec<HashSignature>,
    /// Keyed by PE section size and digest. Loaded and counted; matching
    /// them needs executable parsing.
    pub(crate) section_hashes: Vec<HashSignature>,
    pub(crate) bodies: Vec<BodySignature>,
    options: DbOptions,
    version: u32,
    time: u64,
}

impl SignatureDatabase {
    pub fn new() -> Self {
        Self {
            options: DbOptions::NONE,
            ..Default::default()
        }
    }

    pub fn signature_count(&self) -> u64 {
        (self.hashes.len() + self.allow_list.len() + self.section_hashes.len() + self.bodies.len()) as u64
    }

    pub fn options(&self) -> DbOptions {
        self.options
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn time(&self) -> u64 {
        self.time
    }

    /// Loads a database file or every database in a directory. Returns the
    /// number of signatures this call added.
    ///
    /// Nothing is merged unless the whole path loads cleanly.
    pub fn load(&mut self, path: &Path, ctx: LoadContext<'_>) -> Result<u64> {
        let metadata = std::fs::metadata(path).map_err(|e| Error::io(ErrorCode::Estat, path, e))?;

        let mut staged = SignatureDatabase::new();
        staged.options = ctx.options;
        let loaded = if metadata.is_dir() {
            staged.options |= DbOptions::DIRECTORY;
            staged.load_directory(path, ctx)?
        } else {
            staged.load_file(path, ctx)?
        };

        self.merge(staged);
        log::info!("loaded {} signatures from {:?}", loaded, path);
        Ok(loaded)
    }

    fn merge(&mut self, other: SignatureDatabase) {
        self.hashes.extend(other.hashes);
        self.allow_list.extend(other.allow_list);
        self.section_hashes.extend(other.section_hashes);
        self.bodies.extend(other.bodies);
        self.options |= other.options;
        if other.version > self.version {
            self.version = other.version;
            self.time = other.time;
        }
    }

    fn load_directory(&mut self, dir: &Path, ctx: LoadContext<'_>) -> Result<u64> {
        let mut loaded = 0;
        for entry in WalkDir::new(dir).min_depth(1).max_depth(1).sort_by_file_name() {
            let entry = entry.map_err(|e| {
                let source = std::io::Error::new(std::io::ErrorKind::Other, e.to_string());
                Error::io(ErrorCode::Eopen, dir, source)
            })?;
            let hidden = entry.file_name().to_string_lossy().starts_with('.');
            if hidden || !entry.file_type().is_file() {
                continue;
            }
            loaded += self.load_file(entry.path(), ctx)?;
        }
        Ok(loaded)
    }

    fn load_file(&mut self, path: &Path, ctx: LoadContext<'_>) -> Result<u64> {
        let kind = match DbKind::from_path(path) {
            Some(kind) => kind,
            None => {
                log::debug!("skipping {:?}: not a signature database", path);
                return Ok(0);
            }
        };
        if ctx.options.contains(DbOptions::OFFICIAL_ONLY) && !kind.is_container() {
            log::debug!("skipping unofficial database {:?}", path);
            return Ok(0);
        }

        let data = read_file(path)?;
        let label = path.display().to_string();
        match kind {
            DbKind::Container { compressed } => self.load_container(&label, &data, compressed, ctx),
            plain => self.load_plain(&label, plain, &data, ctx),
        }
    }

    fn load_container(
        &mut self,
        label: &str,
        data: &[u8],
        compressed: bool,
        ctx: LoadContext<'_>,
    ) -> Result<u64> {
        let header = CvdHeader::parse(data)?;
        let body = &data[CVD_HEADER_LEN..];

        if compressed {
            let digest = format!("{:x}", md5::compute(body));
            if digest != header.md5 {
                return Err(Error::new(
                    ErrorCode::Everify,
                    format!("{}: body digest {} does not match header {}", label, digest, header.md5),
                ));
            }
        }
        if header.flevel > FUNCTIONALITY_LEVEL {
            log::warn!(
                "{} needs functionality level {}, this engine provides {}",
                label,
                header.flevel,
                FUNCTIONALITY_LEVEL
            );
        }

        let reader: Box<dyn Read + '_> = if compressed {
            Box::new(GzDecoder::new(body))
        } else {
            Box::new(body)
        };
        let mut archive = tar::Archive::new(reader);
        let entries = archive
            .entries()
            .map_err(|e| Error::new(ErrorCode::Ecvd, format!("{}: {}", label, e)))?;

        let mut loaded = 0;
        for entry in entries {
            let mut entry = entry.map_err(|e| Error::new(ErrorCode::Ecvd, format!("{}: {}", label, e)))?;
            if !entry.header().entry_type().is_file() {
                continue;
            }
            let member = entry
                .path()
                .map_err(|e| Error::new(ErrorCode::Ecvd, format!("{}: {}", label, e)))?
                .into_owned();
            let kind = match DbKind::from_path(&member) {
                Some(kind) if !kind.is_container() => kind,
                _ => continue,
            };

            let mut content = Vec::new();
            entry
                .read_to_end(&mut content)
                .map_err(|e| Error::new(ErrorCode::Ecvd, format!("{}: {}", label, e)))?;
            let member_label = format!("{}/{}", label, member.display());
            loaded += self.load_plain(&member_label, kind, &content, ctx)?;
        }

        if header.version >= self.version {
            self.version = header.version;
            self.time = header.stime;
        }
        self.options |= DbOptions::OFFICIAL;
        Ok(loaded)
    }

    fn load_plain(&mut self, label: &str, kind: DbKind, data: &[u8], ctx: LoadContext<'_>) -> Result<u64> {
        let text = std::str::from_utf8(data)
            .map_err(|_| Error::malformed(format!("{}: database is not valid UTF-8", label)))?;

        let mut loaded = 0;
        let mut skipped = 0;
        for (lineno, line) in signature_lines(text) {
            match self.add_line(kind, line, ctx) {
                Ok(true) => loaded += 1,
                Ok(false) => {}
                Err(LineError::Unsupported(reason)) => {
                    log::debug!("{}:{}: skipped, {}", label, lineno, reason);
                    skipped += 1;
                }
                Err(LineError::Malformed(reason)) => {
                    return Err(Error::malformed(format!("{}:{}: {}", label, lineno, reason)));
                }
            }
        }
        if skipped > 0 {
            log::info!("{}: skipped {} signatures using unsupported features", label, skipped);
        }
        Ok(loaded)
    }

    /// Parses one line into the database. `Ok(false)` means the line was
    /// valid but filtered out.
    fn add_line(&mut self, kind: DbKind, line: &str, ctx: LoadContext<'_>) -> LineResult<bool> {
        match kind {
            DbKind::Hash => match parse_hash_line(line)? {
                Some(sig) if ctx.accepts(&sig.name) => {
                    self.hashes.push(sig);
                    Ok(true)
                }
                _ => Ok(false),
            },
            DbKind::AllowList => match parse_hash_line(line)? {
                Some(sig) => {
                    self.allow_list.push(sig);
                    Ok(true)
                }
                None => Ok(false),
            },
            DbKind::SectionHash => match parse_section_line(line)? {
                Some(sig) if ctx.accepts(&sig.name) => {
                    self.section_hashes.push(sig);
                    Ok(true)
                }
                _ => Ok(false),
            },
            DbKind::Body => match parse_body_line(line)? {
                Some(sig) if ctx.accepts(&sig.name) => {
                    self.bodies.push(sig);
                    Ok(true)
                }
                _ => Ok(false),
            },
            DbKind::Container { .. } => Ok(false),
        }
    }
}

fn read_file(path: &Path) -> Result<Vec<u8>> {
    let mut file = std::fs::File::open(path).map_err(|e| Error::io(ErrorCode::Eopen, path, e))?;
    let mut data = Vec::new();
    file.read_to_end(&mut data)
        .map_err(|e| Error::io(ErrorCode::Eread, path, e))?;
    Ok(data)
}

/// Non-empty, non-comment lines with their 1-based line numbers.
fn signature_lines(text: &str) -> impl Iterator<Item = (usize, &str)> {
    text.lines()
        .enumerate()
        .map(|(i, line)| (i + 1, line.trim_end_matches('\r')))
        .filter(|(_, line)| !line.trim().is_empty() && !line.starts_with('#'))
}

/// Optional trailing minimum functionality level. `Ok(false)` means the
/// signature is for a newer engine and should be skipped.
fn flevel_ok(field: Option<&str>) -> std::result::Result<bool, String> {
    match field {
        None | Some("") => Ok(true),
        Some(raw) => raw
            .parse::<u32>()
            .map(|min| min <= FUNCTIONALITY_LEVEL)
            .map_err(|_| format!("bad functionality level {:?}", raw)),
    }
}

fn split_fields(line: &str, min: usize, max: usize) -> LineResult<Vec<&str>> {
    let fields: Vec<&str> = line.split(':').collect();
    if fields.len() < min || fields.len() > max {
        return Err(format!("expected {} to {} fields, found {}", min, max, fields.len()).into());
    }
    Ok(fields)
}

fn hash_signature(digest: &str, size: &str, name: &str, min_flevel: Option<&str>) -> LineResult<Option<HashSignature>> {
    if !flevel_ok(min_flevel)? {
        return Ok(None);
    }

    let digest = hex::decode(digest).map_err(|e| format!("bad digest: {}", e))?;
    let hash_type = match digest.len() {
        16 => HashType::Md5,
        32 => HashType::Sha256,
        20 => return Err(LineError::Unsupported("sha1 digests".to_string())),
        len => return Err(format!("digest is {} bytes, expected 16 or 32", len).into()),
    };
    let size = match size {
        "*" => None,
        raw => Some(raw.parse::<u64>().map_err(|_| format!("bad size {:?}", raw))?),
    };
    if name.is_empty() {
        return Err("empty signature name".to_string().into());
    }

    Ok(Some(HashSignature {
        name: name.to_string(),
        hash_type,
        digest,
        size,
    }))
}

/// `hash:size:Name[:MinFL]`, md5 or sha256 told apart by digest length.
pub fn parse_hash_line(line: &str) -> LineResult<Option<HashSignature>> {
    let fields = split_fields(line, 3, 4)?;
    hash_signature(fields[0], fields[1], fields[2], fields.get(3).copied())
}

/// `PESectionSize:hash:Name[:MinFL]`
pub fn parse_section_line(line: &str) -> LineResult<Option<HashSignature>> {
    let fields = split_fields(line, 3, 4)?;
    hash_signature(fields[1], fields[0], fields[2], fields.get(3).copied())
}

/// `Name:Target:Offset:HexSig[:MinFL[:MaxFL]]`
pub fn parse_body_line(line: &str) -> LineResult<Option<BodySignature>> {
    let fields = split_fields(line, 4, 6)?;
    if !flevel_ok(fields.get(4).copied())? {
        return Ok(None);
    }
    if let Some(max) = fields.get(5).filter(|m| !m.is_empty()) {
        let max = max.parse::<u32>().map_err(|_| format!("bad functionality level {:?}", max))?;
        if max < FUNCTIONALITY_LEVEL {
            return Ok(None);
        }
    }

    if fields[0].is_empty() {
        return Err("empty signature name".to_string().into());
    }
    let target = fields[1]
        .parse::<u32>()
        .map_err(|_| format!("bad target type {:?}", fields[1]))?;

    Ok(Some(BodySignature {
        name: fields[0].to_string(),
        target,
        offset: parse_offset(fields[2])?,
        segments: parse_body_pattern(fields[3])?,
    }))
}

fn is_digits(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

/// Offsets relative to executable structure: `EP+n`, `Sx+n`, `SL+n`, `SEx`,
/// `VI` and `$macro` forms.
fn is_structural_offset(base: &str) -> bool {
    if base == "VI" || base.starts_with('$') {
        return true;
    }
    if let Some(section) = base.strip_prefix("SE") {
        return is_digits(section);
    }
    let split = match base.find(|c| c == '+' || c == '-') {
        Some(split) => split,
        None => return false,
    };
    let (anchor, n) = (&base[..split], &base[split + 1..]);
    let anchor_ok = anchor == "EP" || anchor == "SL" || anchor.strip_prefix('S').map_or(false, is_digits);
    anchor_ok && is_digits(n)
}

fn parse_offset(raw: &str) -> LineResult<SigOffset> {
    if raw == "*" {
        return Ok(SigOffset::Any);
    }
    let bad = || LineError::Malformed(format!("bad offset {:?}", raw));
    let (base, span) = match raw.split_once(',') {
        Some((base, span)) => (base, span.parse::<u64>().map_err(|_| bad())?),
        None => (raw, 0),
    };

    if let Some(back) = base.strip_prefix("EOF-") {
        let back = back.parse::<u64>().map_err(|_| bad())?;
        return Ok(SigOffset::FromEof { back, span });
    }
    if let Ok(at) = base.parse::<u64>() {
        return Ok(SigOffset::Absolute { at, span });
    }
    if is_structural_offset(base) {
        return Err(LineError::Unsupported(format!("offset {:?} needs executable parsing", raw)));
    }
    Err(bad())
}

fn parse_gap(raw: &str) -> std::result::Result<(usize, Option<usize>), String> {
    let num = |s: &str| s.parse::<usize>().map_err(|_| format!("bad gap {{{}}}", raw));
    match raw.split_once('-') {
        None => {
            let n = num(raw)?;
            Ok((n, Some(n)))
        }
        Some(("", hi)) => Ok((0, Some(num(hi)?))),
        Some((lo, "")) => Ok((num(lo)?, None)),
        Some((lo, hi)) => {
            let (lo, hi) = (num(lo)?, num(hi)?);
            if lo > hi {
                return Err(format!("empty gap {{{}}}", raw));
            }
            Ok((lo, Some(hi)))
        }
    }
}

/// Hex bytes, `??` wildcards, `*` and `{n}`, `{n-}`, `{-m}`, `{n-m}` gaps.
/// Alternatives, `[n-m]` ranges, negation and nibble wildcards are reported
/// as unsupported.
pub fn parse_body_pattern(sig: &str) -> LineResult<Vec<Segment>> {
    if sig.is_empty() || !sig.is_ascii() {
        return Err("body pattern must be non-empty hex".to_string().into());
    }

    let raw = sig.as_bytes();
    let mut segments = Vec::new();
    let mut current: Vec<Option<u8>> = Vec::new();
    let (mut min_gap, mut max_gap) = (0usize, Some(0usize));
    let mut i = 0;

    while i < raw.len() {
        match raw[i] {
            b'*' | b'{' => {
                if current.is_empty() {
                    return Err(format!("gap at position {} has no bytes before it", i).into());
                }
                segments.push(Segment {
                    min_gap,
                    max_gap,
                    bytes: std::mem::take(&mut current),
                });
                if raw[i] == b'*' {
                    min_gap = 0;
                    max_gap = None;
                    i += 1;
                } else {
                    let end = sig[i..]
                        .find('}')
                        .map(|e| e + i)
                        .ok_or_else(|| format!("unterminated gap at position {}", i))?;
                    let (lo, hi) = parse_gap(&sig[i + 1..end])?;
                    min_gap = lo;
                    max_gap = hi;
                    i = end + 1;
                }
            }
            b'(' | b')' | b'|' | b'[' | b']' | b'!' => {
                return Err(LineError::Unsupported(format!(
                    "pattern construct {:?} at position {}",
                    raw[i] as char, i
                )));
            }
            _ => {
                if i + 2 > raw.len() {
                    return Err("odd number of hex digits".to_string().into());
                }
                let pair = &sig[i..i + 2];
                let nibble = |c: u8| c.is_ascii_hexdigit();
                if pair == "??" {
                    current.push(None);
                } else if (raw[i] == b'?' && nibble(raw[i + 1])) || (nibble(raw[i]) && raw[i + 1] == b'?') {
                    return Err(LineError::Unsupported(format!("nibble wildcard {:?} at position {}", pair, i)));
                } else {
                    let byte = hex::decode(pair).map_err(|_| format!("bad hex {:?} at position {}", pair, i))?;
                    current.push(Some(byte[0]));
                }
                i += 2;
            }
        }
    }

    if current.is_empty() {
        return Err("pattern ends with a gap".to_string().into());
    }
    segments.push(Segment {
        min_gap,
        max_gap,
        bytes: current,
    });

    let has_literal = segments
        .iter()
        .any(|s| s.bytes.iter().any(Option::is_some));
    if !has_literal {
        return Err("pattern has no literal bytes".to_string().into());
    }
    Ok(segments)
}

/// Signature count of one database file, as selected by `mask`.
pub fn count_file_sigs(path: &Path, mask: CountSigsMask) -> Result<u64> {
    let kind = match DbKind::from_path(path) {
        Some(kind) => kind,
        None => return Ok(0),
    };

    if kind.is_container() {
        if !mask.official() {
            return Ok(0);
        }
        let mut header = vec![0u8; CVD_HEADER_LEN];
        let mut file = std::fs::File::open(path).map_err(|e| Error::io(ErrorCode::Eopen, path, e))?;
        file.read_exact(&mut header)
            .map_err(|e| Error::io(ErrorCode::Eread, path, e))?;
        return Ok(CvdHeader::parse(&header)?.sigs);
    }

    if !mask.unofficial() {
        return Ok(0);
    }
    let data = read_file(path)?;
    let text = String::from_utf8_lossy(&data);
    Ok(signature_lines(&text).count() as u64)
}

/// Builds a container image from plain database files. Used by tests and by
/// tooling that repackages local databases.
pub fn build_container(version: u32, stime: u64, files: &[(&str, &str)], compressed: bool) -> Result<Vec<u8>> {
    let mut tarball = tar::Builder::new(Vec::new());
    for (name, content) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        tarball
            .append_data(&mut header, name, Cursor::new(content.as_bytes()))
            .map_err(|e| Error::new(ErrorCode::Ewrite, e.to_string()))?;
    }
    let tarball = tarball
        .into_inner()
        .map_err(|e| Error::new(ErrorCode::Ewrite, e.to_string()))?;

    let body = if compressed {
        use std::io::Write;
        let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder
            .write_all(&tarball)
            .map_err(|e| Error::new(ErrorCode::Ewrite, e.to_string()))?;
        encoder
            .finish()
            .map_err(|e| Error::new(ErrorCode::Ewrite, e.to_string()))?
    } else {
        tarball
    };

    let sigs: u64 = files
        .iter()
        .map(|(_, content)| signature_lines(content).count() as u64)
        .sum();
    let built = chrono::DateTime::from_timestamp(stime as i64, 0)
        .map(|t| t.format("%d %b %Y %H-%M %z").to_string())
        .unwrap_or_default();
    let header = format!(
        "{}{}:{}:{}:{}:{:x}:-:local:{}",
        CVD_MAGIC,
        built,
        version,
        sigs,
        FUNCTIONALITY_LEVEL,
        md5::compute(&body),
        stime
    );
    if header.len() > CVD_HEADER_LEN {
        return Err(Error::arg("container header does not fit in 512 bytes"));
    }

    let mut image = header.into_bytes();
    image.resize(CVD_HEADER_LEN, b' ');
    image.extend_from_slice(&body);
    Ok(image)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn is_unsupported<T>(result: LineResult<T>) -> bool {
        matches!(result, Err(LineError::Unsupported(_)))
    }

    fn is_malformed<T>(result: LineResult<T>) -> bool {
        matches!(result, Err(LineError::Malformed(_)))
    }

    #[test]
    fn test_parse_hash_line() {
        let sig = parse_hash_line("44d88612fea8a8f36de82e1278abb02f:68:Eicar-Test-Signature")
            .unwrap()
            .unwrap();
        assert_eq!(sig.name, "Eicar-Test-Signature");
        assert_eq!(sig.hash_type, HashType::Md5);
        assert_eq!(sig.size, Some(68));
        assert_eq!(sig.digest.len(), 16);

        let sig = parse_hash_line("44d88612fea8a8f36de82e1278abb02f:*:Any.Size")
            .unwrap()
            .unwrap();
        assert_eq!(sig.size, None);

        let sha256 = "275a021bbfb6489e54d471899f7db9d1663fc695ec2fe2a2c4538aabf651fd0f";
        let sig = parse_hash_line(&format!("{}:68:Long", sha256)).unwrap().unwrap();
        assert_eq!(sig.hash_type, HashType::Sha256);

        assert!(is_malformed(parse_hash_line("44d88612:68:Short")));
        assert!(is_malformed(parse_hash_line("44d88612fea8a8f36de82e1278abb02f:68")));
        assert!(is_malformed(parse_hash_line("44d88612fea8a8f36de82e1278abb02f:big:X")));
        assert!(is_unsupported(parse_hash_line(
            "3395856ce81f2b7382dee72602f798b642f14140:68:Sha1"
        )));
    }

    #[test]
    fn test_parse_section_line() {
        let sig = parse_section_line("45056:3ea7d00dedd30bcdf46191358c36ffa4:Test.Section")
            .unwrap()
            .unwrap();
        assert_eq!(sig.name, "Test.Section");
        assert_eq!(sig.size, Some(45056));
        assert_eq!(sig.hash_type, HashType::Md5);
        assert_eq!(hex::encode(&sig.digest), "3ea7d00dedd30bcdf46191358c36ffa4");

        let sig = parse_section_line("*:3ea7d00dedd30bcdf46191358c36ffa4:Any.Size").unwrap().unwrap();
        assert_eq!(sig.size, None);

        // The hash database field order is not a section line.
        assert!(is_malformed(parse_section_line(
            "3ea7d00dedd30bcdf46191358c36ffa4:45056:Swapped"
        )));
    }

    #[test]
    fn test_newer_flevel_is_skipped() {
        let line = format!("44d88612fea8a8f36de82e1278abb02f:68:Future:{}", FUNCTIONALITY_LEVEL + 1);
        assert!(parse_hash_line(&line).unwrap().is_none());
    }

    #[test]
    fn test_parse_body_pattern() {
        let segments = parse_body_pattern("deadbeef").unwrap();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].bytes, vec![Some(0xde), Some(0xad), Some(0xbe), Some(0xef)]);

        let segments = parse_body_pattern("41??42*43{2-4}44{-3}45{5-}46").unwrap();
        assert_eq!(segments.len(), 5);
        assert_eq!(segments[0].bytes, vec![Some(0x41), None, Some(0x42)]);
        assert_eq!((segments[1].min_gap, segments[1].max_gap), (0, None));
        assert_eq!((segments[2].min_gap, segments[2].max_gap), (2, Some(4)));
        assert_eq!((segments[3].min_gap, segments[3].max_gap), (0, Some(3)));
        assert_eq!((segments[4].min_gap, segments[4].max_gap), (5, None));

        for bad in ["", "4", "zz", "*41", "41*", "????", "41{4-2}42", "41{242", "4g"] {
            assert!(is_malformed(parse_body_pattern(bad)), "{:?}", bad);
        }
    }

    #[test]
    fn test_unsupported_pattern_constructs() {
        for sig in ["41(42|43)44", "4142[2-4]4344", "41!(42)43", "414a?43", "41?a4243"] {
            assert!(is_unsupported(parse_body_pattern(sig)), "{:?}", sig);
        }
    }

    #[test]
    fn test_parse_body_line_offsets() {
        let offset = |raw: &str| parse_body_line(&format!("Test.Sig:0:{}:414243", raw)).map(|s| s.unwrap().offset);

        assert_eq!(offset("*"), Ok(SigOffset::Any));
        assert_eq!(offset("10"), Ok(SigOffset::Absolute { at: 10, span: 0 }));
        assert_eq!(offset("10,20"), Ok(SigOffset::Absolute { at: 10, span: 20 }));
        assert_eq!(offset("EOF-3"), Ok(SigOffset::FromEof { back: 3, span: 0 }));
        assert_eq!(offset("EOF-30,8"), Ok(SigOffset::FromEof { back: 30, span: 8 }));

        for raw in ["EP+10", "EP-4", "S2+16", "SL+0", "SE1", "VI", "EP+0,20"] {
            assert!(is_unsupported(offset(raw)), "{:?}", raw);
        }
        for raw in ["EOF+3", "10,", "EP+", "S+1", "nowhere", "-1"] {
            assert!(is_malformed(offset(raw)), "{:?}", raw);
        }
        assert!(is_malformed(parse_body_line("Test.Sig:x:*:414243")));
    }

    #[test]
    fn test_cvd_header_round_trip() {
        let image = build_container(42, 1_700_000_000, &[("a.hdb", "44d88612fea8a8f36de82e1278abb02f:68:A\n")], true)
            .unwrap();
        let header = CvdHeader::parse(&image).unwrap();
        assert_eq!(header.version, 42);
        assert_eq!(header.sigs, 1);
        assert_eq!(header.stime, 1_700_000_000);
        assert_eq!(header.flevel, FUNCTIONALITY_LEVEL);

        assert_eq!(
            CvdHeader::parse(&[b' '; CVD_HEADER_LEN]).unwrap_err().code(),
            ErrorCode::Ecvd
        );
        assert_eq!(CvdHeader::parse(b"ClamAV-VDB:").unwrap_err().code(), ErrorCode::Ecvd);
    }

    #[test]
    fn test_pua_filtering() {
        let ctx = LoadContext {
            options: DbOptions::NONE,
            pua_categories: "",
        };
        assert!(ctx.accepts("Win.Trojan.Agent"));
        assert!(!ctx.accepts("PUA.Win.Packer.Upx"));

        let ctx = LoadContext {
            options: DbOptions::PUA | DbOptions::PUA_INCLUDE,
            pua_categories: ".Packer.Tool",
        };
        assert!(ctx.accepts("PUA.Win.Packer.Upx"));
        assert!(!ctx.accepts("PUA.Win.Adware.Foo"));

        let ctx = LoadContext {
            options: DbOptions::PUA | DbOptions::PUA_EXCLUDE,
            pua_categories: ".Packer",
        };
        assert!(!ctx.accepts("PUA.Win.Packer.Upx"));
        assert!(ctx.accepts("PUA.Win.Adware.Foo"));
    }
}
