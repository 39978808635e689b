//! Compiled form of a signature database.
//!
//! Hash signatures are indexed by digest. Body signatures are bucketed by
//! their first literal byte so a buffer is walked once and only signatures
//! whose anchor byte occurs are tried.

use crate::scanner::database::{BodySignature, HashSignature, HashType, Segment, SigOffset, SignatureDatabase};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy)]
struct Anchor {
    sig: usize,
    /// Position of the anchor byte inside the first segment.
    delta: usize,
}

#[derive(Debug, Default)]
struct HashIndex {
    entries: HashMap<Vec<u8>, Vec<(Option<u64>, String)>>,
}

impl HashIndex {
    fn insert(&mut self, sig: &HashSignature) {
        self.entries
            .entry(sig.digest.clone())
            .or_default()
            .push((sig.size, sig.name.clone()));
    }

    fn lookup<'a>(&'a self, digest: &[u8], len: u64) -> impl Iterator<Item = &'a str> + 'a {
        self.entries
            .get(digest)
            .into_iter()
            .flatten()
            .filter(move |(size, _)| size.map_or(true, |s| s == len))
            .map(|(_, name)| name.as_str())
    }

    fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub struct Matcher {
    md5: HashIndex,
    sha256: HashIndex,
    allow_md5: HashIndex,
    allow_sha256: HashIndex,
    bodies: Vec<BodySignature>,
    buckets: Vec<Vec<Anchor>>,
}

impl Matcher {
    pub fn build(db: &SignatureDatabase) -> Self {
        let mut md5 = HashIndex::default();
        let mut sha256 = HashIndex::default();
        for sig in &db.hashes {
            match sig.hash_type {
                HashType::Md5 => md5.insert(sig),
                HashType::Sha256 => sha256.insert(sig),
            }
        }

        let mut allow_md5 = HashIndex::default();
        let mut allow_sha256 = HashIndex::default();
        for sig in &db.allow_list {
            match sig.hash_type {
                HashType::Md5 => allow_md5.insert(sig),
                HashType::Sha256 => allow_sha256.insert(sig),
            }
        }

        let mut buckets = vec![Vec::new(); 256];
        let mut unanchored = 0;
        for (idx, sig) in db.bodies.iter().enumerate() {
            let first = &sig.segments[0].bytes;
            match first.iter().position(Option::is_some) {
                Some(delta) => {
                    if let Some(byte) = first[delta] {
                        buckets[byte as usize].push(Anchor { sig: idx, delta });
                    }
                }
                None => {
                    // Leading segment is all wildcards; anchor on every byte.
                    for bucket in buckets.iter_mut() {
                        bucket.push(Anchor { sig: idx, delta: 0 });
                    }
                    unanchored += 1;
                }
            }
        }
        if unanchored > 0 {
            log::debug!("{} body signatures have no literal first segment", unanchored);
        }

        Self {
            md5,
            sha256,
            allow_md5,
            allow_sha256,
            bodies: db.bodies.clone(),
            buckets,
        }
    }

    /// Whether the buffer is on an allow-list.
    pub fn is_allowed(&self, data: &[u8], md5_digest: &[u8; 16]) -> bool {
        let len = data.len() as u64;
        if self.allow_md5.lookup(md5_digest, len).next().is_some() {
            return true;
        }
        if !self.allow_sha256.is_empty() {
            let digest = Sha256::digest(data);
            return self.allow_sha256.lookup(digest.as_slice(), len).next().is_some();
        }
        false
    }

    /// Appends the names of signatures matching `data` to `found`. Stops at
    /// the first new match unless `all` is set.
    ///
    /// `md5_digest` is `None` when `data` is only a prefix of the object; hash
    /// signatures describe whole objects and are skipped then.
    pub fn scan(&self, data: &[u8], md5_digest: Option<&[u8; 16]>, all: bool, found: &mut Vec<String>) {
        let len = data.len() as u64;
        let before = found.len();
        let done = |found: &Vec<String>| !all && found.len() > before;

        if let Some(md5_digest) = md5_digest {
            for name in self.md5.lookup(md5_digest, len) {
                push_unique(found, name);
                if done(found) {
                    return;
                }
            }
            if !self.sha256.is_empty() {
                let digest = Sha256::digest(data);
                for name in self.sha256.lookup(digest.as_slice(), len) {
                    push_unique(found, name);
                    if done(found) {
                        return;
                    }
                }
            }
        }

        let mut matched = vec![false; self.bodies.len()];
        let mut memos: Vec<Option<GapMemo>> = (0..self.bodies.len()).map(|_| None).collect();
        for (pos, byte) in data.iter().enumerate() {
            for anchor in &self.buckets[*byte as usize] {
                if matched[anchor.sig] || pos < anchor.delta {
                    continue;
                }
                let sig = &self.bodies[anchor.sig];
                let start = pos - anchor.delta;
                if !offset_ok(sig.offset, start, data.len()) {
                    continue;
                }
                let memo = memos[anchor.sig].get_or_insert_with(|| GapMemo::new(sig.segments.len(), data.len()));
                if match_at(&sig.segments, data, start, memo) {
                    matched[anchor.sig] = true;
                    push_unique(found, &sig.name);
                    if done(found) {
                        return;
                    }
                }
            }
        }
    }
}

fn push_unique(found: &mut Vec<String>, name: &str) {
    if !found.iter().any(|n| n == name) {
        found.push(name.to_string());
    }
}

fn offset_ok(offset: SigOffset, start: usize, len: usize) -> bool {
    match offset {
        SigOffset::Any => true,
        SigOffset::Absolute { at, span } => within(start as u64, at, span),
        SigOffset::FromEof { back, span } => (len as u64)
            .checked_sub(back)
            .map_or(false, |at| within(start as u64, at, span)),
    }
}

fn within(start: u64, at: u64, span: u64) -> bool {
    start >= at && start - at <= span
}

fn segment_eq(bytes: &[Option<u8>], data: &[u8], at: usize) -> bool {
    if at + bytes.len() > data.len() {
        return false;
    }
    bytes
        .iter()
        .zip(&data[at..])
        .all(|(want, got)| want.map_or(true, |w| w == *got))
}

/// Continuations of one body signature already known to fail in the current
/// buffer. Whether segments `idx..` match from `pos` depends only on `idx` and
/// `pos`, so each pair is explored at most once per buffer.
struct GapMemo {
    /// Per segment after an unbounded gap: smallest `pos` known to fail. Any
    /// later `pos` fails too, since its candidates are a subset.
    failed_from: Vec<usize>,
    /// Per segment after a bounded gap: bitset of failed positions, allocated
    /// on first use.
    failed: Vec<Vec<u64>>,
    len: usize,
}

impl GapMemo {
    fn new(segments: usize, len: usize) -> Self {
        Self {
            failed_from: vec![usize::MAX; segments],
            failed: vec![Vec::new(); segments],
            len,
        }
    }

    fn has_failed(&self, idx: usize, pos: usize) -> bool {
        self.failed[idx]
            .get(pos / 64)
            .map_or(false, |word| word >> (pos % 64) & 1 == 1)
    }

    fn mark_failed(&mut self, idx: usize, pos: usize) {
        let words = &mut self.failed[idx];
        if words.is_empty() {
            *words = vec![0; self.len / 64 + 1];
        }
        if let Some(word) = words.get_mut(pos / 64) {
            *word |= 1 << (pos % 64);
        }
    }
}

fn match_at(segments: &[Segment], data: &[u8], start: usize, memo: &mut GapMemo) -> bool {
    segment_eq(&segments[0].bytes, data, start)
        && match_rest(segments, 1, data, start + segments[0].bytes.len(), memo)
}

fn match_rest(segments: &[Segment], idx: usize, data: &[u8], pos: usize, memo: &mut GapMemo) -> bool {
    let seg = match segments.get(idx) {
        Some(seg) => seg,
        None => return true,
    };
    let lo = pos.saturating_add(seg.min_gap);

    match seg.max_gap {
        None => {
            let known = memo.failed_from[idx];
            if pos >= known {
                return false;
            }
            // Starts from `known + min_gap` on were tried by the earlier failure.
            let end = known.saturating_add(seg.min_gap);
            let mut at = lo;
            while at < end && at + seg.bytes.len() <= data.len() {
                if segment_eq(&seg.bytes, data, at)
                    && match_rest(segments, idx + 1, data, at + seg.bytes.len(), memo)
                {
                    return true;
                }
                at += 1;
            }
            memo.failed_from[idx] = pos;
            false
        }
        Some(max) => {
            if memo.has_failed(idx, pos) {
                return false;
            }
            let hi = pos.saturating_add(max).min(data.len());
            let mut at = lo;
            while at <= hi && at + seg.bytes.len() <= data.len() {
                if segment_eq(&seg.bytes, data, at)
                    && match_rest(segments, idx + 1, data, at + seg.bytes.len(), memo)
                {
                    return true;
                }
                at += 1;
            }
            memo.mark_failed(idx, pos);
            false
        }
    }
}
