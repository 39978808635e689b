//! Container detection and extraction for recursive scanning.

use std::io::{self, Cursor, Read};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Container {
    Zip,
    Tar,
    Gzip,
    Xz,
    Zstd,
}

/// Why a member was not handed over whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberLimit {
    /// Larger than `max_member_size`; `data` is empty or a prefix and should
    /// not be scanned.
    FileSize,
    /// Cut at the remaining scan budget; `data` is the prefix that fits.
    ScanSize,
}

pub struct Member {
    pub name: String,
    pub data: Vec<u8>,
    pub limit: Option<MemberLimit>,
}

/// Caps applied while extracting one container.
#[derive(Debug, Clone, Copy)]
pub struct ExtractLimits {
    pub max_member_size: u64,
    pub max_members: u64,
    /// Bytes the caller may still scan. No member is read past it.
    pub scan_budget: u64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Extracted {
    /// Members handed to the visitor.
    pub members: u64,
    /// More members existed than `max_members` allowed.
    pub more: bool,
    /// Members remained when the scan budget ran out.
    pub budget_spent: bool,
}

pub fn detect(data: &[u8]) -> Option<Container> {
    if data.starts_with(b"PK\x03\x04") {
        Some(Container::Zip)
    } else if data.starts_with(&[0x1f, 0x8b]) {
        Some(Container::Gzip)
    } else if data.starts_with(&[0xfd, b'7', b'z', b'X', b'Z', 0x00]) {
        Some(Container::Xz)
    } else if data.starts_with(&[0x28, 0xb5, 0x2f, 0xfd]) {
        Some(Container::Zstd)
    } else if data.len() >= 262 && &data[257..262] == b"ustar" {
        Some(Container::Tar)
    } else {
        None
    }
}

/// Extracts members one at a time and hands each to `visit`, so at most one
/// member is held in memory. `visit` returns the scan budget left after
/// handling the member, or `None` to stop extracting.
pub fn extract<F>(kind: Container, data: &[u8], limits: ExtractLimits, visit: F) -> io::Result<Extracted>
where
    F: FnMut(Member) -> Option<u64>,
{
    let mut feed = Feed {
        limits,
        budget: limits.scan_budget,
        out: Extracted::default(),
        visit,
    };
    match kind {
        Container::Zip => extract_zip(data, &mut feed)?,
        Container::Tar => extract_tar(data, &mut feed)?,
        Container::Gzip => single(flate2::read::GzDecoder::new(data), "gzip", &mut feed)?,
        Container::Xz => single(xz2::read::XzDecoder::new(data), "xz", &mut feed)?,
        Container::Zstd => single(zstd::stream::read::Decoder::new(data)?, "zstd", &mut feed)?,
    }
    Ok(feed.out)
}

struct Feed<F> {
    limits: ExtractLimits,
    budget: u64,
    out: Extracted,
    visit: F,
}

impl<F: FnMut(Member) -> Option<u64>> Feed<F> {
    /// Whether another member may be read.
    fn admits(&mut self) -> bool {
        if self.out.members >= self.limits.max_members {
            self.out.more = true;
            return false;
        }
        if self.budget == 0 {
            self.out.budget_spent = true;
            return false;
        }
        true
    }

    /// Reads one member and hands it over. `size` is the declared size when
    /// the format records one. Returns whether to continue.
    fn member<R: Read>(&mut self, name: String, size: Option<u64>, reader: R) -> io::Result<bool> {
        self.out.members += 1;
        let max = self.limits.max_member_size;
        let member = if size.map_or(false, |size| size > max) {
            Member {
                name,
                data: Vec::new(),
                limit: Some(MemberLimit::FileSize),
            }
        } else {
            let cap = max.min(self.budget);
            let (data, truncated) = read_capped(reader, cap)?;
            let limit = match (truncated, cap < max) {
                (false, _) => None,
                (true, true) => Some(MemberLimit::ScanSize),
                (true, false) => Some(MemberLimit::FileSize),
            };
            Member { name, data, limit }
        };

        match (self.visit)(member) {
            Some(budget) => {
                self.budget = budget;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// Reads at most `cap` bytes, flagging whether more were available.
fn read_capped<R: Read>(reader: R, cap: u64) -> io::Result<(Vec<u8>, bool)> {
    let mut data = Vec::new();
    reader.take(cap.saturating_add(1)).read_to_end(&mut data)?;
    let truncated = data.len() as u64 > cap;
    if truncated {
        data.truncate(cap as usize);
    }
    Ok((data, truncated))
}

fn single<R: Read, F>(reader: R, name: &str, feed: &mut Feed<F>) -> io::Result<()>
where
    F: FnMut(Member) -> Option<u64>,
{
    if feed.admits() {
        feed.member(name.to_string(), None, reader)?;
    }
    Ok(())
}

fn extract_zip<F>(data: &[u8], feed: &mut Feed<F>) -> io::Result<()>
where
    F: FnMut(Member) -> Option<u64>,
{
    let mut archive = zip::ZipArchive::new(Cursor::new(data)).map_err(to_io)?;

    for idx in 0..archive.len() {
        let file = match archive.by_index(idx) {
            Ok(file) => file,
            Err(e) => {
                log::debug!("skipping zip member {}: {}", idx, e);
                continue;
            }
        };
        if file.is_dir() {
            continue;
        }
        if !feed.admits() {
            break;
        }
        let name = file.name().to_string();
        let size = file.size();
        if !feed.member(name, Some(size), file)? {
            break;
        }
    }
    Ok(())
}

fn extract_tar<F>(data: &[u8], feed: &mut Feed<F>) -> io::Result<()>
where
    F: FnMut(Member) -> Option<u64>,
{
    let mut archive = tar::Archive::new(Cursor::new(data));

    for entry in archive.entries()? {
        let entry = entry?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        if !feed.admits() {
            break;
        }
        let name = entry.path()?.display().to_string();
        let size = entry.size();
        if !feed.member(name, Some(size), entry)? {
            break;
        }
    }
    Ok(())
}

fn to_io(err: zip::result::ZipError) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const UNLIMITED: ExtractLimits = ExtractLimits {
        max_member_size: u64::MAX,
        max_members: u64::MAX,
        scan_budget: u64::MAX,
    };

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    fn zip_of(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        for (name, content) in files {
            writer
                .start_file(*name, zip::write::FileOptions::default())
                .unwrap();
            writer.write_all(content).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    /// Extracts everything, keeping the members and charging their size
    /// against the budget.
    fn collect(kind: Container, data: &[u8], limits: ExtractLimits) -> io::Result<(Extracted, Vec<Member>)> {
        let mut members = Vec::new();
        let mut budget = limits.scan_budget;
        let out = extract(kind, data, limits, |member| {
            budget = budget.saturating_sub(member.data.len() as u64);
            members.push(member);
            Some(budget)
        })?;
        Ok((out, members))
    }

    #[test]
    fn test_detect() {
        assert_eq!(detect(&gzip(b"x")), Some(Container::Gzip));
        assert_eq!(detect(&zip_of(&[("a", &b"x"[..])])), Some(Container::Zip));
        assert_eq!(detect(b"plain text"), None);
        assert_eq!(detect(b""), None);
    }

    #[test]
    fn test_gzip_member_is_capped() {
        let packed = gzip(&[7u8; 100]);
        let (out, members) = collect(
            Container::Gzip,
            &packed,
            ExtractLimits {
                max_member_size: 10,
                ..UNLIMITED
            },
        )
        .unwrap();
        assert_eq!(out.members, 1);
        assert_eq!(members[0].data.len(), 10);
        assert_eq!(members[0].limit, Some(MemberLimit::FileSize));
    }

    #[test]
    fn test_oversized_zip_member_is_not_read() {
        let packed = zip_of(&[("big", &[0u8; 4096][..]), ("small", &b"ok"[..])]);
        let (out, members) = collect(
            Container::Zip,
            &packed,
            ExtractLimits {
                max_member_size: 100,
                ..UNLIMITED
            },
        )
        .unwrap();
        assert_eq!(out.members, 2);
        assert_eq!(members[0].name, "big");
        assert!(members[0].data.is_empty());
        assert_eq!(members[0].limit, Some(MemberLimit::FileSize));
        assert_eq!(members[1].data, b"ok");
        assert_eq!(members[1].limit, None);
    }

    #[test]
    fn test_zip_member_limit() {
        let packed = zip_of(&[("a", &b"1"[..]), ("b", &b"2"[..]), ("c", &b"3"[..])]);
        let (out, members) = collect(Container::Zip, &packed, UNLIMITED).unwrap();
        assert_eq!(members.len(), 3);
        assert!(!out.more);

        let (out, members) = collect(
            Container::Zip,
            &packed,
            ExtractLimits {
                max_members: 2,
                ..UNLIMITED
            },
        )
        .unwrap();
        assert_eq!(members.len(), 2);
        assert!(out.more);
    }

    #[test]
    fn test_scan_budget_stops_extraction() {
        let packed = zip_of(&[("a", &[1u8; 100][..]), ("b", &[2u8; 100][..]), ("c", &[3u8; 100][..])]);
        let (out, members) = collect(
            Container::Zip,
            &packed,
            ExtractLimits {
                scan_budget: 150,
                ..UNLIMITED
            },
        )
        .unwrap();
        assert_eq!(out.members, 2);
        assert!(out.budget_spent);
        assert!(!out.more);
        assert_eq!(members[0].limit, None);
        assert_eq!(members[1].data.len(), 50);
        assert_eq!(members[1].limit, Some(MemberLimit::ScanSize));
    }

    #[test]
    fn test_visitor_can_stop_extraction() {
        let packed = zip_of(&[("a", &b"1"[..]), ("b", &b"2"[..]), ("c", &b"3"[..])]);
        let mut seen = Vec::new();
        let out = extract(Container::Zip, &packed, UNLIMITED, |member| {
            seen.push(member.name);
            None
        })
        .unwrap();
        assert_eq!(out.members, 1);
        assert_eq!(seen, vec!["a"]);
        assert!(!out.more && !out.budget_spent);
    }

    #[test]
    fn test_broken_zip_is_an_error() {
        assert!(extract(Container::Zip, b"PK\x03\x04garbage", UNLIMITED, |_| Some(u64::MAX)).is_err());
    }
}
