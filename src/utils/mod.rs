pub mod logging;

use crate::core::{Error, ErrorCode, Result};
use crate::scanner::HashType;
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::Path;

pub fn format_bytes(size: u64) -> String {
    let units = ["B", "KB", "MB", "GB", "TB"];
    let mut size = size as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < units.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    format!("{:.2} {}", size, units[unit_index])
}

/// Hex digest and size of a file's content.
pub fn file_digest(path: &Path, hash_type: HashType) -> Result<(String, u64)> {
    let mut file = std::fs::File::open(path).map_err(|e| Error::io(ErrorCode::Eopen, path, e))?;
    let mut md5_ctx = md5::Context::new();
    let mut sha = Sha256::new();
    let mut buffer = vec![0u8; 8192];
    let mut size = 0u64;

    loop {
        let bytes_read = file
            .read(&mut buffer)
            .map_err(|e| Error::io(ErrorCode::Eread, path, e))?;
        if bytes_read == 0 {
            break;
        }
        size += bytes_read as u64;
        match hash_type {
            HashType::Md5 => md5_ctx.consume(&buffer[..bytes_read]),
            HashType::Sha256 => sha.update(&buffer[..bytes_read]),
        }
    }

    let digest = match hash_type {
        HashType::Md5 => format!("{:x}", md5_ctx.compute()),
        HashType::Sha256 => hex::encode(sha.finalize()),
    };
    Ok((digest, size))
}

/// A hash database line (`.hdb`/`.hsb` format) naming the file's content.
pub fn hash_signature_line(path: &Path, name: &str, hash_type: HashType) -> Result<String> {
    if name.is_empty() || name.contains(':') {
        return Err(Error::arg(format!("invalid signature name {:?}", name)));
    }
    let (digest, size) = file_digest(path, hash_type)?;
    Ok(format!("{}:{}:{}", digest, size, name))
}
