//! Model artifact validation and content hashing
//!
//! An artifact is a directory holding the model config, weights and tokenizer.
//! The content hash covers the bytes of every file in the directory tree,
//! visited in sorted relative-path order, so two copies with identical
//! contents hash identically regardless of where they live.

use modelserve_common::{Result, ServeError};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Model configuration file
pub const CONFIG_FILE: &str = "config.json";

/// Model weights file
pub const WEIGHTS_FILE: &str = "pytorch_model.bin";

/// Tokenizer definition file
pub const TOKENIZER_FILE: &str = "tokenizer.json";

/// Read size used when streaming files through the digest
const HASH_CHUNK_SIZE: usize = 64 * 1024;

/// Check that `path` is a directory containing every required file
pub fn validate_artifact<S: AsRef<str>>(path: &Path, required_files: &[S]) -> Result<()> {
    if !path.is_dir() {
        return Err(ServeError::artifact_invalid(format!(
            "{} is not a directory",
            path.display()
        )));
    }

    for file in required_files {
        let candidate = path.join(file.as_ref());
        if !candidate.is_file() {
            return Err(ServeError::artifact_invalid(format!(
                "{} is missing {}",
                path.display(),
                file.as_ref()
            )));
        }
    }

    Ok(())
}

/// Compute the hex-encoded SHA-256 digest of every file under `path`
pub fn content_hash(path: &Path) -> Result<String> {
    let mut files = Vec::new();
    collect_files(path, &mut files)?;

    // Sort by path relative to the artifact root so the digest does not depend
    // on directory enumeration order or on the root location.
    files.sort_by(|a, b| relative(path, a).cmp(relative(path, b)));

    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; HASH_CHUNK_SIZE];
    let mut total = 0u64;

    for file in &files {
        let mut reader = File::open(file)?;
        loop {
            let read = reader.read(&mut buffer)?;
            if read == 0 {
                break;
            }
            hasher.update(&buffer[..read]);
            total += read as u64;
        }
    }

    debug!(
        "Hashed artifact {}: {} files, {} bytes",
        path.display(),
        files.len(),
        total
    );

    Ok(hex::encode(hasher.finalize()))
}

fn relative<'a>(root: &Path, file: &'a Path) -> &'a Path {
    file.strip_prefix(root).unwrap_or(file)
}

fn collect_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            collect_files(&entry.path(), out)?;
        } else if file_type.is_file() {
            out.push(entry.path());
        }
    }
    Ok(())
}
