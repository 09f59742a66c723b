//! Scan report files and their digests.

use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::error::{PipelineError, Result};
use crate::pipeline::ReportRef;

/// Compute the SHA256 digest of the file at `path` and return it as a hex string.
pub fn compute_sha256(path: &Path) -> Result<String> {
    let file = File::open(path).map_err(|err| {
        PipelineError::io(format!("failed to open {} for hashing", path.display()), err)
    })?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];

    loop {
        let read = reader
            .read(&mut buffer)
            .map_err(|err| PipelineError::io(format!("failed to read {}", path.display()), err))?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

/// Writes `content` to `path`, creating parent directories, and returns a
/// reference carrying the digest of what was written.
pub fn write_report(stage: &str, path: &Path, content: &str) -> Result<ReportRef> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).map_err(|err| {
            PipelineError::io(
                format!("failed to create report directory {}", parent.display()),
                err,
            )
        })?;
    }
    fs::write(path, content).map_err(|err| {
        PipelineError::io(format!("failed to write report {}", path.display()), err)
    })?;
    Ok(ReportRef {
        stage: stage.to_string(),
        path: path.to_path_buf(),
        sha256: Some(compute_sha256(path)?),
    })
}
