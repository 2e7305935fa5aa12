use std::path::PathBuf;

use thiserror::Error;

/// Failures the fetch pipeline distinguishes beyond plain I/O errors.
///
/// These are carried as `anyhow` payloads so callers can still attach
/// context while keeping the kind recoverable via `downcast_ref`.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("interrupted")]
    Interrupted,
    #[error("no accepted signature found for remote repository {repository} ({method} {suite})")]
    BadSignature {
        repository: String,
        method: String,
        suite: String,
    },
    #[error("wrong checksum for '{path}'")]
    WrongChecksum { path: PathBuf },
    #[error("required file '{path}' is missing")]
    MissingFile { path: PathBuf },
    #[error("could not find '{remote}' within '{release}'")]
    NotInRelease { remote: String, release: PathBuf },
    #[error(
        "'{compressed}' looked correct according to '{release}', \
         but after unpacking '{uncompressed}' looks wrong; \
         something is seriously broken"
    )]
    IntegrityViolation {
        compressed: PathBuf,
        release: PathBuf,
        uncompressed: PathBuf,
    },
}
