//! Remote transport driver
//!
//! The orchestrator only queues work; a single blocking `download` call
//! then drives every outstanding transfer in parallel and returns once all
//! of them terminated or one failed fatally. Hash verification of arriving
//! files and decompression into the cache location happen here, so the
//! resolver never has to look at a half-fetched file.

use std::io;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use log::{debug, info, warn};
use rayon::prelude::*;
use reqwest::blocking::Client;
use tempfile::NamedTempFile;

use crate::checksums::{self, Checksums};
use crate::compression::{Compression, Uncompressor};
use crate::error::SyncError;

/// Handle of one configured download method.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MethodHandle(pub(crate) usize);

/// One queued index fetch, as handed over by the orchestrator.
#[derive(Debug)]
pub struct IndexRequest {
    /// Directory below the method base, e.g. `dists/stable`.
    pub base_dir: String,
    /// Remote filename below `base_dir`, as recorded in the Release file.
    pub remote_name: String,
    /// Where the (uncompressed) result must end up.
    pub local_path: PathBuf,
    /// Expected checksums of the uncompressed content, when known.
    pub uncompressed: Option<Checksums>,
    pub compression: Compression,
    /// Expected checksums of the wire form, when it is compressed.
    pub compressed: Option<Checksums>,
}

pub trait TransportRun {
    /// Bind a transport method; every repository gets its own handle.
    fn new_method(
        &mut self,
        method: &str,
        fallback: Option<&str>,
        config: &[String],
    ) -> Result<MethodHandle>;

    fn queue_index(&mut self, method: MethodHandle, request: IndexRequest) -> Result<()>;

    /// Drive all queued transfers to completion.
    fn download(&mut self) -> Result<()>;
}

struct HttpMethod {
    base: String,
    fallback: Option<String>,
}

/// Plain HTTP(S) implementation of the transport contract.
pub struct HttpRun<U> {
    client: Client,
    methods: Vec<HttpMethod>,
    queue: Vec<(usize, IndexRequest)>,
    uncompressor: U,
}

fn join_url(base: &str, dir: &str, name: &str) -> String {
    let mut url = base.trim_end_matches('/').to_string();
    for part in dir.split('/').chain(name.split('/')) {
        if part.is_empty() {
            continue;
        }
        url.push('/');
        url.push_str(part);
    }

    url
}

fn verify_arrival(path: &Path, expected: &Checksums, url: &str) -> Result<()> {
    if checksums::test_file(path, expected)?.is_none() {
        return Err(anyhow!(SyncError::WrongChecksum {
            path: path.to_owned(),
        })
        .context(format!("checksum mismatch during receive of '{}'", url)));
    }

    Ok(())
}

impl<U: Uncompressor + Sync> HttpRun<U> {
    pub fn new(uncompressor: U) -> Result<HttpRun<U>> {
        let client = Client::builder()
            .user_agent(concat!("apt-sync/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(HttpRun {
            client,
            methods: Vec::new(),
            queue: Vec::new(),
            uncompressor,
        })
    }

    fn fetch_url(&self, url: &str, request: &IndexRequest) -> Result<()> {
        let target_dir = request
            .local_path
            .parent()
            .ok_or_else(|| anyhow!("'{}' has no parent directory", request.local_path.display()))?;
        let mut temp = NamedTempFile::new_in(target_dir)
            .with_context(|| format!("cannot create temporary file in '{}'", target_dir.display()))?;
        let mut response = self
            .client
            .get(url)
            .send()
            .and_then(|r| r.error_for_status())
            .with_context(|| format!("cannot fetch '{}'", url))?;
        io::copy(&mut response, temp.as_file_mut())
            .with_context(|| format!("error receiving '{}'", url))?;

        if request.compression == Compression::None {
            if let Some(expected) = &request.uncompressed {
                verify_arrival(temp.path(), expected, url)?;
            }
            temp.persist(&request.local_path)
                .with_context(|| format!("cannot store '{}'", request.local_path.display()))?;
            return Ok(());
        }

        if let Some(expected) = &request.compressed {
            verify_arrival(temp.path(), expected, url)?;
        }
        let unpacked = NamedTempFile::new_in(target_dir)
            .with_context(|| format!("cannot create temporary file in '{}'", target_dir.display()))?;
        self.uncompressor
            .uncompress(temp.path(), unpacked.path(), request.compression)?;
        if let Some(expected) = &request.uncompressed {
            verify_arrival(unpacked.path(), expected, url)?;
        }
        unpacked
            .persist(&request.local_path)
            .with_context(|| format!("cannot store '{}'", request.local_path.display()))?;

        Ok(())
    }

    fn fetch(&self, method: &HttpMethod, request: &IndexRequest) -> Result<()> {
        let primary = join_url(&method.base, &request.base_dir, &request.remote_name);
        match self.fetch_url(&primary, request) {
            Ok(()) => Ok(()),
            Err(e) => {
                let Some(fallback) = &method.fallback else {
                    return Err(e);
                };
                warn!("Download of {} failed ({:#}), trying fallback ...", primary, e);
                let secondary = join_url(fallback, &request.base_dir, &request.remote_name);
                self.fetch_url(&secondary, request)
            }
        }
    }
}

impl<U: Uncompressor + Sync> TransportRun for HttpRun<U> {
    fn new_method(
        &mut self,
        method: &str,
        fallback: Option<&str>,
        config: &[String],
    ) -> Result<MethodHandle> {
        if !config.is_empty() {
            debug!("method '{}' carries {} config lines", method, config.len());
        }
        self.methods.push(HttpMethod {
            base: method.to_string(),
            fallback: fallback.map(str::to_string),
        });

        Ok(MethodHandle(self.methods.len() - 1))
    }

    fn queue_index(&mut self, method: MethodHandle, request: IndexRequest) -> Result<()> {
        debug!(
            "queueing {}/{} -> {}",
            request.base_dir,
            request.remote_name,
            request.local_path.display()
        );
        self.queue.push((method.0, request));

        Ok(())
    }

    fn download(&mut self) -> Result<()> {
        let queue = std::mem::take(&mut self.queue);
        if queue.is_empty() {
            return Ok(());
        }
        info!("Fetching {} files ...", queue.len());
        let errors = queue
            .par_iter()
            .filter_map(|(method, request)| {
                let method = &self.methods[*method];
                match self.fetch(method, request) {
                    Ok(()) => {
                        debug!("fetched {}/{}", request.base_dir, request.remote_name);
                        None
                    }
                    Err(e) => Some(e),
                }
            })
            .collect::<Vec<_>>();

        match errors.into_iter().next() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[test]
fn test_join_url() {
    assert_eq!(
        join_url("https://deb.example.org/debian/", "dists/stable", "Release"),
        "https://deb.example.org/debian/dists/stable/Release"
    );
    assert_eq!(
        join_url(
            "https://deb.example.org/debian",
            "dists/stable",
            "main/binary-amd64/Packages.xz"
        ),
        "https://deb.example.org/debian/dists/stable/main/binary-amd64/Packages.xz"
    );
    // flat archives use their suite directly as the base directory
    assert_eq!(
        join_url("http://pkg.example.org", "updates/", "Packages.gz"),
        "http://pkg.example.org/updates/Packages.gz"
    );
}
