//! Remote repository model and index cache resolver
//!
//! This is the code deciding what has to be fetched from the remote
//! repositories: for every index file some distribution needs, either the
//! cached copy in the lists directory is still valid, an existing
//! compressed variant can be unpacked into place, or a download has to be
//! scheduled. All decisions are backed by the checksums the (verified)
//! Release file records.

use std::collections::HashSet;
use std::ffi::OsStr;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{anyhow, Context, Result};
use log::{debug, info};

use crate::cache::{self, CachedListFile};
use crate::checksums::{self, HashAlgorithm};
use crate::compression::{Compression, Uncompressor};
use crate::donefile::{DoneFile, MarkDoneFile};
use crate::error::SyncError;
use crate::names;
use crate::release::{self, FileTable};
use crate::signature::{SignatureCheck, SignatureChecker};
use crate::transport::{IndexRequest, MethodHandle, TransportRun};

/// Run-wide state threaded through the orchestrator.
pub struct FetchContext<'a> {
    pub lists_dir: &'a Path,
    /// Set from a signal handler; polled before each repository at startup.
    pub interrupted: &'a AtomicBool,
}

impl FetchContext<'_> {
    fn interrupted(&self) -> bool {
        self.interrupted.load(Ordering::Relaxed)
    }
}

/// Package index flavours with distinct remote layouts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PackageType {
    Deb,
    Udeb,
    Dsc,
}

impl PackageType {
    pub fn from_name(name: &str) -> Option<PackageType> {
        match name {
            "deb" => Some(PackageType::Deb),
            "udeb" => Some(PackageType::Udeb),
            "dsc" => Some(PackageType::Dsc),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RepositoryId(usize);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DistributionId {
    repository: usize,
    index: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IndexId {
    repository: usize,
    distribution: usize,
    index: usize,
}

struct Repository {
    name: String,
    method: String,
    fallback: Option<String>,
    config: Vec<String>,
    transport: Option<MethodHandle>,
    distributions: Vec<Distribution>,
}

impl Repository {
    fn transport(&self) -> Result<MethodHandle> {
        self.transport
            .ok_or_else(|| anyhow!("repository '{}' has no transport attached", self.name))
    }
}

struct Verify {
    identity: String,
    signature_file: PathBuf,
}

/// Everything that only exists when a distribution has a Release file.
struct ManifestState {
    release_file: PathBuf,
    verify: Option<Verify>,
    /// Populated once the Release file was fetched and, if required,
    /// signature-verified.
    remote_files: FileTable,
}

struct Distribution {
    suite: String,
    flat: bool,
    /// `dists/<suite>` normally, just `<suite>` for flat layouts.
    suite_base_dir: String,
    ignore_hashes: HashSet<HashAlgorithm>,
    done_file: PathBuf,
    manifest: Option<ManifestState>,
    indices: Vec<RemoteIndex>,
}

struct RemoteIndex {
    /// Filename as it appears inside the Release file.
    remote_path: String,
    /// Cache location of the uncompressed form in the lists directory.
    cache_path: PathBuf,
    cache_basename: String,
    /// Per-codec offsets into the distribution's file table.
    ofs: [Option<usize>; Compression::COUNT],
    /// Offset of a `.diff/Index` entry; recorded for future pdiff support.
    diff_ofs: Option<usize>,
    /// The codec a scheduled download decided on.
    compression: Option<Compression>,
    queued: bool,
    needed: bool,
}

impl RemoteIndex {
    fn variant(&self, compression: Compression) -> Option<usize> {
        self.ofs[compression as usize]
    }

    /// Classify every file table entry starting with our remote path.
    fn find_variants(&mut self, files: &FileTable) {
        self.ofs = [None; Compression::COUNT];
        self.diff_ofs = None;
        for (i, name) in files.names().iter().enumerate() {
            let Some(rest) = name.strip_prefix(self.remote_path.as_str()) else {
                continue;
            };
            if rest.is_empty() {
                self.ofs[Compression::None as usize] = Some(i);
                continue;
            }
            if !rest.starts_with('.') {
                continue;
            }
            if rest == ".diff/Index" {
                self.diff_ofs = Some(i);
                continue;
            }
            if let Some(c) = Compression::from_suffix(rest) {
                self.ofs[c as usize] = Some(i);
            }
        }
    }
}

/// Every remote repository known to this run.
#[derive(Default)]
pub struct RemoteSet {
    repositories: Vec<Repository>,
}

impl RemoteSet {
    pub fn new() -> RemoteSet {
        RemoteSet::default()
    }

    /// Register a repository. The caller guarantees name uniqueness.
    pub fn add_repository(
        &mut self,
        name: &str,
        method: &str,
        fallback: Option<&str>,
        config: &[String],
    ) -> RepositoryId {
        self.repositories.push(Repository {
            name: name.to_string(),
            method: method.to_string(),
            fallback: fallback.map(str::to_string),
            config: config.to_vec(),
            transport: None,
            distributions: Vec::new(),
        });

        RepositoryId(self.repositories.len() - 1)
    }

    /// Look up or create the distribution `suite` below `repository`.
    ///
    /// Preparing the same suite twice must agree on the verification
    /// settings; a mismatch is a programming error.
    pub fn add_distribution(
        &mut self,
        ctx: &FetchContext,
        repository: RepositoryId,
        suite: &str,
        ignore_release: bool,
        verify_release: Option<&str>,
        flat: bool,
        ignore_hashes: &HashSet<HashAlgorithm>,
    ) -> DistributionId {
        let repo = &mut self.repositories[repository.0];
        if let Some(index) = repo.distributions.iter().position(|d| d.suite == suite) {
            let existing = &repo.distributions[index];
            assert_eq!(existing.manifest.is_none(), ignore_release);
            assert_eq!(
                existing
                    .manifest
                    .as_ref()
                    .and_then(|m| m.verify.as_ref())
                    .map(|v| v.identity.as_str()),
                verify_release
            );
            return DistributionId {
                repository: repository.0,
                index,
            };
        }

        let suite_base_dir = if flat {
            suite.to_string()
        } else {
            format!("dists/{}", suite)
        };
        let manifest = (!ignore_release).then(|| {
            let release_file =
                names::lists_filename(ctx.lists_dir, Some("Release"), &[repo.name.as_str(), suite]);
            let verify = verify_release.map(|identity| {
                let mut signature = release_file.as_os_str().to_owned();
                signature.push(".gpg");
                Verify {
                    identity: identity.to_string(),
                    signature_file: PathBuf::from(signature),
                }
            });
            ManifestState {
                release_file,
                verify,
                remote_files: FileTable::default(),
            }
        });
        repo.distributions.push(Distribution {
            suite: suite.to_string(),
            flat,
            suite_base_dir,
            ignore_hashes: ignore_hashes.clone(),
            done_file: names::lists_filename(ctx.lists_dir, Some("done"), &[repo.name.as_str(), suite]),
            manifest,
            indices: Vec::new(),
        });

        DistributionId {
            repository: repository.0,
            index: repo.distributions.len() - 1,
        }
    }

    /// Request one index of a dists-style distribution. Requests that
    /// collapse onto the same cache file return the existing index.
    pub fn add_index(
        &mut self,
        ctx: &FetchContext,
        distribution: DistributionId,
        architecture: &str,
        component: &str,
        package_type: PackageType,
    ) -> IndexId {
        let repo = &self.repositories[distribution.repository];
        let suite = repo.distributions[distribution.index].suite.clone();
        let (remote_path, cache_path) = match package_type {
            PackageType::Deb => (
                format!("{}/binary-{}/Packages", component, architecture),
                names::lists_filename(
                    ctx.lists_dir,
                    Some("Packages"),
                    &[repo.name.as_str(), &suite, "deb", component, architecture],
                ),
            ),
            PackageType::Udeb => (
                format!("{}/debian-installer/binary-{}/Packages", component, architecture),
                names::lists_filename(
                    ctx.lists_dir,
                    Some("uPackages"),
                    &[repo.name.as_str(), &suite, "udeb", component, architecture],
                ),
            ),
            PackageType::Dsc => (
                format!("{}/source/Sources", component),
                names::lists_filename(
                    ctx.lists_dir,
                    Some("Sources"),
                    &[repo.name.as_str(), &suite, component],
                ),
            ),
        };
        let d = &mut self.repositories[distribution.repository].distributions[distribution.index];
        assert!(!d.flat);

        IndexId {
            repository: distribution.repository,
            distribution: distribution.index,
            index: d.intern_index(cache_path, remote_path),
        }
    }

    /// Request the single index of a flat distribution.
    pub fn add_flat_index(
        &mut self,
        ctx: &FetchContext,
        distribution: DistributionId,
        package_type: PackageType,
    ) -> IndexId {
        let repo = &self.repositories[distribution.repository];
        let suite = repo.distributions[distribution.index].suite.clone();
        let (remote_path, cache_path) = match package_type {
            PackageType::Deb => (
                "Packages".to_string(),
                names::lists_filename(
                    ctx.lists_dir,
                    Some("Packages"),
                    &[repo.name.as_str(), &suite, "deb"],
                ),
            ),
            PackageType::Dsc => (
                "Sources".to_string(),
                names::lists_filename(ctx.lists_dir, Some("Sources"), &[repo.name.as_str(), &suite]),
            ),
            PackageType::Udeb => panic!("flat layouts carry no installer indices"),
        };
        let d = &mut self.repositories[distribution.repository].distributions[distribution.index];
        assert!(d.flat);

        IndexId {
            repository: distribution.repository,
            distribution: distribution.index,
            index: d.intern_index(cache_path, remote_path),
        }
    }

    pub fn mark_needed(&mut self, index: IndexId) {
        self.index_mut(index).needed = true;
    }

    fn index_ref(&self, index: IndexId) -> &RemoteIndex {
        &self.repositories[index.repository].distributions[index.distribution].indices[index.index]
    }

    fn index_mut(&mut self, index: IndexId) -> &mut RemoteIndex {
        &mut self.repositories[index.repository].distributions[index.distribution].indices
            [index.index]
    }

    pub fn index_cache_basename(&self, index: IndexId) -> &str {
        &self.index_ref(index).cache_basename
    }

    pub fn distribution_ids(&self) -> Vec<DistributionId> {
        let mut ids = Vec::new();
        for (repository, repo) in self.repositories.iter().enumerate() {
            for index in 0..repo.distributions.len() {
                ids.push(DistributionId { repository, index });
            }
        }

        ids
    }

    pub fn index_ids(&self, distribution: DistributionId) -> Vec<IndexId> {
        let d = &self.repositories[distribution.repository].distributions[distribution.index];
        (0..d.indices.len())
            .map(|index| IndexId {
                repository: distribution.repository,
                distribution: distribution.index,
                index,
            })
            .collect()
    }

    /// Human-readable `repository/suite` label for log output.
    pub fn distribution_label(&self, distribution: DistributionId) -> String {
        let repo = &self.repositories[distribution.repository];
        format!(
            "{}/{}",
            repo.name, repo.distributions[distribution.index].suite
        )
    }

    pub fn done_file_path(&self, distribution: DistributionId) -> &Path {
        &self.repositories[distribution.repository].distributions[distribution.index].done_file
    }

    /// Attach a transport method to every repository.
    pub fn startup(&mut self, ctx: &FetchContext, run: &mut dyn TransportRun) -> Result<()> {
        for repository in &mut self.repositories {
            if ctx.interrupted() {
                return Err(anyhow!(SyncError::Interrupted));
            }
            debug_assert!(repository.transport.is_none());
            let handle = run.new_method(
                &repository.method,
                repository.fallback.as_deref(),
                &repository.config,
            )?;
            repository.transport = Some(handle);
        }

        Ok(())
    }

    /// Fetch every distribution's Release and Release.gpg, then verify and
    /// parse them.
    pub fn prepare_metalists(
        &mut self,
        run: &mut dyn TransportRun,
        checker: &dyn SignatureChecker,
        no_download: bool,
    ) -> Result<()> {
        if !no_download {
            for repository in &self.repositories {
                let transport = repository.transport()?;
                for distribution in &repository.distributions {
                    distribution.queue_metalists(transport, run)?;
                }
            }
            run.download()?;
        }

        for repository in &mut self.repositories {
            let Repository {
                name,
                method,
                distributions,
                ..
            } = repository;
            for distribution in distributions.iter_mut() {
                distribution.process_release(name, method, checker)?;
            }
        }

        Ok(())
    }

    /// Decide for every needed index whether the cache suffices or a
    /// download is scheduled, then run the transport.
    ///
    /// The loop shape exists for a future pdiff implementation that may
    /// produce new candidates mid-run; today nothing sets the flag and it
    /// runs once.
    pub fn prepare_lists(
        &mut self,
        ctx: &FetchContext,
        run: &mut dyn TransportRun,
        uncompressor: &dyn Uncompressor,
        no_download: bool,
    ) -> Result<()> {
        let mut old_files = cache::scan_lists_dir(ctx.lists_dir)?;
        loop {
            let mut to_be_continued = false;
            for repository in &mut self.repositories {
                let transport = repository.transport()?;
                for distribution in &mut repository.distributions {
                    distribution.queue_lists(
                        transport,
                        run,
                        uncompressor,
                        no_download,
                        &mut old_files,
                        &mut to_be_continued,
                    )?;
                }
            }
            run.download()?;
            if !to_be_continued {
                break;
            }
        }

        Ok(())
    }

    /// Whether an index still needs processing compared to the journal of
    /// the previous run.
    pub fn index_is_new(&mut self, index: IndexId, done: &mut DoneFile) -> bool {
        let distribution =
            &mut self.repositories[index.repository].distributions[index.distribution];
        let Some(manifest) = &mut distribution.manifest else {
            return true;
        };
        let ri = &distribution.indices[index.index];
        // without uncompressed checksums there is nothing to compare
        let Some(none_ofs) = ri.variant(Compression::None) else {
            return true;
        };
        // if the journal ends or the wrong file comes next, something has
        // changed and everything is better reloaded
        let Some((basename, recorded)) = done.next_index() else {
            return true;
        };
        if basename != ri.cache_basename {
            return true;
        }
        let expected = manifest.remote_files.checksums(none_ofs);
        let check = recorded.check(expected);
        if !check.matches || check.missing {
            // unknown hashes in the Release file must be learned by a
            // fresh processing pass
            return true;
        }
        let reverse = expected.check(&recorded);
        if !reverse.matches {
            return true;
        }
        if reverse.missing {
            // remember hashes only the journal knew, so they show up in
            // the next journal again instead of forcing a reload
            let combined = expected.combine(&recorded);
            manifest.remote_files.set_checksums(none_ofs, combined);
        }

        false
    }

    /// Record an index as fully processed in the next journal.
    pub fn mark_done(&self, index: IndexId, done: &mut MarkDoneFile) -> Result<()> {
        let distribution = &self.repositories[index.repository].distributions[index.distribution];
        let ri = &distribution.indices[index.index];
        let (Some(manifest), Some(none_ofs)) =
            (&distribution.manifest, ri.variant(Compression::None))
        else {
            return Ok(());
        };

        done.mark_done(&ri.cache_basename, manifest.remote_files.checksums(none_ofs))
    }

    /// Delete every lists directory entry that belongs to no needed index,
    /// no manifest and no journal. Returns how many files were removed.
    pub fn cleanup_lists(&self, ctx: &FetchContext) -> Result<usize> {
        let mut old_files = cache::scan_lists_dir(ctx.lists_dir)?;
        for file in &mut old_files {
            file.needed = self.is_wanted(&file.basename);
        }
        let mut removed = 0;
        for file in &mut old_files {
            if !file.needed {
                if file.parts.is_empty() {
                    debug!("'{}' does not follow the cache naming scheme", file.basename);
                }
                info!("Deleting unreferenced '{}'", file.path.display());
                file.delete()?;
                removed += 1;
            }
        }

        Ok(removed)
    }

    fn is_wanted(&self, basename: &str) -> bool {
        let matches = |path: &Path| path.file_name() == Some(OsStr::new(basename));
        for repository in &self.repositories {
            for distribution in &repository.distributions {
                if matches(&distribution.done_file) {
                    return true;
                }
                if let Some(manifest) = &distribution.manifest {
                    if matches(&manifest.release_file) {
                        return true;
                    }
                    if let Some(verify) = &manifest.verify {
                        if matches(&verify.signature_file) {
                            return true;
                        }
                    }
                }
                for index in &distribution.indices {
                    if !index.needed {
                        continue;
                    }
                    if let Some(suffix) = basename.strip_prefix(index.cache_basename.as_str()) {
                        if Compression::from_suffix(suffix).is_some() {
                            return true;
                        }
                    }
                }
            }
        }

        false
    }
}

impl Distribution {
    fn intern_index(&mut self, cache_path: PathBuf, remote_path: String) -> usize {
        let cache_basename = cache_path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();
        if let Some(i) = self
            .indices
            .iter()
            .position(|ri| ri.cache_basename == cache_basename)
        {
            return i;
        }
        self.indices.push(RemoteIndex {
            remote_path,
            cache_path,
            cache_basename,
            ofs: [None; Compression::COUNT],
            diff_ofs: None,
            compression: None,
            queued: false,
            needed: false,
        });

        self.indices.len() - 1
    }

    fn queue_metalists(&self, transport: MethodHandle, run: &mut dyn TransportRun) -> Result<()> {
        let Some(manifest) = &self.manifest else {
            return Ok(());
        };
        // a stale manifest must never shadow the fresh one
        cache::delete_file(&manifest.release_file).ok();
        run.queue_index(
            transport,
            IndexRequest {
                base_dir: self.suite_base_dir.clone(),
                remote_name: "Release".to_string(),
                local_path: manifest.release_file.clone(),
                uncompressed: None,
                compression: Compression::None,
                compressed: None,
            },
        )?;
        if let Some(verify) = &manifest.verify {
            cache::delete_file(&verify.signature_file).ok();
            run.queue_index(
                transport,
                IndexRequest {
                    base_dir: self.suite_base_dir.clone(),
                    remote_name: "Release.gpg".to_string(),
                    local_path: verify.signature_file.clone(),
                    uncompressed: None,
                    compression: Compression::None,
                    compressed: None,
                },
            )?;
        }

        Ok(())
    }

    fn process_release(
        &mut self,
        repository: &str,
        method: &str,
        checker: &dyn SignatureChecker,
    ) -> Result<()> {
        let Some(manifest) = &mut self.manifest else {
            return Ok(());
        };
        if let Some(verify) = &manifest.verify {
            match checker.check(
                &verify.identity,
                &verify.signature_file,
                &manifest.release_file,
            )? {
                SignatureCheck::Accepted => (),
                SignatureCheck::NoAcceptedSignature => {
                    return Err(anyhow!(SyncError::BadSignature {
                        repository: repository.to_string(),
                        method: method.to_string(),
                        suite: self.suite.clone(),
                    }));
                }
            }
        }
        manifest.remote_files =
            release::get_checksums(&manifest.release_file, &self.ignore_hashes)?;
        for index in &mut self.indices {
            index.find_variants(&manifest.remote_files);
        }

        Ok(())
    }

    fn queue_lists(
        &mut self,
        transport: MethodHandle,
        run: &mut dyn TransportRun,
        uncompressor: &dyn Uncompressor,
        no_download: bool,
        old_files: &mut [CachedListFile],
        to_be_continued: &mut bool,
    ) -> Result<()> {
        for i in 0..self.indices.len() {
            if self.indices[i].queued {
                continue;
            }
            if !self.indices[i].needed {
                continue;
            }
            self.queue_one(
                i,
                transport,
                run,
                uncompressor,
                no_download,
                old_files,
                to_be_continued,
            )?;
        }

        Ok(())
    }

    /// Settle one index: reuse the cached uncompressed file, unpack a
    /// cached compressed variant, schedule a download, or fail.
    fn queue_one(
        &mut self,
        i: usize,
        transport: MethodHandle,
        run: &mut dyn TransportRun,
        uncompressor: &dyn Uncompressor,
        no_download: bool,
        old_files: &mut [CachedListFile],
        _to_be_continued: &mut bool,
    ) -> Result<()> {
        let Distribution {
            suite_base_dir,
            manifest,
            indices,
            ..
        } = self;
        let index = &mut indices[i];

        let Some(manifest) = manifest else {
            // without a Release file nothing can be verified; we do not
            // know what upstream has, just assume .gz
            index.queued = true;
            if no_download {
                return Ok(());
            }
            index.compression = Some(Compression::Gzip);
            return run.queue_index(
                transport,
                IndexRequest {
                    base_dir: suite_base_dir.clone(),
                    remote_name: format!("{}.gz", index.remote_path),
                    local_path: index.cache_path.clone(),
                    uncompressed: None,
                    compression: Compression::Gzip,
                    compressed: None,
                },
            );
        };
        let remote_files = &mut manifest.remote_files;

        // candidates still available from an earlier download
        let mut old = [None; Compression::COUNT];
        for (position, file) in old_files.iter_mut().enumerate() {
            if file.deleted {
                continue;
            }
            let Some(suffix) = file.basename.strip_prefix(index.cache_basename.as_str()) else {
                continue;
            };
            if let Some(c) = Compression::from_suffix(suffix) {
                old[c as usize] = Some(position);
                file.needed = true;
            }
        }

        let uncompressed_ofs = index.variant(Compression::None);

        if let Some(position) = old[Compression::None as usize] {
            let reuse = match uncompressed_ofs {
                // not listed in the Release file, so the cached copy
                // cannot be trusted
                None => None,
                Some(ofs) => checksums::test_file(
                    &old_files[position].path,
                    remote_files.checksums(ofs),
                )
                .with_context(|| {
                    format!("error testing '{}'", old_files[position].path.display())
                })?
                .map(|improved| (ofs, improved)),
            };
            match reuse {
                Some((ofs, improved)) => {
                    remote_files.set_checksums(ofs, improved);
                    // already there, nothing to do to get it
                    index.queued = true;
                    return Ok(());
                }
                None => {
                    // stale; a pdiff implementation would set
                    // *_to_be_continued here instead. We need to overwrite
                    // the file, so failing to remove it is fatal.
                    old_files[position].delete()?;
                    old[Compression::None as usize] = None;
                }
            }
        }

        // compressed candidates are only usable when the Release file also
        // records uncompressed hashes to verify the unpacked result against
        for c in Compression::ALL {
            let Some(position) = old[c as usize] else {
                continue;
            };
            if let (Some(none_ofs), Some(ofs)) = (uncompressed_ofs, index.variant(c)) {
                let tested = checksums::test_file(
                    &old_files[position].path,
                    remote_files.checksums(ofs),
                )
                .with_context(|| {
                    format!("error testing '{}'", old_files[position].path.display())
                })?;
                if let Some(improved) = tested {
                    remote_files.set_checksums(ofs, improved);
                    uncompressor.uncompress(&old_files[position].path, &index.cache_path, c)?;
                    match checksums::test_file(
                        &index.cache_path,
                        remote_files.checksums(none_ofs),
                    ) {
                        Ok(Some(improved)) => {
                            remote_files.set_checksums(none_ofs, improved);
                            index.queued = true;
                            return Ok(());
                        }
                        Ok(None) => {
                            return Err(anyhow!(SyncError::IntegrityViolation {
                                compressed: old_files[position].path.clone(),
                                release: manifest.release_file.clone(),
                                uncompressed: index.cache_path.clone(),
                            }));
                        }
                        Err(e) if e.kind() == io::ErrorKind::NotFound => {
                            return Err(anyhow!(SyncError::MissingFile {
                                path: index.cache_path.clone(),
                            })
                            .context(format!(
                                "'{}' mysteriously vanished after unpacking",
                                index.cache_path.display()
                            )));
                        }
                        Err(e) => {
                            return Err(e).with_context(|| {
                                format!("error testing '{}'", index.cache_path.display())
                            });
                        }
                    }
                }
                // a mismatch on the stored compressed file just means it
                // is stale
            }
            old_files[position].delete()?;
        }

        // nothing reusable, this needs a download
        if no_download {
            return Err(anyhow!(SyncError::MissingFile {
                path: index.cache_path.clone(),
            })
            .context("try without --no-download to fetch it"));
        }

        // assume the newer the compression, the better (on low-end
        // hardware the opposite would hold; intentionally not configurable)
        let mut selected = None;
        for c in Compression::ALL {
            if let Some(ofs) = index.variant(c) {
                if uncompressor.supported(c) {
                    selected = Some((c, ofs));
                }
            }
        }
        let Some((compression, ofs)) = selected else {
            return Err(anyhow!(SyncError::NotInRelease {
                remote: index.remote_path.clone(),
                release: manifest.release_file.clone(),
            }));
        };
        debug!(
            "downloading '{}' as {}",
            index.remote_path,
            remote_files.name(ofs)
        );
        index.compression = Some(compression);
        index.queued = true;

        run.queue_index(
            transport,
            IndexRequest {
                base_dir: suite_base_dir.clone(),
                remote_name: remote_files.name(ofs).to_string(),
                local_path: index.cache_path.clone(),
                uncompressed: uncompressed_ofs.map(|o| remote_files.checksums(o).clone()),
                compression,
                compressed: (compression != Compression::None)
                    .then(|| remote_files.checksums(ofs).clone()),
            },
        )
    }
}

#[cfg(test)]
use crate::checksums::Checksums;
#[cfg(test)]
use crate::compression::BuiltinUncompressor;
#[cfg(test)]
use std::collections::HashMap;

#[cfg(test)]
#[derive(Default)]
struct TestRun {
    /// remote `base_dir/name` -> payload written to the local path
    files: HashMap<String, Vec<u8>>,
    queue: Vec<IndexRequest>,
    fetched: Vec<IndexRequest>,
}

#[cfg(test)]
impl TransportRun for TestRun {
    fn new_method(
        &mut self,
        _method: &str,
        _fallback: Option<&str>,
        _config: &[String],
    ) -> Result<MethodHandle> {
        Ok(MethodHandle(0))
    }

    fn queue_index(&mut self, _method: MethodHandle, request: IndexRequest) -> Result<()> {
        self.queue.push(request);
        Ok(())
    }

    fn download(&mut self) -> Result<()> {
        for request in self.queue.drain(..) {
            let key = format!("{}/{}", request.base_dir, request.remote_name);
            if let Some(content) = self.files.get(&key) {
                std::fs::write(&request.local_path, content)?;
            }
            self.fetched.push(request);
        }
        Ok(())
    }
}

#[cfg(test)]
struct AcceptAll;
#[cfg(test)]
impl SignatureChecker for AcceptAll {
    fn check(&self, _: &str, _: &Path, _: &Path) -> Result<SignatureCheck> {
        Ok(SignatureCheck::Accepted)
    }
}

#[cfg(test)]
struct RejectAll;
#[cfg(test)]
impl SignatureChecker for RejectAll {
    fn check(&self, _: &str, _: &Path, _: &Path) -> Result<SignatureCheck> {
        Ok(SignatureCheck::NoAcceptedSignature)
    }
}

#[cfg(test)]
fn sums_of(content: &[u8]) -> Checksums {
    use std::io::Write;

    let mut f = tempfile::NamedTempFile::new().unwrap();
    f.write_all(content).unwrap();
    f.flush().unwrap();
    checksums::hash_file(f.path()).unwrap()
}

#[cfg(test)]
fn release_with(entries: &[(&str, &Checksums)]) -> Vec<u8> {
    let mut md5 = String::from("MD5Sum:\n");
    let mut sha256 = String::from("SHA256:\n");
    for (name, checksums) in entries {
        let size = checksums.size().unwrap();
        if let Some(digest) = checksums.get(HashAlgorithm::Md5) {
            md5.push_str(&format!(" {} {} {}\n", digest, size, name));
        }
        if let Some(digest) = checksums.get(HashAlgorithm::Sha256) {
            sha256.push_str(&format!(" {} {} {}\n", digest, size, name));
        }
    }

    format!("Origin: Debian\nSuite: stable\n{}{}", md5, sha256).into_bytes()
}

#[cfg(test)]
fn standard_set(ctx: &FetchContext) -> (RemoteSet, IndexId) {
    let mut set = RemoteSet::new();
    let repository = set.add_repository("debian", "https://deb.example.org/debian", None, &[]);
    let distribution = set.add_distribution(
        ctx,
        repository,
        "stable",
        false,
        Some("/etc/apt-sync/trusted.pgp"),
        false,
        &HashSet::new(),
    );
    let index = set.add_index(ctx, distribution, "amd64", "main", PackageType::Deb);
    set.mark_needed(index);

    (set, index)
}

#[cfg(test)]
fn run_with_release(release: Vec<u8>) -> TestRun {
    let mut run = TestRun::default();
    run.files.insert("dists/stable/Release".to_string(), release);
    run.files
        .insert("dists/stable/Release.gpg".to_string(), b"fake sig".to_vec());

    run
}

#[test]
fn test_fresh_install_schedules_download() {
    let dir = tempfile::tempdir().unwrap();
    let interrupted = AtomicBool::new(false);
    let ctx = FetchContext {
        lists_dir: dir.path(),
        interrupted: &interrupted,
    };
    let (mut set, index) = standard_set(&ctx);

    let plain = sums_of(b"Package: zsync\n");
    let gz = sums_of(b"pretend this is gzip\n");
    let mut run = run_with_release(release_with(&[
        ("main/binary-amd64/Packages", &plain),
        ("main/binary-amd64/Packages.gz", &gz),
    ]));

    set.startup(&ctx, &mut run).unwrap();
    set.prepare_metalists(&mut run, &AcceptAll, false).unwrap();
    assert_eq!(run.fetched.len(), 2);
    assert_eq!(run.fetched[0].remote_name, "Release");
    assert_eq!(run.fetched[1].remote_name, "Release.gpg");
    assert!(dir.path().join("debian_stable_Release").exists());

    set.prepare_lists(&ctx, &mut run, &BuiltinUncompressor, false)
        .unwrap();
    assert_eq!(run.fetched.len(), 3);
    let request = &run.fetched[2];
    assert_eq!(request.base_dir, "dists/stable");
    assert_eq!(request.remote_name, "main/binary-amd64/Packages.gz");
    assert_eq!(
        request.local_path,
        dir.path().join("debian_stable_deb_main_amd64_Packages")
    );
    assert_eq!(request.compression, Compression::Gzip);
    assert_eq!(
        request.uncompressed.as_ref().unwrap().get(HashAlgorithm::Sha256),
        plain.get(HashAlgorithm::Sha256)
    );
    assert_eq!(
        request.compressed.as_ref().unwrap().get(HashAlgorithm::Sha256),
        gz.get(HashAlgorithm::Sha256)
    );
    assert!(set.index_ref(index).queued);
}

#[test]
fn test_cached_uncompressed_is_reused() {
    let dir = tempfile::tempdir().unwrap();
    let interrupted = AtomicBool::new(false);
    let ctx = FetchContext {
        lists_dir: dir.path(),
        interrupted: &interrupted,
    };
    let (mut set, index) = standard_set(&ctx);

    let content = b"Package: zsync\nVersion: 0.6.2-1\n";
    let cache_path = dir.path().join("debian_stable_deb_main_amd64_Packages");
    std::fs::write(&cache_path, content).unwrap();
    let plain = sums_of(content);
    let gz = sums_of(b"pretend this is gzip\n");
    let mut run = run_with_release(release_with(&[
        ("main/binary-amd64/Packages", &plain),
        ("main/binary-amd64/Packages.gz", &gz),
    ]));

    set.startup(&ctx, &mut run).unwrap();
    set.prepare_metalists(&mut run, &AcceptAll, false).unwrap();
    set.prepare_lists(&ctx, &mut run, &BuiltinUncompressor, false)
        .unwrap();
    // nothing beyond the Release files went through the transport
    assert_eq!(run.fetched.len(), 2);
    assert!(set.index_ref(index).queued);
    assert!(cache_path.exists());

    // a second pass does not enqueue anything either
    set.prepare_lists(&ctx, &mut run, &BuiltinUncompressor, false)
        .unwrap();
    assert_eq!(run.fetched.len(), 2);
}

#[test]
fn test_cached_compressed_is_unpacked() {
    use flate2::write::GzEncoder;
    use std::io::Write;

    let dir = tempfile::tempdir().unwrap();
    let interrupted = AtomicBool::new(false);
    let ctx = FetchContext {
        lists_dir: dir.path(),
        interrupted: &interrupted,
    };
    let (mut set, index) = standard_set(&ctx);

    let content = b"Package: zsync\nVersion: 0.6.2-1\n";
    let gz_path = dir.path().join("debian_stable_deb_main_amd64_Packages.gz");
    let mut encoder = GzEncoder::new(
        std::fs::File::create(&gz_path).unwrap(),
        flate2::Compression::default(),
    );
    encoder.write_all(content).unwrap();
    encoder.finish().unwrap();

    let plain = sums_of(content);
    let gz = checksums::hash_file(&gz_path).unwrap();
    let mut run = run_with_release(release_with(&[
        ("main/binary-amd64/Packages", &plain),
        ("main/binary-amd64/Packages.gz", &gz),
    ]));

    set.startup(&ctx, &mut run).unwrap();
    set.prepare_metalists(&mut run, &AcceptAll, false).unwrap();
    set.prepare_lists(&ctx, &mut run, &BuiltinUncompressor, false)
        .unwrap();
    assert_eq!(run.fetched.len(), 2, "no downloads beyond the Release files");
    assert!(set.index_ref(index).queued);
    let cache_path = dir.path().join("debian_stable_deb_main_amd64_Packages");
    assert_eq!(std::fs::read(&cache_path).unwrap(), content);
    // the used compressed file is kept
    assert!(gz_path.exists());
}

#[test]
fn test_stale_uncompressed_is_replaced() {
    let dir = tempfile::tempdir().unwrap();
    let interrupted = AtomicBool::new(false);
    let ctx = FetchContext {
        lists_dir: dir.path(),
        interrupted: &interrupted,
    };
    let (mut set, _) = standard_set(&ctx);

    let cache_path = dir.path().join("debian_stable_deb_main_amd64_Packages");
    std::fs::write(&cache_path, b"Package: outdated\n").unwrap();
    let plain = sums_of(b"Package: current\n");
    let gz = sums_of(b"pretend this is gzip\n");
    let mut run = run_with_release(release_with(&[
        ("main/binary-amd64/Packages", &plain),
        ("main/binary-amd64/Packages.gz", &gz),
    ]));

    set.startup(&ctx, &mut run).unwrap();
    set.prepare_metalists(&mut run, &AcceptAll, false).unwrap();
    set.prepare_lists(&ctx, &mut run, &BuiltinUncompressor, false)
        .unwrap();
    // the stale file was deleted and a fresh download scheduled
    assert!(!cache_path.exists());
    assert_eq!(run.fetched.len(), 3);
    assert_eq!(run.fetched[2].remote_name, "main/binary-amd64/Packages.gz");
}

#[test]
fn test_flat_ignore_release() {
    let dir = tempfile::tempdir().unwrap();
    let interrupted = AtomicBool::new(false);
    let ctx = FetchContext {
        lists_dir: dir.path(),
        interrupted: &interrupted,
    };
    let mut set = RemoteSet::new();
    let repository = set.add_repository("vendor", "https://pkg.example.org", None, &[]);
    let distribution =
        set.add_distribution(&ctx, repository, "updates", true, None, true, &HashSet::new());
    let index = set.add_flat_index(&ctx, distribution, PackageType::Deb);
    set.mark_needed(index);

    let mut run = TestRun::default();
    set.startup(&ctx, &mut run).unwrap();
    set.prepare_metalists(&mut run, &AcceptAll, false).unwrap();
    assert!(run.fetched.is_empty(), "no Release file is fetched");
    set.prepare_lists(&ctx, &mut run, &BuiltinUncompressor, false)
        .unwrap();
    assert_eq!(run.fetched.len(), 1);
    let request = &run.fetched[0];
    assert_eq!(request.base_dir, "updates");
    assert_eq!(request.remote_name, "Packages.gz");
    assert_eq!(request.compression, Compression::Gzip);
    assert!(request.uncompressed.is_none());
    assert!(request.compressed.is_none());
    assert_eq!(
        request.local_path,
        dir.path().join("vendor_updates_deb_Packages")
    );
    assert!(set.index_ref(index).queued);
}

#[test]
fn test_bad_signature_aborts() {
    let dir = tempfile::tempdir().unwrap();
    let interrupted = AtomicBool::new(false);
    let ctx = FetchContext {
        lists_dir: dir.path(),
        interrupted: &interrupted,
    };
    let (mut set, _) = standard_set(&ctx);

    let plain = sums_of(b"Package: zsync\n");
    let mut run = run_with_release(release_with(&[("main/binary-amd64/Packages", &plain)]));
    set.startup(&ctx, &mut run).unwrap();
    let err = set
        .prepare_metalists(&mut run, &RejectAll, false)
        .unwrap_err();
    match err.downcast_ref::<SyncError>() {
        Some(SyncError::BadSignature {
            repository, suite, ..
        }) => {
            assert_eq!(repository, "debian");
            assert_eq!(suite, "stable");
        }
        other => panic!("expected bad signature error, got {:?}", other),
    }
    // no index downloads were attempted
    assert_eq!(run.fetched.len(), 2);
}

#[test]
fn test_integrity_violation_is_fatal() {
    use flate2::write::GzEncoder;
    use std::io::Write;

    let dir = tempfile::tempdir().unwrap();
    let interrupted = AtomicBool::new(false);
    let ctx = FetchContext {
        lists_dir: dir.path(),
        interrupted: &interrupted,
    };
    let (mut set, _) = standard_set(&ctx);

    // the stored .gz matches its Release entry, but its content does not
    // match the recorded uncompressed hashes
    let gz_path = dir.path().join("debian_stable_deb_main_amd64_Packages.gz");
    let mut encoder = GzEncoder::new(
        std::fs::File::create(&gz_path).unwrap(),
        flate2::Compression::default(),
    );
    encoder.write_all(b"Package: tampered\n").unwrap();
    encoder.finish().unwrap();

    let plain = sums_of(b"Package: current\n");
    let gz = checksums::hash_file(&gz_path).unwrap();
    let mut run = run_with_release(release_with(&[
        ("main/binary-amd64/Packages", &plain),
        ("main/binary-amd64/Packages.gz", &gz),
    ]));

    set.startup(&ctx, &mut run).unwrap();
    set.prepare_metalists(&mut run, &AcceptAll, false).unwrap();
    let err = set
        .prepare_lists(&ctx, &mut run, &BuiltinUncompressor, false)
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<SyncError>(),
        Some(SyncError::IntegrityViolation { .. })
    ));
}

#[test]
fn test_unfetchable_index_reports_not_in_release() {
    let dir = tempfile::tempdir().unwrap();
    let interrupted = AtomicBool::new(false);
    let ctx = FetchContext {
        lists_dir: dir.path(),
        interrupted: &interrupted,
    };
    let (mut set, index) = standard_set(&ctx);

    // only a .diff/Index entry, no variant that could be downloaded
    let diff = sums_of(b"diff index\n");
    let mut run = run_with_release(release_with(&[(
        "main/binary-amd64/Packages.diff/Index",
        &diff,
    )]));
    set.startup(&ctx, &mut run).unwrap();
    set.prepare_metalists(&mut run, &AcceptAll, false).unwrap();
    // the diff entry was recorded, but is not used
    assert!(set.index_ref(index).diff_ofs.is_some());
    let err = set
        .prepare_lists(&ctx, &mut run, &BuiltinUncompressor, false)
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<SyncError>(),
        Some(SyncError::NotInRelease { .. })
    ));
}

#[test]
fn test_no_download_reports_missing_file() {
    let dir = tempfile::tempdir().unwrap();
    let interrupted = AtomicBool::new(false);
    let ctx = FetchContext {
        lists_dir: dir.path(),
        interrupted: &interrupted,
    };
    let (mut set, _) = standard_set(&ctx);

    let plain = sums_of(b"Package: zsync\n");
    std::fs::write(
        dir.path().join("debian_stable_Release"),
        release_with(&[("main/binary-amd64/Packages", &plain)]),
    )
    .unwrap();
    std::fs::write(dir.path().join("debian_stable_Release.gpg"), b"sig").unwrap();

    let mut run = TestRun::default();
    set.startup(&ctx, &mut run).unwrap();
    set.prepare_metalists(&mut run, &AcceptAll, true).unwrap();
    assert!(run.fetched.is_empty());
    let err = set
        .prepare_lists(&ctx, &mut run, &BuiltinUncompressor, true)
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<SyncError>(),
        Some(SyncError::MissingFile { .. })
    ));
}

#[test]
fn test_indices_are_interned_by_cache_basename() {
    let dir = tempfile::tempdir().unwrap();
    let interrupted = AtomicBool::new(false);
    let ctx = FetchContext {
        lists_dir: dir.path(),
        interrupted: &interrupted,
    };
    let (mut set, index) = standard_set(&ctx);
    let distribution = set.distribution_ids()[0];
    let again = set.add_index(&ctx, distribution, "amd64", "main", PackageType::Deb);
    assert_eq!(index, again);
    assert_eq!(set.index_ids(distribution).len(), 1);

    // re-preparing the same suite with matching settings interns as well
    let repository = RepositoryId(0);
    let same = set.add_distribution(
        &ctx,
        repository,
        "stable",
        false,
        Some("/etc/apt-sync/trusted.pgp"),
        false,
        &HashSet::new(),
    );
    assert_eq!(distribution, same);
}

#[test]
fn test_interrupt_aborts_startup() {
    let dir = tempfile::tempdir().unwrap();
    let interrupted = AtomicBool::new(true);
    let ctx = FetchContext {
        lists_dir: dir.path(),
        interrupted: &interrupted,
    };
    let (mut set, _) = standard_set(&ctx);
    let mut run = TestRun::default();
    let err = set.startup(&ctx, &mut run).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<SyncError>(),
        Some(SyncError::Interrupted)
    ));
}

#[test]
fn test_done_journal_cycle() {
    let dir = tempfile::tempdir().unwrap();
    let interrupted = AtomicBool::new(false);
    let ctx = FetchContext {
        lists_dir: dir.path(),
        interrupted: &interrupted,
    };
    let (mut set, index) = standard_set(&ctx);

    let content = b"Package: zsync\n";
    std::fs::write(
        dir.path().join("debian_stable_deb_main_amd64_Packages"),
        content,
    )
    .unwrap();
    let plain = sums_of(content);
    let mut run = run_with_release(release_with(&[("main/binary-amd64/Packages", &plain)]));
    set.startup(&ctx, &mut run).unwrap();
    set.prepare_metalists(&mut run, &AcceptAll, false).unwrap();
    set.prepare_lists(&ctx, &mut run, &BuiltinUncompressor, false)
        .unwrap();

    let distribution = set.distribution_ids()[0];
    let done_path = set.done_file_path(distribution).to_owned();

    // no journal yet: everything is new
    let mut reader = DoneFile::open(&done_path).unwrap();
    assert!(set.index_is_new(index, &mut reader));

    let mut writer = MarkDoneFile::create(&done_path).unwrap();
    set.mark_done(index, &mut writer).unwrap();
    writer.finish().unwrap();

    // the journal now records the processed state
    let mut reader = DoneFile::open(&done_path).unwrap();
    assert!(!set.index_is_new(index, &mut reader));

    // a journal talking about some other file does not count
    let mut writer = MarkDoneFile::create(&done_path).unwrap();
    writer.mark_done("debian_stable_deb_main_arm64_Packages", &plain).unwrap();
    writer.finish().unwrap();
    let mut reader = DoneFile::open(&done_path).unwrap();
    assert!(set.index_is_new(index, &mut reader));
}

#[test]
fn test_cleanup_sweeps_unreferenced_files() {
    let dir = tempfile::tempdir().unwrap();
    let interrupted = AtomicBool::new(false);
    let ctx = FetchContext {
        lists_dir: dir.path(),
        interrupted: &interrupted,
    };
    let (mut set, _) = standard_set(&ctx);

    let content = b"Package: zsync\n";
    std::fs::write(
        dir.path().join("debian_stable_deb_main_amd64_Packages"),
        content,
    )
    .unwrap();
    std::fs::write(dir.path().join("debian_stable_deb_main_amd64_Packages.gz"), b"gz").unwrap();
    std::fs::write(dir.path().join("debian_oldstable_deb_main_amd64_Packages"), b"old").unwrap();
    std::fs::write(dir.path().join("stray file"), b"?").unwrap();
    let plain = sums_of(content);
    let mut run = run_with_release(release_with(&[("main/binary-amd64/Packages", &plain)]));
    set.startup(&ctx, &mut run).unwrap();
    set.prepare_metalists(&mut run, &AcceptAll, false).unwrap();

    let removed = set.cleanup_lists(&ctx).unwrap();
    assert_eq!(removed, 2);
    assert!(dir
        .path()
        .join("debian_stable_deb_main_amd64_Packages")
        .exists());
    assert!(dir
        .path()
        .join("debian_stable_deb_main_amd64_Packages.gz")
        .exists());
    assert!(dir.path().join("debian_stable_Release").exists());
    assert!(!dir
        .path()
        .join("debian_oldstable_deb_main_amd64_Packages")
        .exists());
    assert!(!dir.path().join("stray file").exists());
}
