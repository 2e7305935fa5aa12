use std::{fs, path::Path, sync::atomic::AtomicBool};

use anyhow::{bail, Context, Result};
use log::info;

mod cache;
mod checksums;
mod cli;
mod compression;
mod config;
mod donefile;
mod error;
mod names;
mod release;
mod remote;
mod signature;
mod transport;

use compression::BuiltinUncompressor;
use donefile::{DoneFile, MarkDoneFile};
use remote::{FetchContext, PackageType, RemoteSet};
use signature::KeyringChecker;
use transport::HttpRun;

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

#[cfg(unix)]
fn install_interrupt_handler() -> Result<()> {
    use nix::libc;
    use nix::sys::signal::{self, SigHandler, Signal};
    use std::sync::atomic::Ordering;

    extern "C" fn interrupt(_: libc::c_int) {
        INTERRUPTED.store(true, Ordering::Relaxed);
    }
    unsafe {
        signal::signal(Signal::SIGINT, SigHandler::Handler(interrupt))?;
        signal::signal(Signal::SIGTERM, SigHandler::Handler(interrupt))?;
    }

    Ok(())
}

#[cfg(not(unix))]
fn install_interrupt_handler() -> Result<()> {
    Ok(())
}

fn main() -> Result<()> {
    let args: cli::AptSync = argh::from_env();
    env_logger::init();

    let config = config::parse_config(args.config.as_str())
        .with_context(|| format!("cannot load configuration '{}'", args.config))?;
    config::lint_config(&config);
    install_interrupt_handler()?;

    let lists_dir = Path::new(&config.lists_dir).to_owned();
    fs::create_dir_all(&lists_dir)
        .with_context(|| format!("cannot create lists directory '{}'", lists_dir.display()))?;
    let ctx = FetchContext {
        lists_dir: &lists_dir,
        interrupted: &INTERRUPTED,
    };

    match args.command {
        cli::AptSyncCommand::Update(update) => update_action(&config, &ctx, update.no_download)?,
        cli::AptSyncCommand::Check(_) => update_action(&config, &ctx, true)?,
        cli::AptSyncCommand::Clean(_) => clean_action(&config, &ctx)?,
    }

    Ok(())
}

/// Translate the configuration into the remote model, with every requested
/// index marked as needed.
fn build_remote_set(config: &config::Config, ctx: &FetchContext) -> Result<RemoteSet> {
    let mut set = RemoteSet::new();
    for repo_config in &config.repositories {
        let repository = set.add_repository(
            &repo_config.name,
            &repo_config.method,
            repo_config.fallback.as_deref(),
            &repo_config.config,
        );
        for dist_config in &repo_config.distributions {
            if dist_config.ignore_release && dist_config.verify_with.is_some() {
                bail!(
                    "suite '{}' sets both ignore_release and verify_with",
                    dist_config.suite
                );
            }
            let types = dist_config.package_types()?;
            let ignore_hashes = dist_config.ignored_hashes()?;
            let distribution = set.add_distribution(
                ctx,
                repository,
                &dist_config.suite,
                dist_config.ignore_release,
                dist_config.verify_with.as_deref(),
                dist_config.flat,
                &ignore_hashes,
            );
            if dist_config.flat {
                for package_type in &types {
                    if *package_type == PackageType::Udeb {
                        bail!(
                            "suite '{}': flat layouts carry no installer indices",
                            dist_config.suite
                        );
                    }
                    let index = set.add_flat_index(ctx, distribution, *package_type);
                    set.mark_needed(index);
                }
                continue;
            }
            for component in &dist_config.components {
                for package_type in &types {
                    match package_type {
                        PackageType::Dsc => {
                            let index =
                                set.add_index(ctx, distribution, "source", component, *package_type);
                            set.mark_needed(index);
                        }
                        _ => {
                            for architecture in &dist_config.architectures {
                                let index = set.add_index(
                                    ctx,
                                    distribution,
                                    architecture,
                                    component,
                                    *package_type,
                                );
                                set.mark_needed(index);
                            }
                        }
                    }
                }
            }
        }
    }

    Ok(set)
}

fn update_action(config: &config::Config, ctx: &FetchContext, no_download: bool) -> Result<()> {
    let mut set = build_remote_set(config, ctx)?;
    let mut run = HttpRun::new(BuiltinUncompressor)?;
    set.startup(ctx, &mut run)?;
    info!("Fetching Release files ...");
    set.prepare_metalists(&mut run, &KeyringChecker, no_download)?;
    info!("Preparing index lists ...");
    set.prepare_lists(ctx, &mut run, &BuiltinUncompressor, no_download)?;
    if no_download {
        info!("Cache is complete.");
        return Ok(());
    }

    // record what this run ended up with, so the next one can skip
    // indices whose content did not change
    let mut updated = 0usize;
    let mut unchanged = 0usize;
    for distribution in set.distribution_ids() {
        let done_path = set.done_file_path(distribution).to_owned();
        let mut reader = DoneFile::open(&done_path)?;
        let mut writer = MarkDoneFile::create(&done_path)?;
        for index in set.index_ids(distribution) {
            if set.index_is_new(index, &mut reader) {
                info!("{} has new data.", set.index_cache_basename(index));
                updated += 1;
            } else {
                unchanged += 1;
            }
            set.mark_done(index, &mut writer)?;
        }
        writer.finish().with_context(|| {
            format!(
                "cannot update journal of {}",
                set.distribution_label(distribution)
            )
        })?;
    }
    info!("{} indices updated, {} unchanged.", updated, unchanged);

    Ok(())
}

fn clean_action(config: &config::Config, ctx: &FetchContext) -> Result<()> {
    let set = build_remote_set(config, ctx)?;
    let removed = set.cleanup_lists(ctx)?;
    info!("{} files removed.", removed);

    Ok(())
}
