use argh::FromArgs;

#[derive(FromArgs, PartialEq, Debug)]
/// bring the cached index files up to date with their remote repositories
#[argh(subcommand, name = "update")]
pub(crate) struct AptSyncUpdate {
    /// do not download anything, fail on indices the cache cannot satisfy
    #[argh(switch)]
    pub no_download: bool,
}

#[derive(FromArgs, PartialEq, Debug)]
/// verify the cache against the already cached Release files
#[argh(subcommand, name = "check")]
pub(crate) struct AptSyncCheck {}

#[derive(FromArgs, PartialEq, Debug)]
/// remove cache files no configured index refers to
#[argh(subcommand, name = "clean")]
pub(crate) struct AptSyncClean {}

#[derive(FromArgs, PartialEq, Debug)]
#[argh(subcommand)]
pub(crate) enum AptSyncCommand {
    Update(AptSyncUpdate),
    Check(AptSyncCheck),
    Clean(AptSyncClean),
}

#[derive(FromArgs, PartialEq, Debug)]
/// apt-sync: remote index cache manager
pub(crate) struct AptSync {
    /// specify the location of the config file
    #[argh(option, short = 'c')]
    pub config: String,
    #[argh(subcommand)]
    pub command: AptSyncCommand,
}
