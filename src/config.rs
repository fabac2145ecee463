//! Processing pipeline configuration

use crate::Args;
use clap::ValueEnum;
use std::{
    ffi::OsString,
    num::NonZeroUsize,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

/// Final process configuration
///
/// This is the digested form of [`Args`]. Please refer to [`Args`] to know
/// more about individual fields.
#[allow(missing_docs)]
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Config {
    /// Location of the intermediate (token, count) store
    pub intermediate: PathBuf,

    /// Location of the final (lemma, pos, count) table
    pub output: PathBuf,

    /// Subset of the configuration that affects shard acquisition
    pub fetch: FetchConfig,

    // Other fields have the same meaning as in Args
    pub stage: Stage,
    pub store_mode: StoreMode,
    pub strict: bool,
    pub tmp_dir: PathBuf,
    pub parallel_shards: NonZeroUsize,
    pub sort_chunk: NonZeroUsize,
    pub merge_fan_in: NonZeroUsize,
}
//
impl Config {
    /// Determine process configuration from CLI arguments
    pub(crate) fn new(args: Args) -> Arc<Self> {
        let retry_delay = args.retry_delay();
        let Args {
            sources: _,
            sources_file: _,
            intermediate,
            output,
            stage,
            store_mode,
            strict,
            tmp_dir,
            download_tool,
            fetch_retries,
            retry_delay: _,
            parallel_shards,
            sort_chunk,
            merge_fan_in,
        } = args;
        Arc::new(Self {
            intermediate,
            output,
            fetch: FetchConfig {
                download_dir: tmp_dir.clone(),
                download_tool,
                retries: fetch_retries,
                retry_delay,
            },
            stage,
            store_mode,
            strict,
            tmp_dir,
            parallel_shards,
            sort_chunk,
            merge_fan_in,
        })
    }

    /// Configuration for unit tests, with every file inside of `dir`
    #[cfg(test)]
    pub fn for_tests(dir: &Path) -> Self {
        Self {
            intermediate: dir.join("freq.tsv"),
            output: dir.join("word_pos_freq.tsv"),
            fetch: FetchConfig {
                download_dir: dir.to_owned(),
                download_tool: DownloadTool::None,
                retries: 0,
                retry_delay: Duration::ZERO,
            },
            stage: Stage::All,
            store_mode: StoreMode::Append,
            strict: false,
            tmp_dir: dir.to_owned(),
            parallel_shards: NonZeroUsize::MIN,
            sort_chunk: NonZeroUsize::new(1000).unwrap(),
            merge_fan_in: NonZeroUsize::new(64).unwrap(),
        }
    }
}

/// Subset of the configuration that affects shard acquisition
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct FetchConfig {
    /// Directory where remote shards are downloaded
    pub download_dir: PathBuf,

    /// External download program, tried before the built-in HTTP client
    pub download_tool: DownloadTool,

    /// Number of extra attempts after a failed download
    pub retries: u32,

    /// Delay before the first retry, later retries wait proportionally longer
    pub retry_delay: Duration,
}

/// Processing stages to be run
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, ValueEnum)]
pub enum Stage {
    /// Aggregate shards into the intermediate store, then rank it
    All,

    /// Only aggregate shards into the intermediate store
    Aggregate,

    /// Only rank a pre-existing intermediate store
    Rank,
}
//
impl Stage {
    /// Truth that shards must be aggregated
    pub fn aggregates(self) -> bool {
        matches!(self, Self::All | Self::Aggregate)
    }

    /// Truth that the intermediate store must be ranked
    pub fn ranks(self) -> bool {
        matches!(self, Self::All | Self::Rank)
    }
}

/// Treatment of a pre-existing intermediate store
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, ValueEnum)]
pub enum StoreMode {
    /// Append new records after existing ones
    Append,

    /// Discard existing records and start over
    Fresh,

    /// Discard records from unfinished shards, then skip finished shards
    Resume,
}

/// External programs that can download remote shards
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, ValueEnum)]
pub enum DownloadTool {
    /// GNU wget
    Wget,

    /// curl
    Curl,

    /// Only use the built-in HTTP client
    None,
}
//
impl DownloadTool {
    /// Program name and arguments that download `url` into `dst`
    pub fn command(self, url: &str, dst: &Path) -> Option<(&'static str, Vec<OsString>)> {
        let (program, flags): (_, &[&str]) = match self {
            Self::Wget => ("wget", &["-q", "-O"]),
            Self::Curl => ("curl", &["-fsSL", "-o"]),
            Self::None => return None,
        };
        let mut args = flags.iter().map(OsString::from).collect::<Vec<_>>();
        args.push(dst.into());
        args.push(url.into());
        Some((program, args))
    }
}
