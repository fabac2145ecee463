//! This program reduces the Google Books Ngram 1-gram exports, whose general
//! documentation you can find at
//! <https://storage.googleapis.com/books/ngrams/books/datasetsv3.html>, into a
//! table of (lemma, part-of-speech, match count) rows sorted by decreasing
//! popularity.
//!
//! Processing happens in two stages:
//!
//! - Aggregation streams each gzipped shard, sums the yearly match counts of
//!   every token within that shard, and appends one `token<TAB>count` record
//!   per distinct token to an intermediate store.
//! - Ranking splits every intermediate token into a lemma and a part-of-speech
//!   tag, then sorts the records by decreasing count (ties keep store order),
//!   spilling sorted runs to disk when the store does not fit in memory.

mod config;
mod corpus;
mod fetch;
mod progress;
mod rank;
mod shard;
mod split;
mod store;
mod temp;
#[cfg(test)]
mod testing;

use crate::{
    config::{Config, DownloadTool, Stage, StoreMode},
    progress::ProgressReport,
};
use anyhow::Context;
use clap::Parser;
use log::LevelFilter;
use std::{num::NonZeroUsize, path::PathBuf};
use tokio_util::sync::CancellationToken;

/// Rank the tokens of the Google Books Ngram 1-gram dataset by popularity
///
/// Match counts are summed over all years within each shard. Counts of a token
/// that appears in several shards are NOT merged: each shard contributes its
/// own row to the intermediate store and to the final table.
#[derive(Parser, Debug)]
#[command(version, author)]
struct Args {
    /// Shards to be processed, as local paths or http(s) URLs of gzipped
    /// 1-gram files
    sources: Vec<Box<str>>,

    /// File listing additional shards, one per line
    ///
    /// Blank lines and lines starting with '#' are ignored. Sources from this
    /// file are processed after those given on the command line.
    #[arg(short = 'f', long)]
    sources_file: Option<PathBuf>,

    /// Intermediate store of per-shard (token, count) records
    ///
    /// This file is appended to, never truncated, unless --store-mode=fresh.
    #[arg(short, long, default_value = "eng_freq.tsv")]
    intermediate: PathBuf,

    /// Final (lemma, pos, count) table, truncated on each run
    #[arg(short, long, default_value = "eng_word_pos_freq.tsv")]
    output: PathBuf,

    /// Processing stages to be run
    #[arg(long, value_enum, default_value_t = Stage::All)]
    stage: Stage,

    /// What to do with a pre-existing intermediate store
    #[arg(long, value_enum, default_value_t = StoreMode::Append)]
    store_mode: StoreMode,

    /// Abort the whole run when a shard cannot be fetched
    ///
    /// By default, such shards are reported and skipped, since the absence of
    /// a single shard should not block the processing of the rest.
    #[arg(long, default_value_t = false)]
    strict: bool,

    /// Directory where downloaded shards and sorted runs are stored
    #[arg(long, default_value = ".")]
    tmp_dir: PathBuf,

    /// External program used to download remote shards
    ///
    /// If this program is unavailable or fails, downloads fall back to a
    /// built-in HTTP client.
    #[arg(long, value_enum, default_value_t = DownloadTool::Wget)]
    download_tool: DownloadTool,

    /// Number of extra download attempts before a shard is given up on
    #[arg(long, default_value = "2")]
    fetch_retries: u32,

    /// Delay before the first download retry, in seconds
    ///
    /// Subsequent retries wait proportionally longer.
    #[arg(long, default_value = "5")]
    retry_delay: u64,

    /// Number of shards that are downloaded and aggregated concurrently
    ///
    /// Results are still appended to the intermediate store one shard at a
    /// time, in the order where shards were specified. Memory usage grows
    /// linearly with this setting.
    #[arg(short = 'j', long, default_value = "1")]
    parallel_shards: NonZeroUsize,

    /// Maximal number of records that are sorted in memory
    ///
    /// If the intermediate store holds more records than this, sorted runs of
    /// this size are spilled to the temporary directory and merged afterwards.
    #[arg(long, default_value = "4000000")]
    sort_chunk: NonZeroUsize,

    /// Maximal number of sorted runs that are merged at once
    #[arg(long, default_value = "64")]
    merge_fan_in: NonZeroUsize,
}
//
impl Args {
    /// Decode and validate CLI arguments
    pub fn parse_and_check() -> Result<Self> {
        Args::parse().check()
    }

    /// Check CLI arguments for basic sanity
    fn check(self) -> Result<Self> {
        anyhow::ensure!(
            self.merge_fan_in.get() >= rank::MIN_MERGE_FAN_IN,
            "merging sorted runs requires a fan-in of at least {}",
            rank::MIN_MERGE_FAN_IN
        );
        anyhow::ensure!(
            self.stage.aggregates() || (self.sources.is_empty() && self.sources_file.is_none()),
            "shard sources were specified, but the aggregation stage is disabled"
        );
        Ok(self)
    }

    /// Full list of shard sources, in processing order
    pub fn sources(&self) -> Result<Vec<Box<str>>> {
        let mut sources = self.sources.clone();
        if let Some(path) = &self.sources_file {
            let listing = std::fs::read_to_string(path)
                .with_context(|| format!("reading shard list from {}", path.display()))?;
            sources.extend(
                listing
                    .lines()
                    .map(str::trim)
                    .filter(|line| !line.is_empty() && !line.starts_with('#'))
                    .map(Box::from),
            );
        }
        Ok(sources)
    }

    /// First retry delay
    pub fn retry_delay(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.retry_delay)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Set up logging
    setup_logging().map_err(|e| anyhow::format_err!("{e}"))?;

    // Decode CLI arguments
    let args = Args::parse_and_check()?;
    let sources = args.sources()?;
    if args.stage.aggregates() {
        anyhow::ensure!(!sources.is_empty(), "no shard source was specified");
    }
    let config = Config::new(args);

    // Set up progress reporting
    let report = ProgressReport::new();

    // Stop gracefully when the user hits Ctrl+C, and right away if they insist
    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        let report = report.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            log::warn!("Received an interruption request, abandoning in-flight work");
            report.println("Interrupting, press Ctrl+C again to exit immediately");
            cancel.cancel();
            if tokio::signal::ctrl_c().await.is_ok() {
                log::error!("Received a second interruption request, exiting");
                std::process::exit(130);
            }
        }
    });

    // Reduce the shards into the intermediate store
    if config.stage.aggregates() {
        let summary = corpus::accumulate(config.clone(), sources, &report, cancel.clone()).await?;
        report.println(summary.to_string());
        if cancel.is_cancelled() {
            report.println("Interrupted, the ranking stage will not run");
            return Ok(());
        }
    }

    // Rank the intermediate records into the final table
    if config.stage.ranks() {
        match rank::rank_until_cancelled(&config, &report, &cancel).await? {
            Some(summary) => report.println(summary.to_string()),
            None => report.println(format!(
                "Interrupted, {} is incomplete",
                config.output.display()
            )),
        }
    }
    Ok(())
}

/// Use anyhow for Result type erasure
pub use anyhow::Result;

/// Case-sensitive token from the dataset, possibly carrying a part-of-speech
/// suffix (e.g. "run_VERB")
pub type Token = Box<str>;

/// Number of matches of a token, summed over some years
///
/// According to
/// https://github.com/orgtre/google-books-ngram-frequency?tab=readme-ov-file#the-underlying-corpus,
/// English can have >283 billion matches over 10 years, and some tokens like
/// "the" are a lot more common than others, so u32 would not be enough.
pub type MatchCount = u64;

/// Position of a record in the intermediate store, used as a sort tie-breaker
pub type Sequence = u64;

/// Set up logging
fn setup_logging() -> syslog::Result<()> {
    syslog::init(
        syslog::Facility::LOG_USER,
        if cfg!(feature = "log-trace") {
            LevelFilter::Trace
        } else if cfg!(debug_assertions) {
            LevelFilter::Debug
        } else {
            LevelFilter::Info
        },
        None,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check(args: &[&str]) -> Result<Args> {
        Args::try_parse_from(std::iter::once("ngram-pos-rank").chain(args.iter().copied()))?
            .check()
    }

    #[test]
    fn sources_require_aggregation() {
        assert!(check(&["a.gz"]).is_ok());
        assert!(check(&["--stage", "aggregate", "-f", "list.txt"]).is_ok());
        assert!(check(&["--stage", "rank"]).is_ok());
        assert!(check(&["--stage", "rank", "a.gz"]).is_err());
        assert!(check(&["--stage", "rank", "-f", "list.txt"]).is_err());
    }

    #[test]
    fn merge_needs_two_runs() {
        assert!(check(&["--merge-fan-in", "2", "a.gz"]).is_ok());
        assert!(check(&["--merge-fan-in", "1", "a.gz"]).is_err());
    }
}
