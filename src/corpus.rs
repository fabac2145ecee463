//! Reduction of a set of shards into the intermediate store

use crate::{
    config::Config,
    fetch::{FetchError, Fetcher},
    progress::{ProgressReport, Work},
    shard::{self, ShardCounts},
    store::IntermediateStore,
    Result,
};
use anyhow::Context;
use futures::{stream, StreamExt};
use std::{
    fmt::{self, Display},
    sync::Arc,
    time::{Duration, Instant},
};
use tokio_util::sync::CancellationToken;

/// What happened while reducing shards into the intermediate store
#[derive(Debug, Default)]
pub struct CorpusSummary {
    /// Number of shards that were attempted
    pub attempted: usize,

    /// Number of shards that were fully appended to the store
    pub succeeded: usize,

    /// Number of shards that a previous run already appended to the store
    pub already_done: usize,

    /// Shards that were skipped, and why
    pub skipped: Vec<(Box<str>, anyhow::Error)>,

    /// Number of records appended to the store
    pub rows: u64,

    /// Truth that processing was interrupted before all shards were attempted
    pub cancelled: bool,
}
//
impl Display for CorpusSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Aggregated {}/{} shards into {} records",
            self.succeeded, self.attempted, self.rows
        )?;
        if self.already_done > 0 {
            write!(f, ", {} shards were already done", self.already_done)?;
        }
        if self.cancelled {
            write!(f, ", interrupted")?;
        }
        for (source, error) in &self.skipped {
            write!(f, "\n  skipped {source}: {error:#}")?;
        }
        Ok(())
    }
}

/// Fetch and aggregate every shard, appending the results to the
/// intermediate store in the order where shards are listed
///
/// A token's counts are never merged across shards: a token that appears in
/// N shards gets N records. Shards that cannot be fetched or decoded are
/// skipped, unless `config.strict` is set, in which case the run is aborted.
/// Cancellation takes effect between two shard appends.
pub async fn accumulate(
    config: Arc<Config>,
    sources: Vec<Box<str>>,
    report: &ProgressReport,
    cancel: CancellationToken,
) -> Result<CorpusSummary> {
    // Open the store, and figure out which shards still need processing
    let (mut store, completed) =
        IntermediateStore::open(&config.intermediate, config.store_mode).await?;
    let mut summary = CorpusSummary::default();
    let pending = sources
        .into_iter()
        .filter(|source| {
            let done = completed.contains(source);
            if done {
                log::info!("Skipping {source}, which was already aggregated");
                summary.already_done += 1;
            }
            !done
        })
        .collect::<Vec<_>>();
    let shards_bar = report.add("Aggregating shards", Work::Steps(pending.len() as u64));

    // Fetch and aggregate up to parallel_shards shards at a time, but get the
    // results in order
    let fetcher = Arc::new(Fetcher::new(config.clone(), reqwest::Client::new()));
    let mut shards = stream::iter(pending)
        .map(|source| {
            let fetcher = fetcher.clone();
            let report = report.clone();
            async move {
                let start = Instant::now();
                let result = process_shard(&fetcher, &source, &report).await;
                (source, result, start.elapsed())
            }
        })
        .buffered(config.parallel_shards.get());

    // Append the results to the store one shard at a time
    loop {
        let next = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                summary.cancelled = true;
                break;
            }
            next = shards.next() => next,
        };
        let Some((source, result, elapsed)) = next else {
            break;
        };
        summary.attempted += 1;
        match result {
            Ok(counts) => {
                let lines = counts.lines();
                let rows = store.append_shard(&source, counts.into_rows()).await?;
                report.println(format!(
                    "{source}: {lines} lines reduced to {rows} records in {}",
                    format_elapsed(elapsed)
                ));
                log::info!("Appended {rows} records from {source} ({lines} lines) in {elapsed:?}");
                summary.succeeded += 1;
                summary.rows += rows as u64;
            }
            Err(e) if config.strict => {
                log::error!("Aborting on failure to process {source}: {e:#}");
                return Err(e.context(format!("processing {source}")));
            }
            Err(e) => {
                let class = if e.downcast_ref::<FetchError>().is_some() {
                    "fetch"
                } else {
                    "decode"
                };
                log::warn!("Skipping {source} after a {class} failure: {e:#}");
                report.println(format!(
                    "{source}: skipped after {} ({e:#})",
                    format_elapsed(elapsed)
                ));
                summary.skipped.push((source, e));
            }
        }
        shards_bar.make_progress(1);
    }
    shards_bar.finish();
    log::info!(
        "Aggregated {}/{} shards, {} skipped",
        summary.succeeded,
        summary.attempted,
        summary.skipped.len()
    );
    Ok(summary)
}

/// Fetch a shard and total the match counts of its tokens
async fn process_shard(
    fetcher: &Fetcher,
    source: &str,
    report: &ProgressReport,
) -> Result<ShardCounts> {
    let mut shard = fetcher.fetch(source).await?;
    let bytes = report.add(format!("Reading {source}"), Work::Bytes(shard.len()));
    let counts = shard::aggregate(shard.reader(), &bytes)
        .await
        .with_context(|| format!("aggregating {source}"));
    bytes.finish();
    counts
}

/// Display a duration the way status messages do
fn format_elapsed(elapsed: Duration) -> String {
    format!("{:.2}s", elapsed.as_secs_f64())
}
