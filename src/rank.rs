//! Ranking of intermediate records into the final (lemma, pos, count) table
//!
//! Records are ordered by decreasing count. Records with equal counts keep the
//! order in which they appear in the intermediate store, which is enforced by
//! tagging each record with its position in the store and using that as a
//! secondary sort key. This makes the output independent of how records were
//! partitioned into sorted runs, so the in-memory path and the external merge
//! path produce identical tables.

use crate::{
    config::Config,
    progress::{ProgressReport, Work},
    split::{split_token, SplitToken},
    store::StoreRecords,
    temp::TempFile,
    MatchCount, Result, Sequence,
};
use anyhow::Context;
use csv_async::{
    AsyncReaderBuilder, AsyncSerializer, AsyncWriterBuilder, QuoteStyle, Terminator,
};
use futures::{Stream, StreamExt};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::{
    cmp::Reverse,
    collections::BinaryHeap,
    fmt::{self, Display},
    path::{Path, PathBuf},
    pin::Pin,
};
use tokio::fs::File;
use tokio_util::sync::CancellationToken;

/// Intermediate record that went through token splitting
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
struct RankedRow {
    /// Total match count
    count: MatchCount,

    /// Position of the record in the intermediate store
    seq: Sequence,

    /// Base word form
    lemma: Box<str>,

    /// Part-of-speech tag
    pos: Box<str>,
}
//
impl RankedRow {
    /// Sort key: decreasing count, then increasing store position
    fn key(&self) -> (Reverse<MatchCount>, Sequence) {
        (Reverse(self.count), self.seq)
    }
}

/// Row of the final table
#[derive(Serialize)]
struct FinalRow<'row> {
    lemma: &'row str,
    pos: &'row str,
    count: MatchCount,
}

/// Destination of ranked rows
trait RowSink {
    /// Write down the next row
    async fn accept(&mut self, row: RankedRow) -> Result<()>;

    /// Make sure all rows were written
    async fn finish(self) -> Result<()>;
}

/// Create a TSV serializer that writes fields verbatim
async fn create_serializer(path: &Path) -> Result<AsyncSerializer<File>> {
    let file = File::create(path)
        .await
        .with_context(|| format!("creating {}", path.display()))?;
    Ok(AsyncWriterBuilder::new()
        .delimiter(b'\t')
        .has_headers(false)
        .quote_style(QuoteStyle::Never)
        .create_serializer(file))
}

/// Writer of the final table
struct TableWriter(AsyncSerializer<File>);
//
impl RowSink for TableWriter {
    async fn accept(&mut self, row: RankedRow) -> Result<()> {
        self.0
            .serialize(FinalRow {
                lemma: &row.lemma,
                pos: &row.pos,
                count: row.count,
            })
            .await
            .context("writing the final table")
    }

    async fn finish(mut self) -> Result<()> {
        self.0.flush().await.context("flushing the final table")
    }
}

/// Writer of a sorted run
struct RunWriter(AsyncSerializer<File>);
//
impl RowSink for RunWriter {
    async fn accept(&mut self, row: RankedRow) -> Result<()> {
        self.0.serialize(row).await.context("writing a sorted run")
    }

    async fn finish(mut self) -> Result<()> {
        self.0.flush().await.context("flushing a sorted run")
    }
}

/// Sorted runs that were spilled to disk
struct Runs {
    /// Directory where runs are stored
    dir: PathBuf,

    /// Identifier of the next run
    next_id: usize,

    /// Number of runs that were created
    created: usize,
}
//
impl Runs {
    /// Prepare to spill runs into some directory
    fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_owned(),
            next_id: 0,
            created: 0,
        }
    }

    /// Create a new run
    async fn create(&mut self) -> Result<(TempFile, RunWriter)> {
        let run = TempFile::new(self.dir.join(format!(
            "rank-run-{}-{}.tsv",
            std::process::id(),
            self.next_id
        )));
        self.next_id += 1;
        self.created += 1;
        let writer = RunWriter(create_serializer(run.path()).await?);
        Ok((run, writer))
    }

    /// Spill already sorted rows into a new run
    async fn spill(&mut self, rows: Vec<RankedRow>) -> Result<TempFile> {
        let (run, mut writer) = self.create().await?;
        log::debug!("Spilling {} sorted rows into {}", rows.len(), run.path().display());
        for row in rows {
            writer.accept(row).await?;
        }
        writer.finish().await?;
        Ok(run)
    }
}

/// Sort rows using all CPU cores
async fn sort_rows(mut rows: Vec<RankedRow>) -> Result<Vec<RankedRow>> {
    tokio::task::spawn_blocking(move || {
        rows.par_sort_unstable_by_key(RankedRow::key);
        rows
    })
    .await
    .context("sorting intermediate records")
}

/// Stream of rows from a sorted run
type RunRows = Pin<Box<dyn Stream<Item = csv_async::Result<RankedRow>>>>;

/// Open a sorted run for reading
async fn read_run(run: &TempFile) -> Result<RunRows> {
    let file = File::open(run.path())
        .await
        .with_context(|| format!("opening {}", run.path().display()))?;
    let rows = AsyncReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(false)
        .quoting(false)
        .terminator(Terminator::Any(b'\n'))
        .create_deserializer(file)
        .into_deserialize::<RankedRow>();
    Ok(Box::pin(rows))
}

/// Merge sorted runs into a sink
async fn merge(runs: &[TempFile], sink: &mut impl RowSink) -> Result<()> {
    // Open every run and look at its first row
    let mut readers = Vec::with_capacity(runs.len());
    let mut heads = Vec::with_capacity(runs.len());
    let mut heap = BinaryHeap::with_capacity(runs.len());
    for (idx, run) in runs.iter().enumerate() {
        let mut rows = read_run(run).await?;
        let head = rows.next().await.transpose().context("reading a sorted run")?;
        if let Some(row) = &head {
            heap.push(Reverse((row.key(), idx)));
        }
        readers.push(rows);
        heads.push(head);
    }

    // Repeatedly emit the row with the smallest key
    while let Some(Reverse((_key, idx))) = heap.pop() {
        let row = heads[idx].take().expect("runs in the heap should have a head row");
        sink.accept(row).await?;
        let next = readers[idx]
            .next()
            .await
            .transpose()
            .context("reading a sorted run")?;
        if let Some(row) = &next {
            heap.push(Reverse((row.key(), idx)));
        }
        heads[idx] = next;
    }
    Ok(())
}

/// What happened while ranking the intermediate store
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RankSummary {
    /// Number of rows written to the final table
    pub rows: u64,

    /// Number of malformed intermediate records that were skipped
    pub malformed: u64,

    /// Number of sorted runs that were spilled to disk
    pub runs: usize,

    /// Number of merge passes over the sorted runs
    pub merge_passes: usize,
}
//
impl Display for RankSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Ranked {} rows, skipped {} malformed intermediate records",
            self.rows, self.malformed
        )?;
        if self.runs > 0 {
            write!(
                f,
                " ({} sorted runs merged in {} passes)",
                self.runs, self.merge_passes
            )?;
        }
        Ok(())
    }
}

/// Smallest number of sorted runs that merging can make progress with
pub const MIN_MERGE_FAN_IN: usize = 2;

/// Rank the intermediate store into the final table, unless `cancel` fires
/// first
///
/// On cancellation, sorted runs are deleted and `None` is returned. The final
/// table may then be incomplete.
pub async fn rank_until_cancelled(
    config: &Config,
    report: &ProgressReport,
    cancel: &CancellationToken,
) -> Result<Option<RankSummary>> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => {
            log::warn!("Ranking of {} was interrupted", config.intermediate.display());
            Ok(None)
        }
        summary = rank(config, report) => summary.map(Some),
    }
}

/// Rank the intermediate store into the final table
///
/// At most `config.sort_chunk` records are held in memory. Larger stores are
/// sorted in runs that are spilled to `config.tmp_dir`, then merged, at most
/// `config.merge_fan_in` runs at a time.
pub async fn rank(config: &Config, report: &ProgressReport) -> Result<RankSummary> {
    // Read the intermediate store, spilling sorted runs whenever the in-memory
    // chunk is full
    let mut records = StoreRecords::open(&config.intermediate).await?;
    let reading = report.add("Reading intermediate records", Work::Bytes(records.len()));
    let chunk_len = config.sort_chunk.get();
    let mut runs = Runs::new(&config.tmp_dir);
    let mut spilled = Vec::new();
    let mut chunk = Vec::new();
    let mut seq: Sequence = 0;
    while let Some((token, count)) = records.next().await? {
        if chunk.len() == chunk_len {
            let sorted = sort_rows(std::mem::take(&mut chunk)).await?;
            spilled.push(runs.spill(sorted).await?);
        }
        let SplitToken { lemma, pos } = split_token(&token);
        chunk.push(RankedRow {
            count,
            seq,
            lemma: lemma.into(),
            pos: pos.into(),
        });
        seq += 1;
        if seq % 65536 == 0 {
            reading.set_progress(records.position());
        }
    }
    reading.finish();
    let mut summary = RankSummary {
        rows: seq,
        malformed: records.malformed(),
        ..Default::default()
    };

    // If everything fit in memory, sort and write out the final table directly
    let mut table = TableWriter(create_serializer(&config.output).await?);
    let sorted = sort_rows(chunk).await?;
    if spilled.is_empty() {
        for row in sorted {
            table.accept(row).await?;
        }
        table.finish().await?;
        return Ok(summary);
    }
    if !sorted.is_empty() {
        spilled.push(runs.spill(sorted).await?);
    }

    // Otherwise, merge runs until few enough remain for a final merge
    let fan_in = config.merge_fan_in.get().max(MIN_MERGE_FAN_IN);
    while spilled.len() > fan_in {
        summary.merge_passes += 1;
        log::info!(
            "Merging {} sorted runs, {fan_in} at a time",
            spilled.len()
        );
        let mut merged = Vec::with_capacity(spilled.len().div_ceil(fan_in));
        for group in spilled.chunks(fan_in) {
            let (run, mut writer) = runs.create().await?;
            merge(group, &mut writer).await?;
            writer.finish().await?;
            merged.push(run);
        }
        spilled = merged;
    }
    summary.merge_passes += 1;
    merge(&spilled, &mut table).await?;
    table.finish().await?;
    summary.runs = runs.created;
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{fmt::Write, num::NonZeroUsize};

    async fn rank_store(config: &Config, store: &str) -> (String, RankSummary) {
        tokio::fs::write(&config.intermediate, store).await.unwrap();
        let summary = rank(config, &ProgressReport::hidden()).await.unwrap();
        let table = tokio::fs::read_to_string(&config.output).await.unwrap();
        (table, summary)
    }

    #[tokio::test]
    async fn split_and_sort() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::for_tests(dir.path());
        let (table, summary) = rank_store(
            &config,
            "hello\t5\nrun_VERB\t20\n_NOUN_\t7\nbroken\nthe\t100\nthe\t50\n",
        )
        .await;
        assert_eq!(
            table,
            "the\t_\t100\nthe\t_\t50\nrun\tVERB\t20\n_NOUN_\t_NOUN_\t7\nhello\t_\t5\n"
        );
        assert_eq!(summary.rows, 5);
        assert_eq!(summary.malformed, 1);
        assert_eq!(summary.runs, 0);
    }

    #[tokio::test]
    async fn ties_keep_store_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::for_tests(dir.path());
        let store = "a\t10\nb\t10\nlow\t1\nc\t10\nhigh\t99\n";
        let expected = "high\t_\t99\na\t_\t10\nb\t_\t10\nc\t_\t10\nlow\t_\t1\n";
        for chunk in [1, 2, 3, 1000] {
            config.sort_chunk = NonZeroUsize::new(chunk).unwrap();
            let (table, _) = rank_store(&config, store).await;
            assert_eq!(table, expected, "with chunks of {chunk} records");
        }
    }

    #[tokio::test]
    async fn external_sort_matches_in_memory_sort() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::for_tests(dir.path());

        // Synthetic store with lots of ties and some awkward tokens
        let mut store = String::new();
        for i in 0u64..2000 {
            let token = match i % 5 {
                0 => format!("w{i}_NOUN"),
                1 => format!("_X{i}_"),
                2 => format!("\"q{i}"),
                3 => format!("_{i}"),
                _ => format!("plain{i}"),
            };
            writeln!(store, "{token}\t{}", (i * 7919) % 37).unwrap();
        }

        // Reference: stable in-memory sort
        let mut reference = store
            .lines()
            .map(|line| {
                let (token, count) = line.split_once('\t').unwrap();
                let SplitToken { lemma, pos } = split_token(token);
                (count.parse::<u64>().unwrap(), format!("{lemma}\t{pos}\t{count}\n"))
            })
            .collect::<Vec<_>>();
        reference.sort_by_key(|(count, _)| Reverse(*count));
        let reference = reference.into_iter().map(|(_, line)| line).collect::<String>();

        config.sort_chunk = NonZeroUsize::new(4000).unwrap();
        let (in_memory, summary) = rank_store(&config, &store).await;
        assert_eq!(summary.runs, 0);
        assert_eq!(in_memory, reference);

        config.sort_chunk = NonZeroUsize::new(64).unwrap();
        config.merge_fan_in = NonZeroUsize::new(4).unwrap();
        let (external, summary) = rank_store(&config, &store).await;
        assert_eq!(summary.rows, 2000);
        assert!(summary.merge_passes > 1);
        assert_eq!(external, reference);

        // Sorted runs are cleaned up
        let leftovers = std::fs::read_dir(dir.path())
            .unwrap()
            .filter(|entry| {
                let name = entry.as_ref().unwrap().file_name();
                name.to_string_lossy().starts_with("rank-run-")
            })
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn carriage_returns_belong_to_tokens() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::for_tests(dir.path());
        let store = "a\rb_NOUN\t5\nc\t3\nx\ty\rz_N\t5\nd\r\t7\n";
        let expected = "d\r\t_\t7\na\rb\tNOUN\t5\nc\t_\t3\n";
        for chunk in [1, 1000] {
            config.sort_chunk = NonZeroUsize::new(chunk).unwrap();
            let (table, summary) = rank_store(&config, store).await;
            assert_eq!(table, expected, "with chunks of {chunk} records");
            assert_eq!(summary.malformed, 1);
        }
    }

    #[tokio::test]
    async fn degenerate_fan_in_still_merges() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::for_tests(dir.path());
        config.sort_chunk = NonZeroUsize::MIN;
        config.merge_fan_in = NonZeroUsize::MIN;
        let (table, summary) = rank_store(&config, "a\t1\nb\t3\nc\t2\nd\t3\n").await;
        assert_eq!(table, "b\t_\t3\nd\t_\t3\nc\t_\t2\na\t_\t1\n");
        assert_eq!(summary.runs, 4 + 2);
        assert_eq!(summary.merge_passes, 2);
    }

    #[tokio::test]
    async fn cancelled_ranking_leaves_no_runs() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::for_tests(dir.path());
        config.sort_chunk = NonZeroUsize::MIN;
        tokio::fs::write(&config.intermediate, "a\t1\nb\t2\nc\t3\n")
            .await
            .unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let summary = rank_until_cancelled(&config, &ProgressReport::hidden(), &cancel)
            .await
            .unwrap();
        assert_eq!(summary, None);
        let leftovers = std::fs::read_dir(dir.path())
            .unwrap()
            .filter(|entry| {
                let name = entry.as_ref().unwrap().file_name();
                name.to_string_lossy().starts_with("rank-run-")
            })
            .count();
        assert_eq!(leftovers, 0);

        let summary =
            rank_until_cancelled(&config, &ProgressReport::hidden(), &CancellationToken::new())
                .await
                .unwrap()
                .unwrap();
        assert_eq!(summary.rows, 3);
    }

    #[tokio::test]
    async fn empty_store() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::for_tests(dir.path());
        let (table, summary) = rank_store(&config, "").await;
        assert_eq!(table, "");
        assert_eq!(summary, RankSummary::default());
    }
}
