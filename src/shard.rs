//! Per-shard aggregation of the gzipped 1-gram data files from Google
//!
//! Each line of a data file holds a token followed by whitespace-separated
//! `year,match_count,volume_count` triples. Within a shard, we only care about
//! the total number of matches of each token, summed over all years.

use crate::{progress::ProgressTracker, MatchCount, Result, Token};
use anyhow::Context;
use async_compression::tokio::bufread::GzipDecoder;
use std::collections::HashMap;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio_util::io::InspectReader;

/// Interval at which line counters are logged
const LINE_LOG_INTERVAL: u64 = 1 << 24;

/// Token and total match count from one line of a data file
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct ParsedLine<'line> {
    /// Token, as written in the data file
    pub token: &'line str,

    /// Sum of all well-formed yearly match counts
    pub total_matches: MatchCount,
}

/// Extract the token and total match count from one line of a data file
///
/// Malformed yearly triples are ignored, so a line whose triples are all
/// malformed has a total of 0. Only blank lines are rejected.
pub fn parse_line(line: &str) -> Option<ParsedLine<'_>> {
    let mut fields = line.split_whitespace();
    let token = fields.next()?;
    let total_matches = fields
        .filter_map(parse_match_count)
        .fold(0, MatchCount::saturating_add);
    Some(ParsedLine {
        token,
        total_matches,
    })
}

/// Extract the match count from a `year,match_count,volume_count` triple
fn parse_match_count(field: &str) -> Option<MatchCount> {
    let mut columns = field.splitn(3, ',');
    let (Some(_year), Some(match_count), Some(_volume_count)) =
        (columns.next(), columns.next(), columns.next())
    else {
        log::trace!("Ignored yearly data {field:?} without 3 columns");
        return None;
    };
    // Match counts are unsigned, so negative counts are malformed
    let match_count = match_count.parse().ok();
    if match_count.is_none() {
        log::trace!("Ignored yearly data {field:?} with an invalid match count");
    }
    match_count
}

/// Accumulator of match counts from a single data file
#[derive(Debug, Default)]
pub struct ShardAggregator {
    /// Total match count of each token seen so far
    counts: HashMap<Token, MatchCount>,

    /// Number of lines seen so far
    lines: u64,

    /// Number of lines without a token
    malformed_lines: u64,
}
//
impl ShardAggregator {
    /// Set up the accumulator
    pub fn new() -> Self {
        Self::default()
    }

    /// Integrate a line from the data file, without its line terminator
    pub fn add_line(&mut self, line: &[u8]) {
        self.lines += 1;
        if self.lines % LINE_LOG_INTERVAL == 0 {
            log::debug!(
                "Processed {} lines, found {} distinct tokens so far",
                self.lines,
                self.counts.len()
            );
        }

        // Reject lines that are not text or have no token
        let Some(ParsedLine {
            token,
            total_matches,
        }) = std::str::from_utf8(line).ok().and_then(parse_line)
        else {
            log::trace!("Ignored malformed line {:?}", String::from_utf8_lossy(line));
            self.malformed_lines += 1;
            return;
        };

        // Tokens that were seen before only need a counter update
        if let Some(count) = self.counts.get_mut(token) {
            *count = count.saturating_add(total_matches);
        } else {
            self.counts.insert(token.into(), total_matches);
        }
    }

    /// Export the accumulated match counts
    pub fn finish(self) -> ShardCounts {
        if self.malformed_lines > 0 {
            log::info!(
                "Ignored {} malformed lines out of {}",
                self.malformed_lines,
                self.lines
            );
        }
        ShardCounts {
            counts: self.counts,
            lines: self.lines,
        }
    }
}

/// Match counts accumulated from a single data file
#[derive(Debug, Default, Eq, PartialEq)]
pub struct ShardCounts {
    /// Total match count of each token
    counts: HashMap<Token, MatchCount>,

    /// Number of lines in the data file
    lines: u64,
}
//
impl ShardCounts {
    /// Number of distinct tokens
    pub fn len(&self) -> usize {
        self.counts.len()
    }

    /// Number of lines in the data file
    pub fn lines(&self) -> u64 {
        self.lines
    }

    /// Total match count of a token
    #[cfg(test)]
    pub fn get(&self, token: &str) -> Option<MatchCount> {
        self.counts.get(token).copied()
    }

    /// Emit one (token, total match count) row per distinct token, in no
    /// particular order
    pub fn into_rows(self) -> impl Iterator<Item = (Token, MatchCount)> {
        self.counts.into_iter()
    }
}

/// Decompress a gzipped data file and total the match counts of its tokens
///
/// `bytes` tracks how much of the compressed input was consumed.
pub async fn aggregate(
    gz_bytes: impl AsyncRead + Unpin,
    bytes: &ProgressTracker,
) -> Result<ShardCounts> {
    // Apply gzip decoder to compressed bytes. Data files may be made of
    // several concatenated gzip members.
    let gz_bytes = InspectReader::new(gz_bytes, |block: &[u8]| {
        bytes.make_progress(block.len() as u64)
    });
    let mut decoder = GzipDecoder::new(BufReader::new(gz_bytes));
    decoder.multiple_members(true);
    let mut text = BufReader::new(decoder);

    // Accumulate match counts line by line
    let mut aggregator = ShardAggregator::new();
    let mut line = Vec::new();
    loop {
        line.clear();
        let len = text
            .read_until(b'\n', &mut line)
            .await
            .context("decompressing data file")?;
        if len == 0 {
            break;
        }
        if line.last() == Some(&b'\n') {
            line.pop();
        }
        aggregator.add_line(&line);
    }
    Ok(aggregator.finish())
}
