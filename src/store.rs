//! Intermediate store of per-shard (token, count) records
//!
//! The store is a text file with one `token<TAB>count` record per line. It is
//! only ever appended to, one whole shard at a time. Next to it, a journal
//! file records, for every shard that was fully appended, the store length
//! after the append and the shard's source, as `length<TAB>source` lines. This
//! lets an interrupted run resume without duplicating or losing records.

use crate::{config::StoreMode, MatchCount, Result, Token};
use anyhow::Context;
use csv_async::{AsyncReader, AsyncReaderBuilder, ByteRecord, Terminator};
use std::{
    collections::HashSet,
    ffi::OsString,
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
};
use tokio::{
    fs::{File, OpenOptions},
    io::AsyncWriteExt,
};

/// Location of the journal associated with an intermediate store
pub fn journal_path(store: &Path) -> PathBuf {
    let mut path = OsString::from(store);
    path.push(".journal");
    path.into()
}

/// Append-only writer of the intermediate store
#[derive(Debug)]
pub struct IntermediateStore {
    /// Location of the store
    path: PathBuf,

    /// Store file, opened in append mode
    file: File,

    /// Length of the store, which only covers fully appended shards
    len: u64,

    /// Journal of fully appended shards, opened in append mode
    journal: File,
}
//
impl IntermediateStore {
    /// Open the store, and tell which shard sources are already in there
    ///
    /// Only [`StoreMode::Resume`] reports already stored shards. In this mode,
    /// records past the last journaled shard are discarded as they come from a
    /// shard that was not fully appended.
    pub async fn open(path: &Path, mode: StoreMode) -> Result<(Self, HashSet<Box<str>>)> {
        let journal_path = journal_path(path);
        let completed = if mode == StoreMode::Resume {
            Self::recover(path, &journal_path).await?
        } else {
            HashSet::new()
        };

        let open = |path: &Path| {
            let mut options = OpenOptions::new();
            options.create(true);
            if mode == StoreMode::Fresh {
                options.write(true).truncate(true);
            } else {
                options.append(true);
            }
            let path = path.to_owned();
            async move {
                options
                    .open(&path)
                    .await
                    .with_context(|| format!("opening {}", path.display()))
            }
        };
        let file = open(path).await?;
        let journal = open(&journal_path).await?;
        let len = file
            .metadata()
            .await
            .with_context(|| format!("querying the size of {}", path.display()))?
            .len();
        Ok((
            Self {
                path: path.to_owned(),
                file,
                len,
                journal,
            },
            completed,
        ))
    }

    /// Read the journal, truncate the store to the last journaled length, and
    /// return the set of journaled shard sources
    async fn recover(path: &Path, journal_path: &Path) -> Result<HashSet<Box<str>>> {
        // Without a journal, there is nothing to be recovered
        let journal = match tokio::fs::read_to_string(journal_path).await {
            Ok(journal) => journal,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                log::info!(
                    "No journal at {}, keeping {} as is",
                    journal_path.display(),
                    path.display()
                );
                return Ok(HashSet::new());
            }
            Err(e) => {
                return Err(e).with_context(|| format!("reading {}", journal_path.display()))
            }
        };

        // Collect journaled shards. A torn last line is ignored.
        let mut completed = HashSet::new();
        let mut journaled_len = 0;
        let mut valid_lines = String::new();
        for line in journal.split_inclusive('\n') {
            let entry = line
                .strip_suffix('\n')
                .and_then(|line| line.split_once('\t'))
                .and_then(|(len, source)| Some((len.parse::<u64>().ok()?, source)));
            let Some((len, source)) = entry else {
                log::warn!("Ignored malformed journal line {line:?}");
                continue;
            };
            journaled_len = len;
            completed.insert(source.into());
            valid_lines.push_str(line);
        }
        if valid_lines.len() != journal.len() {
            tokio::fs::write(journal_path, valid_lines)
                .await
                .with_context(|| format!("repairing {}", journal_path.display()))?;
        }

        // Drop records from shards that were not fully appended
        let store_len = match tokio::fs::metadata(path).await {
            Ok(metadata) => metadata.len(),
            Err(e) if e.kind() == ErrorKind::NotFound => 0,
            Err(e) => return Err(e).with_context(|| format!("querying {}", path.display())),
        };
        anyhow::ensure!(
            store_len >= journaled_len,
            "{} holds {store_len} bytes, but its journal says {journaled_len} bytes were stored",
            path.display()
        );
        if store_len > journaled_len {
            log::warn!(
                "Discarding {} bytes of unfinished shard data from {}",
                store_len - journaled_len,
                path.display()
            );
            let file = OpenOptions::new()
                .write(true)
                .open(path)
                .await
                .with_context(|| format!("opening {}", path.display()))?;
            file.set_len(journaled_len)
                .await
                .with_context(|| format!("truncating {}", path.display()))?;
        }
        Ok(completed)
    }

    /// Append all records from a shard
    ///
    /// Either all records make it to storage, or the store is left as it was
    /// before the call. Returns the number of appended records.
    pub async fn append_shard(
        &mut self,
        source: &str,
        rows: impl IntoIterator<Item = (Token, MatchCount)>,
    ) -> Result<usize> {
        // Format the records
        let mut buffer = Vec::new();
        let mut num_rows = 0;
        for (token, count) in rows {
            debug_assert!(
                !token.contains(['\t', '\n']),
                "tokens come from whitespace-separated fields"
            );
            writeln!(buffer, "{token}\t{count}").expect("writing to a Vec cannot fail");
            num_rows += 1;
        }

        // Append them, rolling back on failure
        let start = self.len;
        if let Err(e) = Self::write_durably(&mut self.file, &buffer).await {
            if let Err(rollback) = self.file.set_len(start).await {
                log::error!(
                    "Failed to remove partially appended records from {}: {rollback}",
                    self.path.display()
                );
            }
            return Err(e).with_context(|| {
                format!("appending records from {source} to {}", self.path.display())
            });
        }
        self.len = start + buffer.len() as u64;

        // Record that this shard is done
        let entry = format!("{}\t{source}\n", self.len);
        Self::write_durably(&mut self.journal, entry.as_bytes())
            .await
            .with_context(|| format!("journaling completion of {source}"))?;
        Ok(num_rows)
    }

    /// Write some bytes and make sure they reach storage
    async fn write_durably(file: &mut File, bytes: &[u8]) -> std::io::Result<()> {
        file.write_all(bytes).await?;
        file.flush().await?;
        file.sync_data().await
    }
}

/// Sequential reader of intermediate store records
///
/// Malformed records are skipped and counted.
pub struct StoreRecords {
    /// TSV decoder
    reader: AsyncReader<File>,

    /// Buffer for the current record
    record: ByteRecord,

    /// Total size of the store in bytes
    len: u64,

    /// Number of malformed records skipped so far
    malformed: u64,
}
//
impl StoreRecords {
    /// Start reading the store
    pub async fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .await
            .with_context(|| format!("opening {}", path.display()))?;
        let len = file
            .metadata()
            .await
            .with_context(|| format!("querying the size of {}", path.display()))?
            .len();
        let reader = AsyncReaderBuilder::new()
            .delimiter(b'\t')
            .has_headers(false)
            .flexible(true)
            .quoting(false)
            .terminator(Terminator::Any(b'\n'))
            .create_reader(file);
        Ok(Self {
            reader,
            record: ByteRecord::new(),
            len,
            malformed: 0,
        })
    }

    /// Fetch the next well-formed record
    pub async fn next(&mut self) -> Result<Option<(Token, MatchCount)>> {
        while self
            .reader
            .read_byte_record(&mut self.record)
            .await
            .context("reading the intermediate store")?
        {
            match parse_record(&self.record) {
                Some(record) => return Ok(Some(record)),
                None => {
                    log::trace!("Ignored malformed intermediate record {:?}", self.record);
                    self.malformed += 1;
                }
            }
        }
        Ok(None)
    }

    /// Number of bytes read so far
    pub fn position(&self) -> u64 {
        self.reader.position().byte()
    }

    /// Total size of the store in bytes
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Number of malformed records that were skipped
    pub fn malformed(&self) -> u64 {
        self.malformed
    }
}

/// Decode a `token<TAB>count` record
fn parse_record(record: &ByteRecord) -> Option<(Token, MatchCount)> {
    if record.len() != 2 {
        return None;
    }
    let token = std::str::from_utf8(record.get(0)?).ok()?;
    let count = std::str::from_utf8(record.get(1)?).ok()?.trim().parse().ok()?;
    Some((token.into(), count))
}
