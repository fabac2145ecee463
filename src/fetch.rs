//! Acquisition of dataset shards from local storage or from the network

use crate::{config::Config, temp::TempFile, Result};
use anyhow::Context;
use futures::StreamExt;
use reqwest::{Response, Url};
use std::{
    io::{self, ErrorKind},
    path::Path,
    process::Stdio,
    sync::Arc,
};
use tokio::{
    fs::File,
    io::AsyncWriteExt,
    process::Command,
};
use tokio_util::io::StreamReader;

/// Reasons why a shard could not be acquired
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// The shard URL does not end with a usable file name
    #[error("cannot infer a download file name from {0}")]
    InvalidSource(Box<str>),

    /// Every attempt to acquire the shard failed
    #[error("failed to fetch {shard} after {attempts} attempt(s)")]
    Failed {
        /// Shard that could not be acquired
        shard: Box<str>,

        /// Number of attempts that were made
        attempts: u32,

        /// Error from the last attempt
        #[source]
        cause: Box<dyn std::error::Error + Send + Sync>,
    },
}

/// Where a shard comes from
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Source<'a> {
    /// File that is already present on this machine
    Local(&'a Path),

    /// File that must be downloaded first
    Remote {
        /// Location of the file
        url: &'a str,

        /// Name under which the file is downloaded
        file_name: Box<str>,
    },
}
//
impl<'a> Source<'a> {
    /// Tell local paths from http(s) URLs
    pub fn classify(source: &'a str) -> Result<Self, FetchError> {
        if !(source.starts_with("http://") || source.starts_with("https://")) {
            return Ok(Self::Local(Path::new(source)));
        }
        let invalid = || FetchError::InvalidSource(source.into());
        let url = Url::parse(source).map_err(|_| invalid())?;
        let file_name = url
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .filter(|name| !name.is_empty())
            .ok_or_else(invalid)?;
        Ok(Self::Remote {
            url: source,
            file_name: file_name.into(),
        })
    }
}

/// Shard that is ready to be read from the start
///
/// If the shard had to be downloaded, the downloaded file is deleted once
/// this is dropped, whether the shard was fully read or not.
#[derive(Debug)]
pub struct FetchedShard {
    /// Shard contents
    file: File,

    /// Size of the shard in bytes
    len: u64,

    /// Downloaded file, if any
    _download: Option<TempFile>,
}
//
impl FetchedShard {
    /// Open a shard file
    async fn open(path: &Path, download: Option<TempFile>) -> Result<Self> {
        let file = File::open(path)
            .await
            .with_context(|| format!("opening {}", path.display()))?;
        let len = file
            .metadata()
            .await
            .with_context(|| format!("querying the size of {}", path.display()))?
            .len();
        Ok(Self {
            file,
            len,
            _download: download,
        })
    }

    /// Compressed shard contents
    pub fn reader(&mut self) -> &mut File {
        &mut self.file
    }

    /// Compressed shard size in bytes
    pub fn len(&self) -> u64 {
        self.len
    }
}

/// Shard acquisition mechanism
#[derive(Debug)]
pub struct Fetcher {
    /// Acquisition configuration
    config: Arc<Config>,

    /// Built-in HTTP client, used when the external download tool fails
    client: reqwest::Client,
}
//
impl Fetcher {
    /// Set up shard acquisition
    pub fn new(config: Arc<Config>, client: reqwest::Client) -> Self {
        Self { config, client }
    }

    /// Make a shard available for reading
    pub async fn fetch(&self, source: &str) -> Result<FetchedShard, FetchError> {
        let failed = |attempts, cause: anyhow::Error| FetchError::Failed {
            shard: source.into(),
            attempts,
            cause: cause.into(),
        };
        match Source::classify(source)? {
            Source::Local(path) => FetchedShard::open(path, None)
                .await
                .map_err(|e| failed(1, e)),
            Source::Remote { url, file_name } => {
                let fetch = &self.config.fetch;
                let download = TempFile::new(fetch.download_dir.join(&*file_name));
                let max_attempts = fetch.retries.saturating_add(1);
                let mut attempt = 1;
                loop {
                    let error = match self.download(url, download.path()).await {
                        Ok(()) => break,
                        Err(e) => e,
                    };
                    if attempt >= max_attempts {
                        return Err(failed(attempt, error));
                    }
                    let delay = fetch.retry_delay * attempt;
                    log::warn!(
                        "Download attempt {attempt}/{max_attempts} of {url} failed ({error:#}), retrying in {delay:?}"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                let path = download.path().to_owned();
                FetchedShard::open(&path, Some(download))
                    .await
                    .map_err(|e| failed(attempt, e))
            }
        }
    }

    /// Download a file with the external tool, or the HTTP client if that fails
    async fn download(&self, url: &str, dst: &Path) -> Result<()> {
        if let Some((program, args)) = self.config.fetch.download_tool.command(url, dst) {
            match run_download_tool(program, args).await {
                Ok(()) => return Ok(()),
                Err(e) => log::info!(
                    "{program} could not download {url} ({e:#}), falling back to the built-in HTTP client"
                ),
            }
        }
        self.download_http(url, dst).await
    }

    /// Download a file with the built-in HTTP client
    async fn download_http(&self, url: &str, dst: &Path) -> Result<()> {
        // Start the download
        let context = || format!("downloading {url}");
        let response = self
            .client
            .get(url)
            .send()
            .await
            .and_then(Response::error_for_status)
            .with_context(context)?;
        let expected_len = response.content_length();

        // Stream the response body into the destination file
        let mut body = StreamReader::new(
            response
                .bytes_stream()
                .map(|res| res.map_err(|e| io::Error::new(ErrorKind::Other, Box::new(e)))),
        );
        let mut file = File::create(dst)
            .await
            .with_context(|| format!("creating {}", dst.display()))?;
        let len = tokio::io::copy(&mut body, &mut file)
            .await
            .with_context(context)?;
        file.flush().await.with_context(context)?;

        // Reject truncated downloads
        if let Some(expected_len) = expected_len {
            anyhow::ensure!(
                len == expected_len,
                "download of {url} stopped after {len}/{expected_len} bytes"
            );
        }
        Ok(())
    }
}

/// Run an external download program to completion
async fn run_download_tool(program: &str, args: Vec<std::ffi::OsString>) -> Result<()> {
    let status = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .status()
        .await
        .with_context(|| format!("starting {program}"))?;
    anyhow::ensure!(status.success(), "{program} exited with {status}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::DownloadTool, testing};

    fn fetcher(dir: &Path) -> Fetcher {
        Fetcher::new(Arc::new(Config::for_tests(dir)), reqwest::Client::new())
    }

    #[test]
    fn classify_sources() {
        assert_eq!(
            Source::classify("data/1-00000-of-00024.gz").unwrap(),
            Source::Local(Path::new("data/1-00000-of-00024.gz"))
        );
        assert_eq!(
            Source::classify(
                "http://storage.googleapis.com/books/ngrams/books/20200217/eng/1-00000-of-00024.gz"
            )
            .unwrap(),
            Source::Remote {
                url: "http://storage.googleapis.com/books/ngrams/books/20200217/eng/1-00000-of-00024.gz",
                file_name: "1-00000-of-00024.gz".into(),
            }
        );
        assert_eq!(
            Source::classify("https://example.com/shard.gz?sig=abc#frag").unwrap(),
            Source::Remote {
                url: "https://example.com/shard.gz?sig=abc#frag",
                file_name: "shard.gz".into(),
            }
        );
    }

    #[test]
    fn reject_urls_without_file_name() {
        for url in ["http://example.com", "http://example.com/", "https://example.com/dir/"] {
            assert!(matches!(
                Source::classify(url),
                Err(FetchError::InvalidSource(_))
            ));
        }
    }

    #[tokio::test]
    async fn local_shards_are_not_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("local.gz");
        std::fs::write(&path, b"not really gzip").unwrap();
        let shard = fetcher(dir.path())
            .fetch(path.to_str().unwrap())
            .await
            .unwrap();
        assert_eq!(shard.len(), 15);
        drop(shard);
        assert!(path.exists());
    }

    #[tokio::test]
    async fn missing_local_shard() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.gz");
        let result = fetcher(dir.path()).fetch(path.to_str().unwrap()).await;
        assert!(matches!(result, Err(FetchError::Failed { attempts: 1, .. })));
    }

    #[tokio::test]
    async fn invalid_url() {
        let dir = tempfile::tempdir().unwrap();
        let result = fetcher(dir.path()).fetch("https://example.com/").await;
        assert!(matches!(result, Err(FetchError::InvalidSource(_))));
    }

    #[tokio::test]
    async fn http_download_is_deleted_after_use() {
        let dir = tempfile::tempdir().unwrap();
        let body = b"shard bytes".to_vec();
        let url = testing::serve(body.clone(), "1-00000-of-00001.gz").await;
        let mut shard = fetcher(dir.path()).fetch(&url).await.unwrap();
        let download = dir.path().join("1-00000-of-00001.gz");
        assert!(download.exists());

        let mut contents = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(shard.reader(), &mut contents)
            .await
            .unwrap();
        assert_eq!(contents, body);
        drop(shard);
        assert!(!download.exists());
    }

    #[tokio::test]
    async fn download_tool_and_http_fallback_agree() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::for_tests(dir.path());
        config.fetch.download_tool = DownloadTool::Curl;
        let fetcher = Fetcher::new(Arc::new(config), reqwest::Client::new());
        let body = b"identical either way".to_vec();
        let url = testing::serve(body.clone(), "shard.gz").await;
        let mut shard = fetcher.fetch(&url).await.unwrap();
        let mut contents = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(shard.reader(), &mut contents)
            .await
            .unwrap();
        assert_eq!(contents, body);
    }

    #[tokio::test]
    async fn unreachable_url_exhausts_retries() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::for_tests(dir.path());
        config.fetch.retries = 2;
        let fetcher = Fetcher::new(Arc::new(config), reqwest::Client::new());
        let url = testing::unreachable_url("gone.gz").await;
        let result = fetcher.fetch(&url).await;
        assert!(matches!(result, Err(FetchError::Failed { attempts: 3, .. })));
        assert!(!dir.path().join("gone.gz").exists());
    }
}
