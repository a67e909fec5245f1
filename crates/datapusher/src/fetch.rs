//! Source file download
//!
//! The body is streamed into an anonymous temp file, so memory use does not
//! grow with file size. Size is capped both from `Content-Length` and while
//! streaming, because servers may omit or misreport it.

use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::time::Duration;

use datapusher_common::checksum::ContentHasher;
use flate2::read::GzDecoder;
use futures::StreamExt;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::{redirect, Client};
use tracing::{debug, info};
use url::Url;

use crate::config::FetchConfig;
use crate::error::{JobError, Result};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// A downloaded source file, stored on disk
#[derive(Debug)]
pub struct SourceFile {
    file: File,
    pub content_type: Option<String>,
    /// Bytes received over the wire
    pub size: u64,
    /// Hex digest of the bytes received
    pub hash: String,
    /// The body was gzip-compressed and has been inflated
    pub decompressed: bool,
}

impl SourceFile {
    /// Wrap an existing file, e.g. a local fixture
    pub fn from_file(mut file: File, content_type: Option<String>, hash: String) -> std::io::Result<Self> {
        let size = file.seek(SeekFrom::End(0))?;
        file.rewind()?;
        Ok(Self {
            file,
            content_type,
            size,
            hash,
            decompressed: false,
        })
    }

    /// A handle positioned at the start of the content
    ///
    /// Handles share one file offset, so only one may be read at a time.
    pub fn reopen(&self) -> std::io::Result<File> {
        let mut file = self.file.try_clone()?;
        file.rewind()?;
        Ok(file)
    }
}

/// Downloads resource files with size, time and redirect guards
pub struct Fetcher {
    client: Client,
    config: FetchConfig,
}

impl Fetcher {
    pub fn new(config: &FetchConfig, ssl_verify: bool) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .redirect(redirect::Policy::limited(config.max_redirects))
            .danger_accept_invalid_certs(!ssl_verify)
            .user_agent(concat!("datapusher/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| JobError::download(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            config: config.clone(),
        })
    }

    /// Download `url`, sending `api_key` for files uploaded to CKAN itself
    pub async fn fetch(&self, url: &str, api_key: Option<&str>) -> Result<SourceFile> {
        let url = Url::parse(url)
            .map_err(|e| JobError::download(format!("Invalid resource URL '{}': {}", url, e)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(JobError::download(format!(
                "Only http and https resources can be fetched, got '{}'",
                url
            )));
        }

        info!(url = %url, "Fetching source file");

        let mut request = self.client.get(url.clone());
        if let Some(key) = api_key {
            request = request.header(AUTHORIZATION, key);
        }

        let response = request.send().await.map_err(|e| request_error(&url, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(JobError::download(format!(
                "Source returned HTTP {} for {}",
                status, url
            )));
        }

        let max = self.config.max_content_length;
        if let Some(declared) = response.content_length().filter(|len| *len > max) {
            return Err(too_large(&url, declared, max));
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string());

        let mut file = tempfile::tempfile().map_err(io_error)?;
        let mut hasher = ContentHasher::new(self.config.hash_algorithm);
        let mut size = 0u64;

        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| request_error(&url, e))?;
            size += chunk.len() as u64;
            if size > max {
                return Err(too_large(&url, size, max));
            }
            hasher.update(&chunk);
            file.write_all(&chunk).map_err(io_error)?;
        }
        file.flush().map_err(io_error)?;

        let hash = hasher.finalize();
        info!(
            url = %url,
            bytes = size,
            content_type = content_type.as_deref().unwrap_or("unknown"),
            hash = %hash,
            "Downloaded source file"
        );

        let mut source = SourceFile {
            file,
            content_type,
            size,
            hash,
            decompressed: false,
        };

        if is_gzip(&mut source.file).map_err(io_error)? {
            source.file = inflate(&source.file, max)?;
            source.decompressed = true;
        }

        Ok(source)
    }
}

fn is_gzip(file: &mut File) -> std::io::Result<bool> {
    file.rewind()?;
    let mut magic = [0u8; 2];
    let read = file.read(&mut magic)?;
    file.rewind()?;
    Ok(read == 2 && magic == GZIP_MAGIC)
}

/// Inflate a gzip file into a new temp file, keeping the same size cap
fn inflate(compressed: &File, max: u64) -> Result<File> {
    let mut input = compressed.try_clone().map_err(io_error)?;
    input.rewind().map_err(io_error)?;

    let mut decoder = GzDecoder::new(BufReader::new(input)).take(max + 1);
    let mut output = tempfile::tempfile().map_err(io_error)?;
    let written = std::io::copy(&mut decoder, &mut output)
        .map_err(|e| JobError::unsupported_format(format!("Corrupt gzip data: {}", e)))?;

    if written > max {
        return Err(JobError::download(format!(
            "Decompressed content exceeds the maximum of {} bytes",
            max
        )));
    }

    debug!(bytes = written, "Inflated gzip source");
    output.rewind().map_err(io_error)?;
    Ok(output)
}

fn request_error(url: &Url, err: reqwest::Error) -> JobError {
    if err.is_timeout() {
        JobError::download(format!("Timed out downloading {}", url))
    } else if err.is_redirect() {
        JobError::download(format!("Too many redirects fetching {}", url))
    } else {
        JobError::download(format!("Failed to fetch {}: {}", url, err))
    }
}

fn too_large(url: &Url, size: u64, max: u64) -> JobError {
    JobError::download(format!(
        "Content of {} is too large: {} bytes, maximum is {} bytes",
        url, size, max
    ))
}

fn io_error(err: std::io::Error) -> JobError {
    JobError::download(format!("Failed to store downloaded file: {}", err))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;

    fn temp_with(bytes: &[u8]) -> File {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(bytes).unwrap();
        file.rewind().unwrap();
        file
    }

    #[test]
    fn test_is_gzip_detects_magic() {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"a,b\n1,2\n").unwrap();
        let compressed = encoder.finish().unwrap();

        assert!(is_gzip(&mut temp_with(&compressed)).unwrap());
        assert!(!is_gzip(&mut temp_with(b"a,b\n")).unwrap());
        assert!(!is_gzip(&mut temp_with(b"")).unwrap());
    }

    #[test]
    fn test_inflate_round_trip_and_cap() {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"a,b\n1,2\n").unwrap();
        let compressed = temp_with(&encoder.finish().unwrap());

        let mut inflated = inflate(&compressed, 1024).unwrap();
        let mut text = String::new();
        inflated.read_to_string(&mut text).unwrap();
        assert_eq!(text, "a,b\n1,2\n");

        let err = inflate(&compressed, 4).unwrap_err();
        assert_eq!(err.error_type(), "Download Error");
    }

    #[test]
    fn test_reopen_starts_at_beginning() {
        let source = SourceFile::from_file(temp_with(b"x,y\n"), None, "h".to_string()).unwrap();
        assert_eq!(source.size, 4);

        let mut first = source.reopen().unwrap();
        let mut buf = String::new();
        first.read_to_string(&mut buf).unwrap();

        let mut second = source.reopen().unwrap();
        let mut again = String::new();
        second.read_to_string(&mut again).unwrap();
        assert_eq!(buf, again);
    }
}
