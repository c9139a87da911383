//! Payload download into the staging area.

use std::fs::{self, File};
use std::io::{self, BufWriter};
use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::blocking::Client;
use thiserror::Error;
use tracing::{debug, info};

use crate::hash::copy_hashed;

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                          (KHTML, like Gecko) Chrome/120.0 Safari/537.36";
const INVALID_FILE_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];
const MAX_COMPONENT_CHARS: usize = 50;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadedPayload {
    pub path: PathBuf,
    pub bytes: u64,
    pub sha256: String,
}

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("unsupported URL scheme in {0}")]
    UnsupportedScheme(String),
    #[error("server answered HTTP {status}")]
    Http { status: u16 },
    #[error("transfer failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("writing payload failed: {0}")]
    Io(#[from] io::Error),
}

pub trait Downloader: Send + Sync {
    /// Fetch `url` into `destination`, replacing any existing file.
    fn fetch(&self, url: &str, destination: &Path) -> Result<DownloadedPayload, DownloadError>;
}

/// Streams `http(s)://` payloads; `file://` URLs are copied from disk.
pub struct HttpDownloader {
    client: Client,
}

impl HttpDownloader {
    pub fn new(timeout: Duration) -> Result<Self, DownloadError> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()?;
        Ok(Self { client })
    }
}

impl Downloader for HttpDownloader {
    fn fetch(&self, url: &str, destination: &Path) -> Result<DownloadedPayload, DownloadError> {
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent)?;
        }
        let partial = destination.with_extension("part");

        let result = if let Some(local) = url.strip_prefix("file://") {
            let mut source = File::open(local)?;
            write_stream(&mut source, &partial)
        } else if url.starts_with("http://") || url.starts_with("https://") {
            debug!(url, "requesting payload");
            let mut response = self.client.get(url).send()?;
            let status = response.status();
            if !status.is_success() {
                return Err(DownloadError::Http {
                    status: status.as_u16(),
                });
            }
            write_stream(&mut response, &partial)
        } else {
            return Err(DownloadError::UnsupportedScheme(url.to_string()));
        };

        let (bytes, sha256) = match result {
            Ok(done) => done,
            Err(err) => {
                let _ = fs::remove_file(&partial);
                return Err(err.into());
            }
        };
        fs::rename(&partial, destination)?;
        info!(path = %destination.display(), bytes, "payload downloaded");
        Ok(DownloadedPayload {
            path: destination.to_path_buf(),
            bytes,
            sha256,
        })
    }
}

fn write_stream<R: io::Read>(reader: &mut R, path: &Path) -> io::Result<(u64, String)> {
    let mut writer = BufWriter::new(File::create(path)?);
    copy_hashed(reader, &mut writer)
}

pub fn sanitize_component(value: &str) -> String {
    value
        .trim()
        .chars()
        .map(|c| {
            if INVALID_FILE_CHARS.contains(&c) || c.is_control() {
                '_'
            } else {
                c
            }
        })
        .take(MAX_COMPONENT_CHARS)
        .collect()
}

/// `<manufacturer>_<device>_<version><ext>`. The extension comes from the URL
/// path when it has one and defaults to `.exe`; an unrecognised extension is
/// kept so verification can reject it.
pub fn payload_file_name(manufacturer: &str, device_name: &str, version: &str, url: &str) -> String {
    format!(
        "{}_{}_{}{}",
        sanitize_component(manufacturer),
        sanitize_component(device_name),
        sanitize_component(version),
        extension_from_url(url)
    )
}

fn extension_from_url(url: &str) -> String {
    let path = url.split(&['?', '#'][..]).next().unwrap_or_default();
    let last = path.rsplit('/').next().unwrap_or_default();
    last.rsplit_once('.')
        .map(|(_, ext)| ext)
        .filter(|ext| !ext.is_empty() && ext.len() <= 5 && ext.chars().all(|c| c.is_ascii_alphanumeric()))
        .map(|ext| format!(".{}", ext.to_ascii_lowercase()))
        .unwrap_or_else(|| ".exe".to_string())
}
