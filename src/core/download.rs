use crate::error::{Result, ToolbeltError};
use crate::utils::fs;
use crate::utils::runtime::outside_runtime;
use log::debug;
use reqwest::blocking::{Client, ClientBuilder};
use reqwest::header::USER_AGENT;
use std::fs::File;
use std::io::{ErrorKind, Read, Write};
use std::path::Path;

const USER_AGENT_VALUE: &str = concat!("toolbelt/", env!("CARGO_PKG_VERSION"));
const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// Downloads `url` into `destination` with a default client.
///
/// Safe to call from async code: the client lives and dies on a thread
/// outside the runtime.
pub fn download(url: &str, destination: &Path) -> Result<u64> {
    outside_runtime(|| -> Result<u64> { Downloader::new()?.download_file(url, destination) })
}

/// Client settings used by [`Downloader::new`].
///
/// There is no overall request timeout, so large bodies on slow links are
/// not cut off. Connection setup still fails on its own when the peer is
/// unreachable.
pub fn client_builder() -> ClientBuilder {
    Client::builder().timeout(None)
}

/// Reuses one HTTP client across downloads.
///
/// The blocking client drives its own runtime thread. Build and drop a
/// `Downloader` outside of async code; [`download`] takes care of that by
/// itself.
pub struct Downloader {
    client: Client,
}

impl Downloader {
    pub fn new() -> Result<Self> {
        let client = outside_runtime(|| client_builder().build())
            .map_err(|source| ToolbeltError::HttpClient { source })?;
        Ok(Self::with_client(client))
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    /// Streams the body of a GET on `url` into `destination` and returns the
    /// number of bytes written.
    ///
    /// The status code is not looked at: whatever body the server sends,
    /// error pages included, ends up in the file.
    pub fn download_file(&self, url: &str, destination: &Path) -> Result<u64> {
        outside_runtime(|| self.fetch(url, destination))
    }

    fn fetch(&self, url: &str, destination: &Path) -> Result<u64> {
        debug!("Downloading from {url} to {destination:?}");

        if let Some(parent) = destination.parent() {
            if !parent.as_os_str().is_empty() {
                fs::ensure_dir_exists(parent)?;
            }
        }

        let mut file = File::create(destination).map_err(ToolbeltError::filesystem(destination))?;

        let mut response = self
            .client
            .get(url)
            .header(USER_AGENT, USER_AGENT_VALUE)
            .send()
            .map_err(|source| ToolbeltError::Network {
                url: url.to_string(),
                source,
            })?;

        debug!("{url} answered {}", response.status());

        let mut buffer = vec![0u8; COPY_BUFFER_SIZE];
        let mut written = 0u64;
        loop {
            let n = match response.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(source) => {
                    return Err(ToolbeltError::Transfer {
                        url: url.to_string(),
                        source,
                    })
                }
            };
            file.write_all(&buffer[..n])
                .map_err(ToolbeltError::filesystem(destination))?;
            written += n as u64;
        }

        file.flush().map_err(ToolbeltError::filesystem(destination))?;
        debug!("Downloaded {written} bytes to {destination:?}");
        Ok(written)
    }
}
