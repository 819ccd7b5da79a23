// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Stage artifact locators onto the host without decompressing them.
// Author: Lukas Bower
#![forbid(unsafe_code)]

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, info};
use sha2::{Digest, Sha256};

use crate::error::{BootError, Phase};

/// Fetches a locator into a host directory.
pub trait Downloader {
    /// Stage `locator` into `dest_dir` and return the staged file path.
    fn fetch(&self, locator: &str, dest_dir: &Path) -> Result<PathBuf, BootError>;
}

/// `ureq`-backed downloader for `http://`, `https://`, `file://` and plain paths.
///
/// Local paths are copied verbatim so every staged artifact lives under the
/// served directory.
pub struct HttpDownloader {
    agent: ureq::Agent,
}

impl HttpDownloader {
    /// Build a downloader whose requests are bounded by `timeout`.
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(timeout)
            .timeout(timeout)
            .build();
        Self { agent }
    }

    fn fetch_http(&self, url: &str, dest: &Path) -> Result<(), BootError> {
        let response = self.agent.get(url).call().map_err(|err| match err {
            ureq::Error::Status(code, _) => {
                BootError::operation(Phase::Download, format!("GET {url} returned {code}"))
            }
            ureq::Error::Transport(transport) => {
                BootError::operation(Phase::Download, format!("GET {url}: {transport}"))
            }
        })?;
        let mut reader = response.into_reader();
        let mut out = BufWriter::new(File::create(dest).map_err(|err| write_error(dest, err))?);
        let copied = io::copy(&mut reader, &mut out).and_then(|_| out.flush());
        drop(out);
        if let Err(err) = copied {
            if let Err(remove_err) = fs::remove_file(dest) {
                debug!("remove truncated {}: {remove_err}", dest.display());
            }
            return Err(BootError::operation(Phase::Download, format!("GET {url}: {err}")));
        }
        Ok(())
    }

    fn fetch_local(&self, src: &Path, dest: &Path) -> Result<(), BootError> {
        if src == dest {
            return Ok(());
        }
        fs::copy(src, dest).map_err(|err| {
            BootError::operation(
                Phase::Download,
                format!("copy {} to {}: {err}", src.display(), dest.display()),
            )
        })?;
        Ok(())
    }
}

impl Downloader for HttpDownloader {
    fn fetch(&self, locator: &str, dest_dir: &Path) -> Result<PathBuf, BootError> {
        let name = file_name(locator)?;
        let dest = dest_dir.join(&name);
        if locator.starts_with("http://") || locator.starts_with("https://") {
            info!("downloading {locator}");
            self.fetch_http(locator, &dest)?;
        } else {
            let src = Path::new(locator.strip_prefix("file://").unwrap_or(locator));
            debug!("staging local {}", src.display());
            self.fetch_local(src, &dest)?;
        }
        Ok(dest)
    }
}

fn write_error(path: &Path, err: io::Error) -> BootError {
    BootError::operation(Phase::Download, format!("create {}: {err}", path.display()))
}

/// Last path segment of a locator, ignoring query strings and fragments.
pub fn file_name(locator: &str) -> Result<String, BootError> {
    let without_query = locator.split(['?', '#']).next().unwrap_or(locator);
    let path = match without_query.split_once("://") {
        Some((_, rest)) => rest.split_once('/').map(|(_, path)| path).unwrap_or(""),
        None => without_query,
    };
    let name = path
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or_default();
    if name.is_empty() || name == "." || name == ".." {
        return Err(BootError::Config(format!(
            "cannot derive a file name from locator '{locator}'"
        )));
    }
    Ok(name.to_owned())
}

/// SHA-256 of a staged file, hex encoded, for the deployment log.
pub fn sha256_file(path: &Path) -> io::Result<String> {
    let mut hasher = Sha256::new();
    let mut file = File::open(path)?;
    io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}
