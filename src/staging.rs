// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Allocate the per-target host staging tree and derive served paths from it.
// Author: Lukas Bower
#![forbid(unsafe_code)]

use std::fs;
use std::path::{Component, Path, PathBuf};

use log::{debug, error};
use tempfile::TempDir;

use crate::config::StagingConfig;
use crate::error::{BootError, Phase};

/// Host-side staging tree exclusive to one target's orchestrator.
///
/// `base` is the directory the host serves to devices (over TFTP or HTTP);
/// `dir` is where this target stages its artifacts. Relative paths and URLs
/// handed to devices are always computed against `base`.
#[derive(Debug)]
pub struct StagingArea {
    base: PathBuf,
    dir: PathBuf,
    _owned: Option<TempDir>,
}

impl StagingArea {
    /// Apply the working-directory policy for `target`.
    pub fn from_config(config: &StagingConfig, target: &str) -> Result<Self, BootError> {
        if !config.use_default_tmpdir {
            match &config.alternative_dir {
                Some(alt) if config.alternative_create_tmpdir => {
                    return Self::fresh_under(alt, target);
                }
                Some(alt) => {
                    fs::create_dir_all(alt).map_err(|err| {
                        BootError::operation(Phase::Stage, format!("create {}: {err}", alt.display()))
                    })?;
                    debug!("staging {target} directly in {}", alt.display());
                    return Ok(Self {
                        base: alt.clone(),
                        dir: alt.clone(),
                        _owned: None,
                    });
                }
                None => {
                    error!(
                        "use_default_tmpdir is disabled for {target} but no alternative_dir is set; \
                         falling back to {}",
                        config.image_tmpdir.display()
                    );
                }
            }
        }
        Self::fresh_under(&config.image_tmpdir, target)
    }

    fn fresh_under(base: &Path, target: &str) -> Result<Self, BootError> {
        fs::create_dir_all(base).map_err(|err| {
            BootError::operation(Phase::Stage, format!("create {}: {err}", base.display()))
        })?;
        let owned = tempfile::Builder::new()
            .prefix(&format!("{target}-"))
            .tempdir_in(base)
            .map_err(|err| {
                BootError::operation(
                    Phase::Stage,
                    format!("allocate staging dir under {}: {err}", base.display()),
                )
            })?;
        let dir = owned.path().to_path_buf();
        debug!("staging {target} in {}", dir.display());
        Ok(Self {
            base: base.to_path_buf(),
            dir,
            _owned: Some(owned),
        })
    }

    /// Directory served to devices.
    #[must_use]
    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Directory owned by this target.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Allocate a fresh directory under the target's staging dir for `kind`.
    pub fn artifact_dir(&self, kind: &str) -> Result<PathBuf, BootError> {
        let dir = self.dir.join(kind);
        fs::create_dir_all(&dir).map_err(|err| {
            BootError::operation(Phase::Stage, format!("create {}: {err}", dir.display()))
        })?;
        Ok(dir)
    }

    /// Allocate a scratch directory removed when the returned guard drops.
    pub fn scratch(&self, prefix: &str) -> Result<TempDir, BootError> {
        tempfile::Builder::new()
            .prefix(prefix)
            .tempdir_in(&self.dir)
            .map_err(|err| {
                BootError::operation(
                    Phase::Stage,
                    format!("allocate scratch dir under {}: {err}", self.dir.display()),
                )
            })
    }

    /// Path of `path` relative to the served base, with `/` separators.
    pub fn relative_path(&self, path: &Path) -> Result<String, BootError> {
        let rel = path.strip_prefix(&self.base).map_err(|_| {
            BootError::operation(
                Phase::Stage,
                format!(
                    "{} is outside the served directory {}",
                    path.display(),
                    self.base.display()
                ),
            )
        })?;
        let parts: Vec<String> = rel
            .components()
            .filter_map(|component| match component {
                Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
                _ => None,
            })
            .collect();
        Ok(parts.join("/"))
    }

    /// URL of `path` below `image_url`, as fetched by network-booting devices.
    pub fn http_url(&self, image_url: &str, path: &Path) -> Result<String, BootError> {
        let rel = self.relative_path(path)?;
        Ok(format!("{}/{rel}", image_url.trim_end_matches('/')))
    }
}
