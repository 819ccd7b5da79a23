// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Parse deployment requests handed over by the job layer.
// Author: Lukas Bower
#![forbid(unsafe_code)]

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::artifact::ArtifactSet;

/// One deployment: where the artifacts are and how the target boots them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeploymentRequest {
    /// Operating system family of the image (informational).
    #[serde(default)]
    pub target_type: Option<String>,
    /// Bootloader strategy name (`u_boot`, `ipxe`, `uefi`, `none`).
    pub bootloader: String,
    /// Artifact locators.
    #[serde(default)]
    pub artifacts: ArtifactSet,
    /// Root filesystem type requested by the job (informational).
    #[serde(default)]
    pub rootfs_type: Option<String>,
    /// Boot command template overriding the deployment default.
    #[serde(default)]
    pub boot_cmds: Option<String>,
    /// Prebuilt disk or ISO image for image deployments.
    #[serde(default)]
    pub image: Option<String>,
}

impl DeploymentRequest {
    /// Request for `bootloader` with the given artifacts.
    #[must_use]
    pub fn new(bootloader: impl Into<String>, artifacts: ArtifactSet) -> Self {
        Self {
            bootloader: bootloader.into(),
            artifacts,
            ..Self::default()
        }
    }

    /// Return `true` when the request names a prebuilt image.
    #[must_use]
    pub fn is_image(&self) -> bool {
        self.image.is_some()
    }

    /// Parse YAML (a superset of JSON, so JSON documents parse too).
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("invalid deployment request")
    }

    /// Load a request, choosing the format from the file extension.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read deployment request {}", path.display()))?;
        let is_json = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        if is_json {
            serde_json::from_str(&text)
                .with_context(|| format!("invalid deployment request JSON in {}", path.display()))
        } else {
            Self::from_yaml_str(&text)
                .with_context(|| format!("invalid deployment request {}", path.display()))
        }
    }
}
