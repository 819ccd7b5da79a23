// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Capability interface shared by bootloader-managed and fallback boot paths.
// Author: Lukas Bower
#![forbid(unsafe_code)]

use std::path::Path;

use crate::error::BootError;
use crate::request::DeploymentRequest;

/// Scoped filesystem body passed across the capability boundary.
pub type AccessBody<'a> = dyn FnMut(&Path) -> anyhow::Result<()> + 'a;

/// Operations every boot path provides.
pub trait BootTarget {
    /// Stage a kernel-style deployment.
    fn deploy_artifacts(&mut self, request: &DeploymentRequest) -> Result<(), BootError>;

    /// Stage a prebuilt image deployment.
    fn deploy_image(&mut self, request: &DeploymentRequest) -> Result<(), BootError>;

    /// Bring the device to the test shell prompt.
    fn attempt_boot(&mut self) -> Result<(), BootError>;

    /// Run `body` against `directory` on the device.
    fn filesystem_access(
        &mut self,
        partition: Option<u32>,
        directory: &str,
        body: &mut AccessBody<'_>,
    ) -> Result<(), BootError>;
}

/// Stand-in for targets that have no non-bootloader boot path.
#[derive(Debug, Clone)]
pub struct NoFallback {
    target: String,
}

impl NoFallback {
    /// Refuse every operation on behalf of `target`.
    #[must_use]
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
        }
    }

    fn refuse(&self) -> Result<(), BootError> {
        Err(BootError::NoFallback(self.target.clone()))
    }
}

impl BootTarget for NoFallback {
    fn deploy_artifacts(&mut self, _request: &DeploymentRequest) -> Result<(), BootError> {
        self.refuse()
    }

    fn deploy_image(&mut self, _request: &DeploymentRequest) -> Result<(), BootError> {
        self.refuse()
    }

    fn attempt_boot(&mut self) -> Result<(), BootError> {
        self.refuse()
    }

    fn filesystem_access(
        &mut self,
        _partition: Option<u32>,
        _directory: &str,
        _body: &mut AccessBody<'_>,
    ) -> Result<(), BootError> {
        self.refuse()
    }
}
