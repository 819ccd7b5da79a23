// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Own one target and drive deploy, boot and filesystem access through its bootloader.
// Author: Lukas Bower
#![forbid(unsafe_code)]

use std::path::Path;

use anyhow::anyhow;
use log::{debug, info};

use crate::artifact::{ArtifactResolver, Deployment};
use crate::bridge::{nfs_access, TarballBridge};
use crate::config::{millis, validate_config, Patterns, TargetConfig};
use crate::console::Console;
use crate::download::{Downloader, HttpDownloader};
use crate::error::BootError;
use crate::fallback::{AccessBody, BootTarget, NoFallback};
use crate::power::{self, BootAttempt, PowerSwitch, ResetKind, ShellPowerSwitch};
use crate::request::DeploymentRequest;
use crate::session::BootSession;
use crate::staging::StagingArea;
use crate::strategy::BootStrategy;
use crate::template::{self, BootStep, BootTemplates};
use crate::uimage::{RamdiskWrapper, UImageWrapper};

/// Per-target owner of the console, staging tree and boot session.
pub struct Orchestrator<C: Console> {
    config: TargetConfig,
    patterns: Patterns,
    staging: StagingArea,
    templates: BootTemplates,
    console: C,
    session: BootSession,
    strategy: Option<BootStrategy>,
    deployment: Option<Deployment>,
    template_override: Option<String>,
    downloader: Box<dyn Downloader + Send>,
    wrapper: Box<dyn RamdiskWrapper + Send>,
    switch: Option<Box<dyn PowerSwitch + Send>>,
    fallback: Box<dyn BootTarget + Send>,
}

impl<C: Console> Orchestrator<C> {
    /// Validate `config` and take ownership of `console`.
    ///
    /// A hard reset switch is installed when `power.hard_reset_command` is
    /// set. Targets without a fallback refuse the `none` strategy.
    pub fn new(config: TargetConfig, console: C) -> Result<Self, BootError> {
        validate_config(&config)?;
        let patterns = Patterns::compile(&config)?;
        let staging = StagingArea::from_config(&config.staging, &config.name)?;
        let templates = BootTemplates::new(config.boot_cmds.clone());
        let downloader = HttpDownloader::new(millis(config.network.download_timeout_ms));
        let wrapper = UImageWrapper::new(config.bootloader.uimage_arch);
        let switch = ShellPowerSwitch::from_config(&config.power)
            .map(|switch| Box::new(switch) as Box<dyn PowerSwitch + Send>);
        let fallback = NoFallback::new(config.name.clone());
        Ok(Self {
            config,
            patterns,
            staging,
            templates,
            console,
            session: BootSession::new(),
            strategy: None,
            deployment: None,
            template_override: None,
            downloader: Box::new(downloader),
            wrapper: Box::new(wrapper),
            switch,
            fallback: Box::new(fallback),
        })
    }

    /// Replace the artifact downloader.
    #[must_use]
    pub fn with_downloader(mut self, downloader: impl Downloader + Send + 'static) -> Self {
        self.downloader = Box::new(downloader);
        self
    }

    /// Replace the ramdisk header tool.
    #[must_use]
    pub fn with_ramdisk_wrapper(mut self, wrapper: impl RamdiskWrapper + Send + 'static) -> Self {
        self.wrapper = Box::new(wrapper);
        self
    }

    /// Install a power switch, enabling hard resets.
    #[must_use]
    pub fn with_power_switch(mut self, switch: impl PowerSwitch + Send + 'static) -> Self {
        self.switch = Some(Box::new(switch));
        self
    }

    /// Install the boot path used when no bootloader manages the target.
    #[must_use]
    pub fn with_fallback(mut self, fallback: impl BootTarget + Send + 'static) -> Self {
        self.fallback = Box::new(fallback);
        self
    }

    /// Stage a kernel deployment and prepare its boot commands.
    ///
    /// The strategy is classified before anything else happens; an unknown
    /// name fails without touching the console or the staging tree.
    pub fn deploy(&mut self, request: &DeploymentRequest) -> Result<(), BootError> {
        let strategy = BootStrategy::classify(&request.bootloader)?;
        self.begin_deployment(strategy, request);
        if !strategy.is_bootloader_managed() {
            info!("{}: no bootloader, delegating deployment", self.config.name);
            return self.fallback.deploy_artifacts(request);
        }
        let deployment = self.resolve_with(|resolver| resolver.resolve(strategy, &request.artifacts))?;
        self.install(deployment)
    }

    /// Stage a prebuilt image.
    ///
    /// Network-booting targets serve the image over HTTP. Other strategies
    /// hand the image to the fallback, which then owns boot and access.
    pub fn deploy_image(&mut self, request: &DeploymentRequest) -> Result<(), BootError> {
        let strategy = BootStrategy::classify(&request.bootloader)?;
        self.begin_deployment(strategy, request);
        if strategy != BootStrategy::Ipxe {
            info!(
                "{}: {strategy} does not boot prebuilt images, delegating deployment",
                self.config.name
            );
            self.strategy = Some(BootStrategy::None);
            return self.fallback.deploy_image(request);
        }
        let deployment = self.resolve_with(|resolver| resolver.resolve_image(request.image.as_deref()))?;
        self.install(deployment)
    }

    /// Bring the device to the test prompt, booting at most once.
    ///
    /// Returns the reset used, or `None` when the device was already booted
    /// or a fallback handled the boot.
    pub fn ensure_booted(&mut self) -> Result<Option<ResetKind>, BootError> {
        if !self.deployed_strategy()?.is_bootloader_managed() {
            self.fallback.attempt_boot()?;
            return Ok(None);
        }
        let steps = if self.session.is_booted() {
            Vec::new()
        } else {
            self.render_boot_commands()?
        };
        let attempt = BootAttempt {
            config: &self.config,
            patterns: &self.patterns,
            steps: &steps,
            nfs_active: self.nfsroot().is_some(),
        };
        power::ensure_booted(
            &mut self.console,
            &mut self.session,
            self.switch.as_deref_mut(),
            &attempt,
        )
    }

    /// Run `body` against `directory` on the device.
    ///
    /// An NFS-rooted deployment works on the exported tree directly; anything
    /// else goes through the tarball bridge. The device is booted first when
    /// needed.
    pub fn with_filesystem_access<T, F>(
        &mut self,
        partition: Option<u32>,
        directory: &str,
        body: F,
    ) -> Result<T, BootError>
    where
        F: FnOnce(&Path) -> anyhow::Result<T>,
    {
        if !self.deployed_strategy()?.is_bootloader_managed() {
            return self.fallback_access(partition, directory, body);
        }
        if !self.session.is_booted() {
            self.ensure_booted()?;
        }
        if let Some(partition) = partition {
            info!(
                "{}: partition {partition} ignored, accessing the live root filesystem",
                self.config.name
            );
        }
        if let Some(root) = self.nfsroot().map(Path::to_path_buf) {
            return nfs_access(&root, directory, body);
        }
        TarballBridge::new(&mut self.console, &self.config, &self.patterns, &self.staging)
            .access(directory, body)
    }

    /// Boot steps for the staged deployment, rendered with its tags.
    pub fn render_boot_commands(&self) -> Result<Vec<BootStep>, BootError> {
        let deployment = self.deployment.as_ref().ok_or_else(|| {
            BootError::Config(format!("{}: no bootloader deployment is staged", self.config.name))
        })?;
        let (name, lines) = self
            .templates
            .select(self.template_override.as_deref(), deployment.default_template)?;
        debug!("{}: rendering boot template {name}", self.config.name);
        template::steps(name, lines, &deployment.tags)
    }

    /// Target configuration.
    #[must_use]
    pub fn config(&self) -> &TargetConfig {
        &self.config
    }

    /// Boot session state.
    #[must_use]
    pub fn session(&self) -> &BootSession {
        &self.session
    }

    /// Strategy governing the current deployment.
    #[must_use]
    pub fn strategy(&self) -> Option<BootStrategy> {
        self.strategy
    }

    /// Resolved bootloader deployment, if one is staged.
    #[must_use]
    pub fn deployment(&self) -> Option<&Deployment> {
        self.deployment.as_ref()
    }

    /// Host staging tree.
    #[must_use]
    pub fn staging(&self) -> &StagingArea {
        &self.staging
    }

    /// Owned console.
    #[must_use]
    pub fn console(&self) -> &C {
        &self.console
    }

    /// Owned console, mutably.
    pub fn console_mut(&mut self) -> &mut C {
        &mut self.console
    }

    fn begin_deployment(&mut self, strategy: BootStrategy, request: &DeploymentRequest) {
        self.session.reset();
        self.strategy = Some(strategy);
        self.deployment = None;
        self.template_override = request
            .boot_cmds
            .clone()
            .or_else(|| self.config.bootloader.boot_cmds.clone());
        info!(
            "{}: deploying with {strategy} (target_type={}, rootfs_type={})",
            self.config.name,
            request.target_type.as_deref().unwrap_or("unspecified"),
            request.rootfs_type.as_deref().unwrap_or("unspecified"),
        );
    }

    fn resolve_with<F>(&self, resolve: F) -> Result<Deployment, BootError>
    where
        F: FnOnce(&ArtifactResolver<'_>) -> Result<Deployment, BootError>,
    {
        let image_url = self.config.image_url();
        let resolver = ArtifactResolver::new(
            &self.staging,
            &*self.downloader,
            &*self.wrapper,
            &self.config.network.server_ip,
            &image_url,
        );
        resolve(&resolver)
    }

    fn install(&mut self, deployment: Deployment) -> Result<(), BootError> {
        let (name, lines) = self
            .templates
            .select(self.template_override.as_deref(), deployment.default_template)?;
        template::render(name, lines, &deployment.tags)?;
        info!(
            "{}: staged {} tag(s) for template {name}",
            self.config.name,
            deployment.tags.len()
        );
        self.deployment = Some(deployment);
        Ok(())
    }

    fn deployed_strategy(&self) -> Result<BootStrategy, BootError> {
        self.strategy.ok_or_else(|| {
            BootError::Config(format!("{}: nothing has been deployed", self.config.name))
        })
    }

    fn nfsroot(&self) -> Option<&Path> {
        self.deployment.as_ref().and_then(|deployment| deployment.nfsroot.as_deref())
    }

    fn fallback_access<T, F>(
        &mut self,
        partition: Option<u32>,
        directory: &str,
        body: F,
    ) -> Result<T, BootError>
    where
        F: FnOnce(&Path) -> anyhow::Result<T>,
    {
        let mut body = Some(body);
        let mut out = None;
        let mut call = |path: &Path| -> anyhow::Result<()> {
            let body = body
                .take()
                .ok_or_else(|| anyhow!("filesystem access body called twice"))?;
            out = Some(body(path)?);
            Ok(())
        };
        self.fallback.filesystem_access(partition, directory, &mut call)?;
        out.ok_or_else(|| BootError::Access(anyhow!("fallback returned without running the access body")))
    }
}

impl<C: Console> BootTarget for Orchestrator<C> {
    fn deploy_artifacts(&mut self, request: &DeploymentRequest) -> Result<(), BootError> {
        self.deploy(request)
    }

    fn deploy_image(&mut self, request: &DeploymentRequest) -> Result<(), BootError> {
        Orchestrator::deploy_image(self, request)
    }

    fn attempt_boot(&mut self) -> Result<(), BootError> {
        self.ensure_booted().map(|_| ())
    }

    fn filesystem_access(
        &mut self,
        partition: Option<u32>,
        directory: &str,
        body: &mut AccessBody<'_>,
    ) -> Result<(), BootError> {
        self.with_filesystem_access(partition, directory, |path| body(path))
    }
}
