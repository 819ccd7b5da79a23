// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Resolve deployment artifacts into staged files and boot template tags.
// Author: Lukas Bower
#![forbid(unsafe_code)]

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::download::{sha256_file, Downloader};
use crate::error::{BootError, Phase};
use crate::staging::StagingArea;
use crate::strategy::BootStrategy;
use crate::tags::{self, TagMap};
use crate::tarball;
use crate::template::{IMAGE_TEMPLATE, NFS_TEMPLATE, RAMDISK_TEMPLATE};
use crate::uimage::RamdiskWrapper;

/// Kind of artifact named by a deployment request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ArtifactKind {
    /// Kernel image.
    Kernel,
    /// Initial ramdisk.
    Ramdisk,
    /// Device-tree blob.
    Dtb,
    /// Root filesystem image.
    Rootfs,
    /// Root filesystem tarball exported over NFS.
    NfsRootfs,
    /// Bootloader image.
    Bootloader,
    /// Firmware blob.
    Firmware,
    /// Prebuilt disk or ISO image.
    Image,
}

impl ArtifactKind {
    /// Artifacts of a kernel deployment, in staging order.
    pub const KERNEL_DEPLOYMENT: [ArtifactKind; 7] = [
        Self::Kernel,
        Self::Ramdisk,
        Self::Dtb,
        Self::Rootfs,
        Self::NfsRootfs,
        Self::Bootloader,
        Self::Firmware,
    ];

    /// Lowercase name, also used as the staging subdirectory.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Kernel => "kernel",
            Self::Ramdisk => "ramdisk",
            Self::Dtb => "dtb",
            Self::Rootfs => "rootfs",
            Self::NfsRootfs => "nfsrootfs",
            Self::Bootloader => "bootloader",
            Self::Firmware => "firmware",
            Self::Image => "image",
        }
    }

    /// Template placeholder this artifact resolves.
    #[must_use]
    pub fn token(self) -> &'static str {
        match self {
            Self::Kernel => tags::KERNEL,
            Self::Ramdisk => tags::RAMDISK,
            Self::Dtb => tags::DTB,
            Self::Rootfs => tags::ROOTFS,
            Self::NfsRootfs => tags::NFSROOTFS,
            Self::Bootloader => tags::BOOTLOADER,
            Self::Firmware => tags::FIRMWARE,
            Self::Image => tags::IMAGE,
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Optional locator (path or URL) per artifact kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ArtifactSet {
    /// Kernel image; mandatory for bootloader-managed strategies.
    #[serde(default)]
    pub kernel: Option<String>,
    /// Initial ramdisk.
    #[serde(default)]
    pub ramdisk: Option<String>,
    /// Device-tree blob.
    #[serde(default)]
    pub dtb: Option<String>,
    /// Root filesystem image.
    #[serde(default)]
    pub rootfs: Option<String>,
    /// Root filesystem tarball to export over NFS.
    #[serde(default)]
    pub nfsrootfs: Option<String>,
    /// Bootloader image.
    #[serde(default)]
    pub bootloader: Option<String>,
    /// Firmware blob.
    #[serde(default)]
    pub firmware: Option<String>,
}

impl ArtifactSet {
    /// Locator for `kind`, if supplied.
    #[must_use]
    pub fn get(&self, kind: ArtifactKind) -> Option<&str> {
        let slot = match kind {
            ArtifactKind::Kernel => &self.kernel,
            ArtifactKind::Ramdisk => &self.ramdisk,
            ArtifactKind::Dtb => &self.dtb,
            ArtifactKind::Rootfs => &self.rootfs,
            ArtifactKind::NfsRootfs => &self.nfsrootfs,
            ArtifactKind::Bootloader => &self.bootloader,
            ArtifactKind::Firmware => &self.firmware,
            ArtifactKind::Image => return None,
        };
        slot.as_deref().filter(|locator| !locator.trim().is_empty())
    }

    /// Builder-style setter used by tests and the CLI.
    #[must_use]
    pub fn with(mut self, kind: ArtifactKind, locator: impl Into<String>) -> Self {
        let locator = Some(locator.into());
        match kind {
            ArtifactKind::Kernel => self.kernel = locator,
            ArtifactKind::Ramdisk => self.ramdisk = locator,
            ArtifactKind::Dtb => self.dtb = locator,
            ArtifactKind::Rootfs => self.rootfs = locator,
            ArtifactKind::NfsRootfs => self.nfsrootfs = locator,
            ArtifactKind::Bootloader => self.bootloader = locator,
            ArtifactKind::Firmware => self.firmware = locator,
            ArtifactKind::Image => {}
        }
        self
    }
}

/// Result of resolving a deployment: tags plus the state the boot needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Deployment {
    /// Strategy the tags were resolved for.
    pub strategy: BootStrategy,
    /// Placeholder substitutions for the boot command template.
    pub tags: TagMap,
    /// Template used when no override is named.
    pub default_template: &'static str,
    /// Host directory exported as the device's NFS root, if any.
    pub nfsroot: Option<PathBuf>,
}

/// Stages artifacts and derives the tag map for one strategy.
pub struct ArtifactResolver<'a> {
    staging: &'a StagingArea,
    downloader: &'a dyn Downloader,
    wrapper: &'a dyn RamdiskWrapper,
    server_ip: &'a str,
    image_url: &'a str,
}

impl<'a> ArtifactResolver<'a> {
    /// Create a resolver over the target's staging area.
    pub fn new(
        staging: &'a StagingArea,
        downloader: &'a dyn Downloader,
        wrapper: &'a dyn RamdiskWrapper,
        server_ip: &'a str,
        image_url: &'a str,
    ) -> Self {
        Self {
            staging,
            downloader,
            wrapper,
            server_ip,
            image_url,
        }
    }

    /// Stage `artifacts` and build the tag map for `strategy`.
    pub fn resolve(
        &self,
        strategy: BootStrategy,
        artifacts: &ArtifactSet,
    ) -> Result<Deployment, BootError> {
        let kernel = artifacts
            .get(ArtifactKind::Kernel)
            .ok_or(BootError::MissingArtifact(ArtifactKind::Kernel))?;
        match strategy {
            BootStrategy::UBoot | BootStrategy::Uefi => self.resolve_served(strategy, kernel, artifacts),
            BootStrategy::Ipxe => self.resolve_network(kernel, artifacts),
            BootStrategy::None => Err(BootError::Config(
                "strategy none has no bootloader artifacts to resolve".to_owned(),
            )),
        }
    }

    /// Stage a prebuilt image for a network-booting device.
    pub fn resolve_image(&self, image: Option<&str>) -> Result<Deployment, BootError> {
        let image = image
            .filter(|locator| !locator.trim().is_empty())
            .ok_or(BootError::NoImage)?;
        let base = self.served_base()?;
        let path = self.stage(ArtifactKind::Image, image)?;
        let mut tags = TagMap::new();
        tags.insert(tags::IMAGE, self.staging.http_url(base, &path)?);
        Ok(Deployment {
            strategy: BootStrategy::Ipxe,
            tags,
            default_template: IMAGE_TEMPLATE,
            nfsroot: None,
        })
    }

    fn resolve_served(
        &self,
        strategy: BootStrategy,
        kernel: &str,
        artifacts: &ArtifactSet,
    ) -> Result<Deployment, BootError> {
        if self.server_ip.trim().is_empty() {
            return Err(BootError::Config(format!(
                "network server_ip is required for {strategy} deployments"
            )));
        }
        let mut tags = TagMap::new();
        let mut default_template = RAMDISK_TEMPLATE;
        let mut nfsroot = None;
        tags.insert(tags::SERVER_IP, self.server_ip);

        let kernel = self.stage(ArtifactKind::Kernel, kernel)?;
        tags.insert(tags::KERNEL, self.staging.relative_path(&kernel)?);

        for kind in ArtifactKind::KERNEL_DEPLOYMENT.into_iter().skip(1) {
            let Some(locator) = artifacts.get(kind) else {
                continue;
            };
            let staged = self.stage(kind, locator)?;
            match kind {
                ArtifactKind::Ramdisk if strategy.wraps_ramdisk() => {
                    let ramdisk = self.ensure_ramdisk_header(staged);
                    tags.insert(kind.token(), self.staging.relative_path(&ramdisk)?);
                }
                ArtifactKind::NfsRootfs => {
                    let root = self.export_nfsroot(&staged)?;
                    tags.insert(kind.token(), root.to_string_lossy().into_owned());
                    default_template = NFS_TEMPLATE;
                    nfsroot = Some(root);
                }
                _ => tags.insert(kind.token(), self.staging.relative_path(&staged)?),
            }
        }

        Ok(Deployment {
            strategy,
            tags,
            default_template,
            nfsroot,
        })
    }

    fn resolve_network(&self, kernel: &str, artifacts: &ArtifactSet) -> Result<Deployment, BootError> {
        let base = self.served_base()?;
        let mut tags = TagMap::new();
        let kernel = self.stage(ArtifactKind::Kernel, kernel)?;
        tags.insert(tags::KERNEL, self.staging.http_url(base, &kernel)?);

        let initial = [ArtifactKind::Ramdisk, ArtifactKind::Rootfs]
            .into_iter()
            .find_map(|kind| artifacts.get(kind).map(|locator| (kind, locator)));
        if let Some((kind, locator)) = initial {
            let staged = self.stage(kind, locator)?;
            tags.insert(kind.token(), self.staging.http_url(base, &staged)?);
        }

        for kind in [
            ArtifactKind::Dtb,
            ArtifactKind::NfsRootfs,
            ArtifactKind::Bootloader,
            ArtifactKind::Firmware,
        ] {
            if artifacts.get(kind).is_some() {
                debug!("ipxe deployments ignore the {kind} artifact");
            }
        }

        Ok(Deployment {
            strategy: BootStrategy::Ipxe,
            tags,
            default_template: RAMDISK_TEMPLATE,
            nfsroot: None,
        })
    }

    fn stage(&self, kind: ArtifactKind, locator: &str) -> Result<PathBuf, BootError> {
        let dir = self.staging.artifact_dir(kind.name())?;
        let staged = self.downloader.fetch(locator, &dir)?;
        match sha256_file(&staged) {
            Ok(digest) => info!("staged {kind} {} sha256={digest}", staged.display()),
            Err(err) => warn!("staged {kind} {} but hashing failed: {err}", staged.display()),
        }
        Ok(staged)
    }

    fn ensure_ramdisk_header(&self, ramdisk: PathBuf) -> PathBuf {
        match self.wrapper.is_wrapped(&ramdisk) {
            Ok(true) => return ramdisk,
            Ok(false) => {}
            Err(err) => warn!("could not inspect ramdisk {}: {err}", ramdisk.display()),
        }
        let mut wrapped = ramdisk.clone().into_os_string();
        wrapped.push(".uboot");
        let wrapped = PathBuf::from(wrapped);
        info!("ramdisk {} needs a u-boot header, adding", ramdisk.display());
        match self.wrapper.wrap(&ramdisk, &wrapped) {
            Ok(()) => wrapped,
            Err(err) => {
                warn!(
                    "unable to add u-boot header to {}: {err}; using it unwrapped",
                    ramdisk.display()
                );
                let _ = fs::remove_file(&wrapped);
                ramdisk
            }
        }
    }

    /// Base URL of the served tree; it must name a host.
    fn served_base(&self) -> Result<&'a str, BootError> {
        let host = self
            .image_url
            .split_once("://")
            .and_then(|(_, rest)| rest.split('/').next())
            .unwrap_or_default();
        if host.is_empty() {
            return Err(BootError::Config(format!(
                "served url '{}' has no host; set network server_ip or network image_url",
                self.image_url
            )));
        }
        Ok(self.image_url)
    }

    fn export_nfsroot(&self, archive: &Path) -> Result<PathBuf, BootError> {
        let root = self
            .staging
            .artifact_dir(&format!("nfsroot-{:08x}", rand::random::<u32>()))?;
        tarball::unpack(archive, &root).map_err(|err| {
            BootError::operation(
                Phase::Stage,
                format!("extract {} into {}: {err}", archive.display(), root.display()),
            )
        })?;
        info!("nfs root extracted to {}", root.display());
        Ok(root)
    }
}
