// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Classify the bootloader family that governs a target deployment.
// Author: Lukas Bower
#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;

use crate::error::BootError;
use crate::tags;

/// Bootloader family active for one deployment.
///
/// A single value replaces per-family booleans so that two families can never
/// be active at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BootStrategy {
    /// First-stage loader (U-Boot) fetching artifacts from the host over TFTP.
    UBoot,
    /// Network boot (iPXE) fetching artifacts itself over HTTP.
    Ipxe,
    /// Firmware boot (UEFI shell or menu) loading host-served artifacts.
    Uefi,
    /// No bootloader; the non-bootloader boot path owns the device.
    None,
}

const UBOOT_TOKENS: &[&str] = &[
    tags::SERVER_IP,
    tags::KERNEL,
    tags::RAMDISK,
    tags::DTB,
    tags::ROOTFS,
    tags::NFSROOTFS,
    tags::BOOTLOADER,
    tags::FIRMWARE,
];
const IPXE_TOKENS: &[&str] = &[tags::KERNEL, tags::RAMDISK, tags::ROOTFS, tags::IMAGE];

impl BootStrategy {
    /// Every strategy, in declaration order.
    pub const ALL: [BootStrategy; 4] = [Self::UBoot, Self::Ipxe, Self::Uefi, Self::None];

    /// Map a deployment request's bootloader name onto a strategy.
    pub fn classify(name: &str) -> Result<Self, BootError> {
        match name.trim() {
            "u_boot" | "uboot" => Ok(Self::UBoot),
            "ipxe" => Ok(Self::Ipxe),
            "uefi" => Ok(Self::Uefi),
            "none" => Ok(Self::None),
            other => Err(BootError::UnsupportedStrategy(other.to_owned())),
        }
    }

    /// Canonical name accepted by [`BootStrategy::classify`].
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::UBoot => "u_boot",
            Self::Ipxe => "ipxe",
            Self::Uefi => "uefi",
            Self::None => "none",
        }
    }

    /// `true` when a bootloader console drives the boot.
    #[must_use]
    pub fn is_bootloader_managed(self) -> bool {
        !matches!(self, Self::None)
    }

    /// `true` when the device fetches artifacts by URL instead of host-relative path.
    #[must_use]
    pub fn serves_urls(self) -> bool {
        matches!(self, Self::Ipxe)
    }

    /// `true` when ramdisks must carry a legacy uImage header.
    #[must_use]
    pub fn wraps_ramdisk(self) -> bool {
        matches!(self, Self::UBoot)
    }

    /// Placeholder tokens a deployment under this strategy may populate.
    #[must_use]
    pub fn exposed_tokens(self) -> &'static [&'static str] {
        match self {
            Self::UBoot | Self::Uefi => UBOOT_TOKENS,
            Self::Ipxe => IPXE_TOKENS,
            Self::None => &[],
        }
    }
}

impl FromStr for BootStrategy {
    type Err = BootError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::classify(s)
    }
}

impl fmt::Display for BootStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_known_names() {
        assert_eq!(BootStrategy::classify("u_boot").unwrap(), BootStrategy::UBoot);
        assert_eq!(BootStrategy::classify("uboot").unwrap(), BootStrategy::UBoot);
        assert_eq!(BootStrategy::classify(" ipxe ").unwrap(), BootStrategy::Ipxe);
        assert_eq!(BootStrategy::classify("uefi").unwrap(), BootStrategy::Uefi);
        assert_eq!(BootStrategy::classify("none").unwrap(), BootStrategy::None);
    }

    #[test]
    fn rejects_unknown_names() {
        let err = BootStrategy::classify("grub").unwrap_err();
        assert!(matches!(err, BootError::UnsupportedStrategy(ref name) if name == "grub"));
        assert!(err.is_fatal());
    }

    #[test]
    fn names_round_trip() {
        for strategy in BootStrategy::ALL {
            assert_eq!(strategy.name().parse::<BootStrategy>().unwrap(), strategy);
        }
    }

    #[test]
    fn only_none_is_unmanaged() {
        for strategy in BootStrategy::ALL {
            assert_eq!(
                strategy.is_bootloader_managed(),
                strategy != BootStrategy::None
            );
        }
        assert!(BootStrategy::Ipxe.serves_urls());
        assert!(!BootStrategy::Uefi.serves_urls());
        assert!(!BootStrategy::Ipxe.exposed_tokens().contains(&tags::SERVER_IP));
    }
}
