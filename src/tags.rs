// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Hold resolved placeholder substitutions for boot command templates.
// Author: Lukas Bower
#![forbid(unsafe_code)]

use std::collections::BTreeMap;

/// Host address the device fetches host-served artifacts from.
pub const SERVER_IP: &str = "{SERVER_IP}";
/// Kernel image.
pub const KERNEL: &str = "{KERNEL}";
/// Initial ramdisk.
pub const RAMDISK: &str = "{RAMDISK}";
/// Device-tree blob.
pub const DTB: &str = "{DTB}";
/// Root filesystem image.
pub const ROOTFS: &str = "{ROOTFS}";
/// Host directory exported as the device's NFS root.
pub const NFSROOTFS: &str = "{NFSROOTFS}";
/// Bootloader image.
pub const BOOTLOADER: &str = "{BOOTLOADER}";
/// Firmware blob.
pub const FIRMWARE: &str = "{FIRMWARE}";
/// Prebuilt whole-disk or ISO image.
pub const IMAGE: &str = "{IMAGE}";

/// Every placeholder understood by boot command templates.
pub const KNOWN_TOKENS: &[&str] = &[
    SERVER_IP, KERNEL, RAMDISK, DTB, ROOTFS, NFSROOTFS, BOOTLOADER, FIRMWARE, IMAGE,
];

/// Ordered placeholder → value map.
///
/// Backed by a `BTreeMap` so iteration and logging are stable across runs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagMap {
    entries: BTreeMap<String, String>,
}

impl TagMap {
    /// Create an empty map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `token` to `value`, replacing any earlier value.
    pub fn insert(&mut self, token: &str, value: impl Into<String>) {
        self.entries.insert(token.to_owned(), value.into());
    }

    /// Look up the value for `token`.
    #[must_use]
    pub fn get(&self, token: &str) -> Option<&str> {
        self.entries.get(token).map(String::as_str)
    }

    /// Return `true` when `token` has a value.
    #[must_use]
    pub fn contains(&self, token: &str) -> bool {
        self.entries.contains_key(token)
    }

    /// Tokens present in the map, in sorted order.
    pub fn tokens(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Token/value pairs in sorted order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .map(|(token, value)| (token.as_str(), value.as_str()))
    }

    /// Number of populated tokens.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Return `true` when nothing has been resolved.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Return `true` when `token` is one of the template placeholders.
#[must_use]
pub fn is_known_token(token: &str) -> bool {
    KNOWN_TOKENS.contains(&token)
}
