// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Detect and add U-Boot legacy uImage headers on ramdisks.
// Author: Lukas Bower
#![forbid(unsafe_code)]

//! Legacy uImage header codec.
//!
//! U-Boot's `bootm` refuses a ramdisk without the 64-byte legacy header, so
//! headerless ramdisks are wrapped before they are staged. The layout matches
//! `mkimage -T ramdisk -C none`: big-endian fields, CRC-32 over the header
//! (with its own checksum zeroed) and over the payload.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::Path;
use std::str::FromStr;
use std::time::UNIX_EPOCH;

use flate2::Crc;
use serde::Deserialize;

/// Legacy image magic number.
pub const IH_MAGIC: u32 = 0x2705_1956;
/// Size of the legacy header in bytes.
pub const HEADER_LEN: usize = 64;
const NAME_LEN: usize = 32;

const IH_OS_LINUX: u8 = 5;
const IH_TYPE_RAMDISK: u8 = 3;
const IH_COMP_NONE: u8 = 0;

/// CPU architecture recorded in the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub enum UImageArch {
    /// 32-bit ARM.
    Arm,
    /// 64-bit ARM.
    Arm64,
    /// 32-bit x86.
    X86,
    /// 64-bit x86.
    X86_64,
    /// MIPS.
    Mips,
    /// PowerPC.
    PowerPc,
    /// RISC-V.
    RiscV,
}

impl UImageArch {
    fn code(self) -> u8 {
        match self {
            Self::Arm => 2,
            Self::X86 => 3,
            Self::Mips => 5,
            Self::PowerPc => 7,
            Self::Arm64 => 22,
            Self::X86_64 => 24,
            Self::RiscV => 26,
        }
    }
}

impl FromStr for UImageArch {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "arm" => Ok(Self::Arm),
            "arm64" | "aarch64" => Ok(Self::Arm64),
            "x86" | "i386" => Ok(Self::X86),
            "x86_64" => Ok(Self::X86_64),
            "mips" => Ok(Self::Mips),
            "powerpc" | "ppc" => Ok(Self::PowerPc),
            "riscv" => Ok(Self::RiscV),
            other => Err(format!("unknown uImage architecture '{other}'")),
        }
    }
}

impl TryFrom<String> for UImageArch {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Decoded legacy header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyHeader {
    /// Creation timestamp (seconds since the epoch).
    pub time: u32,
    /// Payload size in bytes.
    pub size: u32,
    /// Load address.
    pub load: u32,
    /// Entry point.
    pub entry: u32,
    /// CRC-32 of the payload.
    pub data_crc: u32,
    /// Operating system code.
    pub os: u8,
    /// Architecture code.
    pub arch: u8,
    /// Image type code.
    pub image_type: u8,
    /// Compression code.
    pub compression: u8,
    /// Image name, NUL padding stripped.
    pub name: String,
}

impl LegacyHeader {
    /// Describe an uncompressed ramdisk payload.
    #[must_use]
    pub fn ramdisk(arch: UImageArch, payload: &[u8], time: u32, name: &str) -> Option<Self> {
        let size = u32::try_from(payload.len()).ok()?;
        Some(Self {
            time,
            size,
            load: 0,
            entry: 0,
            data_crc: crc32(payload),
            os: IH_OS_LINUX,
            arch: arch.code(),
            image_type: IH_TYPE_RAMDISK,
            compression: IH_COMP_NONE,
            name: name.to_owned(),
        })
    }

    /// Return `true` when the header marks a ramdisk.
    #[must_use]
    pub fn is_ramdisk(&self) -> bool {
        self.image_type == IH_TYPE_RAMDISK
    }

    /// Serialise to the on-disk layout, computing the header checksum.
    #[must_use]
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0..4].copy_from_slice(&IH_MAGIC.to_be_bytes());
        out[8..12].copy_from_slice(&self.time.to_be_bytes());
        out[12..16].copy_from_slice(&self.size.to_be_bytes());
        out[16..20].copy_from_slice(&self.load.to_be_bytes());
        out[20..24].copy_from_slice(&self.entry.to_be_bytes());
        out[24..28].copy_from_slice(&self.data_crc.to_be_bytes());
        out[28] = self.os;
        out[29] = self.arch;
        out[30] = self.image_type;
        out[31] = self.compression;
        let name = self.name.as_bytes();
        let len = name.len().min(NAME_LEN - 1);
        out[32..32 + len].copy_from_slice(&name[..len]);
        let hcrc = crc32(&out);
        out[4..8].copy_from_slice(&hcrc.to_be_bytes());
        out
    }

    /// Parse a header, returning `None` when the magic or header checksum is wrong.
    #[must_use]
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < HEADER_LEN {
            return None;
        }
        let word = |at: usize| u32::from_be_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]);
        if word(0) != IH_MAGIC {
            return None;
        }
        let mut scratch = [0u8; HEADER_LEN];
        scratch.copy_from_slice(&bytes[..HEADER_LEN]);
        scratch[4..8].fill(0);
        if crc32(&scratch) != word(4) {
            return None;
        }
        let raw_name = &bytes[32..HEADER_LEN];
        let end = raw_name.iter().position(|b| *b == 0).unwrap_or(NAME_LEN);
        Some(Self {
            time: word(8),
            size: word(12),
            load: word(16),
            entry: word(20),
            data_crc: word(24),
            os: bytes[28],
            arch: bytes[29],
            image_type: bytes[30],
            compression: bytes[31],
            name: String::from_utf8_lossy(&raw_name[..end]).into_owned(),
        })
    }
}

fn crc32(bytes: &[u8]) -> u32 {
    let mut crc = Crc::new();
    crc.update(bytes);
    crc.sum()
}

/// Hook used by the resolver to ensure ramdisks carry the loader header.
pub trait RamdiskWrapper {
    /// Return `true` when `path` already carries a ramdisk header.
    fn is_wrapped(&self, path: &Path) -> io::Result<bool>;
    /// Write a wrapped copy of `src` to `dst`.
    fn wrap(&self, src: &Path, dst: &Path) -> io::Result<()>;
}

/// Native replacement for `mkimage -A <arch> -T ramdisk -C none`.
#[derive(Debug, Clone, Copy)]
pub struct UImageWrapper {
    arch: UImageArch,
}

impl UImageWrapper {
    /// Wrap ramdisks for `arch`.
    #[must_use]
    pub fn new(arch: UImageArch) -> Self {
        Self { arch }
    }
}

impl RamdiskWrapper for UImageWrapper {
    fn is_wrapped(&self, path: &Path) -> io::Result<bool> {
        let mut header = Vec::with_capacity(HEADER_LEN);
        File::open(path)?
            .take(HEADER_LEN as u64)
            .read_to_end(&mut header)?;
        Ok(LegacyHeader::decode(&header).is_some_and(|h| h.is_ramdisk()))
    }

    fn wrap(&self, src: &Path, dst: &Path) -> io::Result<()> {
        let payload = fs::read(src)?;
        let time = fs::metadata(src)?
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| u32::try_from(d.as_secs()).unwrap_or(u32::MAX))
            .unwrap_or(0);
        let name = src
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let header = LegacyHeader::ramdisk(self.arch, &payload, time, &name).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("ramdisk {} exceeds 4 GiB", src.display()),
            )
        })?;
        let mut out = File::create(dst)?;
        out.write_all(&header.encode())?;
        out.write_all(&payload)?;
        out.sync_all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips() {
        let payload = b"not really a cpio archive";
        let header = LegacyHeader::ramdisk(UImageArch::Arm, payload, 1_700_000_000, "initrd.cpio.gz").unwrap();
        let encoded = header.encode();
        assert_eq!(&encoded[0..4], &[0x27, 0x05, 0x19, 0x56]);
        let decoded = LegacyHeader::decode(&encoded).unwrap();
        assert_eq!(decoded, header);
        assert!(decoded.is_ramdisk());
        assert_eq!(decoded.size as usize, payload.len());
    }

    #[test]
    fn rejects_corrupt_header() {
        let header = LegacyHeader::ramdisk(UImageArch::Arm64, b"abc", 0, "x").unwrap();
        let mut encoded = header.encode();
        encoded[40] ^= 0xff;
        assert!(LegacyHeader::decode(&encoded).is_none());
        assert!(LegacyHeader::decode(&encoded[..10]).is_none());
    }

    #[test]
    fn truncates_long_names() {
        let name = "a".repeat(64);
        let header = LegacyHeader::ramdisk(UImageArch::Arm, b"", 0, &name).unwrap();
        let decoded = LegacyHeader::decode(&header.encode()).unwrap();
        assert_eq!(decoded.name.len(), NAME_LEN - 1);
    }

    #[test]
    fn wrapper_detects_and_wraps() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("initrd");
        let dst = dir.path().join("initrd.uboot");
        fs::write(&src, b"ramdisk payload").unwrap();
        let wrapper = UImageWrapper::new(UImageArch::Arm);
        assert!(!wrapper.is_wrapped(&src).unwrap());
        wrapper.wrap(&src, &dst).unwrap();
        assert!(wrapper.is_wrapped(&dst).unwrap());
        let bytes = fs::read(&dst).unwrap();
        assert_eq!(&bytes[HEADER_LEN..], b"ramdisk payload");
    }

    #[test]
    fn parses_arch_names() {
        assert_eq!("aarch64".parse::<UImageArch>().unwrap(), UImageArch::Arm64);
        assert!("sparc".parse::<UImageArch>().is_err());
    }
}
