// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Pack and unpack gzip tarballs exchanged with devices and root filesystems.
// Author: Lukas Bower
#![forbid(unsafe_code)]

use std::fs::{self, File};
use std::io::{self, BufReader, Read};
use std::path::Path;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Archive `src_dir` into a gzip tarball at `archive`, rooted at `arcname`.
///
/// Equivalent to `tar -czf <archive> -C <parent> <arcname>` where
/// `src_dir` is `<parent>/<arcname>`.
pub fn pack_dir(src_dir: &Path, archive: &Path, arcname: &str) -> io::Result<()> {
    let encoder = GzEncoder::new(File::create(archive)?, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);
    builder.append_dir_all(arcname, src_dir)?;
    let encoder = builder.into_inner()?;
    encoder.finish()?.sync_all()
}

/// Extract `archive` into `dest`, accepting gzip-compressed or plain tar.
pub fn unpack(archive: &Path, dest: &Path) -> io::Result<()> {
    fs::create_dir_all(dest)?;
    let reader: Box<dyn Read> = if is_gzip(archive)? {
        Box::new(GzDecoder::new(BufReader::new(File::open(archive)?)))
    } else {
        Box::new(BufReader::new(File::open(archive)?))
    };
    let mut tar = tar::Archive::new(reader);
    tar.set_preserve_permissions(true);
    tar.set_preserve_mtime(true);
    tar.unpack(dest)
}

/// Return `true` when `path` starts with the gzip magic bytes.
pub fn is_gzip(path: &Path) -> io::Result<bool> {
    let mut magic = [0u8; 2];
    let mut file = File::open(path)?;
    match file.read_exact(&mut magic) {
        Ok(()) => Ok(magic == GZIP_MAGIC),
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(err) => Err(err),
    }
}
