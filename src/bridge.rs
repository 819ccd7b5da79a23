// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Scoped read/write access to a device directory over NFS or shuttled tarballs.
// Author: Lukas Bower
#![forbid(unsafe_code)]

//! Remote filesystem bridge.
//!
//! Devices without a remote filesystem protocol are reached by packing the
//! requested directory on the device, serving it with `busybox httpd`, and
//! fetching it onto the host. After the caller's body runs, the tree is
//! packed again, served from a throwaway host server, and unpacked over the
//! original directory. The old directory is moved aside until the new one
//! is extracted and restored if extraction fails. Device-side temporaries
//! are removed afterwards, except for a pushed archive that could not be
//! extracted.

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::thread;

use log::{debug, info, warn};
use rand::Rng;

use crate::config::{millis, NetworkConfig, Patterns, TargetConfig, TransferConfig};
use crate::console::Console;
use crate::error::{BootError, Phase};
use crate::exchange::HttpExchange;
use crate::runner::CommandRunner;
use crate::staging::StagingArea;
use crate::tarball;

const ARCHIVE: &str = "fs.tgz";
const PUSHED: &str = "push.tgz";
const PID_FILE: &str = "httpd.pid";
const BACKUP_SUFFIX: &str = ".devboot-old";
const EPHEMERAL_PORTS: std::ops::RangeInclusive<u16> = 49152..=65535;

/// Quote `text` for a POSIX shell.
#[must_use]
pub fn shell_quote(text: &str) -> String {
    format!("'{}'", text.replace('\'', r"'\''"))
}

/// Absolute device directory split into its parent and final component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDir {
    /// Normalised absolute path.
    pub path: String,
    /// Parent directory.
    pub parent: String,
    /// Final component.
    pub name: String,
}

impl DeviceDir {
    /// Normalise `directory`; the root itself and `..` components are refused.
    pub fn parse(directory: &str) -> Result<Self, BootError> {
        let mut parts = Vec::new();
        for part in directory.split('/') {
            match part {
                "" | "." => {}
                ".." => {
                    return Err(BootError::Config(format!(
                        "device directory '{directory}' must not contain '..'"
                    )))
                }
                part => parts.push(part),
            }
        }
        let Some((name, parents)) = parts.split_last() else {
            return Err(BootError::Config(format!(
                "device directory '{directory}' names the filesystem root"
            )));
        };
        Ok(Self {
            path: format!("/{}", parts.join("/")),
            parent: format!("/{}", parents.join("/")),
            name: (*name).to_owned(),
        })
    }

    /// Path relative to a root filesystem directory.
    #[must_use]
    pub fn relative(&self) -> &str {
        self.path.trim_start_matches('/')
    }
}

/// Run `body` against `<nfsroot>/<directory>`, creating it first.
pub fn nfs_access<T, F>(nfsroot: &Path, directory: &str, body: F) -> Result<T, BootError>
where
    F: FnOnce(&Path) -> anyhow::Result<T>,
{
    let dir = DeviceDir::parse(directory)?;
    let path = nfsroot.join(dir.relative());
    fs::create_dir_all(&path).map_err(|err| {
        BootError::operation(Phase::Stage, format!("create {}: {err}", path.display()))
    })?;
    debug!("nfs access to {}", path.display());
    body(&path).map_err(BootError::Access)
}

/// Tarball shuttle between a booted device and the host.
pub struct TarballBridge<'a, C: Console + ?Sized> {
    runner: CommandRunner<'a, C>,
    transfer: &'a TransferConfig,
    network: &'a NetworkConfig,
    staging: &'a StagingArea,
    agent: ureq::Agent,
    keep_tmp: bool,
}

impl<'a, C: Console + ?Sized> TarballBridge<'a, C> {
    /// Bridge over a console sitting at the test prompt.
    pub fn new(
        console: &'a mut C,
        config: &'a TargetConfig,
        patterns: &'a Patterns,
        staging: &'a StagingArea,
    ) -> Self {
        let timeout = millis(config.network.download_timeout_ms);
        Self {
            runner: CommandRunner::new(console, &patterns.test_prompt, millis(config.shell.command_timeout_ms)),
            transfer: &config.transfer,
            network: &config.network,
            staging,
            agent: ureq::AgentBuilder::new()
                .timeout_connect(timeout)
                .timeout(timeout)
                .build(),
            keep_tmp: false,
        }
    }

    /// Pull `directory`, run `body` on the local copy, and push it back.
    ///
    /// The write-back runs even when `body` fails; the body's error is then
    /// returned as [`BootError::Access`].
    pub fn access<T, F>(&mut self, directory: &str, body: F) -> Result<T, BootError>
    where
        F: FnOnce(&Path) -> anyhow::Result<T>,
    {
        let dir = DeviceDir::parse(directory)?;
        if self.network.server_ip.is_empty() {
            return Err(BootError::Config(
                "network server_ip is required for tarball transfers".to_owned(),
            ));
        }
        let tmp = format!(
            "{}/devboot-{:016x}",
            self.transfer.device_tmp_dir.trim_end_matches('/'),
            rand::random::<u64>()
        );
        info!("transferring {} through {tmp}", dir.path);
        self.runner.run(&format!("mkdir -p {}", shell_quote(&dir.path)), Phase::Pack)?;
        self.runner.run(&format!("mkdir -p {}", shell_quote(&tmp)), Phase::Pack)?;

        self.keep_tmp = false;
        let result = self.shuttle(&dir, &tmp, body);

        let pid = shell_quote(&format!("{tmp}/{PID_FILE}"));
        let cleanup = if self.keep_tmp {
            format!("[ -f {pid} ] && kill \"$(cat {pid})\"; rm -f {pid}")
        } else {
            format!("[ -f {pid} ] && kill \"$(cat {pid})\"; rm -rf {}", shell_quote(&tmp))
        };
        match self.runner.run(&cleanup, Phase::PushBack) {
            Ok(_) => debug!("cleaned up device temp dir {tmp}"),
            Err(err) if result.is_ok() => return Err(err),
            Err(err) => warn!("device cleanup of {tmp} failed: {err}"),
        }
        result
    }

    fn shuttle<T, F>(&mut self, dir: &DeviceDir, tmp: &str, body: F) -> Result<T, BootError>
    where
        F: FnOnce(&Path) -> anyhow::Result<T>,
    {
        let archive = format!("{tmp}/{ARCHIVE}");
        self.runner.run(
            &format!(
                "tar -czf {} -C {} {}",
                shell_quote(&archive),
                shell_quote(&dir.parent),
                shell_quote(&dir.name)
            ),
            Phase::Pack,
        )?;

        let ip = match self.transfer.device_ip {
            Some(ip) => ip,
            None => self.runner.target_ip(&self.transfer.ip_command)?,
        };
        let port = rand::thread_rng().gen_range(EPHEMERAL_PORTS);
        self.runner.run(
            &format!(
                "busybox httpd -f -p {port} -h {} & echo $! > {}",
                shell_quote(tmp),
                shell_quote(&format!("{tmp}/{PID_FILE}"))
            ),
            Phase::Serve,
        )?;

        let pulled = self.staging.scratch("pull-").map_err(|err| err.in_phase(Phase::Fetch))?;
        let local_archive = pulled.path().join(ARCHIVE);
        self.fetch(&format!("http://{ip}:{port}/{ARCHIVE}"), &local_archive)?;
        tarball::unpack(&local_archive, pulled.path())
            .map_err(|err| BootError::operation(Phase::Fetch, format!("unpack {ARCHIVE}: {err}")))?;
        if let Err(err) = fs::remove_file(&local_archive) {
            debug!("remove {}: {err}", local_archive.display());
        }
        let local = pulled.path().join(&dir.name);

        let outcome = body(&local);
        let pushed = self.push_back(dir, tmp, &local);
        match (outcome, pushed) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(err)) => Err(err),
            (Err(err), pushed) => {
                if let Err(push_err) = pushed {
                    warn!("write-back after failed access to {} also failed: {push_err}", dir.path);
                }
                Err(BootError::Access(err))
            }
        }
    }

    fn fetch(&self, url: &str, dest: &Path) -> Result<(), BootError> {
        let attempts = self.transfer.fetch_attempts.max(1);
        let mut last = String::new();
        for attempt in 1..=attempts {
            match self.fetch_once(url, dest) {
                Ok(()) => return Ok(()),
                Err(err) => {
                    debug!("fetch {url} attempt {attempt}/{attempts}: {err}");
                    last = err;
                }
            }
            if attempt < attempts {
                thread::sleep(millis(self.transfer.fetch_retry_delay_ms));
            }
        }
        Err(BootError::operation(Phase::Fetch, format!("GET {url}: {last}")))
    }

    fn fetch_once(&self, url: &str, dest: &Path) -> Result<(), String> {
        let response = self.agent.get(url).call().map_err(|err| err.to_string())?;
        let mut out = BufWriter::new(File::create(dest).map_err(|err| err.to_string())?);
        io::copy(&mut response.into_reader(), &mut out)
            .and_then(|_| out.flush())
            .map_err(|err| err.to_string())
    }

    fn push_back(&mut self, dir: &DeviceDir, tmp: &str, local: &Path) -> Result<(), BootError> {
        let failed = |what: &str, err: io::Error| BootError::operation(Phase::PushBack, format!("{what}: {err}"));
        let outbound = self
            .staging
            .scratch("push-")
            .map_err(|err| err.in_phase(Phase::PushBack))?;
        tarball::pack_dir(local, &outbound.path().join(ARCHIVE), &dir.name)
            .map_err(|err| failed("pack host copy", err))?;
        let exchange = HttpExchange::serve(outbound.path(), self.network.http_bind)
            .map_err(|err| failed("start host exchange", err))?;
        let url = exchange.url(&self.network.server_ip, ARCHIVE);
        let pushed = format!("{tmp}/{PUSHED}");
        self.runner.run(
            &format!("wget -q -O {} {}", shell_quote(&pushed), shell_quote(&url)),
            Phase::PushBack,
        )?;
        drop(exchange);

        let backup = format!("{}{BACKUP_SUFFIX}", dir.path);
        self.runner.run(
            &format!(
                "rm -rf {backup} && mv {path} {backup}",
                backup = shell_quote(&backup),
                path = shell_quote(&dir.path)
            ),
            Phase::PushBack,
        )?;
        let extracted = self.runner.run(
            &format!("tar -xzf {} -C {}", shell_quote(&pushed), shell_quote(&dir.parent)),
            Phase::PushBack,
        );
        if let Err(err) = extracted {
            self.keep_tmp = true;
            let restore = format!(
                "rm -rf {path} && mv {backup} {path}",
                backup = shell_quote(&backup),
                path = shell_quote(&dir.path)
            );
            match self.runner.run(&restore, Phase::PushBack) {
                Ok(_) => warn!("restored {} after a failed write-back; new contents kept in {pushed}", dir.path),
                Err(restore_err) => warn!(
                    "restoring {} from {backup} failed: {restore_err}; new contents kept in {pushed}",
                    dir.path
                ),
            }
            return Err(err);
        }
        if let Err(err) = self.runner.run(&format!("rm -rf {}", shell_quote(&backup)), Phase::PushBack) {
            warn!("removing {backup} failed: {err}");
        }
        info!("wrote {} back to the device", dir.path);
        Ok(())
    }
}

/// Copy the tree at `src` into `dest`, creating `dest` as needed.
pub fn copy_tree(src: &Path, dest: &Path) -> io::Result<()> {
    fs::create_dir_all(dest)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let target: PathBuf = dest.join(entry.file_name());
        let kind = entry.file_type()?;
        if kind.is_dir() {
            copy_tree(&entry.path(), &target)?;
        } else if kind.is_symlink() {
            copy_link(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Make `dest` hold exactly the tree at `src`, removing entries `src` lacks.
pub fn replace_tree(src: &Path, dest: &Path) -> io::Result<()> {
    if dest.is_dir() {
        for entry in fs::read_dir(dest)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                fs::remove_dir_all(entry.path())?;
            } else {
                fs::remove_file(entry.path())?;
            }
        }
    }
    copy_tree(src, dest)
}

#[cfg(unix)]
fn copy_link(src: &Path, dest: &Path) -> io::Result<()> {
    let link = fs::read_link(src)?;
    if fs::symlink_metadata(dest).is_ok() {
        fs::remove_file(dest)?;
    }
    std::os::unix::fs::symlink(link, dest)
}

#[cfg(not(unix))]
fn copy_link(src: &Path, dest: &Path) -> io::Result<()> {
    fs::copy(src, dest).map(|_| ())
}
