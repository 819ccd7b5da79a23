// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Simulated U-Boot device, power switch and fallback shared by integration tests.
// Author: Lukas Bower
#![forbid(unsafe_code)]
#![allow(dead_code)]

use std::collections::HashMap;
use std::fs;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use devboot::console::find_earliest;
use devboot::exchange::HttpExchange;
use devboot::fallback::{AccessBody, BootTarget};
use devboot::power::PowerSwitch;
use devboot::tarball;
use devboot::{
    BootError, Console, ConsoleError, ConsoleMatch, DeploymentRequest, TargetConfig, Transcript,
};
use regex::Regex;
use tempfile::TempDir;

pub const BANNER: &str = "U-Boot 2024.01 (sim)\nHit any key to stop autoboot:  3 ";
pub const BOOT_PROMPT: &str = "=> ";
pub const LOGIN_SHELL: &str = "root@sim:~# ";

/// Where the simulated device currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimPhase {
    Autoboot,
    Bootloader,
    Linux,
}

/// Device state shared by the console and the power switch.
pub struct DeviceState {
    pub phase: SimPhase,
    pub output: String,
    pub line: String,
    pub ps1: Option<String>,
    pub power_cycles: u32,
    pub soft_reboots: u32,
    pub sent: Vec<String>,
    pub bootloader_lines: Vec<String>,
    pub shell_lines: Vec<String>,
    pub hang_kernel: bool,
    pub fail_wget: bool,
    pub fail_extract: bool,
    pub rootfs: PathBuf,
    servers: HashMap<u32, HttpExchange>,
    next_pid: u32,
    last_pid: u32,
}

impl DeviceState {
    fn reset_to_autoboot(&mut self) {
        self.servers.clear();
        self.ps1 = None;
        self.line.clear();
        self.phase = SimPhase::Autoboot;
        self.output.push_str(BANNER);
    }

    fn device_path(&self, path: &str) -> PathBuf {
        self.rootfs.join(path.trim_start_matches('/'))
    }

    fn prompt(&self, rc: i32) -> String {
        match &self.ps1 {
            Some(ps1) => ps1.replace("$?", &rc.to_string()),
            None => LOGIN_SHELL.to_owned(),
        }
    }

    fn feed(&mut self, text: &str) {
        for c in text.chars() {
            match self.phase {
                SimPhase::Autoboot => {
                    self.phase = SimPhase::Bootloader;
                    self.line.clear();
                    self.output.push('\n');
                    self.output.push_str(BOOT_PROMPT);
                    return;
                }
                _ if c == '\n' => {
                    let line = std::mem::take(&mut self.line);
                    self.execute(line.trim_end_matches('\r'));
                }
                _ => self.line.push(c),
            }
        }
    }

    fn execute(&mut self, line: &str) {
        match self.phase {
            SimPhase::Autoboot => {}
            SimPhase::Bootloader => {
                self.bootloader_lines.push(line.to_owned());
                if line.starts_with("boot") {
                    self.output.push_str("Starting kernel ...\n\n[    0.000000] Booting Linux on physical CPU 0x0\n");
                    if !self.hang_kernel {
                        self.phase = SimPhase::Linux;
                        self.output.push_str(LOGIN_SHELL);
                    }
                } else {
                    self.output.push_str(BOOT_PROMPT);
                }
            }
            SimPhase::Linux => {
                self.shell_lines.push(line.to_owned());
                self.output.push_str(line);
                self.output.push_str("\r\n");
                if line.trim() == "reboot" {
                    self.soft_reboots += 1;
                    self.reset_to_autoboot();
                    return;
                }
                let (rc, out) = self.shell(line);
                self.output.push_str(&out);
                let prompt = self.prompt(rc);
                self.output.push_str(&prompt);
            }
        }
    }

    fn shell(&mut self, line: &str) -> (i32, String) {
        let mut rc = 0;
        let mut out = String::new();
        for sequence in line.split("; ") {
            for (position, chain) in sequence.split(" && ").enumerate() {
                if position > 0 && rc != 0 {
                    break;
                }
                for job in chain.split(" & ") {
                    let (status, text) = self.simple(&tokenize(job));
                    rc = status;
                    out.push_str(&text);
                }
            }
        }
        (rc, out)
    }

    fn simple(&mut self, words: &[String]) -> (i32, String) {
        let args: Vec<&str> = words.iter().map(String::as_str).collect();
        let ok = |result: io::Result<()>| match result {
            Ok(()) => (0, String::new()),
            Err(err) => (1, format!("sh: {err}\r\n")),
        };
        match args.as_slice() {
            ["true"] => (0, String::new()),
            ["false"] => (1, String::new()),
            ["export", assignment] => match assignment.strip_prefix("PS1=") {
                Some(ps1) => {
                    self.ps1 = Some(ps1.to_owned());
                    (0, String::new())
                }
                None => (0, String::new()),
            },
            ["cat", "/proc/net/pnp", ">", "/etc/resolv.conf"] => (0, String::new()),
            ["ip", ..] => (0, "2: eth0    inet 127.0.0.1/8 scope host eth0\r\n".to_owned()),
            ["mkdir", "-p", path] => ok(fs::create_dir_all(self.device_path(path))),
            ["rm", "-rf", path] => {
                let path = self.device_path(path);
                if path.exists() {
                    ok(fs::remove_dir_all(path))
                } else {
                    (0, String::new())
                }
            }
            ["tar", "-czf", archive, "-C", parent, name] => {
                let src = self.device_path(parent).join(name);
                if !src.is_dir() {
                    return (1, format!("tar: {name}: No such file or directory\r\n"));
                }
                ok(tarball::pack_dir(&src, &self.device_path(archive), name))
            }
            ["rm", "-f", path] => {
                let path = self.device_path(path);
                if path.is_file() {
                    ok(fs::remove_file(path))
                } else {
                    (0, String::new())
                }
            }
            ["mv", from, to] => ok(fs::rename(self.device_path(from), self.device_path(to))),
            ["tar", "-xzf", archive, "-C", parent] => {
                let unpacked = tarball::unpack(&self.device_path(archive), &self.device_path(parent));
                if self.fail_extract {
                    // Partial extraction followed by a write error.
                    return (2, "tar: write error: No space left on device\r\n".to_owned());
                }
                ok(unpacked)
            }
            ["busybox", "httpd", "-f", "-p", port, "-h", dir] => {
                let Ok(port) = port.parse::<u16>() else {
                    return (1, "httpd: bad port\r\n".to_owned());
                };
                let bind = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
                match HttpExchange::serve_on(&self.device_path(dir), bind) {
                    Ok(server) => {
                        self.next_pid += 1;
                        self.last_pid = self.next_pid;
                        self.servers.insert(self.last_pid, server);
                        (0, String::new())
                    }
                    Err(err) => (1, format!("httpd: {err}\r\n")),
                }
            }
            ["echo", "$!", ">", file] => {
                ok(fs::write(self.device_path(file), format!("{}\n", self.last_pid)))
            }
            ["[", "-f", file, "]"] => (i32::from(!self.device_path(file).is_file()), String::new()),
            ["kill", target] => {
                let pid_file = target
                    .trim_start_matches("$(cat ")
                    .trim_end_matches(')')
                    .trim_matches('\'');
                let pid = fs::read_to_string(self.device_path(pid_file))
                    .ok()
                    .and_then(|pid| pid.trim().parse::<u32>().ok());
                match pid.and_then(|pid| self.servers.remove(&pid)) {
                    Some(_) => (0, String::new()),
                    None => (1, "kill: no such process\r\n".to_owned()),
                }
            }
            ["wget", "-q", "-O", _, url] if self.fail_wget => {
                (1, format!("wget: can't connect to remote host ({url})\r\n"))
            }
            ["wget", "-q", "-O", file, url] => match ureq::get(url).call() {
                Ok(response) => {
                    let mut body = Vec::new();
                    let copied = io::copy(&mut response.into_reader(), &mut body)
                        .and_then(|_| fs::write(self.device_path(file), &body));
                    ok(copied)
                }
                Err(err) => (1, format!("wget: {err}\r\n")),
            },
            _ => (127, format!("sh: {}: not found\r\n", args.first().unwrap_or(&""))),
        }
    }

    /// Number of device-side httpd processes still running.
    pub fn running_servers(&self) -> usize {
        self.servers.len()
    }
}

/// Split a shell word list, honouring single and double quotes.
fn tokenize(line: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut word = String::new();
    let mut in_word = false;
    let mut quote: Option<char> = None;
    for c in line.chars() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), c) => word.push(c),
            (None, '\'' | '"') => {
                quote = Some(c);
                in_word = true;
            }
            (None, c) if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut word));
                    in_word = false;
                }
            }
            (None, c) => {
                word.push(c);
                in_word = true;
            }
        }
    }
    if in_word {
        words.push(word);
    }
    words
}

/// Handle onto a simulated device.
#[derive(Clone)]
pub struct SimDevice {
    state: Arc<Mutex<DeviceState>>,
    _rootfs: Arc<TempDir>,
}

impl SimDevice {
    /// A device running Linux at a plain shell prompt.
    pub fn new() -> Self {
        let rootfs = tempfile::tempdir().unwrap();
        fs::create_dir_all(rootfs.path().join("tmp")).unwrap();
        let state = DeviceState {
            phase: SimPhase::Linux,
            output: String::new(),
            line: String::new(),
            ps1: None,
            power_cycles: 0,
            soft_reboots: 0,
            sent: Vec::new(),
            bootloader_lines: Vec::new(),
            shell_lines: Vec::new(),
            hang_kernel: false,
            fail_wget: false,
            fail_extract: false,
            rootfs: rootfs.path().to_path_buf(),
            servers: HashMap::new(),
            next_pid: 100,
            last_pid: 0,
        };
        Self {
            state: Arc::new(Mutex::new(state)),
            _rootfs: Arc::new(rootfs),
        }
    }

    pub fn state(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap()
    }

    pub fn console(&self) -> SimConsole {
        SimConsole {
            device: self.clone(),
            buffer: String::new(),
            transcript: Transcript::new(),
        }
    }

    pub fn power_switch(&self) -> SimPower {
        SimPower {
            device: self.clone(),
        }
    }

    /// Host path backing `path` on the device.
    pub fn path(&self, path: &str) -> PathBuf {
        self.state().device_path(path)
    }
}

/// Console wired to a [`SimDevice`].
pub struct SimConsole {
    device: SimDevice,
    buffer: String,
    transcript: Transcript,
}

impl Console for SimConsole {
    fn send(&mut self, text: &str) -> Result<(), ConsoleError> {
        let mut state = self.device.state();
        state.sent.push(text.to_owned());
        state.feed(text);
        Ok(())
    }

    fn expect(&mut self, patterns: &[Regex], timeout: Duration) -> Result<ConsoleMatch, ConsoleError> {
        let fresh = std::mem::take(&mut self.device.state().output);
        self.transcript.record(&fresh);
        self.buffer.push_str(&fresh);
        if let Some((index, found)) = find_earliest(&self.buffer, patterns) {
            let (start, end) = (found.start(), found.end());
            let before = self.buffer[..start].to_owned();
            let matched = self.buffer[start..end].to_owned();
            self.buffer.drain(..end);
            return Ok(ConsoleMatch {
                index,
                before,
                matched,
            });
        }
        // The simulation answers synchronously, so nothing else will arrive.
        thread::sleep(timeout);
        Err(ConsoleError::Timeout {
            waited: timeout,
            patterns: patterns.iter().map(Regex::as_str).collect::<Vec<_>>().join("|"),
        })
    }

    fn transcript(&self) -> &Transcript {
        &self.transcript
    }
}

/// Power switch that resets a [`SimDevice`] into autoboot.
pub struct SimPower {
    device: SimDevice,
}

impl PowerSwitch for SimPower {
    fn power_cycle(&mut self) -> Result<(), BootError> {
        let mut state = self.device.state();
        state.power_cycles += 1;
        state.reset_to_autoboot();
        Ok(())
    }
}

/// Fallback boot path that records each call.
#[derive(Clone, Default)]
pub struct RecordingFallback {
    pub calls: Arc<Mutex<Vec<String>>>,
    pub root: Arc<Mutex<Option<PathBuf>>>,
}

impl RecordingFallback {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

impl BootTarget for RecordingFallback {
    fn deploy_artifacts(&mut self, request: &DeploymentRequest) -> Result<(), BootError> {
        self.record(format!("deploy_artifacts:{}", request.bootloader));
        Ok(())
    }

    fn deploy_image(&mut self, request: &DeploymentRequest) -> Result<(), BootError> {
        self.record(format!(
            "deploy_image:{}",
            request.image.as_deref().unwrap_or_default()
        ));
        Ok(())
    }

    fn attempt_boot(&mut self) -> Result<(), BootError> {
        self.record("attempt_boot".to_owned());
        Ok(())
    }

    fn filesystem_access(
        &mut self,
        partition: Option<u32>,
        directory: &str,
        body: &mut AccessBody<'_>,
    ) -> Result<(), BootError> {
        self.record(format!("filesystem_access:{partition:?}:{directory}"));
        let root = self
            .root
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| BootError::Config("recording fallback has no root".to_owned()))?;
        let path = root.join(directory.trim_start_matches('/'));
        fs::create_dir_all(&path).map_err(|err| BootError::Config(err.to_string()))?;
        body(&path).map_err(BootError::Access)
    }
}

/// Target configuration for a simulated u-boot board.
pub fn sim_config(staging: &Path, extra: &str) -> TargetConfig {
    let text = format!(
        r#"
name = "sim-board"

[network]
server_ip = "127.0.0.1"
http_bind = "127.0.0.1"

[staging]
image_tmpdir = "{staging}"

[bootloader]
interrupt_boot_timeout_ms = 2000
bootloader_timeout_ms = 2000
image_boot_timeout_ms = 2000

[shell]
boot_timeout_ms = 2000
command_timeout_ms = 5000

[transfer]
device_ip = "127.0.0.1"
fetch_attempts = 3
fetch_retry_delay_ms = 50

[boot_cmds]
boot_cmds_ramdisk = [
    "setenv serverip {{SERVER_IP}}",
    "tftp 0x81000000 {{KERNEL}}",
    "tftp 0x82000000 {{RAMDISK}}",
    "bootm 0x81000000 0x82000000",
]
boot_cmds_nfs = [
    "setenv serverip {{SERVER_IP}}",
    "tftp 0x81000000 {{KERNEL}}",
    "setenv bootargs root=/dev/nfs nfsroot={{SERVER_IP}}:{{NFSROOTFS}} ip=dhcp",
    "bootz 0x81000000",
]
boot_cmds = ["sendline chain {{IMAGE}}"]
{extra}
"#,
        staging = staging.join("srv").display()
    );
    TargetConfig::from_toml_str(&text).unwrap()
}

/// Write `name` with `contents` under `dir` and return its path as a locator.
pub fn input(dir: &Path, name: &str, contents: &[u8]) -> String {
    let path = dir.join(name);
    fs::write(&path, contents).unwrap();
    path.to_string_lossy().into_owned()
}
