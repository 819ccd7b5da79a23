// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Load and validate per-target TOML configuration for the orchestrator.
// Author: Lukas Bower
#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fs;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use regex::Regex;
use serde::Deserialize;

use crate::error::BootError;
use crate::uimage::UImageArch;

/// Environment variable overriding the configuration path.
pub const CONFIG_ENV: &str = "DEVBOOT_CONFIG";
const CONFIG_FILE: &str = "devboot.toml";
const SYSTEM_CONFIG: &str = "/etc/devboot/devboot.toml";

/// Configuration for one device under test.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TargetConfig {
    /// Target identity used in logs and staging directory names.
    pub name: String,
    /// How the console is reached.
    #[serde(default)]
    pub console: ConsoleConfig,
    /// Host addresses handed to devices.
    #[serde(default)]
    pub network: NetworkConfig,
    /// Host working-directory policy.
    #[serde(default)]
    pub staging: StagingConfig,
    /// Reset commands.
    #[serde(default)]
    pub power: PowerConfig,
    /// Bootloader interaction.
    #[serde(default)]
    pub bootloader: BootloaderConfig,
    /// Test shell prompts and command bounds.
    #[serde(default)]
    pub shell: ShellConfig,
    /// Credentials answered after the kernel boots, if the image asks for them.
    #[serde(default)]
    pub login: Option<LoginConfig>,
    /// Device-side tarball exchange settings.
    #[serde(default)]
    pub transfer: TransferConfig,
    /// Named boot command templates.
    #[serde(default)]
    pub boot_cmds: BTreeMap<String, Vec<String>>,
}

impl TargetConfig {
    /// Parse and validate a configuration document.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).context("invalid target TOML")?;
        validate_config(&config)?;
        Ok(config)
    }

    /// Base URL devices use to fetch staged artifacts.
    #[must_use]
    pub fn image_url(&self) -> String {
        match &self.network.image_url {
            Some(url) => url.clone(),
            None => format!("http://{}/", self.network.server_ip),
        }
    }
}

/// Console endpoint; exactly one of `tcp` or `connection_command` is used.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConsoleConfig {
    /// Shell command whose stdio is the console (`telnet`, `conmux-console`, ...).
    #[serde(default)]
    pub connection_command: Option<String>,
    /// `host:port` of a network serial server.
    #[serde(default)]
    pub tcp: Option<String>,
    /// Write one character at a time.
    #[serde(default)]
    pub send_char: bool,
    /// Delay between characters when `send_char` is set.
    #[serde(default)]
    pub send_char_delay_ms: u64,
    /// Mirror the console transcript to this file.
    #[serde(default)]
    pub transcript_path: Option<PathBuf>,
}

/// Host network identity.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NetworkConfig {
    /// Address devices reach the host on.
    #[serde(default)]
    pub server_ip: String,
    /// Base URL of the served staging tree; defaults to `http://<server_ip>/`.
    #[serde(default)]
    pub image_url: Option<String>,
    /// Bind address of the throwaway exchange server.
    #[serde(default = "default_http_bind")]
    pub http_bind: IpAddr,
    /// Per-request bound on artifact downloads and tarball fetches.
    #[serde(default = "default_download_timeout_ms")]
    pub download_timeout_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            server_ip: String::new(),
            image_url: None,
            http_bind: default_http_bind(),
            download_timeout_ms: default_download_timeout_ms(),
        }
    }
}

/// Working-directory policy for staged artifacts.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StagingConfig {
    /// Default served base directory.
    #[serde(default = "default_image_tmpdir")]
    pub image_tmpdir: PathBuf,
    /// Stage under `image_tmpdir`.
    #[serde(default = "default_true")]
    pub use_default_tmpdir: bool,
    /// Served base used when `use_default_tmpdir` is off.
    #[serde(default)]
    pub alternative_dir: Option<PathBuf>,
    /// Create a fresh directory under `alternative_dir` instead of using it directly.
    #[serde(default = "default_true")]
    pub alternative_create_tmpdir: bool,
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            image_tmpdir: default_image_tmpdir(),
            use_default_tmpdir: true,
            alternative_dir: None,
            alternative_create_tmpdir: true,
        }
    }
}

/// Reset commands.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PowerConfig {
    /// Host command that power-cycles the device.
    #[serde(default)]
    pub hard_reset_command: Option<String>,
    /// Lines sent on the console for a soft reboot.
    #[serde(default = "default_soft_reboot")]
    pub soft_reboot_command: Vec<String>,
    /// Bound on the hard reset command.
    #[serde(default = "default_power_timeout_ms")]
    pub power_timeout_ms: u64,
}

impl Default for PowerConfig {
    fn default() -> Self {
        Self {
            hard_reset_command: None,
            soft_reboot_command: default_soft_reboot(),
            power_timeout_ms: default_power_timeout_ms(),
        }
    }
}

/// Bootloader interaction.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BootloaderConfig {
    /// Pattern announcing the autoboot countdown.
    #[serde(default = "default_interrupt_prompt")]
    pub interrupt_boot_prompt: String,
    /// Line sent to stop autoboot.
    #[serde(default)]
    pub interrupt_boot_command: String,
    /// Send `Ctrl-<letter>` instead of `interrupt_boot_command`.
    #[serde(default)]
    pub interrupt_boot_control_character: Option<char>,
    /// Bound on the autoboot countdown appearing.
    #[serde(default = "default_interrupt_timeout_ms")]
    pub interrupt_boot_timeout_ms: u64,
    /// Pattern of the bootloader command prompt.
    #[serde(default = "default_bootloader_prompt")]
    pub bootloader_prompt: String,
    /// Bound on each bootloader prompt wait.
    #[serde(default = "default_bootloader_timeout_ms")]
    pub bootloader_timeout_ms: u64,
    /// Command issued before the boot command sequence.
    #[serde(default)]
    pub pre_boot_cmd: Option<String>,
    /// Pattern the kernel prints once the bootloader hands over.
    #[serde(default = "default_image_boot_msg")]
    pub image_boot_msg: String,
    /// Bound on `image_boot_msg`.
    #[serde(default = "default_image_boot_timeout_ms")]
    pub image_boot_timeout_ms: u64,
    /// Architecture written into ramdisk headers.
    #[serde(default = "default_uimage_arch")]
    pub uimage_arch: UImageArch,
    /// Template name overriding the default selection.
    #[serde(default)]
    pub boot_cmds: Option<String>,
}

impl Default for BootloaderConfig {
    fn default() -> Self {
        Self {
            interrupt_boot_prompt: default_interrupt_prompt(),
            interrupt_boot_command: String::new(),
            interrupt_boot_control_character: None,
            interrupt_boot_timeout_ms: default_interrupt_timeout_ms(),
            bootloader_prompt: default_bootloader_prompt(),
            bootloader_timeout_ms: default_bootloader_timeout_ms(),
            pre_boot_cmd: None,
            image_boot_msg: default_image_boot_msg(),
            image_boot_timeout_ms: default_image_boot_timeout_ms(),
            uimage_arch: default_uimage_arch(),
            boot_cmds: None,
        }
    }
}

/// Test shell prompts.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ShellConfig {
    /// Patterns of the image's own shell prompt after boot.
    #[serde(default = "default_test_image_prompts")]
    pub test_image_prompts: Vec<String>,
    /// Bound on reaching a shell prompt after the kernel starts.
    #[serde(default = "default_boot_timeout_ms")]
    pub boot_timeout_ms: u64,
    /// Value exported as `PS1`; `$?` is expanded by the device shell.
    #[serde(default = "default_test_prompt")]
    pub test_prompt: String,
    /// Pattern matching the expanded `test_prompt`, with an `rc` capture.
    #[serde(default = "default_test_prompt_pattern")]
    pub test_prompt_pattern: String,
    /// Bound on each device command.
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            test_image_prompts: default_test_image_prompts(),
            boot_timeout_ms: default_boot_timeout_ms(),
            test_prompt: default_test_prompt(),
            test_prompt_pattern: default_test_prompt_pattern(),
            command_timeout_ms: default_command_timeout_ms(),
        }
    }
}

/// Auto-login credentials.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoginConfig {
    /// Pattern of the login prompt.
    pub login_prompt: String,
    /// User name sent at the login prompt.
    pub username: String,
    /// Pattern of the password prompt, if one follows.
    #[serde(default)]
    pub password_prompt: Option<String>,
    /// Password sent at the password prompt.
    #[serde(default)]
    pub password: Option<String>,
    /// Commands run once logged in.
    #[serde(default)]
    pub login_commands: Vec<String>,
}

/// Device-side tarball exchange settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TransferConfig {
    /// Fixed device address; discovered with `ip_command` when unset.
    #[serde(default)]
    pub device_ip: Option<Ipv4Addr>,
    /// Command whose output lists the device's IPv4 addresses.
    #[serde(default = "default_ip_command")]
    pub ip_command: String,
    /// Device directory holding per-transfer temp dirs.
    #[serde(default = "default_device_tmp_dir")]
    pub device_tmp_dir: String,
    /// Attempts at fetching the device tarball while `httpd` starts.
    #[serde(default = "default_fetch_attempts")]
    pub fetch_attempts: u32,
    /// Pause between fetch attempts.
    #[serde(default = "default_fetch_retry_delay_ms")]
    pub fetch_retry_delay_ms: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            device_ip: None,
            ip_command: default_ip_command(),
            device_tmp_dir: default_device_tmp_dir(),
            fetch_attempts: default_fetch_attempts(),
            fetch_retry_delay_ms: default_fetch_retry_delay_ms(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_http_bind() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_download_timeout_ms() -> u64 {
    300_000
}

fn default_image_tmpdir() -> PathBuf {
    PathBuf::from("/var/lib/devboot/images")
}

fn default_soft_reboot() -> Vec<String> {
    vec!["reboot".to_owned()]
}

fn default_power_timeout_ms() -> u64 {
    60_000
}

fn default_interrupt_prompt() -> String {
    "Hit any key to stop autoboot".to_owned()
}

fn default_interrupt_timeout_ms() -> u64 {
    120_000
}

fn default_bootloader_prompt() -> String {
    "=>".to_owned()
}

fn default_bootloader_timeout_ms() -> u64 {
    60_000
}

fn default_image_boot_msg() -> String {
    "Starting kernel".to_owned()
}

fn default_image_boot_timeout_ms() -> u64 {
    300_000
}

fn default_uimage_arch() -> UImageArch {
    UImageArch::Arm
}

fn default_test_image_prompts() -> Vec<String> {
    vec![r"root@\S+[#$] ?".to_owned(), r"/ # ".to_owned()]
}

fn default_boot_timeout_ms() -> u64 {
    300_000
}

fn default_test_prompt() -> String {
    "devboot-test(rc=$?)# ".to_owned()
}

fn default_test_prompt_pattern() -> String {
    r"devboot-test\(rc=(?P<rc>\d+)\)# ".to_owned()
}

fn default_command_timeout_ms() -> u64 {
    300_000
}

fn default_ip_command() -> String {
    "ip -4 -o addr show".to_owned()
}

fn default_device_tmp_dir() -> String {
    "/tmp".to_owned()
}

fn default_fetch_attempts() -> u32 {
    5
}

fn default_fetch_retry_delay_ms() -> u64 {
    1_000
}

/// Console patterns compiled once per target.
#[derive(Debug, Clone)]
pub struct Patterns {
    /// Autoboot countdown.
    pub interrupt_boot_prompt: Regex,
    /// Bootloader command prompt.
    pub bootloader_prompt: Regex,
    /// Kernel start banner.
    pub image_boot_msg: Regex,
    /// Image shell prompts.
    pub test_image_prompts: Vec<Regex>,
    /// Expanded test prompt with the `rc` capture.
    pub test_prompt: Regex,
    /// Login prompt.
    pub login_prompt: Option<Regex>,
    /// Password prompt.
    pub password_prompt: Option<Regex>,
}

impl Patterns {
    /// Compile every console pattern in `config`.
    pub fn compile(config: &TargetConfig) -> Result<Self, BootError> {
        let login = config.login.as_ref();
        Ok(Self {
            interrupt_boot_prompt: compile("interrupt_boot_prompt", &config.bootloader.interrupt_boot_prompt)?,
            bootloader_prompt: compile("bootloader_prompt", &config.bootloader.bootloader_prompt)?,
            image_boot_msg: compile("image_boot_msg", &config.bootloader.image_boot_msg)?,
            test_image_prompts: config
                .shell
                .test_image_prompts
                .iter()
                .map(|pattern| compile("test_image_prompts", pattern))
                .collect::<Result<_, _>>()?,
            test_prompt: compile("test_prompt_pattern", &config.shell.test_prompt_pattern)?,
            login_prompt: login
                .map(|login| compile("login_prompt", &login.login_prompt))
                .transpose()?,
            password_prompt: login
                .and_then(|login| login.password_prompt.as_deref())
                .map(|pattern| compile("password_prompt", pattern))
                .transpose()?,
        })
    }
}

fn compile(field: &str, pattern: &str) -> Result<Regex, BootError> {
    Regex::new(pattern).map_err(|err| BootError::Config(format!("{field} is not a valid pattern: {err}")))
}

/// Millisecond field to a `Duration`.
#[must_use]
pub fn millis(ms: u64) -> Duration {
    Duration::from_millis(ms)
}

/// Reject configurations the orchestrator cannot act on.
pub fn validate_config(config: &TargetConfig) -> Result<(), BootError> {
    let invalid = |msg: String| Err(BootError::Config(msg));
    if config.name.trim().is_empty() {
        return invalid("target name must not be empty".to_owned());
    }
    if config
        .name
        .chars()
        .any(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
    {
        return invalid(format!(
            "target name '{}' may only contain ASCII letters, digits, '-', '_' and '.'",
            config.name
        ));
    }
    if config.console.tcp.is_some() && config.console.connection_command.is_some() {
        return invalid("console sets both tcp and connection_command".to_owned());
    }
    if !config.network.server_ip.is_empty() && config.network.server_ip.parse::<IpAddr>().is_err() {
        return invalid(format!(
            "network server_ip '{}' is not an IP address",
            config.network.server_ip
        ));
    }
    if let Some(url) = &config.network.image_url {
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return invalid(format!("network image_url '{url}' must be an http(s) URL"));
        }
    }
    for (field, value) in [
        ("network download_timeout_ms", config.network.download_timeout_ms),
        ("power power_timeout_ms", config.power.power_timeout_ms),
        ("bootloader interrupt_boot_timeout_ms", config.bootloader.interrupt_boot_timeout_ms),
        ("bootloader bootloader_timeout_ms", config.bootloader.bootloader_timeout_ms),
        ("bootloader image_boot_timeout_ms", config.bootloader.image_boot_timeout_ms),
        ("shell boot_timeout_ms", config.shell.boot_timeout_ms),
        ("shell command_timeout_ms", config.shell.command_timeout_ms),
    ] {
        if value == 0 {
            return invalid(format!("{field} must be >= 1"));
        }
    }
    if let Some(c) = config.bootloader.interrupt_boot_control_character {
        if !c.is_ascii_alphabetic() {
            return invalid(format!(
                "bootloader interrupt_boot_control_character '{c}' must be an ASCII letter"
            ));
        }
    }
    if config.shell.test_image_prompts.is_empty() {
        return invalid("shell test_image_prompts must list at least one prompt".to_owned());
    }
    if config.transfer.fetch_attempts == 0 {
        return invalid("transfer fetch_attempts must be >= 1".to_owned());
    }
    if !config.transfer.device_tmp_dir.starts_with('/') {
        return invalid(format!(
            "transfer device_tmp_dir '{}' must be absolute",
            config.transfer.device_tmp_dir
        ));
    }
    if let Some(login) = &config.login {
        if login.password_prompt.is_some() != login.password.is_some() {
            return invalid("login password_prompt and password must be set together".to_owned());
        }
    }
    if let Some(name) = &config.bootloader.boot_cmds {
        if !config.boot_cmds.contains_key(name) {
            return Err(BootError::MissingTemplate(name.clone()));
        }
    }

    if config.shell.test_prompt.contains('\'') {
        return invalid("shell test_prompt must not contain single quotes".to_owned());
    }

    let patterns = Patterns::compile(config)?;
    if patterns.test_prompt.capture_names().all(|name| name != Some("rc")) {
        return invalid("shell test_prompt_pattern must capture the exit status as (?P<rc>...)".to_owned());
    }
    let expanded = config.shell.test_prompt.replace("$?", "0");
    if !patterns.test_prompt.is_match(&expanded) {
        return invalid(format!(
            "shell test_prompt_pattern does not match the expanded test_prompt '{expanded}'"
        ));
    }
    Ok(())
}

/// Return the configuration path: `$DEVBOOT_CONFIG`, then `./devboot.toml`, then the system file.
pub fn default_config_path() -> PathBuf {
    if let Some(path) = std::env::var_os(CONFIG_ENV).filter(|value| !value.is_empty()) {
        return PathBuf::from(path);
    }
    if let Ok(cwd) = std::env::current_dir() {
        let candidate = cwd.join(CONFIG_FILE);
        if candidate.is_file() {
            return candidate;
        }
    }
    PathBuf::from(SYSTEM_CONFIG)
}

/// Load and validate a target configuration from disk.
pub fn load_config(path: &Path) -> Result<TargetConfig> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read target config {}", path.display()))?;
    TargetConfig::from_toml_str(&text)
        .with_context(|| format!("invalid target config {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
name = "beagle-01"

[network]
server_ip = "192.168.1.10"

[boot_cmds]
boot_cmds_ramdisk = ["tftp 0x80200000 {KERNEL}", "bootz 0x80200000"]
"#;

    #[test]
    fn fills_defaults() {
        let config = TargetConfig::from_toml_str(MINIMAL).unwrap();
        assert_eq!(config.name, "beagle-01");
        assert_eq!(config.image_url(), "http://192.168.1.10/");
        assert_eq!(config.power.soft_reboot_command, vec!["reboot".to_owned()]);
        assert_eq!(config.bootloader.image_boot_timeout_ms, 300_000);
        assert_eq!(config.bootloader.uimage_arch, UImageArch::Arm);
        assert!(config.staging.use_default_tmpdir);
        assert!(config.login.is_none());
        assert_eq!(config.boot_cmds["boot_cmds_ramdisk"].len(), 2);
    }

    #[test]
    fn rejects_unknown_fields() {
        let text = format!("{MINIMAL}\n[power]\nhard_reset = \"pdu 3 cycle\"\n");
        assert!(TargetConfig::from_toml_str(&text).is_err());
    }

    #[test]
    fn rejects_zero_timeouts() {
        let text = format!("{MINIMAL}\n[shell]\nboot_timeout_ms = 0\n");
        let err = TargetConfig::from_toml_str(&text).unwrap_err();
        assert!(format!("{err:#}").contains("boot_timeout_ms"));
    }

    #[test]
    fn rejects_prompt_pattern_without_rc() {
        let mut config = TargetConfig::from_toml_str(MINIMAL).unwrap();
        config.shell.test_prompt_pattern = r"devboot-test\(rc=\d+\)# ".to_owned();
        assert!(matches!(validate_config(&config), Err(BootError::Config(_))));
    }

    #[test]
    fn rejects_quoted_test_prompt() {
        let mut config = TargetConfig::from_toml_str(MINIMAL).unwrap();
        config.shell.test_prompt = "it's(rc=$?)# ".to_owned();
        assert!(matches!(validate_config(&config), Err(BootError::Config(_))));
    }

    #[test]
    fn rejects_unknown_override_template() {
        let mut config = TargetConfig::from_toml_str(MINIMAL).unwrap();
        config.bootloader.boot_cmds = Some("boot_cmds_emmc".to_owned());
        assert!(matches!(
            validate_config(&config),
            Err(BootError::MissingTemplate(name)) if name == "boot_cmds_emmc"
        ));
    }

    #[test]
    fn login_password_pairs() {
        let text = format!(
            "{MINIMAL}\n[login]\nlogin_prompt = \"login:\"\nusername = \"root\"\npassword_prompt = \"Password:\"\n"
        );
        assert!(TargetConfig::from_toml_str(&text).is_err());
    }

    #[test]
    fn compiles_patterns() {
        let config = TargetConfig::from_toml_str(MINIMAL).unwrap();
        let patterns = Patterns::compile(&config).unwrap();
        let caps = patterns.test_prompt.captures("devboot-test(rc=3)# ").unwrap();
        assert_eq!(&caps["rc"], "3");
        assert_eq!(patterns.test_image_prompts.len(), 2);
        assert!(patterns.login_prompt.is_none());
    }
}
