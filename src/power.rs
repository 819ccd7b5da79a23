// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Reset devices and bring a boot session to the test shell prompt exactly once.
// Author: Lukas Bower
#![forbid(unsafe_code)]

use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::config::{millis, Patterns, PowerConfig, TargetConfig};
use crate::console::{Console, ConsoleError};
use crate::error::{BootError, Phase};
use crate::sequencer::BootSequencer;
use crate::session::BootSession;
use crate::template::BootStep;

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const RESOLV_CONF_CMD: &str = "cat /proc/net/pnp > /etc/resolv.conf";

/// Host-side power control for a device.
pub trait PowerSwitch {
    /// Power-cycle the device.
    fn power_cycle(&mut self) -> Result<(), BootError>;
}

/// Runs the configured hard reset command through `sh -c`.
#[derive(Debug, Clone)]
pub struct ShellPowerSwitch {
    command: String,
    timeout: Duration,
}

impl ShellPowerSwitch {
    /// Run `command`, killing it after `timeout`.
    #[must_use]
    pub fn new(command: impl Into<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            timeout,
        }
    }

    /// Build a switch when a hard reset command is configured.
    #[must_use]
    pub fn from_config(config: &PowerConfig) -> Option<Self> {
        config
            .hard_reset_command
            .as_deref()
            .filter(|cmd| !cmd.trim().is_empty())
            .map(|cmd| Self::new(cmd, millis(config.power_timeout_ms)))
    }
}

impl PowerSwitch for ShellPowerSwitch {
    fn power_cycle(&mut self) -> Result<(), BootError> {
        info!("hard reset: {}", self.command);
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|err| BootError::operation(Phase::PowerCycle, format!("spawn `{}`: {err}", self.command)))?;
        let deadline = Instant::now() + self.timeout;
        loop {
            match child.try_wait() {
                Ok(Some(status)) if status.success() => return Ok(()),
                Ok(Some(status)) => {
                    return Err(BootError::operation(
                        Phase::PowerCycle,
                        format!("`{}` exited with {status}", self.command),
                    ))
                }
                Ok(None) if Instant::now() >= deadline => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(BootError::operation(
                        Phase::PowerCycle,
                        format!("`{}` timed out after {:?}", self.command, self.timeout),
                    ));
                }
                Ok(None) => thread::sleep(POLL_INTERVAL),
                Err(err) => {
                    let _ = child.kill();
                    return Err(BootError::operation(
                        Phase::PowerCycle,
                        format!("wait for `{}`: {err}", self.command),
                    ));
                }
            }
        }
    }
}

/// How the device was reset before the boot sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetKind {
    /// External power cycle.
    Hard,
    /// Reboot command typed on the console.
    Soft,
}

/// Ask the running image to reboot itself.
pub fn soft_reset<C: Console + ?Sized>(console: &mut C, config: &PowerConfig) -> Result<(), BootError> {
    for line in &config.soft_reboot_command {
        debug!("soft reset: {line}");
        console
            .send_line(line)
            .map_err(|err| BootError::operation(Phase::PowerCycle, err))?;
    }
    Ok(())
}

/// Export the test prompt and wait for it to come back with an exit status.
pub fn reassert_prompt<C: Console + ?Sized>(
    console: &mut C,
    config: &TargetConfig,
    patterns: &Patterns,
) -> Result<(), BootError> {
    let fail = |err: ConsoleError| BootError::operation(Phase::ShellPrompt, err);
    console
        .send_line(&format!("export PS1='{}'", config.shell.test_prompt))
        .map_err(fail)?;
    console
        .expect(
            std::slice::from_ref(&patterns.test_prompt),
            millis(config.shell.command_timeout_ms),
        )
        .map_err(fail)?;
    Ok(())
}

/// Everything one boot attempt needs besides the console and session.
pub struct BootAttempt<'a> {
    /// Target configuration.
    pub config: &'a TargetConfig,
    /// Compiled console patterns.
    pub patterns: &'a Patterns,
    /// Rendered boot command steps.
    pub steps: &'a [BootStep],
    /// Whether the device mounts an exported NFS root.
    pub nfs_active: bool,
}

/// Bring `session` to Booted, power-cycling at most once per call.
///
/// A booted session only has its prompt re-asserted and `None` is returned.
/// Otherwise the device is reset (hard when a switch is present, soft
/// otherwise) and the sequencer runs exactly once; any failure leaves the
/// session Failed.
pub fn ensure_booted<C, S>(
    console: &mut C,
    session: &mut BootSession,
    switch: Option<&mut S>,
    attempt: &BootAttempt<'_>,
) -> Result<Option<ResetKind>, BootError>
where
    C: Console + ?Sized,
    S: PowerSwitch + ?Sized,
{
    if session.is_booted() {
        debug!("{}: already booted, re-asserting prompt", attempt.config.name);
        reassert_prompt(console, attempt.config, attempt.patterns)?;
        return Ok(None);
    }

    session.begin()?;
    let outcome = boot_once(console, switch, attempt);
    match outcome {
        Ok(kind) => {
            session.succeed()?;
            info!("{}: booted after {kind:?} reset", attempt.config.name);
            Ok(Some(kind))
        }
        Err(err) => {
            session.fail()?;
            warn!("{}: boot attempt {} failed: {err}", attempt.config.name, session.attempts());
            Err(err)
        }
    }
}

fn boot_once<C, S>(
    console: &mut C,
    switch: Option<&mut S>,
    attempt: &BootAttempt<'_>,
) -> Result<ResetKind, BootError>
where
    C: Console + ?Sized,
    S: PowerSwitch + ?Sized,
{
    let kind = match switch {
        Some(switch) => {
            switch.power_cycle()?;
            ResetKind::Hard
        }
        None => {
            soft_reset(console, &attempt.config.power)?;
            ResetKind::Soft
        }
    };
    BootSequencer::new(attempt.config, attempt.patterns).run(console, attempt.steps)?;
    if attempt.nfs_active {
        console
            .send_line(RESOLV_CONF_CMD)
            .map_err(|err| BootError::operation(Phase::ShellPrompt, err))?;
    }
    reassert_prompt(console, attempt.config, attempt.patterns)?;
    Ok(kind)
}
