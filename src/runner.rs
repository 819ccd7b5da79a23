// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Run shell commands on a booted device and check their exit status from the prompt.
// Author: Lukas Bower
#![forbid(unsafe_code)]

use std::net::Ipv4Addr;
use std::time::Duration;

use log::debug;
use regex::Regex;

use crate::console::Console;
use crate::error::{BootError, Phase};

/// Output and exit status of one device command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit status parsed from the prompt.
    pub status: i32,
    /// Command output with the echoed command line removed.
    pub output: String,
}

/// Runs commands at the test prompt, whose `rc` capture carries `$?`.
pub struct CommandRunner<'a, C: Console + ?Sized> {
    console: &'a mut C,
    prompt: &'a Regex,
    timeout: Duration,
}

impl<'a, C: Console + ?Sized> CommandRunner<'a, C> {
    /// Wrap a console that is sitting at the test prompt.
    pub fn new(console: &'a mut C, prompt: &'a Regex, timeout: Duration) -> Self {
        Self {
            console,
            prompt,
            timeout,
        }
    }

    /// Run `cmd` and return its status without judging it.
    pub fn status(&mut self, cmd: &str, phase: Phase) -> Result<CommandOutput, BootError> {
        debug!("device$ {cmd}");
        self.console
            .send_line(cmd)
            .map_err(|err| BootError::operation(phase, err))?;
        let found = self
            .console
            .expect(std::slice::from_ref(self.prompt), self.timeout)
            .map_err(|err| BootError::operation(phase, format!("`{cmd}`: {err}")))?;
        let status = self
            .prompt
            .captures(&found.matched)
            .and_then(|caps| caps.name("rc"))
            .and_then(|rc| rc.as_str().parse::<i32>().ok())
            .ok_or_else(|| {
                BootError::operation(phase, format!("`{cmd}`: prompt carried no exit status"))
            })?;
        Ok(CommandOutput {
            status,
            output: strip_echo(&found.before, cmd),
        })
    }

    /// Run `cmd`, failing `phase` on a non-zero exit status.
    pub fn run(&mut self, cmd: &str, phase: Phase) -> Result<String, BootError> {
        let out = self.status(cmd, phase)?;
        if out.status != 0 {
            return Err(BootError::operation(
                phase,
                format!("`{cmd}` exited with {}: {}", out.status, out.output.trim()),
            ));
        }
        Ok(out.output)
    }

    /// Discover the device's first non-loopback IPv4 address.
    pub fn target_ip(&mut self, ip_command: &str) -> Result<Ipv4Addr, BootError> {
        let output = self.run(ip_command, Phase::Serve)?;
        first_ipv4(&output).ok_or_else(|| {
            BootError::operation(Phase::Serve, format!("no IPv4 address in `{ip_command}` output"))
        })
    }
}

fn strip_echo(before: &str, cmd: &str) -> String {
    let text = before.trim_start_matches(['\r', '\n']);
    let body = match text.split_once('\n') {
        Some((first, rest)) if first.trim_end_matches('\r').ends_with(cmd) => rest,
        None if text.trim_end_matches('\r').ends_with(cmd) => "",
        _ => text,
    };
    body.replace("\r\n", "\n")
}

/// First non-loopback address following an `inet` keyword in `ip`/`ifconfig` output.
#[must_use]
pub fn first_ipv4(output: &str) -> Option<Ipv4Addr> {
    let mut tokens = output.split_whitespace();
    while let Some(token) = tokens.next() {
        if token != "inet" {
            continue;
        }
        let Some(value) = tokens.next() else {
            break;
        };
        let value = value.trim_start_matches("addr:");
        let value = value.split('/').next().unwrap_or(value);
        if let Ok(addr) = value.parse::<Ipv4Addr>() {
            if !addr.is_loopback() && !addr.is_unspecified() {
                return Some(addr);
            }
        }
    }
    None
}
