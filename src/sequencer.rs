// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Drive the console from bootloader interrupt through to the image shell prompt.
// Author: Lukas Bower
#![forbid(unsafe_code)]

use std::time::Duration;

use log::{debug, info};
use regex::Regex;

use crate::config::{millis, Patterns, TargetConfig};
use crate::console::{Console, ConsoleError};
use crate::error::{BootError, Phase};
use crate::template::BootStep;

fn failed(phase: Phase) -> impl Fn(ConsoleError) -> BootError {
    move |err| BootError::operation(phase, err)
}

/// One pass through the bootloader, kernel start, login and shell prompt.
pub struct BootSequencer<'a> {
    config: &'a TargetConfig,
    patterns: &'a Patterns,
}

impl<'a> BootSequencer<'a> {
    /// Sequence boots for `config` using its compiled `patterns`.
    #[must_use]
    pub fn new(config: &'a TargetConfig, patterns: &'a Patterns) -> Self {
        Self { config, patterns }
    }

    /// Run the whole sequence once. The caller owns the reset that precedes it.
    pub fn run<C: Console + ?Sized>(&self, console: &mut C, steps: &[BootStep]) -> Result<(), BootError> {
        self.enter_bootloader(console)?;
        self.issue_commands(console, steps)?;
        info!("{}: boot commands issued, waiting for the kernel", self.config.name);
        console
            .expect(
                std::slice::from_ref(&self.patterns.image_boot_msg),
                millis(self.config.bootloader.image_boot_timeout_ms),
            )
            .map_err(failed(Phase::ImageBoot))?;
        self.login_and_wait_for_shell(console)?;
        info!("{}: image shell prompt reached", self.config.name);
        Ok(())
    }

    fn bootloader_wait(&self) -> Duration {
        millis(self.config.bootloader.bootloader_timeout_ms)
    }

    fn enter_bootloader<C: Console + ?Sized>(&self, console: &mut C) -> Result<(), BootError> {
        let bootloader = &self.config.bootloader;
        console
            .expect(
                std::slice::from_ref(&self.patterns.interrupt_boot_prompt),
                millis(bootloader.interrupt_boot_timeout_ms),
            )
            .map_err(failed(Phase::EnterBootloader))?;
        let interrupted = match bootloader.interrupt_boot_control_character {
            Some(letter) => console.send_control(letter),
            None => console.send_line(&bootloader.interrupt_boot_command),
        };
        interrupted.map_err(failed(Phase::EnterBootloader))?;
        console
            .expect(std::slice::from_ref(&self.patterns.bootloader_prompt), self.bootloader_wait())
            .map_err(failed(Phase::EnterBootloader))?;
        debug!("{}: at the bootloader prompt", self.config.name);
        Ok(())
    }

    fn issue_commands<C: Console + ?Sized>(&self, console: &mut C, steps: &[BootStep]) -> Result<(), BootError> {
        let fail = failed(Phase::BootCommands);
        let prompt = std::slice::from_ref(&self.patterns.bootloader_prompt);
        let mut at_prompt = true;
        if let Some(cmd) = &self.config.bootloader.pre_boot_cmd {
            console.send_line(cmd).map_err(&fail)?;
            at_prompt = false;
        }
        for step in steps {
            match step {
                BootStep::Send(line) => {
                    if !at_prompt {
                        console.expect(prompt, self.bootloader_wait()).map_err(&fail)?;
                    }
                    console.send_line(line).map_err(&fail)?;
                    at_prompt = false;
                }
                BootStep::SendLine(line) => {
                    console.send_line(line).map_err(&fail)?;
                    at_prompt = false;
                }
                BootStep::Expect(pattern) => {
                    let pattern = Regex::new(pattern).map_err(|err| {
                        BootError::Config(format!("boot command expects an invalid pattern: {err}"))
                    })?;
                    console
                        .expect(std::slice::from_ref(&pattern), self.bootloader_wait())
                        .map_err(&fail)?;
                }
            }
        }
        Ok(())
    }

    fn login_and_wait_for_shell<C: Console + ?Sized>(&self, console: &mut C) -> Result<(), BootError> {
        let shell_wait = millis(self.config.shell.boot_timeout_ms);
        let shell = &self.patterns.test_image_prompts;
        let (Some(login), Some(login_prompt)) = (&self.config.login, &self.patterns.login_prompt) else {
            console.expect(shell, shell_wait).map_err(failed(Phase::ShellPrompt))?;
            return Ok(());
        };

        let mut first = Vec::with_capacity(shell.len() + 1);
        first.push(login_prompt.clone());
        first.extend(shell.iter().cloned());
        let seen = console.expect(&first, shell_wait).map_err(failed(Phase::Login))?;
        if seen.index != 0 {
            debug!("{}: shell prompt before login prompt, skipping login", self.config.name);
            return Ok(());
        }

        let fail = failed(Phase::Login);
        console.send_line(&login.username).map_err(&fail)?;
        if let (Some(password_prompt), Some(password)) = (&self.patterns.password_prompt, &login.password) {
            console
                .expect(std::slice::from_ref(password_prompt), shell_wait)
                .map_err(&fail)?;
            console.send_line(password).map_err(&fail)?;
        }
        for cmd in &login.login_commands {
            console.send_line(cmd).map_err(&fail)?;
        }
        console.expect(shell, shell_wait).map_err(failed(Phase::ShellPrompt))?;
        Ok(())
    }
}
