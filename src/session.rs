// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Track the boot lifecycle of one target for the current deployment.
// Author: Lukas Bower
#![forbid(unsafe_code)]

use std::fmt;

use crate::error::BootError;

/// Lifecycle state of a target's boot for the current deployment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum BootState {
    /// Nothing has been attempted since the last deployment.
    #[default]
    NotBooted,
    /// A boot attempt is driving the console.
    Booting,
    /// The test shell prompt was reached.
    Booted,
    /// The last attempt timed out or lost the console.
    Failed,
}

impl fmt::Display for BootState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::NotBooted => "not-booted",
            Self::Booting => "booting",
            Self::Booted => "booted",
            Self::Failed => "failed",
        })
    }
}

/// Boot session guarding the permitted state transitions.
#[derive(Debug, Clone, Default)]
pub struct BootSession {
    state: BootState,
    attempts: u32,
}

impl BootSession {
    /// Create a session in [`BootState::NotBooted`].
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> BootState {
        self.state
    }

    /// Return `true` once the test prompt has been reached.
    #[must_use]
    pub fn is_booted(&self) -> bool {
        self.state == BootState::Booted
    }

    /// Number of boot attempts started since the last reset.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Start an attempt. Allowed from `NotBooted` and from `Failed`.
    pub fn begin(&mut self) -> Result<(), BootError> {
        match self.state {
            BootState::NotBooted | BootState::Failed => {
                self.attempts = self.attempts.saturating_add(1);
                self.transition(BootState::Booting);
                Ok(())
            }
            from => Err(BootError::InvalidTransition {
                from,
                to: BootState::Booting,
            }),
        }
    }

    /// Record prompt detection for the running attempt.
    pub fn succeed(&mut self) -> Result<(), BootError> {
        self.finish(BootState::Booted)
    }

    /// Record a timeout or console failure for the running attempt.
    pub fn fail(&mut self) -> Result<(), BootError> {
        self.finish(BootState::Failed)
    }

    /// Forget all progress; used when a new deployment starts.
    pub fn reset(&mut self) {
        self.transition(BootState::NotBooted);
        self.attempts = 0;
    }

    fn finish(&mut self, to: BootState) -> Result<(), BootError> {
        if self.state != BootState::Booting {
            return Err(BootError::InvalidTransition {
                from: self.state,
                to,
            });
        }
        self.transition(to);
        Ok(())
    }

    fn transition(&mut self, to: BootState) {
        if self.state != to {
            log::debug!("boot session {} -> {}", self.state, to);
        }
        self.state = to;
    }
}
