// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Classify orchestrator failures into fatal and retryable outcomes.
// Author: Lukas Bower
#![forbid(unsafe_code)]

use std::fmt;

use thiserror::Error;

use crate::artifact::ArtifactKind;
use crate::session::BootState;

/// Step of a deployment, boot or transfer that an operation failure is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Fetching an artifact or locator onto the host.
    Download,
    /// Preparing host-side staging directories.
    Stage,
    /// Running the external power-cycle command.
    PowerCycle,
    /// Interrupting autoboot and reaching the bootloader prompt.
    EnterBootloader,
    /// Issuing the rendered boot command sequence.
    BootCommands,
    /// Waiting for the kernel to report it has started.
    ImageBoot,
    /// Answering login and password prompts.
    Login,
    /// Waiting for, or re-asserting, the shell prompt.
    ShellPrompt,
    /// Running a shell command on the booted device.
    Command,
    /// Packing the requested directory on the device.
    Pack,
    /// Starting the device-side HTTP server.
    Serve,
    /// Fetching the device tarball onto the host.
    Fetch,
    /// Writing the modified tree back to the device.
    PushBack,
}

impl Phase {
    /// Stable lowercase label used in logs and error messages.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Download => "download",
            Self::Stage => "stage",
            Self::PowerCycle => "power-cycle",
            Self::EnterBootloader => "enter-bootloader",
            Self::BootCommands => "boot-commands",
            Self::ImageBoot => "image-boot",
            Self::Login => "login",
            Self::ShellPrompt => "shell-prompt",
            Self::Command => "command",
            Self::Pack => "pack",
            Self::Serve => "serve",
            Self::Fetch => "fetch",
            Self::PushBack => "push-back",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors surfaced by the boot and deployment orchestrator.
#[derive(Debug, Error)]
pub enum BootError {
    /// The requested bootloader strategy name is not recognised.
    #[error("unsupported bootloader strategy '{0}'")]
    UnsupportedStrategy(String),
    /// A mandatory artifact was not supplied.
    #[error("no {0} image to boot")]
    MissingArtifact(ArtifactKind),
    /// A prebuilt image deployment did not name an image.
    #[error("no image to boot")]
    NoImage,
    /// The selected boot command template does not exist.
    #[error("boot command template '{0}' is not defined")]
    MissingTemplate(String),
    /// A template references a placeholder that the deployment did not resolve.
    #[error("template '{template}' references unresolved placeholder {token}")]
    UnresolvedPlaceholder {
        /// Template that carried the placeholder.
        template: String,
        /// Placeholder token, including braces.
        token: String,
    },
    /// Target configuration or request is unusable as written.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// A boot session transition was attempted from the wrong state.
    #[error("boot session cannot move from {from} to {to}")]
    InvalidTransition {
        /// State the session was in.
        from: BootState,
        /// State that was requested.
        to: BootState,
    },
    /// The strategy needs the non-bootloader path but none was injected.
    #[error("target '{0}' has no non-bootloader boot path")]
    NoFallback(String),
    /// A transient hardware or network step failed and may be retried.
    #[error("{phase} failed: {detail}")]
    OperationFailed {
        /// Step that failed.
        phase: Phase,
        /// Human-readable cause.
        detail: String,
    },
    /// Caller code running inside a scoped filesystem access returned an error.
    #[error("filesystem access body failed: {0:#}")]
    Access(anyhow::Error),
}

impl BootError {
    /// Build a retryable failure for `phase`.
    pub fn operation(phase: Phase, detail: impl fmt::Display) -> Self {
        Self::OperationFailed {
            phase,
            detail: detail.to_string(),
        }
    }

    /// Return `true` for configuration defects that must abort the job.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::OperationFailed { .. } | Self::Access(_))
    }

    /// Return `true` when the external job layer may retry the whole call.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::OperationFailed { .. })
    }

    /// Phase attached to a retryable failure.
    #[must_use]
    pub fn phase(&self) -> Option<Phase> {
        match self {
            Self::OperationFailed { phase, .. } => Some(*phase),
            _ => None,
        }
    }

    /// Re-attribute a retryable failure to a different phase, keeping its detail.
    #[must_use]
    pub fn in_phase(self, phase: Phase) -> Self {
        match self {
            Self::OperationFailed { detail, .. } => Self::OperationFailed { phase, detail },
            other => other,
        }
    }
}

/// Tri-state boot signal consumed by the job layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootOutcome {
    /// The device reached the test shell prompt.
    Booted,
    /// A transient failure; a fresh attempt may succeed.
    RetryableFailure,
    /// A configuration defect; the job must abort.
    FatalFailure,
}

impl BootOutcome {
    /// Classify the result of a boot call.
    #[must_use]
    pub fn from_result<T>(result: &Result<T, BootError>) -> Self {
        match result {
            Ok(_) => Self::Booted,
            Err(err) if err.is_fatal() => Self::FatalFailure,
            Err(_) => Self::RetryableFailure,
        }
    }

    /// Process exit code reported by the CLI (`EX_TEMPFAIL` for retryable).
    #[must_use]
    pub fn exit_code(self) -> i32 {
        match self {
            Self::Booted => 0,
            Self::RetryableFailure => 75,
            Self::FatalFailure => 1,
        }
    }

    /// Short label for logs.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Booted => "booted",
            Self::RetryableFailure => "retryable-failure",
            Self::FatalFailure => "fatal-failure",
        }
    }
}
