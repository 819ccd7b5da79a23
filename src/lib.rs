// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Boot and deployment orchestration for bootloader-managed devices under test.
// Author: Lukas Bower
#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! Stage kernels, ramdisks and images for a device, drive its bootloader over
//! a serial console until a test shell answers, and give callers scoped
//! access to directories on the running device.

/// Artifact kinds, sets and the resolver producing boot tags.
pub mod artifact;
/// Scoped device filesystem access over NFS or tarball shuttles.
pub mod bridge;
/// Target configuration loader and validation.
pub mod config;
/// Pattern-matching console sessions.
pub mod console;
/// Artifact download and checksum helpers.
pub mod download;
/// Error and outcome types.
pub mod error;
/// Throwaway host HTTP endpoint for device fetches.
pub mod exchange;
/// Capability interface and the no-fallback stand-in.
pub mod fallback;
/// Per-target orchestrator.
pub mod orchestrator;
/// Power switches and the boot-once controller.
pub mod power;
/// Deployment request documents.
pub mod request;
/// Prompt-aware device command runner.
pub mod runner;
/// Bootloader console driver.
pub mod sequencer;
/// Boot session state machine.
pub mod session;
/// Host staging directories.
pub mod staging;
/// Bootloader strategy classifier.
pub mod strategy;
/// Boot template placeholders.
pub mod tags;
/// Tarball packing helpers.
pub mod tarball;
/// Boot command templates.
pub mod template;
/// Legacy U-Boot image headers.
pub mod uimage;

pub use artifact::{ArtifactKind, ArtifactSet, Deployment};
pub use config::{default_config_path, load_config, TargetConfig};
pub use console::{Console, ConsoleError, ConsoleMatch, ExpectConsole, Transcript};
pub use error::{BootError, BootOutcome, Phase};
pub use fallback::{BootTarget, NoFallback};
pub use orchestrator::Orchestrator;
pub use request::DeploymentRequest;
pub use session::{BootSession, BootState};
pub use strategy::BootStrategy;
pub use tags::TagMap;
