// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Boot control flow against a simulated U-Boot device.
// Author: Lukas Bower
#![forbid(unsafe_code)]

mod support;

use std::fs;
use std::path::Path;
use std::time::{Duration, Instant};

use devboot::power::ResetKind;
use devboot::{
    ArtifactKind, ArtifactSet, BootError, BootOutcome, BootState, BootStrategy, Console, DeploymentRequest,
    Orchestrator, Phase,
};

use support::{input, sim_config, RecordingFallback, SimConsole, SimDevice};

fn kernel_and_ramdisk(dir: &Path) -> DeploymentRequest {
    DeploymentRequest::new(
        "u_boot",
        ArtifactSet::default()
            .with(ArtifactKind::Kernel, input(dir, "zImage", b"kernel"))
            .with(ArtifactKind::Ramdisk, input(dir, "initrd.gz", b"ramdisk")),
    )
}

fn orchestrator(root: &Path, device: &SimDevice) -> Orchestrator<SimConsole> {
    Orchestrator::new(sim_config(root, ""), device.console())
        .unwrap()
        .with_power_switch(device.power_switch())
}

fn exports(device: &SimDevice) -> usize {
    device
        .state()
        .shell_lines
        .iter()
        .filter(|line| line.starts_with("export PS1="))
        .count()
}

#[test]
fn unknown_strategy_never_touches_the_console() {
    let root = tempfile::tempdir().unwrap();
    let device = SimDevice::new();
    let mut orchestrator = orchestrator(root.path(), &device);

    let mut request = kernel_and_ramdisk(root.path());
    request.bootloader = "grub".to_owned();
    let result = orchestrator.deploy(&request);
    assert!(matches!(&result, Err(BootError::UnsupportedStrategy(name)) if name == "grub"));
    assert_eq!(BootOutcome::from_result(&result), BootOutcome::FatalFailure);

    assert!(device.state().sent.is_empty());
    assert!(orchestrator.console().transcript().text().is_empty());
    assert!(fs::read_dir(orchestrator.staging().dir()).unwrap().next().is_none());
    assert_eq!(device.state().power_cycles, 0);
}

#[test]
fn ensure_booted_boots_once_then_reasserts_the_prompt() {
    let root = tempfile::tempdir().unwrap();
    let device = SimDevice::new();
    let mut orchestrator = orchestrator(root.path(), &device);
    orchestrator.deploy(&kernel_and_ramdisk(root.path())).unwrap();

    assert_eq!(orchestrator.ensure_booted().unwrap(), Some(ResetKind::Hard));
    assert_eq!(orchestrator.ensure_booted().unwrap(), None);

    let state = device.state();
    assert_eq!(state.power_cycles, 1);
    assert_eq!(state.soft_reboots, 0);
    assert_eq!(state.bootloader_lines.len(), 4);
    assert_eq!(state.bootloader_lines[0], "setenv serverip 127.0.0.1");
    assert!(state.bootloader_lines[2].ends_with("initrd.gz.uboot"));
    assert!(state.bootloader_lines[3].starts_with("bootm"));
    drop(state);
    assert_eq!(exports(&device), 2);
    assert_eq!(orchestrator.session().state(), BootState::Booted);
    assert_eq!(orchestrator.session().attempts(), 1);
    assert!(orchestrator
        .console()
        .transcript()
        .lines()
        .iter()
        .any(|line| line.starts_with("Starting kernel")));
}

#[test]
fn soft_reset_without_a_power_switch() {
    let root = tempfile::tempdir().unwrap();
    let device = SimDevice::new();
    let mut orchestrator = Orchestrator::new(sim_config(root.path(), ""), device.console()).unwrap();
    orchestrator.deploy(&kernel_and_ramdisk(root.path())).unwrap();

    assert_eq!(orchestrator.ensure_booted().unwrap(), Some(ResetKind::Soft));
    let state = device.state();
    assert_eq!(state.power_cycles, 0);
    assert_eq!(state.soft_reboots, 1);
    assert_eq!(state.shell_lines[0], "reboot");
}

#[test]
fn missing_shell_prompt_fails_within_the_bound() {
    let root = tempfile::tempdir().unwrap();
    let device = SimDevice::new();
    device.state().hang_kernel = true;
    let mut config = sim_config(root.path(), "");
    config.shell.boot_timeout_ms = 300;
    let mut orchestrator = Orchestrator::new(config, device.console())
        .unwrap()
        .with_power_switch(device.power_switch());
    orchestrator.deploy(&kernel_and_ramdisk(root.path())).unwrap();

    let started = Instant::now();
    let result = orchestrator.ensure_booted();
    let elapsed = started.elapsed();
    let err = result.as_ref().unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(err.phase(), Some(Phase::ShellPrompt));
    assert_eq!(BootOutcome::from_result(&result), BootOutcome::RetryableFailure);
    assert!(elapsed >= Duration::from_millis(300));
    assert!(elapsed < Duration::from_millis(300) + Duration::from_secs(2));
    assert_eq!(orchestrator.session().state(), BootState::Failed);

    device.state().hang_kernel = false;
    assert_eq!(orchestrator.ensure_booted().unwrap(), Some(ResetKind::Hard));
    assert_eq!(device.state().power_cycles, 2);
    assert_eq!(orchestrator.session().attempts(), 2);
}

#[test]
fn new_deployment_resets_the_session() {
    let root = tempfile::tempdir().unwrap();
    let device = SimDevice::new();
    let mut orchestrator = orchestrator(root.path(), &device);
    orchestrator.deploy(&kernel_and_ramdisk(root.path())).unwrap();
    orchestrator.ensure_booted().unwrap();

    orchestrator.deploy(&kernel_and_ramdisk(root.path())).unwrap();
    assert_eq!(orchestrator.session().state(), BootState::NotBooted);
    assert_eq!(orchestrator.ensure_booted().unwrap(), Some(ResetKind::Hard));
    assert_eq!(device.state().power_cycles, 2);
}

#[test]
fn none_strategy_delegates_without_console_traffic() {
    let root = tempfile::tempdir().unwrap();
    let device = SimDevice::new();
    let fallback = RecordingFallback::default();
    *fallback.root.lock().unwrap() = Some(root.path().join("fallback-root"));
    let mut orchestrator = orchestrator(root.path(), &device).with_fallback(fallback.clone());

    orchestrator
        .deploy(&DeploymentRequest::new("none", ArtifactSet::default()))
        .unwrap();
    assert_eq!(orchestrator.strategy(), Some(BootStrategy::None));
    assert_eq!(orchestrator.ensure_booted().unwrap(), None);
    let answer = orchestrator
        .with_filesystem_access(Some(2), "/etc", |dir| {
            fs::write(dir.join("motd"), "fallback\n")?;
            Ok(42)
        })
        .unwrap();
    assert_eq!(answer, 42);
    assert_eq!(
        fs::read_to_string(root.path().join("fallback-root/etc/motd")).unwrap(),
        "fallback\n"
    );
    assert_eq!(
        fallback.calls(),
        vec![
            "deploy_artifacts:none".to_owned(),
            "attempt_boot".to_owned(),
            "filesystem_access:Some(2):/etc".to_owned(),
        ]
    );
    assert!(device.state().sent.is_empty());
    assert_eq!(device.state().power_cycles, 0);
}

#[test]
fn prebuilt_images_for_uboot_go_to_the_fallback() {
    let root = tempfile::tempdir().unwrap();
    let device = SimDevice::new();
    let fallback = RecordingFallback::default();
    let mut orchestrator = orchestrator(root.path(), &device).with_fallback(fallback.clone());

    let mut request = DeploymentRequest::new("u_boot", ArtifactSet::default());
    request.image = Some("http://images.lab/disk.img".to_owned());
    orchestrator.deploy_image(&request).unwrap();
    assert_eq!(orchestrator.strategy(), Some(BootStrategy::None));
    orchestrator.ensure_booted().unwrap();
    assert_eq!(
        fallback.calls(),
        vec![
            "deploy_image:http://images.lab/disk.img".to_owned(),
            "attempt_boot".to_owned(),
        ]
    );
    assert!(device.state().sent.is_empty());
}

#[test]
fn bootloader_deploy_without_kernel_is_fatal() {
    let root = tempfile::tempdir().unwrap();
    let device = SimDevice::new();
    let mut orchestrator = orchestrator(root.path(), &device);
    let request = DeploymentRequest::new(
        "u_boot",
        ArtifactSet::default().with(ArtifactKind::Ramdisk, input(root.path(), "initrd.gz", b"r")),
    );
    let err = orchestrator.deploy(&request).unwrap_err();
    assert!(matches!(err, BootError::MissingArtifact(ArtifactKind::Kernel)));
    assert!(device.state().sent.is_empty());
}

#[test]
fn nfs_root_is_accessed_on_the_host() {
    let root = tempfile::tempdir().unwrap();
    let device = SimDevice::new();
    let tree = root.path().join("tree");
    fs::create_dir_all(tree.join("etc")).unwrap();
    fs::write(tree.join("etc/hostname"), "sim\n").unwrap();
    let archive = root.path().join("nfs.tgz");
    devboot::tarball::pack_dir(&tree.join("etc"), &archive, "etc").unwrap();

    let mut orchestrator = orchestrator(root.path(), &device);
    let request = DeploymentRequest::new(
        "u_boot",
        ArtifactSet::default()
            .with(ArtifactKind::Kernel, input(root.path(), "zImage", b"kernel"))
            .with(ArtifactKind::NfsRootfs, archive.to_string_lossy()),
    );
    orchestrator.deploy(&request).unwrap();

    let hostname = orchestrator
        .with_filesystem_access(None, "/etc", |dir| {
            fs::write(dir.join("devboot"), "marker")?;
            Ok(fs::read_to_string(dir.join("hostname"))?)
        })
        .unwrap();
    assert_eq!(hostname, "sim\n");

    let nfsroot = orchestrator.deployment().unwrap().nfsroot.clone().unwrap();
    assert_eq!(fs::read_to_string(nfsroot.join("etc/devboot")).unwrap(), "marker");
    let state = device.state();
    assert_eq!(state.power_cycles, 1);
    assert!(state.bootloader_lines.iter().any(|line| line.contains("root=/dev/nfs")));
    assert!(state
        .shell_lines
        .iter()
        .any(|line| line == "cat /proc/net/pnp > /etc/resolv.conf"));
    assert!(!state.shell_lines.iter().any(|line| line.starts_with("tar ")));
}
