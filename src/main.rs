// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: CLI entry point for the devboot boot and deployment tool.
// Author: Lukas Bower
#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! CLI entry point for the devboot boot and deployment tool.

use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use env_logger::Env;
use log::{error, info, LevelFilter};

use devboot::bridge::{copy_tree, replace_tree};
use devboot::template::BootStep;
use devboot::{
    default_config_path, load_config, BootError, BootOutcome, DeploymentRequest, ExpectConsole,
    Orchestrator, TargetConfig,
};

#[derive(Debug, Parser)]
#[command(author = "Lukas Bower", version, about = "Boot and deploy images on devices under test")]
struct Cli {
    /// Path to the target configuration TOML.
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Enable debug logging.
    #[arg(long, short, default_value_t = false)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Deploy a request and boot the device to the test prompt.
    Boot {
        /// Deployment request (YAML or JSON).
        request: PathBuf,
    },
    /// Stage a request and print the boot commands without touching the device.
    Render {
        /// Deployment request (YAML or JSON).
        request: PathBuf,
    },
    /// Copy a device directory to the host.
    Pull(AccessArgs),
    /// Replace a device directory with a host directory's contents.
    Push(AccessArgs),
}

#[derive(Debug, Parser)]
struct AccessArgs {
    /// Deployment request (YAML or JSON).
    request: PathBuf,
    /// Absolute directory on the device.
    device_dir: String,
    /// Host directory to copy into (pull) or mirror onto the device (push).
    host_dir: PathBuf,
    /// Partition number, recorded for logs.
    #[arg(long)]
    partition: Option<u32>,
}

fn init_logging(verbose: bool) {
    let default_level = if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Warn
    };
    let mut builder =
        env_logger::Builder::from_env(Env::default().default_filter_or(default_level.as_str()));
    builder.format_timestamp_millis();
    let _ = builder.try_init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let outcome = match err.downcast_ref::<BootError>() {
                Some(boot) if boot.is_retryable() => BootOutcome::RetryableFailure,
                _ => BootOutcome::FatalFailure,
            };
            error!("{err:#}");
            eprintln!("devboot: {}: {err:#}", outcome.label());
            ExitCode::from(u8::try_from(outcome.exit_code()).unwrap_or(1))
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let config_path = cli.config.unwrap_or_else(default_config_path);
    let config = load_config(&config_path)?;
    match cli.command {
        Command::Boot { request } => run_boot(config, &request),
        Command::Render { request } => run_render(config, &request),
        Command::Pull(args) => run_access(config, args, Direction::Pull),
        Command::Push(args) => run_access(config, args, Direction::Push),
    }
}

fn deploy<C: devboot::Console>(orchestrator: &mut Orchestrator<C>, request: &DeploymentRequest) -> Result<()> {
    if request.is_image() {
        orchestrator.deploy_image(request)?;
    } else {
        orchestrator.deploy(request)?;
    }
    Ok(())
}

fn open(config: TargetConfig) -> Result<Orchestrator<ExpectConsole>> {
    let console = ExpectConsole::open(&config.console)?;
    Ok(Orchestrator::new(config, console)?)
}

fn run_boot(config: TargetConfig, request_path: &Path) -> Result<()> {
    let request = DeploymentRequest::load(request_path)?;
    let mut orchestrator = open(config)?;
    deploy(&mut orchestrator, &request)?;
    let result = orchestrator.ensure_booted();
    let outcome = BootOutcome::from_result(&result);
    info!(
        "{}: {} after {} attempt(s)",
        orchestrator.config().name,
        outcome.label(),
        orchestrator.session().attempts()
    );
    result?;
    println!("{}", outcome.label());
    Ok(())
}

fn run_render(config: TargetConfig, request_path: &Path) -> Result<()> {
    let request = DeploymentRequest::load(request_path)?;
    let offline = ExpectConsole::new(io::empty(), io::sink());
    let mut orchestrator = Orchestrator::new(config, offline)?;
    deploy(&mut orchestrator, &request)?;
    if let Some(deployment) = orchestrator.deployment() {
        for (token, value) in deployment.tags.iter() {
            println!("# {token} = {value}");
        }
    }
    for step in orchestrator.render_boot_commands()? {
        match step {
            BootStep::Send(line) => println!("{line}"),
            BootStep::SendLine(line) => println!("sendline {line}"),
            BootStep::Expect(pattern) => println!("expect {pattern}"),
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Copy)]
enum Direction {
    Pull,
    Push,
}

fn run_access(config: TargetConfig, args: AccessArgs, direction: Direction) -> Result<()> {
    let request = DeploymentRequest::load(&args.request)?;
    let mut orchestrator = open(config)?;
    deploy(&mut orchestrator, &request)?;
    let host_dir = args.host_dir;
    orchestrator.with_filesystem_access(args.partition, &args.device_dir, |device| {
        match direction {
            Direction::Pull => copy_tree(device, &host_dir)
                .with_context(|| format!("copy {} to {}", device.display(), host_dir.display())),
            Direction::Push => replace_tree(&host_dir, device)
                .with_context(|| format!("copy {} to {}", host_dir.display(), device.display())),
        }
    })?;
    info!("{direction:?} of {} complete", args.device_dir);
    Ok(())
}
