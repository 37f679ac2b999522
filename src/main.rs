/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::path::PathBuf;

use anyhow::{Context, Result};
use args::Args;
use clap::Parser;
use config::Config;
use dispatcher::{Dispatcher, MountContext};
use fs::AnnexFilesystem;
use fuser::MountOption;
use log::{error, info};
use path::PathMapper;
use repo::ProcessDriver;

mod annex;
mod args;
mod config;
mod dispatcher;
mod errno;
mod fs;
mod inode;
mod path;
mod repo;

fn main() {
    if let Err(err) = run() {
        error!("{:?}", err);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args = Args::parse();
    init_logging();
    info!("init logger");

    info!("read configuration from {}", args.config_path);
    let config = load_config(&args.config_path)?;

    let repo_root = PathBuf::from(&args.repo_root);
    if !repo_root.join("files").is_dir() {
        anyhow::bail!(
            "repository root '{}' has no 'files' subdirectory",
            repo_root.display()
        );
    }

    if !args.foreground {
        nix::unistd::daemon(true, false).with_context(|| "failed to move to the background")?;
    }

    let mapper = PathMapper::new(&repo_root);
    let driver = Box::new(ProcessDriver::new(repo_root.clone(), &config));
    let context = MountContext {
        mapper,
        driver,
        config,
    };
    let dispatcher = Dispatcher::new(context);
    let filesystem = AnnexFilesystem::new(dispatcher);

    let mut options = vec![MountOption::FSName("annex-fuse".to_owned())];
    if args.allow_other {
        options.push(MountOption::AllowOther);
    }

    info!(
        "mounting '{}' at '{}'",
        repo_root.display(),
        args.mountpoint
    );
    fuser::mount2(filesystem, &args.mountpoint, &options)
        .with_context(|| format!("failed to mount at '{}'", args.mountpoint))?;

    Ok(())
}

fn init_logging() {
    if log4rs::init_file("log4rs.yml", Default::default()).is_err() {
        let stderr = log4rs::append::console::ConsoleAppender::builder().build();
        let config = log4rs::config::Config::builder()
            .appender(log4rs::config::Appender::builder().build("stderr", Box::new(stderr)))
            .build(
                log4rs::config::Root::builder()
                    .appender("stderr")
                    .build(log::LevelFilter::Info),
            )
            .expect("building the fallback logging configuration cannot fail");
        log4rs::init_config(config).expect("no other logger is initialised yet");
        info!("no log4rs.yml found next to the binary, falling back to stderr-only logging");
    }
}

fn load_config(config_path: &str) -> Result<Config> {
    let raw = std::fs::read_to_string(config_path)
        .with_context(|| format!("failed to read configuration file '{config_path}'"))?;
    toml::from_str(&raw).with_context(|| "failed to parse configuration")
}
