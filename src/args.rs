/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use clap::Parser;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Path to the repository working tree (must contain a `files` subdirectory)
    pub repo_root: String,

    /// Where to mount the presented filesystem
    pub mountpoint: String,

    /// Path to configuration file in TOML format
    #[arg(long, default_value_t = String::from("./config.toml"))]
    pub config_path: String,

    /// Stay in the foreground instead of forking into the background
    #[arg(short, long, default_value_t = false)]
    pub foreground: bool,

    /// Allow other users to access the mount (requires user_allow_other in fuse.conf)
    #[arg(long, default_value_t = false)]
    pub allow_other: bool,
}
