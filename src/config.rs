/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct Config {
    /// Name (or path) of the `git` binary invoked by the repository driver
    pub git_binary: String,
    /// Name (or path) of the `git-annex` binary invoked by the repository driver
    pub git_annex_binary: String,
    /// Timeout, in seconds, for `annex_get` before the placeholder is treated as unreachable
    pub annex_get_timeout_secs: u32,
    pub commit_messages: CommitMessages,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            git_binary: "git".to_owned(),
            git_annex_binary: "git-annex".to_owned(),
            annex_get_timeout_secs: 300,
            commit_messages: CommitMessages::default(),
        }
    }
}

/// Commit message templates used when staging each kind of mutating
/// operation. `{placeholder}` tokens are substituted per-call; see
/// `dispatcher::render`.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct CommitMessages {
    pub removed: String,
    pub symlink_created: String,
    pub moved: String,
    pub chmod: String,
    pub chown: String,
    pub truncate: String,
    pub utimens: String,
    pub released: String,
}

impl Default for CommitMessages {
    fn default() -> Self {
        CommitMessages {
            removed: "removed {path}".to_owned(),
            symlink_created: "created symlink {link} -> {target}".to_owned(),
            moved: "moved {from} to {to}".to_owned(),
            chmod: "chmoded {path} to {mode:o}".to_owned(),
            chown: "chmown on {path}".to_owned(),
            truncate: "truncated on {path}".to_owned(),
            utimens: "utimens on {path}".to_owned(),
            released: "released {path}".to_owned(),
        }
    }
}
