/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Path Mapper: a pure, total, injective translation from a virtual
//! path (as seen inside the mount) to a backing path under
//! `<repo_root>/files`. No normalisation, no symlink resolution, no
//! permission check — see spec §4.1.

use std::path::{Path, PathBuf};

/// Platform path length limit used when bounding a translated path.
pub const PATH_MAX: usize = libc::PATH_MAX as usize;

/// Maps virtual paths under the mount root to backing paths under
/// `<repo_root>/files`.
#[derive(Clone, Debug)]
pub struct PathMapper {
    files_root: PathBuf,
}

impl PathMapper {
    pub fn new(repo_root: &Path) -> Self {
        PathMapper {
            files_root: repo_root.join("files"),
        }
    }

    pub fn files_root(&self) -> &Path {
        &self.files_root
    }

    /// Translate a virtual path (always starting with `/`) into the
    /// backing path. Over-long results are truncated to `PATH_MAX`
    /// bytes rather than silently expanded.
    pub fn to_backing(&self, virtual_path: &str) -> PathBuf {
        let joined = format!("{}{}", self.files_root.display(), virtual_path);
        if joined.len() <= PATH_MAX {
            PathBuf::from(joined)
        } else {
            let mut truncated = joined;
            truncate_at_char_boundary(&mut truncated, PATH_MAX);
            PathBuf::from(truncated)
        }
    }
}

fn truncate_at_char_boundary(s: &mut String, max_len: usize) {
    let mut len = max_len;
    while len > 0 && !s.is_char_boundary(len) {
        len -= 1;
    }
    s.truncate(len);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_root() {
        let mapper = PathMapper::new(Path::new("/srv/repo"));
        assert_eq!(mapper.to_backing("/"), PathBuf::from("/srv/repo/files/"));
    }

    #[test]
    fn maps_nested_path() {
        let mapper = PathMapper::new(Path::new("/srv/repo"));
        assert_eq!(
            mapper.to_backing("/a/b/c.txt"),
            PathBuf::from("/srv/repo/files/a/b/c.txt")
        );
    }

    #[test]
    fn mapping_is_total_and_injective_for_distinct_inputs() {
        let mapper = PathMapper::new(Path::new("/srv/repo"));
        assert_ne!(mapper.to_backing("/a"), mapper.to_backing("/b"));
    }

    #[test]
    fn truncates_over_long_paths_instead_of_expanding() {
        let mapper = PathMapper::new(Path::new("/srv/repo"));
        let long_name: String = std::iter::repeat('x').take(PATH_MAX * 2).collect();
        let backing = mapper.to_backing(&format!("/{long_name}"));
        assert!(backing.as_os_str().len() <= PATH_MAX);
    }
}
