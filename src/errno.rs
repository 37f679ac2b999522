/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Status-code translation: every dispatcher handler returns `0` on
//! success or a negative POSIX errno on failure (spec §6). Errno is
//! always captured at the site of the failing syscall, before any
//! further call that might clobber it (spec §7's propagation policy).

use std::io;

/// Capture the errno carried by an `io::Error`, falling back to
/// `EIO` if the platform didn't attach one (should not happen for
/// syscall-originated errors, but this keeps the mapping total).
pub fn errno_of(err: &io::Error) -> i32 {
    err.raw_os_error().unwrap_or(libc::EIO)
}
