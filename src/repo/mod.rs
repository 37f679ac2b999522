/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! The Repository Driver: consumed as an opaque set of idempotent
//! operations against a working tree (spec §4.4). Its CLI is not part
//! of this core; callers only depend on the `RepositoryDriver` trait.

pub mod driver;

pub use driver::{ProcessDriver, RepositoryDriver};
