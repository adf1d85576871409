// Copyright © 2025 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0

//! Filter drivers: nodes with exactly one filtered child.

pub mod copy_on_read;
pub mod replay;

use crate::driver::OpenOptions;
use crate::graph::NodeRef;
use crate::permission::ChildRole;
use crate::{Error, Result};

/// Attaches the `file` option as the filtered child and inherits the flags
/// the child supports natively.
pub(crate) fn open_filtered_child(bs: &NodeRef, options: &OpenOptions) -> Result<()> {
    let file = options.file.as_ref().ok_or_else(|| {
        Error::InvalidArgument(format!(
            "Filter node '{}' requires a 'file' child",
            bs.name()
        ))
    })?;

    bs.attach_child(file, "file", ChildRole::FILTERED | ChildRole::PRIMARY)?;
    bs.set_supported_flags(file.supported_write_flags(), file.supported_zero_flags());

    Ok(())
}
