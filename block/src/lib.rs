// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
//
// Portions Copyright 2017 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE-BSD-3-Clause file.
//
// Copyright © 2020 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

//! Block node graph with internal snapshot and dirty bitmap management.
//!
//! Nodes are opened into a [`BlockGraph`], each one backed by a
//! [`BlockDriver`](driver::BlockDriver). Filters sit on top of a single
//! child and forward whatever they don't implement themselves. Snapshot and
//! dirty bitmap commands address nodes by name through [`control`].

#[macro_use]
extern crate log;

pub mod config;
pub mod control;
pub mod dirty_bitmap;
pub mod driver;
pub mod events;
pub mod fcntl;
pub mod filter;
pub mod graph;
pub mod io;
pub mod memory;
pub mod permission;
pub mod raw;
pub mod relay;
pub mod snapshot;
pub mod transaction;

use std::io as std_io;
use std::result;

use remain::sorted;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use crate::driver::{BlockDriver, OpenOptions};
pub use crate::graph::{AioContext, BlockGraph, ChildEdge, Node, NodeRef};
pub use crate::snapshot::{GroupError, SnapshotInfo};

const SECTOR_SHIFT: u8 = 9;
pub const SECTOR_SIZE: u64 = 0x01 << SECTOR_SHIFT;

/// Machine-checkable classification of an [`Error`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    AlreadyExists,
    Busy,
    InvalidArgument,
    Io,
    NoMedium,
    NotFound,
    NotSupported,
    PermissionConflict,
    ReadOnly,
}

#[sorted]
#[derive(Error, Debug)]
pub enum Error {
    #[error("{0}")]
    AlreadyExists(String),
    #[error("{0}")]
    Busy(String),
    #[error("{0}")]
    InvalidArgument(String),
    #[error("{context}")]
    Io {
        context: String,
        #[source]
        source: std_io::Error,
    },
    #[error("{0}")]
    NoMedium(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    NotSupported(String),
    #[error("{0}")]
    PermissionConflict(String),
    #[error("{0}")]
    ReadOnly(String),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::AlreadyExists(_) => ErrorKind::AlreadyExists,
            Error::Busy(_) => ErrorKind::Busy,
            Error::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Error::Io { .. } => ErrorKind::Io,
            Error::NoMedium(_) => ErrorKind::NoMedium,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::NotSupported(_) => ErrorKind::NotSupported,
            Error::PermissionConflict(_) => ErrorKind::PermissionConflict,
            Error::ReadOnly(_) => ErrorKind::ReadOnly,
        }
    }

    pub(crate) fn io(context: impl Into<String>, source: std_io::Error) -> Self {
        Error::Io {
            context: context.into(),
            source,
        }
    }

    /// Same error, with `prefix` in front of its message.
    pub fn prefixed(self, prefix: &str) -> Self {
        let p = |msg: String| format!("{prefix}: {msg}");
        match self {
            Error::AlreadyExists(msg) => Error::AlreadyExists(p(msg)),
            Error::Busy(msg) => Error::Busy(p(msg)),
            Error::InvalidArgument(msg) => Error::InvalidArgument(p(msg)),
            Error::Io { context, source } => Error::Io {
                context: p(context),
                source,
            },
            Error::NoMedium(msg) => Error::NoMedium(p(msg)),
            Error::NotFound(msg) => Error::NotFound(p(msg)),
            Error::NotSupported(msg) => Error::NotSupported(p(msg)),
            Error::PermissionConflict(msg) => Error::PermissionConflict(p(msg)),
            Error::ReadOnly(msg) => Error::ReadOnly(p(msg)),
        }
    }
}

pub type Result<T> = result::Result<T, Error>;

/// Ceiling of the division of `dividend`/`divisor`.
pub(crate) fn div_round_up(dividend: u64, divisor: u64) -> u64 {
    dividend / divisor + u64::from(dividend % divisor != 0)
}
