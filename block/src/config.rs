// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

//! Declarative description of a node graph.
//!
//! A [`TopologyConfig`] lists the nodes to open, in order, the devices
//! attached on top of them and the replay relay driving the graph. It is
//! validated as a whole before anything is opened.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::driver::{BlockDriver, OpenOptions};
use crate::filter::copy_on_read::CopyOnRead;
use crate::filter::replay::Replay;
use crate::graph::BlockGraph;
use crate::memory::{MemoryImage, DEFAULT_CLUSTER_SIZE, DEFAULT_MAX_BITMAPS};
use crate::permission::{self, PermissionName};
use crate::raw::RawFile;
use crate::relay::{EventRelay, ReplayMode};

const MIN_CLUSTER_SIZE: u32 = 512;
const MAX_CLUSTER_SIZE: u32 = 2 << 20;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Node name must not be empty")]
    EmptyNodeName,
    #[error("Duplicate nodes with node-name '{0}'")]
    DuplicateNode(String),
    #[error("Node '{0}' has size 0")]
    ZeroSize(String),
    #[error("Cluster size {1} of node '{0}' is not a power of two between 512 and 2 MiB")]
    InvalidClusterSize(String, u32),
    #[error("Node '{0}' can't store any bitmap")]
    NoBitmapCapacity(String),
    #[error("Child '{child}' of node '{node}' must be declared before it")]
    UnknownChild { node: String, child: String },
    #[error("Duplicate devices with id '{0}'")]
    DuplicateDevice(String),
    #[error("Device '{device}' refers to unknown node '{node}'")]
    UnknownDeviceNode { device: String, node: String },
    #[error("Unknown vm-state node '{0}'")]
    UnknownVmStateNode(String),
    #[error("A replay script is only used in replay mode")]
    ScriptWithoutReplay,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid topology")]
    Invalid(#[source] ValidationError),
    #[error("Failed to open node '{0}'")]
    OpenNode(String, #[source] crate::Error),
    #[error("Failed to attach device '{0}'")]
    AttachDevice(String, #[source] crate::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

fn default_cluster_size() -> u32 {
    DEFAULT_CLUSTER_SIZE
}

fn default_max_bitmaps() -> usize {
    DEFAULT_MAX_BITMAPS
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "driver", rename_all = "kebab-case")]
pub enum DriverConfig {
    Memory {
        size: u64,
        #[serde(rename = "cluster-size", default = "default_cluster_size")]
        cluster_size: u32,
        #[serde(rename = "max-bitmaps", default = "default_max_bitmaps")]
        max_bitmaps: usize,
        #[serde(default)]
        backing: Option<String>,
    },
    Raw {
        path: PathBuf,
    },
    CopyOnRead {
        file: String,
    },
    Replay {
        file: String,
    },
}

impl DriverConfig {
    /// Nodes this one takes as children.
    fn children(&self) -> Vec<&str> {
        match self {
            DriverConfig::Memory { backing, .. } => backing.iter().map(String::as_str).collect(),
            DriverConfig::Raw { .. } => Vec::new(),
            DriverConfig::CopyOnRead { file } | DriverConfig::Replay { file } => vec![file.as_str()],
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct NodeConfig {
    pub node_name: String,
    #[serde(default)]
    pub read_only: bool,
    /// Execution context; nodes without one share the main context.
    #[serde(default)]
    pub context: Option<String>,
    #[serde(flatten)]
    pub driver: DriverConfig,
}

fn default_device_perm() -> Vec<PermissionName> {
    vec![PermissionName::ConsistentRead, PermissionName::Write]
}

fn default_device_shared() -> Vec<PermissionName> {
    vec![
        PermissionName::ConsistentRead,
        PermissionName::WriteUnchanged,
    ]
}

/// Guest device attached to a root node.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct DeviceConfig {
    pub id: String,
    pub node: String,
    #[serde(default = "default_device_perm")]
    pub perm: Vec<PermissionName>,
    #[serde(default = "default_device_shared")]
    pub shared: Vec<PermissionName>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct TopologyConfig {
    #[serde(default)]
    pub nodes: Vec<NodeConfig>,
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
    /// Node receiving the VM state on `savevm`.
    #[serde(default)]
    pub vm_state_node: Option<String>,
    #[serde(default)]
    pub replay_mode: ReplayMode,
    /// Release order to replay, as logged by an earlier recording.
    #[serde(default)]
    pub replay_script: Vec<u64>,
}

impl TopologyConfig {
    pub fn validate(&self) -> std::result::Result<(), ValidationError> {
        let mut declared: HashSet<&str> = HashSet::new();

        for node in self.nodes.iter() {
            let name = node.node_name.as_str();
            if name.is_empty() {
                return Err(ValidationError::EmptyNodeName);
            }
            if declared.contains(name) {
                return Err(ValidationError::DuplicateNode(name.to_string()));
            }

            if let DriverConfig::Memory {
                size,
                cluster_size,
                max_bitmaps,
                ..
            } = &node.driver
            {
                if *size == 0 {
                    return Err(ValidationError::ZeroSize(name.to_string()));
                }
                if !cluster_size.is_power_of_two()
                    || !(MIN_CLUSTER_SIZE..=MAX_CLUSTER_SIZE).contains(cluster_size)
                {
                    return Err(ValidationError::InvalidClusterSize(
                        name.to_string(),
                        *cluster_size,
                    ));
                }
                if *max_bitmaps == 0 {
                    return Err(ValidationError::NoBitmapCapacity(name.to_string()));
                }
            }

            for child in node.driver.children() {
                if !declared.contains(child) {
                    return Err(ValidationError::UnknownChild {
                        node: name.to_string(),
                        child: child.to_string(),
                    });
                }
            }

            declared.insert(name);
        }

        let mut ids = HashSet::new();
        for device in self.devices.iter() {
            if !ids.insert(device.id.as_str()) {
                return Err(ValidationError::DuplicateDevice(device.id.clone()));
            }
            if !declared.contains(device.node.as_str()) {
                return Err(ValidationError::UnknownDeviceNode {
                    device: device.id.clone(),
                    node: device.node.clone(),
                });
            }
        }

        if let Some(vm_state_node) = &self.vm_state_node {
            if !declared.contains(vm_state_node.as_str()) {
                return Err(ValidationError::UnknownVmStateNode(vm_state_node.clone()));
            }
        }

        if self.replay_mode == ReplayMode::Record && !self.replay_script.is_empty() {
            return Err(ValidationError::ScriptWithoutReplay);
        }

        Ok(())
    }

    /// Opens every node and attaches every device.
    ///
    /// On failure, whatever was opened already is closed again.
    pub fn build(&self) -> Result<BlockGraph> {
        self.validate().map_err(Error::Invalid)?;

        let relay = match self.replay_mode {
            ReplayMode::Record => EventRelay::new(ReplayMode::Record),
            ReplayMode::Replay => EventRelay::replaying(self.replay_script.iter().copied()),
        };
        let graph = BlockGraph::with_relay(Arc::new(relay));

        if let Err(e) = self.populate(&graph) {
            graph.close_all();
            return Err(e);
        }

        graph.set_vm_state_node(self.vm_state_node.as_deref());
        info!(
            "Built graph of {} nodes and {} devices",
            self.nodes.len(),
            self.devices.len()
        );

        Ok(graph)
    }

    fn populate(&self, graph: &BlockGraph) -> Result<()> {
        for node in self.nodes.iter() {
            let open_error = |e: crate::Error| Error::OpenNode(node.node_name.clone(), e);
            let child = |name: &str| graph.lookup(name).map_err(open_error);

            let mut options = OpenOptions {
                read_only: node.read_only,
                context: node.context.clone(),
                ..Default::default()
            };
            let driver: Arc<dyn BlockDriver> = match &node.driver {
                DriverConfig::Memory {
                    size,
                    cluster_size,
                    max_bitmaps,
                    backing,
                } => {
                    if let Some(backing) = backing {
                        options.backing = Some(child(backing)?);
                    }
                    Arc::new(
                        MemoryImage::new(*size)
                            .with_cluster_size(*cluster_size)
                            .with_max_bitmaps(*max_bitmaps),
                    )
                }
                DriverConfig::Raw { path } => Arc::new(RawFile::new(path)),
                DriverConfig::CopyOnRead { file } => {
                    options.file = Some(child(file)?);
                    Arc::new(CopyOnRead)
                }
                DriverConfig::Replay { file } => {
                    options.file = Some(child(file)?);
                    Arc::new(Replay::new(Arc::clone(graph.relay())))
                }
            };

            graph
                .open_node(&node.node_name, driver, options)
                .map_err(open_error)?;
        }

        for device in self.devices.iter() {
            let attach_error = |e: crate::Error| Error::AttachDevice(device.id.clone(), e);
            let bs = graph.lookup(&device.node).map_err(attach_error)?;
            graph
                .attach_device(
                    &device.id,
                    &bs,
                    permission::from_names(&device.perm),
                    permission::from_names(&device.shared),
                )
                .map_err(attach_error)?;
        }

        Ok(())
    }
}
