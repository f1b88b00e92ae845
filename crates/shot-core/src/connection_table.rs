//! Connection table model and structural validation.
//!
//! A connection table is the declared device topology: every device node has a
//! unique name, an optional parent, a kind tag, and the addressing attributes
//! that pin it to physical hardware. Each shot carries the table it was compiled
//! against; admission compares that embedded snapshot with the active
//! configuration before anything is queued.
//!
//! # Equality
//!
//! Two tables are equal when their node names, parent edges, ports, kinds,
//! addressing attributes and master flags match. Declaration order,
//! `start_order` and `stop_order` are runtime scheduling hints and are ignored.
//!
//! ```rust,ignore
//! use shot_core::connection_table::{validate, ConnectionTable};
//!
//! let active = ConnectionTable::from_json_file("config/connection_table.json")?;
//! match validate(&active, &shot.connection_table) {
//!     Ok(()) => println!("shot matches the hardware"),
//!     Err(e) => println!("rejected: {e}"),
//! }
//! ```

use crate::error::{ShotError, ShotResult, TableDiff, TableSource};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::Path;

/// One device in the topology.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceNode {
    /// Unique device name
    pub name: String,

    /// Parent device, `None` for roots
    #[serde(default)]
    pub parent: Option<String>,

    /// Device kind tag; selects the worker factory for this device
    pub kind: String,

    /// Port on the parent this device hangs off
    #[serde(default)]
    pub connection: Option<String>,

    /// Addressing attributes (board number, serial, channel, ...)
    #[serde(default)]
    pub addressing: BTreeMap<String, serde_json::Value>,

    /// Transition group rank; devices sharing a rank program concurrently
    #[serde(default)]
    pub start_order: i32,

    /// Teardown group rank used when returning to manual after a clean run
    #[serde(default)]
    pub stop_order: i32,

    /// Whether this device issues the global start trigger
    #[serde(default)]
    pub is_master_pseudoclock: bool,
}

impl DeviceNode {
    /// Create a root node of the given kind.
    pub fn new(name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parent: None,
            kind: kind.into(),
            connection: None,
            addressing: BTreeMap::new(),
            start_order: 0,
            stop_order: 0,
            is_master_pseudoclock: false,
        }
    }

    /// Attach this node to a parent port.
    pub fn with_parent(mut self, parent: impl Into<String>, connection: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self.connection = Some(connection.into());
        self
    }

    /// Set an addressing attribute.
    pub fn with_address(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.addressing.insert(key.into(), value.into());
        self
    }

    /// Set the transition rank.
    pub fn with_start_order(mut self, order: i32) -> Self {
        self.start_order = order;
        self
    }

    /// Set the teardown rank.
    pub fn with_stop_order(mut self, order: i32) -> Self {
        self.stop_order = order;
        self
    }

    /// Flag this node as the master pseudoclock.
    pub fn master(mut self) -> Self {
        self.is_master_pseudoclock = true;
        self
    }

    /// Structural equality, ignoring scheduling ranks.
    fn structurally_equal(&self, other: &DeviceNode) -> bool {
        self.parent == other.parent
            && self.kind == other.kind
            && self.connection == other.connection
            && self.addressing == other.addressing
            && self.is_master_pseudoclock == other.is_master_pseudoclock
    }
}

/// The declared device graph.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionTable {
    /// Device nodes in declaration order
    pub devices: Vec<DeviceNode>,
}

impl ConnectionTable {
    /// Build a table from nodes.
    pub fn new(devices: Vec<DeviceNode>) -> Self {
        Self { devices }
    }

    /// Load a table from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> ShotResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            ShotError::Configuration(format!(
                "Failed to read connection table {}: {}",
                path.display(),
                e
            ))
        })?;
        serde_json::from_str(&text).map_err(|e| {
            ShotError::Configuration(format!(
                "Failed to parse connection table {}: {}",
                path.display(),
                e
            ))
        })
    }

    /// Look up a device by name.
    pub fn get(&self, name: &str) -> Option<&DeviceNode> {
        self.devices.iter().find(|d| d.name == name)
    }

    /// True if a device with this name is declared.
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// All nodes flagged as master pseudoclock.
    pub fn masters(&self) -> impl Iterator<Item = &DeviceNode> {
        self.devices.iter().filter(|d| d.is_master_pseudoclock)
    }

    /// The unique master pseudoclock, if the table is well formed.
    pub fn master_pseudoclock(&self) -> Option<&DeviceNode> {
        let mut masters = self.masters();
        match (masters.next(), masters.next()) {
            (Some(m), None) => Some(m),
            _ => None,
        }
    }

    /// Direct children of a device.
    pub fn children<'a>(&'a self, parent: &'a str) -> impl Iterator<Item = &'a DeviceNode> + 'a {
        self.devices
            .iter()
            .filter(move |d| d.parent.as_deref() == Some(parent))
    }

    /// Check table-local invariants: exactly one master and a forest shape.
    pub fn check(&self, source: TableSource) -> ShotResult<()> {
        let count = self.masters().count();
        if count != 1 {
            return Err(ShotError::InvalidMasterCardinality {
                table: source,
                count,
            });
        }

        let mut names = HashSet::new();
        for device in &self.devices {
            if !names.insert(device.name.as_str()) {
                return Err(ShotError::InvalidTopology(format!(
                    "{source} table declares device '{}' more than once",
                    device.name
                )));
            }
        }

        for device in &self.devices {
            if let Some(parent) = &device.parent {
                if !names.contains(parent.as_str()) {
                    return Err(ShotError::InvalidTopology(format!(
                        "{source} table: device '{}' has unknown parent '{}'",
                        device.name, parent
                    )));
                }
            }
        }

        // Walk each parent chain; a chain longer than the table means a cycle.
        for device in &self.devices {
            let mut hops = 0;
            let mut cursor = device.parent.as_deref();
            while let Some(parent) = cursor {
                hops += 1;
                if hops > self.devices.len() {
                    return Err(ShotError::InvalidTopology(format!(
                        "{source} table: parent chain of '{}' contains a cycle",
                        device.name
                    )));
                }
                cursor = self.get(parent).and_then(|p| p.parent.as_deref());
            }
        }

        Ok(())
    }

    /// Structural diff from `self` (active) to `embedded`.
    ///
    /// `added` lists devices only the active table has and `removed` those
    /// only the shot's table has. Devices are matched by name, so a rename
    /// shows up as a pair rather than in `changed`: a shot compiled when
    /// `ttl1` was still called `ttl_old` yields `added: [ttl1]` and
    /// `removed: [ttl_old]`.
    pub fn diff(&self, embedded: &ConnectionTable) -> TableDiff {
        let active: BTreeMap<&str, &DeviceNode> =
            self.devices.iter().map(|d| (d.name.as_str(), d)).collect();
        let shot: BTreeMap<&str, &DeviceNode> =
            embedded.devices.iter().map(|d| (d.name.as_str(), d)).collect();

        let active_names: BTreeSet<&str> = active.keys().copied().collect();
        let shot_names: BTreeSet<&str> = shot.keys().copied().collect();

        TableDiff {
            added: active_names
                .difference(&shot_names)
                .map(|s| s.to_string())
                .collect(),
            removed: shot_names
                .difference(&active_names)
                .map(|s| s.to_string())
                .collect(),
            changed: active_names
                .intersection(&shot_names)
                .filter(|name| !active[*name].structurally_equal(shot[*name]))
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl PartialEq for ConnectionTable {
    fn eq(&self, other: &Self) -> bool {
        self.diff(other).is_empty()
    }
}

/// Validate a shot's embedded table against the active configuration.
///
/// Both tables must pass their own invariants first; only then is the
/// structural comparison performed. Pure function, no side effects.
pub fn validate(active: &ConnectionTable, embedded: &ConnectionTable) -> ShotResult<()> {
    active.check(TableSource::Active)?;
    embedded.check(TableSource::Embedded)?;

    let diff = active.diff(embedded);
    if diff.is_empty() {
        Ok(())
    } else {
        Err(ShotError::ConnectionTableMismatch(diff))
    }
}
