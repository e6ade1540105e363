//! Core type definitions for BlockIO
//!
//! This module defines the identifiers and wire-level records shared between
//! block clients and storage nodes.

use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Unique identifier for a block within the storage cluster
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, From, Into, Display,
)]
#[display("{_0}")]
pub struct BlockId(u64);

impl BlockId {
    /// Create a block ID from its raw value
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the raw value
    #[must_use]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Debug for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockId({})", self.0)
    }
}

/// Identifier of a client session on a storage node
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, From, Into, Display)]
#[display("session-{_0}")]
pub struct SessionId(u64);

impl SessionId {
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({})", self.0)
    }
}

/// Network identity of a storage node (worker)
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerNetAddress {
    /// Hostname or IP address
    pub host: String,
    /// Port of the control (lock / unlock) service
    pub rpc_port: u16,
    /// Port of the data transfer service
    pub data_port: u16,
}

impl WorkerNetAddress {
    pub fn new(host: impl Into<String>, rpc_port: u16, data_port: u16) -> Self {
        Self {
            host: host.into(),
            rpc_port,
            data_port,
        }
    }
}

impl fmt::Display for WorkerNetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.rpc_port)
    }
}

/// Result of a successful block lock on a storage node
///
/// Carries the local path of the block's backing file. The lock stays held
/// until the same session unlocks the block.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockBlockResult {
    /// Lock identifier assigned by the storage node
    pub lock_id: u64,
    /// Path of the backing block file on the local filesystem
    pub block_path: PathBuf,
}

impl LockBlockResult {
    pub fn new(lock_id: u64, block_path: impl Into<PathBuf>) -> Self {
        Self {
            lock_id,
            block_path: block_path.into(),
        }
    }

    #[must_use]
    pub fn block_path(&self) -> &Path {
        &self.block_path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_id_display() {
        let id = BlockId::new(42);
        assert_eq!(id.to_string(), "42");
        assert_eq!(format!("{id:?}"), "BlockId(42)");
        assert_eq!(u64::from(id), 42);
    }

    #[test]
    fn test_worker_address_display() {
        let addr = WorkerNetAddress::new("worker-1", 29999, 29998);
        assert_eq!(addr.to_string(), "worker-1:29999");
    }

    #[test]
    fn test_lock_result_path() {
        let result = LockBlockResult::new(7, "/data/blk42");
        assert_eq!(result.block_path(), Path::new("/data/blk42"));
    }
}
