//! Error types for the distmem library

use crate::partition::PartitionId;
use thiserror::Error;

/// Result type alias for distmem operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types that can occur when talking to the partitioned machine
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The machine could not satisfy an allocation
    #[error("out of memory: requested {bytes} bytes across {partitions} partitions")]
    OutOfMemory {
        /// Total bytes requested over every partition
        bytes: usize,
        /// Number of partitions the request spans
        partitions: usize,
    },

    /// A partition id outside `[0, partition_count)`
    #[error("partition {partition} out of range for machine with {count} partitions")]
    PartitionOutOfRange {
        /// Offending id
        partition: PartitionId,
        /// Partitions on the machine
        count: usize,
    },

    /// Address was not produced by this machine's allocator
    #[error("address {0:#x} is not a live machine allocation")]
    UnknownAllocation(usize),

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Configuration could not be loaded or deserialized
    #[error("failed to load configuration: {0}")]
    Config(String),
}

#[cfg(feature = "serialization")]
impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::Config(err.to_string())
    }
}
