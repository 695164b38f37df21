use thiserror::Error;

use crate::space::AllocType;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HeapError {
    #[error("out of memory: failed to allocate {size} bytes of {alloc_type:?} memory")]
    OutOfMemory { size: usize, alloc_type: AllocType },
    #[error("failed to reserve {0} bytes of virtual memory for the heap")]
    ReservationFailed(usize),
    #[error("invalid heap configuration: {0}")]
    InvalidConfig(String),
    #[error("the collector is not running")]
    CollectorInactive,
    #[error("failed to spawn the {0} thread")]
    ThreadSpawnFailed(&'static str),
}

pub type Result<T, E = HeapError> = std::result::Result<T, E>;
