pub mod compute;
pub mod core;
mod errors;
pub mod launcher;
pub mod producer;
pub mod worker;

#[cfg(test)]
mod tests;

pub use crate::core::{ShmemConfig, PAYLOAD_CAPACITY, REGION_SIZE};
pub use errors::{ComputeError, ShmemLibError};
