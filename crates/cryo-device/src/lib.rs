//! The driver seam.
//!
//! [`DeviceBackend`] is the set of opaque, fallible entry points the copy
//! engine and the capture pass need from the underlying graphics API.
//! [`SoftDevice`] implements it entirely in host memory with debug-layer
//! style validation; real deployments provide their own backend.

mod backend;
mod error;
mod soft;

pub use crate::backend::{DeviceBackend, StagingAlloc};
pub use crate::error::{DriverError, Result};
pub use crate::soft::SoftDevice;
