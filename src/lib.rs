//! Pulsar operator library
//!
//! Autoscales the brokers and bookies of Apache Pulsar clusters running on
//! Kubernetes.

pub mod autoscaler;
pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod kubernetes;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{Error, Result};
