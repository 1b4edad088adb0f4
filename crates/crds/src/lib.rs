//! CLB CRD Definitions
//!
//! Kubernetes Custom Resource Definitions and backend annotations used by the
//! CLB port mapping controller.

pub mod annotations;
pub mod clb_binding;
pub mod clb_port_pool;

pub use clb_binding::*;
pub use clb_port_pool::*;
