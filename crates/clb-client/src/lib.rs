//! CLB Provider Client
//!
//! Client library for the cloud load balancer (CLB) provider API.
//!
//! Two layers:
//!
//! - [`ClbApi`]: raw provider actions, implemented over HTTP by
//!   [`HttpClbApi`] and in memory by `MockClbApi` (feature `test-util`)
//! - [`ClbClient`]: what reconcilers call; batches listener and target
//!   mutations per load balancer, retries rate-limited calls, polls
//!   asynchronous tasks and serializes mutations on the same load balancer
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use clb_client::{ClbClient, ClbClientConfig, HttpClbApi, ListenerExtra, Target};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let api = HttpClbApi::new("https://clb.example.com".to_string(), "token".to_string())?;
//! let clb = ClbClient::new(Arc::new(api), ClbClientConfig::default(), CancellationToken::new());
//!
//! let listener_id = clb
//!     .allocate_create_listener("ap-guangzhou", "lb-1", 30000, None, "TCP", &ListenerExtra::default())
//!     .await?;
//! clb.register_targets("ap-guangzhou", "lb-1", &listener_id, &[Target::new("10.0.0.5", 80)])
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod batch;
pub mod clb;
pub mod client;
pub mod error;
pub mod lock;
pub mod models;
pub mod retry;
#[path = "trait.rs"]
pub mod clb_trait;
#[cfg(any(test, feature = "test-util"))]
pub mod mock;

pub use batch::BatchConfig;
pub use clb::{ClbClient, ClbClientConfig};
pub use client::HttpClbApi;
pub use clb_trait::ClbApi;
pub use error::ClbError;
pub use models::*;
pub use retry::RetryPolicy;
#[cfg(any(test, feature = "test-util"))]
pub use mock::{MockCall, MockClbApi};
