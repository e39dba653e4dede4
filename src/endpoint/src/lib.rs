//! Connection lifecycle and completion dispatch for RDMA endpoints.
//!
//! An [`EndpointGroup`] owns one connection manager event channel and the per-device resources
//! its endpoints share: protection domains and, in active mode, one completion queue with a
//! dispatch worker per device. [`Endpoint`]s are created from a group and connect to a remote
//! [`ServerEndpoint`], which queues incoming requests until they are accepted.

pub mod config;
pub mod error;
pub mod logging;
pub mod resource;

mod cm;
mod cq;
mod endpoint;
mod group;
mod server;
mod state;

pub use config::{ConnParamConfig, CqMode, GroupConfig, NotifyMode};
pub use cq::{CompletionHandler, CqProcessor};
pub use endpoint::Endpoint;
pub use error::{Error, Failure, Result};
pub use group::{EndpointFactory, EndpointGroup};
pub use server::{ServerEndpoint, ServerState};
pub use state::EndpointState;

pub use rdma;
