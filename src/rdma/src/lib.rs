//! Verbs and connection manager primitives.
//!
//! The endpoint layer talks to an RDMA provider through two seams: [`ibv::VerbProvider`] for
//! device resources and the data path, and [`rdmacm::ConnectionProvider`] for connection
//! management. [`loopback::Fabric`] implements both in software.
pub mod handle;
pub mod ibv;
pub mod loopback;
pub mod mr;
pub mod rdmacm;

pub use handle::{AsHandle, Handle};
