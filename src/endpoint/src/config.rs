use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use rdma::ibv::{QpCapability, QpType};
use rdma::rdmacm::ConnParam;

/// How completion queues are assigned to endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CqMode {
    /// One shared completion queue and one dispatch worker per device.
    Active,
    /// A private completion queue per endpoint, polled by the application.
    Passive,
}

impl Default for CqMode {
    fn default() -> Self {
        CqMode::Active
    }
}

/// How a completion processor waits for work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotifyMode {
    /// Sleep on the completion channel between bursts.
    Blocking,
    /// Spin on the completion queue.
    Polling,
}

impl Default for NotifyMode {
    fn default() -> Self {
        NotifyMode::Blocking
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConnParamConfig {
    pub responder_resources: u8,
    pub initiator_depth: u8,
    pub retry_count: u8,
    pub rnr_retry_count: u8,
}

impl Default for ConnParamConfig {
    fn default() -> Self {
        ConnParamConfig {
            responder_resources: 1,
            initiator_depth: 1,
            retry_count: 7,
            rnr_retry_count: 7,
        }
    }
}

impl ConnParamConfig {
    pub fn to_conn_param(&self, private_data: Option<Vec<u8>>) -> ConnParam {
        ConnParam {
            private_data,
            responder_resources: self.responder_resources,
            initiator_depth: self.initiator_depth,
            flow_control: 0,
            retry_count: self.retry_count,
            rnr_retry_count: self.rnr_retry_count,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GroupConfig {
    pub cq_mode: CqMode,
    pub notify: NotifyMode,
    /// Entries of each completion queue.
    pub cq_size: u32,
    pub qp_cap: QpCapability,
    pub qp_type: QpType,
    pub sq_sig_all: bool,
    /// Completions drained per poll call.
    pub poll_batch: usize,
    pub cm_event_timeout_ms: u64,
    pub cq_event_timeout_ms: u64,
    pub resolve_timeout_ms: i32,
    /// Bound on the passive side's wait for an accepted connection to be established.
    pub connect_timeout_ms: u64,
    pub close_timeout_ms: u64,
    pub conn: ConnParamConfig,
}

impl Default for GroupConfig {
    fn default() -> Self {
        GroupConfig {
            cq_mode: CqMode::Active,
            notify: NotifyMode::Blocking,
            cq_size: 1024,
            qp_cap: QpCapability::default(),
            qp_type: QpType::RC,
            sq_sig_all: false,
            poll_batch: 16,
            cm_event_timeout_ms: 50,
            cq_event_timeout_ms: 50,
            resolve_timeout_ms: 2000,
            connect_timeout_ms: 5000,
            close_timeout_ms: 1000,
            conn: ConnParamConfig::default(),
        }
    }
}

impl GroupConfig {
    pub fn new(config: Option<&str>) -> anyhow::Result<Self> {
        let config = toml::from_str(config.unwrap_or(""))?;
        Ok(config)
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let config = toml::from_str(&content)?;
        Ok(config)
    }

    #[inline]
    pub fn cm_event_timeout(&self) -> Duration {
        Duration::from_millis(self.cm_event_timeout_ms)
    }

    #[inline]
    pub fn cq_event_timeout(&self) -> Duration {
        Duration::from_millis(self.cq_event_timeout_ms)
    }

    #[inline]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    #[inline]
    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }
}
