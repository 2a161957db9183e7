// Public API - monitor facade, data types and the synchronous building blocks
pub mod alert;
pub mod analysis;
pub mod config;
pub mod error;
pub mod packet;
pub mod pipeline;
pub mod state;
pub mod trace;

pub use alert::{AlertManager, AlertRecord, ListenerId, Severity};
pub use analysis::{BottleneckCause, BottleneckVerdict, ComparisonReport, ComparisonResult, Verdict};
pub use config::{Config, Threshold, ThresholdSet};
pub use error::{ConfigError, IngestError, MonitorError};
pub use packet::{FlowKey, InterfaceId, PacketRecord, Protocol, TcpFlags};
pub use pipeline::{CaptureMessage, FeedStatus, InterfaceSnapshot, Monitor, StopReport};
pub use state::{Metric, MetricSample, MetricsStore};
