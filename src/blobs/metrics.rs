//! Metrics for blob transfer

use iroh_metrics::{Counter, MetricsGroup};

/// Enum of metrics for the module
#[derive(Debug, Default, MetricsGroup)]
#[metrics(name = "blobs")]
#[non_exhaustive]
pub struct Metrics {
    /// Requests served to other nodes.
    pub requests_served: Counter,
    /// Requests for blobs we do not have.
    pub requests_not_found: Counter,
    /// Bytes of blob data sent.
    pub bytes_sent: Counter,
    /// Bytes of blob data received and verified.
    pub bytes_received: Counter,
    /// Downloads that finished successfully.
    pub downloads_success: Counter,
    /// Downloads that were aborted.
    pub downloads_aborted: Counter,
    /// Chunks that failed verification.
    pub chunks_corrupt: Counter,
    /// Blobs removed by garbage collection.
    pub gc_deleted: Counter,
}
