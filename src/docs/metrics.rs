//! Metrics for documents

use iroh_metrics::{Counter, MetricsGroup};

/// Metrics for documents and their sync
#[derive(Debug, Default, MetricsGroup)]
#[metrics(name = "docs")]
#[non_exhaustive]
pub struct Metrics {
    /// Number of document entries added locally
    pub new_entries_local: Counter,
    /// Number of document entries added by peers
    pub new_entries_remote: Counter,
    /// Total size of entry contents added locally
    pub new_entries_local_size: Counter,
    /// Total size of entry contents added by peers
    pub new_entries_remote_size: Counter,
    /// Number of successful syncs (via connect)
    pub sync_via_connect_success: Counter,
    /// Number of failed syncs (via connect)
    pub sync_via_connect_failure: Counter,
    /// Number of successful syncs (via accept)
    pub sync_via_accept_success: Counter,
    /// Number of failed syncs (via accept)
    pub sync_via_accept_failure: Counter,
    /// Number of times the live actor loop ticked
    pub doc_live_tick_main: Counter,
    /// Number of times the live actor processed a gossip event
    pub doc_live_tick_gossip_event: Counter,
    /// Number of times the live actor processed a finished download
    pub doc_live_tick_pending_downloads: Counter,
}
