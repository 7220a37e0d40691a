//! Outbound reports from the inventory engine to the host application

use log::info;

/// Receives inventory results.
///
/// Called from the inventory worker thread, never while the engine's state
/// lock is held.
pub trait InventoryObserver: Send + Sync {
    /// Tags that left (`removed`) and entered (`added`) the cabinet
    fn report_product_change(&self, removed: &[String], added: &[String]);

    /// Everything seen during the last run, with seen counts
    fn report_current_contents(&self, tags: &[(String, u32)]);

    /// Occurrence counts from a diagnostic run
    fn report_probability_buffer(&self, tags: &[(String, u32)]);
}

/// Observer that only logs
#[derive(Debug, Default, Clone, Copy)]
pub struct LogObserver;

impl InventoryObserver for LogObserver {
    fn report_product_change(&self, removed: &[String], added: &[String]) {
        info!("products out: {:?}; in: {:?}", removed, added);
    }

    fn report_current_contents(&self, tags: &[(String, u32)]) {
        info!("ACM: {} tags", tags.len());
        for (epc, seen) in tags {
            info!("  {}:{}", epc, seen);
        }
    }

    fn report_probability_buffer(&self, tags: &[(String, u32)]) {
        info!("PROB: {} tags", tags.len());
        for (epc, seen) in tags {
            info!("  {} : {}", epc, seen);
        }
    }
}
