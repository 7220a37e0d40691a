//! Engine configuration

use std::time::Duration;

use crate::frame::BROADCAST_ADDRESS;

/// Tunables of the inventory engine
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct EngineConfig {
    // -------------------------------------------------------------------------
    // Link
    // -------------------------------------------------------------------------
    /// Reader address put in every request
    pub reader_address: u8,

    /// Serial speed used when opening the device
    pub baud_rate: u32,

    /// Timeout of one transport read call (milliseconds)
    pub read_slice_ms: u64,

    // -------------------------------------------------------------------------
    // Waits
    // -------------------------------------------------------------------------
    /// How long a single command may stay unanswered (milliseconds)
    pub command_timeout_ms: u64,

    /// How long to wait for every tag of a buffer read (milliseconds)
    pub all_tags_timeout_ms: u64,

    // -------------------------------------------------------------------------
    // Polling
    // -------------------------------------------------------------------------
    /// Pause before each poll's inventory command (milliseconds)
    pub settle_delay_ms: u64,

    /// Pause between two poll cycles (milliseconds)
    pub poll_interval_ms: u64,

    /// Polls merged into one cycle of a continuous run that needs a
    /// conclusive result
    pub poll_count: usize,

    /// Cycles of the content query run when the door closes
    pub close_read_attempts: usize,

    /// Period of the idle inventory (milliseconds)
    pub idle_interval_ms: u64,

    /// Repeat byte of the inventory command
    pub inventory_repeat: u8,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            reader_address: BROADCAST_ADDRESS,
            baud_rate: 115_200,
            read_slice_ms: 10,
            command_timeout_ms: 10_000,
            all_tags_timeout_ms: 30_000,
            settle_delay_ms: 700,
            poll_interval_ms: 1,
            poll_count: 1,
            close_read_attempts: 3,
            idle_interval_ms: 10_000,
            inventory_repeat: 0xFF,
        }
    }
}

impl EngineConfig {
    /// Create a new config builder
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::default()
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn all_tags_timeout(&self) -> Duration {
        Duration::from_millis(self.all_tags_timeout_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn idle_interval(&self) -> Duration {
        Duration::from_millis(self.idle_interval_ms)
    }
}

/// Builder for [`EngineConfig`]
#[derive(Default)]
pub struct EngineConfigBuilder {
    config: EngineConfig,
}

impl EngineConfigBuilder {
    pub fn reader_address(mut self, address: u8) -> Self {
        self.config.reader_address = address;
        self
    }

    pub fn baud_rate(mut self, baud: u32) -> Self {
        self.config.baud_rate = baud;
        self
    }

    /// Set the transport read timeout (in milliseconds)
    pub fn read_slice_ms(mut self, ms: u64) -> Self {
        self.config.read_slice_ms = ms;
        self
    }

    /// Set the single-command timeout (in milliseconds)
    pub fn command_timeout_ms(mut self, ms: u64) -> Self {
        self.config.command_timeout_ms = ms;
        self
    }

    /// Set the all-tags-received timeout (in milliseconds)
    pub fn all_tags_timeout_ms(mut self, ms: u64) -> Self {
        self.config.all_tags_timeout_ms = ms;
        self
    }

    pub fn settle_delay_ms(mut self, ms: u64) -> Self {
        self.config.settle_delay_ms = ms;
        self
    }

    pub fn poll_interval_ms(mut self, ms: u64) -> Self {
        self.config.poll_interval_ms = ms;
        self
    }

    pub fn poll_count(mut self, count: usize) -> Self {
        self.config.poll_count = count;
        self
    }

    pub fn close_read_attempts(mut self, count: usize) -> Self {
        self.config.close_read_attempts = count;
        self
    }

    pub fn idle_interval_ms(mut self, ms: u64) -> Self {
        self.config.idle_interval_ms = ms;
        self
    }

    pub fn inventory_repeat(mut self, repeat: u8) -> Self {
        self.config.inventory_repeat = repeat;
        self
    }

    pub fn build(self) -> EngineConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.command_timeout(), Duration::from_secs(10));
        assert_eq!(config.all_tags_timeout(), Duration::from_secs(30));
        assert_eq!(config.settle_delay(), Duration::from_millis(700));
        assert_eq!(config.poll_count, 1);
        assert_eq!(config.close_read_attempts, 3);
        assert_eq!(config.reader_address, 0xFF);
    }

    #[test]
    fn test_builder_overrides() {
        let config = EngineConfig::builder()
            .command_timeout_ms(50)
            .settle_delay_ms(0)
            .close_read_attempts(5)
            .build();
        assert_eq!(config.command_timeout_ms, 50);
        assert_eq!(config.settle_delay_ms, 0);
        assert_eq!(config.close_read_attempts, 5);
        assert_eq!(config.idle_interval_ms, 10_000);
    }
}
