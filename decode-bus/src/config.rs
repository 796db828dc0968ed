use std::sync::LazyLock;
use std::time::Duration;

use serde::Deserialize;

/// Pacing and capacity tunables for a pipeline.
///
/// All time budgets derive from the display interval of one frame.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub frame_display_interval_ms: u64,
    pub output_capacity: usize,
    pub input_capacity: usize,
    pub early_buffer_limit: usize,
    pub max_in_flight: usize,
    pub max_submit_failures: u32,
    pub block_when_full: bool,
    pub prefer_hardware: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            frame_display_interval_ms: 40,
            output_capacity: 10,
            input_capacity: 4,
            early_buffer_limit: 50,
            max_in_flight: 3,
            max_submit_failures: 8,
            block_when_full: true,
            prefer_hardware: true,
        }
    }
}

impl PipelineConfig {
    pub fn from_json(text: &str) -> anyhow::Result<Self> {
        let config: PipelineConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.frame_display_interval_ms == 0 {
            anyhow::bail!("frame_display_interval_ms must be positive");
        }
        if self.output_capacity == 0 || self.input_capacity == 0 {
            anyhow::bail!("capacities must be positive");
        }
        if self.max_in_flight == 0 || self.max_in_flight > self.output_capacity {
            anyhow::bail!(
                "max_in_flight {} must be in 1..={}",
                self.max_in_flight,
                self.output_capacity
            );
        }
        Ok(())
    }

    /// Clamps out-of-range values so a pipeline can always make progress.
    pub fn sanitized(mut self) -> Self {
        if let Err(err) = self.validate() {
            log::warn!("adjusting pipeline config: {:#}", err);
        }
        self.frame_display_interval_ms = self.frame_display_interval_ms.max(1);
        self.output_capacity = self.output_capacity.max(1);
        self.input_capacity = self.input_capacity.max(1);
        self.max_in_flight = self.max_in_flight.clamp(1, self.output_capacity);
        self
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.frame_display_interval_ms)
    }

    /// How long a producer waits for the input queue to drain before reporting pressure.
    pub fn ingress_budget(&self) -> Duration {
        self.frame_interval() * 2 + Duration::from_millis(5)
    }

    /// How long the worker waits for the consumer before discarding old output.
    pub fn drain_budget(&self, flushing: bool) -> Duration {
        if flushing {
            self.frame_interval() * self.output_capacity as u32
        } else {
            self.frame_interval() * 2
        }
    }

    pub fn poll_slice(&self) -> Duration {
        (self.frame_interval() / 4).max(Duration::from_millis(1))
    }

    pub fn error_backoff(&self) -> Duration {
        self.frame_interval()
    }
}

pub fn defaults() -> &'static PipelineConfig {
    static CONFIG: LazyLock<PipelineConfig> = LazyLock::new(PipelineConfig::default);
    &CONFIG
}
