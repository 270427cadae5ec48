//! User configuration for the tracer subsystem.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::reporter::DEFAULT_FLUSH_BUCKETS;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TracerConfig {
    /// Base directory of the BPF file system. The per-instance pin directory
    /// is created underneath it.
    pub bpf_base_dir: PathBuf,
    /// Load the debug build of every bundle and forward its log events to
    /// the diagnostic logger.
    pub bpf_debug: bool,
    /// Maximum number of spans per batch emitted on the out channel.
    pub batch_length: usize,
    /// Flush a partial batch after this many milliseconds.
    pub batch_timeout_ms: u64,
    /// Buckets of the batch-length histogram kept by the reporter.
    pub flush_buckets: Vec<u64>,
    /// Attach probes system wide instead of scoping them to discovered PIDs.
    pub system_wide: bool,
}

impl Default for TracerConfig {
    fn default() -> Self {
        Self {
            bpf_base_dir: PathBuf::from("/sys/fs/bpf"),
            bpf_debug: false,
            batch_length: 100,
            batch_timeout_ms: 100,
            flush_buckets: DEFAULT_FLUSH_BUCKETS.to_vec(),
            system_wide: false,
        }
    }
}

impl TracerConfig {
    pub fn batch_timeout(&self) -> Duration {
        Duration::from_millis(self.batch_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = TracerConfig::default();
        assert_eq!(cfg.bpf_base_dir, PathBuf::from("/sys/fs/bpf"));
        assert_eq!(cfg.batch_length, 100);
        assert_eq!(cfg.flush_buckets, &[0, 10, 20, 40, 80, 160, 320]);
        assert!(!cfg.bpf_debug);
        assert!(!cfg.system_wide);
    }
}
