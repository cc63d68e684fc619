use std::{path::PathBuf, time::Duration};

/// Operating parameters for a profiler context.
#[derive(Debug, Clone)]
pub struct ProfilerConfig {
  /// Initial slot budget of the master buffer and of listener scratch
  /// buffers; the master grows past this on demand.
  pub buffer_slots: usize,
  /// Where `shutdown` writes the final dump; `None` skips the exit dump.
  pub dump_path: Option<PathBuf>,
  /// Size of each pool mapping, in bytes.
  pub mapping_bytes: usize,
  /// Mappings per buffered pool, including the active one.
  pub mapping_ring: usize,
  /// Frames kept per captured stack; deeper stacks are truncated to their
  /// innermost frames.
  pub max_stack_depth: usize,
  /// Pushes that self-pace with a cooperative yield after a pool degrades
  /// to file spooling.
  pub pace_pushes: u32,
  /// How often the listener polls pool receivers.
  pub poll_interval: Duration,
  pub program_name: String,
  /// Resource hash buckets per trace buffer.
  pub resource_buckets: usize,
  /// How long shutdown waits for the listener to drain before abandoning
  /// the remaining streams.
  pub shutdown_grace: Duration,
  pub start_enabled: bool,
  /// Timer resolution advertised in the dump header, in microseconds.
  pub timer_resolution: u32,
  pub track_resources: bool,
}

impl Default for ProfilerConfig {
  fn default() -> Self {
    Self {
      buffer_slots: 4096,
      dump_path: None,
      mapping_bytes: 64 * 1024,
      mapping_ring: 4,
      max_stack_depth: 32,
      pace_pushes: 64,
      poll_interval: Duration::from_millis(10),
      program_name: default_program_name(),
      resource_buckets: 512,
      shutdown_grace: Duration::from_secs(1),
      start_enabled: true,
      timer_resolution: 100,
      track_resources: true,
    }
  }
}

impl ProfilerConfig {
  #[must_use]
  pub fn with_dump_path(mut self, path: impl Into<PathBuf>) -> Self {
    self.dump_path = Some(path.into());
    self
  }

  /// Builder-style helper to adjust the maximum stack depth.
  #[must_use]
  pub fn with_max_stack_depth(mut self, depth: usize) -> Self {
    self.max_stack_depth = depth.max(1);
    self
  }

  #[must_use]
  pub fn with_poll_interval(mut self, interval: Duration) -> Self {
    self.poll_interval = interval;
    self
  }
}

fn default_program_name() -> String {
  std::env::current_exe()
    .ok()
    .and_then(|path| {
      path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
    })
    .unwrap_or_else(|| "unknown".to_string())
}
