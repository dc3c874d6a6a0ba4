//! Runtime configuration.

/// Configuration for a [`crate::driver::Runtime`].
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Number of worker threads. `0` means "use every logical core
    /// reported by the OS".
    pub thread_count: usize,
    /// Expected number of distinct addresses touched per run, used to
    /// pre-size the address map's initial table.
    pub ws_capacity_hint: usize,
    /// Number of fast-path index slots reserved per worker for
    /// `dep_*_fast`.
    pub index_count: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            thread_count: 0,
            ws_capacity_hint: 1024,
            index_count: 64,
        }
    }
}

impl RuntimeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_thread_count(mut self, thread_count: usize) -> Self {
        self.thread_count = thread_count;
        self
    }

    pub fn with_ws_capacity_hint(mut self, hint: usize) -> Self {
        self.ws_capacity_hint = hint;
        self
    }

    pub fn with_index_count(mut self, count: usize) -> Self {
        self.index_count = count;
        self
    }

    /// Resolve `thread_count == 0` to the OS-reported logical core
    /// count.
    pub(crate) fn resolved_thread_count(&self) -> usize {
        if self.thread_count == 0 {
            num_cpus::get()
        } else {
            self.thread_count
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_nonzero_resolved_threads() {
        let cfg = RuntimeConfig::default();
        assert!(cfg.resolved_thread_count() > 0);
    }

    #[test]
    fn explicit_thread_count_is_not_overridden() {
        let cfg = RuntimeConfig::new().with_thread_count(3);
        assert_eq!(cfg.resolved_thread_count(), 3);
    }

    #[test]
    fn builder_methods_chain() {
        let cfg = RuntimeConfig::new()
            .with_thread_count(2)
            .with_ws_capacity_hint(500)
            .with_index_count(10);
        assert_eq!(cfg.thread_count, 2);
        assert_eq!(cfg.ws_capacity_hint, 500);
        assert_eq!(cfg.index_count, 10);
    }
}
