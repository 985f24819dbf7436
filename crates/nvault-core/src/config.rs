//! Configuration for the storage manager

/// Storage manager configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Flush the medium durably on every commit. Turning this off trades
    /// power-loss durability for throughput; only transient deployments
    /// should consider it.
    pub sync_writes: bool,
    /// Run a quick integrity verification when opening the store
    pub verify_on_open: bool,
    /// Upper bound for one block's data allocation (bytes)
    pub max_block_bytes: usize,
}

impl Config {
    /// Validate all configuration parameters
    pub fn validate(&self) -> Result<(), String> {
        if self.max_block_bytes < 64 {
            return Err("max_block_bytes must be >= 64".into());
        }
        if self.max_block_bytes > 1024 * 1024 * 1024 {
            return Err("max_block_bytes must be <= 1GB".into());
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sync_writes: true,
            verify_on_open: false,
            max_block_bytes: 16 * 1024 * 1024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_out_of_range_limit() {
        let mut config = Config::default();
        config.max_block_bytes = 1;
        assert!(config.validate().is_err());

        config.max_block_bytes = 2 * 1024 * 1024 * 1024;
        assert!(config.validate().is_err());
    }
}
