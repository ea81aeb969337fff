//! Engine configuration
//!
//! The `backout_*` switches alter transition calculation process-wide.
//! They are read from the environment exactly once and captured by each
//! engine at construction; a batch never re-reads them.

use once_cell::sync::Lazy;

/// Immutable per-engine configuration
#[derive(Debug, Clone, Copy, Default)]
pub struct EngineConfig {
    /// Disable the newly-absent-invalid rule (treat as `EQ_FF`)
    pub backout_invalid_neq_ft: bool,
    /// Disable the invalid-to-invalid equality rule
    pub backout_eq_invalid_invalid: bool,
    /// Disable the newly-valid rule
    pub backout_nveq_ft: bool,
    /// Trace context delta queries
    pub log_progress: bool,
}

static PROCESS_CONFIG: Lazy<EngineConfig> = Lazy::new(EngineConfig::read_env);

fn env_flag(name: &str) -> bool {
    match std::env::var(name) {
        Ok(v) => !v.is_empty() && v != "0",
        Err(_) => false,
    }
}

impl EngineConfig {
    /// The process-wide configuration, read from the environment on
    /// first use and memoized.
    pub fn from_env() -> EngineConfig {
        *PROCESS_CONFIG
    }

    fn read_env() -> EngineConfig {
        EngineConfig {
            backout_invalid_neq_ft: env_flag("FLUXGRID_BACKOUT_INVALID_NEQ_FT"),
            backout_eq_invalid_invalid: env_flag("FLUXGRID_BACKOUT_EQ_INVALID_INVALID"),
            backout_nveq_ft: env_flag("FLUXGRID_BACKOUT_NVEQ_FT"),
            log_progress: env_flag("FLUXGRID_LOG_PROGRESS"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_all_off() {
        let cfg = EngineConfig::default();
        assert!(!cfg.backout_invalid_neq_ft);
        assert!(!cfg.backout_eq_invalid_invalid);
        assert!(!cfg.backout_nveq_ft);
        assert!(!cfg.log_progress);
    }
}
