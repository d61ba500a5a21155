//! Engine configuration that downstream crates can serialize/deserialize.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Name of the routine that starts a script's execution.
pub const DEFAULT_ENTRY_METHOD: &str = "run";

/// Stack reserved for the thread a script runs on.
pub const DEFAULT_STACK_SIZE: usize = 64 * 1024 * 1024;

const MIN_STACK_SIZE: usize = 64 * 1024;

/// The three fixed values an instrumented unit is declared with.
///
/// The planner receives one `QuotaConfig` per unit; there are no per-call-site
/// overrides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaConfig {
    /// Allocation budget in bytes, net of the baseline. Must be >= 0.
    #[serde(alias = "limit")]
    pub limit_bytes: i64,

    /// Type that owns the infringement handler.
    pub handler_type: String,

    /// Name of the handler callable on `handler_type`.
    pub handler_method: String,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            limit_bytes: 64 * 1024 * 1024, // 64 MiB default
            handler_type: "QuotaInfringementHandler".to_string(),
            handler_method: "handle".to_string(),
        }
    }
}

impl QuotaConfig {
    pub fn new(
        limit_bytes: i64,
        handler_type: impl Into<String>,
        handler_method: impl Into<String>,
    ) -> Self {
        Self {
            limit_bytes,
            handler_type: handler_type.into(),
            handler_method: handler_method.into(),
        }
    }

    /// Reject values that can never describe a valid quota.
    pub fn validate(&self) -> Result<()> {
        if self.limit_bytes < 0 {
            return Err(Error::Config(format!(
                "memory usage limit should be a positive number but it was {}",
                self.limit_bytes
            )));
        }
        if self.handler_type.trim().is_empty() {
            return Err(Error::Config("handler type must not be empty".into()));
        }
        if self.handler_method.trim().is_empty() {
            return Err(Error::Config("handler method must not be empty".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    pub quota: QuotaConfig,

    /// Entry routine name looked up on the script class.
    pub entry_method: String,

    /// Stack size of the dedicated thread each run gets. `None` runs on the
    /// caller's thread, whose stack must then be deep enough on its own.
    #[serde(default = "default_stack_size")]
    pub stack_size: Option<usize>,
}

fn default_stack_size() -> Option<usize> {
    Some(DEFAULT_STACK_SIZE)
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            quota: QuotaConfig::default(),
            entry_method: DEFAULT_ENTRY_METHOD.to_string(),
            stack_size: default_stack_size(),
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by `MEMQUOTA_*` environment variables.
    /// Unparseable values are ignored.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(s) = std::env::var("MEMQUOTA_LIMIT_BYTES") {
            if let Ok(v) = s.parse::<i64>() {
                cfg.quota.limit_bytes = v;
            }
        }

        if let Ok(s) = std::env::var("MEMQUOTA_HANDLER_TYPE") {
            cfg.quota.handler_type = s;
        }

        if let Ok(s) = std::env::var("MEMQUOTA_HANDLER_METHOD") {
            cfg.quota.handler_method = s;
        }

        if let Ok(s) = std::env::var("MEMQUOTA_ENTRY_METHOD") {
            if !s.trim().is_empty() {
                cfg.entry_method = s;
            }
        }

        // 0 selects the caller's thread.
        if let Ok(s) = std::env::var("MEMQUOTA_STACK_SIZE") {
            if let Ok(v) = s.parse::<usize>() {
                cfg.stack_size = (v > 0).then_some(v);
            }
        }

        cfg
    }

    pub fn validate(&self) -> Result<()> {
        if self.entry_method.trim().is_empty() {
            return Err(Error::Config("entry method must not be empty".into()));
        }
        if self.stack_size.is_some_and(|n| n < MIN_STACK_SIZE) {
            return Err(Error::Config(format!(
                "stack size must be at least {MIN_STACK_SIZE} bytes"
            )));
        }
        self.quota.validate()
    }
}
