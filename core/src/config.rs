use serde::{Deserialize, Serialize};

/// Tunables for recalculation, validation and settle-up planning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Net positions within this distance of zero are treated as settled
    /// when one expense is reduced to transfers.
    pub epsilon: f64,
    /// Allowed gap between the declared amount and the sum of split costs.
    pub split_tolerance: f64,
    /// Allowed drift in the sum of all balances touched by one pass.
    pub zero_sum_tolerance: f64,
    /// Precondition and replay tolerance for debt simplification.
    pub simplify_tolerance: f64,
    /// Retries after the first attempt when the ledger moves mid-pass.
    pub max_retries: u32,
    /// First backoff step; doubles per retry.
    pub backoff_base_ms: u64,
    /// Upper bound of the random extra delay added to each step.
    pub backoff_jitter_ms: u64,
    /// Fixed seed for the jitter stream. `None` draws one per ledger.
    pub jitter_seed: Option<u64>,
    /// When off, every group mutation recalculates the whole ledger.
    pub scoped_recalc_enabled: bool,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            epsilon: 0.005,
            split_tolerance: 0.01,
            zero_sum_tolerance: 0.05,
            simplify_tolerance: 0.01,
            max_retries: 3,
            backoff_base_ms: 20,
            backoff_jitter_ms: 30,
            jitter_seed: None,
            scoped_recalc_enabled: true,
        }
    }
}

impl LedgerConfig {
    /// Load from a JSON file. Missing keys keep their defaults.
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Cannot read {path}: {e}"))?;
        let config: LedgerConfig = serde_json::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Cannot parse {path}: {e}"))?;
        config.validate()?;
        Ok(config)
    }

    /// Config for tests: no sleeping between retries, fixed jitter seed.
    pub fn default_test() -> Self {
        Self {
            backoff_base_ms: 0,
            backoff_jitter_ms: 0,
            jitter_seed: Some(0x5EED),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let tolerances = [
            ("epsilon", self.epsilon),
            ("split_tolerance", self.split_tolerance),
            ("zero_sum_tolerance", self.zero_sum_tolerance),
            ("simplify_tolerance", self.simplify_tolerance),
        ];
        for (name, value) in tolerances {
            if !value.is_finite() || value < 0.0 {
                anyhow::bail!("{name} must be a non-negative number, got {value}");
            }
        }
        if self.zero_sum_tolerance > 1.0 {
            anyhow::bail!(
                "zero_sum_tolerance {} is too loose to catch a broken pass",
                self.zero_sum_tolerance
            );
        }
        Ok(())
    }
}
