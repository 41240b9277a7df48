//! Engine configuration.

use serde::{Deserialize, Serialize};

/// Configuration for [`crate::likelihood::TreeDataLikelihood`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LikelihoodConfig {
    /// Evaluation attempts before an underflowing model is declared
    /// unstable. Default: 100
    pub max_underflow_attempts: usize,
    /// Keep the diagnostic counters in [`crate::report::LikelihoodReport`].
    /// Default: true
    pub count_operations: bool,
}

impl Default for LikelihoodConfig {
    fn default() -> Self {
        Self {
            max_underflow_attempts: 100,
            count_operations: true,
        }
    }
}

impl LikelihoodConfig {
    pub fn with_max_underflow_attempts(mut self, attempts: usize) -> Self {
        self.max_underflow_attempts = attempts;
        self
    }
}
