//! Semantic judge abstraction.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::types::ActualState;

/// Boolean semantic-match judgment plus free-text reasoning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Judgment {
    #[serde(rename = "match")]
    pub is_match: bool,
    pub explanation: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JudgeError {
    #[error("semantic judge unavailable: {0}")]
    Unavailable(String),
}

/// Decides whether an observation satisfies an intent description.
#[async_trait]
pub trait SemanticJudge: Send + Sync {
    async fn judge(
        &self,
        expected_description: &str,
        actual: &ActualState,
    ) -> Result<Judgment, JudgeError>;
}
