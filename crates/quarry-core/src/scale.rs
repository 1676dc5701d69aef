use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{QuarryError, Result};
use crate::sort::{SortField, SortPolicy};

const LOW_COMPLEXITY_ROWS: u64 = 10_000;
const HIGH_COMPLEXITY_ROWS: u64 = 1_000_000;
const HIGH_COMPLEXITY_SORT_FIELDS: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScalePolicy {
    pub max_memory_rows: u64,
    pub use_streaming: bool,
    pub chunk_size: usize,
    /// field -> index name, rendered as hints next to the ordering
    pub index_hints: BTreeMap<String, String>,
    pub query_timeout_seconds: u64,
    /// Hard bound on streamed chunks per request.
    pub max_chunks: usize,
}

impl Default for ScalePolicy {
    fn default() -> Self {
        let index_hints = [
            ("created_at", "idx_created_at"),
            ("tenant_id", "idx_tenant_id"),
            ("source_id", "idx_source_id"),
        ]
        .into_iter()
        .map(|(f, h)| (f.to_string(), h.to_string()))
        .collect();
        Self {
            max_memory_rows: 100_000,
            use_streaming: false,
            chunk_size: 10_000,
            index_hints,
            query_timeout_seconds: 30,
            max_chunks: 1_000,
        }
    }
}

impl ScalePolicy {
    /// Row count to assume when the size count fails: just past the in-memory limit.
    pub fn large_estimate(&self) -> u64 {
        self.max_memory_rows.saturating_add(1)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScalePlan {
    pub sort: Vec<SortField>,
    pub scale: ScalePolicy,
}

impl ScalePlan {
    pub fn streaming(&self) -> bool {
        self.scale.use_streaming
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComplexityReport {
    pub level: Complexity,
    pub estimated_rows: u64,
    pub recommendations: Vec<String>,
}

pub struct ScaleAdvisor;

impl ScaleAdvisor {
    /// Choose between in-memory and streamed execution.
    ///
    /// Validation is repeated here so a plan can never be built from an
    /// unchecked ordering. Large results under an index-forcing policy must
    /// sort on indexed fields only.
    pub fn plan(
        sort: &[SortField],
        policy: &SortPolicy,
        scale: &ScalePolicy,
        estimated_rows: u64,
    ) -> Result<ScalePlan> {
        let sort = policy.validate(sort)?;
        if estimated_rows <= scale.max_memory_rows {
            return Ok(ScalePlan {
                sort,
                scale: scale.clone(),
            });
        }
        if policy.force_index_usage {
            if let Some(field) = sort.iter().find(|s| !policy.is_indexed(&s.field)) {
                return Err(QuarryError::IndexRequiredForScale(field.field.clone()));
            }
        }
        Ok(ScalePlan {
            sort,
            scale: ScalePolicy {
                use_streaming: true,
                ..scale.clone()
            },
        })
    }

    /// Informational only; never blocks a request.
    pub fn assess(
        sort: &[SortField],
        policy: &SortPolicy,
        scale: &ScalePolicy,
        estimated_rows: u64,
    ) -> ComplexityReport {
        let level = if estimated_rows > HIGH_COMPLEXITY_ROWS
            || sort.len() >= HIGH_COMPLEXITY_SORT_FIELDS
        {
            Complexity::High
        } else if estimated_rows <= LOW_COMPLEXITY_ROWS && sort.len() <= 1 {
            Complexity::Low
        } else {
            Complexity::Medium
        };

        let mut recommendations = Vec::new();
        for s in sort.iter().filter(|s| !policy.is_indexed(&s.field)) {
            recommendations.push(format!(
                "sort on an indexed field instead of '{}'",
                s.field
            ));
        }
        if estimated_rows > scale.max_memory_rows {
            recommendations.push("enable streaming for this result size".to_string());
        }
        if estimated_rows > policy.max_result_size {
            recommendations.push("narrow the time range or add filters".to_string());
        }
        if sort.len() >= HIGH_COMPLEXITY_SORT_FIELDS {
            recommendations.push("reduce the number of sort fields".to_string());
        }

        ComplexityReport {
            level,
            estimated_rows,
            recommendations,
        }
    }
}
