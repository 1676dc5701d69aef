use std::collections::{BTreeSet, HashSet};

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{QuarryError, Result};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

impl SortDirection {
    /// Anything that is not recognisably descending sorts ascending.
    pub fn parse_lenient(raw: &str) -> Self {
        if raw.trim().eq_ignore_ascii_case("desc") || raw.trim().eq_ignore_ascii_case("descending")
        {
            SortDirection::Desc
        } else {
            SortDirection::Asc
        }
    }

    pub fn keyword(self) -> &'static str {
        match self {
            SortDirection::Asc => "ASC",
            SortDirection::Desc => "DESC",
        }
    }

    /// Comparison that selects rows strictly after a cursor value.
    pub fn after_operator(self) -> &'static str {
        match self {
            SortDirection::Asc => ">",
            SortDirection::Desc => "<",
        }
    }
}

impl<'de> Deserialize<'de> for SortDirection {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw: Option<serde_json::Value> = Option::deserialize(deserializer)?;
        Ok(match raw {
            Some(serde_json::Value::String(s)) => SortDirection::parse_lenient(&s),
            _ => SortDirection::Asc,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SortField {
    pub field: String,
    #[serde(default)]
    pub direction: SortDirection,
}

impl SortField {
    pub fn new(field: impl Into<String>, direction: SortDirection) -> Self {
        Self {
            field: field.into(),
            direction,
        }
    }

    pub fn asc(field: impl Into<String>) -> Self {
        Self::new(field, SortDirection::Asc)
    }

    pub fn desc(field: impl Into<String>) -> Self {
        Self::new(field, SortDirection::Desc)
    }
}

/// Logical entity a query reads; each kind has its own sort policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryKind {
    TenantSummaries,
    IngestionRecords,
    AnalyticsEvents,
}

impl QueryKind {
    pub fn as_str(self) -> &'static str {
        match self {
            QueryKind::TenantSummaries => "tenant_summaries",
            QueryKind::IngestionRecords => "ingestion_records",
            QueryKind::AnalyticsEvents => "analytics_events",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortPolicy {
    pub default_field: Option<String>,
    pub default_direction: SortDirection,
    pub allowed_fields: BTreeSet<String>,
    pub indexed_fields: BTreeSet<String>,
    pub max_sort_fields: usize,
    pub max_result_size: u64,
    pub force_index_usage: bool,
}

fn field_set(fields: &[&str]) -> BTreeSet<String> {
    fields.iter().map(|f| f.to_string()).collect()
}

impl SortPolicy {
    pub fn tenant_summaries() -> Self {
        Self {
            default_field: Some("created_at".into()),
            default_direction: SortDirection::Desc,
            allowed_fields: field_set(&[
                "created_at",
                "tenant_id",
                "total_files",
                "total_bytes",
                "last_ingested_at",
            ]),
            indexed_fields: field_set(&["created_at", "tenant_id"]),
            max_sort_fields: 3,
            max_result_size: 1_000_000,
            force_index_usage: true,
        }
    }

    pub fn ingestion_records() -> Self {
        Self {
            default_field: Some("ingested_at".into()),
            default_direction: SortDirection::Desc,
            allowed_fields: field_set(&[
                "ingested_at",
                "tenant_id",
                "source_id",
                "file_name",
                "file_size",
                "status",
            ]),
            indexed_fields: field_set(&["ingested_at", "tenant_id", "source_id"]),
            max_sort_fields: 3,
            max_result_size: 10_000_000,
            force_index_usage: true,
        }
    }

    pub fn analytics_events() -> Self {
        Self {
            default_field: Some("event_time".into()),
            default_direction: SortDirection::Desc,
            allowed_fields: field_set(&[
                "event_time",
                "tenant_id",
                "source_id",
                "event_type",
                "value",
            ]),
            indexed_fields: field_set(&["event_time", "tenant_id", "event_type"]),
            max_sort_fields: 4,
            max_result_size: 50_000_000,
            force_index_usage: false,
        }
    }

    pub fn is_indexed(&self, field: &str) -> bool {
        self.indexed_fields.contains(field)
    }

    /// Validate and normalise a requested ordering.
    ///
    /// An empty request yields the policy default (or nothing when the policy
    /// has none). Directions were already coerced to ascending when absent or
    /// unrecognised, see [`SortDirection::parse_lenient`].
    pub fn validate(&self, requested: &[SortField]) -> Result<Vec<SortField>> {
        if requested.is_empty() {
            return Ok(self
                .default_field
                .iter()
                .map(|f| SortField::new(f.clone(), self.default_direction))
                .collect());
        }
        if requested.len() > self.max_sort_fields {
            return Err(QuarryError::TooManyFields {
                requested: requested.len(),
                max: self.max_sort_fields,
            });
        }
        let mut seen = HashSet::with_capacity(requested.len());
        for sort in requested {
            if !seen.insert(sort.field.as_str()) {
                return Err(QuarryError::DuplicateField(sort.field.clone()));
            }
            if !self.allowed_fields.contains(&sort.field) {
                return Err(QuarryError::DisallowedField(sort.field.clone()));
            }
        }
        Ok(requested.to_vec())
    }
}

/// The process-wide sort policies, one per [`QueryKind`].
#[derive(Debug, Clone)]
pub struct SortPolicies {
    tenant_summaries: SortPolicy,
    ingestion_records: SortPolicy,
    analytics_events: SortPolicy,
}

impl SortPolicies {
    pub fn builtin() -> Self {
        Self {
            tenant_summaries: SortPolicy::tenant_summaries(),
            ingestion_records: SortPolicy::ingestion_records(),
            analytics_events: SortPolicy::analytics_events(),
        }
    }

    pub fn with_policy(mut self, kind: QueryKind, policy: SortPolicy) -> Self {
        match kind {
            QueryKind::TenantSummaries => self.tenant_summaries = policy,
            QueryKind::IngestionRecords => self.ingestion_records = policy,
            QueryKind::AnalyticsEvents => self.analytics_events = policy,
        }
        self
    }

    pub fn for_kind(&self, kind: QueryKind) -> &SortPolicy {
        match kind {
            QueryKind::TenantSummaries => &self.tenant_summaries,
            QueryKind::IngestionRecords => &self.ingestion_records,
            QueryKind::AnalyticsEvents => &self.analytics_events,
        }
    }
}

impl Default for SortPolicies {
    fn default() -> Self {
        Self::builtin()
    }
}
