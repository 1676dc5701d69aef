pub mod cluster;
pub mod error;
pub mod executor;
pub mod index;
pub mod rewrite;
pub mod scale;
pub mod sort;
pub mod store;

#[cfg(test)]
pub(crate) mod testing;

pub use cluster::{ClusterConfig, ClusterCoordinator, ClusterHints, IndexStrategy, NodeDescriptor};
pub use error::{NodeFailure, QuarryError, StoreError};
pub use executor::{QueryExecutor, QueryRequest, QueryResponse, QueryStream, StreamItem};
pub use index::{IndexDefinition, IndexManager, IndexStatus, IndexType, IndexUsage, Suggestion};
pub use rewrite::QueryRewriter;
pub use scale::{Complexity, ComplexityReport, ScaleAdvisor, ScalePlan, ScalePolicy};
pub use sort::{QueryKind, SortDirection, SortField, SortPolicies, SortPolicy};
pub use store::{QueryContext, QueryOutput, Row, Store};
