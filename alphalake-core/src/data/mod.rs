//! Ingestion pipeline stages: sources, normalization, dedup, planning and storage.

pub mod circuit_breaker;
pub mod clean;
pub mod csv_source;
pub mod eastmoney;
pub mod merge;
pub mod normalize;
pub mod plan;
pub mod provider;
pub mod schema;
pub mod store;
pub mod universe;

pub use circuit_breaker::CircuitBreaker;
pub use csv_source::{CsvDirSource, CsvFormat};
pub use eastmoney::{EastmoneyConfig, EastmoneySource};
pub use merge::{collapse, merge, Merged};
pub use normalize::{AltBinding, NormalizeOutput, Normalizer, RowIssue};
pub use plan::{default_full_start, PartitionPlan, PartitionPlanner};
pub use provider::{BaostockRow, DataError, RawBatch, RawRecord, RowError, SourceAdapter};
pub use schema::{SchemaError, SCHEMA_VERSION};
pub use store::{
    CommitReceipt, DatasetStats, ParquetEncoder, PartitionEncoder, PartitionInfo, PartitionWriter,
};
pub use universe::{Universe, UniverseError};
