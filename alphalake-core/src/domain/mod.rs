//! Domain types shared by every stage of the pipeline.

pub mod asset;
pub mod dataset;
pub mod row;

pub use asset::{file_stem, is_index_code, Asset, AssetKind};
pub use dataset::{DataType, Dataset, DateRange, PartitionKey, RunMode};
pub use row::{
    content_hash, Adjust, AltFields, CanonicalRow, FinancialFields, PriceFields, RowBody, RowKey,
};
