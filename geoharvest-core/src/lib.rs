#![doc = include_str!("../README.md")]

use std::path::PathBuf;

pub mod hierarchy;
pub mod parse;
pub mod records;
pub mod storage;

pub use records::{CountryInfo, FeatureClass, GeonameRecord};

/// Errors raised while curating one country file.
///
/// A failure is always local to the country being processed; callers report
/// it and move on, they never tear anything else down because of it.
#[derive(Debug, thiserror::Error)]
pub enum CurateError {
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),

    #[error("read tsv: {0}")]
    Tsv(#[from] csv::Error),

    #[error("curated records codec: {0}")]
    Codec(#[from] bincode::Error),

    #[error("curated file {} is truncated", .0.display())]
    Truncated(PathBuf),

    #[error("curation cancelled")]
    Cancelled,
}
