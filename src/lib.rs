pub mod config;
pub mod cursor;
pub mod error;
pub mod extraction;
pub mod formats;
pub mod index;
pub mod logging;
pub mod pipeline;
pub mod repair;
pub mod rpc;
pub mod scanner;
pub mod stats;
pub mod thumbnail;
pub mod types;
pub mod validation;

pub use config::Config;
pub use error::{ConfigError, IndexError, RpcError, ScanError};
pub use extraction::{DispatchFilters, Dispatcher};
pub use index::{ImageIndex, ImageRecord, Provenance, Query, Validity};
pub use rpc::{CoreRpc, LedgerRpc};
pub use scanner::{PassSummary, ScanState, Scanner, StopReason};
pub use types::{BlockRef, Candidate, ExtractionMethod, ImageFormat, Origin, Transaction};
pub use validation::{ImageValidator, Strictness, ValidationConfig, Verdict};
