pub mod cache;
pub mod fingerprint;
pub mod pipeline;
pub mod scanner;
pub mod scanners;

pub use cache::{CacheStatsSnapshot, ScanCache};
pub use fingerprint::{Fingerprint, Side};
pub use pipeline::{Pipeline, ScanResult, ScannerOutcome};
pub use scanner::{Scanned, Scanner, ScannerError};
