mod blocklist;
mod pii;

pub use blocklist::BlocklistScanner;
pub use pii::PiiRedactScanner;
