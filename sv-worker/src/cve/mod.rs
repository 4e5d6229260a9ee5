//! CVE intelligence: explicit extraction from article text, NVD delta sync,
//! and the change journal.

pub mod extract;
pub mod nvd;
pub mod sync;

pub use sync::CveSyncHandler;
