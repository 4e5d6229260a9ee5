//! Shared foundation for the SemperVigil services.
//!
//! Everything the worker and admin processes have in common lives here:
//! the error taxonomy, domain models, runtime configuration, and the
//! database layer (pool init, migrations, settings).

pub mod db;
pub mod error;
pub mod ids;
pub mod models;
pub mod params;
pub mod secrets;
pub mod severity;
pub mod time;
pub mod urlnorm;

pub use error::{Error, ErrorKind, Result};
