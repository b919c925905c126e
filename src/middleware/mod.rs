//! HTTP middleware: error envelope and request logging.

pub mod error;
pub mod logging;
