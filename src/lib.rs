//! Tools for a Docker graph store: resolve references, list images, mount
//! an image's filesystem read-only and export it as a runtime bundle.

pub mod bundle;
pub mod cancel;
pub mod driver;
pub mod error;
pub mod graph;
pub mod mount;

pub use error::{GraphError, Result};
