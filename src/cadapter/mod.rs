//! Object-store adapter layer: the backend trait plus concrete adapters.

pub mod client;
pub mod memory;
pub mod s3;
