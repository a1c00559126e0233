pub mod repositories;

pub use repositories::{Versioned, VersionedStore};
