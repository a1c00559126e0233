pub mod caller;
pub mod csr_types;
pub mod identity;
pub mod type_defs;

pub mod config;
pub mod error;

pub mod shutdown;
pub mod telemetry;

pub mod utils;

pub use caller::CallerIdentity;
pub use error::{CaError, ErrorCategory, IdentityError, RedeemError, Result};
pub use identity::SubjectIdentity;
pub use type_defs::{RequestId, SerialNumber, TokenId};
