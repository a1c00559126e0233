//! Services 模块 - CA 生命周期各组件

pub mod ca_service;
pub mod renewal;
pub mod request_ledger;
pub mod revocation;
pub mod signer;
pub mod token_store;
pub mod token_sweeper;

pub use ca_service::CaService;
pub use renewal::RenewalService;
pub use request_ledger::CertificateRequestLedger;
pub use revocation::RevocationRegistry;
pub use signer::{validate_csr, CertificateSigner, ValidatedCsr};
pub use token_store::BootstrapTokenStore;
pub use token_sweeper::TokenSweeper;
