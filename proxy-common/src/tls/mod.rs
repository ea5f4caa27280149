//! TLS-facing modules: context table, SNI dispatch, OCSP stapling, and
//! the small DER helper the latter needs.

pub mod context;
pub mod der;
pub mod ocsp;
pub mod sni;

pub use context::{ContextTable, TlsContext};
pub use ocsp::OcspStapler;
pub use sni::SniResolver;
