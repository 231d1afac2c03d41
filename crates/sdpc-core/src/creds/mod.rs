//! Credential storage: atomic rotation of the TLS pair and SPA keys.

mod keyfile;
mod store;

pub use keyfile::{replace_client_spa_keys, replace_fwknop_spa_keys};
pub use store::{apply, CredFilePaths};
