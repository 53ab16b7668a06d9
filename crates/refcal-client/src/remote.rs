use std::collections::BTreeMap;

use refcal_core::Header;
use serde::{Deserialize, Serialize};

use crate::engine::RefOutcome;

/// A server's answer to a best-references request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteAnswer {
    /// Context the server actually resolved against.
    pub context: String,
    pub refs: BTreeMap<String, RefOutcome>,
    pub server_version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("server unreachable: {0}")]
pub struct NetworkError(pub String);

/// Channel to an authoritative resolution server.
///
/// The transport and its wire format belong to the implementation.
pub trait RemoteResolver: Send + Sync {
    /// # Errors
    /// Returns [`NetworkError`] when the server cannot be reached or answers garbage.
    fn resolve(
        &self,
        context: &str,
        header: &Header,
        reftypes: Option<&[String]>,
    ) -> Result<RemoteAnswer, NetworkError>;
}
