//! Best-reference resolution over a local cache, with optional server fallback.

mod client;
mod config;
mod engine;
mod error;
mod remote;

#[cfg(test)]
mod testing;

pub use client::{AnswerSource, HeavyClient, Resolution, CLIENT_VERSION};
pub use config::{ClientConfig, ResolutionMode};
pub use engine::{
    get_best_references, BestRefs, BestRefsRequest, RefOutcome, DEFAULT_INSTRUMENT_KEYWORDS,
};
pub use error::ClientError;
pub use remote::{NetworkError, RemoteAnswer, RemoteResolver};
