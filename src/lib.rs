// Library root
// -----------
// This crate exposes a small library surface for the CLI binary.
//
// Module responsibilities:
// - `api`: blocking HTTP client for the remote index and media endpoints,
//   request decorators, and the retrying `execute` wrapper.
// - `auth`: OAuth2 authorization-code flow and the on-disk token cache.
// - `backoff`: exponential-backoff retry schedule for --auto-retry.
// - `transfer`: the chunked upload/download engine behind transport traits.
// - `progress`: the --verbose progress reporter.
// - `cli`: the clap argument surface.
// - `commands`: one function per CLI verb, orchestrating the above.
pub mod api;
pub mod auth;
pub mod backoff;
pub mod cli;
pub mod commands;
pub mod error;
pub mod progress;
pub mod transfer;

pub use error::Error;
