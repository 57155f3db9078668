//! # OCI Container Registry
//!
//! An artifact registry speaking the
//! [OCI Distribution Specification](https://github.com/opencontainers/distribution-spec),
//! with background maintenance driven by a work queue.
//!
//! ## Layout
//!
//! - [`distribution`]: the `/v2` wire protocol (blobs, resumable uploads,
//!   manifests, tags, referrers).
//! - [`dal`]: metadata in sqlite or postgres.
//! - [`workq`]: a producer/consumer job fabric with database, in-memory,
//!   Redis and Kafka backends.
//! - [`daemon`]: the job consumers: garbage collection, webhook delivery
//!   and push reconciliation.
//! - [`auth`]: users, bearer tokens and repository access.
//!
//! Blob bytes live in the `storage` crate, locks in `locker`, cached values
//! in `cacher`.
//!
//! ## Example
//!
//! ```no_run
//! use registry::AppBuilder;
//! use registry::config::Config;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> eyre::Result<()> {
//! let app = AppBuilder::new(Config::default()).build().await?;
//! registry::server::serve(app, CancellationToken::new()).await?;
//! # Ok(())
//! # }
//! ```

mod app;
pub mod auth;
pub mod config;
pub mod daemon;
pub mod dal;
pub mod digest;
pub mod distribution;
mod error;
pub mod manifest;
pub mod quota;
pub mod server;
pub mod workq;

pub use app::{App, AppBuilder};
pub use error::{RegistryError, RegistryResult};
