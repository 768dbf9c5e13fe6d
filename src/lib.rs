//! # Keepsake
//!
//! Keepsake is a versioned resource storage layer with pluggable secret
//! encryption. It stores named, namespaced objects with multi-version
//! history, paginated listing, and change notification; secret material is
//! delegated to swappable encryption backends ("keepers") and glued to the
//! metadata store through a transactional outbox for eventually-consistent
//! propagation of writes.
//!
//! ## Architecture
//!
//! ```text
//! SecureValueStorage / DecryptStorage        ResourceStorage
//!        │            │                            │
//!   KeeperRegistry    │                      ListIterator
//!        │        OutboxQueue                      │
//!    Keeper(s)        │                     MetadataStore
//!        └────────────┴──────────┬─────────────────┘
//!                             SQLite (sqlx)
//! ```
//!
//! ## Core Components
//!
//! - **MetadataStore**: versioned object store keyed by
//!   `(group, resource, namespace, name, uid)` over an ordered KV substrate
//! - **ResourceStorage**: the uniform read/list/write/watch contract every
//!   resource kind goes through, with continuation-token pagination
//! - **SecureValueStorage**: secret metadata CRUD; plaintext lives only in
//!   the resolved keeper
//! - **DecryptStorage**: the single auditable path that exposes plaintext
//! - **OutboxQueue**: at-least-once handoff of secret-store side effects
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use keepsake::{Config, Result};
//! use keepsake::storage::create_pool;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = Config::from_env()?;
//!     keepsake::observability::init_tracing(&config.observability)?;
//!     let pool = create_pool(&config.database).await?;
//!     let storage = keepsake::storage::SqlResourceStorage::new(pool);
//!     let _ = storage;
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod config;
pub mod errors;
pub mod observability;
pub mod secrets;
pub mod storage;

// Re-export commonly used types and traits
pub use auth::{Identity, IdentityType, RequestContext};
pub use config::Config;
pub use errors::{KeepsakeError, Result};
pub use observability::init_tracing;

/// Application version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name from Cargo.toml
pub const APP_NAME: &str = env!("CARGO_PKG_NAME");
