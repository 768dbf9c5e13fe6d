//! Secret-encryption machinery.
//!
//! Secret plaintext is owned by pluggable backends called *keepers*. The
//! metadata store only ever holds the opaque [`ExternalId`] a keeper returns;
//! plaintext flows through [`SecretString`] values that redact themselves in
//! logs and serialization and zero their memory on drop.
//!
//! # Architecture
//!
//! - [`Keeper`] is the capability contract: store, update, expose, delete.
//! - [`KeeperRegistry`] maps the closed [`KeeperType`] enumeration to
//!   registered keeper instances. Nothing is resolved by reflection; adding a
//!   backend means adding a variant and registering an implementation.
//! - [`SqlKeeper`] is the built-in backend the reserved default keeper name
//!   resolves to. It encrypts with AES-256-GCM ([`SecretEncryption`]) and
//!   stores ciphertext in the local database.
//! - [`MemoryKeeper`] keeps plaintext in process memory for tests and local
//!   development.

pub mod encryption;
pub mod keeper;
pub mod memory;
pub mod registry;
pub mod sql;
pub mod types;

pub use encryption::{SecretEncryption, SecretEncryptionConfig};
pub use keeper::{
    AwsKeeperConfig, ExternalId, GcpKeeperConfig, Keeper, KeeperConfig, KeeperType,
    VaultKeeperConfig, DEFAULT_SQL_KEEPER,
};
pub use memory::MemoryKeeper;
pub use registry::KeeperRegistry;
pub use sql::SqlKeeper;
pub use types::SecretString;
