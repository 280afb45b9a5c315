//! Casbin policy persistence over pluggable document stores.
//!
//! # Purpose
//! Stores authorization rules (`p, alice, data1, read`, `g, alice, admin`) as
//! rows in a document store and rebuilds an in-memory rule set from them. The
//! crate owns the row encoding, the filter language used for partial loads and
//! deletes, and the update protocol that keeps the store in step with bulk
//! policy changes.
//!
//! # How it fits
//! - [`DocstoreAdapter`] is what an enforcer host talks to.
//! - [`RuleGateway`] is what a storage backend implements; `mem`, `mongo` and
//!   `postgres` backends ship in [`backends`].
//! - [`DriverRegistry`] turns a connection URL into a gateway.
//!
//! # Key invariants
//! - A row's id is derived from its content, so re-adding a rule is a no-op.
//! - Updates are atomic on transactional backends and best-effort elsewhere;
//!   best-effort failures surface as [`PolicyStoreError::PartialUpdate`].
//! - A filtered load blocks saving until the next full load.
//!
//! # Important configuration
//! [`PolicyStoreConfig::from_env_or_yaml`] reads `FELIX_POLICY_STORE_URL`,
//! `MONGO_SERVER_URL` and the Postgres pool settings.
//!
//! # Examples
//! ```rust
//! use felix_policy_store::{DocstoreAdapter, DriverRegistry, FilterDescriptor, PolicySet};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> felix_policy_store::PolicyStoreResult<()> {
//! let registry = DriverRegistry::with_memory_driver();
//! let adapter = DocstoreAdapter::open(&registry, "mem://casbin_rule/id").await?;
//! let cancel = CancellationToken::new();
//! adapter
//!     .add_policies(&cancel, "p", "p", &[vec!["alice", "data1", "read"], vec!["bob", "data2", "write"]])
//!     .await?;
//!
//! let mut bob_only = PolicySet::new();
//! adapter
//!     .load_filtered_policy(&cancel, &mut bob_only, FilterDescriptor::new("v0", "bob"))
//!     .await?;
//! assert_eq!(bob_only.get_policy("p"), &[vec!["bob", "data2", "write"]]);
//! # Ok(())
//! # }
//! ```
pub mod adapter;
pub mod backends;
pub mod codec;
pub mod config;
pub mod enforcer;
pub mod errors;
pub mod filter;
pub mod gateway;
pub mod model;
pub mod observability;
pub mod registry;
pub mod row;

pub use adapter::DocstoreAdapter;
pub use config::{PolicyStoreConfig, PostgresConfig};
pub use errors::{PolicyStoreError, PolicyStoreResult, UpdatePhase};
pub use filter::{Filter, FilterDescriptor, FilterValue, Selector};
pub use gateway::{ReplaceBatch, RowStream, RuleGateway};
pub use model::{PolicyModel, PolicySet};
pub use registry::{DriverFactory, DriverRegistry};
pub use row::{RowField, RuleRow};
