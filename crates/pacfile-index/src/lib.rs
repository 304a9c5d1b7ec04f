//! Per-repository package indexes on SQLite, the synchronizers that keep
//! them current and the query engine that reads them.

pub mod archive;
pub mod directory;
pub mod query;
pub mod schema;
pub mod store;
pub mod sync;

pub use archive::ArchiveSource;
pub use directory::DirectorySource;
pub use query::{PackageDetails, QueryEngine, QueryError};
pub use store::{Lookup, PackageStore, RepoIndex, RepoWriter, StoreError};
pub use sync::{sync_repository, SyncError, SyncReport, Synchronizer};
