//! Driver abstraction.
//!
//! The wire protocol is an external collaborator. A backend implements
//! [`Connection`] — execute, a non-blocking send/poll pair with a readiness
//! descriptor, prepared statements, transaction verbs, the bulk-load path
//! and escaping — and registers a connect function under its driver name.
//! Everything above this seam works purely in terms of `(tag, bytes)` cell
//! matrices.

pub mod sqlite;

use std::collections::HashMap;
use std::io::Read;
use std::os::unix::io::RawFd;

use bytes::Bytes;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use smallvec::SmallVec;
use thiserror::Error;

use crate::options::Config;
use crate::param::Param;
use crate::value::TypeTag;

/// Errors reported by a driver backend, mapped to the public taxonomy at
/// each operation boundary.
#[derive(Error, Debug)]
pub enum DriverError {
    /// Session-level failure: refused connect, dropped connection, dead
    /// worker.
    #[error("{0}")]
    Connection(String),

    /// Query-level failure: bad SQL, constraint violation, misuse.
    #[error("{0}")]
    Query(String),
}

pub type DriverResult<T> = std::result::Result<T, DriverError>;

/// One row of raw cells; `None` is an absent (NULL) cell.
pub type RawRow = SmallVec<[Option<Bytes>; 16]>;

/// A fully buffered query result as the driver reports it: ordered field
/// names, per-column type tags and the complete cell matrix.
#[derive(Debug, Default)]
pub struct RawResult {
    pub fields: Vec<String>,
    pub types: Vec<TypeTag>,
    pub rows: Vec<RawRow>,
    /// Affected-row count for writes, buffered-row count for reads.
    pub affected: u64,
    /// Identity value of the last inserted row, when the backend has one.
    pub insert_id: Option<i64>,
}

impl RawResult {
    pub fn empty() -> Self {
        Self::default()
    }
}

/// One physical database session.
///
/// A connection is owned exclusively — by an [`crate::Adapter`] or by the
/// pool — and is never operated on by two logical callers at once. All
/// methods take `&mut self` to make that exclusivity structural.
pub trait Connection: Send {
    /// Execute a statement, blocking until it completes. Returns the
    /// affected-row count; the full result stays buffered for
    /// [`Connection::take_results`].
    fn execute(&mut self, sql: &str, params: &[Param]) -> DriverResult<u64>;

    /// Take the buffered result of the most recently executed statement.
    fn take_results(&mut self) -> Option<RawResult>;

    /// Issue a query without waiting for it. Exactly one send may be in
    /// flight per connection; completion is observed via
    /// [`Connection::try_results`] after the readiness descriptor fires.
    fn send_query(&mut self, sql: &str, params: &[Param]) -> DriverResult<()>;

    /// Non-blocking completion poll for a previous `send_query`.
    /// `Ok(None)` means the operation still needs more steps.
    fn try_results(&mut self) -> DriverResult<Option<RawResult>>;

    /// Readiness descriptor for external event loops: readable when
    /// `try_results` can make progress.
    fn socket(&self) -> RawFd;

    /// Compile a statement, returning a driver-side handle id.
    fn prepare(&mut self, sql: &str) -> DriverResult<u32>;

    /// Execute a previously prepared statement (blocking).
    fn execute_prepared(&mut self, id: u32, params: &[Param]) -> DriverResult<u64>;

    /// Release a prepared statement's server-side resources.
    fn finish_statement(&mut self, id: u32) -> DriverResult<()>;

    /// Begin a transaction, or create a savepoint when a name is given.
    fn begin(&mut self, savepoint: Option<&str>) -> DriverResult<()>;

    /// Commit the transaction, or release the named savepoint.
    fn commit(&mut self, savepoint: Option<&str>) -> DriverResult<()>;

    /// Roll back the transaction, or roll back to and discard the named
    /// savepoint.
    fn rollback(&mut self, savepoint: Option<&str>) -> DriverResult<()>;

    /// Bulk-load tab-delimited rows from `source` into `table` via the
    /// backend's fast path. Returns the number of rows written.
    fn write(
        &mut self,
        table: &str,
        fields: &[String],
        source: Box<dyn Read + Send>,
    ) -> DriverResult<u64>;

    /// Backend-specific text escaping.
    fn escape(&self, text: &str) -> String;

    /// Close the session. Later operations fail with a connection error.
    fn close(&mut self) -> DriverResult<()>;
}

/// Connect function registered per driver name.
pub type ConnectFn = fn(&Config) -> DriverResult<Box<dyn Connection>>;

static REGISTRY: Lazy<RwLock<HashMap<String, ConnectFn>>> = Lazy::new(|| {
    let mut drivers: HashMap<String, ConnectFn> = HashMap::new();
    drivers.insert("sqlite".to_string(), sqlite::connect);
    RwLock::new(drivers)
});

/// Register a backend under a driver name. Out-of-crate backends can plug
/// in here; the name is what [`Config::new`] selects on.
pub fn register(name: &str, connect: ConnectFn) {
    REGISTRY.write().insert(name.to_string(), connect);
}

/// Open a connection for the configured driver.
pub fn connect(config: &Config) -> DriverResult<Box<dyn Connection>> {
    let connect = REGISTRY
        .read()
        .get(config.driver.as_str())
        .copied()
        .ok_or_else(|| DriverError::Query(format!("unknown driver {:?}", config.driver)))?;
    connect(config)
}
