//! Connection pool with non-blocking, multiplexed request dispatch.
//!
//! The pool owns a fixed set of connections created at construction.
//! `execute` checks one out, issues the query without blocking and hands
//! back a [`PendingRequest`]; an external event loop polls the request's
//! readiness descriptor and calls [`PendingRequest::process`] until it
//! completes. Completion materializes the result and returns the
//! connection to the idle set exactly once. No thread in this module ever
//! blocks on I/O.

use std::io::Write;
use std::os::unix::io::RawFd;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::driver::{self, Connection};
use crate::error::{Error, Result};
use crate::options::Config;
use crate::param::Param;
use crate::result::ResultSet;
use crate::trace::Tracer;

// ============================================================================
// Pool
// ============================================================================

struct PoolInner {
    config: Config,
    tzoffset: i32,
    size: usize,
    /// Idle connections. Checkout/checkin is atomic under this lock; a
    /// connection is held by at most one request at a time.
    idle: Mutex<Vec<Box<dyn Connection>>>,
}

impl PoolInner {
    fn checkin(&self, conn: Box<dyn Connection>) {
        self.idle.lock().push(conn);
    }
}

/// A fixed-size connection pool.
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
    tracer: Tracer,
}

impl ConnectionPool {
    /// Create `size` connections up front. Size is fixed and must be ≥ 1.
    pub fn new(size: usize, config: Config) -> Result<Self> {
        if size < 1 {
            return Err(Error::general(
                "ConnectionPool#new",
                "called with invalid pool size",
            ));
        }
        config.validate("ConnectionPool#new")?;
        let tzoffset = config.tzoffset("ConnectionPool#new")?;

        let mut connections = Vec::with_capacity(size);
        for _ in 0..size {
            let conn = driver::connect(&config)
                .map_err(|e| Error::from_driver("ConnectionPool#new", e))?;
            connections.push(conn);
        }
        tracing::debug!(size, driver = %config.driver, "connection pool ready");

        Ok(Self {
            inner: Arc::new(PoolInner {
                config,
                tzoffset,
                size,
                idle: Mutex::new(connections),
            }),
            tracer: Tracer::off(),
        })
    }

    /// Toggle statement tracing to stderr.
    pub fn trace(&mut self, enabled: bool) {
        self.tracer = if enabled { Tracer::stderr() } else { Tracer::off() };
    }

    /// Enable statement tracing to the given sink.
    pub fn trace_to(&mut self, sink: Box<dyn Write + Send>) {
        self.tracer = Tracer::to(sink);
    }

    /// Configured pool size.
    pub fn size(&self) -> usize {
        self.inner.size
    }

    /// Connections currently idle.
    pub fn idle_count(&self) -> usize {
        self.inner.idle.lock().len()
    }

    /// Submit a query without blocking.
    ///
    /// Returns `Ok(None)` when every connection is checked out — sizing is
    /// fixed and nothing queues; the caller resubmits from its event loop.
    pub fn execute(&self, sql: &str, params: &[Param]) -> Result<Option<PendingRequest>> {
        let conn = self.inner.idle.lock().pop();
        let Some(mut conn) = conn else {
            return Ok(None);
        };

        self.tracer.log(sql, params);
        if let Err(e) = conn.send_query(sql, params) {
            self.inner.checkin(conn);
            return Err(Error::from_driver("Pool#execute", e));
        }

        Ok(Some(PendingRequest {
            conn: Some(conn),
            pool: Arc::clone(&self.inner),
            state: RequestState::Submitted,
            result: None,
        }))
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("size", &self.inner.size)
            .field("idle", &self.idle_count())
            .finish()
    }
}

// ============================================================================
// Pending request
// ============================================================================

/// Progress state of an in-flight request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Submitted,
    Waiting,
    InProgress,
    Completed,
}

/// An in-flight asynchronous query.
///
/// Holds its connection checked out until completion. Not `Clone`; exists
/// between submission and the completion (or abandonment) that returns
/// the connection to the pool.
pub struct PendingRequest {
    conn: Option<Box<dyn Connection>>,
    pool: Arc<PoolInner>,
    state: RequestState,
    result: Option<ResultSet>,
}

impl PendingRequest {
    pub fn state(&self) -> RequestState {
        self.state
    }

    /// Readiness descriptor of the owning connection — the integration
    /// point for select/poll/epoll-style event loops.
    pub fn socket(&self) -> Result<RawFd> {
        self.conn
            .as_ref()
            .map(|conn| conn.socket())
            .ok_or_else(|| Error::general("Request#socket", "request already completed"))
    }

    /// Advance the request by one non-blocking step.
    ///
    /// Returns `Ok(false)` while more steps are needed and `Ok(true)` on
    /// completion, at which point [`PendingRequest::take_result`] yields
    /// the materialized result. Safe to call repeatedly; a driver failure
    /// surfaces as the error and still checks the connection back in.
    pub fn process(&mut self) -> Result<bool> {
        let Some(conn) = self.conn.as_mut() else {
            return Ok(true);
        };
        self.state = RequestState::InProgress;
        match conn.try_results() {
            Ok(Some(raw)) => {
                self.result = Some(ResultSet::new(raw, self.pool.tzoffset));
                self.complete();
                Ok(true)
            }
            Ok(None) => {
                self.state = RequestState::Waiting;
                Ok(false)
            }
            Err(e) => {
                let err = Error::from_driver("Request#process", e);
                self.complete();
                Err(err)
            }
        }
    }

    /// Take the completed result. `None` before completion, after a
    /// failed request, or once already taken.
    pub fn take_result(&mut self) -> Option<ResultSet> {
        self.result.take()
    }

    /// Check the connection in exactly once and mark the request done.
    fn complete(&mut self) {
        self.state = RequestState::Completed;
        if let Some(conn) = self.conn.take() {
            self.pool.checkin(conn);
        }
    }
}

impl Drop for PendingRequest {
    fn drop(&mut self) {
        // Abandonment: recover the connection if the operation already
        // drained, otherwise force-close it rather than hand it back
        // mid-operation. The pool does not grow a replacement.
        if let Some(mut conn) = self.conn.take() {
            match conn.try_results() {
                Ok(Some(_)) => self.pool.checkin(conn),
                _ => {
                    tracing::warn!("request abandoned mid-flight, closing its connection");
                    let _ = conn.close();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params;
    use crate::value::Value;

    fn pool(size: usize) -> ConnectionPool {
        ConnectionPool::new(size, Config::new("sqlite", ":memory:")).unwrap()
    }

    fn drive(request: &mut PendingRequest) -> Result<()> {
        loop {
            if request.process()? {
                return Ok(());
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
    }

    #[test]
    fn test_invalid_pool_size() {
        let err = ConnectionPool::new(0, Config::new("sqlite", ":memory:")).unwrap_err();
        assert_eq!(
            err.to_string(),
            "ConnectionPool#new: called with invalid pool size"
        );
    }

    #[test]
    fn test_missing_options() {
        let err = ConnectionPool::new(1, Config::new("sqlite", "")).unwrap_err();
        assert_eq!(err.to_string(), "ConnectionPool#new: called without :db");
    }

    #[test]
    fn test_request_lifecycle() {
        let pool = pool(1);
        let mut request = pool.execute("SELECT 1 AS one", &[]).unwrap().unwrap();
        assert_eq!(request.state(), RequestState::Submitted);
        assert!(request.socket().unwrap() >= 0);
        assert_eq!(pool.idle_count(), 0);

        drive(&mut request).unwrap();
        assert_eq!(request.state(), RequestState::Completed);
        assert_eq!(pool.idle_count(), 1);

        // Repeated process calls after completion stay true.
        assert!(request.process().unwrap());

        let set = request.take_result().unwrap();
        assert_eq!(set.rows(), 1);
        // Expression columns carry no declared type and decode as text.
        let row = set.next_row().unwrap().unwrap();
        assert_eq!(row.get("one"), Some(&Value::Text("1".to_string())));
        assert!(request.take_result().is_none());
        assert!(request.socket().is_err());
    }

    #[test]
    fn test_exhausted_pool_yields_no_request() {
        let pool = pool(2);
        let first = pool.execute("SELECT 1", &[]).unwrap();
        let second = pool.execute("SELECT 2", &[]).unwrap();
        assert!(first.is_some());
        assert!(second.is_some());

        // Size is fixed: the third submission finds nothing idle.
        assert!(pool.execute("SELECT 3", &[]).unwrap().is_none());

        for request in [first, second].into_iter().flatten() {
            let mut request = request;
            drive(&mut request).unwrap();
        }
        assert_eq!(pool.idle_count(), 2);

        // Capacity is available again.
        assert!(pool.execute("SELECT 4", &[]).unwrap().is_some());
    }

    #[test]
    fn test_many_requests_through_small_pool() {
        let pool = pool(2);
        let mut completed = 0;
        let mut pending = Vec::new();

        for n in 0..5 {
            loop {
                match pool.execute(&format!("SELECT {n}"), &[]).unwrap() {
                    Some(request) => {
                        // At most `size` requests ever hold a connection.
                        pending.push(request);
                        assert!(pending.len() <= pool.size());
                        break;
                    }
                    None => {
                        let mut request = pending.remove(0);
                        drive(&mut request).unwrap();
                        completed += 1;
                    }
                }
            }
        }
        for mut request in pending {
            drive(&mut request).unwrap();
            completed += 1;
        }

        assert_eq!(completed, 5);
        assert_eq!(pool.idle_count(), 2);
    }

    #[test]
    fn test_failed_request_returns_connection() {
        let pool = pool(1);
        let mut request = pool.execute("SELEC wat", &[]).unwrap().unwrap();

        let err = loop {
            match request.process() {
                Ok(true) => panic!("expected a query error"),
                Ok(false) => std::thread::sleep(std::time::Duration::from_millis(1)),
                Err(err) => break err,
            }
        };
        assert!(!err.is_connection());
        assert_eq!(request.state(), RequestState::Completed);
        assert_eq!(pool.idle_count(), 1);
        assert!(request.take_result().is_none());
    }

    #[test]
    fn test_abandoned_request_recovered_after_drain() {
        let pool = pool(1);
        let request = pool.execute("SELECT 1", &[]).unwrap().unwrap();
        assert_eq!(pool.idle_count(), 0);

        // Give the worker time to finish so the drop-side drain succeeds.
        std::thread::sleep(std::time::Duration::from_millis(50));
        drop(request);
        assert_eq!(pool.idle_count(), 1);
    }

    #[test]
    fn test_pool_queries_see_separate_sessions() {
        // :memory: databases are per-connection; both members answer.
        let pool = pool(2);
        let mut one = pool.execute("SELECT 1 AS n", &[]).unwrap().unwrap();
        let mut two = pool.execute("SELECT 2 AS n", &[]).unwrap().unwrap();
        drive(&mut two).unwrap();
        drive(&mut one).unwrap();

        let first = one.take_result().unwrap();
        let second = two.take_result().unwrap();
        let row = first.next_row().unwrap().unwrap();
        assert_eq!(row.get("n"), Some(&Value::Text("1".to_string())));
        let row = second.next_row().unwrap().unwrap();
        assert_eq!(row.get("n"), Some(&Value::Text("2".to_string())));
    }

    #[test]
    fn test_bound_parameters_reach_the_connection() {
        let pool = pool(1);
        let mut request = pool
            .execute("SELECT ? AS answer", &params!["42"])
            .unwrap()
            .unwrap();
        drive(&mut request).unwrap();
        let set = request.take_result().unwrap();
        let row = set.next_row().unwrap().unwrap();
        assert_eq!(row.get("answer"), Some(&Value::Text("42".to_string())));
    }
}
