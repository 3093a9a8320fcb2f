//! Synchronous handle.
//!
//! An [`Adapter`] owns exactly one driver connection. Calls block the
//! invoking thread while the connection's worker does the I/O; one
//! connection, one concurrent caller. The type is deliberately not
//! `Clone` — duplicating a live handle would create two owners of one
//! connection.

use std::io::{Read, Write};

use uuid::Uuid;

use crate::driver::{self, Connection};
use crate::error::{Error, Result};
use crate::options::Config;
use crate::param::Param;
use crate::result::ResultSet;
use crate::trace::Tracer;

pub struct Adapter {
    conn: Box<dyn Connection>,
    config: Config,
    tzoffset: i32,
    transactions: Vec<String>,
    tracer: Tracer,
    closed: bool,
}

impl Adapter {
    /// Connect using the configured driver.
    pub fn new(config: Config) -> Result<Self> {
        config.validate("Adapter#new")?;
        let tzoffset = config.tzoffset("Adapter#new")?;
        let conn = driver::connect(&config).map_err(|e| Error::from_driver("Adapter#new", e))?;
        Ok(Self {
            conn,
            config,
            tzoffset,
            transactions: Vec::new(),
            tracer: Tracer::off(),
            closed: false,
        })
    }

    pub fn options(&self) -> &Config {
        &self.config
    }

    /// Toggle statement tracing to stderr.
    pub fn trace(&mut self, enabled: bool) {
        self.tracer = if enabled { Tracer::stderr() } else { Tracer::off() };
    }

    /// Enable statement tracing to the given sink.
    pub fn trace_to(&mut self, sink: Box<dyn Write + Send>) {
        self.tracer = Tracer::to(sink);
    }

    /// Execute a statement, returning the affected-row count. The full
    /// result stays buffered for [`Adapter::results`].
    pub fn execute(&mut self, sql: &str, params: &[Param]) -> Result<u64> {
        self.guard("Adapter#execute")?;
        if sql.is_empty() {
            return Err(Error::general(
                "Adapter#execute",
                "called without a SQL command",
            ));
        }
        self.tracer.log(sql, params);
        self.conn
            .execute(sql, params)
            .map_err(|e| Error::from_driver("Adapter#execute", e))
    }

    /// Execute and eagerly materialize the result set.
    pub fn query(&mut self, sql: &str, params: &[Param]) -> Result<ResultSet> {
        self.execute(sql, params)?;
        self.results()
            .ok_or_else(|| Error::general("Adapter#execute", "statement produced no result"))
    }

    /// Materialize the result of the previously executed statement.
    pub fn results(&mut self) -> Option<ResultSet> {
        self.conn
            .take_results()
            .map(|raw| ResultSet::new(raw, self.tzoffset))
    }

    /// Compile a statement. The returned handle borrows this adapter
    /// mutably — the statement is the connection's sole user while alive.
    pub fn prepare(&mut self, sql: &str) -> Result<PreparedStatement<'_>> {
        self.guard("Adapter#prepare")?;
        let id = self
            .conn
            .prepare(sql)
            .map_err(|e| Error::from_driver("Adapter#prepare", e))?;
        Ok(PreparedStatement {
            adapter: self,
            id,
            sql: sql.to_string(),
            finished: false,
        })
    }

    /// Begin a transaction, or a named savepoint inside one.
    pub fn begin(&mut self, savepoint: Option<&str>) -> Result<()> {
        self.guard("Adapter#begin")?;
        self.conn
            .begin(savepoint)
            .map_err(|e| Error::from_driver("Adapter#begin", e))?;
        self.transactions
            .push(savepoint.unwrap_or_default().to_string());
        Ok(())
    }

    /// Commit the transaction, or release the named savepoint.
    pub fn commit(&mut self, savepoint: Option<&str>) -> Result<()> {
        self.guard("Adapter#commit")?;
        self.conn
            .commit(savepoint)
            .map_err(|e| Error::from_driver("Adapter#commit", e))?;
        self.unwind(savepoint);
        Ok(())
    }

    /// Roll back the transaction, or unwind to the named savepoint.
    pub fn rollback(&mut self, savepoint: Option<&str>) -> Result<()> {
        self.guard("Adapter#rollback")?;
        self.conn
            .rollback(savepoint)
            .map_err(|e| Error::from_driver("Adapter#rollback", e))?;
        self.unwind(savepoint);
        Ok(())
    }

    /// The open savepoint stack, outermost first.
    pub fn transactions(&self) -> &[String] {
        &self.transactions
    }

    /// Run `body` inside a savepoint. A unique name is generated when none
    /// is given, so transactions nest. Commits on success and rolls back
    /// on failure — unless a nested handler already unwound the stack, in
    /// which case both are no-ops and the original outcome passes through.
    pub fn transaction<T, F>(&mut self, savepoint: Option<&str>, body: F) -> Result<T>
    where
        F: FnOnce(&mut Adapter) -> Result<T>,
    {
        let name = match savepoint {
            Some(name) => name.to_string(),
            None => format!("sp_{}", Uuid::new_v4().simple()),
        };
        self.begin(Some(&name))?;
        match body(self) {
            Ok(value) => {
                if !self.transactions.is_empty() {
                    self.commit(Some(&name))?;
                }
                Ok(value)
            }
            Err(err) => {
                if !self.transactions.is_empty() {
                    let _ = self.rollback(Some(&name));
                }
                Err(err)
            }
        }
    }

    /// Bulk-load tab-delimited rows (`\t` fields, `\n` rows, `\N` null)
    /// from `source` into `table`. For an in-memory buffer, wrap it in
    /// `std::io::Cursor`. Returns the number of rows written.
    pub fn write(
        &mut self,
        table: &str,
        fields: &[&str],
        source: impl Read + Send + 'static,
    ) -> Result<u64> {
        self.guard("Adapter#write")?;
        // Some backends reject statement cleanup once a bulk load has
        // started, so buffered results are released up front.
        drop(self.conn.take_results());
        let fields: Vec<String> = fields.iter().map(|f| f.to_string()).collect();
        self.conn
            .write(table, &fields, Box::new(source))
            .map_err(|e| Error::from_driver("Adapter#write", e))
    }

    /// Driver-specific text escaping.
    pub fn escape(&self, text: &str) -> String {
        self.conn.escape(text)
    }

    /// Close the underlying session. Idempotent; later operations fail.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.conn
            .close()
            .map_err(|e| Error::from_driver("Adapter#close", e))
    }

    fn guard(&self, operation: &'static str) -> Result<()> {
        if self.closed {
            Err(Error::general(operation, "handle is closed"))
        } else {
            Ok(())
        }
    }

    fn unwind(&mut self, savepoint: Option<&str>) {
        match savepoint {
            None => self.transactions.clear(),
            Some(name) => {
                if let Some(at) = self.transactions.iter().rposition(|s| s == name) {
                    self.transactions.truncate(at);
                }
            }
        }
    }
}

impl std::fmt::Debug for Adapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Adapter")
            .field("driver", &self.config.driver)
            .field("db", &self.config.db)
            .field("transactions", &self.transactions.len())
            .finish()
    }
}

/// A compiled statement tied to one adapter. Not `Clone`; must be
/// finished (explicitly or on drop) to release driver-side resources.
pub struct PreparedStatement<'a> {
    adapter: &'a mut Adapter,
    id: u32,
    sql: String,
    finished: bool,
}

impl PreparedStatement<'_> {
    /// Execute with the given parameters, returning the affected count.
    pub fn execute(&mut self, params: &[Param]) -> Result<u64> {
        if self.finished {
            return Err(Error::general("Statement#execute", "statement is finished"));
        }
        self.adapter.tracer.log(&self.sql, params);
        self.adapter
            .conn
            .execute_prepared(self.id, params)
            .map_err(|e| Error::from_driver("Statement#execute", e))
    }

    /// Execute and materialize the result set.
    pub fn query(&mut self, params: &[Param]) -> Result<ResultSet> {
        self.execute(params)?;
        self.adapter
            .results()
            .ok_or_else(|| Error::general("Statement#execute", "statement produced no result"))
    }

    /// Release the driver-side plan. The first call releases, later calls
    /// are no-ops.
    pub fn finish(&mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        self.adapter
            .conn
            .finish_statement(self.id)
            .map_err(|e| Error::from_driver("Statement#finish", e))
    }
}

impl Drop for PreparedStatement<'_> {
    fn drop(&mut self) {
        let _ = self.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params;
    use crate::value::Value;

    fn adapter() -> Adapter {
        let mut db = Adapter::new(Config::new("sqlite", ":memory:")).unwrap();
        db.execute(
            "CREATE TABLE users (
                id      INTEGER PRIMARY KEY,
                name    TEXT,
                active  BOOLEAN,
                created DATETIME
            )",
            &[],
        )
        .unwrap();
        db
    }

    #[test]
    fn test_execute_and_typed_query() {
        let mut db = adapter();
        let affected = db
            .execute(
                "INSERT INTO users (name, active, created) VALUES (?, ?, ?)",
                &params!["apple", true, "2024-03-01 12:00:00"],
            )
            .unwrap();
        assert_eq!(affected, 1);

        let set = db.query("SELECT * FROM users", &[]).unwrap();
        assert_eq!(set.fields(), &["id", "name", "active", "created"]);
        let mut rows = Vec::new();
        set.each(|row| rows.push(row)).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("id"), Some(&Value::Integer(1)));
        assert_eq!(rows[0].get("name"), Some(&Value::Text("apple".to_string())));
        assert_eq!(rows[0].get("active"), Some(&Value::Boolean(true)));
        assert_eq!(
            rows[0]
                .get("created")
                .and_then(Value::as_timestamp)
                .unwrap()
                .timestamp(),
            1_709_294_400
        );
    }

    #[test]
    fn test_timezone_option_shifts_timestamps() {
        let mut db = Adapter::new(Config::new("sqlite", ":memory:").timezone("+01:00")).unwrap();
        db.execute("CREATE TABLE t (at DATETIME)", &[]).unwrap();
        db.execute("INSERT INTO t (at) VALUES (?)", &params!["2024-03-01 12:00:00"])
            .unwrap();

        let set = db.query("SELECT at FROM t", &[]).unwrap();
        let row = set.next_row().unwrap().unwrap();
        assert_eq!(
            row.get("at").and_then(Value::as_timestamp).unwrap().timestamp(),
            1_709_294_400 - 3600
        );
    }

    #[test]
    fn test_results_after_execute() {
        let mut db = adapter();
        db.execute("INSERT INTO users (name) VALUES (?)", &params!["benny"])
            .unwrap();
        let set = db.results().unwrap();
        assert_eq!(set.affected_rows(), 1);
        assert_eq!(set.insert_id(), Some(1));
        assert!(db.results().is_none());
    }

    #[test]
    fn test_empty_sql_is_an_argument_error() {
        let mut db = adapter();
        let err = db.execute("", &[]).unwrap_err();
        assert_eq!(err.to_string(), "Adapter#execute: called without a SQL command");
    }

    #[test]
    fn test_transaction_commits_on_success() {
        let mut db = adapter();
        db.transaction(None, |db| {
            db.execute("INSERT INTO users (name) VALUES (?)", &params!["apple"])
        })
        .unwrap();
        assert!(db.transactions().is_empty());

        let set = db.query("SELECT * FROM users", &[]).unwrap();
        assert_eq!(set.rows(), 1);
    }

    #[test]
    fn test_failed_transaction_unwinds_and_rolls_back() {
        let mut db = adapter();
        let err = db.transaction(None, |db| -> Result<()> {
            db.execute("INSERT INTO users (name) VALUES (?)", &params!["doomed"])?;
            Err(Error::general("test", "abort"))
        });
        assert!(err.is_err());
        assert!(db.transactions().is_empty());

        // Nothing persisted, and a fresh transaction still works.
        assert_eq!(db.query("SELECT * FROM users", &[]).unwrap().rows(), 0);
        db.transaction(None, |db| {
            db.execute("INSERT INTO users (name) VALUES (?)", &params!["kept"])
        })
        .unwrap();
        assert_eq!(db.query("SELECT * FROM users", &[]).unwrap().rows(), 1);
    }

    #[test]
    fn test_nested_transactions_partial_rollback() {
        let mut db = adapter();
        db.transaction(None, |db| {
            db.execute("INSERT INTO users (name) VALUES (?)", &params!["outer"])?;
            let _ = db.transaction(None, |db| -> Result<()> {
                db.execute("INSERT INTO users (name) VALUES (?)", &params!["inner"])?;
                Err(Error::general("test", "abort inner"))
            });
            Ok(())
        })
        .unwrap();

        let set = db.query("SELECT name FROM users", &[]).unwrap();
        let row = set.next_row().unwrap().unwrap();
        assert_eq!(set.rows(), 1);
        assert_eq!(row.get("name"), Some(&Value::Text("outer".to_string())));
    }

    #[test]
    fn test_manual_savepoint_stack() {
        let mut db = adapter();
        db.begin(None).unwrap();
        db.begin(Some("one")).unwrap();
        db.begin(Some("two")).unwrap();
        assert_eq!(db.transactions().len(), 3);

        db.rollback(Some("two")).unwrap();
        assert_eq!(db.transactions(), &["".to_string(), "one".to_string()][..]);

        db.commit(None).unwrap();
        assert!(db.transactions().is_empty());
    }

    #[test]
    fn test_bulk_write_from_buffer() {
        let mut db = adapter();
        db.execute("CREATE TABLE pairs (k TEXT, v TEXT)", &[]).unwrap();

        let rows = db
            .write(
                "pairs",
                &["k", "v"],
                std::io::Cursor::new(b"a\t1\nb\t2\n".to_vec()),
            )
            .unwrap();
        assert_eq!(rows, 2);
        assert_eq!(db.query("SELECT * FROM pairs", &[]).unwrap().rows(), 2);
    }

    #[test]
    fn test_prepared_statement_reuse_and_finish() {
        let mut db = adapter();
        {
            let mut stmt = db.prepare("INSERT INTO users (name) VALUES (?)").unwrap();
            stmt.execute(&params!["apple"]).unwrap();
            stmt.execute(&params!["benny"]).unwrap();
            stmt.finish().unwrap();
            assert!(stmt.execute(&params!["late"]).is_err());
            stmt.finish().unwrap(); // double-finish is a no-op
        }
        assert_eq!(db.query("SELECT * FROM users", &[]).unwrap().rows(), 2);
    }

    #[test]
    fn test_escape() {
        let db = adapter();
        assert_eq!(db.escape("it's"), "it''s");
    }

    #[test]
    fn test_query_error_surfaces_with_context() {
        let mut db = adapter();
        let err = db.execute("SELEC wat", &[]).unwrap_err();
        assert!(err.to_string().starts_with("Adapter#execute: "));
        assert!(!err.is_connection());
    }

    #[test]
    fn test_closed_handle_refuses_work() {
        let mut db = adapter();
        db.close().unwrap();
        db.close().unwrap(); // idempotent
        let err = db.execute("SELECT 1", &[]).unwrap_err();
        assert_eq!(err.to_string(), "Adapter#execute: handle is closed");
    }

    #[test]
    fn test_statement_trace_lines() {
        use parking_lot::Mutex;
        use std::sync::Arc;

        #[derive(Clone)]
        struct SharedSink(Arc<Mutex<Vec<u8>>>);
        impl Write for SharedSink {
            fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
                self.0.lock().extend_from_slice(buf);
                Ok(buf.len())
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        let buffer = Arc::new(Mutex::new(Vec::new()));
        let mut db = adapter();
        db.trace_to(Box::new(SharedSink(Arc::clone(&buffer))));
        db.execute("INSERT INTO users (name) VALUES (?)", &params!["apple"])
            .unwrap();

        let captured = String::from_utf8(buffer.lock().clone()).unwrap();
        assert_eq!(captured, "INSERT INTO users (name) VALUES ('apple')\n");
    }

    #[test]
    fn test_file_backed_database_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");
        let config = Config::new("sqlite", path.to_str().unwrap());

        let mut db = Adapter::new(config.clone()).unwrap();
        db.execute("CREATE TABLE t (n INTEGER)", &[]).unwrap();
        db.execute("INSERT INTO t (n) VALUES (7)", &[]).unwrap();
        db.close().unwrap();

        let mut db = Adapter::new(config).unwrap();
        let set = db.query("SELECT n FROM t", &[]).unwrap();
        let row = set.next_row().unwrap().unwrap();
        assert_eq!(row.get("n"), Some(&Value::Integer(7)));
    }
}
