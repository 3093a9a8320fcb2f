//! SQLite backend.
//!
//! Each connection owns a dedicated worker thread driving a
//! `rusqlite::Connection`; jobs arrive over a channel and every completed
//! job is signalled by writing one byte to a socketpair. The read end of
//! that pair is the readiness descriptor handed to external event loops,
//! which makes the synchronous library below fit the non-blocking
//! send/poll contract. Statement plans are reused through rusqlite's
//! per-connection prepared-statement cache.

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::mpsc;
use std::thread::JoinHandle;

use bytes::Bytes;
use rusqlite::types::{ToSqlOutput, ValueRef};
use rusqlite::ToSql;
use smallvec::SmallVec;

use super::{Connection, DriverError, DriverResult, RawResult, RawRow};
use crate::options::Config;
use crate::param::Param;
use crate::value::TypeTag;

/// Open a SQLite session for `config.db` (`:memory:` or a file path).
pub(crate) fn connect(config: &Config) -> DriverResult<Box<dyn Connection>> {
    let db = config.db.clone();
    let conn = if db == ":memory:" {
        rusqlite::Connection::open_in_memory()
    } else {
        rusqlite::Connection::open(&db)
    }
    .map_err(|e| DriverError::Connection(e.to_string()))?;

    // Performance pragmas for file-based databases
    if db != ":memory:" {
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;
             PRAGMA busy_timeout=5000;",
        )
        .map_err(|e| DriverError::Connection(e.to_string()))?;
    }

    let (ready, signal) = UnixStream::pair().map_err(|e| DriverError::Connection(e.to_string()))?;
    ready
        .set_nonblocking(true)
        .map_err(|e| DriverError::Connection(e.to_string()))?;

    let (jobs_tx, jobs_rx) = mpsc::channel();
    let (replies_tx, replies_rx) = mpsc::channel();
    let worker = std::thread::Builder::new()
        .name("dbkit-sqlite".to_string())
        .spawn(move || worker_loop(conn, jobs_rx, replies_tx, signal))
        .map_err(|e| DriverError::Connection(e.to_string()))?;

    tracing::debug!(db = %db, "sqlite connection opened");

    Ok(Box::new(SqliteConnection {
        jobs: Some(jobs_tx),
        replies: replies_rx,
        ready,
        worker: Some(worker),
        statements: HashMap::new(),
        next_statement: 0,
        last: None,
        pending: false,
    }))
}

enum Job {
    Query { sql: String, params: Vec<Param> },
    Prepare { sql: String },
    Load {
        table: String,
        fields: Vec<String>,
        source: Box<dyn Read + Send>,
    },
}

pub struct SqliteConnection {
    jobs: Option<mpsc::Sender<Job>>,
    replies: mpsc::Receiver<DriverResult<RawResult>>,
    /// Read end of the signal pair, non-blocking. One byte per completed job.
    ready: UnixStream,
    worker: Option<JoinHandle<()>>,
    statements: HashMap<u32, String>,
    next_statement: u32,
    last: Option<RawResult>,
    pending: bool,
}

impl SqliteConnection {
    fn submit(&mut self, job: Job) -> DriverResult<()> {
        self.jobs
            .as_ref()
            .ok_or_else(|| DriverError::Connection("connection is closed".to_string()))?
            .send(job)
            .map_err(|_| DriverError::Connection("connection worker is gone".to_string()))
    }

    /// Blocking round trip: submit one job and wait for its reply, keeping
    /// the reply channel and the signal pair in lockstep.
    fn call(&mut self, job: Job) -> DriverResult<RawResult> {
        if self.pending {
            return Err(DriverError::Query(
                "a request is already in flight on this connection".to_string(),
            ));
        }
        self.submit(job)?;
        let reply = self
            .replies
            .recv()
            .map_err(|_| DriverError::Connection("connection worker is gone".to_string()))?;
        self.consume_signal();
        reply
    }

    /// Drain the one signal byte paired with a reply already received.
    /// The worker sends the reply before the byte, so a short spin can be
    /// needed; EOF means the worker is gone and there is nothing to drain.
    fn consume_signal(&self) {
        let mut buf = [0_u8; 1];
        loop {
            match (&self.ready).read(&mut buf) {
                Ok(_) => break,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => std::thread::yield_now(),
                Err(_) => break,
            }
        }
    }
}

impl Connection for SqliteConnection {
    fn execute(&mut self, sql: &str, params: &[Param]) -> DriverResult<u64> {
        let raw = self.call(Job::Query {
            sql: sql.to_string(),
            params: params.to_vec(),
        })?;
        let affected = raw.affected;
        self.last = Some(raw);
        Ok(affected)
    }

    fn take_results(&mut self) -> Option<RawResult> {
        self.last.take()
    }

    fn send_query(&mut self, sql: &str, params: &[Param]) -> DriverResult<()> {
        if self.pending {
            return Err(DriverError::Query(
                "a request is already in flight on this connection".to_string(),
            ));
        }
        self.submit(Job::Query {
            sql: sql.to_string(),
            params: params.to_vec(),
        })?;
        self.pending = true;
        Ok(())
    }

    fn try_results(&mut self) -> DriverResult<Option<RawResult>> {
        if !self.pending {
            return Ok(None);
        }
        let mut buf = [0_u8; 1];
        match (&self.ready).read(&mut buf) {
            Ok(0) => {
                self.pending = false;
                Err(DriverError::Connection(
                    "connection worker is gone".to_string(),
                ))
            }
            Ok(_) => {
                self.pending = false;
                match self.replies.try_recv() {
                    Ok(reply) => reply.map(Some),
                    Err(_) => Err(DriverError::Connection(
                        "connection worker is gone".to_string(),
                    )),
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => {
                self.pending = false;
                Err(DriverError::Connection(e.to_string()))
            }
        }
    }

    fn socket(&self) -> RawFd {
        self.ready.as_raw_fd()
    }

    fn prepare(&mut self, sql: &str) -> DriverResult<u32> {
        // Compile eagerly so a bad statement fails at prepare time; the
        // plan itself lives in rusqlite's per-connection cache.
        self.call(Job::Prepare {
            sql: sql.to_string(),
        })?;
        let id = self.next_statement;
        self.next_statement += 1;
        self.statements.insert(id, sql.to_string());
        Ok(id)
    }

    fn execute_prepared(&mut self, id: u32, params: &[Param]) -> DriverResult<u64> {
        let sql = self
            .statements
            .get(&id)
            .cloned()
            .ok_or_else(|| DriverError::Query(format!("prepared statement {id} is finished")))?;
        self.execute(&sql, params)
    }

    fn finish_statement(&mut self, id: u32) -> DriverResult<()> {
        self.statements.remove(&id);
        Ok(())
    }

    fn begin(&mut self, savepoint: Option<&str>) -> DriverResult<()> {
        let sql = match savepoint {
            None => "BEGIN".to_string(),
            Some(name) => format!("SAVEPOINT {}", quote_ident(name)),
        };
        self.execute(&sql, &[]).map(|_| ())
    }

    fn commit(&mut self, savepoint: Option<&str>) -> DriverResult<()> {
        let sql = match savepoint {
            None => "COMMIT".to_string(),
            Some(name) => format!("RELEASE SAVEPOINT {}", quote_ident(name)),
        };
        self.execute(&sql, &[]).map(|_| ())
    }

    fn rollback(&mut self, savepoint: Option<&str>) -> DriverResult<()> {
        match savepoint {
            None => self.execute("ROLLBACK", &[]).map(|_| ()),
            Some(name) => {
                // ROLLBACK TO leaves the savepoint defined; release it so
                // the engine state matches the handle's unwound stack.
                let name = quote_ident(name);
                self.execute(&format!("ROLLBACK TO SAVEPOINT {name}"), &[])?;
                self.execute(&format!("RELEASE SAVEPOINT {name}"), &[])
                    .map(|_| ())
            }
        }
    }

    fn write(
        &mut self,
        table: &str,
        fields: &[String],
        source: Box<dyn Read + Send>,
    ) -> DriverResult<u64> {
        let raw = self.call(Job::Load {
            table: table.to_string(),
            fields: fields.to_vec(),
            source,
        })?;
        Ok(raw.affected)
    }

    fn escape(&self, text: &str) -> String {
        text.replace('\'', "''")
    }

    fn close(&mut self) -> DriverResult<()> {
        self.jobs.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        Ok(())
    }
}

impl Drop for SqliteConnection {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

// Text and blob parameters bind borrowed to avoid cloning
impl ToSql for Param {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        match self {
            Param::Null => Ok(ToSqlOutput::Owned(rusqlite::types::Value::Null)),
            Param::Text(s) => Ok(ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes()))),
            Param::Binary(b) => Ok(ToSqlOutput::Borrowed(ValueRef::Blob(b.as_ref()))),
        }
    }
}

// ============================================================================
// Worker
// ============================================================================

fn worker_loop(
    conn: rusqlite::Connection,
    jobs: mpsc::Receiver<Job>,
    replies: mpsc::Sender<DriverResult<RawResult>>,
    mut signal: UnixStream,
) {
    for job in jobs {
        let reply = match job {
            Job::Query { sql, params } => run_query(&conn, &sql, &params),
            Job::Prepare { sql } => conn
                .prepare_cached(&sql)
                .map(|_| RawResult::empty())
                .map_err(query_err),
            Job::Load {
                table,
                fields,
                source,
            } => run_load(&conn, &table, &fields, source),
        };
        if replies.send(reply).is_err() {
            break;
        }
        let _ = signal.write_all(&[1]);
    }
}

fn run_query(conn: &rusqlite::Connection, sql: &str, params: &[Param]) -> DriverResult<RawResult> {
    let mut stmt = conn.prepare_cached(sql).map_err(query_err)?;
    let (fields, types): (Vec<String>, Vec<TypeTag>) = stmt
        .columns()
        .iter()
        .map(|c| (c.name().to_string(), tag_for_decl(c.decl_type())))
        .unzip();
    let bind: Vec<&dyn ToSql> = params.iter().map(|p| p as &dyn ToSql).collect();

    if fields.is_empty() {
        let affected = stmt.execute(bind.as_slice()).map_err(query_err)? as u64;
        return Ok(RawResult {
            fields,
            types,
            rows: Vec::new(),
            affected,
            insert_id: Some(conn.last_insert_rowid()),
        });
    }

    let mut data = Vec::new();
    let mut rows = stmt.query(bind.as_slice()).map_err(query_err)?;
    while let Some(row) = rows.next().map_err(query_err)? {
        let mut cells: RawRow = SmallVec::with_capacity(fields.len());
        for col in 0..fields.len() {
            cells.push(render_cell(row.get_ref(col).map_err(query_err)?));
        }
        data.push(cells);
    }

    let affected = data.len() as u64;
    Ok(RawResult {
        fields,
        types,
        rows: data,
        affected,
        insert_id: Some(conn.last_insert_rowid()),
    })
}

/// COPY-style bulk load: tab-delimited fields, newline-terminated rows,
/// `\N` for null. Runs inside a savepoint so it nests under an open
/// transaction and a mid-stream failure undoes the partial load.
fn run_load(
    conn: &rusqlite::Connection,
    table: &str,
    fields: &[String],
    source: Box<dyn Read + Send>,
) -> DriverResult<RawResult> {
    if fields.is_empty() {
        return Err(DriverError::Query(
            "write requires at least one field".to_string(),
        ));
    }
    let columns: Vec<String> = fields.iter().map(|f| quote_ident(f)).collect();
    let markers = vec!["?"; fields.len()].join(", ");
    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        quote_ident(table),
        columns.join(", "),
        markers
    );

    conn.execute_batch("SAVEPOINT dbkit_bulk_load")
        .map_err(query_err)?;

    let loaded = (|| {
        let mut stmt = conn.prepare_cached(&sql).map_err(query_err)?;
        let mut count = 0_u64;
        for line in BufReader::new(source).lines() {
            let line =
                line.map_err(|e| DriverError::Query(format!("bulk source read failed: {e}")))?;
            if line.is_empty() {
                continue;
            }
            let cells: Vec<Option<&str>> = line
                .split('\t')
                .map(|cell| if cell == "\\N" { None } else { Some(cell) })
                .collect();
            if cells.len() != fields.len() {
                return Err(DriverError::Query(format!(
                    "bulk row has {} fields, expected {}",
                    cells.len(),
                    fields.len()
                )));
            }
            let bind: Vec<&dyn ToSql> = cells.iter().map(|c| c as &dyn ToSql).collect();
            stmt.execute(bind.as_slice()).map_err(query_err)?;
            count += 1;
        }
        Ok(count)
    })();

    match loaded {
        Ok(count) => {
            conn.execute_batch("RELEASE dbkit_bulk_load")
                .map_err(query_err)?;
            Ok(RawResult {
                affected: count,
                insert_id: Some(conn.last_insert_rowid()),
                ..RawResult::empty()
            })
        }
        Err(e) => {
            let _ = conn
                .execute_batch("ROLLBACK TO dbkit_bulk_load; RELEASE dbkit_bulk_load");
            Err(e)
        }
    }
}

fn render_cell(value: ValueRef<'_>) -> Option<Bytes> {
    match value {
        ValueRef::Null => None,
        ValueRef::Integer(i) => Some(Bytes::from(i.to_string())),
        ValueRef::Real(f) => Some(Bytes::from(format!("{f}"))),
        ValueRef::Text(t) => Some(Bytes::copy_from_slice(t)),
        ValueRef::Blob(b) => Some(Bytes::copy_from_slice(b)),
    }
}

/// Map a declared column type to the decode tag, following SQLite's
/// affinity keywords.
fn tag_for_decl(decl: Option<&str>) -> TypeTag {
    let decl = decl.unwrap_or("").to_ascii_uppercase();
    if decl.contains("BOOL") {
        TypeTag::Boolean
    } else if decl.contains("DATE") || decl.contains("TIME") {
        TypeTag::Timestamp
    } else if decl.contains("DECIMAL") || decl.contains("NUMERIC") {
        TypeTag::Numeric
    } else if decl.contains("INT") {
        TypeTag::Integer
    } else if decl.contains("REAL") || decl.contains("FLOA") || decl.contains("DOUB") {
        TypeTag::Float
    } else if decl.contains("BLOB") {
        TypeTag::Blob
    } else {
        TypeTag::Text
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn query_err(e: rusqlite::Error) -> DriverError {
    DriverError::Query(e.to_string())
}
