//! Client-side database access layer.
//!
//! Two ways in:
//!
//! - [`Adapter`] — a synchronous handle owning one connection: execute,
//!   prepared statements, transactions/savepoints, bulk loading.
//! - [`ConnectionPool`] — a fixed set of connections with non-blocking
//!   dispatch: submit a query, get a [`PendingRequest`], drive it from any
//!   event loop via its readiness descriptor and `process()`.
//!
//! The wire protocol lives behind the [`driver`] seam; backends register
//! by name and are selected through [`Config`]. Results are fully
//! buffered and decoded per column type tag into [`Value`]s.
//!
//! ```
//! use dbkit::{params, Adapter, Config};
//!
//! # fn main() -> dbkit::Result<()> {
//! let mut db = Adapter::new(Config::new("sqlite", ":memory:"))?;
//! db.execute("CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT)", &[])?;
//! db.execute("INSERT INTO users (name) VALUES (?)", &params!["apple"])?;
//!
//! let rows = db.query("SELECT * FROM users", &[])?;
//! rows.each(|row| println!("{:?}", row.get("name")))?;
//! # Ok(())
//! # }
//! ```

pub mod adapter;
pub mod driver;
pub mod error;
pub mod options;
pub mod param;
pub mod pool;
pub mod result;
pub mod trace;
pub mod value;

pub use adapter::{Adapter, PreparedStatement};
pub use error::{Error, Result};
pub use options::Config;
pub use param::{IntoParam, Param};
pub use pool::{ConnectionPool, PendingRequest, RequestState};
pub use result::{FromRow, ResultSet, Row, Rows};
pub use trace::Tracer;
pub use value::{decode, TypeTag, Value};
