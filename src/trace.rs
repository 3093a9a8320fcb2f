//! Statement tracing.
//!
//! An injectable tracer held by the handle or pool: when enabled, every
//! executed statement is written to the sink as one line, with bind
//! parameters interpolated for display. Defaults to stderr.

use std::io::Write;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::param::Param;

#[derive(Clone, Default)]
pub struct Tracer {
    enabled: bool,
    sink: Option<Arc<Mutex<Box<dyn Write + Send>>>>,
}

impl Tracer {
    /// Disabled tracer (the default).
    pub fn off() -> Self {
        Self::default()
    }

    /// Enabled tracer writing to stderr.
    pub fn stderr() -> Self {
        Self {
            enabled: true,
            sink: None,
        }
    }

    /// Enabled tracer writing to the given sink.
    pub fn to(sink: Box<dyn Write + Send>) -> Self {
        Self {
            enabled: true,
            sink: Some(Arc::new(Mutex::new(sink))),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub(crate) fn log(&self, sql: &str, params: &[Param]) {
        if !self.enabled {
            return;
        }
        let line = format_params(sql, params);
        match &self.sink {
            Some(sink) => {
                let mut sink = sink.lock();
                let _ = writeln!(sink, "{line}");
            }
            None => eprintln!("{line}"),
        }
    }
}

impl std::fmt::Debug for Tracer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tracer")
            .field("enabled", &self.enabled)
            .finish()
    }
}

/// Interpolate bind parameters into the statement text for display.
/// Positional markers are replaced in order; extra markers stay as-is.
pub fn format_params(sql: &str, params: &[Param]) -> String {
    if params.is_empty() {
        return sql.to_string();
    }
    let mut out = String::with_capacity(sql.len() + 16 * params.len());
    let mut bind = params.iter();
    for ch in sql.chars() {
        if ch == '?' {
            match bind.next() {
                Some(param) => out.push_str(&display_param(param)),
                None => out.push(ch),
            }
        } else {
            out.push(ch);
        }
    }
    out
}

fn display_param(param: &Param) -> String {
    match param {
        Param::Null => "NULL".to_string(),
        Param::Text(text) => format!("'{}'", text.replace('\'', "''")),
        Param::Binary(data) => format!("<blob {} bytes>", data.len()),
    }
}
