//! Bind parameter encoding.
//!
//! Heterogeneous caller values are normalized into [`Param`] before an
//! execute call: nulls stay null, readable byte streams are fully drained
//! into binary blobs, everything else becomes its canonical UTF-8 text
//! form. The encoding is deterministic and never truncates.

use std::io::Read;

use bytes::Bytes;

use crate::error::{Error, Result};

/// A single bind parameter, immutable once constructed.
#[derive(Debug, Clone, PartialEq)]
pub enum Param {
    Null,
    Binary(Bytes),
    Text(String),
}

impl Param {
    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, Param::Null)
    }

    /// Drain a readable byte stream completely into a binary parameter.
    ///
    /// No partial reads: the stream is consumed to EOF before the parameter
    /// is constructed. Read failures are the argument-error category.
    pub fn from_reader(mut source: impl Read) -> Result<Param> {
        let mut data = Vec::new();
        source
            .read_to_end(&mut data)
            .map_err(|e| Error::general("Param#from_reader", e.to_string()))?;
        Ok(Param::Binary(Bytes::from(data)))
    }

    /// Build a text parameter from raw bytes, rejecting invalid UTF-8.
    ///
    /// Multi-byte sequences are never silently truncated or transcoded
    /// lossily; a caller holding non-UTF-8 text must convert it first.
    pub fn text_from_bytes(raw: &[u8]) -> Result<Param> {
        match std::str::from_utf8(raw) {
            Ok(s) => Ok(Param::Text(s.to_string())),
            Err(e) => Err(Error::general(
                "Param#text_from_bytes",
                format!("invalid UTF-8 in text parameter: {e}"),
            )),
        }
    }
}

/// Conversion from caller-supplied values into bind parameters.
pub trait IntoParam {
    fn into_param(self) -> Param;
}

impl IntoParam for Param {
    fn into_param(self) -> Param {
        self
    }
}

impl<T: IntoParam> IntoParam for Option<T> {
    fn into_param(self) -> Param {
        match self {
            Some(v) => v.into_param(),
            None => Param::Null,
        }
    }
}

impl IntoParam for String {
    fn into_param(self) -> Param {
        Param::Text(self)
    }
}

impl IntoParam for &str {
    fn into_param(self) -> Param {
        Param::Text(self.to_string())
    }
}

impl IntoParam for Vec<u8> {
    fn into_param(self) -> Param {
        Param::Binary(Bytes::from(self))
    }
}

impl IntoParam for &[u8] {
    fn into_param(self) -> Param {
        Param::Binary(Bytes::copy_from_slice(self))
    }
}

impl IntoParam for Bytes {
    fn into_param(self) -> Param {
        Param::Binary(self)
    }
}

// Booleans stringify to "1"/"0" so the boolean decode rule round-trips.
impl IntoParam for bool {
    fn into_param(self) -> Param {
        Param::Text(if self { "1" } else { "0" }.to_string())
    }
}

macro_rules! stringify_param {
    ($($ty:ty),*) => {
        $(impl IntoParam for $ty {
            fn into_param(self) -> Param {
                Param::Text(self.to_string())
            }
        })*
    };
}

stringify_param!(i8, i16, i32, i64, u8, u16, u32, u64, f32, f64);

/// Encode an ordered sequence of values into bind parameters.
///
/// ```
/// use dbkit::params;
/// let bound = params![1_i64, "apple", None::<&str>];
/// assert_eq!(bound.len(), 3);
/// ```
#[macro_export]
macro_rules! params {
    () => { Vec::<$crate::Param>::new() };
    ($($value:expr),+ $(,)?) => {
        vec![$($crate::param::IntoParam::into_param($value)),+]
    };
}
