//! bqread shared data model
//!
//! Message shapes exchanged with the remote job and read services, the table
//! schema model, and the canonical row/value representation every decode
//! path converges on.

pub mod canonical;
mod job;
mod read;
pub mod schema;
pub mod value;

pub use canonical::{canonicalize, CanonicalError, Scalar};
pub use job::*;
pub use read::*;
pub use schema::{FieldMode, FieldSchema, FieldType, RangeElementType, SchemaView, TableSchema};
pub use value::{Row, ShapeError, Value};

/// Serde helpers for int64 fields, which the REST surface encodes as strings.
pub(crate) mod int_repr {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer};
    use std::fmt::Display;
    use std::str::FromStr;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr<T> {
        Number(T),
        Text(String),
    }

    pub fn option<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
    where
        D: Deserializer<'de>,
        T: FromStr + Deserialize<'de>,
        T::Err: Display,
    {
        match Option::<Repr<T>>::deserialize(deserializer)? {
            None => Ok(None),
            Some(Repr::Number(n)) => Ok(Some(n)),
            Some(Repr::Text(s)) => s.parse().map(Some).map_err(D::Error::custom),
        }
    }
}
