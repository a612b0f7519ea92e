use thiserror::Error;

use crate::{SchemaVersion, SubnetId};

/// Errors surfaced by the lease and configuration stores and by the
/// allocation engine.
///
/// Logical conflicts (a colliding `add_lease`) are reported as a `false`
/// return, not as an error. Zero rows removed by a delete is a count of 0,
/// never an error.
#[derive(Debug, Error)]
pub enum Error {
    /// The operation does not support the `unassigned` server selector.
    #[error("not implemented: {0}")]
    NotImplemented(String),

    /// Input cannot be coerced or violates a value constraint.
    #[error("bad value: {0}")]
    BadValue(String),

    /// A stamped value was accessed as the wrong type.
    #[error("type mismatch: {0}")]
    TypeError(String),

    /// Accessor called on an absent value, or the object is in the wrong
    /// state for the call.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// An update targeted a lease that is not in the store.
    #[error("no such lease: {0}")]
    NoSuchLease(String),

    /// Allocation exhausted its retry budget and every candidate pool.
    /// Surfaced to the request handler as a DHCP-level NAK.
    #[error("no address available in subnet {0}")]
    NoAddressAvailable(SubnetId),

    /// Transient backend failure. The allocation engine retries these with
    /// bounded backoff before letting them surface.
    #[error("database operation failed: {0}")]
    DbOperation(String),

    /// The on-disk schema major version does not match this build.
    /// Fatal at backend open.
    #[error("incompatible schema: found {found}, expected major {expected_major}")]
    DbIncompatible {
        found: SchemaVersion,
        expected_major: u32,
    },

    /// Caller API misuse, e.g. an empty subscriber name or a zero batch size.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
}

impl Error {
    /// True for failures the caller may retry without changing the request.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::DbOperation(_))
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::DbOperation(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::BadValue(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
