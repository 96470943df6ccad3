//! Error taxonomy for every fallible operation on a volume.

use core::fmt;

/// Crate-wide result type.
pub type Result<T> = core::result::Result<T, Error>;

/// What went wrong.
///
/// Errors are always propagated to the caller; nothing in the crate retries
/// internally. An `Io` failure inside an open transaction additionally
/// forces the transaction into the aborted state, after which every
/// mutating call returns `TxnAborted` until `abort` is issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The volume has not been mounted.
    NotMounted,
    /// The operation requires an unmounted volume.
    AlreadyMounted,
    /// No valid superblock, or geometry that this build cannot handle.
    BadFormat,
    /// No file with that name.
    NotFound,
    /// A file with that name already exists.
    Exists,
    /// File name longer than `param::NAMELEN` bytes.
    NameTooLong,
    /// File name contains a NUL byte or a path separator.
    InvalidName,
    /// Conflicting or missing open flags.
    InvalidFlags,
    /// The handle id does not refer to an open handle, or refers to one
    /// opened in an incompatible mode.
    BadHandle,
    /// Conflicting open or transaction state.
    Busy,
    /// The allocator cannot place the write, even after priority eviction.
    NoSpace,
    /// A static capacity (directory, handles, records per transaction) was
    /// exceeded.
    Exhausted,
    /// The block-device adapter reported a failure.
    Io,
    /// An integrity check failed.
    Corruption,
    /// The current transaction was aborted; only `abort` may follow.
    TxnAborted,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Error::NotMounted => "volume not mounted",
            Error::AlreadyMounted => "volume already mounted",
            Error::BadFormat => "invalid volume format",
            Error::NotFound => "no such file",
            Error::Exists => "file exists",
            Error::NameTooLong => "file name too long",
            Error::InvalidName => "invalid file name",
            Error::InvalidFlags => "invalid open flags",
            Error::BadHandle => "invalid handle",
            Error::Busy => "conflicting open or transaction",
            Error::NoSpace => "out of space",
            Error::Exhausted => "static capacity exceeded",
            Error::Io => "block device error",
            Error::Corruption => "integrity check failed",
            Error::TxnAborted => "transaction aborted",
        };
        f.write_str(msg)
    }
}
