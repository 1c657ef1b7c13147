//! Error taxonomy shared by every loader component.

use std::fmt;

/// Stable, matchable error kind returned by every fallible loader operation.
///
/// These map one-to-one onto the abstract error tokens a host application
/// branches on: a caller that only cares about the kind (not the message)
/// can match on this type without depending on `std::error::Error`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorKind {
	/// A pointer/slice was null, empty, or otherwise malformed input.
	InvalidArgument,
	/// An operation was requested out of the order the state machine allows.
	InvalidState,
	/// A size did not fit where it was required to (e.g. ELF larger than partition).
	InvalidSize,
	/// A named resource (partition, symbol's defining segment, loadable segment) is absent.
	NotFound,
	/// The input uses a feature this loader does not implement (wrong class, endianness, type).
	NotSupported,
	/// An allocation, or an MMU window, could not be obtained.
	NoMemory,
	/// The underlying read callback returned fewer bytes than requested.
	Io,
	/// Reserved for host integrations: HMAC verification failure at the upload boundary.
	Auth,
	/// Reserved for host integrations: SHA-256 verification failure at the upload boundary.
	Integrity,
}

impl fmt::Display for ErrorKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let s = match self {
			Self::InvalidArgument => "invalid argument",
			Self::InvalidState => "invalid state",
			Self::InvalidSize => "invalid size",
			Self::NotFound => "not found",
			Self::NotSupported => "not supported",
			Self::NoMemory => "no memory",
			Self::Io => "i/o error",
			Self::Auth => "authentication failure",
			Self::Integrity => "integrity failure",
		};
		f.write_str(s)
	}
}

/// Error type returned by every public operation in this crate.
#[derive(Debug, thiserror::Error)]
pub enum LoaderError {
	/// Invalid argument, with a short message naming the violated contract.
	#[error("invalid argument: {0}")]
	InvalidArgument(&'static str),
	/// An operation was attempted out of the loader's state-machine order.
	#[error("invalid state: {0}")]
	InvalidState(&'static str),
	/// A size constraint was violated.
	#[error("invalid size: {0}")]
	InvalidSize(&'static str),
	/// A required resource was not found.
	#[error("not found: {0}")]
	NotFound(&'static str),
	/// An unsupported ELF feature or target configuration was requested.
	#[error("not supported: {0}")]
	NotSupported(&'static str),
	/// Allocation failed.
	#[error("no memory: {0}")]
	NoMemory(&'static str),
	/// The read callback returned short or failed.
	#[error("i/o error: {0}")]
	Io(&'static str),
	/// Reserved for host HMAC verification failures; never constructed by this crate.
	#[error("authentication failure")]
	Auth,
	/// Reserved for host SHA-256 verification failures; never constructed by this crate.
	#[error("integrity failure")]
	Integrity,
}

impl LoaderError {
	/// Returns the abstract kind of this error, for callers that branch on kind alone.
	pub fn kind(&self) -> ErrorKind {
		match self {
			Self::InvalidArgument(_) => ErrorKind::InvalidArgument,
			Self::InvalidState(_) => ErrorKind::InvalidState,
			Self::InvalidSize(_) => ErrorKind::InvalidSize,
			Self::NotFound(_) => ErrorKind::NotFound,
			Self::NotSupported(_) => ErrorKind::NotSupported,
			Self::NoMemory(_) => ErrorKind::NoMemory,
			Self::Io(_) => ErrorKind::Io,
			Self::Auth => ErrorKind::Auth,
			Self::Integrity => ErrorKind::Integrity,
		}
	}
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, LoaderError>;
