//! Error types for prelinked kernel editing.
//!
//! Every failure carries enough context to be logged on its own, and folds into
//! one of a small set of [`ErrorKind`]s that callers can match on without caring
//! about the concrete variant.

use std::collections::TryReserveError;
use std::fmt;

use thiserror::Error;

/// Coarse classification of every [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed Mach-O or plist, or a violated structural assumption.
    InvalidImage,
    /// A required segment or section is absent.
    NotFound,
    /// A layout this crate does not know how to handle.
    Unsupported,
    /// The image buffer cannot hold a required append.
    BufferTooSmall,
    /// Arithmetic overflow while summing sizes.
    CapacityOverflow,
    /// Heap allocation failed for metadata or text buffers.
    OutOfMemory,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::InvalidImage => "invalid image",
            ErrorKind::NotFound => "not found",
            ErrorKind::Unsupported => "unsupported",
            ErrorKind::BufferTooSmall => "buffer too small",
            ErrorKind::CapacityOverflow => "capacity overflow",
            ErrorKind::OutOfMemory => "out of memory",
        };
        f.write_str(name)
    }
}

/// The main error type for prelinked image operations.
#[derive(Error, Debug)]
pub enum Error {
    // ==================== Mach-O Errors ====================
    #[error("invalid Mach-O magic: {0:#x}")]
    InvalidMachoMagic(u32),

    #[error("load command at offset {offset:#x} extends beyond header")]
    LoadCommandOverflow { offset: usize },

    #[error("Mach-O segment '{name}' not found")]
    SegmentNotFound { name: String },

    #[error("Mach-O section '{segment},{section}' not found")]
    SectionNotFound { segment: String, section: String },

    #[error("image has no occupied address range")]
    EmptyAddressSpace,

    #[error("{what} at {value:#x} is outside the supported 32-bit range")]
    OutOfRange { what: &'static str, value: u64 },

    #[error("region {offset:#x}+{size:#x} lies outside the image ({available:#x} bytes)")]
    RegionOutOfBounds {
        offset: u64,
        size: u64,
        available: usize,
    },

    // ==================== Plist Errors ====================
    #[error("plist parse error at offset {offset:#x}: {reason}")]
    Plist { offset: usize, reason: String },

    #[error("plist structure error: {0}")]
    PlistStructure(String),

    // ==================== Injection Errors ====================
    #[error("prelinked text ends at {text_end:#x}, expected it to end at {used_size:#x}")]
    TextNotAtTail { text_end: u64, used_size: u32 },

    #[error("unable to resolve kmod_info for '{bundle_path}'")]
    KmodInfoUnresolved { bundle_path: String },

    #[error("failed to link '{bundle_path}': {reason}")]
    Link { bundle_path: String, reason: String },

    #[error("undefined symbol '{symbol}' required by '{identifier}'")]
    UnresolvedSymbol { identifier: String, symbol: String },

    #[error("operation '{operation}' is not allowed in phase {phase}")]
    PhaseViolation {
        operation: &'static str,
        phase: &'static str,
    },

    #[error("context is inconsistent after a failed injection and must be discarded")]
    Poisoned,

    // ==================== Capacity Errors ====================
    #[error("buffer too small: need {needed} bytes, have {available}")]
    BufferTooSmall { needed: u64, available: u64 },

    #[error("size arithmetic overflowed")]
    CapacityOverflow,

    #[error("out of memory while allocating {what}")]
    OutOfMemory {
        what: &'static str,
        #[source]
        source: Option<TryReserveError>,
    },
}

/// A specialized Result type for prelinked image operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Returns the coarse kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidMachoMagic(_)
            | Error::LoadCommandOverflow { .. }
            | Error::EmptyAddressSpace
            | Error::RegionOutOfBounds { .. }
            | Error::Plist { .. }
            | Error::PlistStructure(_)
            | Error::KmodInfoUnresolved { .. }
            | Error::Link { .. }
            | Error::UnresolvedSymbol { .. }
            | Error::Poisoned => ErrorKind::InvalidImage,
            Error::SegmentNotFound { .. } | Error::SectionNotFound { .. } => ErrorKind::NotFound,
            Error::OutOfRange { .. } | Error::TextNotAtTail { .. } | Error::PhaseViolation { .. } => {
                ErrorKind::Unsupported
            }
            Error::BufferTooSmall { .. } => ErrorKind::BufferTooSmall,
            Error::CapacityOverflow => ErrorKind::CapacityOverflow,
            Error::OutOfMemory { .. } => ErrorKind::OutOfMemory,
        }
    }

    /// Creates a plist parse error with a formatted message.
    #[inline]
    pub fn plist(offset: usize, reason: impl Into<String>) -> Self {
        Error::Plist {
            offset,
            reason: reason.into(),
        }
    }

    /// Creates a buffer too small error.
    #[inline]
    pub fn buffer_too_small(needed: u64, available: u64) -> Self {
        Error::BufferTooSmall { needed, available }
    }

    /// Creates an allocation failure error.
    #[inline]
    pub fn out_of_memory(what: &'static str, source: TryReserveError) -> Self {
        Error::OutOfMemory {
            what,
            source: Some(source),
        }
    }
}
