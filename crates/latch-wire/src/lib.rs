//! latch-wire: binary wire codec primitives
//!
//! Low-level pull (decode) and push (encode) cursors for a length-prefixed,
//! pointer-relative binary format:
//!
//! - Two-pass discipline: fixed-size scalars first, deferred variable-size
//!   buffer content second
//! - Explicit alignment with configurable alignment flags
//! - Nested, length-delimited subcontexts with several header styles
//! - Relative pointers resolved against a stacked, restorable base offset
//! - A bounded token registry carrying array sizes, switch discriminants and
//!   pointer offsets across nested encode/decode calls
//!
//! Cursors are transient: one cursor per encode/decode call tree, never
//! shared and never persisted. All decode paths are safe against truncated
//! or adversarial buffers; reads past the declared bound fail with
//! [`WireError::BufferSize`], never undefined behavior.

#![warn(missing_docs)]

pub mod pull;
pub mod push;
pub mod token;

pub use pull::PullCursor;
pub use push::PushCursor;
pub use token::{TokenKey, TokenKeyAllocator, TokenList};

use thiserror::Error;

/// Maximum number of live entries in one token list.
///
/// Bounds worst-case memory consumption from adversarial input; exceeding it
/// is fatal to the current encode/decode.
pub const TOKEN_MAX_LIST_SIZE: usize = 65_535;

/// Base chunk size for push buffer growth, in bytes.
pub const BASE_CHUNK_SIZE: u32 = 1024;

/// Wire codec result type
pub type WireResult<T> = Result<T, WireError>;

/// Wire codec error types
#[derive(Debug, Error)]
pub enum WireError {
    /// A read or write would pass the declared buffer bound
    #[error("buffer too small: need {needed} bytes at offset {offset}, size {size}")]
    BufferSize {
        /// Cursor offset at the failing access
        offset: u32,
        /// Bytes the access required
        needed: u32,
        /// Declared total buffer size
        size: u32,
    },

    /// A subcontext flagged must-consume-all-bytes left trailing bytes unread
    #[error("not all bytes consumed: read {consumed} of {declared}")]
    UnreadBytes {
        /// Highest offset the child cursor reached
        consumed: u32,
        /// Bytes the subcontext declared
        declared: u32,
    },

    /// A stored array size did not match the decoded element count
    #[error("bad array size: got {got}, expected {expected}")]
    ArraySize {
        /// Size recorded in the token registry
        got: u32,
        /// Size the caller expected
        expected: u32,
    },

    /// A stored array length did not match the decoded element count
    #[error("bad array length: got {got}, expected {expected}")]
    ArrayLength {
        /// Length recorded in the token registry
        got: u32,
        /// Length the caller expected
        expected: u32,
    },

    /// A union switch value was missing or did not match any arm
    #[error("bad switch value: {0}")]
    BadSwitch(u32),

    /// A relative pointer resolved outside the buffer or overflowed
    #[error("invalid pointer: {0}")]
    InvalidPointer(String),

    /// Relative-pointer bookkeeping failed (bad base, reversed layout)
    #[error("relative pointer error: {0}")]
    Relative(String),

    /// A subcontext header was malformed or disagreed with an expected size
    #[error("subcontext error: {0}")]
    Subcontext(String),

    /// The token registry hit its hard entry cap
    #[error("token registry exhausted ({TOKEN_MAX_LIST_SIZE} live entries)")]
    Range,

    /// No token was stored under the requested key
    #[error("token not found")]
    Token,

    /// Byte content was not valid UTF-8 where a string was expected
    #[error("invalid string data")]
    InvalidString,

    /// A size or length scalar exceeded its representable range
    #[error("length error: {0}")]
    Length(String),
}

/// Cursor behavior flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WireFlags(u32);

impl WireFlags {
    /// Big-endian scalar encoding (default is little-endian)
    pub const BIG_ENDIAN: u32 = 0x0000_0001;
    /// 64-bit-safe mode: size/offset scalars are 8 bytes on the wire
    pub const SIXTY_FOUR: u32 = 0x0000_0002;
    /// Suppress all alignment padding
    pub const NOALIGN: u32 = 0x0000_0010;
    /// Align deferred buffer content to 2 bytes
    pub const ALIGN2: u32 = 0x0000_0020;
    /// Align deferred buffer content to 4 bytes
    pub const ALIGN4: u32 = 0x0000_0040;
    /// Align deferred buffer content to 8 bytes
    pub const ALIGN8: u32 = 0x0000_0080;
    /// Lay relative-pointer content backward from a fixed end offset
    pub const RELATIVE_REVERSE: u32 = 0x0000_0100;
    /// Treat unread trailing bytes in a subcontext as a fatal error
    pub const SUBCONTEXT_MUST_CONSUME: u32 = 0x0000_0200;

    const ALIGN_MASK: u32 = Self::NOALIGN | Self::ALIGN2 | Self::ALIGN4 | Self::ALIGN8;

    /// Create flags from a raw value
    pub const fn new(flags: u32) -> Self {
        Self(flags)
    }

    /// Get the raw value
    pub const fn bits(&self) -> u32 {
        self.0
    }

    /// Check if a flag is set
    pub const fn has(&self, flag: u32) -> bool {
        self.0 & flag != 0
    }

    /// Merge in new flags; a new alignment flag replaces any old one
    pub fn set(&mut self, new_flags: u32) {
        if new_flags & Self::ALIGN_MASK != 0 {
            self.0 &= !Self::ALIGN_MASK;
        }
        self.0 |= new_flags;
    }

    /// Clear flags
    pub fn clear(&mut self, flags: u32) {
        self.0 &= !flags;
    }

    /// Alignment for deferred buffer content, from the align flags
    pub const fn buffer_align(&self) -> u32 {
        if self.has(Self::NOALIGN) {
            1
        } else if self.has(Self::ALIGN2) {
            2
        } else if self.has(Self::ALIGN4) {
            4
        } else if self.has(Self::ALIGN8) {
            8
        } else {
            1
        }
    }
}

/// Subcontext header style: how a nested region's length prefix is framed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SubcontextHeader {
    /// No length prefix; size comes from the caller or the remaining bytes
    None = 0,
    /// 16-bit length prefix
    U16 = 2,
    /// 32-bit length prefix (64-bit in 64-bit-safe mode)
    U32 = 4,
    /// 8-byte common type header: version, endianness, fixed header length,
    /// filler, content length, reserved
    CommonTypeHeader = 0xFFFF_FC01,
    /// Zero-copy alias sharing the parent buffer at the current offset
    ZeroCopyAlias = 0xFFFF_FFFF,
}

impl SubcontextHeader {
    /// Get the wire constant for this header style
    pub const fn raw(&self) -> u32 {
        *self as u32
    }
}

/// Number of padding bytes needed to align `offset` on an `n` byte boundary.
///
/// `n` must be a power of two.
pub const fn align_size(offset: u32, n: u32) -> u32 {
    if offset & (n - 1) == 0 {
        return 0;
    }
    n - (offset & (n - 1))
}
