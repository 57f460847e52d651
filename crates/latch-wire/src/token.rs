//! Token registry: transient key→value bookkeeping for one cursor lifetime
//!
//! Remembers array sizes, union discriminants and relative-pointer offsets
//! between the scalar and buffer passes of a single encode/decode call tree.
//! Keys are arena-style integer handles allocated by the owning cursor, so a
//! key is meaningless outside the cursor that issued it.

use crate::{WireError, WireResult, TOKEN_MAX_LIST_SIZE};

/// Opaque handle identifying one deferred field within a cursor's lifetime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TokenKey(u32);

impl TokenKey {
    /// Get the raw handle value
    pub const fn value(&self) -> u32 {
        self.0
    }
}

/// Allocator handing out fresh [`TokenKey`]s for one cursor
#[derive(Debug, Default)]
pub struct TokenKeyAllocator {
    next: u32,
}

impl TokenKeyAllocator {
    /// Create an allocator starting at handle zero
    pub const fn new() -> Self {
        Self { next: 0 }
    }

    /// Allocate the next key
    pub fn alloc(&mut self) -> TokenKey {
        let key = TokenKey(self.next);
        self.next = self.next.wrapping_add(1);
        key
    }
}

/// Bounded list of (key, value) tokens
///
/// Lookup scans newest-first so a re-stored key shadows an older entry;
/// retrieval swap-removes, keeping the list short on well-formed input. The
/// hard cap of [`TOKEN_MAX_LIST_SIZE`] entries bounds memory consumed by
/// adversarial input.
#[derive(Debug, Default)]
pub struct TokenList {
    entries: Vec<(TokenKey, u32)>,
}

impl TokenList {
    /// Create an empty list
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the list has no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Store a token for later retrieval
    pub fn store(&mut self, key: TokenKey, value: u32) -> WireResult<()> {
        if self.entries.len() >= TOKEN_MAX_LIST_SIZE {
            return Err(WireError::Range);
        }
        self.entries.push((key, value));
        Ok(())
    }

    /// Retrieve and remove the most recent token stored under `key`
    pub fn retrieve(&mut self, key: TokenKey) -> WireResult<u32> {
        let pos = self.find(key).ok_or(WireError::Token)?;
        let (_, value) = self.entries.swap_remove(pos);
        Ok(value)
    }

    /// Look at the most recent token stored under `key` without removing it
    pub fn peek(&self, key: TokenKey) -> WireResult<u32> {
        let pos = self.find(key).ok_or(WireError::Token)?;
        Ok(self.entries[pos].1)
    }

    fn find(&self, key: TokenKey) -> Option<usize> {
        self.entries.iter().rposition(|(k, _)| *k == key)
    }
}
