//! Pull (decode) cursor
//!
//! A [`PullCursor`] walks a fixed byte buffer in two passes: scalar fields
//! first, then deferred buffer content for pointers and arrays recorded
//! during the scalar pass. Every primitive read is bounds-checked against
//! the declared buffer size; truncated or hostile input fails with a typed
//! error, never an out-of-bounds read.

use tracing::debug;

use crate::token::{TokenKey, TokenKeyAllocator, TokenList};
use crate::{align_size, SubcontextHeader, WireError, WireFlags, WireResult};

/// Decode cursor over a borrowed byte buffer
#[derive(Debug)]
pub struct PullCursor<'a> {
    data: &'a [u8],
    offset: u32,
    data_size: u32,
    flags: WireFlags,
    relative_base_offset: u32,
    relative_highest_offset: u32,
    keys: TokenKeyAllocator,
    relative_list: TokenList,
    relative_base_list: TokenList,
    array_size_list: TokenList,
    array_length_list: TokenList,
    switch_list: TokenList,
}

impl<'a> PullCursor<'a> {
    /// Create a cursor over `data` with default flags (little-endian)
    pub fn new(data: &'a [u8]) -> WireResult<Self> {
        let data_size = u32::try_from(data.len())
            .map_err(|_| WireError::Length(format!("buffer of {} bytes", data.len())))?;
        Ok(Self {
            data,
            offset: 0,
            data_size,
            flags: WireFlags::default(),
            relative_base_offset: 0,
            relative_highest_offset: 0,
            keys: TokenKeyAllocator::new(),
            relative_list: TokenList::new(),
            relative_base_list: TokenList::new(),
            array_size_list: TokenList::new(),
            array_length_list: TokenList::new(),
            switch_list: TokenList::new(),
        })
    }

    /// Create a cursor with explicit flags
    pub fn with_flags(data: &'a [u8], flags: WireFlags) -> WireResult<Self> {
        let mut cursor = Self::new(data)?;
        cursor.flags = flags;
        Ok(cursor)
    }

    /// Current read offset
    pub const fn offset(&self) -> u32 {
        self.offset
    }

    /// Declared total buffer size
    pub const fn data_size(&self) -> u32 {
        self.data_size
    }

    /// Bytes left between the offset and the declared size
    pub const fn remaining(&self) -> u32 {
        self.data_size - self.offset
    }

    /// Cursor flags
    pub const fn flags(&self) -> WireFlags {
        self.flags
    }

    /// Merge flags into the cursor
    pub fn set_flags(&mut self, flags: u32) {
        self.flags.set(flags);
    }

    /// Allocate a token key for a deferred field
    pub fn alloc_key(&mut self) -> TokenKey {
        self.keys.alloc()
    }

    /// Highest offset reached via relative-pointer seeks
    pub const fn relative_highest_offset(&self) -> u32 {
        self.relative_highest_offset
    }

    fn need_bytes(&self, n: u32) -> WireResult<()> {
        if n > self.data_size.wrapping_sub(self.offset) || self.offset > self.data_size {
            return Err(WireError::BufferSize {
                offset: self.offset,
                needed: n,
                size: self.data_size,
            });
        }
        Ok(())
    }

    /// Advance by `n` bytes without reading them
    pub fn advance(&mut self, n: u32) -> WireResult<()> {
        self.need_bytes(n)?;
        self.offset += n;
        Ok(())
    }

    /// Move the read offset to `ofs`
    pub fn set_offset(&mut self, ofs: u32) -> WireResult<()> {
        self.offset = ofs;
        if self.offset > self.data_size {
            return Err(WireError::BufferSize {
                offset: ofs,
                needed: 0,
                size: self.data_size,
            });
        }
        Ok(())
    }

    /// Record the current offset as the deepest point reached, for
    /// unread-byte accounting after relative-pointer seeks
    pub fn mark_highest(&mut self) {
        if self.offset > self.relative_highest_offset {
            self.relative_highest_offset = self.offset;
        }
    }

    /// Skip padding so the offset lands on an `n` byte boundary
    pub fn align_to(&mut self, n: u32) -> WireResult<()> {
        if self.flags.has(WireFlags::NOALIGN) {
            return Ok(());
        }
        let pad = align_size(self.offset, n);
        self.advance(pad)
    }

    fn take(&mut self, n: u32) -> WireResult<&'a [u8]> {
        self.need_bytes(n)?;
        let start = self.offset as usize;
        self.offset += n;
        Ok(&self.data[start..start + n as usize])
    }

    /// Read one byte
    pub fn get_u8(&mut self) -> WireResult<u8> {
        Ok(self.take(1)?[0])
    }

    /// Read a 16-bit scalar
    pub fn get_u16(&mut self) -> WireResult<u16> {
        let b: [u8; 2] = self.take(2)?.try_into().unwrap_or([0; 2]);
        Ok(if self.flags.has(WireFlags::BIG_ENDIAN) {
            u16::from_be_bytes(b)
        } else {
            u16::from_le_bytes(b)
        })
    }

    /// Read a 32-bit scalar
    pub fn get_u32(&mut self) -> WireResult<u32> {
        let b: [u8; 4] = self.take(4)?.try_into().unwrap_or([0; 4]);
        Ok(if self.flags.has(WireFlags::BIG_ENDIAN) {
            u32::from_be_bytes(b)
        } else {
            u32::from_le_bytes(b)
        })
    }

    /// Read a 64-bit scalar
    pub fn get_u64(&mut self) -> WireResult<u64> {
        let b: [u8; 8] = self.take(8)?.try_into().unwrap_or([0; 8]);
        Ok(if self.flags.has(WireFlags::BIG_ENDIAN) {
            u64::from_be_bytes(b)
        } else {
            u64::from_le_bytes(b)
        })
    }

    /// Read a size/offset scalar: 32 bits normally, 64 bits in
    /// 64-bit-safe mode (where the value must still fit in 32 bits)
    pub fn get_u3264(&mut self) -> WireResult<u32> {
        if !self.flags.has(WireFlags::SIXTY_FOUR) {
            return self.get_u32();
        }
        let wide = self.get_u64()?;
        u32::try_from(wide)
            .map_err(|_| WireError::Length(format!("64-bit size {wide} exceeds 32 bits")))
    }

    /// Read `n` raw bytes
    pub fn get_bytes(&mut self, n: u32) -> WireResult<&'a [u8]> {
        self.take(n)
    }

    /// Read `n` bytes as UTF-8
    pub fn get_utf8(&mut self, n: u32) -> WireResult<String> {
        let raw = self.take(n)?;
        String::from_utf8(raw.to_vec()).map_err(|_| WireError::InvalidString)
    }

    /// Pull an array size scalar and remember it under `key`
    pub fn pull_array_size(&mut self, key: TokenKey) -> WireResult<()> {
        let size = self.get_u3264()?;
        self.array_size_list.store(key, size)
    }

    /// Look at the stored array size for `key`
    pub fn get_array_size(&self, key: TokenKey) -> WireResult<u32> {
        self.array_size_list.peek(key)
    }

    /// Take the stored array size for `key` off the registry
    pub fn steal_array_size(&mut self, key: TokenKey) -> WireResult<u32> {
        self.array_size_list.retrieve(key)
    }

    /// Take the stored array size for `key` and require it to equal `size`
    pub fn check_steal_array_size(&mut self, key: TokenKey, size: u32) -> WireResult<()> {
        let stored = self.steal_array_size(key)?;
        if stored != size {
            return Err(WireError::ArraySize {
                got: stored,
                expected: size,
            });
        }
        Ok(())
    }

    /// Pull a varying-array header (zero offset plus length) and remember
    /// the length under `key`
    pub fn pull_array_length(&mut self, key: TokenKey) -> WireResult<()> {
        let header_offset = self.get_u3264()?;
        if header_offset != 0 {
            return Err(WireError::ArrayLength {
                got: header_offset,
                expected: 0,
            });
        }
        let length = self.get_u3264()?;
        self.array_length_list.store(key, length)
    }

    /// Take the stored array length for `key` and require it to equal `length`
    pub fn check_steal_array_length(&mut self, key: TokenKey, length: u32) -> WireResult<()> {
        let stored = self.array_length_list.retrieve(key)?;
        if stored != length {
            return Err(WireError::ArrayLength {
                got: stored,
                expected: length,
            });
        }
        Ok(())
    }

    /// Remember a union discriminant under `key`
    pub fn set_switch_value(&mut self, key: TokenKey, value: u32) -> WireResult<()> {
        self.switch_list.store(key, value)
    }

    /// Take the stored union discriminant for `key` off the registry
    pub fn steal_switch_value(&mut self, key: TokenKey) -> WireResult<u32> {
        self.switch_list.retrieve(key)
    }

    /// Enter a nested, length-delimited region.
    ///
    /// `size_is` is an externally-expected content size; if the header style
    /// also carries an explicit length prefix, the two must agree exactly.
    /// The returned child cursor restricts reads to the declared length.
    pub fn subcontext_start(
        &mut self,
        header: SubcontextHeader,
        size_is: Option<u32>,
    ) -> WireResult<PullCursor<'a>> {
        let mut force_flags: Option<u32> = None;

        let content_size = match header {
            SubcontextHeader::None => size_is.unwrap_or_else(|| self.remaining()),

            SubcontextHeader::U16 => {
                let content = u32::from(self.get_u16()?);
                check_declared_size(size_is, content)?;
                content
            }

            SubcontextHeader::U32 => {
                let content = self.get_u3264()?;
                check_declared_size(size_is, content)?;
                content
            }

            SubcontextHeader::CommonTypeHeader => {
                let version = self.get_u8()?;
                if version != 1 {
                    return Err(WireError::Subcontext(format!(
                        "common type header version {version} != 1"
                    )));
                }
                let drep = self.get_u8()?;
                match drep {
                    0x10 => force_flags = Some(0),
                    0x00 => force_flags = Some(WireFlags::BIG_ENDIAN),
                    _ => {
                        return Err(WireError::Subcontext(format!(
                            "common type header invalid endianness 0x{drep:02X}"
                        )))
                    }
                }
                let hdrlen = self.get_u16()?;
                if hdrlen != 8 {
                    return Err(WireError::Subcontext(format!(
                        "common type header length {hdrlen} != 8"
                    )));
                }
                let _filler = self.get_u32()?;
                let content = self.get_u32()?;
                check_declared_size(size_is, content)?;
                if content % 8 != 0 {
                    return Err(WireError::Subcontext(format!(
                        "common type header content size {content} not padded to 8"
                    )));
                }
                let _reserved = self.get_u32()?;
                content
            }

            SubcontextHeader::ZeroCopyAlias => {
                // Shallow alias over the parent buffer at the current offset
                let mut child = PullCursor::new(self.data)?;
                child.flags = self.flags;
                child.offset = self.offset;
                return Ok(child);
            }
        };

        self.need_bytes(content_size)?;
        let start = self.offset as usize;
        let slice = &self.data[start..start + content_size as usize];

        let mut child = PullCursor::new(slice)?;
        child.flags = self.flags;
        child.flags.clear(WireFlags::SIXTY_FOUR);
        if let Some(endian) = force_flags {
            child.flags.clear(WireFlags::BIG_ENDIAN);
            child.flags.set(endian);
        }
        Ok(child)
    }

    /// Leave a nested region, advancing this cursor past it.
    ///
    /// If the child carries [`WireFlags::SUBCONTEXT_MUST_CONSUME`], unread
    /// trailing bytes in the region are a fatal error.
    pub fn subcontext_end(
        &mut self,
        child: &PullCursor<'_>,
        header: SubcontextHeader,
        size_is: Option<u32>,
    ) -> WireResult<()> {
        let advance = if header == SubcontextHeader::ZeroCopyAlias {
            child.offset.checked_sub(self.offset).ok_or_else(|| {
                WireError::Subcontext(format!(
                    "alias subcontext moved backward: {} < {}",
                    child.offset, self.offset
                ))
            })?
        } else if let Some(size) = size_is {
            size
        } else if header != SubcontextHeader::None {
            child.data_size
        } else {
            child.offset
        };

        if child.flags.has(WireFlags::SUBCONTEXT_MUST_CONSUME) {
            let highest = child.offset.max(child.relative_highest_offset);
            if highest < advance {
                debug!(consumed = highest, declared = advance, "unread subcontext bytes");
                return Err(WireError::UnreadBytes {
                    consumed: highest,
                    declared: advance,
                });
            }
        }

        self.advance(advance)
    }

    /// Current base for relative pointer resolution
    pub const fn relative_base_offset(&self) -> u32 {
        self.relative_base_offset
    }

    /// Restore a previously saved relative base
    pub fn restore_relative_base_offset(&mut self, offset: u32) {
        self.relative_base_offset = offset;
    }

    /// Install a new relative base during the scalar pass, remembering it
    /// under `key` for the buffer pass
    pub fn setup_relative_base_offset1(&mut self, key: TokenKey, offset: u32) -> WireResult<()> {
        self.relative_base_offset = offset;
        self.relative_base_list.store(key, offset)
    }

    /// Re-install the base stored under `key` during the buffer pass
    pub fn setup_relative_base_offset2(&mut self, key: TokenKey) -> WireResult<()> {
        self.relative_base_offset = self.relative_base_list.retrieve(key)?;
        Ok(())
    }

    /// Stage 1 of a relative pointer: resolve `rel_offset` against the
    /// current base, validate it, and remember the absolute offset
    pub fn relative_ptr1(&mut self, key: TokenKey, rel_offset: u32) -> WireResult<()> {
        let abs = rel_offset
            .checked_add(self.relative_base_offset)
            .ok_or_else(|| {
                WireError::InvalidPointer(format!(
                    "offset {rel_offset} + base {} overflows",
                    self.relative_base_offset
                ))
            })?;
        if abs > self.data_size {
            return Err(WireError::BufferSize {
                offset: abs,
                needed: 0,
                size: self.data_size,
            });
        }
        self.relative_list.store(key, abs)
    }

    /// Stage 2 of a relative pointer: seek to the offset remembered under
    /// `key`. Callers save the offset first and restore it (after calling
    /// [`Self::mark_highest`]) once the pointee is decoded.
    pub fn relative_ptr2(&mut self, key: TokenKey) -> WireResult<()> {
        let abs = self.relative_list.retrieve(key)?;
        self.set_offset(abs)
    }
}

fn check_declared_size(size_is: Option<u32>, content: u32) -> WireResult<()> {
    if let Some(expected) = size_is {
        if expected != content {
            return Err(WireError::Subcontext(format!(
                "declared size {expected} mismatches content size {content}"
            )));
        }
    }
    Ok(())
}
