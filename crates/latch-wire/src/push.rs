//! Push (encode) cursor
//!
//! A [`PushCursor`] builds a wire buffer in two passes mirroring the pull
//! side: scalar fields first with placeholder pointers, then deferred buffer
//! content with the placeholders back-patched to relative offsets. The
//! buffer grows in fixed chunks unless the cursor was created over a fixed
//! size, in which case overruns are a hard error.

use bytes::Bytes;
use tracing::trace;

use crate::token::{TokenKey, TokenKeyAllocator, TokenList};
use crate::{align_size, SubcontextHeader, WireError, WireFlags, WireResult, BASE_CHUNK_SIZE};

/// Encode cursor over a growable byte buffer
#[derive(Debug)]
pub struct PushCursor {
    data: Vec<u8>,
    offset: u32,
    alloc_size: u32,
    fixed: bool,
    flags: WireFlags,
    relative_base_offset: u32,
    relative_end_offset: Option<u32>,
    keys: TokenKeyAllocator,
    relative_list: TokenList,
    relative_base_list: TokenList,
    relative_begin_list: TokenList,
    switch_list: TokenList,
}

impl Default for PushCursor {
    fn default() -> Self {
        Self::new()
    }
}

impl PushCursor {
    /// Create a growable cursor with default flags (little-endian)
    pub fn new() -> Self {
        Self {
            data: Vec::new(),
            offset: 0,
            alloc_size: BASE_CHUNK_SIZE,
            fixed: false,
            flags: WireFlags::default(),
            relative_base_offset: 0,
            relative_end_offset: None,
            keys: TokenKeyAllocator::new(),
            relative_list: TokenList::new(),
            relative_base_list: TokenList::new(),
            relative_begin_list: TokenList::new(),
            switch_list: TokenList::new(),
        }
    }

    /// Create a cursor that refuses to grow past `size` bytes
    pub fn new_fixed(size: u32) -> Self {
        let mut cursor = Self::new();
        cursor.alloc_size = size;
        cursor.fixed = true;
        cursor
    }

    /// Create a growable cursor with explicit flags
    pub fn with_flags(flags: WireFlags) -> Self {
        let mut cursor = Self::new();
        cursor.flags = flags;
        cursor
    }

    /// Current write offset
    pub const fn offset(&self) -> u32 {
        self.offset
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

    /// Bytes written so far
    pub fn blob(&self) -> &[u8] {
        &self.data[..self.offset as usize]
    }

    /// Consume the cursor, yielding the finished buffer
    pub fn into_bytes(mut self) -> Bytes {
        self.data.truncate(self.offset as usize);
        Bytes::from(self.data)
    }

    /// Ensure capacity for `extra` bytes past the current offset
    fn expand(&mut self, extra: u32) -> WireResult<()> {
        let size = self.offset.checked_add(extra).ok_or(WireError::BufferSize {
            offset: self.offset,
            needed: extra,
            size: u32::MAX,
        })?;
        if size <= self.alloc_size && size as usize <= self.data.len() {
            return Ok(());
        }
        if self.fixed && size > self.alloc_size {
            return Err(WireError::BufferSize {
                offset: self.offset,
                needed: extra,
                size: self.alloc_size,
            });
        }
        while self.alloc_size < size {
            self.alloc_size += BASE_CHUNK_SIZE;
        }
        if (self.data.len() as u32) < size {
            self.data.resize(size as usize, 0);
        }
        Ok(())
    }

    /// Append raw bytes
    pub fn put_bytes(&mut self, bytes: &[u8]) -> WireResult<()> {
        let n = u32::try_from(bytes.len())
            .map_err(|_| WireError::Length(format!("write of {} bytes", bytes.len())))?;
        self.expand(n)?;
        let start = self.offset as usize;
        self.data[start..start + bytes.len()].copy_from_slice(bytes);
        self.offset += n;
        Ok(())
    }

    /// Append `n` zero bytes
    pub fn put_zeroes(&mut self, n: u32) -> WireResult<()> {
        self.expand(n)?;
        let start = self.offset as usize;
        self.data[start..start + n as usize].fill(0);
        self.offset += n;
        Ok(())
    }

    /// Pad with zeroes so the offset lands on an `n` byte boundary
    pub fn align_to(&mut self, n: u32) -> WireResult<()> {
        if self.flags.has(WireFlags::NOALIGN) {
            return Ok(());
        }
        let pad = align_size(self.offset, n);
        self.put_zeroes(pad)
    }

    /// Write one byte
    pub fn put_u8(&mut self, v: u8) -> WireResult<()> {
        self.put_bytes(&[v])
    }

    /// Write a 16-bit scalar
    pub fn put_u16(&mut self, v: u16) -> WireResult<()> {
        if self.flags.has(WireFlags::BIG_ENDIAN) {
            self.put_bytes(&v.to_be_bytes())
        } else {
            self.put_bytes(&v.to_le_bytes())
        }
    }

    /// Write a 32-bit scalar
    pub fn put_u32(&mut self, v: u32) -> WireResult<()> {
        if self.flags.has(WireFlags::BIG_ENDIAN) {
            self.put_bytes(&v.to_be_bytes())
        } else {
            self.put_bytes(&v.to_le_bytes())
        }
    }

    /// Write a 64-bit scalar
    pub fn put_u64(&mut self, v: u64) -> WireResult<()> {
        if self.flags.has(WireFlags::BIG_ENDIAN) {
            self.put_bytes(&v.to_be_bytes())
        } else {
            self.put_bytes(&v.to_le_bytes())
        }
    }

    /// Write a size/offset scalar: 32 bits normally, 64 bits in
    /// 64-bit-safe mode
    pub fn put_u3264(&mut self, v: u32) -> WireResult<()> {
        if self.flags.has(WireFlags::SIXTY_FOUR) {
            self.put_u64(u64::from(v))
        } else {
            self.put_u32(v)
        }
    }

    /// Write string bytes as UTF-8 with no terminator or length prefix
    pub fn put_utf8(&mut self, s: &str) -> WireResult<()> {
        self.put_bytes(s.as_bytes())
    }

    /// Overwrite an already-written 32-bit scalar at `ofs`
    fn patch_u32(&mut self, ofs: u32, v: u32) -> WireResult<()> {
        let end = ofs.checked_add(4).ok_or(WireError::BufferSize {
            offset: ofs,
            needed: 4,
            size: self.offset,
        })?;
        if end > self.offset {
            return Err(WireError::BufferSize {
                offset: ofs,
                needed: 4,
                size: self.offset,
            });
        }
        let bytes = if self.flags.has(WireFlags::BIG_ENDIAN) {
            v.to_be_bytes()
        } else {
            v.to_le_bytes()
        };
        self.data[ofs as usize..end as usize].copy_from_slice(&bytes);
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

    /// Begin a nested, length-delimited region.
    ///
    /// Content is encoded into the returned child cursor; the header (if
    /// any) is written by [`Self::subcontext_end`]. With `size_is` set the
    /// region is pre-sized and zero-filled, and content may not exceed it.
    pub fn subcontext_start(&mut self, size_is: Option<u32>) -> WireResult<PushCursor> {
        let mut child = PushCursor::new();
        child.flags = self.flags;
        child.flags.clear(WireFlags::SIXTY_FOUR);
        if let Some(size) = size_is {
            if size > 0 {
                child.put_zeroes(size)?;
                child.offset = 0;
                child.relative_end_offset = Some(size);
            }
        }
        Ok(child)
    }

    /// Finish a nested region: write its header, then its content
    pub fn subcontext_end(
        &mut self,
        mut child: PushCursor,
        header: SubcontextHeader,
        size_is: Option<u32>,
    ) -> WireResult<()> {
        if let Some(size) = size_is {
            if child.offset > size {
                return Err(WireError::Subcontext(format!(
                    "subcontext content {} exceeds declared size {size}",
                    child.offset
                )));
            }
            child.offset = size;
        }

        match header {
            SubcontextHeader::None => {}

            SubcontextHeader::U16 => {
                let content = u16::try_from(child.offset).map_err(|_| {
                    WireError::BufferSize {
                        offset: self.offset,
                        needed: child.offset,
                        size: u32::from(u16::MAX),
                    }
                })?;
                self.put_u16(content)?;
            }

            SubcontextHeader::U32 => {
                self.put_u3264(child.offset)?;
            }

            SubcontextHeader::CommonTypeHeader => {
                // Content is padded to 8 bytes; the header itself is
                // version, endianness, length 8, filler, content size,
                // reserved.
                let pad = align_size(child.offset, 8);
                child.put_zeroes(pad)?;
                self.put_u8(1)?;
                self.put_u8(if self.flags.has(WireFlags::BIG_ENDIAN) {
                    0x00
                } else {
                    0x10
                })?;
                self.put_u16(8)?;
                self.put_u32(0xCCCC_CCCC)?;
                self.put_u32(child.offset)?;
                self.put_u32(0)?;
            }

            SubcontextHeader::ZeroCopyAlias => {
                return Err(WireError::Subcontext(
                    "alias subcontexts cannot be encoded".to_string(),
                ));
            }
        }

        self.put_bytes(child.blob())
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

    /// Mark the end of the reverse-layout region at the current offset
    pub fn relative_end_at_offset(&mut self) {
        self.relative_end_offset = Some(self.offset);
    }

    /// Stage 1 of a relative pointer: write a placeholder (or zero for a
    /// null pointer) and remember the placeholder's position under `key`
    pub fn relative_ptr1(&mut self, key: Option<TokenKey>) -> WireResult<()> {
        let Some(key) = key else {
            return self.put_u32(0);
        };
        self.align_to(4)?;
        self.relative_list.store(key, self.offset)?;
        self.put_u32(0xFFFF_FFFF)
    }

    /// Back-patch the placeholder stored under `key` with the current
    /// offset relative to the base
    fn patch_relative(&mut self, key: TokenKey) -> WireResult<()> {
        let ptr_offset = self.relative_list.retrieve(key)?;
        let rel = self
            .offset
            .checked_sub(self.relative_base_offset)
            .ok_or_else(|| {
                WireError::Relative(format!(
                    "content offset {} precedes base {}",
                    self.offset, self.relative_base_offset
                ))
            })?;
        trace!(ptr_offset, rel, "patching relative pointer");
        self.patch_u32(ptr_offset, rel)
    }

    /// Stage 2 of a relative pointer, opening the pointee.
    ///
    /// In forward layout this pads to the configured buffer alignment and
    /// patches the pointer immediately. In reverse layout the patch is
    /// deferred to [`Self::relative_ptr2_end`], which knows the content
    /// length.
    pub fn relative_ptr2_start(&mut self, key: TokenKey) -> WireResult<()> {
        if !self.flags.has(WireFlags::RELATIVE_REVERSE) {
            self.align_to(self.flags.buffer_align())?;
            return self.patch_relative(key);
        }
        if self.relative_end_offset.is_none() {
            return Err(WireError::Relative(
                "reverse layout used without an end offset".to_string(),
            ));
        }
        self.relative_begin_list.store(key, self.offset)
    }

    /// Stage 2 of a relative pointer, closing the pointee.
    ///
    /// In reverse layout the content written since
    /// [`Self::relative_ptr2_start`] is copied to its final position just
    /// below the current end offset (aligned down), the vacated bytes are
    /// zeroed, and the pointer is patched to the final position.
    pub fn relative_ptr2_end(&mut self, key: TokenKey) -> WireResult<()> {
        if !self.flags.has(WireFlags::RELATIVE_REVERSE) {
            return Ok(());
        }

        let end = self.relative_end_offset.ok_or_else(|| {
            WireError::Relative("reverse layout used without an end offset".to_string())
        })?;
        if end < self.offset {
            return Err(WireError::Relative(format!(
                "end offset {end} overtaken by write offset {}",
                self.offset
            )));
        }

        let begin = self.relative_begin_list.retrieve(key)?;
        let len = self.offset.checked_sub(begin).ok_or_else(|| {
            WireError::Relative(format!(
                "write offset {} precedes region start {begin}",
                self.offset
            ))
        })?;
        if len == 0 {
            return Ok(());
        }
        if end < len {
            return Err(WireError::Relative(format!(
                "content of {len} bytes does not fit below end offset {end}"
            )));
        }

        // Final position: end minus length, aligned down to the buffer
        // alignment so the content start keeps its natural alignment.
        let align = self.flags.buffer_align();
        let mut correct = end - len;
        let pad = align_size(correct, align);
        if pad > 0 {
            correct = correct + pad - align;
        }
        if correct < begin {
            return Err(WireError::Relative(format!(
                "aligned position {correct} overlaps region start {begin}"
            )));
        }

        let content = self.data[begin as usize..self.offset as usize].to_vec();
        self.data[begin as usize..self.offset as usize].fill(0);
        let dest = correct as usize;
        if dest + content.len() > self.data.len() {
            return Err(WireError::BufferSize {
                offset: correct,
                needed: len,
                size: self.data.len() as u32,
            });
        }
        self.data[dest..dest + content.len()].copy_from_slice(&content);

        self.relative_end_offset = Some(correct);
        self.offset = correct;
        self.patch_relative(key)?;
        self.offset = begin;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalars_little_endian() {
        let mut cur = PushCursor::new();
        cur.put_u8(0x01).unwrap();
        cur.put_u16(0x0302).unwrap();
        cur.put_u32(0x0807_0605).unwrap();
        assert_eq!(cur.blob(), &[0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08]);
    }

    #[test]
    fn test_scalars_big_endian() {
        let mut cur = PushCursor::with_flags(WireFlags::new(WireFlags::BIG_ENDIAN));
        cur.put_u32(0x0102_0304).unwrap();
        assert_eq!(cur.blob(), &[0x01, 0x02, 0x03, 0x04]);
    }

    #[test]
    fn test_fixed_size_overrun() {
        let mut cur = PushCursor::new_fixed(4);
        cur.put_u32(1).unwrap();
        assert!(matches!(cur.put_u8(2), Err(WireError::BufferSize { .. })));
    }

    #[test]
    fn test_growth_past_chunk() {
        let mut cur = PushCursor::new();
        cur.put_zeroes(BASE_CHUNK_SIZE + 100).unwrap();
        assert_eq!(cur.offset(), BASE_CHUNK_SIZE + 100);
    }

    #[test]
    fn test_align() {
        let mut cur = PushCursor::new();
        cur.put_u8(0xFF).unwrap();
        cur.align_to(4).unwrap();
        assert_eq!(cur.blob(), &[0xFF, 0, 0, 0]);
    }

    #[test]
    fn test_u3264_modes() {
        let mut narrow = PushCursor::new();
        narrow.put_u3264(5).unwrap();
        assert_eq!(narrow.offset(), 4);

        let mut wide = PushCursor::with_flags(WireFlags::new(WireFlags::SIXTY_FOUR));
        wide.put_u3264(5).unwrap();
        assert_eq!(wide.offset(), 8);
        assert_eq!(wide.blob(), &5u64.to_le_bytes());
    }

    #[test]
    fn test_subcontext_u16() {
        let mut cur = PushCursor::new();
        let mut child = cur.subcontext_start(None).unwrap();
        child.put_utf8("hello").unwrap();
        cur.subcontext_end(child, SubcontextHeader::U16, None).unwrap();
        assert_eq!(cur.blob(), &[0x05, 0x00, b'h', b'e', b'l', b'l', b'o']);
    }

    #[test]
    fn test_subcontext_fixed_size() {
        let mut cur = PushCursor::new();
        let mut child = cur.subcontext_start(Some(8)).unwrap();
        child.put_u32(0xAABB_CCDD).unwrap();
        cur.subcontext_end(child, SubcontextHeader::None, Some(8))
            .unwrap();
        // Content zero-padded out to the declared size
        assert_eq!(cur.blob(), &[0xDD, 0xCC, 0xBB, 0xAA, 0, 0, 0, 0]);
    }

    #[test]
    fn test_subcontext_overrun_declared_size() {
        let mut cur = PushCursor::new();
        let mut child = cur.subcontext_start(Some(2)).unwrap();
        child.put_u32(1).unwrap();
        assert!(matches!(
            cur.subcontext_end(child, SubcontextHeader::None, Some(2)),
            Err(WireError::Subcontext(_))
        ));
    }

    #[test]
    fn test_common_type_header_layout() {
        let mut cur = PushCursor::new();
        let mut child = cur.subcontext_start(None).unwrap();
        child.put_u32(0xDEAD_BEEF).unwrap();
        cur.subcontext_end(child, SubcontextHeader::CommonTypeHeader, None)
            .unwrap();

        let blob = cur.blob();
        assert_eq!(blob.len(), 24);
        assert_eq!(blob[0], 1);
        assert_eq!(blob[1], 0x10);
        assert_eq!(&blob[2..4], &8u16.to_le_bytes());
        assert_eq!(&blob[4..8], &0xCCCC_CCCCu32.to_le_bytes());
        // Content size padded to 8
        assert_eq!(&blob[8..12], &8u32.to_le_bytes());
        assert_eq!(&blob[16..20], &0xDEAD_BEEFu32.to_le_bytes());
        assert_eq!(&blob[20..24], &[0, 0, 0, 0]);
    }

    #[test]
    fn test_null_relative_ptr() {
        let mut cur = PushCursor::new();
        cur.relative_ptr1(None).unwrap();
        assert_eq!(cur.blob(), &[0, 0, 0, 0]);
    }

    #[test]
    fn test_relative_ptr_forward() {
        let mut cur = PushCursor::new();
        let key = cur.alloc_key();
        cur.relative_ptr1(Some(key)).unwrap();
        cur.put_u32(0).unwrap(); // another scalar between pointer and content
        cur.relative_ptr2_start(key).unwrap();
        cur.put_u8(0xAB).unwrap();
        cur.relative_ptr2_end(key).unwrap();

        let blob = cur.blob();
        // Placeholder patched to offset 8 relative to base 0
        assert_eq!(&blob[0..4], &8u32.to_le_bytes());
        assert_eq!(blob[8], 0xAB);
    }

    #[test]
    fn test_relative_ptr_with_base() {
        let mut cur = PushCursor::new();
        cur.put_u32(0).unwrap();
        let base_key = cur.alloc_key();
        let ptr_key = cur.alloc_key();
        cur.setup_relative_base_offset1(base_key, cur.offset()).unwrap();
        cur.relative_ptr1(Some(ptr_key)).unwrap();
        cur.relative_ptr2_start(ptr_key).unwrap();
        cur.put_u16(0x1234).unwrap();
        cur.relative_ptr2_end(ptr_key).unwrap();

        let blob = cur.blob();
        // Pointer at absolute 4, content at absolute 8, base 4 → rel 4
        assert_eq!(&blob[4..8], &4u32.to_le_bytes());
        assert_eq!(&blob[8..10], &0x1234u16.to_le_bytes());
    }

    #[test]
    fn test_relative_ptr_reverse() {
        let mut cur = PushCursor::new();
        cur.set_flags(WireFlags::RELATIVE_REVERSE);
        let key = cur.alloc_key();
        cur.relative_ptr1(Some(key)).unwrap();
        cur.put_zeroes(12).unwrap(); // reserve space up to the end marker
        cur.relative_end_at_offset();
        cur.offset = 4;

        cur.relative_ptr2_start(key).unwrap();
        cur.put_bytes(&[0xAA, 0xBB, 0xCC]).unwrap();
        cur.relative_ptr2_end(key).unwrap();

        let blob = &cur.data[..16];
        // 3 bytes land at 16 - 3 = 13
        assert_eq!(&blob[13..16], &[0xAA, 0xBB, 0xCC]);
        // Pointer patched to the final position
        assert_eq!(&blob[0..4], &13u32.to_le_bytes());
        // Vacated scratch bytes zeroed
        assert_eq!(&blob[4..13], &[0u8; 9]);
        // Offset rolled back to the scratch start for the next sibling
        assert_eq!(cur.offset(), 4);
    }

    #[test]
    fn test_relative_ptr_reverse_alignment() {
        let mut cur = PushCursor::new();
        cur.set_flags(WireFlags::RELATIVE_REVERSE | WireFlags::ALIGN4);
        let key = cur.alloc_key();
        cur.relative_ptr1(Some(key)).unwrap();
        cur.put_zeroes(12).unwrap();
        cur.relative_end_at_offset();
        cur.offset = 4;

        cur.relative_ptr2_start(key).unwrap();
        cur.put_bytes(&[0x11, 0x22, 0x33]).unwrap();
        cur.relative_ptr2_end(key).unwrap();

        // 16 - 3 = 13, aligned down to 12
        assert_eq!(&cur.data[12..15], &[0x11, 0x22, 0x33]);
        assert_eq!(&cur.data[0..4], &12u32.to_le_bytes());
    }

    #[test]
    fn test_reverse_without_end_marker() {
        let mut cur = PushCursor::new();
        cur.set_flags(WireFlags::RELATIVE_REVERSE);
        let key = cur.alloc_key();
        cur.relative_ptr1(Some(key)).unwrap();
        assert!(matches!(
            cur.relative_ptr2_start(key),
            Err(WireError::Relative(_))
        ));
    }

    #[test]
    fn test_into_bytes_truncates() {
        let mut cur = PushCursor::new();
        cur.put_u16(0xBEEF).unwrap();
        let bytes = cur.into_bytes();
        assert_eq!(bytes.len(), 2);
        assert_eq!(&bytes[..], &[0xEF, 0xBE]);
    }
}
