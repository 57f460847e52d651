//! Wire encoding for records and cross-process message payloads
//!
//! Persistence and notification payloads share one little-endian, 4-byte
//! aligned layout built on the latch-wire cursors: strings are 16-bit
//! length-prefixed UTF-8 subcontexts, arrays carry a 32-bit element count
//! checked through the array-size token discipline, and optional trailing
//! structures hang off relative pointers (null pointer encodes `None`).
//! Encoding is deterministic, so a decode/encode cycle reproduces the
//! original bytes.

use bytes::Bytes;
use latch_wire::{PullCursor, PushCursor, SubcontextHeader, WireError, WireResult};

use crate::lock::{
    HandleId, LockCounter, LockFlavor, LockRange, LockTable, LockType, OwnerContext, ProcessId,
};
use crate::notify::RenameMessage;
use crate::record::{
    ClientGuid, DeleteToken, FileIdentity, LeaseKey, LeaseRef, OplockFlags, ShareEntryFlags,
    ShareModeEntry, ShareModeRecord,
};

/// A value that can be written to a push cursor
pub trait WireEncode {
    /// Append this value's wire form
    fn encode(&self, push: &mut PushCursor) -> WireResult<()>;
}

/// A value that can be read from a pull cursor
pub trait WireDecode: Sized {
    /// Read one value from the cursor's current offset
    fn decode(pull: &mut PullCursor<'_>) -> WireResult<Self>;
}

/// Encode a value into a fresh buffer
pub fn encode_to_bytes<T: WireEncode>(value: &T) -> WireResult<Bytes> {
    let mut push = PushCursor::new();
    value.encode(&mut push)?;
    Ok(push.into_bytes())
}

/// Decode a value from the start of a buffer
pub fn decode_from_bytes<T: WireDecode>(data: &[u8]) -> WireResult<T> {
    let mut pull = PullCursor::new(data)?;
    T::decode(&mut pull)
}

fn put_string(push: &mut PushCursor, s: &str) -> WireResult<()> {
    let mut child = push.subcontext_start(None)?;
    child.put_utf8(s)?;
    push.subcontext_end(child, SubcontextHeader::U16, None)
}

fn get_string(pull: &mut PullCursor<'_>) -> WireResult<String> {
    let mut child = pull.subcontext_start(SubcontextHeader::U16, None)?;
    let len = child.data_size();
    let s = child.get_utf8(len)?;
    pull.subcontext_end(&child, SubcontextHeader::U16, None)?;
    Ok(s)
}

fn put_blob(push: &mut PushCursor, blob: &[u8]) -> WireResult<()> {
    let len = u32::try_from(blob.len())
        .map_err(|_| WireError::Length(format!("blob of {} bytes", blob.len())))?;
    push.put_u32(len)?;
    push.put_bytes(blob)?;
    push.align_to(4)
}

fn get_blob(pull: &mut PullCursor<'_>) -> WireResult<Bytes> {
    let len = pull.get_u32()?;
    let blob = Bytes::copy_from_slice(pull.get_bytes(len)?);
    pull.align_to(4)?;
    Ok(blob)
}

impl WireEncode for FileIdentity {
    fn encode(&self, push: &mut PushCursor) -> WireResult<()> {
        push.put_u64(self.device)?;
        push.put_u64(self.inode)?;
        push.put_u64(self.extid)
    }
}

impl WireDecode for FileIdentity {
    fn decode(pull: &mut PullCursor<'_>) -> WireResult<Self> {
        Ok(Self {
            device: pull.get_u64()?,
            inode: pull.get_u64()?,
            extid: pull.get_u64()?,
        })
    }
}

impl WireEncode for OwnerContext {
    fn encode(&self, push: &mut PushCursor) -> WireResult<()> {
        push.put_u64(self.process.value())?;
        push.put_u64(self.connection)?;
        push.put_u64(self.transaction)
    }
}

impl WireDecode for OwnerContext {
    fn decode(pull: &mut PullCursor<'_>) -> WireResult<Self> {
        Ok(Self {
            process: ProcessId::new(pull.get_u64()?),
            connection: pull.get_u64()?,
            transaction: pull.get_u64()?,
        })
    }
}

impl WireEncode for LockRange {
    fn encode(&self, push: &mut PushCursor) -> WireResult<()> {
        self.owner.encode(push)?;
        push.put_u64(self.handle.value())?;
        push.put_u64(self.start)?;
        push.put_u64(self.length)?;
        push.put_u8(self.kind as u8)?;
        push.put_u8(self.flavor as u8)?;
        push.align_to(4)
    }
}

impl WireDecode for LockRange {
    fn decode(pull: &mut PullCursor<'_>) -> WireResult<Self> {
        let owner = OwnerContext::decode(pull)?;
        let handle = HandleId::new(pull.get_u64()?);
        let start = pull.get_u64()?;
        let length = pull.get_u64()?;
        let kind = LockType::try_from(pull.get_u8()?)
            .map_err(|raw| WireError::BadSwitch(u32::from(raw)))?;
        let flavor = LockFlavor::try_from(pull.get_u8()?)
            .map_err(|raw| WireError::BadSwitch(u32::from(raw)))?;
        pull.align_to(4)?;
        Ok(Self {
            owner,
            handle,
            start,
            length,
            kind,
            flavor,
        })
    }
}

impl WireEncode for LockCounter {
    fn encode(&self, push: &mut PushCursor) -> WireResult<()> {
        push.put_u64(self.process.value())?;
        push.put_u64(self.handle.value())?;
        push.put_u64(self.count as u64)
    }
}

impl WireDecode for LockCounter {
    fn decode(pull: &mut PullCursor<'_>) -> WireResult<Self> {
        Ok(Self {
            process: ProcessId::new(pull.get_u64()?),
            handle: HandleId::new(pull.get_u64()?),
            count: pull.get_u64()? as i64,
        })
    }
}

impl WireEncode for LockTable {
    fn encode(&self, push: &mut PushCursor) -> WireResult<()> {
        encode_array(push, &self.ranges)?;
        encode_array(push, &self.counts)
    }
}

impl WireDecode for LockTable {
    fn decode(pull: &mut PullCursor<'_>) -> WireResult<Self> {
        Ok(Self {
            ranges: decode_array(pull)?,
            counts: decode_array(pull)?,
        })
    }
}

impl WireEncode for LeaseRef {
    fn encode(&self, push: &mut PushCursor) -> WireResult<()> {
        push.put_bytes(&self.client_guid.0)?;
        push.put_u64(self.key.high)?;
        push.put_u64(self.key.low)
    }
}

impl WireDecode for LeaseRef {
    fn decode(pull: &mut PullCursor<'_>) -> WireResult<Self> {
        let raw: [u8; 16] = pull
            .get_bytes(16)?
            .try_into()
            .map_err(|_| WireError::Length("client guid".to_string()))?;
        Ok(Self {
            client_guid: ClientGuid(raw),
            key: LeaseKey {
                high: pull.get_u64()?,
                low: pull.get_u64()?,
            },
        })
    }
}

impl WireEncode for ShareModeEntry {
    fn encode(&self, push: &mut PushCursor) -> WireResult<()> {
        push.put_u64(self.owner_process.value())?;
        push.put_u64(self.file_handle_id.value())?;
        push.put_u32(self.share_access)?;
        push.put_u32(self.access_mask)?;
        push.put_u32(self.uid)?;
        push.put_u32(self.name_hash)?;
        push.put_u8(self.oplock.bits())?;
        push.put_u8(u8::from(self.stale))?;
        push.put_u16(self.flags.bits())?;
        push.put_u8(u8::from(self.lease.is_some()))?;
        push.align_to(4)?;
        if let Some(lease) = &self.lease {
            lease.encode(push)?;
        }
        Ok(())
    }
}

impl WireDecode for ShareModeEntry {
    fn decode(pull: &mut PullCursor<'_>) -> WireResult<Self> {
        let owner_process = ProcessId::new(pull.get_u64()?);
        let file_handle_id = HandleId::new(pull.get_u64()?);
        let share_access = pull.get_u32()?;
        let access_mask = pull.get_u32()?;
        let uid = pull.get_u32()?;
        let name_hash = pull.get_u32()?;
        let oplock = OplockFlags::new(pull.get_u8()?);
        let stale = pull.get_u8()? != 0;
        let flags = ShareEntryFlags::new(pull.get_u16()?);
        let has_lease = pull.get_u8()? != 0;
        pull.align_to(4)?;
        let lease = if has_lease {
            Some(LeaseRef::decode(pull)?)
        } else {
            None
        };
        Ok(Self {
            owner_process,
            share_access,
            access_mask,
            file_handle_id,
            uid,
            name_hash,
            oplock,
            lease,
            flags,
            stale,
        })
    }
}

impl WireEncode for DeleteToken {
    fn encode(&self, push: &mut PushCursor) -> WireResult<()> {
        push.put_u32(self.name_hash)?;
        let key = self.parent_lease_key.as_ref().map(|_| push.alloc_key());
        push.relative_ptr1(key)?;
        put_blob(push, &self.security_token)?;
        put_blob(push, &self.unix_token)?;
        if let (Some(parent), Some(key)) = (&self.parent_lease_key, key) {
            push.relative_ptr2_start(key)?;
            push.put_u64(parent.high)?;
            push.put_u64(parent.low)?;
            push.relative_ptr2_end(key)?;
        }
        Ok(())
    }
}

impl WireDecode for DeleteToken {
    fn decode(pull: &mut PullCursor<'_>) -> WireResult<Self> {
        let name_hash = pull.get_u32()?;
        pull.align_to(4)?;
        let raw_offset = pull.get_u32()?;
        let parent_key = if raw_offset != 0 {
            let key = pull.alloc_key();
            pull.relative_ptr1(key, raw_offset)?;
            Some(key)
        } else {
            None
        };
        let security_token = get_blob(pull)?;
        let unix_token = get_blob(pull)?;
        // The pointee immediately follows the scalars; resume decoding
        // after it rather than restoring the pre-seek offset.
        let parent_lease_key = match parent_key {
            Some(key) => {
                pull.relative_ptr2(key)?;
                let high = pull.get_u64()?;
                let low = pull.get_u64()?;
                pull.mark_highest();
                Some(LeaseKey { high, low })
            }
            None => None,
        };
        Ok(Self {
            name_hash,
            parent_lease_key,
            security_token,
            unix_token,
        })
    }
}

impl WireEncode for ShareModeRecord {
    fn encode(&self, push: &mut PushCursor) -> WireResult<()> {
        self.id.encode(push)?;
        push.put_u64(self.sequence)?;
        put_string(push, &self.service_path)?;
        put_string(push, &self.base_name)?;
        put_string(push, &self.stream_name)?;
        push.align_to(4)?;
        encode_array(push, &self.entries)?;
        encode_array(push, &self.delete_tokens)?;
        self.locks.encode(push)
    }
}

impl WireDecode for ShareModeRecord {
    fn decode(pull: &mut PullCursor<'_>) -> WireResult<Self> {
        let id = FileIdentity::decode(pull)?;
        let sequence = pull.get_u64()?;
        let service_path = get_string(pull)?;
        let base_name = get_string(pull)?;
        let stream_name = get_string(pull)?;
        pull.align_to(4)?;
        let entries = decode_array(pull)?;
        let delete_tokens = decode_array(pull)?;
        let locks = LockTable::decode(pull)?;
        Ok(Self {
            id,
            sequence,
            service_path,
            base_name,
            stream_name,
            entries,
            delete_tokens,
            locks,
        })
    }
}

impl WireEncode for RenameMessage {
    fn encode(&self, push: &mut PushCursor) -> WireResult<()> {
        self.id.encode(push)?;
        push.put_u64(self.share_file_id)?;
        put_string(push, &self.service_path)?;
        put_string(push, &self.base_name)?;
        put_string(push, &self.stream_name)
    }
}

impl WireDecode for RenameMessage {
    fn decode(pull: &mut PullCursor<'_>) -> WireResult<Self> {
        Ok(Self {
            id: FileIdentity::decode(pull)?,
            share_file_id: pull.get_u64()?,
            service_path: get_string(pull)?,
            base_name: get_string(pull)?,
            stream_name: get_string(pull)?,
        })
    }
}

fn encode_array<T: WireEncode>(push: &mut PushCursor, items: &[T]) -> WireResult<()> {
    let count = u32::try_from(items.len())
        .map_err(|_| WireError::Length(format!("array of {} elements", items.len())))?;
    push.put_u32(count)?;
    for item in items {
        item.encode(push)?;
    }
    Ok(())
}

fn decode_array<T: WireDecode>(pull: &mut PullCursor<'_>) -> WireResult<Vec<T>> {
    let key = pull.alloc_key();
    pull.pull_array_size(key)?;
    let count = pull.get_array_size(key)?;
    let mut items = Vec::new();
    for _ in 0..count {
        items.push(T::decode(pull)?);
    }
    pull.check_steal_array_size(key, count)?;
    Ok(items)
}
