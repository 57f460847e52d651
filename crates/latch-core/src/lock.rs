//! Per-file byte-range lock table
//!
//! The table lives inside a [`crate::record::ShareModeRecord`] and is only
//! mutated under that record's exclusive critical section, so it carries no
//! interior locking of its own. Conflict detection covers Windows- and
//! POSIX-flavored ranges; a denied request is a normal outcome reported as a
//! [`BlockerInfo`], never an error.

/// Sentinel disabling the per-handle fast lock counter.
///
/// POSIX ranges can merge and split in ways that invalidate simple counting,
/// so the first POSIX-flavor lock from a handle pins its counter here for the
/// rest of the handle's lifetime.
pub const NO_LOCKING_COUNT: i64 = -1;

/// Identifier of an owning process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessId(u64);

impl ProcessId {
    /// Create a process id
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the raw value
    pub const fn value(&self) -> u64 {
        self.0
    }
}

/// Identifier of one open file handle within a process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandleId(u64);

impl HandleId {
    /// Create a handle id
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the raw value
    pub const fn value(&self) -> u64 {
        self.0
    }
}

/// Lock owner context: the identity a granted range belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OwnerContext {
    /// Owning process
    pub process: ProcessId,
    /// Connection within the process
    pub connection: u64,
    /// Transaction/lock context within the connection
    pub transaction: u64,
}

impl OwnerContext {
    /// Create an owner context
    pub const fn new(process: ProcessId, connection: u64, transaction: u64) -> Self {
        Self {
            process,
            connection,
            transaction,
        }
    }
}

/// Lock type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LockType {
    /// Shared read lock (multiple allowed)
    Read = 0,
    /// Exclusive write lock (single holder)
    Write = 1,
}

impl TryFrom<u8> for LockType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Read),
            1 => Ok(Self::Write),
            other => Err(other),
        }
    }
}

/// Lock flavor: which semantics family the range follows
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LockFlavor {
    /// Windows semantics: per-connection ownership, exact-range unlock
    Windows = 0,
    /// POSIX semantics: per-process ownership, ranges may merge and split
    Posix = 1,
}

impl TryFrom<u8> for LockFlavor {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Windows),
            1 => Ok(Self::Posix),
            other => Err(other),
        }
    }
}

/// One granted byte-range lock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockRange {
    /// Lock owner
    pub owner: OwnerContext,
    /// Handle the lock was taken through
    pub handle: HandleId,
    /// Start offset
    pub start: u64,
    /// Length of the range; zero-length ranges are legal and lock a
    /// single point
    pub length: u64,
    /// Lock type
    pub kind: LockType,
    /// Lock flavor
    pub flavor: LockFlavor,
}

impl LockRange {
    /// Exclusive end offset; a zero-length range covers one point
    fn end(&self) -> u64 {
        self.start.saturating_add(self.length.max(1))
    }

    /// Check if two ranges overlap in byte span
    pub fn overlaps(&self, other: &LockRange) -> bool {
        self.start < other.end() && other.start < self.end()
    }

    /// Check if this granted range conflicts with a candidate request.
    ///
    /// READ/READ overlap never conflicts. Same-owner overlap only conflicts
    /// when `self_check` is set, which the strict read/write consistency
    /// probe uses.
    pub fn conflicts_with(&self, other: &LockRange, self_check: bool) -> bool {
        if self.kind == LockType::Read && other.kind == LockType::Read {
            return false;
        }
        if !self_check && self.owner == other.owner {
            return false;
        }
        self.overlaps(other)
    }
}

/// Description of the lock blocking a denied request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockerInfo {
    /// Owner of the blocking lock
    pub owner: OwnerContext,
    /// Start of the blocking range
    pub start: u64,
    /// Length of the blocking range
    pub length: u64,
    /// Type of the blocking lock
    pub kind: LockType,
    /// Identifier for the caller's blocking-lock retry bookkeeping,
    /// derived from the blocker's transaction context
    pub lock_sequence: u64,
}

impl BlockerInfo {
    fn from_range(range: &LockRange) -> Self {
        Self {
            owner: range.owner,
            start: range.start,
            length: range.length,
            kind: range.kind,
            lock_sequence: range.owner.transaction,
        }
    }
}

/// Per-handle fast lock counter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockCounter {
    /// Process owning the handle
    pub process: ProcessId,
    /// Handle the counter tracks
    pub handle: HandleId,
    /// Granted lock count, or [`NO_LOCKING_COUNT`]
    pub count: i64,
}

/// Byte-range lock table for one file
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LockTable {
    /// Granted ranges
    pub ranges: Vec<LockRange>,
    /// Per-handle fast lock counters
    pub counts: Vec<LockCounter>,
}

impl LockTable {
    /// Create an empty table
    pub const fn new() -> Self {
        Self {
            ranges: Vec::new(),
            counts: Vec::new(),
        }
    }

    /// Check if the table holds no ranges or counters
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty() && self.counts.is_empty()
    }

    /// Find the granted range blocking `candidate`, if any
    pub fn find_conflict(&self, candidate: &LockRange, self_check: bool) -> Option<&LockRange> {
        self.ranges
            .iter()
            .find(|granted| granted.conflicts_with(candidate, self_check))
    }

    /// Check that no granted range conflicts with `candidate`
    pub fn test_lock(&self, candidate: &LockRange, self_check: bool) -> bool {
        self.find_conflict(candidate, self_check).is_none()
    }

    /// Report which granted range would block `candidate`, if any
    pub fn query_lock(&self, candidate: &LockRange) -> Option<BlockerInfo> {
        self.find_conflict(candidate, false).map(BlockerInfo::from_range)
    }

    /// Grant a lock request, or report the blocking lock
    pub fn lock(&mut self, request: LockRange) -> Result<(), BlockerInfo> {
        if let Some(blocker) = self.find_conflict(&request, false) {
            return Err(BlockerInfo::from_range(blocker));
        }
        match request.flavor {
            LockFlavor::Posix => {
                self.set_count(request.owner.process, request.handle, NO_LOCKING_COUNT);
            }
            LockFlavor::Windows => {
                self.bump_count(request.owner.process, request.handle, 1);
            }
        }
        self.ranges.push(request);
        Ok(())
    }

    /// Remove an exact-matching range.
    ///
    /// Returns false when no range matches (owner, start, length, flavor),
    /// signaling range-not-locked to the caller.
    pub fn unlock(
        &mut self,
        owner: &OwnerContext,
        start: u64,
        length: u64,
        flavor: LockFlavor,
    ) -> bool {
        let pos = self.ranges.iter().position(|r| {
            r.owner == *owner && r.start == start && r.length == length && r.flavor == flavor
        });
        let Some(pos) = pos else {
            return false;
        };
        let removed = self.ranges.remove(pos);
        self.bump_count(removed.owner.process, removed.handle, -1);
        true
    }

    /// Remove every range tied to one handle, returning how many were removed
    pub fn close_handle(&mut self, owner: &OwnerContext, handle: HandleId) -> usize {
        let before = self.ranges.len();
        self.ranges
            .retain(|r| !(r.owner == *owner && r.handle == handle));
        self.counts
            .retain(|c| !(c.process == owner.process && c.handle == handle));
        before - self.ranges.len()
    }

    /// Check the per-handle fast path: true when the counter proves the
    /// handle holds no locks, so a table scan on close can be skipped
    pub fn handle_has_no_locks(&self, process: ProcessId, handle: HandleId) -> bool {
        self.current_lock_count(process, handle) == 0
    }

    /// Current fast counter for a handle; zero when never counted
    pub fn current_lock_count(&self, process: ProcessId, handle: HandleId) -> i64 {
        self.counts
            .iter()
            .find(|c| c.process == process && c.handle == handle)
            .map_or(0, |c| c.count)
    }

    fn set_count(&mut self, process: ProcessId, handle: HandleId, count: i64) {
        match self
            .counts
            .iter_mut()
            .find(|c| c.process == process && c.handle == handle)
        {
            Some(counter) => counter.count = count,
            None => self.counts.push(LockCounter {
                process,
                handle,
                count,
            }),
        }
    }

    fn bump_count(&mut self, process: ProcessId, handle: HandleId, delta: i64) {
        let current = self.current_lock_count(process, handle);
        if current == NO_LOCKING_COUNT {
            return;
        }
        self.set_count(process, handle, (current + delta).max(0));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owner(n: u64) -> OwnerContext {
        OwnerContext::new(ProcessId::new(n), n, n * 100)
    }

    fn range(owner_id: u64, start: u64, length: u64, kind: LockType) -> LockRange {
        LockRange {
            owner: owner(owner_id),
            handle: HandleId::new(owner_id),
            start,
            length,
            kind,
            flavor: LockFlavor::Windows,
        }
    }

    #[test]
    fn test_read_read_never_conflicts() {
        let mut table = LockTable::new();
        table.lock(range(1, 0, 100, LockType::Read)).unwrap();
        assert!(table.test_lock(&range(2, 0, 100, LockType::Read), false));
        assert!(table.test_lock(&range(2, 50, 200, LockType::Read), false));
    }

    #[test]
    fn test_write_conflicts_with_overlap() {
        let mut table = LockTable::new();
        table.lock(range(1, 10, 10, LockType::Write)).unwrap();
        assert!(!table.test_lock(&range(2, 15, 10, LockType::Write), false));
        assert!(!table.test_lock(&range(2, 15, 10, LockType::Read), false));
        assert!(!table.test_lock(&range(2, 0, 11, LockType::Write), false));
    }

    #[test]
    fn test_disjoint_ranges_allowed() {
        let mut table = LockTable::new();
        table.lock(range(1, 0, 10, LockType::Write)).unwrap();
        assert!(table.test_lock(&range(2, 10, 10, LockType::Write), false));
        table.lock(range(2, 10, 10, LockType::Write)).unwrap();
    }

    #[test]
    fn test_same_owner_no_self_conflict() {
        let mut table = LockTable::new();
        table.lock(range(1, 0, 100, LockType::Write)).unwrap();
        assert!(table.test_lock(&range(1, 0, 100, LockType::Write), false));
        assert!(!table.test_lock(&range(1, 0, 100, LockType::Write), true));
    }

    #[test]
    fn test_zero_length_is_a_point() {
        let mut table = LockTable::new();
        table.lock(range(1, 10, 0, LockType::Write)).unwrap();
        // A range covering offset 10 conflicts with the point lock
        assert!(!table.test_lock(&range(2, 5, 10, LockType::Write), false));
        // A range ending at 10 (exclusive) does not
        assert!(table.test_lock(&range(2, 5, 5, LockType::Write), false));
        // Two point locks at the same offset conflict
        assert!(!table.test_lock(&range(2, 10, 0, LockType::Write), false));
    }

    #[test]
    fn test_blocker_reported() {
        let mut table = LockTable::new();
        table.lock(range(1, 0, 100, LockType::Write)).unwrap();
        let blocker = table.lock(range(2, 50, 10, LockType::Write)).unwrap_err();
        assert_eq!(blocker.owner, owner(1));
        assert_eq!(blocker.start, 0);
        assert_eq!(blocker.length, 100);
        assert_eq!(blocker.lock_sequence, owner(1).transaction);
    }

    #[test]
    fn test_lock_unlock_roundtrip() {
        let mut table = LockTable::new();
        let snapshot = table.clone();
        table.lock(range(1, 0, 100, LockType::Write)).unwrap();
        assert!(table.unlock(&owner(1), 0, 100, LockFlavor::Windows));
        assert_eq!(table.ranges, snapshot.ranges);
        assert_eq!(table.current_lock_count(ProcessId::new(1), HandleId::new(1)), 0);
    }

    #[test]
    fn test_unlock_requires_exact_match() {
        let mut table = LockTable::new();
        table.lock(range(1, 0, 100, LockType::Write)).unwrap();
        assert!(!table.unlock(&owner(1), 0, 99, LockFlavor::Windows));
        assert!(!table.unlock(&owner(1), 1, 100, LockFlavor::Windows));
        assert!(!table.unlock(&owner(1), 0, 100, LockFlavor::Posix));
        assert!(!table.unlock(&owner(2), 0, 100, LockFlavor::Windows));
        assert!(table.unlock(&owner(1), 0, 100, LockFlavor::Windows));
    }

    #[test]
    fn test_unlock_after_blocker_leaves() {
        let mut table = LockTable::new();
        table.lock(range(1, 0, 100, LockType::Write)).unwrap();
        let denied = range(2, 50, 10, LockType::Write);
        assert!(table.lock(denied).is_err());
        assert!(table.unlock(&owner(1), 0, 100, LockFlavor::Windows));
        table.lock(denied).unwrap();
    }

    #[test]
    fn test_windows_counting() {
        let mut table = LockTable::new();
        let process = ProcessId::new(1);
        let handle = HandleId::new(1);
        assert!(table.handle_has_no_locks(process, handle));

        table.lock(range(1, 0, 10, LockType::Write)).unwrap();
        table.lock(range(1, 20, 10, LockType::Write)).unwrap();
        assert_eq!(table.current_lock_count(process, handle), 2);
        assert!(!table.handle_has_no_locks(process, handle));

        assert!(table.unlock(&owner(1), 0, 10, LockFlavor::Windows));
        assert!(table.unlock(&owner(1), 20, 10, LockFlavor::Windows));
        assert!(table.handle_has_no_locks(process, handle));
    }

    #[test]
    fn test_posix_disables_counting_permanently() {
        let mut table = LockTable::new();
        let process = ProcessId::new(1);
        let handle = HandleId::new(1);

        let mut posix = range(1, 0, 10, LockType::Write);
        posix.flavor = LockFlavor::Posix;
        table.lock(posix).unwrap();
        assert_eq!(table.current_lock_count(process, handle), NO_LOCKING_COUNT);

        // Counting stays disabled across later Windows locks and unlocks
        table.lock(range(1, 20, 10, LockType::Write)).unwrap();
        assert_eq!(table.current_lock_count(process, handle), NO_LOCKING_COUNT);
        assert!(table.unlock(&owner(1), 0, 10, LockFlavor::Posix));
        assert_eq!(table.current_lock_count(process, handle), NO_LOCKING_COUNT);
        assert!(!table.handle_has_no_locks(process, handle));
    }

    #[test]
    fn test_close_handle_removes_all() {
        let mut table = LockTable::new();
        table.lock(range(1, 0, 10, LockType::Write)).unwrap();
        table.lock(range(1, 20, 10, LockType::Read)).unwrap();
        table.lock(range(2, 40, 10, LockType::Write)).unwrap();

        assert_eq!(table.close_handle(&owner(1), HandleId::new(1)), 2);
        assert_eq!(table.ranges.len(), 1);
        assert_eq!(table.ranges[0].owner, owner(2));
        assert_eq!(
            table.current_lock_count(ProcessId::new(1), HandleId::new(1)),
            0
        );
        assert_eq!(table.close_handle(&owner(1), HandleId::new(1)), 0);
    }

    #[test]
    fn test_query_lock() {
        let mut table = LockTable::new();
        assert!(table.query_lock(&range(2, 0, 10, LockType::Write)).is_none());
        table.lock(range(1, 0, 100, LockType::Write)).unwrap();
        let blocker = table
            .query_lock(&range(2, 50, 10, LockType::Read))
            .unwrap();
        assert_eq!(blocker.owner, owner(1));
        assert_eq!(blocker.kind, LockType::Write);
    }
}
