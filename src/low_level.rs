// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use core::cmp::Ordering;
use core::mem::size_of;
use num_traits::FromPrimitive;
use zerocopy::{AsBytes, FromBytes, Unaligned};

//////////////////////////////////////////////////////////////////////////////
// Convenience wrapper for zerocopy.

pub fn cast_prefix<T>(bytes: &[u8]) -> (&T, &[u8])
    where T: FromBytes + Unaligned,
{
    let (lv, rest) = zerocopy::LayoutVerified::<_, T>::new_unaligned_from_prefix(bytes)
        .expect("type does not fit in buffer");
    (lv.into_ref(), rest)
}

//////////////////////////////////////////////////////////////////////////////
// At-rest layout.

/// Shorthand for a `u16` in little-endian representation.
type U16LE = zerocopy::U16<byteorder::LittleEndian>;

/// Header occupying the first four bytes of every block.
///
/// The marker distinguishes a formatted block from erased or arbitrary data;
/// the sequence number orders blocks relative to each other (modulo 256, see
/// `sequence_compare`); the status byte tracks the block through its life
/// cycle. All status transitions only clear bits, so a block's header is
/// written once per erase cycle and then patched in place.
#[derive(Copy, Clone, Debug, FromBytes, AsBytes, Unaligned, Eq, PartialEq)]
#[repr(C)]
pub struct BlockHeader {
    /// Marker (`EXPECTED_MARKER`) distinguishing this from arbitrary data.
    pub marker: U16LE,
    /// Generation of this block. Advanced by one each time a block becomes
    /// the compaction target.
    pub sequence: u8,
    /// Raw status byte. See `BlockStatus` for defined values.
    pub status: u8,
}

impl BlockHeader {
    /// Bits we expect to find in the `marker` field.
    pub const EXPECTED_MARKER: u16 = 0xEE55;
    /// Size of the header in bytes; the record log starts at this offset.
    pub const SIZE: u32 = size_of::<Self>() as u32;

    pub fn marker_ok(&self) -> bool {
        self.marker.get() == Self::EXPECTED_MARKER
    }

    /// Decodes the status byte. `None` means the byte holds none of the
    /// defined values; such a block is never treated as holding live data.
    pub fn status(&self) -> Option<BlockStatus> {
        BlockStatus::from_u8(self.status)
    }

    /// Whether records in this block are authoritative: the marker checks
    /// out and the block has been promoted to Active.
    pub fn holds_live_data(&self) -> bool {
        self.marker_ok() && self.status() == Some(BlockStatus::Active)
    }
}

/// Defined values for the `BlockHeader::status` field.
///
/// The life cycle is `Empty -> Receiving -> Active -> Obsolete -> (erase)`,
/// and every step only clears bits (`FF -> EE -> AA -> 00`), which is what
/// lets us patch the status in place on program-only flash.
#[derive(Copy, Clone, Debug, Eq, PartialEq, num_derive::FromPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BlockStatus {
    /// Superseded by a newer block; contents await erasure.
    Obsolete = 0x00,
    /// The one block (in steady state) whose records are authoritative.
    Active = 0xAA,
    /// Compaction target mid-copy. Ignored by readers; reclaimed if a power
    /// loss strands it.
    Receiving = 0xEE,
    /// Header written but never advanced. Only observable after a power
    /// loss between the two header programs.
    Empty = 0xFF,
}

/// Size of one record slot in bytes (one halfword).
pub const RECORD_SIZE: u32 = 2;
/// Key byte of a record that has been logically deleted.
pub const ID_DELETED: u8 = 0x00;
/// Key byte of a slot that has never been programmed. This doubles as the
/// erased state, so it can never be a valid id.
pub const ID_ERASED: u8 = 0xFF;
/// A fully erased slot; marks the tail of a block's record log.
pub const SLOT_ERASED: u16 = 0xFFFF;

/// One key/value pair as stored in a record slot.
///
/// Packed as `value << 8 | id` so the id occupies the low byte, where a
/// later in-place program can clear it to `ID_DELETED` without touching the
/// value byte.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Record {
    pub id: u8,
    pub value: u8,
}

impl Record {
    pub fn pack(self) -> u16 {
        u16::from(self.value) << 8 | u16::from(self.id)
    }

    pub fn unpack(raw: u16) -> Self {
        Record {
            id: raw as u8,
            value: (raw >> 8) as u8,
        }
    }

    /// Whether this slot holds a live pair: programmed, not deleted.
    pub fn is_live(self) -> bool {
        self.id != ID_DELETED && self.id != ID_ERASED
    }
}

/// Compares two block sequence numbers, allowing for wraparound. A
/// difference of up to half the sequence space is treated as meaningful,
/// which keeps the store working past 255 compactions.
pub fn sequence_compare(a: u8, b: u8) -> Ordering {
    (a.wrapping_sub(b) as i8).cmp(&0)
}

//////////////////////////////////////////////////////////////////////////////
// Storage region description.

/// Default erasable-unit size (CH32V003-class fast page erase).
pub const DEFAULT_BLOCK_SIZE: u32 = 64;
/// Default number of blocks in the reserved region (1 KiB total).
pub const DEFAULT_BLOCK_COUNT: u32 = 16;

/// A statically configured storage region: `block_count` erasable units of
/// `block_size` bytes starting at `base`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Geometry {
    pub base: u32,
    pub block_size: u32,
    pub block_count: u32,
}

impl Geometry {
    /// Standard region for the target part: the last 1 KiB of flash.
    pub const DEFAULT: Self = Geometry {
        base: 0x0800_3C00,
        block_size: DEFAULT_BLOCK_SIZE,
        block_count: DEFAULT_BLOCK_COUNT,
    };

    /// Validates the region: power-of-two block size large enough for a
    /// header plus at least one record, base aligned to the erase unit, and
    /// a block count the compactor's bitmap can track.
    pub fn check(&self) -> bool {
        self.block_size.is_power_of_two()
            && self.block_size >= BlockHeader::SIZE + RECORD_SIZE
            && self.base % self.block_size == 0
            && self.block_count >= 2
            && self.block_count <= 32
    }

    pub fn region_size(&self) -> u32 {
        self.block_size * self.block_count
    }

    /// Base address of block `index`.
    pub fn block_base(&self, index: u32) -> u32 {
        debug_assert!(index < self.block_count);
        self.base + index * self.block_size
    }

    /// Number of record slots per block. One block's worth of distinct keys
    /// is also the store's live-data capacity.
    pub fn slots_per_block(&self) -> u32 {
        (self.block_size - BlockHeader::SIZE) / RECORD_SIZE
    }
}

//////////////////////////////////////////////////////////////////////////////
// Flash controller interface.

/// Capability trait over the memory-mapped flash controller.
///
/// Implementations expose the raw controller operations; the policy (lock
/// pairing, bounded busy-waits, post-operation verification) lives in
/// `erase_block` and `program_halfword` so it is shared by every backend,
/// hardware or simulated.
///
/// Addresses are absolute and must be halfword aligned. The controller is
/// assumed single-threaded; nothing here is reentrant.
pub trait FlashBus {
    /// Reads one halfword. Reads are always permitted on this class of
    /// device, including from erased cells (which read as all ones).
    fn read_halfword(&self, addr: u32) -> u16;

    /// Performs the controller's key sequence to enable program/erase.
    /// Returns false if the controller rejects the sequence. Also clears
    /// any latched fault flags from a previous operation.
    fn unlock(&mut self) -> bool;

    /// Re-locks the controller. Must be callable in any state.
    fn lock(&mut self);

    /// Begins erasing the erasable unit containing `addr`. The caller
    /// polls `busy` for completion.
    fn start_erase(&mut self, addr: u32);

    /// Begins programming one halfword. Programming can only clear bits;
    /// a bit already at 0 stays at 0 regardless of the data written.
    fn start_program(&mut self, addr: u32, value: u16);

    /// Whether the controller is still working on the last operation.
    fn busy(&self) -> bool;

    /// Whether the controller has latched a fault (e.g. write protection)
    /// for the last operation.
    fn fault(&self) -> bool;
}

/// Bound on busy-wait polling. This is an iteration count, not a clock, so
/// under core clock misconfiguration the real timeout is approximate.
pub const POLL_LIMIT: u32 = 50_000;

/// Things that can go wrong at the flash-driver level.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FlashError {
    /// The controller rejected the unlock key sequence.
    LockFailed,
    /// An operation did not complete within `POLL_LIMIT` polls.
    Timeout,
    /// The controller reported a fault during erase.
    EraseFailed,
    /// An erased unit did not read back as all ones.
    EraseVerify,
    /// The controller reported a fault during programming.
    ProgramFailed,
    /// A programmed halfword did not read back as written.
    WriteVerify,
}

fn wait_not_busy<B: FlashBus>(bus: &B) -> Result<(), FlashError> {
    for _ in 0..POLL_LIMIT {
        if !bus.busy() {
            return Ok(());
        }
    }
    Err(FlashError::Timeout)
}

/// Erases the erasable unit containing `addr` and verifies it reads blank.
///
/// The address is aligned down to the unit boundary first; handing some
/// controllers an unaligned address erases a larger region than intended.
/// The controller is locked again on every exit path.
pub fn erase_block<B: FlashBus>(
    bus: &mut B,
    geometry: &Geometry,
    addr: u32,
) -> Result<(), FlashError> {
    let addr = addr & !(geometry.block_size - 1);

    if !bus.unlock() {
        return Err(FlashError::LockFailed);
    }
    let r = erase_unlocked(bus, geometry, addr);
    bus.lock();
    r
}

fn erase_unlocked<B: FlashBus>(
    bus: &mut B,
    geometry: &Geometry,
    addr: u32,
) -> Result<(), FlashError> {
    bus.start_erase(addr);
    wait_not_busy(bus)?;
    if bus.fault() {
        return Err(FlashError::EraseFailed);
    }
    for off in (0..geometry.block_size).step_by(RECORD_SIZE as usize) {
        if bus.read_halfword(addr + off) != SLOT_ERASED {
            return Err(FlashError::EraseVerify);
        }
    }
    Ok(())
}

/// Programs one halfword and verifies it reads back as written.
///
/// The verify step is what catches an attempt to set a bit that is already
/// cleared; the controller silently fails to apply such bits. The only
/// halfwords this store ever re-programs are status-byte patches, whose
/// transitions are all 1->0.
pub fn program_halfword<B: FlashBus>(
    bus: &mut B,
    addr: u32,
    value: u16,
) -> Result<(), FlashError> {
    if !bus.unlock() {
        return Err(FlashError::LockFailed);
    }
    let r = program_unlocked(bus, addr, value);
    bus.lock();
    r
}

fn program_unlocked<B: FlashBus>(
    bus: &mut B,
    addr: u32,
    value: u16,
) -> Result<(), FlashError> {
    bus.start_program(addr, value);
    wait_not_busy(bus)?;
    if bus.fault() {
        return Err(FlashError::ProgramFailed);
    }
    if bus.read_halfword(addr) != value {
        return Err(FlashError::WriteVerify);
    }
    Ok(())
}

//////////////////////////////////////////////////////////////////////////////
// Store-level errors.

/// Things that can go wrong with store operations.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// Geometry fails validation (misaligned base, bad block size/count).
    InvalidParam,
    /// A reserved id value (0x00 or 0xFF) was used as a key.
    InvalidId,
    /// No record exists for the requested id.
    NotFound,
    /// The live data set does not fit in one block, and no operation can
    /// change that until something is deleted.
    StorageFull,
    /// No block is Active. Recoverable by `format`.
    NoValidBlock,
    /// An underlying flash operation failed.
    Flash(FlashError),
}

impl From<FlashError> for Error {
    fn from(e: FlashError) -> Self {
        Self::Flash(e)
    }
}

//////////////////////////////////////////////////////////////////////////////
// Header access.

/// Reads and decodes the header of block `index`.
pub fn read_header<B: FlashBus>(bus: &B, geometry: &Geometry, index: u32) -> BlockHeader {
    let base = geometry.block_base(index);
    let mut bytes = [0; BlockHeader::SIZE as usize];
    bytes[..2].copy_from_slice(&bus.read_halfword(base).to_le_bytes());
    bytes[2..].copy_from_slice(&bus.read_halfword(base + 2).to_le_bytes());
    let (header, _) = cast_prefix::<BlockHeader>(&bytes);
    *header
}

/// Writes a complete header into a freshly erased block: marker first, then
/// sequence and status in one halfword.
pub fn write_header<B: FlashBus>(
    bus: &mut B,
    geometry: &Geometry,
    index: u32,
    sequence: u8,
    status: BlockStatus,
) -> Result<(), FlashError> {
    let header = BlockHeader {
        marker: BlockHeader::EXPECTED_MARKER.into(),
        sequence,
        status: status as u8,
    };
    let bytes = header.as_bytes();
    let base = geometry.block_base(index);
    program_halfword(bus, base, u16::from_le_bytes([bytes[0], bytes[1]]))?;
    program_halfword(bus, base + 2, u16::from_le_bytes([bytes[2], bytes[3]]))?;
    Ok(())
}

/// Patches the status byte of an already-written header in place, keeping
/// the sequence byte. Only 1->0 transitions are representable on the wire,
/// which the status life cycle respects by construction.
pub fn program_status<B: FlashBus>(
    bus: &mut B,
    geometry: &Geometry,
    index: u32,
    sequence: u8,
    status: BlockStatus,
) -> Result<(), FlashError> {
    let base = geometry.block_base(index);
    program_halfword(bus, base + 2, u16::from_le_bytes([sequence, status as u8]))
}

//////////////////////////////////////////////////////////////////////////////
// Log scanning.

/// Finds the block whose records are authoritative: marker valid, status
/// Active, and (should more than one qualify, as happens transiently after
/// a power loss between compaction steps) the greatest sequence number.
///
/// `None` means no block qualifies and the store needs `format`.
pub fn find_active_block<B: FlashBus>(bus: &B, geometry: &Geometry) -> Option<u32> {
    let mut best: Option<(u32, u8)> = None;
    for index in 0..geometry.block_count {
        let header = read_header(bus, geometry, index);
        if !header.holds_live_data() {
            continue;
        }
        match best {
            Some((_, seq))
                if sequence_compare(header.sequence, seq) != Ordering::Greater => {}
            _ => best = Some((index, header.sequence)),
        }
    }
    best.map(|(index, _)| index)
}

/// Offset of the first erased slot in block `index`, i.e. the tail of its
/// append-only log. Equals `block_size` when the block is full. Writes are
/// strictly sequential, so the first erased slot bounds all programmed
/// ones.
pub fn log_tail<B: FlashBus>(bus: &B, geometry: &Geometry, index: u32) -> u32 {
    let base = geometry.block_base(index);
    let mut offset = BlockHeader::SIZE;
    while offset + RECORD_SIZE <= geometry.block_size {
        if bus.read_halfword(base + offset) == SLOT_ERASED {
            break;
        }
        offset += RECORD_SIZE;
    }
    offset
}

/// Bytes still programmable in block `index`.
pub fn free_space<B: FlashBus>(bus: &B, geometry: &Geometry, index: u32) -> u32 {
    geometry.block_size - log_tail(bus, geometry, index)
}

/// Where a record was found.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct RecordLocation {
    /// Block index holding the authoritative record.
    pub block: u32,
    /// Absolute address of the record's slot.
    pub addr: u32,
    pub record: Record,
}

/// Finds the most recent record for `id`.
///
/// Within a block, slots are scanned from the log tail backwards, so the
/// first hit is the newest: appends never overwrite, which makes the
/// physically last-written slot authoritative. Across blocks, the hit in
/// the block with the greatest sequence number wins.
pub fn find_record<B: FlashBus>(
    bus: &B,
    geometry: &Geometry,
    id: u8,
) -> Option<RecordLocation> {
    let mut best: Option<(u8, RecordLocation)> = None;
    for index in 0..geometry.block_count {
        let header = read_header(bus, geometry, index);
        if !header.holds_live_data() {
            continue;
        }
        let base = geometry.block_base(index);
        let mut offset = log_tail(bus, geometry, index);
        while offset > BlockHeader::SIZE {
            offset -= RECORD_SIZE;
            let record = Record::unpack(bus.read_halfword(base + offset));
            if record.id != id || !record.is_live() {
                continue;
            }
            let loc = RecordLocation {
                block: index,
                addr: base + offset,
                record,
            };
            match best {
                Some((seq, _))
                    if sequence_compare(header.sequence, seq) != Ordering::Greater => {}
                _ => best = Some((header.sequence, loc)),
            }
            break;
        }
    }
    best.map(|(_, loc)| loc)
}

/// Compact membership set over the 254 usable ids.
struct IdSet([u8; 32]);

impl IdSet {
    fn new() -> Self {
        IdSet([0; 32])
    }

    /// Inserts `id`, returning true if it was not already present.
    fn insert(&mut self, id: u8) -> bool {
        let (byte, bit) = (usize::from(id) / 8, id % 8);
        let fresh = self.0[byte] & (1 << bit) == 0;
        self.0[byte] |= 1 << bit;
        fresh
    }
}

/// Counts distinct live ids across all Active blocks. A superseded id
/// counts once; deleted records count not at all. `skip` excludes an id
/// about to be rewritten, which is how `set` decides whether a migrating
/// write will still fit after compaction.
pub fn count_live_ids<B: FlashBus>(
    bus: &B,
    geometry: &Geometry,
    skip: Option<u8>,
) -> u32 {
    let mut seen = IdSet::new();
    let mut count = 0;
    for index in 0..geometry.block_count {
        let header = read_header(bus, geometry, index);
        if !header.holds_live_data() {
            continue;
        }
        let base = geometry.block_base(index);
        let tail = log_tail(bus, geometry, index);
        let mut offset = BlockHeader::SIZE;
        while offset < tail {
            let record = Record::unpack(bus.read_halfword(base + offset));
            offset += RECORD_SIZE;
            if !record.is_live() || Some(record.id) == skip {
                continue;
            }
            if seen.insert(record.id) {
                count += 1;
            }
        }
    }
    count
}

/// Zeroes the id byte of every record for `id` in every Active block,
/// marking them logically deleted without reclaiming space. All copies are
/// invalidated, not just the newest: with append-only supersession a key
/// can occupy several slots, and leaving an older one live would resurrect
/// a stale value.
///
/// Returns whether any record was found.
pub fn delete_records<B: FlashBus>(
    bus: &mut B,
    geometry: &Geometry,
    id: u8,
) -> Result<bool, FlashError> {
    let mut any = false;
    for index in 0..geometry.block_count {
        let header = read_header(bus, geometry, index);
        if !header.holds_live_data() {
            continue;
        }
        let base = geometry.block_base(index);
        let tail = log_tail(bus, geometry, index);
        let mut offset = BlockHeader::SIZE;
        while offset < tail {
            let raw = bus.read_halfword(base + offset);
            if Record::unpack(raw).id == id {
                // Clear the id byte, keep the value byte untouched.
                program_halfword(bus, base + offset, raw & 0xFF00)?;
                any = true;
            }
            offset += RECORD_SIZE;
        }
    }
    Ok(any)
}

//////////////////////////////////////////////////////////////////////////////
// Compaction / wear leveling.

/// Tracks which blocks the compactor has drained. `Geometry::check` caps
/// the block count at 32 to keep this a single word.
struct BlockSet(u32);

impl BlockSet {
    fn new() -> Self {
        BlockSet(0)
    }

    fn insert(&mut self, index: u32) {
        self.0 |= 1 << index;
    }

    fn contains(&self, index: u32) -> bool {
        self.0 & (1 << index) != 0
    }
}

/// Migrates all live records out of `from_block` (the current active block)
/// into a fresh block, advancing the generation and leveling wear across
/// the region.
///
/// `fresh`, if given, is the record whose write triggered the compaction.
/// It is placed first in the target and its id is excluded from the copy,
/// so the update lands atomically with the migration: until the target is
/// promoted, the old value is still reachable in the old block.
///
/// Ordering is chosen so that a power loss at any point is recoverable:
///
/// 1. The target keeps status Receiving while records are copied; readers
///    ignore it, and a stranded target is simply reclaimed later.
/// 2. The target is promoted to Active only once the copy is complete.
///    From here the old blocks are shadowed by the higher sequence number.
/// 3. Only then are the drained blocks marked Obsolete.
///
/// Returns the index of the new active block.
pub fn compact<B: FlashBus>(
    bus: &mut B,
    geometry: &Geometry,
    from_block: u32,
    fresh: Option<Record>,
) -> Result<u32, Error> {
    let from_header = read_header(bus, geometry, from_block);
    if !from_header.holds_live_data() {
        return Err(Error::NoValidBlock);
    }
    let new_sequence = from_header.sequence.wrapping_add(1);

    // Select the target: the next block, cyclically, that does not hold
    // current data. A stale Active block with a lower sequence (left by a
    // power loss after promotion) is fully shadowed and therefore fair
    // game.
    let mut target = None;
    for i in 1..geometry.block_count {
        let candidate = (from_block + i) % geometry.block_count;
        let header = read_header(bus, geometry, candidate);
        let shadowed = header.holds_live_data()
            && sequence_compare(header.sequence, from_header.sequence) == Ordering::Less;
        if !header.holds_live_data() || shadowed {
            target = Some(candidate);
            break;
        }
    }
    let Some(target) = target else {
        return Err(Error::StorageFull);
    };

    #[cfg(feature = "defmt")]
    defmt::trace!(
        "compact: block {} seq {} -> block {} seq {}",
        from_block,
        from_header.sequence,
        target,
        new_sequence
    );

    if !block_blank(bus, geometry, target) {
        erase_block(bus, geometry, geometry.block_base(target))?;
    }
    write_header(bus, geometry, target, new_sequence, BlockStatus::Receiving)?;

    let target_base = geometry.block_base(target);
    let mut write_offset = BlockHeader::SIZE;
    let mut copied = IdSet::new();
    if let Some(record) = fresh {
        program_halfword(bus, target_base + write_offset, record.pack())?;
        write_offset += RECORD_SIZE;
        copied.insert(record.id);
    }

    // Drain the remaining Active blocks in descending sequence order, so
    // an id already copied from a newer block suppresses its older
    // versions. Within a block, scanning backward from the tail makes the
    // newest slot win.
    let mut drained = BlockSet::new();
    loop {
        let mut source: Option<(u32, u8)> = None;
        for index in 0..geometry.block_count {
            if index == target || drained.contains(index) {
                continue;
            }
            let header = read_header(bus, geometry, index);
            if !header.holds_live_data() {
                continue;
            }
            match source {
                Some((_, seq))
                    if sequence_compare(header.sequence, seq) != Ordering::Greater => {}
                _ => source = Some((index, header.sequence)),
            }
        }
        let Some((index, _)) = source else {
            break;
        };
        drained.insert(index);

        let base = geometry.block_base(index);
        let mut offset = log_tail(bus, geometry, index);
        while offset > BlockHeader::SIZE {
            offset -= RECORD_SIZE;
            let record = Record::unpack(bus.read_halfword(base + offset));
            if !record.is_live() || !copied.insert(record.id) {
                continue;
            }
            if write_offset + RECORD_SIZE > geometry.block_size {
                // More live ids than one block holds. The target is still
                // Receiving, so nothing has been lost.
                return Err(Error::StorageFull);
            }
            program_halfword(bus, target_base + write_offset, record.pack())?;
            write_offset += RECORD_SIZE;
        }
    }

    program_status(bus, geometry, target, new_sequence, BlockStatus::Active)?;

    for index in 0..geometry.block_count {
        if !drained.contains(index) {
            continue;
        }
        let header = read_header(bus, geometry, index);
        program_status(bus, geometry, index, header.sequence, BlockStatus::Obsolete)?;
    }

    Ok(target)
}

fn block_blank<B: FlashBus>(bus: &B, geometry: &Geometry, index: u32) -> bool {
    let base = geometry.block_base(index);
    (0..geometry.block_size)
        .step_by(RECORD_SIZE as usize)
        .all(|off| bus.read_halfword(base + off) == SLOT_ERASED)
}

//////////////////////////////////////////////////////////////////////////////
// Region formatting.

/// Erases every block in the region and writes a fresh Active header with
/// sequence 0 into block 0. Destroys all data; the store only does this
/// implicitly when discovery finds no Active block at mount.
pub fn format<B: FlashBus>(bus: &mut B, geometry: &Geometry) -> Result<(), Error> {
    #[cfg(feature = "defmt")]
    defmt::trace!("format: erasing {} blocks", geometry.block_count);

    for index in 0..geometry.block_count {
        erase_block(bus, geometry, geometry.block_base(index))?;
    }
    write_header(bus, geometry, 0, 0, BlockStatus::Active)?;
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use core::cell::Cell;

    pub(crate) const TEST_GEOMETRY: Geometry = Geometry {
        base: 0x0800_3C00,
        block_size: 64,
        block_count: 16,
    };

    pub(crate) const TWO_BLOCKS: Geometry = Geometry {
        base: 0x0800_3C00,
        block_size: 64,
        block_count: 2,
    };

    /// Simulated flash controller over a byte array, with the properties
    /// that matter: programming ANDs bits (1->0 only), erase restores all
    /// ones, program/erase are refused while locked, and faults, busy
    /// polls and power cuts can be injected.
    pub(crate) struct SimBus {
        pub mem: Vec<u8>,
        base: u32,
        block_size: u32,
        locked: bool,
        /// Successful program operations, for wear assertions.
        pub programs: u32,
        /// Erase operations performed.
        pub erases: u32,
        /// Busy polls reported after each started operation.
        pub busy_per_op: u32,
        /// Remaining program/erase operations until simulated power loss.
        pub power_cut: Option<u32>,
        /// When set, the next started operation latches a fault instead of
        /// running.
        pub fault_next: bool,
        /// When set, `unlock` refuses the key sequence.
        pub refuse_unlock: bool,
        dead: bool,
        faulted: bool,
        pending_busy: Cell<u32>,
    }

    impl SimBus {
        pub fn new(geometry: &Geometry) -> Self {
            Self::from_mem(vec![0xFF; geometry.region_size() as usize], geometry)
        }

        /// Rebuilds a bus over surviving memory contents, as after a power
        /// cycle.
        pub fn from_mem(mem: Vec<u8>, geometry: &Geometry) -> Self {
            assert_eq!(mem.len(), geometry.region_size() as usize);
            SimBus {
                mem,
                base: geometry.base,
                block_size: geometry.block_size,
                locked: true,
                programs: 0,
                erases: 0,
                busy_per_op: 2,
                power_cut: None,
                fault_next: false,
                refuse_unlock: false,
                dead: false,
                faulted: false,
                pending_busy: Cell::new(0),
            }
        }

        fn index(&self, addr: u32) -> usize {
            assert_eq!(addr % 2, 0, "unaligned halfword access at {addr:#x}");
            let off = addr.checked_sub(self.base).expect("address below region");
            assert!(off + 2 <= self.mem.len() as u32, "address past region");
            off as usize
        }

        /// Returns true if the operation should proceed; consumes one unit
        /// of remaining power otherwise.
        fn powered(&mut self) -> bool {
            if self.dead {
                return false;
            }
            if let Some(remaining) = self.power_cut {
                if remaining == 0 {
                    self.dead = true;
                    return false;
                }
                self.power_cut = Some(remaining - 1);
            }
            true
        }
    }

    impl FlashBus for SimBus {
        fn read_halfword(&self, addr: u32) -> u16 {
            let i = self.index(addr);
            u16::from_le_bytes([self.mem[i], self.mem[i + 1]])
        }

        fn unlock(&mut self) -> bool {
            if self.refuse_unlock {
                return false;
            }
            self.locked = false;
            self.faulted = false;
            true
        }

        fn lock(&mut self) {
            self.locked = true;
        }

        fn start_erase(&mut self, addr: u32) {
            assert!(!self.locked, "erase while locked");
            assert_eq!(addr % self.block_size, 0, "unaligned erase at {addr:#x}");
            self.pending_busy.set(self.busy_per_op);
            if self.fault_next {
                self.fault_next = false;
                self.faulted = true;
                return;
            }
            if !self.powered() {
                return;
            }
            let i = self.index(addr);
            self.mem[i..i + self.block_size as usize].fill(0xFF);
            self.erases += 1;
        }

        fn start_program(&mut self, addr: u32, value: u16) {
            assert!(!self.locked, "program while locked");
            self.pending_busy.set(self.busy_per_op);
            if self.fault_next {
                self.fault_next = false;
                self.faulted = true;
                return;
            }
            if !self.powered() {
                return;
            }
            let i = self.index(addr);
            let bytes = value.to_le_bytes();
            self.mem[i] &= bytes[0];
            self.mem[i + 1] &= bytes[1];
            self.programs += 1;
        }

        fn busy(&self) -> bool {
            let pending = self.pending_busy.get();
            if pending > 0 {
                self.pending_busy.set(pending - 1);
                true
            } else {
                false
            }
        }

        fn fault(&self) -> bool {
            self.faulted
        }
    }

    fn formatted(geometry: &Geometry) -> SimBus {
        let mut bus = SimBus::new(geometry);
        format(&mut bus, geometry).expect("format should succeed");
        bus
    }

    #[test]
    fn program_verifies_and_relocks() {
        let geo = TEST_GEOMETRY;
        let mut bus = SimBus::new(&geo);
        program_halfword(&mut bus, geo.base, 0xBEEF).expect("program should succeed");
        assert_eq!(bus.read_halfword(geo.base), 0xBEEF);
        assert!(bus.locked);
    }

    #[test]
    fn program_cannot_set_cleared_bits() {
        let geo = TEST_GEOMETRY;
        let mut bus = SimBus::new(&geo);
        program_halfword(&mut bus, geo.base, 0x0000).unwrap();

        let r = program_halfword(&mut bus, geo.base, 0x0001);
        assert_eq!(r, Err(FlashError::WriteVerify));
        assert!(bus.locked);
    }

    #[test]
    fn busy_wait_times_out() {
        let geo = TEST_GEOMETRY;
        let mut bus = SimBus::new(&geo);
        bus.busy_per_op = POLL_LIMIT + 1;
        let r = program_halfword(&mut bus, geo.base, 0x1234);
        assert_eq!(r, Err(FlashError::Timeout));
        assert!(bus.locked);
    }

    #[test]
    fn refused_unlock_reported() {
        let geo = TEST_GEOMETRY;
        let mut bus = SimBus::new(&geo);
        bus.refuse_unlock = true;
        assert_eq!(
            program_halfword(&mut bus, geo.base, 0x1234),
            Err(FlashError::LockFailed)
        );
        assert_eq!(
            erase_block(&mut bus, &geo, geo.base),
            Err(FlashError::LockFailed)
        );
    }

    #[test]
    fn erase_fault_reported() {
        let geo = TEST_GEOMETRY;
        let mut bus = SimBus::new(&geo);
        bus.fault_next = true;
        let r = erase_block(&mut bus, &geo, geo.base);
        assert_eq!(r, Err(FlashError::EraseFailed));
        assert!(bus.locked);
    }

    #[test]
    fn ineffective_erase_fails_blank_check() {
        let geo = TEST_GEOMETRY;
        let mut bus = SimBus::new(&geo);
        program_halfword(&mut bus, geo.base + 10, 0x0000).unwrap();
        // Power dies as the erase is issued; the old data survives.
        bus.power_cut = Some(0);
        let r = erase_block(&mut bus, &geo, geo.base);
        assert_eq!(r, Err(FlashError::EraseVerify));
    }

    #[test]
    fn header_round_trip() {
        let geo = TEST_GEOMETRY;
        let mut bus = SimBus::new(&geo);
        write_header(&mut bus, &geo, 3, 7, BlockStatus::Active).unwrap();

        let header = read_header(&bus, &geo, 3);
        assert!(header.marker_ok());
        assert_eq!(header.sequence, 7);
        assert_eq!(header.status(), Some(BlockStatus::Active));
        assert!(header.holds_live_data());
    }

    #[test]
    fn status_patches_in_place() {
        let geo = TEST_GEOMETRY;
        let mut bus = SimBus::new(&geo);
        write_header(&mut bus, &geo, 0, 9, BlockStatus::Receiving).unwrap();
        program_status(&mut bus, &geo, 0, 9, BlockStatus::Active).unwrap();
        assert_eq!(read_header(&bus, &geo, 0).status(), Some(BlockStatus::Active));

        program_status(&mut bus, &geo, 0, 9, BlockStatus::Obsolete).unwrap();
        let header = read_header(&bus, &geo, 0);
        assert_eq!(header.status(), Some(BlockStatus::Obsolete));
        assert_eq!(header.sequence, 9);
    }

    #[test]
    fn erased_block_has_no_valid_header() {
        let geo = TEST_GEOMETRY;
        let bus = SimBus::new(&geo);
        let header = read_header(&bus, &geo, 0);
        assert!(!header.marker_ok());
        assert_eq!(header.status(), Some(BlockStatus::Empty));
        assert!(!header.holds_live_data());
    }

    #[test]
    fn sequence_compare_wraps() {
        assert_eq!(sequence_compare(1, 0), Ordering::Greater);
        assert_eq!(sequence_compare(0, 1), Ordering::Less);
        assert_eq!(sequence_compare(5, 5), Ordering::Equal);
        // Wrap: 0 is one past 255.
        assert_eq!(sequence_compare(0, 255), Ordering::Greater);
        assert_eq!(sequence_compare(255, 0), Ordering::Less);
        // Half the space away in either direction.
        assert_eq!(sequence_compare(127, 0), Ordering::Greater);
        assert_eq!(sequence_compare(129, 0), Ordering::Less);
    }

    #[test]
    fn format_erases_everything_and_activates_block_zero() {
        let geo = TEST_GEOMETRY;
        let mut bus = SimBus::new(&geo);
        // Scribble over a couple of blocks first.
        program_halfword(&mut bus, geo.block_base(5) + 8, 0x1234).unwrap();
        program_halfword(&mut bus, geo.block_base(9), 0x0000).unwrap();

        format(&mut bus, &geo).expect("format should succeed");

        assert_eq!(bus.erases, geo.block_count);
        assert_eq!(find_active_block(&bus, &geo), Some(0));
        let header = read_header(&bus, &geo, 0);
        assert_eq!(header.sequence, 0);
        assert_eq!(log_tail(&bus, &geo, 0), BlockHeader::SIZE);
        assert_eq!(free_space(&bus, &geo, 0), geo.block_size - BlockHeader::SIZE);
    }

    #[test]
    fn find_active_prefers_highest_sequence() {
        let geo = TEST_GEOMETRY;
        let mut bus = SimBus::new(&geo);
        write_header(&mut bus, &geo, 2, 10, BlockStatus::Active).unwrap();
        write_header(&mut bus, &geo, 7, 11, BlockStatus::Active).unwrap();
        write_header(&mut bus, &geo, 4, 12, BlockStatus::Receiving).unwrap();
        assert_eq!(find_active_block(&bus, &geo), Some(7));
    }

    #[test]
    fn find_active_handles_sequence_wrap() {
        let geo = TEST_GEOMETRY;
        let mut bus = SimBus::new(&geo);
        write_header(&mut bus, &geo, 0, 254, BlockStatus::Active).unwrap();
        write_header(&mut bus, &geo, 1, 0, BlockStatus::Active).unwrap();
        // 0 wrapped past 254/255, so block 1 is newer.
        assert_eq!(find_active_block(&bus, &geo), Some(1));
    }

    fn append(bus: &mut SimBus, geo: &Geometry, block: u32, record: Record) {
        let tail = log_tail(bus, geo, block);
        assert!(tail + RECORD_SIZE <= geo.block_size, "test overfilled block");
        program_halfword(bus, geo.block_base(block) + tail, record.pack()).unwrap();
    }

    #[test]
    fn newest_record_in_block_wins() {
        let geo = TEST_GEOMETRY;
        let mut bus = formatted(&geo);
        append(&mut bus, &geo, 0, Record { id: 1, value: 10 });
        append(&mut bus, &geo, 0, Record { id: 2, value: 20 });
        append(&mut bus, &geo, 0, Record { id: 1, value: 11 });

        let loc = find_record(&bus, &geo, 1).expect("record should exist");
        assert_eq!(loc.record.value, 11);
        assert_eq!(loc.block, 0);
        assert_eq!(find_record(&bus, &geo, 2).unwrap().record.value, 20);
        assert_eq!(find_record(&bus, &geo, 3), None);
    }

    #[test]
    fn newest_block_wins_across_blocks() {
        let geo = TEST_GEOMETRY;
        let mut bus = SimBus::new(&geo);
        write_header(&mut bus, &geo, 0, 4, BlockStatus::Active).unwrap();
        write_header(&mut bus, &geo, 1, 5, BlockStatus::Active).unwrap();
        append(&mut bus, &geo, 0, Record { id: 1, value: 10 });
        append(&mut bus, &geo, 1, Record { id: 1, value: 99 });

        let loc = find_record(&bus, &geo, 1).unwrap();
        assert_eq!(loc.block, 1);
        assert_eq!(loc.record.value, 99);
    }

    #[test]
    fn obsolete_and_receiving_blocks_ignored() {
        let geo = TEST_GEOMETRY;
        let mut bus = SimBus::new(&geo);
        write_header(&mut bus, &geo, 0, 4, BlockStatus::Active).unwrap();
        write_header(&mut bus, &geo, 1, 5, BlockStatus::Receiving).unwrap();
        write_header(&mut bus, &geo, 2, 3, BlockStatus::Obsolete).unwrap();
        append(&mut bus, &geo, 0, Record { id: 1, value: 10 });
        append(&mut bus, &geo, 1, Record { id: 1, value: 50 });
        append(&mut bus, &geo, 2, Record { id: 1, value: 60 });
        append(&mut bus, &geo, 2, Record { id: 9, value: 90 });

        assert_eq!(find_record(&bus, &geo, 1).unwrap().record.value, 10);
        assert_eq!(find_record(&bus, &geo, 9), None);
        assert_eq!(count_live_ids(&bus, &geo, None), 1);
    }

    #[test]
    fn live_count_deduplicates_and_skips() {
        let geo = TEST_GEOMETRY;
        let mut bus = formatted(&geo);
        append(&mut bus, &geo, 0, Record { id: 1, value: 10 });
        append(&mut bus, &geo, 0, Record { id: 2, value: 20 });
        append(&mut bus, &geo, 0, Record { id: 1, value: 11 });

        assert_eq!(count_live_ids(&bus, &geo, None), 2);
        assert_eq!(count_live_ids(&bus, &geo, Some(1)), 1);
        assert_eq!(count_live_ids(&bus, &geo, Some(3)), 2);
    }

    #[test]
    fn delete_invalidates_every_copy() {
        let geo = TEST_GEOMETRY;
        let mut bus = formatted(&geo);
        append(&mut bus, &geo, 0, Record { id: 1, value: 10 });
        append(&mut bus, &geo, 0, Record { id: 1, value: 11 });

        assert_eq!(delete_records(&mut bus, &geo, 1), Ok(true));
        // Neither slot may come back, including the older one.
        assert_eq!(find_record(&bus, &geo, 1), None);
        assert_eq!(count_live_ids(&bus, &geo, None), 0);
        // Values stay in place; only the id bytes were cleared.
        assert_eq!(bus.read_halfword(geo.base + 4), 0x0A00);

        assert_eq!(delete_records(&mut bus, &geo, 1), Ok(false));
    }

    #[test]
    fn compact_preserves_live_records() {
        let geo = TEST_GEOMETRY;
        let mut bus = formatted(&geo);
        for id in 1..=10 {
            append(&mut bus, &geo, 0, Record { id, value: id + 100 });
        }
        // Supersede one and delete another.
        append(&mut bus, &geo, 0, Record { id: 3, value: 33 });
        delete_records(&mut bus, &geo, 7).unwrap();

        let target = compact(&mut bus, &geo, 0, None).expect("compact should succeed");
        assert_eq!(target, 1);

        let header = read_header(&bus, &geo, target);
        assert_eq!(header.sequence, 1);
        assert_eq!(header.status(), Some(BlockStatus::Active));
        assert_eq!(read_header(&bus, &geo, 0).status(), Some(BlockStatus::Obsolete));
        assert_eq!(find_active_block(&bus, &geo), Some(target));

        for id in 1..=10 {
            let found = find_record(&bus, &geo, id);
            match id {
                3 => assert_eq!(found.unwrap().record.value, 33),
                7 => assert_eq!(found, None),
                _ => assert_eq!(found.unwrap().record.value, id + 100),
            }
        }
        // Nine live ids occupy nine slots; superseded and deleted ones are
        // gone.
        assert_eq!(log_tail(&bus, &geo, target), BlockHeader::SIZE + 9 * RECORD_SIZE);
    }

    #[test]
    fn compact_places_fresh_record_first() {
        let geo = TEST_GEOMETRY;
        let mut bus = formatted(&geo);
        append(&mut bus, &geo, 0, Record { id: 1, value: 10 });
        append(&mut bus, &geo, 0, Record { id: 2, value: 20 });

        let target = compact(&mut bus, &geo, 0, Some(Record { id: 1, value: 77 }))
            .expect("compact should succeed");

        let first = Record::unpack(bus.read_halfword(geo.block_base(target) + BlockHeader::SIZE));
        assert_eq!(first, Record { id: 1, value: 77 });
        assert_eq!(find_record(&bus, &geo, 1).unwrap().record.value, 77);
        assert_eq!(find_record(&bus, &geo, 2).unwrap().record.value, 20);
    }

    #[test]
    fn compact_reclaims_stale_active_block() {
        let geo = TWO_BLOCKS;
        let mut bus = SimBus::new(&geo);
        // A power loss after promotion left two Active blocks; block 1 is
        // newer and holds everything block 0 held.
        write_header(&mut bus, &geo, 0, 4, BlockStatus::Active).unwrap();
        append(&mut bus, &geo, 0, Record { id: 1, value: 10 });
        write_header(&mut bus, &geo, 1, 5, BlockStatus::Active).unwrap();
        append(&mut bus, &geo, 1, Record { id: 1, value: 10 });

        let target = compact(&mut bus, &geo, 1, None).expect("compact should succeed");
        assert_eq!(target, 0);
        assert_eq!(find_active_block(&bus, &geo), Some(0));
        assert_eq!(find_record(&bus, &geo, 1).unwrap().record.value, 10);
        assert_eq!(read_header(&bus, &geo, 1).status(), Some(BlockStatus::Obsolete));
    }

    #[test]
    fn compact_cycles_through_region() {
        let geo = TEST_GEOMETRY;
        let mut bus = formatted(&geo);
        append(&mut bus, &geo, 0, Record { id: 1, value: 10 });

        let mut active = 0;
        for round in 1..=(geo.block_count * 2) {
            active = compact(&mut bus, &geo, active, None).unwrap();
            assert_eq!(active, round % geo.block_count);
            assert_eq!(find_record(&bus, &geo, 1).unwrap().record.value, 10);
        }
        // Every block has taken a turn as the target.
        assert!(bus.erases >= geo.block_count);
    }
}
