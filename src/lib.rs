// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A tiny wear-leveled key-value store for byte-sized settings kept in
//! on-chip flash, for parts that have no EEPROM of their own.
//!
//! The reserved flash region is divided into erasable blocks. At any time
//! one block is Active and holds an append-only log of two-byte records.
//! Updating a key appends a new record; the newest one wins. When the
//! Active block fills up, the live records migrate to the next block in
//! the region, which levels erase wear across all blocks and reclaims the
//! space taken by superseded records.
//!
//! Entry point is [`mount`], which takes ownership of a [`FlashBus`]
//! implementation and hands back a [`Store`] once the region has been
//! validated (formatting it on first boot). All store operations then go
//! through the `Store` handle.

#![cfg_attr(not(test), no_std)]

pub mod low_level;

pub use low_level::{Error, FlashBus, FlashError, Geometry};

use low_level::Record;

/// A mounted store. Owns the flash bus; exactly one live `Store` per
/// region means the cached active-block index cannot go stale.
pub struct Store<B: FlashBus> {
    bus: B,
    geometry: Geometry,
    active: u32,
}

/// Point-in-time occupancy summary, as returned by [`Store::status`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct StoreStatus {
    /// Number of distinct live keys.
    pub live_records: u32,
    /// Bytes still appendable in the active block before the next write
    /// triggers a compaction.
    pub free_bytes: u32,
}

/// Takes ownership of `bus` and prepares the region for use.
///
/// Validates the geometry, then looks for an Active block. If none exists
/// (first boot, or every header was damaged) the region is formatted,
/// which is destructive by definition but only discards data that was
/// already unreachable.
///
/// On error the bus rides along in the `MountError` so the caller can
/// retry or repurpose it.
pub fn mount<B: FlashBus>(mut bus: B, geometry: Geometry) -> Result<Store<B>, MountError<B>> {
    match mount_inner(&mut bus, &geometry) {
        Ok(active) => Ok(Store {
            bus,
            geometry,
            active,
        }),
        Err(cause) => Err(MountError { bus, cause }),
    }
}

fn mount_inner<B: FlashBus>(
    bus: &mut B,
    geometry: &Geometry,
) -> Result<u32, MountErrorCause> {
    if !geometry.check() {
        return Err(MountErrorCause::BadGeometry);
    }

    if let Some(active) = low_level::find_active_block(bus, geometry) {
        #[cfg(feature = "defmt")]
        defmt::trace!("mount: active block {}", active);
        return Ok(active);
    }

    #[cfg(feature = "defmt")]
    defmt::trace!("mount: no active block, formatting");
    low_level::format(bus, geometry).map_err(MountErrorCause::Format)?;
    Ok(0)
}

/// Mount failure, carrying the bus back to the caller.
pub struct MountError<B: FlashBus> {
    bus: B,
    cause: MountErrorCause,
}

impl<B: FlashBus> MountError<B> {
    pub fn into_inner(self) -> B {
        self.bus
    }

    pub fn cause(&self) -> &MountErrorCause {
        &self.cause
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MountErrorCause {
    /// The geometry failed validation; see `Geometry::check`.
    BadGeometry,
    /// No Active block was found and the recovery format failed.
    Format(Error),
}

/// Rejects the two id values that collide with slot sentinels.
fn check_id(id: u8) -> Result<(), Error> {
    if id == low_level::ID_DELETED || id == low_level::ID_ERASED {
        return Err(Error::InvalidId);
    }
    Ok(())
}

impl<B: FlashBus> Store<B> {
    /// Reads the current value for `id`.
    pub fn get(&self, id: u8) -> Result<u8, Error> {
        check_id(id)?;
        low_level::find_record(&self.bus, &self.geometry, id)
            .map(|loc| loc.record.value)
            .ok_or(Error::NotFound)
    }

    /// Writes `value` for `id`.
    ///
    /// Writing the value a key already holds is a no-op; the flash is not
    /// touched. Otherwise a fresh record is appended to the active block,
    /// or, if the block is full, the write rides along with a compaction
    /// into the next block.
    pub fn set(&mut self, id: u8, value: u8) -> Result<(), Error> {
        check_id(id)?;

        let existing = low_level::find_record(&self.bus, &self.geometry, id);
        if let Some(loc) = &existing {
            if loc.record.value == value {
                return Ok(());
            }
        }

        let record = Record { id, value };
        let tail = low_level::log_tail(&self.bus, &self.geometry, self.active);
        if tail + low_level::RECORD_SIZE <= self.geometry.block_size {
            let addr = self.geometry.block_base(self.active) + tail;
            low_level::program_halfword(&mut self.bus, addr, record.pack())?;
            return Ok(());
        }

        // Active block full. Refuse before compacting if the live set
        // (with this key's old record dropped) cannot fit alongside the
        // new record; compaction would not help and churns an erase.
        let live = low_level::count_live_ids(&self.bus, &self.geometry, Some(id));
        if live + 1 > self.geometry.slots_per_block() {
            return Err(Error::StorageFull);
        }

        self.active =
            low_level::compact(&mut self.bus, &self.geometry, self.active, Some(record))?;
        Ok(())
    }

    /// Removes `id` from the store. `NotFound` if it has no record.
    ///
    /// Deletion costs no log space; the records' id bytes are cleared in
    /// place and the slots are reclaimed at the next compaction.
    pub fn delete(&mut self, id: u8) -> Result<(), Error> {
        check_id(id)?;
        if low_level::delete_records(&mut self.bus, &self.geometry, id)? {
            Ok(())
        } else {
            Err(Error::NotFound)
        }
    }

    /// Whether `id` currently has a value.
    pub fn exists(&self, id: u8) -> Result<bool, Error> {
        check_id(id)?;
        Ok(low_level::find_record(&self.bus, &self.geometry, id).is_some())
    }

    /// Reads `id`, or persists and returns `default` if it has no record.
    ///
    /// This is the boot-time self-heal idiom for settings: a missing or
    /// deleted setting silently comes back at its default instead of
    /// leaving the caller with an error to handle.
    pub fn get_or_init(&mut self, id: u8, default: u8) -> Result<u8, Error> {
        match self.get(id) {
            Ok(value) => Ok(value),
            Err(Error::NotFound) => {
                self.set(id, default)?;
                Ok(default)
            }
            Err(e) => Err(e),
        }
    }

    /// Occupancy summary: distinct live keys and free bytes in the active
    /// block.
    pub fn status(&self) -> StoreStatus {
        StoreStatus {
            live_records: low_level::count_live_ids(&self.bus, &self.geometry, None),
            free_bytes: low_level::free_space(&self.bus, &self.geometry, self.active),
        }
    }

    /// Erases the whole region and starts over empty. All keys are lost.
    pub fn format(&mut self) -> Result<(), Error> {
        low_level::format(&mut self.bus, &self.geometry)?;
        self.active = 0;
        Ok(())
    }

    /// Forces a compaction cycle, migrating live records to the next
    /// block. Normally this happens on demand inside [`Store::set`]; the
    /// explicit form exists for maintenance tooling.
    pub fn compact(&mut self) -> Result<(), Error> {
        self.active = low_level::compact(&mut self.bus, &self.geometry, self.active, None)?;
        Ok(())
    }

    /// Index of the block currently holding the log.
    pub fn active_block(&self) -> u32 {
        self.active
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    /// Unmounts, handing the bus back.
    pub fn into_bus(self) -> B {
        self.bus
    }
}
