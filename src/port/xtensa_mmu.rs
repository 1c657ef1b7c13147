//! F-Xtensa-MMU: external RAM mapped into the instruction bus through per-64KiB-page MMU
//! entries (ESP32-S2-class targets). Grounded on the original `elf_loader_mem_port_esp32s2.c`:
//! finding a run of free entries, installing them under a critical section, and recording the
//! resulting `(mmu_off, mmu_num, text_off)` triple.

use super::{Allocation, HeapCaps, MemoryPort, PortCtx, SplitAllocation};
use crate::error::{LoaderError, Result};
use std::sync::Mutex;

/// Marks an MMU entry as unmapped.
const MMU_INVALID: u32 = 1 << 14;
/// Size, in bytes, of one MMU page.
const MMU_UNIT_SIZE: u32 = 0x1_0000;
/// First entry index this port is allowed to use; lower entries are reserved by the platform.
const MMU_IBUS_START_OFF: usize = 8;
/// Marker bit ORed into an installed entry's physical page number.
const SOC_MMU_ACCESS_SPIRAM: u32 = 1 << 15;

/// Memory port for targets using MMU-based instruction-bus aliasing of external RAM.
pub struct XtensaMmuPort {
	/// Base address of the simulated external-RAM region this port allocates from.
	pub psram_base: u32,
	/// The MMU entry table, shared across allocations on this port instance.
	table: Mutex<Vec<u32>>,
}

impl Default for XtensaMmuPort {
	fn default() -> Self {
		Self {
			psram_base: 0x3D00_0000,
			table: Mutex::new(vec![MMU_INVALID; 64]),
		}
	}
}

/// Disables interrupts and the sibling CPU's cache for the duration of an MMU table edit.
///
/// On a hosted backend there is no interrupt controller to mask; the guard instead holds the
/// table's mutex, which gives the same "no concurrent observer of a half-edited table" property
/// this crate actually needs, while documenting the real critical section a bare-metal port
/// would take here.
struct CriticalSection<'a> {
	table: std::sync::MutexGuard<'a, Vec<u32>>,
}

impl<'a> std::ops::Deref for CriticalSection<'a> {
	type Target = Vec<u32>;
	fn deref(&self) -> &Vec<u32> {
		&self.table
	}
}

impl<'a> std::ops::DerefMut for CriticalSection<'a> {
	fn deref_mut(&mut self) -> &mut Vec<u32> {
		&mut self.table
	}
}

impl XtensaMmuPort {
	fn dbus_secs(&self, data_addr: u32) -> u32 {
		data_addr.saturating_sub(self.psram_base) / MMU_UNIT_SIZE
	}

	fn find_free_window(table: &[u32], count: usize) -> Option<usize> {
		if count == 0 || MMU_IBUS_START_OFF + count > table.len() {
			return None;
		}
		(MMU_IBUS_START_OFF..=table.len() - count)
			.find(|&start| table[start..start + count].iter().all(|&e| e == MMU_INVALID))
	}
}

impl MemoryPort for XtensaMmuPort {
	fn requires_split_alloc(&self) -> bool {
		false
	}

	fn prefer_spiram(&self) -> bool {
		true
	}

	fn allow_internal_ram_fallback(&self) -> bool {
		true
	}

	fn alloc(&self, size: usize, _caps: HeapCaps) -> Result<Allocation> {
		if size == 0 {
			return Err(LoaderError::InvalidArgument("zero-sized allocation"));
		}
		let mut alloc = Allocation::new(size, true);
		let ibus_secs = (size as u32).div_ceil(MMU_UNIT_SIZE) as usize;

		let data_addr = alloc.data_base();
		let dbus_secs = self.dbus_secs(data_addr);

		let mut cs = CriticalSection {
			table: self.table.lock().unwrap(),
		};
		let start = Self::find_free_window(&cs, ibus_secs)
			.ok_or(LoaderError::NoMemory("no free MMU window of required size"))?;
		for (k, entry) in cs[start..start + ibus_secs].iter_mut().enumerate() {
			*entry = SOC_MMU_ACCESS_SPIRAM | (dbus_secs + k as u32);
		}
		drop(cs);

		let mapped_addr = self.psram_base + (start as u32) * MMU_UNIT_SIZE;
		let aligned_data_base = data_addr - (data_addr % MMU_UNIT_SIZE);
		alloc.ctx.text_off = mapped_addr as i64 - aligned_data_base as i64;
		Ok(alloc)
	}

	fn alloc_split(&self, _text_size: usize, _data_size: usize, _caps: HeapCaps) -> Result<SplitAllocation> {
		Err(LoaderError::NotSupported("MMU port does not split allocate"))
	}

	fn to_exec_addr(&self, ctx: &PortCtx, data_addr: u32) -> u32 {
		(data_addr as i64 + ctx.text_off) as u32
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn alloc_installs_consecutive_entries_starting_past_reserved_range() {
		let port = XtensaMmuPort::default();
		let alloc = port.alloc(MMU_UNIT_SIZE as usize, 0).unwrap();
		let table = port.table.lock().unwrap();
		assert!(table[..MMU_IBUS_START_OFF].iter().all(|&e| e == MMU_INVALID));
		assert_ne!(table[MMU_IBUS_START_OFF], MMU_INVALID);
		drop(table);
		assert_ne!(alloc.ctx.text_off, 0);
	}

	#[test]
	fn no_memory_when_window_exhausted() {
		let port = XtensaMmuPort::default();
		// Exhaust every usable entry with one huge allocation.
		let huge = ((port.table.lock().unwrap().len() - MMU_IBUS_START_OFF) as u32) * MMU_UNIT_SIZE;
		let _first = port.alloc(huge as usize, 0).unwrap();
		let err = port.alloc(MMU_UNIT_SIZE as usize, 0).unwrap_err();
		assert_eq!(err.kind(), crate::error::ErrorKind::NoMemory);
	}
}
