//! Relocation engine (C3): architecture-aware RELA patching.
//!
//! Two back-ends (Xtensa, RISC-V) implement [`Relocator`], dispatched once at loader
//! construction by inspecting `e_machine` (§9 REDESIGN FLAGS: "architecture-split compilation"
//! becomes runtime trait dispatch instead of the source's build-time `#ifdef`).

mod riscv;
mod xtensa;

pub use riscv::RiscvRelocator;
pub use xtensa::XtensaRelocator;

use crate::elf::{reader::ElfReader, EM_RISCV, EM_XTENSA};
use crate::error::{LoaderError, Result};
use crate::port::MemoryPort;

/// The loaded image's memory, as seen by the relocation engine: either one unified region or
/// two independent text/data regions, each addressable by VMA range.
///
/// This replaces the source's raw `(ram_base, load_base, vma_base, ram_size, mem_ctx)` tuple
/// with a single value that knows how to route a VMA to the right backing slice.
pub enum Memory<'a> {
	/// Unified allocation: one region, one VMA range.
	Unified {
		/// Low end (inclusive) of the region's VMA range.
		vma_lo: u32,
		/// High end (exclusive) of the region's VMA range.
		vma_hi: u32,
		/// The region's backing bytes.
		bytes: &'a mut [u8],
	},
	/// Split allocation: independent text and data regions.
	Split {
		/// Low end (inclusive) of the text region's VMA range.
		text_vma_lo: u32,
		/// High end (exclusive) of the text region's VMA range.
		text_vma_hi: u32,
		/// The text region's backing bytes.
		text: &'a mut [u8],
		/// Low end (inclusive) of the data region's VMA range.
		data_vma_lo: u32,
		/// High end (exclusive) of the data region's VMA range.
		data_vma_hi: u32,
		/// The data region's backing bytes.
		data: &'a mut [u8],
	},
}

impl<'a> Memory<'a> {
	/// Tells whether `vma` falls inside any region this value covers.
	pub fn in_range(&self, vma: u32) -> bool {
		match self {
			Self::Unified { vma_lo, vma_hi, .. } => vma >= *vma_lo && vma < *vma_hi,
			Self::Split {
				text_vma_lo,
				text_vma_hi,
				data_vma_lo,
				data_vma_hi,
				..
			} => (vma >= *text_vma_lo && vma < *text_vma_hi) || (vma >= *data_vma_lo && vma < *data_vma_hi),
		}
	}

	/// Tells whether `vma` falls inside the text region (or, in unified mode, always true:
	/// there is only one region and PC-relative encodings address it uniformly).
	pub fn in_text(&self, vma: u32) -> bool {
		match self {
			Self::Unified { .. } => true,
			Self::Split {
				text_vma_lo, text_vma_hi, ..
			} => vma >= *text_vma_lo && vma < *text_vma_hi,
		}
	}

	fn region_mut(&mut self, vma: u32) -> Option<(u32, &mut [u8])> {
		match self {
			Self::Unified { vma_lo, vma_hi, bytes } => {
				(vma >= *vma_lo && vma < *vma_hi).then_some((*vma_lo, &mut **bytes))
			}
			Self::Split {
				text_vma_lo,
				text_vma_hi,
				text,
				data_vma_lo,
				data_vma_hi,
				data,
			} => {
				if vma >= *text_vma_lo && vma < *text_vma_hi {
					Some((*text_vma_lo, &mut **text))
				} else if vma >= *data_vma_lo && vma < *data_vma_hi {
					Some((*data_vma_lo, &mut **data))
				} else {
					None
				}
			}
		}
	}

	/// Writes a 32-bit little-endian word at `vma`. Returns `false` (without panicking or
	/// erroring) if `vma` is outside every region this value covers; callers skip the entry.
	pub fn write_u32(&mut self, vma: u32, value: u32) -> bool {
		let Some((region_lo, bytes)) = self.region_mut(vma) else {
			return false;
		};
		let off = (vma - region_lo) as usize;
		let Some(slot) = bytes.get_mut(off..off + 4) else {
			return false;
		};
		slot.copy_from_slice(&value.to_le_bytes());
		true
	}

	/// Reads a 32-bit little-endian word at `vma`, or `None` if out of range.
	pub fn read_u32(&mut self, vma: u32) -> Option<u32> {
		let (region_lo, bytes) = self.region_mut(vma)?;
		let off = (vma - region_lo) as usize;
		let slot = bytes.get(off..off + 4)?;
		Some(u32::from_le_bytes(slot.try_into().unwrap()))
	}

	/// Borrows a `len`-byte window starting at `vma`, for section-level fixups (e.g. walking
	/// `.plt` entries). `None` if the window does not fit entirely in one region.
	pub fn window_mut(&mut self, vma: u32, len: u32) -> Option<&mut [u8]> {
		let (region_lo, bytes) = self.region_mut(vma)?;
		let off = (vma - region_lo) as usize;
		bytes.get_mut(off..off + len as usize)
	}

	/// Computes the RAM address this VMA loads to, without requiring a full word read/write
	/// (used by relocations whose *value* is itself a translated VMA, e.g. `R_XTENSA_RELATIVE`).
	pub fn vma_to_ram(&self, vma: u32, text_load_base: i64, data_load_base: i64, unified_load_base: i64) -> u32 {
		let base = match self {
			Self::Unified { .. } => unified_load_base,
			Self::Split { .. } => {
				if self.in_text(vma) {
					text_load_base
				} else {
					data_load_base
				}
			}
		};
		(vma as i64 + base) as u32
	}
}

/// Architecture-specific relocation back-end.
pub trait Relocator {
	/// Runs before `apply_relocations`: architecture-specific fixups that must see the image
	/// before relocations are patched in (RISC-V's `.plt` AUIPC adjustment for a nonzero
	/// instruction/data bus offset; a no-op for Xtensa).
	fn post_load(&self, reader: &ElfReader, mem: &mut Memory, load_base: LoadBase) -> Result<()>;

	/// Walks every RELA entry and patches `mem` in place, per the relocation-type tables of
	/// §4.3. Entries whose `offset` falls outside the loaded VMA range are skipped without
	/// error; unresolved external symbols and unknown types are logged as warnings, not errors.
	fn apply_relocations(&self, reader: &ElfReader, mem: &mut Memory, load_base: LoadBase) -> Result<()>;
}

/// The load-base constants needed to translate a VMA to a RAM address, threaded through from
/// the loader core (C4) rather than recomputed here.
#[derive(Clone, Copy, Debug, Default)]
pub struct LoadBase {
	/// `ram_base - vma_base`, valid only in unified mode.
	pub unified: i64,
	/// `text_base - text_vma_lo`, valid only in split mode.
	pub text: i64,
	/// `data_base - data_vma_lo`, valid only in split mode.
	pub data: i64,
}

/// Selects the relocator for an ELF image's `e_machine`, per §9's "architecture-split
/// compilation → runtime trait dispatch" redesign note.
pub fn for_machine(e_machine: u16, port: &dyn MemoryPort) -> Result<Box<dyn Relocator>> {
	match e_machine {
		EM_XTENSA => Ok(Box::new(XtensaRelocator)),
		EM_RISCV => Ok(Box::new(RiscvRelocator::new(port.iram_dram_offset()))),
		_ => Err(LoaderError::NotSupported("unsupported e_machine for relocation")),
	}
}
