//! Memory port layer (C2): per-target allocation, execution-mapping setup, and
//! data/exec address translation.
//!
//! Five target families are modeled as distinct [`MemoryPort`] implementations, selected by the
//! host (typically from a [`crate::config::MemoryPortKind`]) rather than by `#[cfg(...)]`, so
//! every family can be exercised from the same host test binary.

mod riscv_split;
mod unified;
mod xtensa_classic;
mod xtensa_fixed;
mod xtensa_mmu;

pub use riscv_split::RiscvSplitBusPort;
pub use unified::UnifiedPort;
pub use xtensa_classic::XtensaClassicPort;
pub use xtensa_fixed::XtensaFixedOffsetPort;
pub use xtensa_mmu::XtensaMmuPort;

use crate::error::Result;

/// Opaque allocation handle for a unified (non-split) region.
///
/// Frees itself on `Drop`, replacing the source's `goto fail`-style manual unwind with scoped
/// ownership: once a region is wrapped here, every exit path (including error paths upstream)
/// releases it automatically.
pub struct Allocation {
	base: Vec<u8>,
	/// Port-specific translation context (e.g. MMU window or fixed offset), as produced by
	/// [`MemoryPort::init_exec_mapping`].
	pub ctx: PortCtx,
	/// Whether this region permits byte-granularity access. `false` marks a word-access-only
	/// executable heap (e.g. Xtensa-classic IRAM): this crate cannot fault a real memory access
	/// on a hosted backend, so the property is exposed as a flag a test can assert on instead.
	pub byte_addressable: bool,
}

impl Allocation {
	fn new(size: usize, byte_addressable: bool) -> Self {
		Self {
			base: vec![0u8; size],
			ctx: PortCtx::default(),
			byte_addressable,
		}
	}

	/// The data-view base address (here: just the backing buffer's address as a `u32`).
	pub fn data_base(&self) -> u32 {
		self.base.as_ptr() as usize as u32
	}

	/// Mutable access to the backing bytes, for segment loading.
	pub fn bytes_mut(&mut self) -> &mut [u8] {
		&mut self.base
	}

	/// Read-only access to the backing bytes.
	pub fn bytes(&self) -> &[u8] {
		&self.base
	}
}

/// A split text/data allocation pair, used by families where `requires_split_alloc() == true`.
pub struct SplitAllocation {
	/// The executable (possibly word-access-only) region.
	pub text: Allocation,
	/// The byte-addressable data region.
	pub data: Allocation,
}

/// Port-specific context produced by [`MemoryPort::init_exec_mapping`] and consumed by
/// [`MemoryPort::to_exec_addr`]; its meaning (MMU window, fixed offset, or nothing) is entirely
/// up to the implementing port.
#[derive(Clone, Copy, Debug, Default)]
pub struct PortCtx {
	/// Constant added to a data-view address to obtain the exec-view address, when the
	/// translation is a simple fixed offset. Ports that need a richer mapping (the MMU family)
	/// still funnel their result through this field once the window is installed.
	pub text_off: i64,
}

/// Allocation-capability hint, passed verbatim from the host to the port. `0` means "the port
/// chooses", matching the source's `heap_caps` convention.
pub type HeapCaps = u32;

/// The memory-port abstraction (C2): everything the loader needs from a specific target family.
pub trait MemoryPort {
	/// Whether this family requires two independent allocations (text, data) rather than one.
	fn requires_split_alloc(&self) -> bool;

	/// Whether this family should be tried against external/SPIRAM first, before falling back
	/// to internal RAM.
	fn prefer_spiram(&self) -> bool;

	/// Whether falling back to internal RAM is acceptable when external RAM is unavailable.
	/// `false` on W^X-protected targets whose internal RAM is not executable.
	fn allow_internal_ram_fallback(&self) -> bool;

	/// Allocates a single unified region of `size` bytes. Only called when
	/// `requires_split_alloc() == false`.
	fn alloc(&self, size: usize, caps: HeapCaps) -> Result<Allocation>;

	/// Allocates independent text/data regions. Only called when `requires_split_alloc() ==
	/// true`. If one allocation succeeds and the other fails, the first is released before
	/// returning `NoMemory`.
	fn alloc_split(&self, text_size: usize, data_size: usize, caps: HeapCaps) -> Result<SplitAllocation>;

	/// Translates a data-view address into the address the CPU must fetch instructions from.
	fn to_exec_addr(&self, ctx: &PortCtx, data_addr: u32) -> u32;

	/// The fixed instruction-bus/data-bus offset this target's RISC-V relocator must subtract
	/// when computing `PCREL_HI20` immediates and patching `.plt` AUIPCs (`IRAM_DRAM_OFFSET`
	/// in §4.3.2). `0` on every family without a split I/D bus; only
	/// [`RiscvSplitBusPort`] overrides this.
	fn iram_dram_offset(&self) -> i64 {
		0
	}

	/// Synchronizes the instruction cache so the CPU observes just-written code at `[base,
	/// base+size)`. A hosted/simulated port has nothing to flush and returns `Ok(())`.
	fn sync_cache(&self, base: u32, size: usize) -> Result<()> {
		let _ = (base, size);
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn allocation_data_base_matches_backing_buffer() {
		let port = UnifiedPort::default();
		let alloc = port.alloc(64, 0).unwrap();
		assert_eq!(alloc.bytes().len(), 64);
	}
}
