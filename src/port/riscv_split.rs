//! F-RISC-V-split-bus: RISC-V targets with separate I-bus and D-bus address spaces joined by a
//! fixed compile-time offset. Grounded on the original `elf_loader_mem_port_riscv_id.c`: unified
//! allocation (`requires_split_alloc() == false`), identity data view, `to_exec_addr` adds the
//! fixed `SOC_I_D_OFFSET`.

use super::{Allocation, HeapCaps, MemoryPort, PortCtx, SplitAllocation};
use crate::error::{LoaderError, Result};

/// Memory port for RISC-V targets with a fixed I/D bus address offset.
pub struct RiscvSplitBusPort {
	/// Fixed offset from the data bus to the instruction bus (`SOC_I_D_OFFSET`).
	pub i_d_offset: u32,
	/// Whether memory protection forbids executing out of internal RAM directly.
	pub memprot_enabled: bool,
}

impl Default for RiscvSplitBusPort {
	fn default() -> Self {
		Self {
			i_d_offset: 0x0400_0000,
			memprot_enabled: false,
		}
	}
}

impl MemoryPort for RiscvSplitBusPort {
	fn requires_split_alloc(&self) -> bool {
		false
	}

	fn prefer_spiram(&self) -> bool {
		false
	}

	fn allow_internal_ram_fallback(&self) -> bool {
		!self.memprot_enabled
	}

	fn alloc(&self, size: usize, _caps: HeapCaps) -> Result<Allocation> {
		if size == 0 {
			return Err(LoaderError::InvalidArgument("zero-sized allocation"));
		}
		Ok(Allocation::new(size, true))
	}

	fn alloc_split(&self, _text_size: usize, _data_size: usize, _caps: HeapCaps) -> Result<SplitAllocation> {
		Err(LoaderError::NotSupported(
			"RISC-V split-bus port uses unified allocation with address translation",
		))
	}

	fn to_exec_addr(&self, _ctx: &PortCtx, data_addr: u32) -> u32 {
		data_addr.wrapping_add(self.i_d_offset)
	}

	fn iram_dram_offset(&self) -> i64 {
		self.i_d_offset as i64
	}
}
