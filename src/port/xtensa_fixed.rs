//! F-Xtensa-fixed-offset: external PSRAM reached through a fixed instruction/data bus offset,
//! no MMU configuration required. Grounded on the original `elf_loader_mem_port_esp32s3.c`:
//! `PSRAM_ID_OFFSET = SOC_IROM_LOW - SOC_DROM_LOW`, with a second fixed offset
//! (`SOC_I_D_OFFSET`) for allocations that land in internal D/IRAM instead of PSRAM.

use super::{Allocation, HeapCaps, MemoryPort, PortCtx, SplitAllocation};
use crate::error::{LoaderError, Result};

/// Memory port for targets with a fixed PSRAM instruction/data bus offset.
pub struct XtensaFixedOffsetPort {
	/// Start of the PSRAM data-bus address range (`SOC_DROM_LOW`).
	pub psram_drom_low: u32,
	/// End (exclusive) of the PSRAM data-bus address range (`SOC_DROM_HIGH`).
	pub psram_drom_high: u32,
	/// Fixed offset from the PSRAM data bus to the PSRAM instruction bus
	/// (`SOC_IROM_LOW - SOC_DROM_LOW`).
	pub psram_id_offset: u32,
	/// Fixed offset from internal DRAM to internal IRAM (`SOC_I_D_OFFSET`).
	pub internal_i_d_offset: u32,
	/// Whether PSRAM is initialized on this run; mirrors `esp_psram_is_initialized()`.
	pub psram_initialized: bool,
	/// Whether memory protection forbids falling back to internal RAM for code.
	pub memprot_enabled: bool,
}

impl Default for XtensaFixedOffsetPort {
	fn default() -> Self {
		Self {
			psram_drom_low: 0x3C00_0000,
			psram_drom_high: 0x3E00_0000,
			psram_id_offset: 0x0600_0000,
			internal_i_d_offset: 0x6000_0000,
			psram_initialized: true,
			memprot_enabled: true,
		}
	}
}

impl XtensaFixedOffsetPort {
	fn is_psram_addr(&self, addr: u32) -> bool {
		addr >= self.psram_drom_low && addr < self.psram_drom_high
	}
}

impl MemoryPort for XtensaFixedOffsetPort {
	fn requires_split_alloc(&self) -> bool {
		false
	}

	fn prefer_spiram(&self) -> bool {
		self.psram_initialized
	}

	fn allow_internal_ram_fallback(&self) -> bool {
		!self.memprot_enabled
	}

	fn alloc(&self, size: usize, _caps: HeapCaps) -> Result<Allocation> {
		if size == 0 {
			return Err(LoaderError::InvalidArgument("zero-sized allocation"));
		}
		let mut alloc = Allocation::new(size, true);
		let addr = alloc.data_base();
		alloc.ctx.text_off = if self.is_psram_addr(addr) {
			self.psram_id_offset as i64
		} else {
			self.internal_i_d_offset as i64
		};
		Ok(alloc)
	}

	fn alloc_split(&self, _text_size: usize, _data_size: usize, _caps: HeapCaps) -> Result<SplitAllocation> {
		Err(LoaderError::NotSupported("fixed-offset port does not split allocate"))
	}

	fn to_exec_addr(&self, ctx: &PortCtx, data_addr: u32) -> u32 {
		if self.is_psram_addr(data_addr) {
			data_addr.wrapping_add(self.psram_id_offset)
		} else {
			data_addr.wrapping_add(ctx.text_off as u32)
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn internal_ram_gets_internal_offset() {
		let port = XtensaFixedOffsetPort::default();
		let alloc = port.alloc(64, 0).unwrap();
		// the hosted heap never lands in the simulated PSRAM range
		assert_eq!(alloc.ctx.text_off, port.internal_i_d_offset as i64);
	}

	#[test]
	fn psram_translation_adds_fixed_offset() {
		let port = XtensaFixedOffsetPort::default();
		let ctx = PortCtx::default();
		let psram_addr = port.psram_drom_low + 0x10;
		assert_eq!(
			port.to_exec_addr(&ctx, psram_addr),
			psram_addr + port.psram_id_offset
		);
	}
}
