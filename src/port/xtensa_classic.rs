//! F-Xtensa-classic: small internal RAM split between a word-access-only executable heap
//! (IRAM, 0x4008xxxx-class) and a byte-addressable, non-executable heap (DRAM, 0x3FFBxxxx-class).
//! Grounded on the original `elf_loader_mem_port_esp32.c`: text and data must be allocated
//! independently, and no address translation is needed since text is used directly.

use super::{Allocation, HeapCaps, MemoryPort, PortCtx, SplitAllocation};
use crate::error::{LoaderError, Result};

/// Memory port for targets requiring split text/data allocation with no address translation.
#[derive(Default)]
pub struct XtensaClassicPort;

impl MemoryPort for XtensaClassicPort {
	fn requires_split_alloc(&self) -> bool {
		true
	}

	fn prefer_spiram(&self) -> bool {
		false
	}

	fn allow_internal_ram_fallback(&self) -> bool {
		true
	}

	fn alloc(&self, _size: usize, _caps: HeapCaps) -> Result<Allocation> {
		Err(LoaderError::NotSupported(
			"this target requires split allocation, unified alloc is not supported",
		))
	}

	fn alloc_split(&self, text_size: usize, data_size: usize, _caps: HeapCaps) -> Result<SplitAllocation> {
		if text_size == 0 && data_size == 0 {
			return Err(LoaderError::InvalidArgument("zero-sized split allocation"));
		}
		let text = Allocation::new(text_size, false);
		let data = Allocation::new(data_size, true);
		Ok(SplitAllocation { text, data })
	}

	fn to_exec_addr(&self, _ctx: &PortCtx, data_addr: u32) -> u32 {
		data_addr
	}
}
