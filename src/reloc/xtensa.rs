//! Xtensa relocations (ESP32/ESP32-S2/ESP32-S3-class targets). Grounded on the original
//! `elf_loader_reloc_xtensa.c`.

use super::{LoadBase, Memory, Relocator};
use crate::elf::reader::ElfReader;
use crate::error::Result;
use log::warn;

const R_XTENSA_NONE: u32 = 0;
const R_XTENSA_32: u32 = 1;
const R_XTENSA_RTLD: u32 = 2;
const R_XTENSA_JMP_SLOT: u32 = 4;
const R_XTENSA_RELATIVE: u32 = 5;
const R_XTENSA_PLT: u32 = 6;
const R_XTENSA_SLOT0_OP: u32 = 20;

/// Xtensa instruction op0 fields recognized by [`reencode_slot0_op`].
const OP0_L32R: u8 = 0x01;
const OP0_CALLN: u8 = 0x05;
const OP0_J: u8 = 0x06;

/// Relocation back-end for Xtensa.
pub struct XtensaRelocator;

impl Relocator for XtensaRelocator {
	fn post_load(&self, _reader: &ElfReader, _mem: &mut Memory, _load_base: LoadBase) -> Result<()> {
		// No architecture-specific post-load fixups on Xtensa.
		Ok(())
	}

	fn apply_relocations(&self, reader: &ElfReader, mem: &mut Memory, load_base: LoadBase) -> Result<()> {
		for rela in reader.iter_rela() {
			let offset = rela.rela.r_offset;
			let ty = crate::elf::RelInfo::r#type(&rela.rela);
			let addend = rela.rela.r_addend as u32;

			if !mem.in_range(offset) {
				continue;
			}

			match ty {
				R_XTENSA_NONE | R_XTENSA_RTLD => {}

				R_XTENSA_RELATIVE => {
					let result = mem.vma_to_ram(addend, load_base.text, load_base.data, load_base.unified);
					mem.write_u32(offset, result);
				}

				R_XTENSA_32 => {
					let sym_val = reader.rela_symbol(&rela).map(|s| s.sym.st_value).unwrap_or(0);
					let target = sym_val.wrapping_add(addend);
					let result = mem.vma_to_ram(target, load_base.text, load_base.data, load_base.unified);
					mem.write_u32(offset, result);
				}

				R_XTENSA_JMP_SLOT | R_XTENSA_PLT => {
					let sym_val = reader.rela_symbol(&rela).map(|s| s.sym.st_value).unwrap_or(0);
					if sym_val != 0 {
						mem.write_u32(offset, sym_val);
					} else {
						let name = reader.rela_symbol(&rela).map(|s| reader.symbol_name(&s)).unwrap_or_default();
						warn!("unresolved external symbol '{name}' at offset 0x{offset:x}");
					}
				}

				R_XTENSA_SLOT0_OP => {
					// VMA layout is preserved within a region by the linker, so PC-relative
					// L32R/CALLn/J encodings already point at the right place; skip.
				}

				other => warn!("unknown Xtensa relocation type {other} at offset 0x{offset:x}"),
			}
		}
		Ok(())
	}
}

/// Re-encodes the PC-relative immediate of an L32R/CALLn/J instruction so it still targets
/// `sym_addr` after a layout-changing relocation.
///
/// Not invoked by [`XtensaRelocator::apply_relocations`] today: the loader preserves the
/// linker's VMA layout within each region, so `R_XTENSA_SLOT0_OP` entries are always skipped
/// (§4.3.1, §9 open question 3). Kept for a future compact-layout mode that re-packs sections
/// and would need to re-point these encodings.
pub fn reencode_slot0_op(location: &mut [u8], rel_addr: u32, sym_addr: u32) -> Result<()> {
	let instr = location[0] as u32 | (location[1] as u32) << 8 | (location[2] as u32) << 16;
	let op0 = (instr & 0x0f) as u8;

	let encoded = match op0 {
		OP0_L32R => {
			let aligned_pc = (rel_addr.wrapping_add(3)) & !3;
			let delta = sym_addr.wrapping_sub(aligned_pc) as i32;
			if delta & 0x3 != 0 {
				return Err(crate::error::LoaderError::InvalidArgument("L32R target not 4-byte aligned"));
			}
			let delta = delta >> 2;
			if !(-32768..=32767).contains(&delta) {
				return Err(crate::error::LoaderError::InvalidSize("L32R offset out of range"));
			}
			(instr & 0xff) | ((delta as u32 & 0xffff) << 8)
		}
		OP0_CALLN => {
			let delta = sym_addr.wrapping_sub((rel_addr.wrapping_add(4)) & !3) as i32;
			if !(-524288..=524284).contains(&delta) || delta & 0x3 != 0 {
				return Err(crate::error::LoaderError::InvalidSize("CALLn offset out of range or misaligned"));
			}
			(instr & 0x3f) | (((delta >> 2) as u32 & 0x3ffff) << 6)
		}
		OP0_J => {
			let delta = sym_addr.wrapping_sub(rel_addr.wrapping_add(4)) as i32;
			if !(-131072..=131071).contains(&delta) {
				return Err(crate::error::LoaderError::InvalidSize("J offset out of range"));
			}
			(instr & 0x3f) | ((delta as u32 & 0x3ffff) << 6)
		}
		_ => return Err(crate::error::LoaderError::NotSupported("unsupported SLOT0_OP opcode")),
	};

	location[0] = (encoded & 0xff) as u8;
	location[1] = ((encoded >> 8) & 0xff) as u8;
	location[2] = ((encoded >> 16) & 0xff) as u8;
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn reencode_j_targets_forward_offset() {
		// J encodes op0=0x6 in the low nibble; start from an all-zero instruction.
		let mut location = [0x06u8, 0x00, 0x00];
		reencode_slot0_op(&mut location, 0x1000, 0x1010).unwrap();
		let instr = location[0] as u32 | (location[1] as u32) << 8 | (location[2] as u32) << 16;
		assert_eq!(instr & 0x3f, 0x06);
		let delta = (instr >> 6) as i32;
		// 18-bit sign-extend
		let delta = (delta << 14) >> 14;
		assert_eq!(delta, 0x1010 - (0x1000 + 4));
	}

	#[test]
	fn reencode_rejects_unsupported_opcode() {
		let mut location = [0x0fu8, 0x00, 0x00];
		assert!(reencode_slot0_op(&mut location, 0, 0).is_err());
	}
}
