//! RISC-V relocations (ESP32-C2/C3/C6/H2/P4-class targets). Grounded on the original
//! `elf_loader_reloc_riscv.c`.

use super::{LoadBase, Memory, Relocator};
use crate::elf::reader::ElfReader;
use crate::error::Result;
use log::warn;

const R_RISCV_NONE: u32 = 0;
const R_RISCV_32: u32 = 1;
const R_RISCV_RELATIVE: u32 = 3;
const R_RISCV_JUMP_SLOT: u32 = 5;
const R_RISCV_PCREL_HI20: u32 = 23;
const R_RISCV_PCREL_LO12_I: u32 = 24;
const R_RISCV_PCREL_LO12_S: u32 = 25;
const R_RISCV_HI20: u32 = 26;
const R_RISCV_LO12_I: u32 = 27;
const R_RISCV_LO12_S: u32 = 28;
const R_RISCV_ADD32: u32 = 35;
const R_RISCV_SUB6: u32 = 37;
const R_RISCV_RVC_BRANCH: u32 = 44;
const R_RISCV_RVC_JUMP: u32 = 45;
const R_RISCV_RELAX: u32 = 51;
const R_RISCV_SET6: u32 = 53;
const R_RISCV_SET8: u32 = 54;
const R_RISCV_SET16: u32 = 55;
const R_RISCV_SET32: u32 = 56;

const AUIPC_OPCODE: u32 = 0x17;

/// Fixed-capacity table mapping an `AUIPC`'s VMA to its computed PC-relative offset, so a
/// later `PCREL_LO12_{I,S}` entry referencing that AUIPC can recover it (§4.3.2, §9 "PCREL_HI20
/// / LO12 coupling" redesign note). Local to a single load; overflow is a warning, not an error.
struct PcrelFixupTable {
	entries: [Option<(u32, i32)>; 32],
	len: usize,
}

impl PcrelFixupTable {
	fn new() -> Self {
		Self {
			entries: [None; 32],
			len: 0,
		}
	}

	fn insert(&mut self, auipc_vma: u32, pcrel_offset: i32) {
		if self.len >= self.entries.len() {
			warn!("PCREL_HI20 fixup table full (>{} entries), later LO12 relocations may be skipped", self.entries.len());
			return;
		}
		self.entries[self.len] = Some((auipc_vma, pcrel_offset));
		self.len += 1;
	}

	fn get(&self, auipc_vma: u32) -> Option<i32> {
		self.entries[..self.len]
			.iter()
			.find_map(|e| e.filter(|&(vma, _)| vma == auipc_vma).map(|(_, off)| off))
	}
}

/// Relocation back-end for RISC-V.
pub struct RiscvRelocator {
	/// Fixed instruction/data bus offset (`IRAM_DRAM_OFFSET`); `0` on targets with a unified
	/// address space, where every adjustment below becomes a no-op.
	iram_dram_offset: i64,
}

impl RiscvRelocator {
	/// Constructs a relocator for a target whose instruction and data buses are separated by
	/// `iram_dram_offset` (`0` for a unified address space).
	pub fn new(iram_dram_offset: i64) -> Self {
		Self { iram_dram_offset }
	}
}

impl Relocator for RiscvRelocator {
	fn post_load(&self, reader: &ElfReader, mem: &mut Memory, _load_base: LoadBase) -> Result<()> {
		if self.iram_dram_offset == 0 {
			return Ok(());
		}
		let Some(plt) = reader.section_by_name(".plt") else {
			warn!(".plt section not found, external calls through PLT may fail");
			return Ok(());
		};
		let plt_vma = plt.hdr.sh_addr;
		let plt_size = plt.hdr.sh_size;
		if plt_vma == 0 || plt_size == 0 {
			warn!("invalid .plt section: vma=0x{plt_vma:x} size={plt_size}");
			return Ok(());
		}

		let adjust = -(self.iram_dram_offset >> 12) as i32;
		let Some(window) = mem.window_mut(plt_vma, plt_size) else {
			warn!(".plt section at 0x{plt_vma:x} is outside the loaded VMA range");
			return Ok(());
		};

		// The PLT header (first 16 bytes) has its own layout but also opens with an AUIPC at
		// offset 0; entries proper start at offset 0x20 (16-byte entries, each
		// `auipc; lw; jalr; nop`), so offset 0x10-0x1F (the header's second half) is never
		// inspected.
		let patch_auipc = |window: &mut [u8], entry_off: usize| {
			let Some(word) = window.get(entry_off..entry_off + 4) else {
				return;
			};
			let instr = u32::from_le_bytes(word.try_into().unwrap());
			if instr & 0x7f != AUIPC_OPCODE {
				return;
			}
			let imm = (instr as i32) >> 12;
			let new_imm = imm + adjust;
			let patched = (instr & 0xfff) | ((new_imm as u32) << 12);
			window[entry_off..entry_off + 4].copy_from_slice(&patched.to_le_bytes());
		};

		patch_auipc(window, 0);
		for entry_off in (0x20..window.len()).step_by(16) {
			patch_auipc(window, entry_off);
		}
		Ok(())
	}

	fn apply_relocations(&self, reader: &ElfReader, mem: &mut Memory, load_base: LoadBase) -> Result<()> {
		let mut fixups = PcrelFixupTable::new();

		for rela in reader.iter_rela() {
			let offset = rela.rela.r_offset;
			let ty = crate::elf::RelInfo::r#type(&rela.rela);
			let addend = rela.rela.r_addend;

			if !mem.in_range(offset) {
				continue;
			}

			match ty {
				R_RISCV_NONE | R_RISCV_RELAX | R_RISCV_ADD32 | R_RISCV_SUB6 | R_RISCV_SET6 | R_RISCV_SET8
				| R_RISCV_SET16 | R_RISCV_SET32 | R_RISCV_RVC_BRANCH | R_RISCV_RVC_JUMP | R_RISCV_HI20
				| R_RISCV_LO12_I | R_RISCV_LO12_S => {}

				R_RISCV_RELATIVE => {
					let result = (load_base.unified + addend as i64) as u32;
					mem.write_u32(offset, result);
				}

				R_RISCV_32 => {
					let sym_val = reader.rela_symbol(&rela).map(|s| s.sym.st_value).unwrap_or(0);
					let result = (load_base.unified + sym_val as i64 + addend as i64) as u32;
					mem.write_u32(offset, result);
				}

				R_RISCV_JUMP_SLOT => {
					let sym_val = reader.rela_symbol(&rela).map(|s| s.sym.st_value).unwrap_or(0);
					if sym_val != 0 {
						mem.write_u32(offset, sym_val);
					} else {
						let name = reader.rela_symbol(&rela).map(|s| reader.symbol_name(&s)).unwrap_or_default();
						warn!("unresolved external symbol '{name}' at offset 0x{offset:x}");
					}
				}

				R_RISCV_PCREL_HI20 => {
					let sym_val = reader.rela_symbol(&rela).map(|s| s.sym.st_value).unwrap_or(0);
					let sym_addr = load_base.unified + sym_val as i64 + addend as i64;
					let pc_addr = load_base.unified + offset as i64;
					let pcrel_offset = (sym_addr - pc_addr - self.iram_dram_offset) as i32;
					fixups.insert(offset, pcrel_offset);

					let hi20 = (pcrel_offset.wrapping_add(0x800)) >> 12;
					if let Some(instr) = mem.read_u32(offset) {
						let patched = (instr & 0xfff) | ((hi20 as u32) << 12);
						mem.write_u32(offset, patched);
					}
				}

				R_RISCV_PCREL_LO12_I => {
					let auipc_vma = reader.rela_symbol(&rela).map(|s| s.sym.st_value).unwrap_or(0);
					let Some(pcrel_offset) = fixups.get(auipc_vma) else {
						warn!("PCREL_LO12_I at 0x{offset:x}: no matching HI20 for AUIPC at 0x{auipc_vma:x}");
						continue;
					};
					let hi20 = (pcrel_offset.wrapping_add(0x800)) >> 12;
					let lo12 = pcrel_offset - (hi20 << 12);
					if let Some(instr) = mem.read_u32(offset) {
						let patched = (instr & 0x000f_ffff) | (((lo12 & 0xfff) as u32) << 20);
						mem.write_u32(offset, patched);
					}
				}

				R_RISCV_PCREL_LO12_S => {
					let auipc_vma = reader.rela_symbol(&rela).map(|s| s.sym.st_value).unwrap_or(0);
					let Some(pcrel_offset) = fixups.get(auipc_vma) else {
						warn!("PCREL_LO12_S at 0x{offset:x}: no matching HI20 for AUIPC at 0x{auipc_vma:x}");
						continue;
					};
					let hi20 = (pcrel_offset.wrapping_add(0x800)) >> 12;
					let lo12 = pcrel_offset - (hi20 << 12);
					if let Some(instr) = mem.read_u32(offset) {
						let imm_11_5 = ((lo12 & 0xfe0) as u32) << 20;
						let imm_4_0 = ((lo12 & 0x1f) as u32) << 7;
						let patched = (instr & 0x01ff_f07f) | imm_11_5 | imm_4_0;
						mem.write_u32(offset, patched);
					}
				}

				other => warn!("unknown RISC-V relocation type {other} at offset 0x{offset:x}"),
			}
		}
		Ok(())
	}
}
