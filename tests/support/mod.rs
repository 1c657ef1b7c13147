//! Hand-built little-endian ELF32 image constructors shared by the integration scenarios, built
//! entirely against `hotreload`'s public `elf` types rather than checked-in binary fixtures.

use hotreload::elf::{
	Elf32Ehdr, Elf32Phdr, Elf32Shdr, Elf32Sym, EI_CLASS, EI_DATA, EI_NIDENT, EI_VERSION, ELFCLASS32,
	ELFDATA2LSB, ELFMAG, ET_EXEC, EV_CURRENT, PF_R, PF_W, PF_X, PT_LOAD, SHT_PROGBITS, SHT_STRTAB,
	SHT_SYMTAB, STT_FUNC,
};
use bytemuck::Zeroable;
use std::mem::size_of;

pub use hotreload::elf::EM_XTENSA;

const STB_GLOBAL: u8 = 1;

fn ident() -> [u8; EI_NIDENT] {
	let mut e_ident = [0u8; EI_NIDENT];
	e_ident[0..4].copy_from_slice(&ELFMAG);
	e_ident[EI_CLASS] = ELFCLASS32;
	e_ident[EI_DATA] = ELFDATA2LSB;
	e_ident[EI_VERSION] = EV_CURRENT;
	e_ident
}

fn str_table(names: &[&str]) -> (Vec<u8>, Vec<u32>) {
	let mut buf = vec![0u8];
	let mut offsets = Vec::with_capacity(names.len());
	for name in names {
		offsets.push(buf.len() as u32);
		buf.extend_from_slice(name.as_bytes());
		buf.push(0);
	}
	(buf, offsets)
}

/// A single-segment ELF32 image: one executable `PT_LOAD` segment containing a defined
/// `STT_FUNC` symbol named `"f"`, with no relocations. Returns `(bytes, text_vma, 0)`.
pub fn build_simple_elf(machine: u16) -> (Vec<u8>, u32, u32) {
	let text_vma: u32 = 0x4000_0000;
	let text_bytes = [0u8; 16];

	let phoff = size_of::<Elf32Ehdr>() as u32;
	let text_off = phoff + size_of::<Elf32Phdr>() as u32;
	let symtab_off = text_off + text_bytes.len() as u32;
	let symtab_size = 2 * size_of::<Elf32Sym>() as u32;
	let strtab_off = symtab_off + symtab_size;

	let (strtab_bytes, str_offsets) = str_table(&["f"]);
	let shstrtab_off = strtab_off + strtab_bytes.len() as u32;
	let (shstrtab_bytes, sh_offsets) = str_table(&[".text", ".symtab", ".strtab", ".shstrtab"]);
	let shoff = shstrtab_off + shstrtab_bytes.len() as u32;

	let ehdr = Elf32Ehdr {
		e_ident: ident(),
		e_type: ET_EXEC,
		e_machine: machine,
		e_version: EV_CURRENT as u32,
		e_entry: text_vma,
		e_phoff: phoff,
		e_shoff: shoff,
		e_flags: 0,
		e_ehsize: size_of::<Elf32Ehdr>() as u16,
		e_phentsize: size_of::<Elf32Phdr>() as u16,
		e_phnum: 1,
		e_shentsize: size_of::<Elf32Shdr>() as u16,
		e_shnum: 5,
		e_shstrndx: 4,
	};

	let phdr = Elf32Phdr {
		p_type: PT_LOAD,
		p_offset: text_off,
		p_vaddr: text_vma,
		p_paddr: text_vma,
		p_filesz: text_bytes.len() as u32,
		p_memsz: text_bytes.len() as u32,
		p_flags: PF_X | PF_R,
		p_align: 4,
	};

	let sym_null = Elf32Sym::zeroed();
	let sym_f = Elf32Sym {
		st_name: str_offsets[0],
		st_value: text_vma,
		st_size: text_bytes.len() as u32,
		st_info: (STB_GLOBAL << 4) | STT_FUNC,
		st_other: 0,
		st_shndx: 1,
	};

	let sh_null = Elf32Shdr::zeroed();
	let sh_text = Elf32Shdr {
		sh_name: sh_offsets[0],
		sh_type: SHT_PROGBITS,
		sh_flags: 0x6, // ALLOC | EXECINSTR
		sh_addr: text_vma,
		sh_offset: text_off,
		sh_size: text_bytes.len() as u32,
		sh_link: 0,
		sh_info: 0,
		sh_addralign: 4,
		sh_entsize: 0,
	};
	let sh_symtab = Elf32Shdr {
		sh_name: sh_offsets[1],
		sh_type: SHT_SYMTAB,
		sh_flags: 0,
		sh_addr: 0,
		sh_offset: symtab_off,
		sh_size: symtab_size,
		sh_link: 3,
		sh_info: 1,
		sh_addralign: 4,
		sh_entsize: size_of::<Elf32Sym>() as u32,
	};
	let sh_strtab = Elf32Shdr {
		sh_name: sh_offsets[2],
		sh_type: SHT_STRTAB,
		sh_flags: 0,
		sh_addr: 0,
		sh_offset: strtab_off,
		sh_size: strtab_bytes.len() as u32,
		sh_link: 0,
		sh_info: 0,
		sh_addralign: 1,
		sh_entsize: 0,
	};
	let sh_shstrtab = Elf32Shdr {
		sh_name: sh_offsets[3],
		sh_type: SHT_STRTAB,
		sh_flags: 0,
		sh_addr: 0,
		sh_offset: shstrtab_off,
		sh_size: shstrtab_bytes.len() as u32,
		sh_link: 0,
		sh_info: 0,
		sh_addralign: 1,
		sh_entsize: 0,
	};

	let mut buf = Vec::new();
	buf.extend_from_slice(bytemuck::bytes_of(&ehdr));
	buf.extend_from_slice(bytemuck::bytes_of(&phdr));
	buf.extend_from_slice(&text_bytes);
	buf.extend_from_slice(bytemuck::bytes_of(&sym_null));
	buf.extend_from_slice(bytemuck::bytes_of(&sym_f));
	buf.extend_from_slice(&strtab_bytes);
	buf.extend_from_slice(&shstrtab_bytes);
	buf.extend_from_slice(bytemuck::bytes_of(&sh_null));
	buf.extend_from_slice(bytemuck::bytes_of(&sh_text));
	buf.extend_from_slice(bytemuck::bytes_of(&sh_symtab));
	buf.extend_from_slice(bytemuck::bytes_of(&sh_strtab));
	buf.extend_from_slice(bytemuck::bytes_of(&sh_shstrtab));

	(buf, text_vma, 0)
}

/// A two-segment ELF32 image: an executable text `PT_LOAD` and a writable, non-executable data
/// `PT_LOAD`, with no section headers. Used to exercise split allocation end to end.
pub fn build_split_elf(machine: u16) -> (Vec<u8>, u32, u32) {
	let text_vma: u32 = 0x4000_0000;
	let data_vma: u32 = 0x3ffb_0000;
	let text_bytes = [0u8; 16];
	let data_bytes = [0u8; 16];

	let phoff = size_of::<Elf32Ehdr>() as u32;
	let text_off = phoff + 2 * size_of::<Elf32Phdr>() as u32;
	let data_off = text_off + text_bytes.len() as u32;

	let ehdr = Elf32Ehdr {
		e_ident: ident(),
		e_type: ET_EXEC,
		e_machine: machine,
		e_version: EV_CURRENT as u32,
		e_entry: text_vma,
		e_phoff: phoff,
		e_shoff: 0,
		e_flags: 0,
		e_ehsize: size_of::<Elf32Ehdr>() as u16,
		e_phentsize: size_of::<Elf32Phdr>() as u16,
		e_phnum: 2,
		e_shentsize: size_of::<Elf32Shdr>() as u16,
		e_shnum: 0,
		e_shstrndx: 0,
	};

	let text_phdr = Elf32Phdr {
		p_type: PT_LOAD,
		p_offset: text_off,
		p_vaddr: text_vma,
		p_paddr: text_vma,
		p_filesz: text_bytes.len() as u32,
		p_memsz: text_bytes.len() as u32,
		p_flags: PF_X | PF_R,
		p_align: 4,
	};
	let data_phdr = Elf32Phdr {
		p_type: PT_LOAD,
		p_offset: data_off,
		p_vaddr: data_vma,
		p_paddr: data_vma,
		p_filesz: data_bytes.len() as u32,
		p_memsz: data_bytes.len() as u32,
		p_flags: PF_R | PF_W,
		p_align: 4,
	};

	let mut buf = Vec::new();
	buf.extend_from_slice(bytemuck::bytes_of(&ehdr));
	buf.extend_from_slice(bytemuck::bytes_of(&text_phdr));
	buf.extend_from_slice(bytemuck::bytes_of(&data_phdr));
	buf.extend_from_slice(&text_bytes);
	buf.extend_from_slice(&data_bytes);

	(buf, text_vma, data_vma)
}
