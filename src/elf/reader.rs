//! ELF reader: parses and caches header tables, and exposes lazy iterators
//! over sections, segments, symbols and RELA entries.

use crate::elf::{
	Elf32Ehdr, Elf32Phdr, Elf32Rel, Elf32Rela, Elf32Shdr, Elf32Sym, EI_CLASS, EI_DATA, EI_NIDENT,
	EI_VERSION, ELFCLASS32, ELFDATA2LSB, ELFMAG, EV_CURRENT, RelInfo, SHN_LORESERVE, SHT_RELA,
	SHT_REL, SHT_STRTAB, SHT_SYMTAB,
};
use crate::error::{LoaderError, Result};
use std::mem::size_of;

/// A caller-supplied random-access byte source.
///
/// Analogous to the original loader's `{ read(user_ctx, offset, n, dst) -> bytes_copied }`
/// callback; implemented here as a trait so tests can back it with a plain `Vec<u8>` and a
/// real port can back it with a memory-mapped flash partition.
pub trait ByteSource {
	/// Copies up to `dst.len()` bytes starting at `offset` into `dst`, returning the number of
	/// bytes actually copied. Must return `0` on error or out-of-range `offset`. Never panics.
	fn read(&self, offset: u32, dst: &mut [u8]) -> usize;
}

impl ByteSource for [u8] {
	fn read(&self, offset: u32, dst: &mut [u8]) -> usize {
		let offset = offset as usize;
		if offset >= self.len() {
			return 0;
		}
		let n = dst.len().min(self.len() - offset);
		dst[..n].copy_from_slice(&self[offset..offset + n]);
		n
	}
}

impl ByteSource for Vec<u8> {
	fn read(&self, offset: u32, dst: &mut [u8]) -> usize {
		self.as_slice().read(offset, dst)
	}
}

/// Reads an exact-size POD value at `offset`, failing if the source returns short.
fn read_pod<T: bytemuck::Pod>(src: &dyn ByteSource, offset: u32) -> Option<T> {
	let mut buf = vec![0u8; size_of::<T>()];
	let n = src.read(offset, &mut buf);
	if n != buf.len() {
		return None;
	}
	bytemuck::try_pod_read_unaligned(&buf).ok()
}

/// Reads a NUL-terminated string out of a cached string-table buffer at `offset`.
fn strtab_name(strtab: &[u8], offset: u32) -> String {
	let offset = offset as usize;
	if offset >= strtab.len() {
		return String::new();
	}
	let end = strtab[offset..]
		.iter()
		.position(|&b| b == 0)
		.map(|p| offset + p)
		.unwrap_or(strtab.len());
	String::from_utf8_lossy(&strtab[offset..end]).into_owned()
}

/// A section cursor, a small `Copy` value carrying the parsed header plus its index.
#[derive(Clone, Copy, Debug)]
pub struct SectionHandle {
	/// Index of this section in the section header table.
	pub index: usize,
	/// The raw section header.
	pub hdr: Elf32Shdr,
}

/// A segment (program header) cursor.
#[derive(Clone, Copy, Debug)]
pub struct SegmentHandle {
	/// Index of this segment in the program header table.
	pub index: usize,
	/// The raw program header.
	pub hdr: Elf32Phdr,
}

/// A symbol cursor: which `SHT_SYMTAB` section it came from, its index there, and the symbol.
#[derive(Clone, Copy, Debug)]
pub struct SymbolHandle {
	/// Index of the owning `SHT_SYMTAB` section.
	pub section_index: usize,
	/// Index of this symbol within that section's symbol table.
	pub sym_index: usize,
	/// The raw symbol.
	pub sym: Elf32Sym,
}

/// A RELA-entry cursor.
#[derive(Clone, Copy, Debug)]
pub struct RelaHandle {
	/// Index of the owning `SHT_RELA` section.
	pub section_index: usize,
	/// Index of this entry within that section.
	pub entry_index: usize,
	/// The raw relocation entry.
	pub rela: Elf32Rela,
}

/// Parses and caches an ELF32 image's header tables over a [`ByteSource`].
///
/// The reader owns every cached buffer (header, program headers, section headers, string
/// tables); cursor values borrow nothing from it and may outlive a particular iterator, but the
/// reader itself must outlive every cursor derived from it (trivially true here since cursors
/// are owned `Copy` values, not references).
pub struct ElfReader<'src> {
	src: &'src dyn ByteSource,
	ehdr: Elf32Ehdr,
	phdrs: Vec<Elf32Phdr>,
	shdrs: Vec<Elf32Shdr>,
	shstrtab: Vec<u8>,
	/// One string table per `SHT_SYMTAB` section, keyed by that section's index.
	sym_strtabs: Vec<(usize, Vec<u8>)>,
}

impl<'src> ElfReader<'src> {
	/// Opens and validates `src`, eagerly caching the header tables.
	///
	/// Fails with [`LoaderError::InvalidArgument`] on short/bad reads and
	/// [`LoaderError::NotSupported`] if the image's class, endianness, version or magic do not
	/// match what this crate supports (32-bit, little-endian, current version).
	pub fn open(src: &'src dyn ByteSource) -> Result<Self> {
		let ehdr: Elf32Ehdr = read_pod(src, 0)
			.ok_or(LoaderError::InvalidArgument("short read of ELF header"))?;
		if ehdr.e_ident[0..4] != ELFMAG {
			return Err(LoaderError::NotSupported("bad ELF magic"));
		}
		if ehdr.e_ident[EI_CLASS] != ELFCLASS32 {
			return Err(LoaderError::NotSupported("only ELFCLASS32 is supported"));
		}
		if ehdr.e_ident[EI_DATA] != ELFDATA2LSB {
			return Err(LoaderError::NotSupported("only little-endian is supported"));
		}
		if ehdr.e_ident[EI_VERSION] != EV_CURRENT {
			return Err(LoaderError::NotSupported("unsupported ELF version"));
		}
		if ehdr.e_ehsize as usize != size_of::<Elf32Ehdr>() {
			return Err(LoaderError::InvalidArgument("inconsistent e_ehsize"));
		}

		let phdrs = Self::read_table::<Elf32Phdr>(src, ehdr.e_phoff, ehdr.e_phnum as usize)?;
		let shdrs = Self::read_table::<Elf32Shdr>(src, ehdr.e_shoff, ehdr.e_shnum as usize)?;

		let shstrtab = if (ehdr.e_shstrndx as usize) < shdrs.len() {
			Self::read_section_bytes(src, &shdrs[ehdr.e_shstrndx as usize])?
		} else {
			Vec::new()
		};

		let mut sym_strtabs = Vec::new();
		for (i, sh) in shdrs.iter().enumerate() {
			if sh.sh_type == SHT_SYMTAB && (sh.sh_link as usize) < shdrs.len() {
				let strtab = Self::read_section_bytes(src, &shdrs[sh.sh_link as usize])?;
				sym_strtabs.push((i, strtab));
			}
		}

		Ok(Self {
			src,
			ehdr,
			phdrs,
			shdrs,
			shstrtab,
			sym_strtabs,
		})
	}

	fn read_table<T: bytemuck::Pod>(src: &dyn ByteSource, offset: u32, count: usize) -> Result<Vec<T>> {
		let mut out = Vec::with_capacity(count);
		let mut off = offset;
		for _ in 0..count {
			let entry: T = read_pod(src, off)
				.ok_or(LoaderError::InvalidArgument("short read of header table entry"))?;
			out.push(entry);
			off += size_of::<T>() as u32;
		}
		Ok(out)
	}

	fn read_section_bytes(src: &dyn ByteSource, sh: &Elf32Shdr) -> Result<Vec<u8>> {
		if sh.sh_type == crate::elf::SHT_NOBITS || sh.sh_size == 0 {
			return Ok(Vec::new());
		}
		let mut buf = vec![0u8; sh.sh_size as usize];
		let n = src.read(sh.sh_offset, &mut buf);
		if n != buf.len() {
			return Err(LoaderError::InvalidArgument("short read of section contents"));
		}
		Ok(buf)
	}

	/// The parsed ELF header.
	pub fn ehdr(&self) -> &Elf32Ehdr {
		&self.ehdr
	}

	/// Returns the interpreted architecture of this image (`e_machine`).
	pub fn machine(&self) -> u16 {
		self.ehdr.e_machine
	}

	/// Iterates every section in declaration order. Silently stops (rather than yielding a
	/// further item) should a step ever fail; see [`Self::try_sections`] for the fallible
	/// counterpart that surfaces the distinction (§4.1 "Failure model").
	pub fn iter_sections(&self) -> impl Iterator<Item = SectionHandle> + '_ {
		let mut cursor = self.try_sections();
		std::iter::from_fn(move || cursor.try_next().ok().flatten())
	}

	/// Iterates every `PT_LOAD`-and-otherwise program header in declaration order. See
	/// [`Self::try_segments`] for the fallible counterpart.
	pub fn iter_segments(&self) -> impl Iterator<Item = SegmentHandle> + '_ {
		let mut cursor = self.try_segments();
		std::iter::from_fn(move || cursor.try_next().ok().flatten())
	}

	/// Iterates every symbol across every `SHT_SYMTAB` section, in (section, index) order. See
	/// [`Self::try_symbols`] for the fallible counterpart.
	pub fn iter_symbols(&self) -> impl Iterator<Item = SymbolHandle> + '_ {
		let mut cursor = self.try_symbols();
		std::iter::from_fn(move || cursor.try_next().ok().flatten())
	}

	/// Iterates every RELA entry across every `SHT_RELA` section, in (section, index) order. See
	/// [`Self::try_rela`] for the fallible counterpart.
	pub fn iter_rela(&self) -> impl Iterator<Item = RelaHandle> + '_ {
		let mut cursor = self.try_rela();
		std::iter::from_fn(move || cursor.try_next().ok().flatten())
	}

	/// A fallible cursor over every section, in declaration order.
	///
	/// Resolves Open Question #1 (§9, §4.1): since every section header was already validated
	/// into `self.shdrs` at `open` time, a step here can never actually fail, but the cursor
	/// still reports through `try_next`'s `Result<Option<T>>` so callers have one consistent
	/// fallible surface across all four iterator kinds.
	pub fn try_sections(&self) -> TrySectionCursor<'_, 'src> {
		TrySectionCursor { reader: self, index: 0 }
	}

	/// A fallible cursor over every program header, in declaration order.
	pub fn try_segments(&self) -> TrySegmentCursor<'_, 'src> {
		TrySegmentCursor { reader: self, index: 0 }
	}

	/// A fallible cursor over every symbol across every `SHT_SYMTAB` section.
	///
	/// Unlike [`Self::iter_symbols`], a short/failed read mid-table is surfaced as
	/// `Err(LoaderError::Io)` from `try_next` instead of being indistinguishable from having
	/// reached the end of the table.
	pub fn try_symbols(&self) -> TrySymbolCursor<'_, 'src> {
		TrySymbolCursor {
			reader: self,
			table_index: 0,
			entry_index: 0,
		}
	}

	/// A fallible cursor over every RELA entry across every `SHT_RELA` section.
	pub fn try_rela(&self) -> TryRelaCursor<'_, 'src> {
		TryRelaCursor {
			reader: self,
			section_index: 0,
			entry_index: 0,
		}
	}

	/// Tells whether any `SHT_REL` section is present (informational; this crate only applies
	/// RELA relocations, per spec).
	pub fn has_rel_sections(&self) -> bool {
		self.shdrs.iter().any(|sh| sh.sh_type == SHT_REL)
	}

	/// Materializes a section's name from the cached section-name string table.
	pub fn section_name(&self, section: &SectionHandle) -> String {
		strtab_name(&self.shstrtab, section.hdr.sh_name)
	}

	/// Materializes a symbol's name, or the empty string if `st_name == 0` or no string table
	/// is cached for its owning section.
	pub fn symbol_name(&self, symbol: &SymbolHandle) -> String {
		if symbol.sym.st_name == 0 {
			return String::new();
		}
		self.strtab_for(symbol.section_index)
			.map(|t| strtab_name(t, symbol.sym.st_name))
			.unwrap_or_default()
	}

	/// Materializes the name of the section a symbol is defined in, or the empty string if the
	/// symbol's `st_shndx` refers to a reserved/special range.
	pub fn symbol_section_name(&self, symbol: &SymbolHandle) -> String {
		if symbol.sym.st_shndx >= SHN_LORESERVE {
			return String::new();
		}
		self.shdrs
			.get(symbol.sym.st_shndx as usize)
			.map(|sh| {
				let dummy = SectionHandle {
					index: symbol.sym.st_shndx as usize,
					hdr: *sh,
				};
				self.section_name(&dummy)
			})
			.unwrap_or_default()
	}

	fn strtab_for(&self, symtab_section: usize) -> Option<&[u8]> {
		self.sym_strtabs
			.iter()
			.find(|&&(idx, _)| idx == symtab_section)
			.map(|(_, t)| t.as_slice())
	}

	/// Looks up a symbol by index within a specific `SHT_SYMTAB` section.
	pub fn symbol_by_index(&self, section_index: usize, sym_index: usize) -> Option<SymbolHandle> {
		let sh = self.shdrs.get(section_index)?;
		if sh.sh_type != SHT_SYMTAB {
			return None;
		}
		let off = sh.sh_offset + (sym_index * size_of::<Elf32Sym>()) as u32;
		let sym: Elf32Sym = read_pod(self.src, off)?;
		Some(SymbolHandle {
			section_index,
			sym_index,
			sym,
		})
	}

	/// Looks up the first symbol whose name matches `name`, via a linear scan of every cached
	/// symbol table. Returns `None` if no defined symbol has this name.
	pub fn symbol_by_name(&self, name: &str) -> Option<SymbolHandle> {
		self.iter_symbols().find(|s| self.symbol_name(s) == name)
	}

	/// Resolves the symbol a RELA entry refers to, via its owning section's `sh_link` (the
	/// RELA section's associated symbol table) and the symbol index packed into `r_info`.
	pub fn rela_symbol(&self, rela: &RelaHandle) -> Option<SymbolHandle> {
		let sh = self.shdrs.get(rela.section_index)?;
		self.symbol_by_index(sh.sh_link as usize, rela.rela.sym() as usize)
	}

	/// Finds the first section with the given name, or `None` if absent.
	pub fn section_by_name(&self, name: &str) -> Option<SectionHandle> {
		self.iter_sections().find(|s| self.section_name(s) == name)
	}

	/// Reads exactly `buf.len()` raw file bytes starting at `offset`, failing with
	/// [`LoaderError::Io`] on a short read. Used by the loader core to copy `PT_LOAD` segment
	/// contents out of the ELF image.
	pub fn read_bytes(&self, offset: u32, buf: &mut [u8]) -> Result<()> {
		let n = self.src.read(offset, buf);
		if n != buf.len() {
			return Err(LoaderError::Io("short read of segment contents"));
		}
		Ok(())
	}
}

/// Fallible cursor over every section, returned by [`ElfReader::try_sections`].
pub struct TrySectionCursor<'r, 'src> {
	reader: &'r ElfReader<'src>,
	index: usize,
}

impl<'r, 'src> TrySectionCursor<'r, 'src> {
	/// Advances the cursor, returning `Ok(None)` once every section has been visited.
	pub fn try_next(&mut self) -> Result<Option<SectionHandle>> {
		let Some(&hdr) = self.reader.shdrs.get(self.index) else {
			return Ok(None);
		};
		let handle = SectionHandle { index: self.index, hdr };
		self.index += 1;
		Ok(Some(handle))
	}
}

/// Fallible cursor over every program header, returned by [`ElfReader::try_segments`].
pub struct TrySegmentCursor<'r, 'src> {
	reader: &'r ElfReader<'src>,
	index: usize,
}

impl<'r, 'src> TrySegmentCursor<'r, 'src> {
	/// Advances the cursor, returning `Ok(None)` once every segment has been visited.
	pub fn try_next(&mut self) -> Result<Option<SegmentHandle>> {
		let Some(&hdr) = self.reader.phdrs.get(self.index) else {
			return Ok(None);
		};
		let handle = SegmentHandle { index: self.index, hdr };
		self.index += 1;
		Ok(Some(handle))
	}
}

/// Fallible cursor over every symbol across every `SHT_SYMTAB` section, returned by
/// [`ElfReader::try_symbols`].
pub struct TrySymbolCursor<'r, 'src> {
	reader: &'r ElfReader<'src>,
	table_index: usize,
	entry_index: usize,
}

impl<'r, 'src> TrySymbolCursor<'r, 'src> {
	/// Advances the cursor, returning `Ok(None)` once every symbol table has been exhausted, or
	/// `Err(LoaderError::Io)` the moment a symbol table entry's read comes back short (§4.1
	/// "Failure model", Open Question #1).
	pub fn try_next(&mut self) -> Result<Option<SymbolHandle>> {
		loop {
			let Some(&(section_index, _)) = self.reader.sym_strtabs.get(self.table_index) else {
				return Ok(None);
			};
			let sh = &self.reader.shdrs[section_index];
			let count = if sh.sh_entsize == 0 {
				0
			} else {
				sh.sh_size as usize / sh.sh_entsize as usize
			};
			if self.entry_index >= count {
				self.table_index += 1;
				self.entry_index = 0;
				continue;
			}
			let sym_index = self.entry_index;
			let off = sh.sh_offset + (sym_index * size_of::<Elf32Sym>()) as u32;
			let sym: Elf32Sym =
				read_pod(self.reader.src, off).ok_or(LoaderError::Io("short read of symbol table entry"))?;
			self.entry_index += 1;
			return Ok(Some(SymbolHandle {
				section_index,
				sym_index,
				sym,
			}));
		}
	}
}

/// Fallible cursor over every RELA entry across every `SHT_RELA` section, returned by
/// [`ElfReader::try_rela`].
pub struct TryRelaCursor<'r, 'src> {
	reader: &'r ElfReader<'src>,
	section_index: usize,
	entry_index: usize,
}

impl<'r, 'src> TryRelaCursor<'r, 'src> {
	/// Advances the cursor, returning `Ok(None)` once every `SHT_RELA` section has been
	/// exhausted, or `Err(LoaderError::Io)` the moment an entry's read comes back short.
	pub fn try_next(&mut self) -> Result<Option<RelaHandle>> {
		loop {
			let Some(sh) = self.reader.shdrs.get(self.section_index) else {
				return Ok(None);
			};
			if sh.sh_type != SHT_RELA {
				self.section_index += 1;
				self.entry_index = 0;
				continue;
			}
			let count = if sh.sh_entsize == 0 {
				0
			} else {
				sh.sh_size as usize / sh.sh_entsize as usize
			};
			if self.entry_index >= count {
				self.section_index += 1;
				self.entry_index = 0;
				continue;
			}
			let entry_index = self.entry_index;
			let off = sh.sh_offset + (entry_index * size_of::<Elf32Rela>()) as u32;
			let rela: Elf32Rela =
				read_pod(self.reader.src, off).ok_or(LoaderError::Io("short read of RELA entry"))?;
			self.entry_index += 1;
			return Ok(Some(RelaHandle {
				section_index: self.section_index,
				entry_index,
				rela,
			}));
		}
	}
}

/// Resolves the symbol table index and relocation type packed into a RELA entry's `r_info`.
pub fn rela_sym_and_type(rela: &Elf32Rela) -> (u32, u32) {
	(rela.sym(), rela.r#type())
}
