//! Loader core (C4): orchestrates validate → plan layout → allocate → copy segments →
//! post-load fixups → apply relocations → sync caches → look up symbols, holding the
//! pipeline's state machine. Grounded on the original `elf_loader.c`.

use crate::config::HeapCaps;
use crate::elf::reader::{ByteSource, ElfReader};
use crate::elf::{Elf32Ehdr, EI_CLASS, EI_DATA, EI_VERSION, ELFCLASS32, ELFDATA2LSB, ELFMAG, ET_DYN, ET_EXEC, EV_CURRENT, PT_LOAD, STT_FUNC};
use crate::error::{LoaderError, Result};
use crate::port::{Allocation, MemoryPort, SplitAllocation};
use crate::reloc::{self, LoadBase, Memory};
use log::{debug, info, warn};
use std::mem::size_of;

/// The pipeline's state machine (§4.4). Only forward transitions, one step at a time;
/// `cleanup` is valid from any state and returns to `Empty`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum State {
	/// No image opened.
	Empty,
	/// `init` has parsed the ELF header tables.
	Opened,
	/// `plan_layout` has computed the VMA ranges.
	Planned,
	/// `allocate` has obtained backing memory.
	Allocated,
	/// `load_segments` has copied `PT_LOAD` contents in.
	Loaded,
	/// `apply_relocations` has patched every in-range RELA entry.
	Relocated,
	/// `sync_cache` has synchronized the instruction cache; symbols may be safely executed.
	Ready,
}

/// The VMA ranges computed by `plan_layout`: overall, text-only, data-only.
#[derive(Clone, Copy, Debug, Default)]
struct Layout {
	vma_min: u32,
	vma_max: u32,
	text_vma_lo: u32,
	text_vma_hi: u32,
	data_vma_lo: u32,
	data_vma_hi: u32,
	has_text: bool,
	has_data: bool,
}

impl Layout {
	fn text_size(&self) -> usize {
		if self.has_text {
			(self.text_vma_hi - self.text_vma_lo) as usize
		} else {
			0
		}
	}

	fn data_size(&self) -> usize {
		if self.has_data {
			(self.data_vma_hi - self.data_vma_lo) as usize
		} else {
			0
		}
	}
}

enum AllocState {
	None,
	Unified(Allocation),
	Split(SplitAllocation),
}

/// Validates an ELF32 image's header in isolation, without opening a full reader (§4.4 step 1).
///
/// Rejects with [`LoaderError::InvalidArgument`] if `bytes` is shorter than the ELF32 header,
/// and with [`LoaderError::NotSupported`] on bad magic, wrong class/endianness/version, or a
/// type other than `ET_EXEC`/`ET_DYN`.
pub fn validate(bytes: &[u8]) -> Result<()> {
	if bytes.len() < size_of::<Elf32Ehdr>() {
		return Err(LoaderError::InvalidArgument("input smaller than the ELF32 header"));
	}
	let ehdr: Elf32Ehdr = bytemuck::pod_read_unaligned(&bytes[..size_of::<Elf32Ehdr>()]);
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
	if ehdr.e_type != ET_EXEC && ehdr.e_type != ET_DYN {
		return Err(LoaderError::NotSupported("only ET_EXEC and ET_DYN are accepted"));
	}
	Ok(())
}

/// Packs `src` into `dest` four bytes at a time, the word-aligned copy §4.4 step 5 requires for
/// text destinations (word-access-only executable heaps cannot take a byte-wise `memcpy`). Any
/// trailing 1-3 bytes are zero-padded into a final word. Data destinations may use a plain
/// `copy_from_slice` instead; this primitive exists for the text/unified path.
pub fn copy_to_exec_memory(dest: &mut [u8], src: &[u8]) {
	let mut i = 0;
	while i + 4 <= src.len() {
		dest[i..i + 4].copy_from_slice(&src[i..i + 4]);
		i += 4;
	}
	if i < src.len() {
		let mut word = [0u8; 4];
		word[..src.len() - i].copy_from_slice(&src[i..]);
		let end = (i + 4).min(dest.len());
		dest[i..end].copy_from_slice(&word[..end - i]);
	}
}

/// Zero-fills `dest` a word at a time, mirroring [`copy_to_exec_memory`]'s access width.
pub fn zero_exec_memory(dest: &mut [u8]) {
	dest.fill(0);
}

/// The loader core: orchestrates one ELF32 load from a [`ByteSource`] over a target's
/// [`MemoryPort`], enforcing the pipeline's forward-only state machine.
pub struct Loader<'src> {
	port: &'src dyn MemoryPort,
	heap_caps: HeapCaps,
	state: State,
	reader: Option<ElfReader<'src>>,
	machine: u16,
	layout: Layout,
	alloc: AllocState,
}

impl<'src> Loader<'src> {
	/// Constructs an empty loader bound to `port`, with the given allocation-capability hint.
	pub fn new(port: &'src dyn MemoryPort, heap_caps: HeapCaps) -> Self {
		Self {
			port,
			heap_caps,
			state: State::Empty,
			reader: None,
			machine: 0,
			layout: Layout::default(),
			alloc: AllocState::None,
		}
	}

	/// Current pipeline state.
	pub fn state(&self) -> State {
		self.state
	}

	fn require(&self, expected: State) -> Result<()> {
		if self.state != expected {
			return Err(LoaderError::InvalidState("operation called out of the loader's pipeline order"));
		}
		Ok(())
	}

	/// §4.4 step 2: validates the header, then opens the ELF reader (C1) over `src`.
	pub fn init(&mut self, src: &'src dyn ByteSource) -> Result<()> {
		self.require(State::Empty)?;
		let mut hdr = [0u8; size_of::<Elf32Ehdr>()];
		let n = src.read(0, &mut hdr);
		if n != hdr.len() {
			return Err(LoaderError::InvalidArgument("short read of ELF header"));
		}
		validate(&hdr)?;

		let reader = ElfReader::open(src)?;
		self.machine = reader.machine();
		self.reader = Some(reader);
		self.state = State::Opened;
		debug!("loader opened, e_machine={}", self.machine);
		Ok(())
	}

	/// §4.4 step 3: iterates `PT_LOAD` segments and computes the overall, text and data VMA
	/// ranges. Fails with [`LoaderError::NotFound`] if no segment has nonzero `memsz`.
	pub fn plan_layout(&mut self) -> Result<()> {
		self.require(State::Opened)?;
		let reader = self.reader.as_ref().expect("Opened state implies a reader");

		let mut layout = Layout::default();
		let mut vma_min = u32::MAX;
		let mut vma_max = 0u32;
		let mut text_lo = u32::MAX;
		let mut text_hi = 0u32;
		let mut data_lo = u32::MAX;
		let mut data_hi = 0u32;
		let mut found = false;

		for seg in reader.iter_segments() {
			if seg.hdr.p_type != PT_LOAD || seg.hdr.p_memsz == 0 {
				continue;
			}
			found = true;
			let lo = seg.hdr.p_vaddr;
			let hi = seg.hdr.p_vaddr.wrapping_add(seg.hdr.p_memsz);
			vma_min = vma_min.min(lo);
			vma_max = vma_max.max(hi);
			if seg.hdr.is_text() {
				layout.has_text = true;
				text_lo = text_lo.min(lo);
				text_hi = text_hi.max(hi);
			} else {
				layout.has_data = true;
				data_lo = data_lo.min(lo);
				data_hi = data_hi.max(hi);
			}
		}

		if !found {
			return Err(LoaderError::NotFound("no PT_LOAD segment with nonzero memsz"));
		}

		layout.vma_min = vma_min;
		layout.vma_max = vma_max;
		layout.text_vma_lo = if layout.has_text { text_lo } else { 0 };
		layout.text_vma_hi = if layout.has_text { text_hi } else { 0 };
		layout.data_vma_lo = if layout.has_data { data_lo } else { 0 };
		layout.data_vma_hi = if layout.has_data { data_hi } else { 0 };

		debug!(
			"planned layout: vma=[0x{:x},0x{:x}) text=[0x{:x},0x{:x}) data=[0x{:x},0x{:x})",
			layout.vma_min, layout.vma_max, layout.text_vma_lo, layout.text_vma_hi, layout.data_vma_lo, layout.data_vma_hi
		);
		self.layout = layout;
		self.state = State::Planned;
		Ok(())
	}

	/// §4.4 step 4: obtains backing memory from the port, split or unified per
	/// [`MemoryPort::requires_split_alloc`].
	pub fn allocate(&mut self) -> Result<()> {
		self.require(State::Planned)?;

		if self.port.requires_split_alloc() {
			let split = self
				.port
				.alloc_split(self.layout.text_size(), self.layout.data_size(), self.heap_caps)?;
			info!(
				"split allocation: text={} bytes at 0x{:x}, data={} bytes at 0x{:x}",
				self.layout.text_size(),
				split.text.data_base(),
				self.layout.data_size(),
				split.data.data_base()
			);
			self.alloc = AllocState::Split(split);
		} else {
			let size = (self.layout.vma_max - self.layout.vma_min) as usize;
			let unified = self.port.alloc(size, self.heap_caps)?;
			info!("unified allocation: {} bytes at 0x{:x}", size, unified.data_base());
			self.alloc = AllocState::Unified(unified);
		}
		self.state = State::Allocated;
		Ok(())
	}

	/// Whether `allocate` chose split (vs. unified) allocation.
	pub fn split_alloc(&self) -> bool {
		matches!(self.alloc, AllocState::Split(_))
	}

	/// The text region's data-view base address, once allocated.
	pub fn text_base(&self) -> Option<u32> {
		match &self.alloc {
			AllocState::Split(s) => Some(s.text.data_base()),
			AllocState::Unified(u) => Some(u.data_base()),
			AllocState::None => None,
		}
	}

	/// The data region's data-view base address, once allocated.
	pub fn data_base(&self) -> Option<u32> {
		match &self.alloc {
			AllocState::Split(s) => Some(s.data.data_base()),
			AllocState::Unified(u) => Some(u.data_base()),
			AllocState::None => None,
		}
	}

	/// §4.4 step 5: copies every `PT_LOAD` segment's file content into its destination region
	/// and zero-fills the trailing `memsz - filesz` BSS portion.
	pub fn load_segments(&mut self) -> Result<()> {
		self.require(State::Allocated)?;
		let reader = self.reader.as_ref().expect("Allocated state implies a reader");

		let segments: Vec<_> = reader
			.iter_segments()
			.filter(|s| s.hdr.p_type == PT_LOAD && s.hdr.p_memsz > 0)
			.collect();

		for seg in segments {
			let is_text = seg.hdr.is_text();
			let (region, region_vma_lo): (&mut [u8], u32) = match &mut self.alloc {
				AllocState::Split(s) if is_text => (s.text.bytes_mut(), self.layout.text_vma_lo),
				AllocState::Split(s) => (s.data.bytes_mut(), self.layout.data_vma_lo),
				AllocState::Unified(u) => (u.bytes_mut(), self.layout.vma_min),
				AllocState::None => return Err(LoaderError::InvalidState("memory not allocated")),
			};

			let dest_off = (seg.hdr.p_vaddr - region_vma_lo) as usize;
			let filesz = seg.hdr.p_filesz as usize;
			let memsz = seg.hdr.p_memsz as usize;
			let dest = region
				.get_mut(dest_off..dest_off + memsz)
				.ok_or(LoaderError::InvalidSize("segment does not fit its allocated region"))?;

			if filesz > 0 {
				let mut src_buf = vec![0u8; filesz];
				reader.read_bytes(seg.hdr.p_offset, &mut src_buf)?;
				if is_text || !self.split_alloc() {
					copy_to_exec_memory(&mut dest[..filesz], &src_buf);
				} else {
					dest[..filesz].copy_from_slice(&src_buf);
				}
			}
			if memsz > filesz {
				if is_text || !self.split_alloc() {
					zero_exec_memory(&mut dest[filesz..memsz]);
				} else {
					dest[filesz..memsz].fill(0);
				}
			}
			debug!(
				"loaded segment vaddr=0x{:x} filesz={} memsz={}{}",
				seg.hdr.p_vaddr,
				filesz,
				memsz,
				if is_text { " (text)" } else { " (data)" }
			);
		}

		self.state = State::Loaded;
		Ok(())
	}

	fn load_base(&self) -> LoadBase {
		match &self.alloc {
			AllocState::Unified(u) => LoadBase {
				unified: u.data_base() as i64 - self.layout.vma_min as i64,
				text: 0,
				data: 0,
			},
			AllocState::Split(s) => LoadBase {
				unified: 0,
				text: s.text.data_base() as i64 - self.layout.text_vma_lo as i64,
				data: s.data.data_base() as i64 - self.layout.data_vma_lo as i64,
			},
			AllocState::None => LoadBase::default(),
		}
	}

	/// §4.4 step 6: populates the port context with split-region hints, then runs the
	/// relocator's `post_load` and `apply_relocations`.
	pub fn apply_relocations(&mut self) -> Result<()> {
		self.require(State::Loaded)?;
		let reader = self.reader.as_ref().expect("Loaded state implies a reader");
		let load_base = self.load_base();
		let relocator = reloc::for_machine(self.machine, self.port)?;

		let mut mem = match &mut self.alloc {
			AllocState::Unified(u) => Memory::Unified {
				vma_lo: self.layout.vma_min,
				vma_hi: self.layout.vma_max,
				bytes: u.bytes_mut(),
			},
			AllocState::Split(s) => Memory::Split {
				text_vma_lo: self.layout.text_vma_lo,
				text_vma_hi: self.layout.text_vma_hi,
				text: s.text.bytes_mut(),
				data_vma_lo: self.layout.data_vma_lo,
				data_vma_hi: self.layout.data_vma_hi,
				data: s.data.bytes_mut(),
			},
			AllocState::None => return Err(LoaderError::InvalidState("memory not allocated")),
		};

		relocator.post_load(reader, &mut mem, load_base)?;
		relocator.apply_relocations(reader, &mut mem, load_base)?;

		self.state = State::Relocated;
		Ok(())
	}

	/// §4.4 step 7: synchronizes the instruction cache for every allocated region.
	pub fn sync_cache(&mut self) -> Result<()> {
		self.require(State::Relocated)?;
		match &self.alloc {
			AllocState::Unified(u) => {
				self.port.sync_cache(u.data_base(), u.bytes().len())?;
			}
			AllocState::Split(s) => {
				self.port.sync_cache(s.text.data_base(), s.text.bytes().len())?;
				self.port.sync_cache(s.data.data_base(), s.data.bytes().len())?;
			}
			AllocState::None => return Err(LoaderError::InvalidState("memory not allocated")),
		}
		self.state = State::Ready;
		Ok(())
	}

	/// §4.4 step 8: resolves `name` to its RAM address, applying [`MemoryPort::to_exec_addr`]
	/// for `STT_FUNC` symbols. Returns `None` (never an error) for a null/empty name, an
	/// unloaded context, a symbol with `st_value == 0`, or no match — mirroring the source's
	/// "returns `NULL`" contract rather than a pipeline error.
	pub fn get_symbol(&self, name: &str) -> Option<u32> {
		if name.is_empty() {
			return None;
		}
		if !matches!(self.state, State::Relocated | State::Ready) {
			return None;
		}
		let reader = self.reader.as_ref()?;
		let sym = reader
			.iter_symbols()
			.find(|s| s.sym.is_defined() && reader.symbol_name(s) == name)?;

		let in_text = self.layout.has_text && sym.sym.st_value >= self.layout.text_vma_lo && sym.sym.st_value < self.layout.text_vma_hi;

		let (data_addr, exec_ctx) = match &self.alloc {
			AllocState::Split(s) => {
				let (base, vma_lo) = if in_text {
					(s.text.data_base(), self.layout.text_vma_lo)
				} else {
					(s.data.data_base(), self.layout.data_vma_lo)
				};
				(base.wrapping_add(sym.sym.st_value.wrapping_sub(vma_lo)), &s.text.ctx)
			}
			AllocState::Unified(u) => {
				let load_base = u.data_base() as i64 - self.layout.vma_min as i64;
				((sym.sym.st_value as i64 + load_base) as u32, &u.ctx)
			}
			AllocState::None => return None,
		};

		let result = if sym.sym.r#type() == STT_FUNC {
			self.port.to_exec_addr(exec_ctx, data_addr)
		} else {
			data_addr
		};
		Some(result)
	}

	/// §4.4 step 9: frees the allocated region(s) via the port, drops the reader, and resets
	/// to [`State::Empty`]. Valid from any state.
	pub fn cleanup(&mut self) {
		self.alloc = AllocState::None;
		self.reader = None;
		self.machine = 0;
		self.layout = Layout::default();
		self.state = State::Empty;
	}

	/// Consumes a [`State::Ready`] loader and hands its backing region(s) to the caller,
	/// dropping the reader (and releasing its borrow of the image bytes) in the process. Used
	/// by [`crate::reload::ReloadController`], which only needs the loader for the duration of
	/// the pipeline and host-symbol-table population, then keeps the resulting memory resident
	/// on its own.
	pub fn into_regions(self) -> Result<LoadedRegions> {
		self.require(State::Ready)?;
		match self.alloc {
			AllocState::Unified(u) => Ok(LoadedRegions::Unified(u)),
			AllocState::Split(s) => Ok(LoadedRegions::Split(s)),
			AllocState::None => Err(LoaderError::InvalidState("memory not allocated")),
		}
	}
}

/// The backing memory a completed load leaves behind, once the loader itself (and the ELF
/// reader it held) is no longer needed.
pub enum LoadedRegions {
	/// A single unified region.
	Unified(Allocation),
	/// Independent text/data regions.
	Split(SplitAllocation),
}

/// Runs the full pipeline (§4.4 steps 2-7) over `src`, returning a [`State::Ready`] loader, or
/// the first error encountered. On failure the partially-built `Loader` is dropped before
/// returning, releasing whatever it had already allocated.
pub fn load_pipeline<'src>(port: &'src dyn MemoryPort, heap_caps: HeapCaps, src: &'src dyn ByteSource) -> Result<Loader<'src>> {
	let mut loader = Loader::new(port, heap_caps);
	loader.init(src)?;
	loader.plan_layout()?;
	loader.allocate()?;
	loader.load_segments()?;
	loader.apply_relocations()?;
	loader.sync_cache()?;
	Ok(loader)
}
