//! Dynamic ELF32 code loader enabling hot-reload of native code on an embedded target, without
//! rebooting.
//!
//! A host application boots with compile-time stub functions whose bodies indirect through a
//! symbol table; this crate fills that table by fetching an ELF32 image from non-volatile
//! storage (or an in-RAM buffer), placing its code and data into executable memory, and
//! resolving relocations so that calls to the loaded symbols run the freshly-loaded code.
//!
//! The crate is organized as five components:
//!
//! - [`elf`] (C1): parses and caches ELF32 header tables over a caller-supplied [`elf::reader::ByteSource`].
//! - [`port`] (C2): per-target allocation, execution-mapping, and address translation.
//! - [`reloc`] (C3): architecture-aware RELA relocation patching (Xtensa, RISC-V).
//! - [`loader`] (C4): the state-machine pipeline tying C1-C3 together for one load.
//! - [`reload`] (C5): the single-slot lifecycle manager (`load`/`unload`/`reload`) and the
//!   cooperative update-pending flag, built on top of [`loader`].
//!
//! [`config`] carries host-facing configuration (`serde`-backed, loadable from TOML/JSON), and
//! [`error`] carries the crate's single error type.

pub mod config;
pub mod elf;
pub mod error;
pub mod loader;
pub mod port;
pub mod reloc;
pub mod reload;

#[cfg(test)]
mod test_support;

pub use config::{LoadConfig, MemoryPortKind};
pub use error::{ErrorKind, LoaderError, Result};
pub use loader::{LoadedRegions, Loader};
pub use reload::{BufferPartitionSource, PartitionHandle, PartitionSource, ReloadController};
