//! Host-facing configuration (§6, §10 AMBIENT STACK): the `LoadConfig` a caller passes to
//! [`crate::reload::ReloadController`] and the memory-port family selection, both plain
//! `serde` types loadable from TOML or JSON host config files.

use crate::port::{MemoryPort, RiscvSplitBusPort, UnifiedPort, XtensaClassicPort, XtensaFixedOffsetPort, XtensaMmuPort};
use serde::{Deserialize, Serialize};

/// Allocation-capability hint passed verbatim to the port; `0` means "port chooses" (§6).
pub type HeapCaps = u32;

/// Default storage partition label, matching the source's `"hotreload"` default.
pub const DEFAULT_PARTITION_LABEL: &str = "hotreload";

/// Selects which of the five target families' [`MemoryPort`] a [`ReloadController`] uses.
///
/// [`ReloadController`]: crate::reload::ReloadController
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum MemoryPortKind {
	/// F-Unified: instruction and data addresses are identical.
	#[default]
	Unified,
	/// F-Xtensa-classic: split text/data allocation, no address translation.
	XtensaClassic,
	/// F-Xtensa-MMU: external RAM mapped into the instruction bus via per-page MMU entries.
	XtensaMmu,
	/// F-Xtensa-fixed-offset: external RAM reached through a fixed IROM/DROM offset.
	XtensaFixedOffset,
	/// F-RISC-V-split-bus: separate I-bus/D-bus address spaces joined by a fixed offset.
	RiscvSplitBus,
}

impl MemoryPortKind {
	/// Constructs the default port instance for this family.
	pub fn build(self) -> Box<dyn MemoryPort> {
		match self {
			Self::Unified => Box::new(UnifiedPort),
			Self::XtensaClassic => Box::new(XtensaClassicPort),
			Self::XtensaMmu => Box::new(XtensaMmuPort::default()),
			Self::XtensaFixedOffset => Box::new(XtensaFixedOffsetPort::default()),
			Self::RiscvSplitBus => Box::new(RiscvSplitBusPort::default()),
		}
	}
}

/// Host-supplied configuration for a load/reload (§6 "Configuration" table).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LoadConfig {
	/// Storage partition name; defaults to `"hotreload"`.
	#[serde(default = "default_partition_label")]
	pub partition_label: String,
	/// Allocation-hint word passed verbatim to the port.
	#[serde(default)]
	pub heap_caps: HeapCaps,
	/// Which memory-port family to construct for this load.
	#[serde(default)]
	pub port_kind: MemoryPortKind,
}

fn default_partition_label() -> String {
	DEFAULT_PARTITION_LABEL.to_string()
}

impl Default for LoadConfig {
	fn default() -> Self {
		Self {
			partition_label: default_partition_label(),
			heap_caps: 0,
			port_kind: MemoryPortKind::default(),
		}
	}
}

impl LoadConfig {
	/// Parses a [`LoadConfig`] from a TOML document.
	pub fn from_toml(s: &str) -> Result<Self, toml::de::Error> {
		toml::from_str(s)
	}

	/// Parses a [`LoadConfig`] from a JSON document.
	pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
		serde_json::from_str(s)
	}
}
