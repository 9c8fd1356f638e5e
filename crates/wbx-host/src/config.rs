//! Memory layout and session configuration.

use crate::error::{HostError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Segment budgets in kilobytes, as supplied by users and config files.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayoutKb {
    /// Growable heap (sbrk) budget
    pub sbrk_kb: usize,

    /// Heap that becomes read-only at seal
    pub sealed_kb: usize,

    /// Region excluded from state snapshots
    pub invis_kb: usize,

    /// Plain read-write region
    pub plain_kb: usize,

    /// Region serving module mmap requests
    pub mmap_kb: usize,
}

impl LayoutKb {
    /// Create a layout from the five budgets, in kilobytes.
    pub fn new(sbrk_kb: usize, sealed_kb: usize, invis_kb: usize, plain_kb: usize, mmap_kb: usize) -> Self {
        Self {
            sbrk_kb,
            sealed_kb,
            invis_kb,
            plain_kb,
            mmap_kb,
        }
    }

    /// Scale to bytes.
    pub fn to_bytes(&self) -> Result<MemoryLayout> {
        MemoryLayout::from_kb(*self)
    }
}

/// Segment sizes in bytes, in the shape the engine expects.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryLayout {
    /// Growable heap (sbrk) size
    pub sbrk_size: usize,
    /// Sealed heap size
    pub sealed_size: usize,
    /// Invisible region size
    pub invis_size: usize,
    /// Plain region size
    pub plain_size: usize,
    /// Mmap region size
    pub mmap_size: usize,
}

impl MemoryLayout {
    /// Scale kilobyte budgets by 1024.
    pub fn from_kb(kb: LayoutKb) -> Result<Self> {
        let scale = |name: &str, value: usize| {
            value
                .checked_mul(1024)
                .ok_or_else(|| HostError::Config(format!("{} of {}KB overflows", name, value)))
        };

        Ok(Self {
            sbrk_size: scale("sbrk", kb.sbrk_kb)?,
            sealed_size: scale("sealed", kb.sealed_kb)?,
            invis_size: scale("invis", kb.invis_kb)?,
            plain_size: scale("plain", kb.plain_kb)?,
            mmap_size: scale("mmap", kb.mmap_kb)?,
        })
    }

    /// Sum of all segments, saturating.
    pub fn total(&self) -> usize {
        [
            self.sbrk_size,
            self.sealed_size,
            self.invis_size,
            self.plain_size,
            self.mmap_size,
        ]
        .iter()
        .fold(0usize, |acc, size| acc.saturating_add(*size))
    }
}

/// Everything needed to open a session from disk.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Path to the module binary
    pub module: PathBuf,

    /// Segment budgets
    #[serde(default)]
    pub layout: LayoutKb,
}

impl SessionConfig {
    /// Create a config for `module` with an empty layout.
    pub fn new(module: impl Into<PathBuf>) -> Self {
        Self {
            module: module.into(),
            layout: LayoutKb::default(),
        }
    }

    /// Load a config from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    /// Parse a config from JSON text.
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Serialize to pretty JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Builder: set the layout
    pub fn with_layout(mut self, layout: LayoutKb) -> Self {
        self.layout = layout;
        self
    }

    /// Builder: set the sbrk budget
    pub fn with_sbrk_kb(mut self, kb: usize) -> Self {
        self.layout.sbrk_kb = kb;
        self
    }

    /// Builder: set the sealed budget
    pub fn with_sealed_kb(mut self, kb: usize) -> Self {
        self.layout.sealed_kb = kb;
        self
    }

    /// Builder: set the invisible budget
    pub fn with_invis_kb(mut self, kb: usize) -> Self {
        self.layout.invis_kb = kb;
        self
    }

    /// Builder: set the plain budget
    pub fn with_plain_kb(mut self, kb: usize) -> Self {
        self.layout.plain_kb = kb;
        self
    }

    /// Builder: set the mmap budget
    pub fn with_mmap_kb(mut self, kb: usize) -> Self {
        self.layout.mmap_kb = kb;
        self
    }

    /// Module name reported to the engine (file name of the module path).
    pub fn module_name(&self) -> String {
        self.module
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.module.to_string_lossy().into_owned())
    }
}
