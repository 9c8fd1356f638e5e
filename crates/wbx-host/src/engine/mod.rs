//! The seam to the sandboxed-module engine.
//!
//! The engine owns the module's binary format, its memory and its execution.
//! The host only ever talks to it through [`ModuleEngine`]; every call comes
//! back with data or an [`EngineFault`] carrying the engine's message.

#[cfg(feature = "waterbox")]
mod waterbox;

#[cfg(feature = "waterbox")]
pub use waterbox::WaterboxEngine;

use crate::config::MemoryLayout;
use crate::stream::{StreamReader, StreamWriter};
use std::fmt;

/// An address as seen from inside the module.
///
/// The module and the host may not share one view of memory, so these are
/// kept apart from host addresses such as trampoline handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ModuleAddr(pub usize);

impl ModuleAddr {
    /// Raw address value.
    pub fn as_usize(self) -> usize {
        self.0
    }

    /// Address as a pointer.
    pub fn as_ptr(self) -> *const std::ffi::c_void {
        self.0 as *const std::ffi::c_void
    }
}

impl fmt::Display for ModuleAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Error message reported by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineFault {
    message: String,
}

impl EngineFault {
    /// Wrap an engine message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// The engine's message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Take the message.
    pub fn into_message(self) -> String {
        self.message
    }
}

impl fmt::Display for EngineFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// Result of an engine call.
pub type EngineResult<T> = std::result::Result<T, EngineFault>;

/// One loaded module instance inside the engine.
pub trait ModuleEngine: Sized {
    /// Load a module from `module`, laid out per `layout`.
    fn create(layout: &MemoryLayout, module_name: &str, module: &mut StreamReader<'_>) -> EngineResult<Self>;

    /// Make the module's memory live in the calling context.
    fn activate(&mut self) -> EngineResult<()>;

    /// Undo [`ModuleEngine::activate`].
    fn deactivate(&mut self) -> EngineResult<()>;

    /// Exported symbol, wrapped for calls from the host. `None` if not exported.
    fn proc_addr(&mut self, name: &str) -> EngineResult<Option<ModuleAddr>>;

    /// Exported symbol without the call-in wrapper. `None` if not exported.
    fn proc_addr_raw(&mut self, name: &str) -> EngineResult<Option<ModuleAddr>>;

    /// Wrap a raw module address for calls from the host.
    fn callin_addr(&mut self, raw: ModuleAddr) -> EngineResult<ModuleAddr>;

    /// Module-visible address of host callback `callback` occupying `slot`.
    fn callback_addr(&mut self, callback: usize, slot: usize) -> EngineResult<ModuleAddr>;

    /// Fix the module's setup.
    fn seal(&mut self) -> EngineResult<()>;

    /// Expose `content` to the module as file `name`.
    fn mount_file(&mut self, name: &str, content: &mut StreamReader<'_>, writable: bool) -> EngineResult<()>;

    /// Remove file `name`, writing its final content to `readback` if given.
    fn unmount_file(&mut self, name: &str, readback: Option<&mut StreamWriter>) -> EngineResult<()>;

    /// Write a complete snapshot of the module's state.
    fn save_state(&mut self, out: &mut StreamWriter) -> EngineResult<()>;

    /// Restore a snapshot produced by [`ModuleEngine::save_state`].
    fn load_state(&mut self, input: &mut StreamReader<'_>) -> EngineResult<()>;

    /// Release the module instance. Called exactly once.
    fn destroy(&mut self) -> EngineResult<()>;
}
