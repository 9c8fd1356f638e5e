//! Host session around one sandboxed module.
//!
//! A [`SandboxSession`] owns one engine instance and tracks the host-side
//! state the engine needs to be driven safely:
//!
//! - **Activation depth**: `enter`/`exit` nest. The module is activated on
//!   the outermost `enter` and deactivated on the matching `exit`, so a host
//!   callback running inside the module can re-enter it without activating
//!   twice. This is a nesting counter, not mutual exclusion; a session
//!   belongs to one thread at a time.
//!
//! Every operation except `destroy` takes `&self`. A callback that only has
//! a pointer to the session reaches it through a shared reference while the
//! code that called into the module still holds its own, guard included.
//! The engine sits in a `RefCell` and is borrowed only for the length of one
//! engine call, never across module execution.
//! - **Callback slots**: host callbacks are registered in order and resolved
//!   to module-visible addresses by slot.
//! - **Seal**: a one-way transition after which the setup is fixed.
//! - **Mounts**: files exposed to the module, read-only or writable.
//!
//! Trampolines registered here stay owned by whoever created them and must
//! outlive the session.

mod registry;

pub use registry::CallbackRegistry;

use crate::config::{MemoryLayout, SessionConfig};
use crate::engine::{EngineFault, EngineResult, ModuleAddr, ModuleEngine};
use crate::error::{fatal, HostError, Result};
use crate::stream::{StreamReader, StreamWriter};
use serde::{Deserialize, Serialize};
use std::cell::{Cell, Ref, RefCell, RefMut};
use std::collections::BTreeMap;
use std::ops::Deref;
use tracing::{debug, info, warn};

/// Access granted to a mounted file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MountMode {
    /// Module may only read; unmounting discards the file
    ReadOnly,
    /// Module may modify; unmounting reads the final content back
    Writable,
}

impl MountMode {
    /// Whether the module may write the file.
    pub fn is_writable(self) -> bool {
        matches!(self, MountMode::Writable)
    }
}

fn fault(op: &'static str) -> impl FnOnce(EngineFault) -> HostError {
    move |fault| HostError::Engine {
        op,
        message: fault.into_message(),
    }
}

/// One loaded module and its host-side bookkeeping.
#[derive(Debug)]
pub struct SandboxSession<E: ModuleEngine> {
    engine: RefCell<E>,
    name: String,
    depth: Cell<u32>,
    callbacks: RefCell<CallbackRegistry>,
    mounts: RefCell<BTreeMap<String, MountMode>>,
    sealed: Cell<bool>,
    destroyed: bool,
}

impl<E: ModuleEngine> SandboxSession<E> {
    /// Load `module` into a new engine instance laid out per `layout`.
    pub fn create(module: &[u8], name: &str, layout: &MemoryLayout) -> Result<Self> {
        let mut reader = StreamReader::new(module);
        let engine = E::create(layout, name, &mut reader).map_err(fault("create"))?;

        info!("loaded module {} ({} bytes)", name, module.len());

        Ok(Self {
            engine: RefCell::new(engine),
            name: name.to_string(),
            depth: Cell::new(0),
            callbacks: RefCell::new(CallbackRegistry::new()),
            mounts: RefCell::new(BTreeMap::new()),
            sealed: Cell::new(false),
            destroyed: false,
        })
    }

    /// Run one engine call. The borrow ends when the call returns.
    fn engine_call<T>(&self, op: &'static str, f: impl FnOnce(&mut E) -> EngineResult<T>) -> Result<T> {
        let mut engine = self.engine.try_borrow_mut().map_err(|_| HostError::EngineBusy(op))?;
        f(&mut *engine).map_err(fault(op))
    }

    /// Read the module file named by `config` and load it.
    pub fn open(config: &SessionConfig) -> Result<Self> {
        let module = std::fs::read(&config.module).map_err(|e| {
            HostError::Io(std::io::Error::new(
                e.kind(),
                format!("could not open file {}: {}", config.module.display(), e),
            ))
        })?;
        let layout = config.layout.to_bytes()?;
        Self::create(&module, &config.module_name(), &layout)
    }

    /// Module name given at creation.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current activation depth.
    pub fn depth(&self) -> u32 {
        self.depth.get()
    }

    /// Whether the module is activated.
    pub fn is_active(&self) -> bool {
        self.depth.get() > 0
    }

    /// Whether [`SandboxSession::seal`] has run.
    pub fn is_sealed(&self) -> bool {
        self.sealed.get()
    }

    /// Registered callbacks.
    pub fn callbacks(&self) -> Ref<'_, CallbackRegistry> {
        self.callbacks.borrow()
    }

    /// Currently mounted files.
    pub fn mounts(&self) -> Ref<'_, BTreeMap<String, MountMode>> {
        self.mounts.borrow()
    }

    /// The engine instance.
    ///
    /// # Panics
    ///
    /// If the engine is mutably borrowed through [`SandboxSession::engine_mut`].
    pub fn engine(&self) -> Ref<'_, E> {
        self.engine.borrow()
    }

    /// The engine instance, mutably.
    ///
    /// # Panics
    ///
    /// If the engine is already borrowed.
    pub fn engine_mut(&self) -> RefMut<'_, E> {
        self.engine.borrow_mut()
    }

    /// Increase the activation depth, activating on 0 → 1.
    pub fn enter(&self) -> Result<()> {
        let depth = self.depth.get();
        if depth == 0 {
            self.engine_call("activate", |e| e.activate())?;
            debug!("activated {}", self.name);
        }

        self.depth.set(depth + 1);
        Ok(())
    }

    /// Decrease the activation depth, deactivating on 1 → 0.
    pub fn exit(&self) -> Result<()> {
        let depth = self.depth.get();
        match depth {
            0 => return Err(HostError::UnbalancedExit),
            1 => {
                self.engine_call("deactivate", |e| e.deactivate())?;
                debug!("deactivated {}", self.name);
            }
            _ => {}
        }

        self.depth.set(depth - 1);
        Ok(())
    }

    /// `enter` now, `exit` when the guard drops. Guards nest.
    pub fn activate(&self) -> Result<ActiveSession<'_, E>> {
        self.enter()?;
        Ok(ActiveSession { session: self })
    }

    /// Address of exported symbol `name`.
    pub fn resolve_symbol(&self, name: &str) -> Result<ModuleAddr> {
        self.engine_call("get_proc_addr", |e| e.proc_addr(name))?
            .ok_or_else(|| HostError::SymbolNotFound(name.to_string()))
    }

    /// Address of exported symbol `name`, without the call-in wrapper.
    pub fn resolve_symbol_raw(&self, name: &str) -> Result<ModuleAddr> {
        self.engine_call("get_proc_addr_raw", |e| e.proc_addr_raw(name))?
            .ok_or_else(|| HostError::SymbolNotFound(name.to_string()))
    }

    /// Wrap a raw module address for calls from the host.
    pub fn callin_address(&self, raw: ModuleAddr) -> Result<ModuleAddr> {
        self.engine_call("get_callin_addr", |e| e.callin_addr(raw))
    }

    /// Register host callback `callback`, returning its slot.
    pub fn register_callback(&self, callback: usize) -> Result<usize> {
        if self.sealed.get() {
            return Err(HostError::SetupSealed("register a callback"));
        }

        let slot = self.callbacks.borrow_mut().register(callback);
        debug!("registered callback {:#x} in slot {}", callback, slot);
        Ok(slot)
    }

    /// Module-visible address for a registered callback. This, not the host
    /// address, is what gets handed to the module.
    pub fn resolve_callback(&self, callback: usize) -> Result<ModuleAddr> {
        let slot = self
            .callbacks
            .borrow()
            .slot_of(callback)
            .ok_or(HostError::CallbackNotRegistered(callback))?;
        self.engine_call("get_callback_addr", |e| e.callback_addr(callback, slot))
    }

    /// Fix the module's setup. Fails if already sealed.
    pub fn seal(&self) -> Result<()> {
        if self.sealed.get() {
            return Err(HostError::DoubleSeal);
        }

        self.engine_call("seal", |e| e.seal())?;
        self.sealed.set(true);
        info!("{} sealed", self.name);
        Ok(())
    }

    /// Expose `data` to the module as file `name`.
    ///
    /// Writable files are part of the module's setup and must be mounted
    /// before [`SandboxSession::seal`]; read-only files may come and go at
    /// any time.
    pub fn mount_file(&self, name: &str, data: &[u8], mode: MountMode) -> Result<()> {
        if mode.is_writable() && self.sealed.get() {
            return Err(HostError::SetupSealed("mount a writable file"));
        }

        let mut reader = StreamReader::new(data);
        self.engine_call("mount_file", |e| e.mount_file(name, &mut reader, mode.is_writable()))?;
        self.mounts.borrow_mut().insert(name.to_string(), mode);
        debug!("mounted {} ({} bytes, {:?})", name, data.len(), mode);
        Ok(())
    }

    /// Mount `data` read-only.
    pub fn mount_readonly(&self, name: &str, data: &[u8]) -> Result<()> {
        self.mount_file(name, data, MountMode::ReadOnly)
    }

    /// Mount `data` writable.
    pub fn mount_writable(&self, name: &str, data: &[u8]) -> Result<()> {
        self.mount_file(name, data, MountMode::Writable)
    }

    /// Unmount a writable file and return its final content.
    pub fn unmount_file(&self, name: &str) -> Result<Vec<u8>> {
        match self.mounts.borrow().get(name) {
            None => return Err(HostError::NotMounted(name.to_string())),
            Some(MountMode::ReadOnly) => return Err(HostError::NotWritable(name.to_string())),
            Some(MountMode::Writable) => {}
        }

        let mut writer = StreamWriter::new();
        self.engine_call("unmount_file", |e| e.unmount_file(name, Some(&mut writer)))?;
        self.mounts.borrow_mut().remove(name);
        debug!("unmounted {} ({} bytes read back)", name, writer.len());
        Ok(writer.into_inner())
    }

    /// Unmount a file without reading it back.
    pub fn unmount_readonly(&self, name: &str) -> Result<()> {
        if !self.mounts.borrow().contains_key(name) {
            return Err(HostError::NotMounted(name.to_string()));
        }

        self.engine_call("unmount_file", |e| e.unmount_file(name, None))?;
        self.mounts.borrow_mut().remove(name);
        debug!("unmounted {}", name);
        Ok(())
    }

    /// Snapshot the module's complete state.
    pub fn save_state(&self) -> Result<Vec<u8>> {
        let mut writer = StreamWriter::new();
        self.engine_call("save_state", |e| e.save_state(&mut writer))?;
        Ok(writer.into_inner())
    }

    /// Restore a snapshot from [`SandboxSession::save_state`].
    pub fn load_state(&self, data: &[u8]) -> Result<()> {
        let mut reader = StreamReader::new(data);
        self.engine_call("load_state", |e| e.load_state(&mut reader))
    }

    /// Release the engine instance.
    pub fn destroy(mut self) -> Result<()> {
        self.release()
    }

    fn release(&mut self) -> Result<()> {
        if self.destroyed {
            return Ok(());
        }
        self.destroyed = true;

        let depth = self.depth.get();
        if depth > 0 {
            warn!("destroying {} while still active (depth {})", self.name, depth);
        }

        self.engine.get_mut().destroy().map_err(fault("destroy"))?;
        info!("destroyed {}", self.name);
        Ok(())
    }
}

impl<E: ModuleEngine> Drop for SandboxSession<E> {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            fatal(&e);
        }
    }
}

/// Activation guard from [`SandboxSession::activate`].
pub struct ActiveSession<'a, E: ModuleEngine> {
    session: &'a SandboxSession<E>,
}

impl<E: ModuleEngine> Deref for ActiveSession<'_, E> {
    type Target = SandboxSession<E>;

    fn deref(&self) -> &Self::Target {
        self.session
    }
}

impl<E: ModuleEngine> Drop for ActiveSession<'_, E> {
    fn drop(&mut self) {
        if let Err(e) = self.session.exit() {
            fatal(&e);
        }
    }
}
