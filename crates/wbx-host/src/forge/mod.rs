//! Native callback trampolines.
//!
//! A trampoline is a few bytes of generated machine code that forwards a call
//! to `target` with one extra argument, the bound value, appended after the
//! caller's own arguments. It lets a plain function pointer carry context,
//! the way a closure carries its captures:
//!
//! ```text
//! module ──call(a, b, c)──▶ trampoline ──call(a, b, c, bound)──▶ target
//! ```
//!
//! ## Memory
//!
//! Each trampoline owns one page. The page is mapped read+write, the code is
//! copied in, and the page is switched to read+execute before the address is
//! handed out. It is never writable and executable at the same time.
//!
//! ## Kinds
//!
//! - [`TrampolineKind::ReturnPreserving`] calls the target and returns to the
//!   trampoline's caller, behaving like an ordinary function. Use it for
//!   callbacks handed to a module.
//! - [`TrampolineKind::TailRedirect`] jumps into the target, which returns
//!   straight to the original caller. Cheaper, and fine for bound-argument
//!   thunks.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use wbx_host::forge::{Trampoline, TrampolineKind};
//!
//! extern "C" fn on_read(lba: i32, dst: *mut u8, audio: bool, ctx: *mut Host) { ... }
//!
//! let stub = Trampoline::create(on_read as usize, &mut host as *mut _ as usize, 3, TrampolineKind::ReturnPreserving)?;
//! session.register_callback(stub.addr())?;
//! let addr = session.resolve_callback(stub.addr())?;
//! // ... destroy the session first, then the stub
//! stub.destroy()?;
//! ```
//!
//! Only the x86-64 System V ABI is supported.

mod x86_64;

#[cfg(all(unix, target_arch = "x86_64"))]
mod region;


pub use x86_64::{emit as emit_x86_64, MAX_CODE_LEN};

use crate::error::{HostError, Result};
use serde::{Deserialize, Serialize};

#[cfg(all(unix, target_arch = "x86_64"))]
use region::ExecRegion;

/// Largest number of caller arguments a trampoline can forward. The sixth
/// integer argument register is reserved for the bound value.
pub const MAX_ARITY: usize = 5;

/// How control returns from the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrampolineKind {
    /// `call` the target, restore the bound register, `ret` to the caller
    ReturnPreserving,
    /// `jmp` into the target; its `ret` goes to the original caller
    TailRedirect,
}

/// A generated forwarding stub.
///
/// Owned by its creator and destroyed exactly once, by [`Trampoline::destroy`]
/// or on drop. Anything still holding the address afterwards (a session
/// registry, a module that was given it) must not call it.
#[derive(Debug)]
pub struct Trampoline {
    addr: usize,
    len: usize,
    target: usize,
    bound: usize,
    arity: usize,
    kind: TrampolineKind,
    #[cfg(all(unix, target_arch = "x86_64"))]
    region: ExecRegion,
}

impl Trampoline {
    /// Generate a trampoline forwarding `arity` caller arguments plus `bound`
    /// to `target`.
    pub fn create(target: usize, bound: usize, arity: usize, kind: TrampolineKind) -> Result<Self> {
        if arity > MAX_ARITY {
            return Err(HostError::UnsupportedArity {
                arity,
                max: MAX_ARITY,
            });
        }

        Self::map(target, bound, arity, kind)
    }

    #[cfg(all(unix, target_arch = "x86_64"))]
    fn map(target: usize, bound: usize, arity: usize, kind: TrampolineKind) -> Result<Self> {
        let code = x86_64::emit(target as u64, bound as u64, arity, kind);
        let region = ExecRegion::with_code(&code)?;
        let addr = region.addr();

        tracing::debug!(
            "created {:?} trampoline at {:#x} -> {:#x} (arity {})",
            kind,
            addr,
            target,
            arity
        );

        Ok(Self {
            addr,
            len: code.len(),
            target,
            bound,
            arity,
            kind,
            region,
        })
    }

    #[cfg(not(all(unix, target_arch = "x86_64")))]
    fn map(_target: usize, _bound: usize, _arity: usize, _kind: TrampolineKind) -> Result<Self> {
        Err(HostError::UnsupportedPlatform(
            "trampolines require x86-64 with the System V ABI",
        ))
    }

    /// Callable address of the stub.
    pub fn addr(&self) -> usize {
        self.addr
    }

    /// Callable address as a pointer.
    pub fn as_ptr(&self) -> *const std::ffi::c_void {
        self.addr as *const std::ffi::c_void
    }

    /// Reinterpret the stub as a function pointer type.
    ///
    /// # Safety
    ///
    /// `F` must be an `extern "sysv64"` (or `extern "C"` on Unix) function
    /// pointer whose integer parameters match the trampoline's arity, and the
    /// trampoline must outlive every call made through the result.
    pub unsafe fn as_fn<F: Copy>(&self) -> F {
        assert_eq!(std::mem::size_of::<F>(), std::mem::size_of::<usize>());
        std::mem::transmute_copy(&self.addr)
    }

    /// Function the stub forwards to.
    pub fn target(&self) -> usize {
        self.target
    }

    /// Value injected after the caller's arguments.
    pub fn bound(&self) -> usize {
        self.bound
    }

    /// Number of caller arguments forwarded unchanged.
    pub fn arity(&self) -> usize {
        self.arity
    }

    /// Return behavior.
    pub fn kind(&self) -> TrampolineKind {
        self.kind
    }

    /// Length of the emitted code in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Always false; a stub contains at least a jump.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Release the stub's memory.
    pub fn destroy(self) -> Result<()> {
        #[cfg(all(unix, target_arch = "x86_64"))]
        {
            let mut this = self;
            let addr = this.addr;
            this.region.release()?;
            tracing::debug!("destroyed trampoline at {:#x}", addr);
        }
        #[cfg(not(all(unix, target_arch = "x86_64")))]
        drop(self);
        Ok(())
    }
}
