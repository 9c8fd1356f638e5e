//! # WBX Host
//!
//! Host-side plumbing for running sandboxed modules: native callback
//! trampolines and a session type that drives one module instance through
//! load, activation, seal, snapshot and unload.
//!
//! ## Pieces
//!
//! | Module | Role |
//! |--------|------|
//! | [`stream`] | Pull/push byte cursors used for module loading, mounts and snapshots |
//! | [`config`] | Memory layout (KB inputs scaled to bytes) and session config files |
//! | [`forge`] | Generated x86-64 stubs that append a bound argument to a call |
//! | [`engine`] | The trait the opaque module engine is driven through |
//! | [`session`] | Activation nesting, callback slots, seal, mounts, state |
//!
//! ## Callback flow
//!
//! ```text
//! host fn + context ──forge──▶ trampoline ──register──▶ slot N
//!                                                         │
//!        module ◀── module-visible address ◀──resolve─────┘
//!
//! module calls address ─▶ trampoline ─▶ host fn(args..., context)
//! ```
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use wbx_host::{LayoutKb, SandboxSession, Trampoline, TrampolineKind, WaterboxEngine};
//!
//! let layout = LayoutKb::new(512, 4 * 1024, 4 * 1024, 34 * 1024, 1024).to_bytes()?;
//! let session = SandboxSession::<WaterboxEngine>::create(&module, "gpgx.wbx", &layout)?;
//!
//! let stub = Trampoline::create(on_cd_read as usize, ctx, 3, TrampolineKind::ReturnPreserving)?;
//! {
//!     let active = session.activate()?;
//!     active.register_callback(stub.addr())?;
//!     let cb = active.resolve_callback(stub.addr())?;
//!     let init = active.resolve_symbol("gpgx_init")?;
//!     // ... hand `cb` to the module through `init`
//!     active.seal()?;
//! }
//!
//! session.destroy()?;
//! stub.destroy()?;
//! ```
//!
//! ## Features
//!
//! - `forge` (default) - runtime trampoline generation
//! - `waterbox` - bindings to the native waterbox host library
//! - `full` - all features enabled
//!
//! ## Errors
//!
//! Every failure here is a programming error or corrupt input. Operations
//! return [`Result`]; callers that follow the abort-on-failure policy use
//! [`OrAbort::or_abort`].

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod config;
pub mod engine;
pub mod error;
pub mod session;
pub mod stream;

#[cfg(feature = "forge")]
pub mod forge;

// Re-export main types
pub use config::{LayoutKb, MemoryLayout, SessionConfig};
pub use engine::{EngineFault, EngineResult, ModuleAddr, ModuleEngine};
pub use error::{fatal, HostError, OrAbort, Result};
pub use session::{ActiveSession, CallbackRegistry, MountMode, SandboxSession};
pub use stream::{StreamReader, StreamWriter};

#[cfg(feature = "forge")]
pub use forge::{Trampoline, TrampolineKind, MAX_ARITY};

#[cfg(feature = "waterbox")]
pub use engine::WaterboxEngine;
