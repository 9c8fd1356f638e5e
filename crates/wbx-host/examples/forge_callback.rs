//! Bind host context to a plain C callback with a trampoline.
//!
//! Run with: cargo run -p wbx-host --example forge_callback

use wbx_host::{OrAbort, Trampoline, TrampolineKind};

/// State the callback needs but the caller knows nothing about.
struct InputHost {
    polls: u32,
    pressed: u16,
}

/// Called by the "module" as `poll(port)`; the trampoline adds `host`.
extern "sysv64" fn poll_input(port: usize, host: *mut InputHost) -> usize {
    let host = unsafe { &mut *host };
    host.polls += 1;
    if port == 0 {
        host.pressed as usize
    } else {
        0
    }
}

/// Stand-in for module code that only has a bare function pointer.
fn run_frames(poll: extern "sysv64" fn(usize) -> usize, frames: usize) -> usize {
    (0..frames).map(|_| poll(0) + poll(1)).sum()
}

fn main() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_target(false)
        .init();

    let mut host = InputHost { polls: 0, pressed: 0x0011 };
    let stub = Trampoline::create(
        poll_input as usize,
        &mut host as *mut InputHost as usize,
        1,
        TrampolineKind::ReturnPreserving,
    )
    .or_abort();

    println!("trampoline at {:#x} ({} bytes)", stub.addr(), stub.len());

    let poll: extern "sysv64" fn(usize) -> usize = unsafe { stub.as_fn() };
    let total = run_frames(poll, 60);

    stub.destroy().or_abort();

    println!("60 frames: {} polls, input sum {:#x}", host.polls, total);
}
