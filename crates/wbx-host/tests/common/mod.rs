//! Recording engine shared by the integration tests.
//!
//! Modules are `FAKE` followed by newline-separated export names. Module
//! memory is a small byte array the tests poke at directly, standing in for
//! writes the module would make while running.

#![allow(dead_code)]

use std::cell::Cell;
use std::collections::HashMap;

use wbx_host::{EngineFault, EngineResult, MemoryLayout, ModuleAddr, ModuleEngine, StreamReader, StreamWriter};

pub const MAGIC: &[u8; 4] = b"FAKE";
pub const SNAPSHOT_MAGIC: &[u8; 4] = b"SNAP";
pub const SYMBOL_BASE: usize = 0x1000_0000;
pub const RAW_OFFSET: usize = 0x8000;
pub const CALLBACK_BASE: usize = 0x3000_0000;
pub const MEMORY_SIZE: usize = 64;

/// Largest chunk the engine requests from a reader at once.
const READ_CHUNK: usize = 5;
/// Largest chunk the engine hands to a writer at once.
const WRITE_CHUNK: usize = 3;

thread_local! {
    /// Engines destroyed on this thread.
    pub static DESTROYED: Cell<u32> = const { Cell::new(0) };
}

pub fn destroyed_count() -> u32 {
    DESTROYED.with(|d| d.get())
}

/// Build a module image exporting `symbols`.
pub fn module_image(symbols: &[&str]) -> Vec<u8> {
    let mut image = MAGIC.to_vec();
    image.extend_from_slice(symbols.join("\n").as_bytes());
    image
}

/// Drain a reader in small chunks, checking the reader contract as we go.
fn drain(reader: &mut StreamReader<'_>) -> Vec<u8> {
    let mut out = Vec::new();
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        let n = reader.read(&mut chunk);
        assert!(n <= READ_CHUNK);
        if n == 0 {
            break;
        }
        out.extend_from_slice(&chunk[..n]);
    }
    assert_eq!(reader.read(&mut chunk), 0);
    out
}

fn push(writer: &mut StreamWriter, data: &[u8]) {
    for chunk in data.chunks(WRITE_CHUNK) {
        writer.write(chunk);
    }
}

#[derive(Debug, Default)]
pub struct FakeEngine {
    pub name: String,
    pub layout: MemoryLayout,
    pub symbols: Vec<String>,
    pub active: bool,
    pub activations: u32,
    pub deactivations: u32,
    pub seals: u32,
    pub callback_slots: HashMap<usize, usize>,
    pub files: HashMap<String, (Vec<u8>, bool)>,
    pub memory: Vec<u8>,
    /// Operation that should report a fault on its next call
    pub fail_on: Option<&'static str>,
    destroyed: bool,
}

impl FakeEngine {
    fn check(&mut self, op: &'static str) -> EngineResult<()> {
        if self.fail_on == Some(op) {
            self.fail_on = None;
            return Err(EngineFault::new(format!("injected {} failure", op)));
        }
        Ok(())
    }

    /// Write to module memory, as the module would.
    pub fn poke(&mut self, offset: usize, value: u8) {
        self.memory[offset] = value;
    }

    /// Read module memory.
    pub fn peek(&self, offset: usize) -> u8 {
        self.memory[offset]
    }

    /// Change a mounted file's content, as the module would.
    pub fn mutate_file(&mut self, name: &str, f: impl FnOnce(&mut Vec<u8>)) {
        let (content, writable) = self.files.get_mut(name).expect("file not mounted");
        assert!(*writable, "module cannot write a read-only file");
        f(content);
    }

    /// Host address behind a module-visible callback address.
    pub fn callback_at(&self, addr: ModuleAddr) -> usize {
        let slot = (addr.as_usize() - CALLBACK_BASE) / 0x10;
        *self.callback_slots.get(&slot).expect("no callback in slot")
    }
}

impl ModuleEngine for FakeEngine {
    fn create(layout: &MemoryLayout, module_name: &str, module: &mut StreamReader<'_>) -> EngineResult<Self> {
        let image = drain(module);
        if !image.starts_with(MAGIC) {
            return Err(EngineFault::new("bad module header"));
        }

        let symbols = std::str::from_utf8(&image[MAGIC.len()..])
            .map_err(|_| EngineFault::new("export table is not utf-8"))?
            .split('\n')
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();

        Ok(Self {
            name: module_name.to_string(),
            layout: *layout,
            symbols,
            memory: vec![0; MEMORY_SIZE],
            ..Default::default()
        })
    }

    fn activate(&mut self) -> EngineResult<()> {
        self.check("activate")?;
        if self.active {
            return Err(EngineFault::new("already active"));
        }
        self.active = true;
        self.activations += 1;
        Ok(())
    }

    fn deactivate(&mut self) -> EngineResult<()> {
        self.check("deactivate")?;
        if !self.active {
            return Err(EngineFault::new("not active"));
        }
        self.active = false;
        self.deactivations += 1;
        Ok(())
    }

    fn proc_addr(&mut self, name: &str) -> EngineResult<Option<ModuleAddr>> {
        self.check("proc_addr")?;
        Ok(self
            .symbols
            .iter()
            .position(|s| s == name)
            .map(|i| ModuleAddr(SYMBOL_BASE + i * 0x10)))
    }

    fn proc_addr_raw(&mut self, name: &str) -> EngineResult<Option<ModuleAddr>> {
        Ok(self.proc_addr(name)?.map(|addr| ModuleAddr(addr.as_usize() + RAW_OFFSET)))
    }

    fn callin_addr(&mut self, raw: ModuleAddr) -> EngineResult<ModuleAddr> {
        raw.as_usize()
            .checked_sub(RAW_OFFSET)
            .map(ModuleAddr)
            .ok_or_else(|| EngineFault::new("not a raw address"))
    }

    fn callback_addr(&mut self, callback: usize, slot: usize) -> EngineResult<ModuleAddr> {
        self.check("callback_addr")?;
        match self.callback_slots.get(&slot) {
            Some(&existing) if existing != callback => {
                return Err(EngineFault::new(format!("slot {} already holds {:#x}", slot, existing)));
            }
            _ => {}
        }
        self.callback_slots.insert(slot, callback);
        Ok(ModuleAddr(CALLBACK_BASE + slot * 0x10))
    }

    fn seal(&mut self) -> EngineResult<()> {
        self.check("seal")?;
        self.seals += 1;
        Ok(())
    }

    fn mount_file(&mut self, name: &str, content: &mut StreamReader<'_>, writable: bool) -> EngineResult<()> {
        self.check("mount_file")?;
        if self.files.contains_key(name) {
            return Err(EngineFault::new(format!("{} already mounted", name)));
        }
        let data = drain(content);
        self.files.insert(name.to_string(), (data, writable));
        Ok(())
    }

    fn unmount_file(&mut self, name: &str, readback: Option<&mut StreamWriter>) -> EngineResult<()> {
        self.check("unmount_file")?;
        let (data, writable) = self
            .files
            .remove(name)
            .ok_or_else(|| EngineFault::new(format!("{} not mounted", name)))?;
        if let Some(out) = readback {
            if !writable {
                return Err(EngineFault::new("read-only files cannot be read back"));
            }
            push(out, &data);
        }
        Ok(())
    }

    fn save_state(&mut self, out: &mut StreamWriter) -> EngineResult<()> {
        self.check("save_state")?;
        push(out, SNAPSHOT_MAGIC);
        push(out, &(self.memory.len() as u32).to_le_bytes());
        push(out, &self.memory);
        Ok(())
    }

    fn load_state(&mut self, input: &mut StreamReader<'_>) -> EngineResult<()> {
        self.check("load_state")?;
        let blob = drain(input);
        if blob.len() < 8 || &blob[..4] != SNAPSHOT_MAGIC {
            return Err(EngineFault::new("bad snapshot header"));
        }
        let len = u32::from_le_bytes([blob[4], blob[5], blob[6], blob[7]]) as usize;
        if blob.len() != 8 + len || len != self.memory.len() {
            return Err(EngineFault::new("snapshot size mismatch"));
        }
        self.memory.copy_from_slice(&blob[8..]);
        Ok(())
    }

    fn destroy(&mut self) -> EngineResult<()> {
        self.check("destroy")?;
        if self.destroyed {
            return Err(EngineFault::new("destroyed twice"));
        }
        self.destroyed = true;
        DESTROYED.with(|d| d.set(d.get() + 1));
        Ok(())
    }
}
