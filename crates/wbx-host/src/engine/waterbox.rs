//! Bindings to the native waterbox host library.
//!
//! Every `wbx_*` entry point fills a return-data struct: an error message,
//! empty on success, and a data pointer. A non-empty message becomes an
//! [`EngineFault`].

use super::{EngineFault, EngineResult, ModuleAddr, ModuleEngine};
use crate::config::MemoryLayout;
use crate::stream::{read_thunk, write_thunk, StreamReader, StreamWriter};
use std::ffi::{c_char, c_int, c_void, CString};
use std::ptr::{self, NonNull};

type ReadCallback = unsafe extern "C" fn(userdata: *mut c_void, data: *mut c_void, size: usize) -> usize;
type WriteCallback = unsafe extern "C" fn(userdata: *mut c_void, data: *mut c_void, size: usize) -> i32;

const ERROR_MESSAGE_LEN: usize = 1024;

#[repr(C)]
struct ReturnData {
    error_message: [c_char; ERROR_MESSAGE_LEN],
    data: *mut c_void,
}

impl ReturnData {
    fn new() -> Self {
        Self {
            error_message: [0; ERROR_MESSAGE_LEN],
            data: ptr::null_mut(),
        }
    }

    fn into_result(self) -> EngineResult<*mut c_void> {
        if self.error_message[0] == 0 {
            return Ok(self.data);
        }

        // not trusting the engine to terminate a full buffer
        let bytes: Vec<u8> = self
            .error_message
            .iter()
            .take_while(|&&c| c != 0)
            .map(|&c| c as u8)
            .collect();
        Err(EngineFault::new(String::from_utf8_lossy(&bytes).into_owned()))
    }
}

#[link(name = "waterboxhost")]
extern "C" {
    fn wbx_create_host(
        layout: *const MemoryLayout,
        module_name: *const c_char,
        wbx: ReadCallback,
        userdata: *mut c_void,
        ret: *mut ReturnData,
    );
    fn wbx_destroy_host(obj: *mut c_void, ret: *mut ReturnData);
    fn wbx_activate_host(obj: *mut c_void, ret: *mut ReturnData);
    fn wbx_deactivate_host(obj: *mut c_void, ret: *mut ReturnData);
    fn wbx_get_proc_addr(obj: *mut c_void, name: *const c_char, ret: *mut ReturnData);
    fn wbx_get_callin_addr(obj: *mut c_void, ptr: *mut c_void, ret: *mut ReturnData);
    fn wbx_get_proc_addr_raw(obj: *mut c_void, name: *const c_char, ret: *mut ReturnData);
    fn wbx_get_callback_addr(obj: *mut c_void, callback: *mut c_void, slot: c_int, ret: *mut ReturnData);
    fn wbx_seal(obj: *mut c_void, ret: *mut ReturnData);
    fn wbx_mount_file(
        obj: *mut c_void,
        name: *const c_char,
        reader: ReadCallback,
        userdata: *mut c_void,
        writable: bool,
        ret: *mut ReturnData,
    );
    fn wbx_unmount_file(
        obj: *mut c_void,
        name: *const c_char,
        writer: Option<WriteCallback>,
        userdata: *mut c_void,
        ret: *mut ReturnData,
    );
    fn wbx_save_state(obj: *mut c_void, writer: WriteCallback, userdata: *mut c_void, ret: *mut ReturnData);
    fn wbx_load_state(obj: *mut c_void, reader: ReadCallback, userdata: *mut c_void, ret: *mut ReturnData);
    fn wbx_set_always_evict_blocks(val: bool);
}

fn invoke(f: impl FnOnce(*mut ReturnData)) -> EngineResult<*mut c_void> {
    let mut ret = ReturnData::new();
    f(&mut ret);
    ret.into_result()
}

fn c_string(value: &str) -> EngineResult<CString> {
    CString::new(value).map_err(|_| EngineFault::new(format!("{:?} contains a NUL byte", value)))
}

fn module_addr(ptr: *mut c_void) -> Option<ModuleAddr> {
    if ptr.is_null() {
        None
    } else {
        Some(ModuleAddr(ptr as usize))
    }
}

fn reader_userdata(reader: &mut StreamReader<'_>) -> *mut c_void {
    reader as *mut StreamReader<'_> as *mut c_void
}

fn writer_userdata(writer: &mut StreamWriter) -> *mut c_void {
    writer as *mut StreamWriter as *mut c_void
}

/// A module hosted by libwaterboxhost.
#[derive(Debug)]
pub struct WaterboxEngine {
    host: NonNull<c_void>,
}

impl WaterboxEngine {
    /// Process-wide switch forcing the engine to evict every dirty block on
    /// deactivate. Slow; useful when hunting state leaks.
    pub fn set_always_evict_blocks(val: bool) {
        unsafe { wbx_set_always_evict_blocks(val) }
    }

    fn obj(&self) -> *mut c_void {
        self.host.as_ptr()
    }
}

impl ModuleEngine for WaterboxEngine {
    fn create(layout: &MemoryLayout, module_name: &str, module: &mut StreamReader<'_>) -> EngineResult<Self> {
        let name = c_string(module_name)?;
        let data = invoke(|ret| unsafe {
            wbx_create_host(layout, name.as_ptr(), read_thunk, reader_userdata(module), ret)
        })?;
        let host = NonNull::new(data).ok_or_else(|| EngineFault::new("engine returned no host"))?;
        Ok(Self { host })
    }

    fn activate(&mut self) -> EngineResult<()> {
        invoke(|ret| unsafe { wbx_activate_host(self.obj(), ret) }).map(|_| ())
    }

    fn deactivate(&mut self) -> EngineResult<()> {
        invoke(|ret| unsafe { wbx_deactivate_host(self.obj(), ret) }).map(|_| ())
    }

    fn proc_addr(&mut self, name: &str) -> EngineResult<Option<ModuleAddr>> {
        let name = c_string(name)?;
        invoke(|ret| unsafe { wbx_get_proc_addr(self.obj(), name.as_ptr(), ret) }).map(module_addr)
    }

    fn proc_addr_raw(&mut self, name: &str) -> EngineResult<Option<ModuleAddr>> {
        let name = c_string(name)?;
        invoke(|ret| unsafe { wbx_get_proc_addr_raw(self.obj(), name.as_ptr(), ret) }).map(module_addr)
    }

    fn callin_addr(&mut self, raw: ModuleAddr) -> EngineResult<ModuleAddr> {
        let data = invoke(|ret| unsafe { wbx_get_callin_addr(self.obj(), raw.as_usize() as *mut c_void, ret) })?;
        Ok(ModuleAddr(data as usize))
    }

    fn callback_addr(&mut self, callback: usize, slot: usize) -> EngineResult<ModuleAddr> {
        let slot = c_int::try_from(slot).map_err(|_| EngineFault::new(format!("callback slot {} out of range", slot)))?;
        let data = invoke(|ret| unsafe {
            wbx_get_callback_addr(self.obj(), callback as *mut c_void, slot, ret)
        })?;
        Ok(ModuleAddr(data as usize))
    }

    fn seal(&mut self) -> EngineResult<()> {
        invoke(|ret| unsafe { wbx_seal(self.obj(), ret) }).map(|_| ())
    }

    fn mount_file(&mut self, name: &str, content: &mut StreamReader<'_>, writable: bool) -> EngineResult<()> {
        let name = c_string(name)?;
        invoke(|ret| unsafe {
            wbx_mount_file(self.obj(), name.as_ptr(), read_thunk, reader_userdata(content), writable, ret)
        })
        .map(|_| ())
    }

    fn unmount_file(&mut self, name: &str, readback: Option<&mut StreamWriter>) -> EngineResult<()> {
        let name = c_string(name)?;
        let (writer, userdata): (Option<WriteCallback>, *mut c_void) = match readback {
            Some(out) => (Some(write_thunk), writer_userdata(out)),
            None => (None, ptr::null_mut()),
        };
        invoke(|ret| unsafe { wbx_unmount_file(self.obj(), name.as_ptr(), writer, userdata, ret) }).map(|_| ())
    }

    fn save_state(&mut self, out: &mut StreamWriter) -> EngineResult<()> {
        invoke(|ret| unsafe { wbx_save_state(self.obj(), write_thunk, writer_userdata(out), ret) }).map(|_| ())
    }

    fn load_state(&mut self, input: &mut StreamReader<'_>) -> EngineResult<()> {
        invoke(|ret| unsafe { wbx_load_state(self.obj(), read_thunk, reader_userdata(input), ret) }).map(|_| ())
    }

    fn destroy(&mut self) -> EngineResult<()> {
        invoke(|ret| unsafe { wbx_destroy_host(self.obj(), ret) }).map(|_| ())
    }
}
