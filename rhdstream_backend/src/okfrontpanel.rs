//! Runtime binding of the Opal Kelly FrontPanel C API.
//!
//! ## Overview
//!
//! The evaluation board is an Opal Kelly XEM6010 FPGA module. Its host library ships with the board
//! software rather than with the system, so [`OkFrontPanel`] loads it from a caller-provided path with
//! `dlopen` and resolves the handful of C entry points it needs with `dlsym`. A missing library or symbol is
//! reported as [`RhdError::DeviceNotFound`].
//!
//! Every FrontPanel call returning an error code goes through [`ok_call`], which maps negative codes to
//! [`RhdError`] variants chosen by the caller and logs them.
//!
//! ## Cleanup
//!
//! `OkFrontPanel` implements `Drop`: the device is closed, the FrontPanel handle destroyed and the library
//! unloaded.
//!
//! ## Example
//!
//! ```ignore
//! use rhdstream_backend::okfrontpanel::OkFrontPanel;
//! use rhdstream_backend::transport::*;
//!
//! let mut board = OkFrontPanel::new();
//! board.open("libokFrontPanel.so".as_ref())?;
//! board.upload_bitstream("main.bit".as_ref())?;
//! println!("board id {}", board.board_id()?);
//! ```

use std::ffi::{CStr, CString};
use std::path::Path;
use std::time::Duration;

use crate::transport::{endpoint, not_open, Transport};
use rhd_backend::error::{Result, RhdError};

type OkHandle = *mut libc::c_void;
type CInt = libc::c_int;
type CLong = libc::c_long;
type CULong = libc::c_ulong;
type CConstStr = *const libc::c_char;

const PIPE_OUT_FIFO: CInt = 0xA0;

pub const OK_NO_ERROR: CInt = 0;
pub const OK_FAILED: CInt = -1;
pub const OK_TIMEOUT: CInt = -2;
pub const OK_DONE_NOT_HIGH: CInt = -3;
pub const OK_TRANSFER_ERROR: CInt = -4;
pub const OK_COMMUNICATION_ERROR: CInt = -5;
pub const OK_INVALID_BITSTREAM: CInt = -6;
pub const OK_FILE_ERROR: CInt = -7;
pub const OK_DEVICE_NOT_OPEN: CInt = -8;
pub const OK_INVALID_ENDPOINT: CInt = -9;

struct Api {
    construct: unsafe extern "C" fn() -> OkHandle,
    destruct: unsafe extern "C" fn(OkHandle),
    get_device_count: unsafe extern "C" fn(OkHandle) -> CInt,
    open_by_serial: unsafe extern "C" fn(OkHandle, CConstStr) -> CInt,
    is_open: unsafe extern "C" fn(OkHandle) -> CInt,
    close: unsafe extern "C" fn(OkHandle),
    configure_fpga: unsafe extern "C" fn(OkHandle, CConstStr) -> CInt,
    set_timeout: unsafe extern "C" fn(OkHandle, CInt),
    set_wire_in_value: unsafe extern "C" fn(OkHandle, CInt, CULong, CULong) -> CInt,
    update_wire_ins: unsafe extern "C" fn(OkHandle),
    update_wire_outs: unsafe extern "C" fn(OkHandle),
    get_wire_out_value: unsafe extern "C" fn(OkHandle, CInt) -> CULong,
    activate_trigger_in: unsafe extern "C" fn(OkHandle, CInt, CInt) -> CInt,
    read_from_pipe_out: unsafe extern "C" fn(OkHandle, CInt, CLong, *mut u8) -> CLong,
}

fn error_name(code: CInt) -> &'static str {
    match code {
        OK_FAILED => "Failed",
        OK_TIMEOUT => "Timeout",
        OK_DONE_NOT_HIGH => "DoneNotHigh",
        OK_TRANSFER_ERROR => "TransferError",
        OK_COMMUNICATION_ERROR => "CommunicationError",
        OK_INVALID_BITSTREAM => "InvalidBitstream",
        OK_FILE_ERROR => "FileError",
        OK_DEVICE_NOT_OPEN => "DeviceNotOpen",
        OK_INVALID_ENDPOINT => "InvalidEndpoint",
        _ => "UnknownError",
    }
}

/// Checks a FrontPanel error code.
///
/// Negative codes are logged and converted with `to_error`, which receives a readable description of the
/// code. Communication failures and a closed device always map to [`RhdError::DeviceUnreachable`]
/// regardless of `to_error`, since no further call can succeed.
pub fn ok_call<F: FnOnce(String) -> RhdError>(code: CInt, to_error: F) -> Result<()> {
    if code >= OK_NO_ERROR {
        return Ok(());
    }
    let msg = format!("FrontPanel error {} ({})", code, error_name(code));
    log::error!("{}", msg);
    match code {
        OK_COMMUNICATION_ERROR | OK_DEVICE_NOT_OPEN => Err(RhdError::DeviceUnreachable(msg)),
        _ => Err(to_error(msg)),
    }
}

fn dl_error() -> String {
    let err = unsafe { libc::dlerror() };
    if err.is_null() {
        "unknown dlopen error".to_string()
    } else {
        unsafe { CStr::from_ptr(err) }.to_string_lossy().into_owned()
    }
}

macro_rules! symbol {
    ($lib:expr, $name:literal) => {{
        let sym = unsafe { libc::dlsym($lib, concat!($name, "\0").as_ptr() as CConstStr) };
        if sym.is_null() {
            return Err(RhdError::DeviceNotFound(format!(
                "symbol {} missing from FrontPanel library",
                $name
            )));
        }
        unsafe { std::mem::transmute::<*mut libc::c_void, _>(sym) }
    }};
}

impl Api {
    fn load(lib: *mut libc::c_void) -> Result<Self> {
        Ok(Self {
            construct: symbol!(lib, "okFrontPanel_Construct"),
            destruct: symbol!(lib, "okFrontPanel_Destruct"),
            get_device_count: symbol!(lib, "okFrontPanel_GetDeviceCount"),
            open_by_serial: symbol!(lib, "okFrontPanel_OpenBySerial"),
            is_open: symbol!(lib, "okFrontPanel_IsOpen"),
            close: symbol!(lib, "okFrontPanel_Close"),
            configure_fpga: symbol!(lib, "okFrontPanel_ConfigureFPGA"),
            set_timeout: symbol!(lib, "okFrontPanel_SetTimeout"),
            set_wire_in_value: symbol!(lib, "okFrontPanel_SetWireInValue"),
            update_wire_ins: symbol!(lib, "okFrontPanel_UpdateWireIns"),
            update_wire_outs: symbol!(lib, "okFrontPanel_UpdateWireOuts"),
            get_wire_out_value: symbol!(lib, "okFrontPanel_GetWireOutValue"),
            activate_trigger_in: symbol!(lib, "okFrontPanel_ActivateTriggerIn"),
            read_from_pipe_out: symbol!(lib, "okFrontPanel_ReadFromPipeOut"),
        })
    }
}

/// Board connection through the FrontPanel library.
pub struct OkFrontPanel {
    lib: *mut libc::c_void,
    api: Option<Api>,
    handle: OkHandle,
}

// The FrontPanel handle is used from one thread at a time; the board controller serializes access.
unsafe impl Send for OkFrontPanel {}

impl Default for OkFrontPanel {
    fn default() -> Self {
        Self::new()
    }
}

impl OkFrontPanel {
    pub fn new() -> Self {
        Self {
            lib: std::ptr::null_mut(),
            api: None,
            handle: std::ptr::null_mut(),
        }
    }

    fn api(&self, what: &str) -> Result<&Api> {
        match &self.api {
            Some(api) if !self.handle.is_null() => Ok(api),
            _ => Err(not_open(what)),
        }
    }

    fn unload(&mut self) {
        self.api = None;
        if !self.lib.is_null() {
            unsafe { libc::dlclose(self.lib) };
            self.lib = std::ptr::null_mut();
        }
    }
}

impl Transport for OkFrontPanel {
    fn open(&mut self, library_path: &Path) -> Result<()> {
        self.close();
        self.unload();

        let path = CString::new(library_path.to_string_lossy().as_bytes())
            .map_err(|e| RhdError::DeviceNotFound(format!("invalid library path: {}", e)))?;
        let lib = unsafe { libc::dlopen(path.as_ptr(), libc::RTLD_NOW) };
        if lib.is_null() {
            return Err(RhdError::DeviceNotFound(format!(
                "cannot load {}: {}",
                library_path.display(),
                dl_error()
            )));
        }
        self.lib = lib;
        let api = match Api::load(lib) {
            Ok(api) => api,
            Err(e) => {
                self.unload();
                return Err(e);
            }
        };

        let handle = unsafe { (api.construct)() };
        if handle.is_null() {
            self.unload();
            return Err(RhdError::DeviceNotFound("okFrontPanel_Construct returned null".to_string()));
        }
        let count = unsafe { (api.get_device_count)(handle) };
        if count < 1 {
            unsafe { (api.destruct)(handle) };
            self.unload();
            return Err(RhdError::DeviceNotFound("no Opal Kelly device connected".to_string()));
        }
        // Empty serial opens the first device
        let serial = CString::default();
        let opened = ok_call(unsafe { (api.open_by_serial)(handle, serial.as_ptr()) }, RhdError::DeviceNotFound)
            .and_then(|_| match unsafe { (api.is_open)(handle) } {
                0 => Err(RhdError::DeviceNotFound("device did not open".to_string())),
                _ => Ok(()),
            });
        if let Err(e) = opened {
            unsafe { (api.destruct)(handle) };
            self.unload();
            return Err(e);
        }
        log::info!("Opened FrontPanel device ({} connected) via {}", count, library_path.display());
        self.handle = handle;
        self.api = Some(api);
        Ok(())
    }

    fn upload_bitstream(&mut self, path: &Path) -> Result<()> {
        let api = self.api("upload_bitstream")?;
        let file = CString::new(path.to_string_lossy().as_bytes())
            .map_err(|e| RhdError::UploadFailed(format!("invalid bitfile path: {}", e)))?;
        ok_call(unsafe { (api.configure_fpga)(self.handle, file.as_ptr()) }, RhdError::UploadFailed)?;
        log::info!("Uploaded bitstream {}", path.display());
        Ok(())
    }

    fn write_register(&mut self, addr: u8, value: u32) -> Result<()> {
        let api = self.api("write_register")?;
        let to_error = |msg| RhdError::RegisterWriteFailed { addr, msg };
        if endpoint::is_wire_in(addr) {
            ok_call(
                unsafe { (api.set_wire_in_value)(self.handle, addr as CInt, value as CULong, 0xFFFF_FFFF) },
                to_error,
            )?;
            unsafe { (api.update_wire_ins)(self.handle) };
            Ok(())
        } else if endpoint::is_trigger(addr) {
            ok_call(
                unsafe { (api.activate_trigger_in)(self.handle, addr as CInt, value as CInt) },
                to_error,
            )
        } else {
            Err(RhdError::RegisterWriteFailed {
                addr,
                msg: "not a writable endpoint".to_string(),
            })
        }
    }

    fn read_register(&mut self, addr: u8) -> Result<u32> {
        let api = self.api("read_register")?;
        if !endpoint::is_wire_out(addr) {
            return Err(RhdError::InvalidParameter(format!("endpoint {:#04x} is not a wire-out", addr)));
        }
        unsafe { (api.update_wire_outs)(self.handle) };
        Ok(unsafe { (api.get_wire_out_value)(self.handle, addr as CInt) } as u32)
    }

    fn read_fifo(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        let api = self.api("read_fifo")?;
        let len = buf.len();
        if len == 0 {
            return Ok(0);
        }
        unsafe { (api.set_timeout)(self.handle, timeout.as_millis().min(CInt::MAX as u128) as CInt) };
        let got = unsafe { (api.read_from_pipe_out)(self.handle, PIPE_OUT_FIFO, len as CLong, buf.as_mut_ptr()) };
        if got < 0 {
            ok_call(got as CInt, RhdError::DeviceUnreachable)?;
        }
        Ok(got.max(0) as usize)
    }

    fn close(&mut self) {
        if let Some(api) = &self.api {
            if !self.handle.is_null() {
                unsafe {
                    (api.close)(self.handle);
                    (api.destruct)(self.handle);
                }
                log::info!("Closed FrontPanel device");
            }
        }
        self.handle = std::ptr::null_mut();
    }

    fn is_open(&self) -> bool {
        match &self.api {
            Some(api) if !self.handle.is_null() => unsafe { (api.is_open)(self.handle) != 0 },
            _ => false,
        }
    }
}

impl Drop for OkFrontPanel {
    fn drop(&mut self) {
        self.close();
        self.unload();
    }
}
