// Windows-only injection: the boot DLL is loaded with dll-syringe, then its
// `Initialize` export is called in the target with the start info JSON.

use std::ffi::c_void;
use std::num::NonZeroU32;

use dll_syringe::Syringe;
use dll_syringe::process::{OwnedProcess, Process};
use windows::Win32::Foundation::{CloseHandle, HANDLE};
use windows::Win32::System::Diagnostics::Debug::WriteProcessMemory;
use windows::Win32::System::Memory::{
    MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_READWRITE, VirtualAllocEx, VirtualFreeEx,
};
use windows::Win32::System::Threading::{
    OpenProcess, PROCESS_VM_OPERATION, PROCESS_VM_READ, PROCESS_VM_WRITE,
};

use super::injection::{InjectionError, InjectionTarget, Injector, locate_process};
use super::loader::{BOOT_DLL, LoaderRequest};

/// Name of the boot DLL's entry point taking a pointer to the start info
pub const INITIALIZE_EXPORT: &str = "Initialize";

type InitializeFn = extern "system" fn(*mut c_void) -> u32;

/// Closes the wrapped handle on drop
struct OwnedHandle(HANDLE);

impl Drop for OwnedHandle {
    fn drop(&mut self) {
        // SAFETY: the handle was returned by a successful Win32 call and is closed once
        unsafe {
            let _ = CloseHandle(self.0);
        }
    }
}

/// Loads the loader's boot DLL into the target and initializes it in place.
#[derive(Debug, Clone, Default)]
pub struct RemoteThreadInjector;

impl RemoteThreadInjector {
    pub fn new() -> Self {
        Self
    }
}

impl Injector for RemoteThreadInjector {
    fn locate(&self, target: &InjectionTarget) -> Result<u32, InjectionError> {
        locate_process(target)
    }

    fn inject(&self, pid: u32, request: &LoaderRequest) -> Result<(), InjectionError> {
        let dll = request.install.boot_dll_path();
        if !dll.is_file() {
            return Err(InjectionError::InjectFailed(format!("loader DLL not found at {}", dll)));
        }

        let mut start_info = request
            .start_info
            .to_json()
            .map_err(|e| InjectionError::InjectFailed(e.to_string()))?
            .into_bytes();
        start_info.push(0);

        let process = OwnedProcess::from_pid(pid).map_err(|e| {
            if process_alive(pid) {
                InjectionError::InjectFailed(format!("cannot open PID {}: {}", pid, e))
            } else {
                InjectionError::TargetExited
            }
        })?;

        let syringe = Syringe::for_process(process);
        let module = syringe
            .inject(dll.as_std_path())
            .map_err(|e| InjectionError::InjectFailed(format!("loading {} failed: {}", BOOT_DLL, e)))?;
        tracing::debug!("{} loaded into PID {}", BOOT_DLL, pid);

        // SAFETY: the export has the Win32 thread-routine shape (one pointer in, DWORD out)
        let initialize = unsafe { syringe.get_raw_procedure::<InitializeFn>(module, INITIALIZE_EXPORT) }
            .map_err(|e| InjectionError::InjectFailed(format!("resolving {} failed: {}", INITIALIZE_EXPORT, e)))?
            .ok_or_else(|| {
                InjectionError::InjectFailed(format!("{} does not export {}", BOOT_DLL, INITIALIZE_EXPORT))
            })?;

        // SAFETY: the buffer is written once and never touched by this process again
        let remote = unsafe { write_remote(pid, &start_info) }?;

        let code = initialize
            .call(remote)
            .map_err(|e| InjectionError::InjectFailed(format!("calling {} failed: {}", INITIALIZE_EXPORT, e)))?;

        if code != 0 {
            return Err(InjectionError::InjectFailed(format!(
                "{} returned {} in the target process",
                INITIALIZE_EXPORT, code
            )));
        }

        tracing::info!("Loader initialized in PID {}", pid);
        Ok(())
    }
}

/// Copy `bytes` into a fresh allocation in the target.
///
/// The loader keeps reading its start info after `Initialize` returns, so the
/// allocation is left to the target process.
unsafe fn write_remote(pid: u32, bytes: &[u8]) -> Result<*mut c_void, InjectionError> {
    let failed = |what: &str, e: windows::core::Error| {
        InjectionError::InjectFailed(format!("{} failed: {}", what, e.message()))
    };

    let process = OwnedHandle(
        unsafe { OpenProcess(PROCESS_VM_OPERATION | PROCESS_VM_READ | PROCESS_VM_WRITE, false, pid) }
            .map_err(|e| failed("OpenProcess", e))?,
    );

    let remote = unsafe {
        VirtualAllocEx(process.0, None, bytes.len(), MEM_COMMIT | MEM_RESERVE, PAGE_READWRITE)
    };
    if remote.is_null() {
        return Err(InjectionError::InjectFailed("VirtualAllocEx failed".to_string()));
    }

    let written = unsafe {
        WriteProcessMemory(process.0, remote, bytes.as_ptr() as *const c_void, bytes.len(), None)
    };
    if let Err(e) = written {
        unsafe {
            let _ = VirtualFreeEx(process.0, remote, 0, MEM_RELEASE);
        }
        return Err(failed("WriteProcessMemory", e));
    }

    Ok(remote)
}

pub(crate) fn process_alive(pid: u32) -> bool {
    OwnedProcess::from_pid(pid).is_ok_and(|process| process.is_alive())
}

pub(crate) fn find_process_by_name(name: &str) -> Result<Option<u32>, InjectionError> {
    Ok(OwnedProcess::find_first_by_name(name)
        .and_then(|process| process.pid().ok())
        .map(NonZeroU32::get))
}
