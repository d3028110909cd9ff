//! Loaded-module lookup, export resolution and executable-page scanning.

use crate::error::{Error, Result};
use core::mem::MaybeUninit;
use memchr::memmem;
use std::ffi::CString;
use winapi::shared::minwindef::{DWORD, FALSE, HMODULE};
use winapi::um::libloaderapi::{GetModuleHandleA, GetProcAddress, LoadLibraryA};
use winapi::um::memoryapi::VirtualQuery;
use winapi::um::processthreadsapi::GetCurrentProcess;
use winapi::um::psapi::{K32GetModuleInformation, MODULEINFO};
use winapi::um::winnt::{
    MEMORY_BASIC_INFORMATION, MEM_COMMIT, PAGE_EXECUTE, PAGE_EXECUTE_READ,
    PAGE_EXECUTE_READWRITE, PAGE_EXECUTE_WRITECOPY, PAGE_GUARD,
};

const EXECUTE_MASK: DWORD =
    PAGE_EXECUTE | PAGE_EXECUTE_READ | PAGE_EXECUTE_READWRITE | PAGE_EXECUTE_WRITECOPY;

fn is_executable(protect: DWORD) -> bool {
    protect & EXECUTE_MASK != 0 && protect & PAGE_GUARD == 0
}

/// A module mapped into the current process.
///
/// System modules (`ntdll`, `kernel32`, ...) share their base address across
/// processes of one boot session, so addresses found here are valid inside
/// the hijacked process as well.
pub struct Module {
    name: String,
    handle: HMODULE,
    base: usize,
    size: usize,
}

impl Module {
    /// Looks the module up among the already-loaded ones.
    pub fn open(name: &str) -> Result<Self> {
        let cname = module_name(name)?;

        let handle = unsafe { GetModuleHandleA(cname.as_ptr()) };
        if handle.is_null() {
            return Err(Error::ModuleNotFound { name: name.into() });
        }

        Self::from_handle(name, handle)
    }

    /// Like [`open`](Self::open), but loads the module if it is absent.
    pub fn load(name: &str) -> Result<Self> {
        if let Ok(module) = Self::open(name) {
            return Ok(module);
        }

        let cname = module_name(name)?;
        let handle = unsafe { LoadLibraryA(cname.as_ptr()) };
        if handle.is_null() {
            return Err(Error::ModuleNotFound { name: name.into() });
        }

        Self::from_handle(name, handle)
    }

    fn from_handle(name: &str, handle: HMODULE) -> Result<Self> {
        let mut info = MaybeUninit::<MODULEINFO>::uninit();

        let ok = unsafe {
            K32GetModuleInformation(
                GetCurrentProcess(),
                handle,
                info.as_mut_ptr(),
                core::mem::size_of::<MODULEINFO>() as DWORD,
            )
        };
        if ok == FALSE {
            return Err(Error::os("K32GetModuleInformation"));
        }

        let info = unsafe { info.assume_init() };
        Ok(Self {
            name: name.into(),
            handle,
            base: info.lpBaseOfDll as usize,
            size: info.SizeOfImage as usize,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn base(&self) -> u64 {
        self.base as u64
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Resolves an export by name.
    pub fn proc_address(&self, proc: &str) -> Result<u64> {
        let not_found = || Error::ExportNotFound {
            module: self.name.clone(),
            name: proc.into(),
        };

        let cproc = CString::new(proc).map_err(|_| not_found())?;
        let address = unsafe { GetProcAddress(self.handle, cproc.as_ptr()) };
        if address.is_null() {
            return Err(not_found());
        }

        Ok(address as u64)
    }

    /// Finds every occurrence of `pattern` inside the module's committed,
    /// executable, non-guard pages.
    pub fn scan(&self, pattern: &[u8]) -> Vec<u64> {
        let mut hits = Vec::new();
        if pattern.is_empty() {
            return hits;
        }

        let finder = memmem::Finder::new(pattern);
        let end = self.base + self.size;
        let mut address = self.base;

        while address < end {
            let mut info = MaybeUninit::<MEMORY_BASIC_INFORMATION>::uninit();

            let written = unsafe {
                VirtualQuery(
                    address as *const _,
                    info.as_mut_ptr(),
                    core::mem::size_of::<MEMORY_BASIC_INFORMATION>(),
                )
            };
            if written == 0 {
                break;
            }

            let info = unsafe { info.assume_init() };
            let region_base = info.BaseAddress as usize;
            let region_end = (region_base + info.RegionSize).min(end);

            if info.State == MEM_COMMIT && is_executable(info.Protect) {
                let bytes =
                    unsafe { core::slice::from_raw_parts(address as *const u8, region_end - address) };

                for position in finder.find_iter(bytes) {
                    hits.push((address + position) as u64);
                }
            }

            address = region_base + info.RegionSize;
        }

        log::trace!(
            "scanned {} ({:#x}..{:#x}) for {:x?}: {} hits",
            self.name,
            self.base,
            end,
            pattern,
            hits.len()
        );

        hits
    }
}

fn module_name(name: &str) -> Result<CString> {
    CString::new(name).map_err(|_| Error::ModuleNotFound { name: name.into() })
}
