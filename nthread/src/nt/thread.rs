//! Thread handle ownership, register contexts and waits.

use crate::asm::RegKey;
use crate::error::{Error, Result};
use core::mem::MaybeUninit;
use ntapi::ntpsapi::{NtQueryInformationThread, ThreadBasicInformation, THREAD_BASIC_INFORMATION};
use winapi::shared::minwindef::{DWORD, FALSE, LPVOID};
use winapi::shared::ntdef::NT_SUCCESS;
use winapi::shared::winerror::WAIT_TIMEOUT;
use winapi::um::handleapi::CloseHandle;
use winapi::um::processthreadsapi::{
    CreateThread, GetExitCodeThread, GetThreadContext, OpenThread, ResumeThread, SetThreadContext,
    SuspendThread, TerminateThread,
};
use winapi::um::synchapi::WaitForSingleObject;
use winapi::um::winbase::WAIT_OBJECT_0;
use winapi::um::winnt::{CONTEXT, HANDLE, THREAD_ALL_ACCESS};

/// Outcome of an OS-level or park-level wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    /// The waited-for condition was signalled.
    Object0,
    /// The timeout elapsed first.
    Timeout,
    /// The wait itself failed (dead thread, closed handle, ...).
    Failed,
}

/// Snapshot of a thread's architectural registers.
///
/// The `ContextFlags` field selects which register classes a hardware
/// read/write transfers; integer + control is all this crate needs.
#[derive(Clone, Copy)]
pub struct ThreadContext(pub(crate) CONTEXT);

impl ThreadContext {
    pub fn zeroed(flags: u32) -> Self {
        let mut context: CONTEXT = unsafe { core::mem::zeroed() };
        context.ContextFlags = flags;

        Self(context)
    }

    pub fn flags(&self) -> u32 {
        self.0.ContextFlags
    }

    pub fn set_flags(&mut self, flags: u32) {
        self.0.ContextFlags = flags;
    }

    pub fn rip(&self) -> u64 {
        self.0.Rip
    }

    pub fn set_rip(&mut self, rip: u64) {
        self.0.Rip = rip;
    }

    pub fn rsp(&self) -> u64 {
        self.0.Rsp
    }

    pub fn set_rsp(&mut self, rsp: u64) {
        self.0.Rsp = rsp;
    }

    pub fn reg(&self, key: RegKey) -> u64 {
        match key {
            RegKey::Rax => self.0.Rax,
            RegKey::Rcx => self.0.Rcx,
            RegKey::Rdx => self.0.Rdx,
            RegKey::Rbx => self.0.Rbx,
            RegKey::Rsp => self.0.Rsp,
            RegKey::Rbp => self.0.Rbp,
            RegKey::Rsi => self.0.Rsi,
            RegKey::Rdi => self.0.Rdi,
            RegKey::R8 => self.0.R8,
            RegKey::R9 => self.0.R9,
            RegKey::R10 => self.0.R10,
            RegKey::R11 => self.0.R11,
            RegKey::R12 => self.0.R12,
            RegKey::R13 => self.0.R13,
            RegKey::R14 => self.0.R14,
            RegKey::R15 => self.0.R15,
        }
    }

    pub fn set_reg(&mut self, key: RegKey, value: u64) {
        match key {
            RegKey::Rax => self.0.Rax = value,
            RegKey::Rcx => self.0.Rcx = value,
            RegKey::Rdx => self.0.Rdx = value,
            RegKey::Rbx => self.0.Rbx = value,
            RegKey::Rsp => self.0.Rsp = value,
            RegKey::Rbp => self.0.Rbp = value,
            RegKey::Rsi => self.0.Rsi = value,
            RegKey::Rdi => self.0.Rdi = value,
            RegKey::R8 => self.0.R8 = value,
            RegKey::R9 => self.0.R9 = value,
            RegKey::R10 => self.0.R10 = value,
            RegKey::R11 => self.0.R11 = value,
            RegKey::R12 => self.0.R12 = value,
            RegKey::R13 => self.0.R13 = value,
            RegKey::R14 => self.0.R14 = value,
            RegKey::R15 => self.0.R15 = value,
        }
    }
}

/// Exclusively owned OS thread handle.
pub struct Thread {
    handle: HANDLE,
    tid: Option<u32>,
}

// A HANDLE is a kernel object reference; moving it between threads is fine.
unsafe impl Send for Thread {}

impl Thread {
    /// Opens the thread with full access rights.
    ///
    /// When `pid` is given, the opened thread is verified to belong to that
    /// process before the handle is handed out.
    pub fn open(tid: u32, pid: Option<u32>) -> Result<Self> {
        let handle = unsafe { OpenThread(THREAD_ALL_ACCESS, FALSE, tid) };
        if handle.is_null() {
            return Err(Error::os("OpenThread"));
        }

        let thread = Self {
            handle,
            tid: Some(tid),
        };

        if let Some(expected) = pid {
            let actual = thread.owner_process_id()?;
            if actual != expected {
                return Err(Error::WrongProcess {
                    tid,
                    expected,
                    actual,
                });
            }
        }

        Ok(thread)
    }

    /// Adopts an already-opened handle. Ownership transfers to the wrapper.
    pub fn from_handle(handle: HANDLE) -> Self {
        Self { handle, tid: None }
    }

    /// Spawns a thread in the current process starting at `entry`.
    pub fn create(entry: u64, parameter: u64) -> Result<Self> {
        let mut tid: DWORD = 0;
        let start: unsafe extern "system" fn(LPVOID) -> DWORD =
            unsafe { core::mem::transmute(entry as usize) };

        let handle = unsafe {
            CreateThread(
                core::ptr::null_mut(),
                0,
                Some(start),
                parameter as LPVOID,
                0,
                &mut tid,
            )
        };
        if handle.is_null() {
            return Err(Error::os("CreateThread"));
        }

        Ok(Self {
            handle,
            tid: Some(tid),
        })
    }

    pub fn tid(&self) -> Option<u32> {
        self.tid
    }

    pub fn is_valid(&self) -> bool {
        !self.handle.is_null()
    }

    pub fn suspend(&self) -> bool {
        unsafe { SuspendThread(self.handle) != u32::MAX }
    }

    pub fn resume(&self) -> bool {
        unsafe { ResumeThread(self.handle) != u32::MAX }
    }

    /// Hardware → snapshot, for the register classes named by `flags`.
    pub fn context(&self, flags: u32) -> Result<ThreadContext> {
        let mut context = ThreadContext::zeroed(flags);

        if unsafe { GetThreadContext(self.handle, &mut context.0) } == FALSE {
            return Err(Error::os("GetThreadContext"));
        }

        Ok(context)
    }

    /// Snapshot → hardware, for the register classes named by its flags.
    pub fn set_context(&self, context: &ThreadContext) -> Result<()> {
        if unsafe { SetThreadContext(self.handle, &context.0) } == FALSE {
            return Err(Error::os("SetThreadContext"));
        }

        Ok(())
    }

    /// OS-level wait for thread exit.
    pub fn wait(&self, timeout_ms: u32) -> WaitStatus {
        match unsafe { WaitForSingleObject(self.handle, timeout_ms) } {
            WAIT_OBJECT_0 => WaitStatus::Object0,
            WAIT_TIMEOUT => WaitStatus::Timeout,
            _ => WaitStatus::Failed,
        }
    }

    pub fn terminate(&self, exit_code: u32) -> bool {
        unsafe { TerminateThread(self.handle, exit_code) != FALSE }
    }

    pub fn exit_code(&self) -> Option<u32> {
        let mut code: DWORD = 0;

        if unsafe { GetExitCodeThread(self.handle, &mut code) } == FALSE {
            return None;
        }

        Some(code)
    }

    /// Closes the handle. Safe to call more than once.
    pub fn close(&mut self) {
        if !self.handle.is_null() {
            unsafe { CloseHandle(self.handle) };
            self.handle = core::ptr::null_mut();
        }
    }

    fn owner_process_id(&self) -> Result<u32> {
        let mut info = MaybeUninit::<THREAD_BASIC_INFORMATION>::uninit();

        let status = unsafe {
            NtQueryInformationThread(
                self.handle,
                ThreadBasicInformation,
                info.as_mut_ptr() as _,
                core::mem::size_of::<THREAD_BASIC_INFORMATION>() as u32,
                core::ptr::null_mut(),
            )
        };
        if !NT_SUCCESS(status) {
            return Err(Error::Os {
                call: "NtQueryInformationThread",
                code: status as u32,
            });
        }

        let info = unsafe { info.assume_init() };
        Ok(info.ClientId.UniqueProcess as usize as u32)
    }
}

impl Drop for Thread {
    fn drop(&mut self) {
        self.close();
    }
}
