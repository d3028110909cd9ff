//! Crate-wide error taxonomy.

use crate::nt::thread::WaitStatus;
use winapi::um::errhandlingapi::GetLastError;

pub type Result<T> = core::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no sleep gadget (jmp $) found in the scanned modules")]
    NoSleepGadget,

    #[error("no pivot gadget (push r64; ret) found in the scanned modules")]
    NoPivotGadget,

    #[error("assembler rejected the gadget pattern `{pattern}`")]
    GadgetScanFailed { pattern: String },

    #[error("thread did not reach the sleep gadget within 5s (wait result: {wait:?})")]
    InjectTimeout { wait: WaitStatus },

    #[error("too many call arguments: {count} (at most 4 fit in rcx/rdx/r8/r9)")]
    TooManyArgs { count: usize },

    #[error(
        "refusing call to {target:#x}: rip is {current:#x}, expected the sleep gadget at {expected:#x}"
    )]
    RipMismatch {
        target: u64,
        current: u64,
        expected: u64,
    },

    #[error("call to {target:#x} did not return in time (wait result: {wait:?})")]
    CallTimeout { target: u64, wait: WaitStatus },

    #[error("thread died during the call to {target:#x}")]
    ThreadDied { target: u64 },

    #[error("in-thread memset returned null after {written} bytes")]
    WriteFailed { written: usize },

    #[error("allocation of {size:#x} bytes failed")]
    AllocFailed { size: u64 },

    #[error("free of {address:#x}: address belongs to no zone of this heap")]
    InvalidFree { address: u64 },

    #[error("thread {tid} belongs to process {actual}, not to process {expected}")]
    WrongProcess { tid: u32, expected: u32, actual: u32 },

    #[error("module `{name}` is not loaded")]
    ModuleNotFound { name: String },

    #[error("export `{name}` not found in `{module}`")]
    ExportNotFound { module: String, name: String },

    #[error("no `{operation}` delegate is bound on this proxy")]
    NotBound { operation: &'static str },

    #[error("{call} failed with error code {code:#x}")]
    Os { call: &'static str, code: u32 },
}

impl Error {
    /// Captures the calling thread's last-error code for a failed Win32 call.
    pub fn os(call: &'static str) -> Self {
        Self::Os {
            call,
            code: unsafe { GetLastError() },
        }
    }
}
