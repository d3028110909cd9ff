//! User-mode bindings for the parts of the OS this crate relies on: thread
//! handles and contexts, loaded-module scanning and current-process memory.

pub mod memory;
pub mod module;
pub mod thread;

pub use module::Module;
pub use thread::{Thread, ThreadContext, WaitStatus};

use winapi::um::processthreadsapi::GetCurrentProcessId;

pub fn current_process_id() -> u32 {
    unsafe { GetCurrentProcessId() }
}
