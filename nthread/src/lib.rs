//! Hijack an existing x64 Windows thread without `CreateRemoteThread`,
//! `WriteProcessMemory` or any new executable memory in the target.
//!
//! Two byte sequences already present in the system DLLs do all the work: a
//! sleep gadget (`jmp $`) parks the thread in a controlled infinite loop,
//! and a pivot gadget (`push r64; ret`) steers it there. Once parked, the
//! thread's register state is edited between calls, so arbitrary functions
//! run *inside* the target thread; memory writes decompose into in-thread
//! `memset` runs, and a zone heap carves allocations out of in-thread
//! `calloc` blocks.
//!
//! ```no_run
//! use std::sync::Arc;
//! use nthread::{NThread, AllocOptions, StringEncoding};
//!
//! # fn main() -> nthread::Result<()> {
//! let nthread = Arc::new(NThread::new());
//! let (proxy, _captured) = nthread.inject(0x1234u32 /* tid */)?;
//!
//! let text = proxy.alloc_string("hi", StringEncoding::Utf16Le, AllocOptions::default())?;
//! proxy.write(text, &[0u8; 2])?;
//! proxy.close(None)?;
//! # Ok(())
//! # }
//! ```

pub mod asm;
pub mod captured;
pub mod crt;
pub mod error;
pub mod gadget;
pub mod heap;
pub mod hijack;
pub mod nt;
pub mod proxy;
pub mod romem;
pub mod writer;

pub use asm::RegKey;
pub use captured::CapturedThread;
pub use crt::CrtFn;
pub use error::{Error, Result};
pub use heap::{Heap, HeapAlloc, NThreadHeap};
pub use hijack::{inject, Hijack, InjectTarget, NThread, SharedThread};
pub use nt::{Thread, WaitStatus};
pub use proxy::{AllocOptions, ProxyThread, StringEncoding, WriteSource};
pub use romem::{
    create_read_only_memory, find_overlapping_region, register_read_only_memory,
    unregister_read_only_memory, RoMem,
};
