//! The hijack orchestrator: park a thread on a sleep gadget, then steer
//! its register state between in-thread calls.

use crate::asm::RegKey;
use crate::captured::{calc_stack_begin, CapturedThread};
use crate::crt::{self, CrtFn};
use crate::error::{Error, Result};
use crate::gadget;
use crate::nt::{self, Thread, WaitStatus};
use crate::proxy::{AllocOptions, ProxyThread, StringEncoding, WriteSource};
use crate::{romem, writer};
use std::sync::{Arc, Mutex};
use winapi::um::winnt::{CONTEXT_CONTROL, CONTEXT_INTEGER};

pub const INJECT_TIMEOUT_MS: u64 = 5000;
pub const CALL_TIMEOUT_MS: u64 = 5000;

/// Argument registers of the Microsoft x64 calling convention, in order.
const ARG_REGS: [RegKey; 4] = [RegKey::Rcx, RegKey::Rdx, RegKey::R8, RegKey::R9];

/// A captured thread as shared with the proxy delegates. The mutex is what
/// serialises calls on one captured thread.
pub type SharedThread = Arc<Mutex<CapturedThread>>;

/// What to hijack: an already-owned thread handle or a thread id.
pub enum InjectTarget {
    Tid(u32),
    Thread(Thread),
}

impl From<u32> for InjectTarget {
    fn from(tid: u32) -> Self {
        Self::Tid(tid)
    }
}

impl From<Thread> for InjectTarget {
    fn from(thread: Thread) -> Self {
        Self::Thread(thread)
    }
}

/// Hijack configuration: the process to reach into plus optional fixed
/// gadget choices that override registry selection.
#[derive(Debug, Default, Clone)]
pub struct NThread {
    pub pid: Option<u32>,
    pub sleep_address: Option<u64>,
    pub pivot_address: Option<u64>,
    pub reg_key: Option<RegKey>,
}

impl NThread {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_process(pid: u32) -> Self {
        Self {
            pid: Some(pid),
            ..Self::default()
        }
    }

    pub fn inject(
        self: Arc<Self>,
        target: impl Into<InjectTarget>,
    ) -> Result<(ProxyThread, SharedThread)> {
        inject(&self, target)
    }
}

impl Hijack for NThread {
    fn config(&self) -> &NThread {
        self
    }
}

/// The dispatch hooks behind a proxy. `NThread` implements the defaults;
/// wrappers like `NThreadHeap` override individual hooks and delegate the
/// rest.
pub trait Hijack: Send + Sync + Sized + 'static {
    fn config(&self) -> &NThread;

    /// Runs `target(args...)` inside the parked thread and returns its rax.
    ///
    /// At most four arguments fit the register-only convention used here.
    /// Not re-entrant per captured thread; the shared mutex serialises
    /// concurrent callers.
    fn thread_call(
        &self,
        captured: &SharedThread,
        target: u64,
        args: &[u64],
        timeout_ms: u64,
    ) -> Result<u64> {
        if args.len() > 4 {
            return Err(Error::TooManyArgs { count: args.len() });
        }

        let mut thread = captured.lock().unwrap();

        thread.suspend();
        if let Err(error) = thread.fetch_context() {
            thread.resume();
            return Err(error);
        }

        // Verify the park. A thread that escaped it is not hijacked again.
        //
        let expected = thread.sleep_address();
        let current = thread.rip();
        if current != expected {
            thread.resume();
            return Err(Error::RipMismatch {
                target,
                current,
                expected,
            });
        }

        for (&reg, &value) in ARG_REGS.iter().zip(args) {
            thread.set_reg(reg, value);
        }
        thread.set_rip(target);
        let call_rsp = thread.call_rsp();
        thread.set_rsp(call_rsp);

        if let Err(error) = thread.apply_context() {
            thread.resume();
            return Err(error);
        }
        thread.resume();

        log::trace!("calling {:#x} with {} args", target, args.len());

        match thread.wait(timeout_ms) {
            // The callee returned; its ret popped the sleep address, the
            // thread is parked again and rax sits in the refreshed cache.
            WaitStatus::Object0 => Ok(thread.reg(RegKey::Rax)),
            WaitStatus::Failed => Err(Error::ThreadDied { target }),
            wait => Err(Error::CallTimeout { target, wait }),
        }
    }

    /// Writes `data` to `dest` in the target, decomposed into in-thread
    /// `memset` runs. Spans overlapping a read-only region skip every byte
    /// the snapshot already knows.
    fn write_memory(&self, proxy: &ProxyThread, dest: u64, data: &[u8]) -> Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }

        let overlap = romem::find_overlapping_region(dest, data.len())
            .and_then(|region| Some((region, romem::overlap_info(region, dest, data.len())?)));
        let Some((region, (write_offset, overlap_len, snapshot))) = overlap else {
            return plain_write(proxy, dest, data, 0);
        };

        let mut written = 0;
        if write_offset > 0 {
            written += self.write_memory(proxy, dest, &data[..write_offset])?;
        }

        let middle = &data[write_offset..write_offset + overlap_len];
        let dirty = writer::snapshot_runs(middle, &snapshot);
        log::trace!(
            "snapshot write at {:#x}: {} dirty runs over {} bytes",
            dest + write_offset as u64,
            dirty.len(),
            overlap_len
        );
        memset_runs(proxy, dest + write_offset as u64, &dirty, written)?;
        romem::update_snapshot(region, middle, dest + write_offset as u64);
        written = write_offset + overlap_len;

        let tail = write_offset + overlap_len;
        if tail < data.len() {
            written += self.write_memory(proxy, dest + tail as u64, &data[tail..])?;
        }

        Ok(written)
    }

    /// Writes `size` bytes found at the attacker-side pointer `source`.
    ///
    /// Deliberately skips the read-only-region check: callers take this
    /// path when they want no snapshot optimisation applied.
    fn write_with_pointer(
        &self,
        proxy: &ProxyThread,
        dest: u64,
        source: u64,
        size: usize,
    ) -> Result<usize> {
        if size == 0 {
            return Ok(0);
        }

        let data = nt::memory::read(source, size);
        plain_write(proxy, dest, &data, 0)
    }

    fn thread_alloc(&self, proxy: &ProxyThread, size: u64, opts: AllocOptions) -> Result<u64> {
        crt_alloc(proxy, size, opts)
    }

    fn thread_free(&self, proxy: &ProxyThread, address: u64) -> Result<()> {
        crt_free(proxy, address)
    }

    fn thread_close(
        &self,
        _proxy: &ProxyThread,
        captured: &SharedThread,
        suicide: Option<u32>,
    ) -> Result<()> {
        close_captured(captured, suicide)
    }

    fn alloc_string(
        &self,
        proxy: &ProxyThread,
        text: &str,
        encoding: StringEncoding,
        opts: AllocOptions,
    ) -> Result<u64> {
        proxy.alloc_string(text, encoding, opts)
    }
}

/// Parks `target` on a sleep gadget and hands back the proxy plus the
/// captured thread.
///
/// The sequence: suspend, snapshot the original registers, point rip at a
/// pivot gadget whose register holds the sleep address, lay out a scratch
/// stack, resume, and wait for the park. The saved snapshot is then patched
/// back to the original rip/rsp/register so release restores the thread to
/// exactly where it was.
pub fn inject<H: Hijack>(
    hijacker: &Arc<H>,
    target: impl Into<InjectTarget>,
) -> Result<(ProxyThread, SharedThread)> {
    let config = hijacker.config();

    let thread = match target.into() {
        InjectTarget::Tid(tid) => Thread::open(tid, config.pid)?,
        InjectTarget::Thread(thread) => thread,
    };

    let sleep_address = match config.sleep_address {
        Some(address) => address,
        None => gadget::pick_sleep()?,
    };
    let (pivot_address, reg_key) = match (config.pivot_address, config.reg_key) {
        (Some(address), Some(reg)) => (address, reg),
        (Some(address), None) => {
            // A pivot override without its register is unusable: the pushed
            // register cannot be guessed from the address.
            log::warn!(
                "pivot override {:#x} has no register key, using discovery instead",
                address
            );
            gadget::pick_pivot(None)?
        }
        (None, preferred) => gadget::pick_pivot(preferred)?,
    };

    log::info!(
        "injecting: sleep gadget {:#x}, pivot {:#x} (push {}; ret)",
        sleep_address,
        pivot_address,
        reg_key.name()
    );

    let mut captured = CapturedThread::new(thread, sleep_address, reg_key);

    if !captured.suspend() {
        return Err(Error::os("SuspendThread"));
    }
    captured.fetch_context()?;
    captured.save_context();

    let orig_rip = captured.rip();
    let orig_rsp = captured.rsp();
    let orig_reg = captured.target_reg();

    // The pivot pushes the sleep address and returns into it. Parking the
    // call rsp one slot below the scratch stack top means every later
    // callee's own ret pops the sleep address again, so the thread re-parks
    // after each call.
    let stack_begin = calc_stack_begin(orig_rsp);
    captured.set_call_rsp(stack_begin - 8);

    captured.set_rip(pivot_address);
    captured.set_rsp(stack_begin);
    captured.set_target_reg(sleep_address);
    captured.apply_context()?;
    captured.resume();

    match captured.wait(INJECT_TIMEOUT_MS) {
        WaitStatus::Object0 => {}
        wait => {
            // Alive but never parked: restore the original state rather
            // than leaving the thread on the pivot path.
            if let Err(error) = captured.release() {
                log::warn!("restore after failed inject: {}", error);
            }
            return Err(Error::InjectTimeout { wait });
        }
    }

    captured.fetch_context()?;
    captured.overwrite_saved(orig_rip, orig_rsp, orig_reg);
    captured.set_context_flags(CONTEXT_INTEGER | CONTEXT_CONTROL);

    log::info!("thread parked at {:#x}", sleep_address);

    let captured = Arc::new(Mutex::new(captured));
    let proxy = ProxyThread::new(config.pid);
    bind_delegates(hijacker, &proxy, &captured);

    Ok((proxy, captured))
}

fn bind_delegates<H: Hijack>(hijacker: &Arc<H>, proxy: &ProxyThread, captured: &SharedThread) {
    let hooks = Arc::clone(hijacker);
    let thread = Arc::clone(captured);
    proxy.set_caller(move |_, target, args| {
        hooks.thread_call(&thread, target, args, CALL_TIMEOUT_MS)
    });

    let hooks = Arc::clone(hijacker);
    proxy.set_writer(move |proxy, dest, source| match source {
        WriteSource::Buffer(data) => hooks.write_memory(proxy, dest, data),
        WriteSource::Pointer { address, size } => {
            hooks.write_with_pointer(proxy, dest, address, size)
        }
    });

    let hooks = Arc::clone(hijacker);
    proxy.set_allocer(move |proxy, size, opts| hooks.thread_alloc(proxy, size, opts));

    let hooks = Arc::clone(hijacker);
    proxy.set_freer(move |proxy, address| hooks.thread_free(proxy, address));

    let hooks = Arc::clone(hijacker);
    let thread = Arc::clone(captured);
    proxy.set_closer(move |proxy, suicide| hooks.thread_close(proxy, &thread, suicide));
}

/// Default allocation behavior on top of the CRT.
pub(crate) fn crt_alloc(proxy: &ProxyThread, size: u64, opts: AllocOptions) -> Result<u64> {
    if let Some(address) = opts.address {
        let ptr = proxy.crt_call(CrtFn::Realloc, &[address, size])?;
        if ptr == 0 {
            return Err(Error::AllocFailed { size });
        }
        return Ok(ptr);
    }

    let ptr = match opts.fill {
        Some(0) => proxy.crt_call(CrtFn::Calloc, &[1, size])?,
        _ => proxy.crt_call(CrtFn::Malloc, &[size])?,
    };
    if ptr == 0 {
        return Err(Error::AllocFailed { size });
    }

    if let Some(fill) = opts.fill {
        if fill != 0 {
            proxy.crt_call(CrtFn::Memset, &[ptr, fill as u64, size])?;
        }
    }

    Ok(ptr)
}

pub(crate) fn crt_free(proxy: &ProxyThread, address: u64) -> Result<()> {
    let crt = crt::get()?;
    proxy.call(crt.free, &[address])?;

    Ok(())
}

pub(crate) fn close_captured(captured: &SharedThread, suicide: Option<u32>) -> Result<()> {
    let mut thread = captured.lock().unwrap();

    if let Some(exit_code) = suicide {
        thread.thread().terminate(exit_code);
    }
    thread.close();

    Ok(())
}

/// Plain run decomposition: one in-thread `memset` per maximal equal-byte
/// run.
fn plain_write(proxy: &ProxyThread, dest: u64, data: &[u8], written_before: usize) -> Result<usize> {
    let runs = writer::runs(data);
    memset_runs(proxy, dest, &runs, written_before)?;

    Ok(data.len())
}

/// Issues `memset(dest + offset, value, len)` in-thread for every run. A
/// null return aborts the write; the error carries the bytes committed so
/// far.
fn memset_runs(
    proxy: &ProxyThread,
    dest: u64,
    runs: &[writer::Run],
    written_before: usize,
) -> Result<()> {
    if runs.is_empty() {
        return Ok(());
    }

    let crt = crt::get()?;
    let mut written = written_before;

    for run in runs {
        let address = proxy.call(
            crt.memset,
            &[dest + run.offset as u64, run.value as u64, run.len as u64],
        )?;
        if address == 0 {
            return Err(Error::WriteFailed { written });
        }

        written = written_before + run.offset + run.len;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nt::Module;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

    #[test]
    fn more_than_four_args_are_rejected_before_any_hardware_access() {
        let nthread = NThread::new();
        let captured = Arc::new(Mutex::new(CapturedThread::new(
            Thread::from_handle(core::ptr::null_mut()),
            0x1000,
            RegKey::Rbx,
        )));

        match nthread.thread_call(&captured, 0x2000, &[0; 5], 100) {
            Err(Error::TooManyArgs { count: 5 }) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    /// Seed scenario: writes overlapping a read-only region only transport
    /// the bytes the snapshot does not already know.
    #[test]
    fn snapshot_writes_skip_known_bytes() {
        let nthread = Arc::new(NThread::new());
        let proxy = ProxyThread::new(None);

        let backing: &'static Mutex<Vec<u8>> = Box::leak(Box::new(Mutex::new(vec![0u8; 16])));
        let calls: &'static AtomicUsize = Box::leak(Box::new(AtomicUsize::new(0)));
        let base = 0x61_0000u64;

        proxy.set_caller(move |_, target, args| {
            let crt = crt::get().unwrap();
            assert_eq!(target, crt.memset, "only memset is expected here");
            calls.fetch_add(1, Ordering::SeqCst);

            let offset = (args[0] - base) as usize;
            let len = args[2] as usize;
            backing.lock().unwrap()[offset..offset + len].fill(args[1] as u8);
            Ok(args[0])
        });
        let hooks = Arc::clone(&nthread);
        proxy.set_writer(move |proxy, dest, source| match source {
            WriteSource::Buffer(data) => hooks.write_memory(proxy, dest, data),
            WriteSource::Pointer { address, size } => {
                hooks.write_with_pointer(proxy, dest, address, size)
            }
        });

        let region = crate::romem::register_read_only_memory(base, vec![0u8; 16]);

        // All zeros over an all-zero snapshot: no call at all.
        proxy.write(base, &[0u8; 16]).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let mut data = [0u8; 16];
        data[..4].copy_from_slice(&0xDEAD_BEEFu32.to_le_bytes());
        data[8..12].copy_from_slice(&0xCAFE_BABEu32.to_le_bytes());

        proxy.write(base, &data).unwrap();
        let after_first = calls.load(Ordering::SeqCst);
        assert!(after_first > 0);
        assert_eq!(*backing.lock().unwrap(), data);

        // The snapshot caught up; the identical write is free.
        proxy.write(base, &data).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), after_first);

        assert!(crate::romem::unregister_read_only_memory(region));
        assert!(!crate::romem::unregister_read_only_memory(region));
    }

    /// Seed scenario: attach to a thread spinning on a sleep gadget, write
    /// into this process through it, then send it into ExitThread.
    #[test]
    fn attach_write_read_exit() {
        let sleep_address = gadget::pick_sleep().unwrap();
        let spinner = Thread::create(sleep_address, 0).unwrap();

        let nthread = Arc::new(NThread::new());
        let (proxy, captured) = inject(&nthread, spinner).unwrap();

        let value = AtomicU32::new(0);
        let address = &value as *const AtomicU32 as u64;
        proxy.write(address, &0xDEAD_BEEFu32.to_le_bytes()).unwrap();
        assert_eq!(value.load(Ordering::SeqCst), 0xDEAD_BEEF);

        let exit_thread = Module::open("kernel32.dll")
            .unwrap()
            .proc_address("ExitThread")
            .unwrap();
        match proxy.call(exit_thread, &[42]) {
            Err(Error::ThreadDied { .. }) => {}
            other => panic!("expected ThreadDied, got {:?}", other),
        }
        assert_eq!(captured.lock().unwrap().exit_code(), Some(42));

        proxy.close(None).unwrap();
    }

    /// Seed scenario: a UTF-16 string lands in the target with its two-byte
    /// terminator.
    #[test]
    fn utf16_string_allocation() {
        let sleep_address = gadget::pick_sleep().unwrap();
        let spinner = Thread::create(sleep_address, 0).unwrap();

        let nthread = Arc::new(NThread::new());
        let (proxy, _captured) = inject(&nthread, spinner).unwrap();

        let text = "Hello, NThread!";
        let address = proxy
            .alloc_string(text, StringEncoding::Utf16Le, AllocOptions::default())
            .unwrap();

        let bytes = proxy.read(address, (text.len() + 1) * 2).unwrap();
        assert_eq!(&bytes[30..], [0, 0]);

        let units: Vec<u16> = bytes[..30]
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        assert_eq!(widestring::U16String::from_vec(units).to_string_lossy(), text);

        proxy.free(address).unwrap();
        proxy.close(Some(0)).unwrap();
    }
}
