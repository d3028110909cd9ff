//! The captured thread: the hijacked handle plus the cached register state
//! the orchestrator steers between calls.

use crate::asm::RegKey;
use crate::error::Result;
use crate::nt::{Thread, ThreadContext, WaitStatus};
use std::time::{Duration, Instant};
use winapi::um::winnt::CONTEXT_ALL;

/// Distance the scratch stack sits below the thread's own rsp, so nothing
/// on its live stack is clobbered by in-thread calls.
const STACK_HEADROOM: u64 = 8192;

const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Scratch stack pointer for in-thread calls: well below `base_rsp` and
/// 16-byte aligned so SSE-using callees are happy.
pub fn calc_stack_begin(base_rsp: u64) -> u64 {
    (base_rsp - STACK_HEADROOM) & !0xF
}

/// A thread parked on a sleep gadget.
///
/// While parked, the hardware rip equals [`sleep_address`](Self::sleep_address).
/// All register accessors operate on the in-memory cache; only
/// [`fetch_context`](Self::fetch_context) and
/// [`apply_context`](Self::apply_context) touch the hardware state.
pub struct CapturedThread {
    thread: Thread,
    saved_context: ThreadContext,
    latest_context: ThreadContext,
    suspend_count: u32,
    sleep_address: u64,
    reg_key: RegKey,
    call_rsp: u64,
}

impl CapturedThread {
    pub fn new(thread: Thread, sleep_address: u64, reg_key: RegKey) -> Self {
        Self {
            thread,
            saved_context: ThreadContext::zeroed(CONTEXT_ALL),
            latest_context: ThreadContext::zeroed(CONTEXT_ALL),
            suspend_count: 0,
            sleep_address,
            reg_key,
            call_rsp: 0,
        }
    }

    pub fn thread(&self) -> &Thread {
        &self.thread
    }

    pub fn sleep_address(&self) -> u64 {
        self.sleep_address
    }

    pub fn reg_key(&self) -> RegKey {
        self.reg_key
    }

    pub fn call_rsp(&self) -> u64 {
        self.call_rsp
    }

    pub fn set_call_rsp(&mut self, call_rsp: u64) {
        self.call_rsp = call_rsp;
    }

    /// Suspends the thread. A failed suspend does not count towards the
    /// suspend balance.
    pub fn suspend(&mut self) -> bool {
        let ok = self.thread.suspend();
        if ok {
            self.suspend_count += 1;
        }

        ok
    }

    pub fn resume(&mut self) -> bool {
        let ok = self.thread.resume();
        if ok {
            self.suspend_count = self.suspend_count.saturating_sub(1);
        }

        ok
    }

    /// Hardware → cache, for the register classes currently selected on the
    /// cache.
    pub fn fetch_context(&mut self) -> Result<()> {
        self.latest_context = self.thread.context(self.latest_context.flags())?;

        Ok(())
    }

    /// Cache → hardware.
    pub fn apply_context(&mut self) -> Result<()> {
        self.thread.set_context(&self.latest_context)
    }

    /// Snapshots the cache as the state [`release`](Self::release) restores.
    pub fn save_context(&mut self) {
        self.saved_context = self.latest_context;
    }

    /// Rewrites the rip/rsp/pivot-register slots of the saved snapshot, so
    /// restoration lands on the pre-hijack values instead of the park.
    pub fn overwrite_saved(&mut self, rip: u64, rsp: u64, reg_value: u64) {
        self.saved_context.set_rip(rip);
        self.saved_context.set_rsp(rsp);
        self.saved_context.set_reg(self.reg_key, reg_value);
    }

    pub fn set_context_flags(&mut self, flags: u32) {
        self.latest_context.set_flags(flags);
    }

    pub fn rip(&self) -> u64 {
        self.latest_context.rip()
    }

    pub fn set_rip(&mut self, rip: u64) {
        self.latest_context.set_rip(rip);
    }

    pub fn rsp(&self) -> u64 {
        self.latest_context.rsp()
    }

    pub fn set_rsp(&mut self, rsp: u64) {
        self.latest_context.set_rsp(rsp);
    }

    /// Cached value of the pivot register.
    pub fn target_reg(&self) -> u64 {
        self.latest_context.reg(self.reg_key)
    }

    pub fn set_target_reg(&mut self, value: u64) {
        self.latest_context.set_reg(self.reg_key, value);
    }

    pub fn reg(&self, key: RegKey) -> u64 {
        self.latest_context.reg(key)
    }

    pub fn set_reg(&mut self, key: RegKey, value: u64) {
        self.latest_context.set_reg(key, value);
    }

    /// Polls until the hardware rip sits on the sleep gadget.
    ///
    /// Timeouts run on a monotonic clock. Each iteration sleeps 1 ms, so
    /// concurrent work on other threads keeps running. If the context
    /// becomes unreadable, a zero-timeout exit probe decides between a dead
    /// thread (`Failed`) and surfacing the OS wait result.
    pub fn wait(&mut self, timeout_ms: u64) -> WaitStatus {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);

        loop {
            match self.fetch_context() {
                Ok(()) => {
                    if self.latest_context.rip() == self.sleep_address {
                        return WaitStatus::Object0;
                    }
                }
                Err(_) => {
                    return match self.thread.wait(0) {
                        WaitStatus::Object0 => WaitStatus::Failed,
                        other => other,
                    };
                }
            }

            if Instant::now() >= deadline {
                return WaitStatus::Timeout;
            }

            std::thread::sleep(POLL_INTERVAL);
        }
    }

    /// Restores the saved register state: suspend, write the snapshot back,
    /// resume. Idempotent while the thread is alive.
    pub fn release(&mut self) -> Result<()> {
        self.suspend();
        self.latest_context = self.saved_context;
        self.apply_context()?;
        self.resume();

        Ok(())
    }

    /// Best-effort teardown: restore, drain the residual suspend balance,
    /// close the handle. Errors are swallowed; the thread may already be
    /// dead.
    pub fn close(&mut self) {
        if let Err(error) = self.release() {
            log::warn!("release on close failed (thread already gone?): {}", error);
        }

        while self.suspend_count > 0 {
            if !self.resume() {
                break;
            }
        }

        self.thread.close();
    }

    pub fn is_alive(&self) -> bool {
        self.thread.is_valid() && self.thread.wait(0) == WaitStatus::Timeout
    }

    pub fn exit_code(&self) -> Option<u32> {
        self.thread.exit_code()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stack_begin_is_aligned_and_below_the_live_stack() {
        for rsp in [0x14f000u64, 0x14f008, 0x14f00f, 0x7fff_ffff_fff1] {
            let begin = calc_stack_begin(rsp);

            assert_eq!(begin % 16, 0);
            assert!(begin <= rsp - STACK_HEADROOM);
            // The call rsp one slot below keeps `rsp % 16 == 8`, the state a
            // callee expects right after a `call`.
            assert_eq!((begin - 8) % 16, 8);
        }
    }
}
