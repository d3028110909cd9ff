//! The user-facing handle to a captured thread.
//!
//! Every operation is a replaceable delegate: the orchestrator binds its
//! own hooks during inject, and callers may swap any slot afterwards to
//! customise memory policy without touching the hijack core. The public
//! wrappers hand the proxy itself to the delegate, so a delegate can
//! re-enter other proxy methods.

use crate::crt::{self, CrtFn};
use crate::error::{Error, Result};
use crate::nt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use widestring::U16String;

/// Source of the bytes for a proxy write.
#[derive(Debug, Clone, Copy)]
pub enum WriteSource<'a> {
    /// An attacker-side buffer; read-only-region snapshot skipping applies.
    Buffer(&'a [u8]),
    /// A raw attacker-side pointer; written verbatim without consulting the
    /// read-only registry.
    Pointer { address: u64, size: usize },
}

/// String encodings for [`ProxyThread::alloc_string`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StringEncoding {
    #[default]
    Utf16Le,
    Ucs2,
    Utf8,
}

impl StringEncoding {
    fn terminator_len(self) -> usize {
        match self {
            StringEncoding::Utf16Le | StringEncoding::Ucs2 => 2,
            StringEncoding::Utf8 => 1,
        }
    }

    fn encode(self, text: &str) -> Vec<u8> {
        match self {
            StringEncoding::Utf16Le | StringEncoding::Ucs2 => U16String::from_str(text)
                .into_vec()
                .into_iter()
                .flat_map(u16::to_le_bytes)
                .collect(),
            StringEncoding::Utf8 => text.as_bytes().to_vec(),
        }
    }
}

/// Options for [`ProxyThread::alloc`].
#[derive(Debug, Clone, Copy, Default)]
pub struct AllocOptions {
    /// Resize this existing allocation instead of making a fresh one.
    pub address: Option<u64>,
    /// Fill value for the new memory. `None` leaves it uninitialised
    /// (`malloc`), `Some(0)` maps to `calloc`, anything else to `malloc`
    /// followed by an in-thread `memset`.
    pub fill: Option<u8>,
    /// Zone request for heap-backed allocators: `Some(true)` read-only,
    /// `Some(false)` read-write, `None` the default (read-write; on
    /// realloc, whatever zone the old allocation lives in).
    pub readonly: Option<bool>,
}

type ReadFn = dyn Fn(&ProxyThread, u64, usize) -> Result<Vec<u8>> + Send + Sync;
type WriteFn = dyn Fn(&ProxyThread, u64, WriteSource<'_>) -> Result<usize> + Send + Sync;
type CallFn = dyn Fn(&ProxyThread, u64, &[u64]) -> Result<u64> + Send + Sync;
type AllocFn = dyn Fn(&ProxyThread, u64, AllocOptions) -> Result<u64> + Send + Sync;
type FreeFn = dyn Fn(&ProxyThread, u64) -> Result<()> + Send + Sync;
type CloseFn = dyn Fn(&ProxyThread, Option<u32>) -> Result<()> + Send + Sync;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

pub struct ProxyThread {
    id: u64,
    pid: Option<u32>,
    read_fn: RwLock<Arc<ReadFn>>,
    write_fn: RwLock<Arc<WriteFn>>,
    call_fn: RwLock<Arc<CallFn>>,
    alloc_fn: RwLock<Arc<AllocFn>>,
    free_fn: RwLock<Arc<FreeFn>>,
    close_fn: RwLock<Arc<CloseFn>>,
}

impl ProxyThread {
    /// A fresh proxy with default delegates: read and write go straight to
    /// current-process memory when the process context is local, everything
    /// else reports [`Error::NotBound`] until inject rebinds it.
    pub fn new(pid: Option<u32>) -> Self {
        let reader: Arc<ReadFn> = Arc::new(|proxy: &ProxyThread, address, len| {
            proxy.ensure_local("read")?;
            Ok(nt::memory::read(address, len))
        });
        let writer: Arc<WriteFn> =
            Arc::new(|proxy: &ProxyThread, dest, source: WriteSource<'_>| {
                proxy.ensure_local("write")?;
                Ok(match source {
                    WriteSource::Buffer(data) => nt::memory::write(dest, data),
                    WriteSource::Pointer { address, size } => {
                        nt::memory::write_with_pointer(dest, address, size)
                    }
                })
            });
        let caller: Arc<CallFn> =
            Arc::new(|_: &ProxyThread, _, _| Err(Error::NotBound { operation: "call" }));
        let allocer: Arc<AllocFn> =
            Arc::new(|_: &ProxyThread, _, _| Err(Error::NotBound { operation: "alloc" }));
        let freer: Arc<FreeFn> =
            Arc::new(|_: &ProxyThread, _| Err(Error::NotBound { operation: "free" }));
        let closer: Arc<CloseFn> =
            Arc::new(|_: &ProxyThread, _| Err(Error::NotBound { operation: "close" }));

        Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            pid,
            read_fn: RwLock::new(reader),
            write_fn: RwLock::new(writer),
            call_fn: RwLock::new(caller),
            alloc_fn: RwLock::new(allocer),
            free_fn: RwLock::new(freer),
            close_fn: RwLock::new(closer),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn is_local(&self) -> bool {
        self.pid.map_or(true, |pid| pid == nt::current_process_id())
    }

    fn ensure_local(&self, operation: &'static str) -> Result<()> {
        if self.is_local() {
            Ok(())
        } else {
            Err(Error::NotBound { operation })
        }
    }

    pub fn read(&self, address: u64, len: usize) -> Result<Vec<u8>> {
        let read = self.read_fn.read().unwrap().clone();
        (*read)(self, address, len)
    }

    pub fn write(&self, dest: u64, data: &[u8]) -> Result<usize> {
        let write = self.write_fn.read().unwrap().clone();
        (*write)(self, dest, WriteSource::Buffer(data))
    }

    /// Writes `size` bytes found at the attacker-side pointer `source`.
    /// This path never consults the read-only registry.
    pub fn write_with_pointer(&self, dest: u64, source: u64, size: usize) -> Result<usize> {
        let write = self.write_fn.read().unwrap().clone();
        (*write)(self, dest, WriteSource::Pointer { address: source, size })
    }

    /// In-thread call; returns the callee's rax.
    pub fn call(&self, target: u64, args: &[u64]) -> Result<u64> {
        let call = self.call_fn.read().unwrap().clone();
        (*call)(self, target, args)
    }

    pub fn alloc(&self, size: u64, opts: AllocOptions) -> Result<u64> {
        let alloc = self.alloc_fn.read().unwrap().clone();
        (*alloc)(self, size, opts)
    }

    pub fn free(&self, address: u64) -> Result<()> {
        let free = self.free_fn.read().unwrap().clone();
        (*free)(self, address)
    }

    /// Tears the hijack down; `suicide` terminates the thread with that
    /// exit code first.
    pub fn close(&self, suicide: Option<u32>) -> Result<()> {
        let close = self.close_fn.read().unwrap().clone();
        (*close)(self, suicide)
    }

    /// Calls a CRT export by name through the regular `call` path.
    pub fn crt_call(&self, func: CrtFn, args: &[u64]) -> Result<u64> {
        let crt = crt::get()?;
        self.call(func.address(crt), args)
    }

    /// Encodes `text`, appends a null terminator, allocates and writes it;
    /// returns the target-side pointer.
    pub fn alloc_string(
        &self,
        text: &str,
        encoding: StringEncoding,
        opts: AllocOptions,
    ) -> Result<u64> {
        let mut bytes = encoding.encode(text);
        bytes.resize(bytes.len() + encoding.terminator_len(), 0);

        let address = self.alloc(bytes.len() as u64, opts)?;
        self.write(address, &bytes)?;

        Ok(address)
    }

    pub fn set_reader<F>(&self, reader: F)
    where
        F: Fn(&ProxyThread, u64, usize) -> Result<Vec<u8>> + Send + Sync + 'static,
    {
        *self.read_fn.write().unwrap() = Arc::new(reader);
    }

    pub fn set_writer<F>(&self, writer: F)
    where
        F: Fn(&ProxyThread, u64, WriteSource<'_>) -> Result<usize> + Send + Sync + 'static,
    {
        *self.write_fn.write().unwrap() = Arc::new(writer);
    }

    pub fn set_caller<F>(&self, caller: F)
    where
        F: Fn(&ProxyThread, u64, &[u64]) -> Result<u64> + Send + Sync + 'static,
    {
        *self.call_fn.write().unwrap() = Arc::new(caller);
    }

    pub fn set_allocer<F>(&self, allocer: F)
    where
        F: Fn(&ProxyThread, u64, AllocOptions) -> Result<u64> + Send + Sync + 'static,
    {
        *self.alloc_fn.write().unwrap() = Arc::new(allocer);
    }

    pub fn set_freer<F>(&self, freer: F)
    where
        F: Fn(&ProxyThread, u64) -> Result<()> + Send + Sync + 'static,
    {
        *self.free_fn.write().unwrap() = Arc::new(freer);
    }

    pub fn set_closer<F>(&self, closer: F)
    where
        F: Fn(&ProxyThread, Option<u32>) -> Result<()> + Send + Sync + 'static,
    {
        *self.close_fn.write().unwrap() = Arc::new(closer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn local_defaults_round_trip() {
        let proxy = ProxyThread::new(None);
        let mut buffer = [0u8; 8];
        let address = buffer.as_mut_ptr() as u64;

        assert_eq!(proxy.write(address, &[1, 2, 3, 4]).unwrap(), 4);
        assert_eq!(proxy.read(address, 4).unwrap(), [1, 2, 3, 4]);
    }

    #[test]
    fn unbound_operations_report_their_name() {
        let proxy = ProxyThread::new(None);

        match proxy.call(0x1000, &[]) {
            Err(Error::NotBound { operation: "call" }) => {}
            other => panic!("unexpected: {:?}", other),
        }
        match proxy.free(0x1000) {
            Err(Error::NotBound { operation: "free" }) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn delegates_can_re_enter_the_proxy() {
        let proxy = ProxyThread::new(None);

        // An alloc delegate that uses the (replaced) caller.
        proxy.set_caller(|_, target, args| Ok(target + args.iter().sum::<u64>()));
        proxy.set_allocer(|proxy, size, _| proxy.call(0x100, &[size]));

        assert_eq!(proxy.alloc(0x20, AllocOptions::default()).unwrap(), 0x120);
    }

    #[test]
    fn alloc_string_appends_a_wide_terminator() {
        let proxy = ProxyThread::new(None);
        let written: &'static Mutex<Vec<u8>> = Box::leak(Box::new(Mutex::new(Vec::new())));

        proxy.set_allocer(|_, size, _| {
            assert_eq!(size, 32);
            Ok(0x4000)
        });
        proxy.set_writer(move |_, _, source| match source {
            WriteSource::Buffer(data) => {
                *written.lock().unwrap() = data.to_vec();
                Ok(data.len())
            }
            WriteSource::Pointer { .. } => unreachable!(),
        });

        let address = proxy
            .alloc_string("Hello, NThread!", StringEncoding::Utf16Le, AllocOptions::default())
            .unwrap();
        assert_eq!(address, 0x4000);

        let written = written.lock().unwrap();
        assert_eq!(written.len(), 32);
        assert_eq!(&written[..2], [b'H', 0]);
        assert_eq!(&written[30..], [0, 0]);
    }
}
