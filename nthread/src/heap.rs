//! A zone-partitioned heap carved out of one in-thread `calloc`, plus the
//! `NThreadHeap` layer that grows heaps on demand and keeps per-proxy
//! allocation books.

use crate::crt::{self, CrtFn};
use crate::error::{Error, Result};
use crate::hijack::{self, Hijack, InjectTarget, NThread, SharedThread};
use crate::proxy::{AllocOptions, ProxyThread};
use crate::romem::{self, RoMem};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

pub const DEFAULT_TOTAL_SIZE: u64 = 16_384;
pub const DEFAULT_HEAP_SIZE: u64 = 65_536;
pub const DEFAULT_MAX_SIZE: u64 = 524_288;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FreeBlock {
    address: u64,
    size: u64,
}

/// Half of a heap block: a bump area plus a sorted, coalesced free list.
#[derive(Debug)]
struct Zone {
    start: u64,
    end: u64,
    bump: u64,
    free_list: Vec<FreeBlock>,
}

impl Zone {
    fn new(start: u64, end: u64) -> Self {
        Self {
            start,
            end,
            bump: start,
            free_list: Vec::new(),
        }
    }

    fn contains(&self, address: u64) -> bool {
        address >= self.start && address < self.end
    }

    /// First fit on the free list, falling back to bumping.
    fn alloc(&mut self, size: u64) -> Option<u64> {
        if size == 0 || size > self.end - self.start {
            return None;
        }

        if let Some(index) = self.free_list.iter().position(|block| block.size >= size) {
            let block = &mut self.free_list[index];
            let address = block.address;

            if block.size > size {
                block.address += size;
                block.size -= size;
            } else {
                self.free_list.remove(index);
            }

            return Some(address);
        }

        if self.bump + size <= self.end {
            let address = self.bump;
            self.bump += size;
            return Some(address);
        }

        None
    }

    /// Sorted insert, merging with both immediate neighbours.
    fn free(&mut self, address: u64, size: u64) {
        let index = self
            .free_list
            .partition_point(|block| block.address < address);
        self.free_list.insert(index, FreeBlock { address, size });

        // Next neighbour first, then the previous one.
        //
        if index + 1 < self.free_list.len() {
            let next = self.free_list[index + 1];
            let inserted = &mut self.free_list[index];
            if inserted.address + inserted.size == next.address {
                inserted.size += next.size;
                self.free_list.remove(index + 1);
            }
        }
        if index > 0 {
            let inserted = self.free_list[index];
            let previous = &mut self.free_list[index - 1];
            if previous.address + previous.size == inserted.address {
                previous.size += inserted.size;
                self.free_list.remove(index);
            }
        }
    }

    fn reset(&mut self) {
        self.bump = self.start;
        self.free_list.clear();
    }
}

/// One allocation handed out by a [`Heap`]. The size travels with the
/// address because `free` returns the exact span to the zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapAlloc {
    pub address: u64,
    pub size: u64,
    pub readonly: bool,
}

static NEXT_HEAP_ID: AtomicU64 = AtomicU64::new(1);

/// A contiguous target-side block split at `ro_size` into a read-only zone
/// (mirrored by a snapshot in the read-only registry, so writes into it
/// skip known bytes) and a read-write zone.
pub struct Heap {
    id: u64,
    base: u64,
    total_size: u64,
    ro_size: u64,
    ro: Zone,
    rw: Zone,
    ro_region: Option<RoMem>,
}

impl Heap {
    /// Carves a fresh zeroed block out of the target (in-thread `calloc`)
    /// and registers the RO zone with a matching all-zero snapshot.
    pub fn create(proxy: &ProxyThread, total_size: u64, ro_size: u64) -> Result<Self> {
        let base = proxy.crt_call(CrtFn::Calloc, &[1, total_size])?;
        if base == 0 {
            return Err(Error::AllocFailed { size: total_size });
        }

        let mut heap = Self::with_layout(base, total_size, ro_size);
        heap.ro_region = Some(romem::register_read_only_memory(
            base,
            vec![0u8; ro_size as usize],
        ));

        log::info!(
            "heap #{} at {:#x}: {} bytes total, {} read-only",
            heap.id,
            base,
            total_size,
            ro_size
        );

        Ok(heap)
    }

    /// [`create`](Self::create) with the stock 16 KiB block, half of it
    /// read-only.
    pub fn create_default(proxy: &ProxyThread) -> Result<Self> {
        Self::create(proxy, DEFAULT_TOTAL_SIZE, DEFAULT_TOTAL_SIZE / 2)
    }

    fn with_layout(base: u64, total_size: u64, ro_size: u64) -> Self {
        debug_assert!(ro_size <= total_size);

        Self {
            id: NEXT_HEAP_ID.fetch_add(1, Ordering::Relaxed),
            base,
            total_size,
            ro_size,
            ro: Zone::new(base, base + ro_size),
            rw: Zone::new(base + ro_size, base + total_size),
            ro_region: None,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn ro_size(&self) -> u64 {
        self.ro_size
    }

    pub fn contains(&self, address: u64) -> bool {
        address >= self.base && address < self.base + self.total_size
    }

    pub fn is_ro_address(&self, address: u64) -> bool {
        self.ro.contains(address)
    }

    /// Allocates from the requested zone; `None` means the zone is
    /// exhausted.
    pub fn alloc(&mut self, size: u64, readonly: bool) -> Option<HeapAlloc> {
        let zone = if readonly { &mut self.ro } else { &mut self.rw };

        zone.alloc(size).map(|address| HeapAlloc {
            address,
            size,
            readonly,
        })
    }

    /// Returns an allocation's span to the zone its address falls in.
    pub fn free(&mut self, alloc: &HeapAlloc) -> Result<()> {
        let zone = if self.ro.contains(alloc.address) {
            &mut self.ro
        } else if self.rw.contains(alloc.address) {
            &mut self.rw
        } else {
            return Err(Error::InvalidFree {
                address: alloc.address,
            });
        };

        zone.free(alloc.address, alloc.size);
        Ok(())
    }

    /// Forgets every allocation: both bump pointers return to their zone
    /// starts, both free lists clear, and the local RO snapshot refills
    /// with zeros. Remote memory is not touched.
    pub fn reset(&mut self) {
        self.ro.reset();
        self.rw.reset();

        if let Some(region) = self.ro_region {
            romem::update_snapshot(region, &vec![0u8; region.len()], region.remote());
        }
    }

    /// Unregisters the RO zone and releases the block (in-thread `free`).
    pub fn destroy(mut self, proxy: &ProxyThread) -> Result<()> {
        if let Some(region) = self.ro_region.take() {
            romem::unregister_read_only_memory(region);
        }

        let crt = crt::get()?;
        proxy.call(crt.free, &[self.base])?;

        Ok(())
    }
}

enum Allocation {
    Heap { heap_id: u64, alloc: HeapAlloc },
    Crt,
}

#[derive(Default)]
struct HeapState {
    active: Option<Heap>,
    previous: Vec<Heap>,
    allocations: HashMap<u64, Allocation>,
}

impl HeapState {
    fn heap_mut(&mut self, id: u64) -> Option<&mut Heap> {
        self.active
            .iter_mut()
            .chain(self.previous.iter_mut())
            .find(|heap| heap.id() == id)
    }
}

/// Allocator layer over the base hijack: serves `alloc`/`free` from a
/// growing heap block inside the target and falls back to the CRT when a
/// request cannot be served. Older blocks stay alive so outstanding
/// allocations can still be freed.
pub struct NThreadHeap {
    config: NThread,
    heap_size: u64,
    max_size: u64,
    states: Mutex<HashMap<u64, HeapState>>,
}

impl Default for NThreadHeap {
    fn default() -> Self {
        Self::new(DEFAULT_HEAP_SIZE, DEFAULT_MAX_SIZE)
    }
}

impl NThreadHeap {
    pub fn new(heap_size: u64, max_size: u64) -> Self {
        Self::with_config(NThread::new(), heap_size, max_size)
    }

    pub fn with_config(config: NThread, heap_size: u64, max_size: u64) -> Self {
        Self {
            config,
            heap_size,
            max_size,
            states: Mutex::new(HashMap::new()),
        }
    }

    pub fn inject(
        self: Arc<Self>,
        target: impl Into<InjectTarget>,
    ) -> Result<(ProxyThread, SharedThread)> {
        hijack::inject(&self, target)
    }

    /// Tries the active heap, then grows. `Ok(None)` means the layer cannot
    /// serve the request and the caller falls back to the CRT.
    fn alloc_from_heap(
        &self,
        proxy: &ProxyThread,
        state: &mut HeapState,
        size: u64,
        readonly: bool,
    ) -> Result<Option<(u64, HeapAlloc)>> {
        if let Some(heap) = state.active.as_mut() {
            if let Some(alloc) = heap.alloc(size, readonly) {
                return Ok(Some((heap.id(), alloc)));
            }
        }

        if size > self.max_size {
            return Ok(None);
        }
        let new_size = match state.active.as_ref().map(Heap::total_size) {
            Some(current) if current >= self.max_size => return Ok(None),
            Some(current) => (current * 2).min(self.max_size),
            None => self.heap_size,
        };
        if size > new_size {
            return Ok(None);
        }

        // The zone of the active request gets the larger share.
        //
        let ro_size = if readonly {
            new_size * 3 / 4
        } else {
            new_size / 4
        };
        let heap = Heap::create(proxy, new_size, ro_size)?;
        if let Some(old) = state.active.replace(heap) {
            log::trace!("retiring heap #{} ({} bytes)", old.id(), old.total_size());
            state.previous.push(old);
        }

        let Some(heap) = state.active.as_mut() else {
            return Ok(None);
        };
        Ok(heap.alloc(size, readonly).map(|alloc| (heap.id(), alloc)))
    }

    fn realloc_internal(
        &self,
        proxy: &ProxyThread,
        address: u64,
        new_size: u64,
        opts: AllocOptions,
    ) -> Result<u64> {
        let mut states = self.states.lock().unwrap();
        let state = states.entry(proxy.id()).or_default();

        let (heap_id, old_alloc) = match state.allocations.get(&address) {
            Some(Allocation::Heap { heap_id, alloc }) => (*heap_id, *alloc),
            Some(Allocation::Crt) | None => {
                // Unknown or CRT-backed memory belongs to the CRT realloc.
                let crt_opts = AllocOptions {
                    address: Some(address),
                    ..opts
                };
                let new_address = hijack::crt_alloc(proxy, new_size, crt_opts)?;
                state.allocations.remove(&address);
                state.allocations.insert(new_address, Allocation::Crt);
                return Ok(new_address);
            }
        };

        // Keep the old zone unless the caller explicitly picked one.
        let old_readonly = state
            .heap_mut(heap_id)
            .map(|heap| heap.is_ro_address(old_alloc.address))
            .unwrap_or(old_alloc.readonly);
        let readonly = opts.readonly.unwrap_or(old_readonly);

        let new_address = match self.alloc_from_heap(proxy, state, new_size, readonly)? {
            Some((new_heap_id, new_alloc)) => {
                state.allocations.insert(
                    new_alloc.address,
                    Allocation::Heap {
                        heap_id: new_heap_id,
                        alloc: new_alloc,
                    },
                );
                new_alloc.address
            }
            None => {
                // CRT fallback. The old pointer is heap memory, so the
                // fallback must not hand it to the CRT realloc.
                let crt_opts = AllocOptions {
                    address: None,
                    readonly: None,
                    ..opts
                };
                let ptr = hijack::crt_alloc(proxy, new_size, crt_opts)?;
                state.allocations.insert(ptr, Allocation::Crt);
                ptr
            }
        };

        let copy_len = old_alloc.size.min(new_size);
        let data = proxy.read(old_alloc.address, copy_len as usize)?;
        proxy.write(new_address, &data)?;

        if new_size > old_alloc.size {
            if let Some(fill) = opts.fill {
                let tail = vec![fill; (new_size - old_alloc.size) as usize];
                proxy.write(new_address + old_alloc.size, &tail)?;
            }
        }

        state.allocations.remove(&address);
        if let Some(heap) = state.heap_mut(heap_id) {
            heap.free(&old_alloc)?;
        }

        Ok(new_address)
    }
}

impl Hijack for NThreadHeap {
    fn config(&self) -> &NThread {
        &self.config
    }

    fn thread_alloc(&self, proxy: &ProxyThread, size: u64, opts: AllocOptions) -> Result<u64> {
        if let Some(address) = opts.address {
            return self.realloc_internal(proxy, address, size, opts);
        }

        let readonly = opts.readonly.unwrap_or(false);
        let mut states = self.states.lock().unwrap();
        let state = states.entry(proxy.id()).or_default();

        match self.alloc_from_heap(proxy, state, size, readonly)? {
            Some((heap_id, alloc)) => {
                let address = alloc.address;
                state.allocations.insert(address, Allocation::Heap { heap_id, alloc });
                drop(states);

                if let Some(fill) = opts.fill {
                    proxy.write(address, &vec![fill; size as usize])?;
                }

                Ok(address)
            }
            None => {
                // Zone exhaustion is not an error at this layer; the CRT
                // serves what the heap cannot.
                let address = hijack::crt_alloc(proxy, size, opts)?;
                state.allocations.insert(address, Allocation::Crt);

                Ok(address)
            }
        }
    }

    fn thread_free(&self, proxy: &ProxyThread, address: u64) -> Result<()> {
        let mut states = self.states.lock().unwrap();

        if let Some(state) = states.get_mut(&proxy.id()) {
            if let Some(Allocation::Heap { heap_id, alloc }) = state.allocations.remove(&address) {
                return match state.heap_mut(heap_id) {
                    Some(heap) => heap.free(&alloc),
                    None => Err(Error::InvalidFree { address }),
                };
            }
        }
        drop(states);

        // CRT-backed or unknown.
        hijack::crt_free(proxy, address)
    }

    fn thread_close(
        &self,
        proxy: &ProxyThread,
        captured: &SharedThread,
        suicide: Option<u32>,
    ) -> Result<()> {
        let state = self.states.lock().unwrap().remove(&proxy.id());

        if let Some(state) = state {
            // Heaps first: destruction frees in-thread and needs the park
            // alive.
            for heap in state.previous.into_iter().chain(state.active) {
                let id = heap.id();
                if let Err(error) = heap.destroy(proxy) {
                    log::warn!("destroying heap #{} failed: {}", id, error);
                }
            }

            for (address, allocation) in state.allocations {
                if matches!(allocation, Allocation::Crt) {
                    if let Err(error) = hijack::crt_free(proxy, address) {
                        log::warn!("freeing crt allocation {:#x} failed: {}", address, error);
                    }
                }
            }
        }

        hijack::close_captured(captured, suicide)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::RegKey;
    use crate::captured::CapturedThread;
    use crate::nt::Thread;
    use crate::proxy::WriteSource;

    /// Routes the proxy's CRT calls into a leaked local arena so allocator
    /// behavior can run without a live hijack. Returns the arena base and
    /// the log of `free` calls.
    fn install_fake_crt(proxy: &ProxyThread) -> (u64, &'static Mutex<Vec<u64>>) {
        let arena = Vec::leak(vec![0u8; 1 << 16]);
        let base = arena.as_mut_ptr() as u64;

        let bump: &'static AtomicU64 = Box::leak(Box::new(AtomicU64::new(base)));
        let frees: &'static Mutex<Vec<u64>> = Box::leak(Box::new(Mutex::new(Vec::new())));

        proxy.set_caller(move |_, target, args| {
            let crt = crt::get().unwrap();

            if target == crt.calloc {
                Ok(bump.fetch_add(args[1], Ordering::SeqCst))
            } else if target == crt.malloc || target == crt.realloc {
                let size = if target == crt.realloc { args[1] } else { args[0] };
                Ok(bump.fetch_add(size, Ordering::SeqCst))
            } else if target == crt.free {
                frees.lock().unwrap().push(args[0]);
                Ok(0)
            } else if target == crt.memset {
                let slice = unsafe {
                    core::slice::from_raw_parts_mut(args[0] as *mut u8, args[2] as usize)
                };
                slice.fill(args[1] as u8);
                Ok(args[0])
            } else {
                panic!("unexpected in-thread call to {:#x}", target);
            }
        });

        (base, frees)
    }

    fn bind_writer(proxy: &ProxyThread, layer: &Arc<NThreadHeap>) {
        let hooks = Arc::clone(layer);
        proxy.set_writer(move |proxy, dest, source| match source {
            WriteSource::Buffer(data) => hooks.write_memory(proxy, dest, data),
            WriteSource::Pointer { address, size } => {
                hooks.write_with_pointer(proxy, dest, address, size)
            }
        });
    }

    fn dummy_captured() -> SharedThread {
        Arc::new(Mutex::new(CapturedThread::new(
            Thread::from_handle(core::ptr::null_mut()),
            0,
            RegKey::Rbx,
        )))
    }

    /// Seed scenario: zone offsets, free-list reuse and coalescing.
    #[test]
    fn zones_serve_reuse_and_coalesce() {
        let base = 0x7000_0000u64;
        let mut heap = Heap::with_layout(base, 256, 128);

        let ro1 = heap.alloc(32, true).unwrap();
        let ro2 = heap.alloc(32, true).unwrap();
        let rw1 = heap.alloc(48, false).unwrap();
        let rw2 = heap.alloc(32, false).unwrap();
        assert_eq!(ro1.address, base);
        assert_eq!(ro2.address, base + 32);
        assert_eq!(rw1.address, base + 128);
        assert_eq!(rw2.address, base + 176);

        // Freed head block serves smaller requests front to back.
        heap.free(&ro1).unwrap();
        let small1 = heap.alloc(16, true).unwrap();
        let small2 = heap.alloc(16, true).unwrap();
        assert_eq!(small1.address, base);
        assert_eq!(small2.address, base + 16);

        // Adjacent frees coalesce back into one block.
        heap.free(&small1).unwrap();
        heap.free(&small2).unwrap();
        let merged = heap.alloc(32, true).unwrap();
        assert_eq!(merged.address, base);

        heap.free(&merged).unwrap();
        heap.free(&ro2).unwrap();
        assert_eq!(
            heap.ro.free_list,
            [FreeBlock {
                address: base,
                size: 64
            }]
        );

        let foreign = HeapAlloc {
            address: 0xDEAD,
            size: 4,
            readonly: true,
        };
        assert!(matches!(
            heap.free(&foreign),
            Err(Error::InvalidFree { address: 0xDEAD })
        ));

        heap.reset();
        assert_eq!(heap.ro.bump, heap.ro.start);
        assert_eq!(heap.rw.bump, heap.rw.start);
        assert!(heap.ro.free_list.is_empty());
        assert_eq!(heap.alloc(8, false).unwrap().address, base + 128);
    }

    #[test]
    fn exhausted_zone_recovers_through_free() {
        let base = 0x7100_0000u64;
        let mut heap = Heap::with_layout(base, 64, 32);

        let a = heap.alloc(32, true).unwrap();
        assert!(heap.alloc(1, true).is_none());

        heap.free(&a).unwrap();
        assert_eq!(heap.alloc(32, true).unwrap().address, base);
    }

    /// Seed scenario: growth 64 → 128 → 256, previous-heap retention, CRT
    /// fallback past the ceiling, and close accounting.
    #[test]
    fn growth_ceiling_and_close_accounting() {
        let layer = Arc::new(NThreadHeap::new(64, 256));
        let proxy = ProxyThread::new(None);
        let (base, frees) = install_fake_crt(&proxy);
        bind_writer(&proxy, &layer);

        // 48-byte RW chunks: the first fills the 64-byte heap (ro share 16),
        // the next two the 128-byte heap, the fourth forces 256.
        let a1 = layer.thread_alloc(&proxy, 48, AllocOptions::default()).unwrap();
        let a2 = layer.thread_alloc(&proxy, 48, AllocOptions::default()).unwrap();
        let a3 = layer.thread_alloc(&proxy, 48, AllocOptions::default()).unwrap();
        let a4 = layer.thread_alloc(&proxy, 48, AllocOptions::default()).unwrap();
        assert_eq!(a1, base + 16);
        assert_eq!(a2, base + 64 + 32);
        assert_eq!(a3, base + 64 + 80);
        assert_eq!(a4, base + 192 + 64);

        {
            let states = layer.states.lock().unwrap();
            let state = states.get(&proxy.id()).unwrap();
            assert_eq!(state.previous.len(), 2);
            assert_eq!(state.active.as_ref().unwrap().total_size(), 256);
        }

        // Past the ceiling: the CRT takes over.
        let big = layer.thread_alloc(&proxy, 400, AllocOptions::default()).unwrap();
        assert_eq!(big, base + 448);
        {
            let states = layer.states.lock().unwrap();
            let state = states.get(&proxy.id()).unwrap();
            assert!(matches!(state.allocations[&big], Allocation::Crt));
        }

        // Heap-backed frees return to their zone and are reused in place.
        layer.thread_free(&proxy, a4).unwrap();
        let again = layer.thread_alloc(&proxy, 48, AllocOptions::default()).unwrap();
        assert_eq!(again, a4);

        layer.thread_close(&proxy, &dummy_captured(), None).unwrap();

        // Every heap block freed exactly once, plus the CRT fallback.
        let frees = frees.lock().unwrap();
        assert_eq!(frees.len(), 4);
        for expected in [base, base + 64, base + 192, big] {
            assert_eq!(frees.iter().filter(|&&f| f == expected).count(), 1);
        }
    }

    #[test]
    fn realloc_copies_contents_and_keeps_the_zone() {
        let layer = Arc::new(NThreadHeap::new(256, 1024));
        let proxy = ProxyThread::new(None);
        let (base, _frees) = install_fake_crt(&proxy);
        bind_writer(&proxy, &layer);

        let ptr = layer
            .thread_alloc(
                &proxy,
                16,
                AllocOptions {
                    fill: Some(0xAB),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(ptr, base + 64);
        assert_eq!(proxy.read(ptr, 16).unwrap(), vec![0xAB; 16]);

        let grown = layer
            .thread_alloc(
                &proxy,
                32,
                AllocOptions {
                    address: Some(ptr),
                    fill: Some(0xCD),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_ne!(grown, ptr);

        let bytes = proxy.read(grown, 32).unwrap();
        assert_eq!(&bytes[..16], &[0xAB; 16]);
        assert_eq!(&bytes[16..], &[0xCD; 16]);

        // The old span went back to its zone's free list.
        let reused = layer.thread_alloc(&proxy, 16, AllocOptions::default()).unwrap();
        assert_eq!(reused, ptr);
    }
}
