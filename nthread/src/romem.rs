//! Process-wide registry of read-only regions.
//!
//! A region pairs a remote span with a local snapshot of its exact current
//! contents. Writes that overlap a region can then skip every byte that
//! already matches, which is what makes the memset-decomposed writer cheap
//! on mostly-unchanged buffers. The registry owns only the snapshots,
//! never the remote memory.

use crate::crt::CrtFn;
use crate::error::{Error, Result};
use crate::proxy::ProxyThread;
use once_cell::sync::Lazy;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

struct Region {
    id: u64,
    remote: u64,
    local: Vec<u8>,
}

static REGIONS: Lazy<Mutex<Vec<Region>>> = Lazy::new(|| Mutex::new(Vec::new()));
static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Handle to a registered read-only region. Compares by registration
/// identity, so a stale handle does not match a later region at the same
/// address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoMem {
    id: u64,
    remote: u64,
    len: usize,
}

impl RoMem {
    pub fn remote(&self) -> u64 {
        self.remote
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Allocates a zeroed region in the target (in-thread `calloc`) and
/// registers it with a matching all-zero snapshot.
pub fn create_read_only_memory(proxy: &ProxyThread, size: usize) -> Result<RoMem> {
    let remote = proxy.crt_call(CrtFn::Calloc, &[1, size as u64])?;
    if remote == 0 {
        return Err(Error::AllocFailed { size: size as u64 });
    }

    Ok(register_read_only_memory(remote, vec![0u8; size]))
}

/// Manual pairing; the caller asserts that `local` matches the remote
/// contents over the whole span.
pub fn register_read_only_memory(remote: u64, local: Vec<u8>) -> RoMem {
    let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    let handle = RoMem {
        id,
        remote,
        len: local.len(),
    };

    log::trace!(
        "registered ro region #{} at {:#x} ({} bytes)",
        id,
        remote,
        local.len()
    );
    REGIONS.lock().unwrap().push(Region { id, remote, local });

    handle
}

/// Removes the region; returns whether it was still registered. The remote
/// memory is not freed.
pub fn unregister_read_only_memory(region: RoMem) -> bool {
    let mut regions = REGIONS.lock().unwrap();

    match regions.iter().position(|r| r.id == region.id) {
        Some(index) => {
            regions.remove(index);
            true
        }
        None => false,
    }
}

/// First registered region intersecting `[dest, dest + len)`.
pub fn find_overlapping_region(dest: u64, len: usize) -> Option<RoMem> {
    let end = dest + len as u64;

    REGIONS
        .lock()
        .unwrap()
        .iter()
        .find(|r| end > r.remote && dest < r.remote + r.local.len() as u64)
        .map(|r| RoMem {
            id: r.id,
            remote: r.remote,
            len: r.local.len(),
        })
}

/// For a write of `len` bytes at `dest`: the offset into the write where
/// the overlap with `region` begins, the overlap length, and the snapshot
/// bytes covering exactly that overlap.
pub(crate) fn overlap_info(
    region: RoMem,
    dest: u64,
    len: usize,
) -> Option<(usize, usize, Vec<u8>)> {
    let regions = REGIONS.lock().unwrap();
    let r = regions.iter().find(|r| r.id == region.id)?;

    let dest_end = dest + len as u64;
    let region_end = r.remote + r.local.len() as u64;
    if dest_end <= r.remote || dest >= region_end {
        return None;
    }

    let overlap_start = dest.max(r.remote);
    let overlap_end = dest_end.min(region_end);
    let write_offset = (overlap_start - dest) as usize;
    let overlap_len = (overlap_end - overlap_start) as usize;
    let local_offset = (overlap_start - r.remote) as usize;

    Some((
        write_offset,
        overlap_len,
        r.local[local_offset..local_offset + overlap_len].to_vec(),
    ))
}

/// Folds bytes just written at `dest` into the snapshot, handling partial
/// overlap on either side.
pub(crate) fn update_snapshot(region: RoMem, source: &[u8], dest: u64) {
    let mut regions = REGIONS.lock().unwrap();
    let Some(r) = regions.iter_mut().find(|r| r.id == region.id) else {
        return;
    };

    let dest_end = dest + source.len() as u64;
    let region_end = r.remote + r.local.len() as u64;
    let overlap_start = dest.max(r.remote);
    let overlap_end = dest_end.min(region_end);
    if overlap_start >= overlap_end {
        return;
    }

    let source_offset = (overlap_start - dest) as usize;
    let local_offset = (overlap_start - r.remote) as usize;
    let count = (overlap_end - overlap_start) as usize;

    r.local[local_offset..local_offset + count]
        .copy_from_slice(&source[source_offset..source_offset + count]);
}

#[cfg(test)]
mod tests {
    use super::*;

    // Each test uses its own address range; the registry is process-wide.

    #[test]
    fn overlap_queries() {
        let region = register_read_only_memory(0x51_0000, vec![0u8; 0x100]);

        assert!(find_overlapping_region(0x50_ff00, 0x100).is_none());
        assert!(find_overlapping_region(0x51_0100, 0x10).is_none());
        assert_eq!(find_overlapping_region(0x50_ffff, 2), Some(region));
        assert_eq!(find_overlapping_region(0x51_00ff, 2), Some(region));

        assert!(unregister_read_only_memory(region));
        assert!(!unregister_read_only_memory(region));
        assert!(find_overlapping_region(0x51_0000, 1).is_none());
    }

    #[test]
    fn overlap_info_covers_the_intersection_only() {
        let region = register_read_only_memory(0x52_0010, (0..16).collect());

        // Write starts 8 bytes before the region and pokes 4 bytes into it.
        let (write_offset, overlap_len, snapshot) =
            overlap_info(region, 0x52_0008, 12).unwrap();
        assert_eq!(write_offset, 8);
        assert_eq!(overlap_len, 4);
        assert_eq!(snapshot, [0, 1, 2, 3]);

        // Write fully inside.
        let (write_offset, overlap_len, snapshot) =
            overlap_info(region, 0x52_0014, 4).unwrap();
        assert_eq!(write_offset, 0);
        assert_eq!(overlap_len, 4);
        assert_eq!(snapshot, [4, 5, 6, 7]);

        unregister_read_only_memory(region);
    }

    #[test]
    fn snapshot_updates_handle_partial_overlap() {
        let region = register_read_only_memory(0x53_0010, vec![0u8; 8]);

        // Source hangs over the front edge: only its tail lands in the
        // snapshot.
        update_snapshot(region, &[0xAA; 4], 0x53_000e);
        // And over the back edge.
        update_snapshot(region, &[0xBB; 4], 0x53_0016);

        let (_, _, snapshot) = overlap_info(region, 0x53_0010, 8).unwrap();
        assert_eq!(snapshot, [0xAA, 0xAA, 0, 0, 0, 0, 0xBB, 0xBB]);

        unregister_read_only_memory(region);
    }
}
