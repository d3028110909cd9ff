//! Process-wide gadget pools.
//!
//! Discovery is lazy and runs at most once: the first pick scans the system
//! modules for the exact byte patterns from [`asm`](crate::asm), restricted
//! to executable pages. Manual registration appends to the pools without
//! triggering a scan.

use crate::asm::{self, RegKey};
use crate::error::{Error, Result};
use crate::nt::Module;
use once_cell::sync::Lazy;
use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::sync::Mutex;

const SCAN_MODULES: [&str; 4] = ["ntdll.dll", "kernel32.dll", "kernelbase.dll", "msvcrt.dll"];

/// Register order tried for pivots when the caller has no preference.
/// Callee-saved registers first; they are the least likely to hold live
/// data at an arbitrary suspension point.
pub const PIVOT_PRIORITY: [RegKey; 4] = [RegKey::Rbx, RegKey::Rbp, RegKey::Rdi, RegKey::Rsi];

#[derive(Default)]
struct Pools {
    scanned: bool,
    sleeps: Vec<u64>,
    pivots: HashMap<RegKey, Vec<u64>>,
}

static POOLS: Lazy<Mutex<Pools>> = Lazy::new(|| Mutex::new(Pools::default()));

fn discover(pools: &mut Pools) -> Result<()> {
    if pools.scanned {
        return Ok(());
    }
    pools.scanned = true;

    let sleep = asm::sleep_gadget()?;
    let pivots = RegKey::ALL
        .iter()
        .map(|&reg| Ok((reg, asm::pivot_gadget(reg)?)))
        .collect::<Result<Vec<_>>>()?;

    for name in SCAN_MODULES {
        let module = match Module::open(name) {
            Ok(module) => module,
            Err(_) => {
                log::trace!("gadget scan skips {}: not loaded", name);
                continue;
            }
        };

        pools.sleeps.extend(module.scan(&sleep));

        for (reg, pattern) in &pivots {
            let hits = module.scan(pattern);
            if !hits.is_empty() {
                pools.pivots.entry(*reg).or_default().extend(hits);
            }
        }
    }

    log::info!(
        "gadget scan done: {} sleep candidates, {} pivot register classes",
        pools.sleeps.len(),
        pools.pivots.len()
    );

    Ok(())
}

/// Uniformly random sleep gadget.
///
/// Randomisation spreads concurrent hijacks over distinct park addresses;
/// it is not a security property.
pub fn pick_sleep() -> Result<u64> {
    let mut pools = POOLS.lock().unwrap();
    discover(&mut pools)?;

    pools
        .sleeps
        .choose(&mut rand::thread_rng())
        .copied()
        .ok_or(Error::NoSleepGadget)
}

/// Pivot gadget for `preferred`, or for the first non-empty register class
/// of [`PIVOT_PRIORITY`]; uniformly random within the class.
pub fn pick_pivot(preferred: Option<RegKey>) -> Result<(u64, RegKey)> {
    let mut pools = POOLS.lock().unwrap();
    discover(&mut pools)?;

    let order: &[RegKey] = match &preferred {
        Some(reg) => core::slice::from_ref(reg),
        None => &PIVOT_PRIORITY,
    };

    for &reg in order {
        let Some(class) = pools.pivots.get(&reg) else {
            continue;
        };

        if let Some(address) = class.choose(&mut rand::thread_rng()) {
            return Ok((*address, reg));
        }
    }

    Err(Error::NoPivotGadget)
}

/// Registers a known sleep gadget, bypassing discovery.
pub fn register_sleep_gadget(address: u64) {
    POOLS.lock().unwrap().sleeps.push(address);
}

/// Registers a known pivot gadget, bypassing discovery.
pub fn register_pivot_gadget(address: u64, reg: RegKey) {
    POOLS
        .lock()
        .unwrap()
        .pivots
        .entry(reg)
        .or_default()
        .push(address);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_registration_feeds_the_pools() {
        register_sleep_gadget(0x7ffa_0000_1000);
        register_pivot_gadget(0x7ffa_0000_2000, RegKey::R13);

        assert!(pick_sleep().is_ok());
        let (_, reg) = pick_pivot(Some(RegKey::R13)).unwrap();
        assert_eq!(reg, RegKey::R13);
    }
}
