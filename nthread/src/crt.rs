//! The msvcrt export table, resolved once per process.

use crate::error::Result;
use crate::nt::Module;
use once_cell::sync::OnceCell;

const MODULE: &str = "msvcrt.dll";

/// Addresses of the CRT exports the hijack machinery calls in-thread.
///
/// System DLL bases are shared across processes of one boot session, so the
/// addresses resolved here are valid inside the target as well.
#[derive(Debug, Clone, Copy)]
pub struct Crt {
    pub fopen: u64,
    pub memset: u64,
    pub malloc: u64,
    pub calloc: u64,
    pub realloc: u64,
    pub fwrite: u64,
    pub fflush: u64,
    pub fclose: u64,
    pub fread: u64,
    pub free: u64,
}

static CRT: OnceCell<Crt> = OnceCell::new();

/// Resolves (on first use) and returns the export table.
///
/// `msvcrt.dll` is loaded if absent; a plain Rust or MSVC process links the
/// UCRT instead and does not pull it in by itself.
pub fn get() -> Result<&'static Crt> {
    CRT.get_or_try_init(|| {
        let module = Module::load(MODULE)?;

        Ok(Crt {
            fopen: module.proc_address("fopen")?,
            memset: module.proc_address("memset")?,
            malloc: module.proc_address("malloc")?,
            calloc: module.proc_address("calloc")?,
            realloc: module.proc_address("realloc")?,
            fwrite: module.proc_address("fwrite")?,
            fflush: module.proc_address("fflush")?,
            fclose: module.proc_address("fclose")?,
            fread: module.proc_address("fread")?,
            free: module.proc_address("free")?,
        })
    })
}

/// The auto-bound CRT surface: every resolved export except `free`, which
/// participates in allocator policy and is a first-class proxy method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrtFn {
    Fopen,
    Memset,
    Malloc,
    Calloc,
    Realloc,
    Fwrite,
    Fflush,
    Fclose,
    Fread,
}

impl CrtFn {
    pub const fn name(self) -> &'static str {
        match self {
            CrtFn::Fopen => "fopen",
            CrtFn::Memset => "memset",
            CrtFn::Malloc => "malloc",
            CrtFn::Calloc => "calloc",
            CrtFn::Realloc => "realloc",
            CrtFn::Fwrite => "fwrite",
            CrtFn::Fflush => "fflush",
            CrtFn::Fclose => "fclose",
            CrtFn::Fread => "fread",
        }
    }

    pub const fn address(self, crt: &Crt) -> u64 {
        match self {
            CrtFn::Fopen => crt.fopen,
            CrtFn::Memset => crt.memset,
            CrtFn::Malloc => crt.malloc,
            CrtFn::Calloc => crt.calloc,
            CrtFn::Realloc => crt.realloc,
            CrtFn::Fwrite => crt.fwrite,
            CrtFn::Fflush => crt.fflush,
            CrtFn::Fclose => crt.fclose,
            CrtFn::Fread => crt.fread,
        }
    }
}
