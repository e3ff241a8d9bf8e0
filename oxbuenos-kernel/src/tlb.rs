//! TLB exception handling.
//!
//! The hardware TLB only caches entries of the current thread's page table.
//! A miss is resolved by looking the faulting page pair up in that table and
//! writing the entry into a random TLB slot. There is no demand paging, so a
//! fault on a page the table does not map is fatal.

use crate::param::FAULT_EXIT_CODE;
use crate::platform::Platform;
use crate::vm::{HalfPage, TlbEntry};
use crate::Kernel;
use bitfield::bitfield;
use log::{debug, error};

bitfield! {
    /// CP0 EntryHi register image
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct EntryHi(u32);
    impl Debug;
    pub u8, asid, set_asid: 7, 0;
    pub vpn2, set_vpn2: 31, 13;
}

bitfield! {
    /// CP0 EntryLo0/EntryLo1 register image
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct EntryLo(u32);
    impl Debug;
    pub global, set_global: 0;
    pub valid, set_valid: 1;
    pub dirty, set_dirty: 2;
    pub cache, set_cache: 5, 3;
    pub pfn, set_pfn: 29, 6;
}

/// Cacheable, noncoherent, write-back
const CACHE_MODE: u32 = 3;

impl From<&HalfPage> for EntryLo {
    fn from(half: &HalfPage) -> Self {
        let mut lo = EntryLo(0);
        if half.valid {
            lo.set_pfn(half.pfn);
            lo.set_cache(CACHE_MODE);
            lo.set_dirty(half.dirty);
            lo.set_valid(true);
        }
        lo
    }
}

impl TlbEntry {
    #[must_use]
    pub fn entry_hi(&self) -> EntryHi {
        let mut hi = EntryHi(0);
        hi.set_vpn2(self.vpn2);
        hi.set_asid(self.asid);
        hi
    }

    #[must_use]
    pub fn entry_lo0(&self) -> EntryLo {
        EntryLo::from(&self.even)
    }

    #[must_use]
    pub fn entry_lo1(&self) -> EntryLo {
        EntryLo::from(&self.odd)
    }
}

enum Refill {
    Write(TlbEntry),
    NoPagetable,
    InvalidHalf,
    NotFound,
}

impl<P: Platform> Kernel<P> {
    /// A fault that is fatal to the user process that caused it, or to the whole kernel
    fn tlb_error(&self, is_userland: bool, msg: &str) -> ! {
        if is_userland {
            error!("{msg}");
            self.process_finish(FAULT_EXIT_CODE)
        } else {
            panic!("{msg}");
        }
    }

    /// Store to a valid page that is not writable
    pub fn tlb_modified_exception(&self, is_userland: bool) -> ! {
        self.tlb_error(is_userland, "TLB modified exception.")
    }

    /// TLB miss on a load
    pub fn tlb_load_exception(&self, is_userland: bool) {
        self.tlb_access_exception(is_userland);
    }

    /// TLB miss on a store
    pub fn tlb_store_exception(&self, is_userland: bool) {
        self.tlb_access_exception(is_userland);
    }

    fn tlb_access_exception(&self, is_userland: bool) {
        let state = self.platform.tlb_exception_state();
        let thread = self.platform.current_thread();

        let refill = {
            let entry = self.thread_table[thread].lock(&self.platform);
            match entry.pagetable.as_deref() {
                None => Refill::NoPagetable,
                Some(pagetable) => match pagetable
                    .entries()
                    .iter()
                    .find(|entry| entry.vpn2 == state.badvpn2)
                {
                    Some(entry) if entry.is_valid_for(state.badvaddr) => Refill::Write(*entry),
                    Some(_) => Refill::InvalidHalf,
                    None => Refill::NotFound,
                },
            }
        };

        match refill {
            Refill::Write(entry) => {
                debug!(
                    "tlb refill: 0x{:08x} asid {} -> {:?}",
                    state.badvaddr,
                    state.asid,
                    entry.entry_hi()
                );
                self.platform.tlb_write_random(&entry);
            }
            Refill::NoPagetable => {
                self.tlb_error(is_userland, "No pagetable associated with current thread.")
            }
            Refill::InvalidHalf => self.tlb_error(
                is_userland,
                "Found an invalid TLB entry while handling a TLB miss exception.",
            ),
            Refill::NotFound => panic!("Page not found in pagetable."),
        }
    }
}
