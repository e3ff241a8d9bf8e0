use crate::param::USERLAND_END;
use crate::platform::Platform;
use crate::vm::{MapError, PAGE_SIZE_U32};
use crate::Kernel;
use core::fmt;
use log::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapError {
    /// The requested end lies below the current one
    Shrink { current: u32, requested: u32 },
    /// The requested end lies outside user space
    OutOfRange(u32),
    OutOfMemory,
    Map(MapError),
}

impl From<MapError> for HeapError {
    fn from(err: MapError) -> Self {
        match err {
            MapError::OutOfMemory => HeapError::OutOfMemory,
            other => HeapError::Map(other),
        }
    }
}

impl fmt::Display for HeapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeapError::Shrink { current, requested } => write!(
                f,
                "cannot shrink heap from 0x{current:08x} to 0x{requested:08x}"
            ),
            HeapError::OutOfRange(end) => write!(f, "heap end 0x{end:08x} outside user space"),
            HeapError::OutOfMemory => f.write_str("out of memory"),
            HeapError::Map(err) => write!(f, "mapping heap: {err}"),
        }
    }
}

impl<P: Platform> Kernel<P> {
    /// Move the heap end of the calling process up to `heap_end`, mapping the
    /// pages in between. `0` only queries the current end.
    ///
    /// Pages mapped before a failure stay mapped.
    pub fn process_memlimit(&self, heap_end: u32) -> Result<u32, HeapError> {
        let pid = self.current_process();
        let thread = self.platform.current_thread();
        let current = self.process_table.lock(&self.platform)[pid].heap_end;

        if heap_end == 0 {
            return Ok(current);
        }
        if heap_end < current {
            warn!("process {pid}: memlimit 0x{heap_end:08x} below 0x{current:08x}");
            return Err(HeapError::Shrink {
                current,
                requested: heap_end,
            });
        }
        if heap_end >= USERLAND_END {
            return Err(HeapError::OutOfRange(heap_end));
        }

        for page in current / PAGE_SIZE_U32 + 1..=heap_end / PAGE_SIZE_U32 {
            self.map_fresh_page(thread, page * PAGE_SIZE_U32, true)?;
        }
        self.process_table.lock(&self.platform)[pid].heap_end = heap_end;
        debug!("process {pid}: heap end 0x{current:08x} -> 0x{heap_end:08x}");
        Ok(heap_end)
    }
}
