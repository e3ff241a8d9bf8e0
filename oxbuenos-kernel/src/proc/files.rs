use crate::platform::{OpenFile, Platform};
use crate::Kernel;

impl<P: Platform> Kernel<P> {
    /// Record `file` in the first free slot of the calling process' file table.
    /// Returns false if the table is full.
    pub fn process_add_file(&self, file: OpenFile) -> bool {
        let pid = self.current_process();
        let mut table = self.process_table.lock(&self.platform);
        match table[pid].files.iter_mut().find(|slot| slot.is_none()) {
            Some(slot) => {
                *slot = Some(file);
                true
            }
            None => false,
        }
    }

    pub fn process_remove_file(&self, file: OpenFile) -> bool {
        let pid = self.current_process();
        let mut table = self.process_table.lock(&self.platform);
        match table[pid].files.iter_mut().find(|slot| **slot == Some(file)) {
            Some(slot) => {
                *slot = None;
                true
            }
            None => false,
        }
    }

    pub fn process_has_open_file(&self, file: OpenFile) -> bool {
        let pid = self.current_process();
        self.process_table.lock(&self.platform)[pid]
            .files
            .contains(&Some(file))
    }
}
