use parking_lot::Mutex;
use std::sync::Arc;

/// Battery-backed memory holding the working copy of the board config
///
/// Survives resets but not a dead battery; contents may be garbage.
pub trait BackupMemory: Send {
    /// Current contents of the config region.
    fn read(&self) -> Vec<u8>;

    fn write(&mut self, bytes: &[u8]);

    /// Zero the whole region.
    fn clear(&mut self);
}

/// Backup memory in RAM; clones share the same cells, so a test can drop the
/// store and "reset" onto the same memory.
#[derive(Debug, Clone, Default)]
pub struct RamBackup {
    cells: Arc<Mutex<Vec<u8>>>,
}

impl RamBackup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite one byte, for corrupting the copy in tests.
    pub fn poke(&self, offset: usize, value: u8) {
        let mut cells = self.cells.lock();
        if offset < cells.len() {
            cells[offset] = value;
        }
    }
}

impl BackupMemory for RamBackup {
    fn read(&self) -> Vec<u8> {
        self.cells.lock().clone()
    }

    fn write(&mut self, bytes: &[u8]) {
        let mut cells = self.cells.lock();
        cells.clear();
        cells.extend_from_slice(bytes);
    }

    fn clear(&mut self) {
        self.cells.lock().iter_mut().for_each(|b| *b = 0);
    }
}
