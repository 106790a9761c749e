use std::fs::File;

use memmap2::{Mmap, MmapOptions};

use crate::error::Result;
use crate::Error;

/// Read-only shared mapping of the whole store file.
///
/// Mutations always go through positional writes on the file, which a shared
/// mapping observes. Growth is not observed: the view has to be rebuilt with
/// [`MapView::remap`], which bumps the generation. Slices handed out borrow
/// the view, so none can survive a remap.
#[derive(Debug)]
pub struct MapView {
    map: Mmap,
    generation: u64,
}

impl MapView {
    pub fn new(file: &File) -> Result<Self> {
        Ok(Self {
            map: map_file(file)?,
            generation: 0,
        })
    }

    /// Maps the file again at its current length.
    pub fn remap(&mut self, file: &File) -> Result<()> {
        let old_len = self.map.len();
        self.map = map_file(file)?;
        self.generation += 1;
        tracing::debug!(
            old_len,
            new_len = self.map.len(),
            generation = self.generation,
            "remapped store"
        );
        Ok(())
    }

    pub fn bytes(&self) -> &[u8] {
        &self.map
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

fn map_file(file: &File) -> Result<Mmap> {
    // Safety: the store is only ever extended or patched in place, never
    // truncated while handles are open.
    unsafe { MmapOptions::new().map(file) }.map_err(Error::MapError)
}
