/*
 * DMA address space shared with the security engine.
 *
 * The engine only ever sees 32-bit bus addresses. `DmaSpace` hands out
 * address ranges inside a fixed aperture and keeps the backing memory for
 * each live mapping, so both the CPU side (through `DmaBuffer`) and the
 * engine side (through `read`/`write`) resolve the same bytes.
 */
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::error;

use crate::error::VseError;

const DMA_ALIGN: u64 = 64;

pub const DEFAULT_APERTURE_BASE: u32 = 0x8000_0000;
pub const DEFAULT_APERTURE_SIZE: u32 = 0x4000_0000;

struct Region {
    base: u32,
    data: Mutex<Vec<u8>>,
}

pub struct DmaSpace {
    base: u32,
    size: u32,
    regions: RwLock<BTreeMap<u32, Arc<Region>>>,
    fail_allocs: AtomicU32,
}

impl DmaSpace {
    pub fn new(base: u32, size: u32) -> Arc<Self> {
        Arc::new(Self {
            base,
            size,
            regions: RwLock::new(BTreeMap::new()),
            fail_allocs: AtomicU32::new(0),
        })
    }

    pub fn with_default_aperture() -> Arc<Self> {
        Self::new(DEFAULT_APERTURE_BASE, DEFAULT_APERTURE_SIZE)
    }

    /// Makes the next `count` allocations fail as if the aperture were full.
    pub fn inject_alloc_failures(&self, count: u32) {
        self.fail_allocs.store(count, Ordering::SeqCst);
    }

    /// Allocates a zeroed buffer visible to both sides.
    pub fn alloc_coherent(self: &Arc<Self>, len: usize) -> Result<DmaBuffer, VseError> {
        self.map(vec![0; len])
    }

    /// Maps a copy of `data` for the engine to read.
    pub fn map_to_device(self: &Arc<Self>, data: &[u8]) -> Result<DmaBuffer, VseError> {
        self.map(data.to_vec())
    }

    fn map(self: &Arc<Self>, data: Vec<u8>) -> Result<DmaBuffer, VseError> {
        let injected = self
            .fail_allocs
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if injected.is_ok() {
            return Err(VseError::NoMemory);
        }

        let span = (data.len().max(1) as u64).next_multiple_of(DMA_ALIGN);
        let mut regions = self.regions.write();

        // first fit
        let end = u64::from(self.base) + u64::from(self.size);
        let mut cursor = u64::from(self.base);
        for (&base, region) in regions.iter() {
            if u64::from(base) - cursor >= span {
                break;
            }
            let len = region.data.lock().len().max(1) as u64;
            cursor = (u64::from(base) + len).next_multiple_of(DMA_ALIGN);
        }
        if cursor + span > end {
            error!(len = data.len(), "DMA aperture exhausted");
            return Err(VseError::NoMemory);
        }

        let region = Arc::new(Region {
            base: cursor as u32,
            data: Mutex::new(data),
        });
        regions.insert(region.base, region.clone());
        Ok(DmaBuffer {
            space: self.clone(),
            region,
        })
    }

    fn unmap(&self, base: u32) {
        self.regions.write().remove(&base);
    }

    fn lookup(&self, addr: u64, len: usize) -> Option<(Arc<Region>, usize)> {
        let addr = u32::try_from(addr).ok()?;
        let regions = self.regions.read();
        let (_, region) = regions.range(..=addr).next_back()?;
        let offset = (addr - region.base) as usize;
        let fits = offset
            .checked_add(len)
            .is_some_and(|end| end <= region.data.lock().len());
        fits.then(|| (region.clone(), offset))
    }

    /// Engine-side read. `None` if the range is not fully mapped.
    pub fn read(&self, addr: u64, len: usize) -> Option<Vec<u8>> {
        let (region, offset) = self.lookup(addr, len)?;
        let data = region.data.lock();
        Some(data[offset..offset + len].to_vec())
    }

    /// Engine-side write. Returns false if the range is not fully mapped.
    pub fn write(&self, addr: u64, bytes: &[u8]) -> bool {
        match self.lookup(addr, bytes.len()) {
            Some((region, offset)) => {
                region.data.lock()[offset..offset + bytes.len()].copy_from_slice(bytes);
                true
            }
            None => false,
        }
    }

    pub fn mapped_regions(&self) -> usize {
        self.regions.read().len()
    }
}

/// A live mapping. Unmapped when dropped.
pub struct DmaBuffer {
    space: Arc<DmaSpace>,
    region: Arc<Region>,
}

impl DmaBuffer {
    pub fn addr(&self) -> u32 {
        self.region.base
    }

    pub fn len(&self) -> usize {
        self.region.data.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn write_at(&self, offset: usize, bytes: &[u8]) {
        self.region.data.lock()[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    pub fn read_at(&self, offset: usize, out: &mut [u8]) {
        out.copy_from_slice(&self.region.data.lock()[offset..offset + out.len()]);
    }

    pub fn with<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        f(&self.region.data.lock())
    }

    pub fn with_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        f(&mut self.region.data.lock())
    }
}

impl Drop for DmaBuffer {
    fn drop(&mut self) {
        self.space.unmap(self.region.base);
    }
}

impl core::fmt::Debug for DmaBuffer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DmaBuffer")
            .field("addr", &format_args!("{:#x}", self.addr()))
            .field("len", &self.len())
            .finish()
    }
}
