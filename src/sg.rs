/*
 * Scatter-gather lists and the linked-list DMA descriptors built over them.
 */
use std::sync::Arc;

use common::ivc::{SeAddr, MAX_BUFFER_SIZE};
use tracing::error;

use crate::dma::{DmaBuffer, DmaSpace};
use crate::error::VseError;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ScatterList {
    segs: Vec<Vec<u8>>,
}

impl ScatterList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_segments(segs: Vec<Vec<u8>>) -> Self {
        Self { segs }
    }

    /// A single segment holding a copy of `data`.
    pub fn from_slice(data: &[u8]) -> Self {
        if data.is_empty() {
            return Self::new();
        }
        Self {
            segs: vec![data.to_vec()],
        }
    }

    /// Splits `data` into segments of at most `seg_len` bytes.
    pub fn chunked(data: &[u8], seg_len: usize) -> Self {
        Self {
            segs: data.chunks(seg_len.max(1)).map(<[u8]>::to_vec).collect(),
        }
    }

    /// Zero-filled segments with the same shape as `other`.
    pub fn zeroed_like(other: &ScatterList) -> Self {
        Self {
            segs: other.segs.iter().map(|s| vec![0; s.len()]).collect(),
        }
    }

    pub fn push(&mut self, seg: Vec<u8>) {
        self.segs.push(seg);
    }

    pub fn len(&self) -> usize {
        self.segs.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn nents(&self) -> usize {
        self.segs.len()
    }

    pub fn segments(&self) -> &[Vec<u8>] {
        &self.segs
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.segs.concat()
    }

    /// Copies `out.len()` bytes starting `skip` bytes into the list.
    /// Returns how many bytes were copied.
    pub fn copy_to_buffer(&self, skip: usize, out: &mut [u8]) -> usize {
        let mut skip = skip;
        let mut done = 0;
        for seg in &self.segs {
            if done == out.len() {
                break;
            }
            if skip >= seg.len() {
                skip -= seg.len();
                continue;
            }
            let n = (seg.len() - skip).min(out.len() - done);
            out[done..done + n].copy_from_slice(&seg[skip..skip + n]);
            done += n;
            skip = 0;
        }
        done
    }

    /// Copies `data` into the list starting `skip` bytes in.
    /// Returns how many bytes were copied.
    pub fn copy_from_buffer(&mut self, skip: usize, data: &[u8]) -> usize {
        let mut skip = skip;
        let mut done = 0;
        for seg in &mut self.segs {
            if done == data.len() {
                break;
            }
            if skip >= seg.len() {
                skip -= seg.len();
                continue;
            }
            let n = (seg.len() - skip).min(data.len() - done);
            seg[skip..skip + n].copy_from_slice(&data[done..done + n]);
            done += n;
            skip = 0;
        }
        done
    }

    /// Number of segments touched by the first `nbytes` bytes.
    pub fn count_for(&self, nbytes: usize) -> usize {
        let mut left = nbytes;
        let mut count = 0;
        for seg in &self.segs {
            if left == 0 {
                break;
            }
            count += 1;
            left = left.saturating_sub(seg.len());
        }
        count
    }
}

/// One planned descriptor: segment index, offset within it, length.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Descriptor {
    pub seg: usize,
    pub offset: usize,
    pub len: usize,
}

/// Plans the descriptors covering the first `total_len` bytes of segments
/// with the given lengths. A piece of `MAX_BUFFER_SIZE` or more is cut into
/// chunks of `MAX_BUFFER_SIZE - block_size`.
pub(crate) fn plan_descriptors(
    seg_lens: impl IntoIterator<Item = usize>,
    total_len: usize,
    block_size: usize,
) -> Vec<Descriptor> {
    let mut plan = Vec::new();
    let mut total = total_len;
    for (seg, seg_len) in seg_lens.into_iter().enumerate() {
        if total == 0 {
            break;
        }
        let mut len = seg_len.min(total);
        let mut offset = 0;
        while len >= MAX_BUFFER_SIZE {
            let chunk = MAX_BUFFER_SIZE - block_size;
            plan.push(Descriptor {
                seg,
                offset,
                len: chunk,
            });
            offset += chunk;
            total -= chunk;
            len -= chunk;
        }
        if len > 0 {
            plan.push(Descriptor { seg, offset, len });
        }
        total -= len;
    }
    plan
}

/// Descriptors mapped for the engine. The mappings live as long as this.
#[derive(Debug)]
pub(crate) struct LinkedList {
    pub entries: Vec<SeAddr>,
    _maps: Vec<DmaBuffer>,
}

impl LinkedList {
    pub fn first(&self) -> SeAddr {
        self.entries.first().copied().unwrap_or_default()
    }
}

/// Maps the first `total_len` bytes of `sg` for the engine as at most
/// `max_entries` descriptors.
pub(crate) fn prepare_linked_list(
    dma: &Arc<DmaSpace>,
    sg: &ScatterList,
    total_len: usize,
    max_entries: usize,
    block_size: usize,
) -> Result<LinkedList, VseError> {
    let segs = sg.segments();
    let plan = plan_descriptors(segs.iter().map(Vec::len), total_len, block_size);
    if plan.len() > max_entries {
        error!(
            entries = plan.len(),
            max_entries, "unsupported number of linked-list entries"
        );
        return Err(VseError::TooManySegments(plan.len(), max_entries));
    }

    let mut maps: Vec<DmaBuffer> = Vec::new();
    let mut mapped_seg = None;
    let mut entries = Vec::with_capacity(plan.len());
    for d in plan {
        if mapped_seg != Some(d.seg) {
            maps.push(dma.map_to_device(&segs[d.seg])?);
            mapped_seg = Some(d.seg);
        }
        let base = maps.last().map(DmaBuffer::addr).unwrap_or_default();
        entries.push(SeAddr::new(base + d.offset as u32, d.len as u32));
    }
    Ok(LinkedList {
        entries,
        _maps: maps,
    })
}
