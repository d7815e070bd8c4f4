//! Memory-tracked guest resources.
//!
//! Every buffer, image and palette lives in a [`ResourceArena`] and is named
//! by a [`Handle`]. An owning resource charges its byte size against the
//! computer's [`MemoryTracker`]; a view created with [`ResourceArena::sub`]
//! only borrows a window of its root owner and keeps that owner alive until
//! the view itself is released. The owner's bytes go back to the tracker
//! exactly once, when neither handle references nor views remain.

use std::{fmt, rc::Rc};

use thiserror::Error;
use tracing::{debug, trace};

use crate::{memory::MemoryTracker, utils::hexdump};

pub const PALETTE_ENTRY_SIZE: usize = 3;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResourceError {
    #[error("not enough memory")]
    OutOfMemory,
    #[error("range {start}..{end} is out of bounds for a resource of length {len}")]
    OutOfBounds { start: usize, end: usize, len: usize },
    #[error("attempt to use a released resource")]
    Released,
    #[error("expected {expected}, got {actual}")]
    WrongKind {
        expected: &'static str,
        actual: &'static str,
    },
}

/// Slot index plus the generation of the resource that occupied the slot
/// when the handle was issued. A slot reused after a release carries a new
/// generation, so stale handles resolve to [`ResourceError::Released`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle {
    index: u32,
    generation: u32,
}

impl Handle {
    const MAX_GENERATION: u32 = 0x7FFF_FFFF;

    pub fn index(self) -> u32 {
        self.index
    }

    pub fn generation(self) -> u32 {
        self.generation
    }

    /// Packed form handed to guests. Always fits a non-negative `i64`.
    pub fn to_raw(self) -> u64 {
        (u64::from(self.generation) << 32) | u64::from(self.index)
    }

    pub fn from_raw(raw: u64) -> Option<Self> {
        let generation = u32::try_from(raw >> 32).ok()?;
        if generation == 0 || generation > Self::MAX_GENERATION {
            return None;
        }
        Some(Handle {
            index: raw as u32,
            generation,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Buffer,
    Image { width: usize, height: usize },
    Palette { colors: usize },
}

impl ResourceKind {
    pub fn name(&self) -> &'static str {
        match self {
            ResourceKind::Buffer => "buffer",
            ResourceKind::Image { .. } => "image",
            ResourceKind::Palette { .. } => "palette",
        }
    }
}

enum Storage {
    Owned(Vec<u8>),
    View {
        owner: Handle,
        offset: usize,
        len: usize,
    },
}

struct Entry {
    generation: u32,
    kind: ResourceKind,
    storage: Storage,
    /// References held through this entry's own handle.
    refs: usize,
    /// Live views borrowing this entry's bytes.
    views: usize,
}

impl Entry {
    fn len(&self) -> usize {
        match &self.storage {
            Storage::Owned(bytes) => bytes.len(),
            Storage::View { len, .. } => *len,
        }
    }
}

pub struct ResourceArena {
    memory: Rc<MemoryTracker>,
    slots: Vec<Option<Entry>>,
    free: Vec<u32>,
    next_generation: u32,
}

impl ResourceArena {
    pub fn new(memory: Rc<MemoryTracker>) -> Self {
        Self {
            memory,
            slots: Vec::new(),
            free: Vec::new(),
            next_generation: 0,
        }
    }

    pub fn memory(&self) -> &Rc<MemoryTracker> {
        &self.memory
    }

    /// Number of live handles, views included.
    pub fn live(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    fn insert(&mut self, mut entry: Entry) -> Handle {
        self.next_generation = match self.next_generation {
            Handle::MAX_GENERATION => 1,
            n => n + 1,
        };
        let generation = self.next_generation;
        entry.generation = generation;
        let index = match self.free.pop() {
            Some(index) => {
                self.slots[index as usize] = Some(entry);
                index
            }
            None => {
                self.slots.push(Some(entry));
                (self.slots.len() - 1) as u32
            }
        };
        Handle { index, generation }
    }

    /// Entry behind a guest-held handle.
    fn entry(&self, handle: Handle) -> Result<&Entry, ResourceError> {
        self.raw_entry(handle)
            .filter(|e| e.refs > 0)
            .ok_or(ResourceError::Released)
    }

    fn entry_mut(&mut self, handle: Handle) -> Result<&mut Entry, ResourceError> {
        self.raw_entry_mut(handle)
            .filter(|e| e.refs > 0)
            .ok_or(ResourceError::Released)
    }

    /// Entry that may only be alive because views still borrow it.
    fn raw_entry(&self, handle: Handle) -> Option<&Entry> {
        self.slots
            .get(handle.index as usize)
            .and_then(Option::as_ref)
            .filter(|e| e.generation == handle.generation)
    }

    fn raw_entry_mut(&mut self, handle: Handle) -> Option<&mut Entry> {
        self.slots
            .get_mut(handle.index as usize)
            .and_then(Option::as_mut)
            .filter(|e| e.generation == handle.generation)
    }

    fn create(&mut self, kind: ResourceKind, size: usize) -> Result<Handle, ResourceError> {
        if !self.memory.alloc(size) {
            debug!("[RES] {} of {} bytes refused", kind.name(), size);
            return Err(ResourceError::OutOfMemory);
        }
        let handle = self.insert(Entry {
            generation: 0,
            kind,
            storage: Storage::Owned(vec![0; size]),
            refs: 1,
            views: 0,
        });
        trace!("[RES] new {} {:?} ({} bytes)", kind.name(), handle, size);
        Ok(handle)
    }

    pub fn create_buffer(&mut self, len: usize) -> Result<Handle, ResourceError> {
        self.create(ResourceKind::Buffer, len)
    }

    pub fn create_image(&mut self, width: usize, height: usize) -> Result<Handle, ResourceError> {
        let size = width
            .checked_mul(height)
            .ok_or(ResourceError::OutOfMemory)?;
        self.create(ResourceKind::Image { width, height }, size)
    }

    pub fn create_palette(&mut self, colors: usize) -> Result<Handle, ResourceError> {
        let size = colors
            .checked_mul(PALETTE_ENTRY_SIZE)
            .ok_or(ResourceError::OutOfMemory)?;
        self.create(ResourceKind::Palette { colors }, size)
    }

    pub fn kind(&self, handle: Handle) -> Result<ResourceKind, ResourceError> {
        Ok(self.entry(handle)?.kind)
    }

    pub fn len(&self, handle: Handle) -> Result<usize, ResourceError> {
        Ok(self.entry(handle)?.len())
    }

    pub fn is_view(&self, handle: Handle) -> Result<bool, ResourceError> {
        Ok(matches!(self.entry(handle)?.storage, Storage::View { .. }))
    }

    fn check_range(len: usize, start: usize, count: usize) -> Result<(), ResourceError> {
        match start.checked_add(count) {
            Some(end) if end <= len => Ok(()),
            _ => Err(ResourceError::OutOfBounds {
                start,
                end: start.saturating_add(count),
                len,
            }),
        }
    }

    /// Maps a handle to its root owner and the absolute window it covers.
    fn locate(&self, handle: Handle) -> Result<(Handle, usize, usize), ResourceError> {
        let entry = self.entry(handle)?;
        match entry.storage {
            Storage::Owned(ref bytes) => Ok((handle, 0, bytes.len())),
            Storage::View { owner, offset, len } => Ok((owner, offset, len)),
        }
    }

    fn owned_bytes(&self, owner: Handle) -> Result<&[u8], ResourceError> {
        match self.raw_entry(owner).map(|e| &e.storage) {
            Some(Storage::Owned(bytes)) => Ok(bytes),
            _ => Err(ResourceError::Released),
        }
    }

    fn owned_bytes_mut(&mut self, owner: Handle) -> Result<&mut [u8], ResourceError> {
        match self.raw_entry_mut(owner).map(|e| &mut e.storage) {
            Some(Storage::Owned(bytes)) => Ok(bytes),
            _ => Err(ResourceError::Released),
        }
    }

    /// Creates a view of `len` bytes starting at `start`. The view shares the
    /// root owner's allocation; no memory is charged.
    pub fn sub(
        &mut self,
        handle: Handle,
        start: usize,
        len: usize,
    ) -> Result<Handle, ResourceError> {
        let kind = self.entry(handle)?.kind;
        if kind != ResourceKind::Buffer {
            return Err(ResourceError::WrongKind {
                expected: "buffer",
                actual: kind.name(),
            });
        }
        let (owner, offset, window) = self.locate(handle)?;
        Self::check_range(window, start, len)?;

        if let Some(entry) = self.raw_entry_mut(owner) {
            entry.views += 1;
        }
        let view = self.insert(Entry {
            generation: 0,
            kind: ResourceKind::Buffer,
            storage: Storage::View {
                owner,
                offset: offset + start,
                len,
            },
            refs: 1,
            views: 0,
        });
        trace!("[RES] view {:?} of {:?} [{}..{}]", view, owner, start, start + len);
        Ok(view)
    }

    pub fn read(&self, handle: Handle, start: usize, len: usize) -> Result<Vec<u8>, ResourceError> {
        let (owner, offset, window) = self.locate(handle)?;
        Self::check_range(window, start, len)?;
        let bytes = self.owned_bytes(owner)?;
        Ok(bytes[offset + start..offset + start + len].to_vec())
    }

    pub fn write(
        &mut self,
        handle: Handle,
        start: usize,
        data: &[u8],
    ) -> Result<(), ResourceError> {
        let (owner, offset, window) = self.locate(handle)?;
        Self::check_range(window, start, data.len())?;
        let bytes = self.owned_bytes_mut(owner)?;
        bytes[offset + start..offset + start + data.len()].copy_from_slice(data);
        Ok(())
    }

    pub fn fill(
        &mut self,
        handle: Handle,
        start: usize,
        len: usize,
        value: u8,
    ) -> Result<(), ResourceError> {
        let (owner, offset, window) = self.locate(handle)?;
        Self::check_range(window, start, len)?;
        let bytes = self.owned_bytes_mut(owner)?;
        bytes[offset + start..offset + start + len].fill(value);
        Ok(())
    }

    /// Copies the resource's visible bytes into a freshly tracked owner.
    pub fn copy(&mut self, handle: Handle) -> Result<Handle, ResourceError> {
        let kind = self.entry(handle)?.kind;
        let len = self.len(handle)?;
        let data = self.read(handle, 0, len)?;
        let copy = self.create(kind, len)?;
        self.write(copy, 0, &data)?;
        Ok(copy)
    }

    pub fn retain(&mut self, handle: Handle) -> Result<(), ResourceError> {
        self.entry_mut(handle)?.refs += 1;
        Ok(())
    }

    /// Drops one reference held through `handle`. The handle is unusable once
    /// its count reaches zero; the entry itself dies when no views remain.
    pub fn release(&mut self, handle: Handle) -> Result<(), ResourceError> {
        let entry = self.entry_mut(handle)?;
        entry.refs -= 1;
        if entry.refs == 0 && entry.views == 0 {
            self.destroy(handle);
        }
        Ok(())
    }

    fn destroy(&mut self, handle: Handle) {
        if self.raw_entry(handle).is_none() {
            return;
        }
        let Some(dead) = self.slots[handle.index as usize].take() else {
            return;
        };
        self.free.push(handle.index);
        match dead.storage {
            Storage::Owned(bytes) => {
                trace!("[RES] free {:?} ({} bytes)", handle, bytes.len());
                self.memory.free(bytes.len());
            }
            Storage::View { owner, .. } => {
                let orphaned = match self.raw_entry_mut(owner) {
                    Some(entry) => {
                        entry.views -= 1;
                        entry.refs == 0 && entry.views == 0
                    }
                    None => false,
                };
                if orphaned {
                    self.destroy(owner);
                }
            }
        }
    }

    pub fn get_pixel(&self, image: Handle, x: usize, y: usize) -> Result<u8, ResourceError> {
        let offset = self.pixel_offset(image, x, y)?;
        Ok(self.read(image, offset, 1)?[0])
    }

    pub fn set_pixel(
        &mut self,
        image: Handle,
        x: usize,
        y: usize,
        value: u8,
    ) -> Result<(), ResourceError> {
        let offset = self.pixel_offset(image, x, y)?;
        self.write(image, offset, &[value])
    }

    fn pixel_offset(&self, image: Handle, x: usize, y: usize) -> Result<usize, ResourceError> {
        match self.entry(image)?.kind {
            ResourceKind::Image { width, height } => {
                let len = width.saturating_mul(height);
                if x >= width || y >= height {
                    let start = y.saturating_mul(width).saturating_add(x);
                    return Err(ResourceError::OutOfBounds {
                        start,
                        end: start.saturating_add(1),
                        len,
                    });
                }
                // In range, so the offset is below `len`.
                Ok(y * width + x)
            }
            other => Err(ResourceError::WrongKind {
                expected: "image",
                actual: other.name(),
            }),
        }
    }

    pub fn get_color(&self, palette: Handle, index: usize) -> Result<[u8; 3], ResourceError> {
        let start = self.color_offset(palette, index)?;
        let bytes = self.read(palette, start, PALETTE_ENTRY_SIZE)?;
        Ok([bytes[0], bytes[1], bytes[2]])
    }

    pub fn set_color(
        &mut self,
        palette: Handle,
        index: usize,
        rgb: [u8; 3],
    ) -> Result<(), ResourceError> {
        let start = self.color_offset(palette, index)?;
        self.write(palette, start, &rgb)
    }

    fn color_offset(&self, palette: Handle, index: usize) -> Result<usize, ResourceError> {
        let entry = self.entry(palette)?;
        match entry.kind {
            ResourceKind::Palette { .. } => index.checked_mul(PALETTE_ENTRY_SIZE).ok_or(
                ResourceError::OutOfBounds {
                    start: usize::MAX,
                    end: usize::MAX,
                    len: entry.len(),
                },
            ),
            other => Err(ResourceError::WrongKind {
                expected: "palette",
                actual: other.name(),
            }),
        }
    }

    pub fn dump(&self, handle: Handle) -> Result<String, ResourceError> {
        let len = self.len(handle)?;
        Ok(hexdump(&self.read(handle, 0, len)?, 0))
    }

    /// Trims trailing empty slots left behind by released handles.
    pub fn compact(&mut self) {
        while matches!(self.slots.last(), Some(None)) {
            self.slots.pop();
        }
        let len = self.slots.len() as u32;
        self.free.retain(|&i| i < len);
        self.slots.shrink_to_fit();
    }

    /// Releases everything, returning all owned bytes to the tracker.
    pub fn clear(&mut self) {
        let mut freed = 0;
        for entry in self.slots.drain(..).flatten() {
            if let Storage::Owned(bytes) = entry.storage {
                freed += bytes.len();
            }
        }
        self.free.clear();
        if freed > 0 {
            debug!("[RES] cleared arena, {} bytes returned", freed);
            self.memory.free(freed);
        }
    }
}

impl Drop for ResourceArena {
    fn drop(&mut self) {
        self.clear();
    }
}

impl fmt::Debug for ResourceArena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceArena")
            .field("live", &self.live())
            .field("memory_used", &self.memory.used())
            .finish()
    }
}
