use std::mem;

use anyhow::Context;
use bytemuck::Pod;
use tracing::trace;

// === Config === //

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ScratchConfig {
    /// The largest region a single call may request.
    pub max_region_bytes: u32,
}

impl Default for ScratchConfig {
    fn default() -> Self {
        Self {
            max_region_bytes: 16 * 1024 * 1024,
        }
    }
}

// === Arena === //

/// A handle to one call's scratch region. Zero is never a valid handle.
#[derive(Debug, Copy, Clone, Hash, Eq, PartialEq)]
pub struct RegionHandle(u32);

impl RegionHandle {
    pub fn raw(self) -> u32 {
        self.0
    }

    fn index(self) -> anyhow::Result<usize> {
        self.0
            .checked_sub(1)
            .context("zero is never a valid handle into the arena")
            .map(|v| v as usize)
    }
}

#[derive(Debug)]
struct Region {
    // `u64` words keep every region 8-byte aligned.
    words: Vec<u64>,
    len: u32,
}

/// Storage for the scratch regions used while marshaling calls.
#[derive(Debug, Default)]
pub struct ScratchArena {
    config: ScratchConfig,
    slots: Vec<Option<Region>>,
    free: Vec<u32>,
    allocations: u64,
    releases: u64,
}

impl ScratchArena {
    pub fn new(config: ScratchConfig) -> Self {
        Self {
            config,
            ..Default::default()
        }
    }

    pub fn config(&self) -> &ScratchConfig {
        &self.config
    }

    /// Allocates a zeroed region of `size` bytes.
    pub fn alloc(&mut self, size: u32) -> anyhow::Result<RegionHandle> {
        if size > self.config.max_region_bytes {
            anyhow::bail!(
                "a region of {size} bytes exceeds the {} byte scratch limit",
                self.config.max_region_bytes
            );
        }

        let region = Region {
            words: vec![0; (size as usize).div_ceil(mem::size_of::<u64>())],
            len: size,
        };

        let handle = if let Some(handle) = self.free.pop() {
            self.slots[(handle - 1) as usize] = Some(region);
            handle
        } else {
            let handle = self
                .slots
                .len()
                .checked_add(1)
                .and_then(|v| u32::try_from(v).ok())
                .context("too many live scratch regions")?;

            self.slots.push(Some(region));
            handle
        };

        self.allocations += 1;
        trace!(handle, size, "allocated scratch region");

        Ok(RegionHandle(handle))
    }

    pub fn release(&mut self, handle: RegionHandle) -> anyhow::Result<()> {
        self.slots
            .get_mut(handle.index()?)
            .context("handle is past arena length")?
            .take()
            .context("region was already released")?;

        self.free.push(handle.0);
        self.releases += 1;
        trace!(handle = handle.0, "released scratch region");

        Ok(())
    }

    pub fn memory(&mut self, handle: RegionHandle) -> anyhow::Result<CallMemory<'_>> {
        let region = self
            .slots
            .get_mut(handle.index()?)
            .and_then(|v| v.as_mut())
            .context("handle is invalid")?;

        let bytes = bytemuck::cast_slice_mut::<u64, u8>(&mut region.words);

        Ok(CallMemory {
            bytes: &mut bytes[..region.len as usize],
        })
    }

    pub fn allocations(&self) -> u64 {
        self.allocations
    }

    pub fn releases(&self) -> u64 {
        self.releases
    }

    pub fn live_regions(&self) -> usize {
        self.slots.iter().filter(|v| v.is_some()).count()
    }
}

// === CallMemory === //

/// The address at which the first byte of a region is exposed to native code. Everything below
/// it, most importantly address zero, is never mapped.
pub const REGION_BASE: u32 = 16;

/// A native routine's view of its call's scratch region.
#[derive(Debug)]
pub struct CallMemory<'a> {
    bytes: &'a mut [u8],
}

impl<'a> CallMemory<'a> {
    /// Wraps a caller-owned byte buffer, mostly useful to exercise native routines directly.
    pub fn new(bytes: &'a mut [u8]) -> Self {
        Self { bytes }
    }

    pub fn len(&self) -> u32 {
        self.bytes.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub const fn addr_of(offset: u32) -> u32 {
        REGION_BASE + offset
    }

    fn range(&self, addr: u32, size: usize) -> anyhow::Result<std::ops::Range<usize>> {
        let start = addr
            .checked_sub(REGION_BASE)
            .context("address does not point into the scratch region")? as usize;

        let end = start
            .checked_add(size)
            .context("arithmetic overflow during addressing")?;

        if end > self.bytes.len() {
            anyhow::bail!(
                "access of {size} bytes at address {addr} runs past the {} byte region",
                self.bytes.len()
            );
        }

        Ok(start..end)
    }

    pub fn bytes(&self, addr: u32, len: u32) -> anyhow::Result<&[u8]> {
        let range = self.range(addr, len as usize)?;
        Ok(&self.bytes[range])
    }

    pub fn bytes_mut(&mut self, addr: u32, len: u32) -> anyhow::Result<&mut [u8]> {
        let range = self.range(addr, len as usize)?;
        Ok(&mut self.bytes[range])
    }

    pub fn read_slice<T: Pod>(&self, addr: u32, len: u32) -> anyhow::Result<&[T]> {
        let size = mem::size_of::<T>()
            .checked_mul(len as usize)
            .context("arithmetic overflow during addressing")?;

        let range = self.range(addr, size)?;

        bytemuck::try_cast_slice::<u8, T>(&self.bytes[range])
            .ok()
            .context("failed to convert byte view to POD slice")
    }

    pub fn write_slice<T: Pod>(&mut self, addr: u32, len: u32) -> anyhow::Result<&mut [T]> {
        let size = mem::size_of::<T>()
            .checked_mul(len as usize)
            .context("arithmetic overflow during addressing")?;

        let range = self.range(addr, size)?;

        bytemuck::try_cast_slice_mut::<u8, T>(&mut self.bytes[range])
            .ok()
            .context("failed to convert byte view to POD slice")
    }

    pub fn read<T: Pod>(&self, addr: u32) -> anyhow::Result<T> {
        let range = self.range(addr, mem::size_of::<T>())?;
        Ok(bytemuck::pod_read_unaligned(&self.bytes[range]))
    }

    pub fn write<T: Pod>(&mut self, addr: u32, value: T) -> anyhow::Result<()> {
        let range = self.range(addr, mem::size_of::<T>())?;
        self.bytes[range].copy_from_slice(bytemuck::bytes_of(&value));
        Ok(())
    }

    /// Copies `len` bytes from `src` to `dst`. The ranges may overlap.
    pub fn copy_within(&mut self, src: u32, dst: u32, len: u32) -> anyhow::Result<()> {
        let src = self.range(src, len as usize)?;
        let dst = self.range(dst, len as usize)?;
        self.bytes.copy_within(src, dst.start);
        Ok(())
    }
}

// === Tests === //
