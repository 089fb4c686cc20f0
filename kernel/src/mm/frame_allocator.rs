//! Physical frame allocator: the external collaborator the address-space
//! model treats as a black box behind `alloc_frame`/`free_frame` (§4.2).
//!
//! A flat bitmap over a fixed, statically-sized frame range. Production
//! sizing and NUMA placement are a capacity-planning concern outside this
//! component's scope; what matters here is the allocate/free contract the
//! rest of the memory subsystem is written against.

#![allow(dead_code)]

use spin::Mutex;

use crate::error::{KernelError, KernelResult};

pub const FRAME_SIZE: usize = 4096;

/// Number of frames tracked by the bitmap (256 MiB at 4 KiB frames).
const MAX_TRACKED_FRAMES: usize = 65536;
const WORDS: usize = MAX_TRACKED_FRAMES / 64;

/// Physical frame number (a physical address divided by `FRAME_SIZE`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct FrameNumber(u64);

impl FrameNumber {
    pub const fn new(n: u64) -> Self {
        Self(n)
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

struct BitmapAllocator {
    bits: [u64; WORDS],
    base: FrameNumber,
    free: usize,
}

impl BitmapAllocator {
    const fn new() -> Self {
        Self {
            bits: [0; WORDS],
            base: FrameNumber::new(0),
            free: 0,
        }
    }

    /// Make `frame_count` frames starting at `base` available. Frames
    /// beyond `MAX_TRACKED_FRAMES` are permanently marked unavailable.
    fn init(&mut self, base: FrameNumber, frame_count: usize) {
        self.base = base;
        let tracked = frame_count.min(MAX_TRACKED_FRAMES);
        self.free = tracked;
        for i in tracked..MAX_TRACKED_FRAMES {
            self.bits[i / 64] |= 1 << (i % 64);
        }
    }

    fn alloc(&mut self) -> KernelResult<FrameNumber> {
        for (word_idx, word) in self.bits.iter_mut().enumerate() {
            if *word != u64::MAX {
                let bit = (!*word).trailing_zeros() as usize;
                *word |= 1 << bit;
                self.free -= 1;
                return Ok(FrameNumber::new(
                    self.base.as_u64() + (word_idx * 64 + bit) as u64,
                ));
            }
        }
        Err(KernelError::ResourceExhausted {
            resource: "physical frame",
        })
    }

    fn free(&mut self, frame: FrameNumber) {
        let idx = (frame.as_u64() - self.base.as_u64()) as usize;
        debug_assert!(idx < MAX_TRACKED_FRAMES, "freed frame outside tracked range");
        self.bits[idx / 64] &= !(1 << (idx % 64));
        self.free += 1;
    }
}

static ALLOCATOR: Mutex<BitmapAllocator> = Mutex::new(BitmapAllocator::new());

/// Make `frame_count` frames starting at `base` available for allocation.
/// Called once during boot, after the bootloader's memory map has been
/// parsed.
pub fn init(base: FrameNumber, frame_count: usize) {
    ALLOCATOR.lock().init(base, frame_count);
}

pub fn alloc_frame() -> KernelResult<FrameNumber> {
    ALLOCATOR.lock().alloc()
}

pub fn free_frame(frame: FrameNumber) {
    ALLOCATOR.lock().free(frame);
}

pub fn free_frame_count() -> usize {
    ALLOCATOR.lock().free
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_free_roundtrip() {
        let mut a = BitmapAllocator::new();
        a.init(FrameNumber::new(0x1000), 4);
        let f = a.alloc().unwrap();
        assert_eq!(f, FrameNumber::new(0x1000));
        assert_eq!(a.free, 3);
        a.free(f);
        assert_eq!(a.free, 4);
    }

    #[test]
    fn exhaustion_returns_error() {
        let mut a = BitmapAllocator::new();
        a.init(FrameNumber::new(0), 2);
        a.alloc().unwrap();
        a.alloc().unwrap();
        assert!(a.alloc().is_err());
    }
}
