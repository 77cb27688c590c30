//! Conservative stop-the-world mark-and-sweep collector.
//!
//! A fixed-capacity mapped region is bump-allocated into chunks. When the
//! region runs out, collection walks the native stack between two captured
//! addresses and treats every word whose value lands inside a live chunk as
//! a pointer to it; reachable chunks are traced transitively through their
//! own bytes. Mark is followed by sweep (retire unmarked chunks onto the
//! freed list) and free (drain or compact the freed list), after which
//! allocation resumes by recycling freed chunks or advancing the high-water
//! mark.
//!
//! The collector is type-oblivious and single-threaded. Consumers either
//! construct a [`Heap`] directly or go through the thread-default handle in
//! [`crate::global`].

use std::{mem, path::PathBuf, ptr::NonNull};

use bitflags::bitflags;
use thiserror::Error;

use crate::{
    profiler::{ChunkSnapshot, GcEvent, Profiler},
    system,
};

/// Scan granularity: one machine word.
pub const WORD_SIZE: usize = mem::size_of::<usize>();

#[inline]
fn align_up(addr: usize) -> usize {
    (addr + (WORD_SIZE - 1)) & !(WORD_SIZE - 1)
}

// ── Settings ──────────────────────────────────────────────────────────

/// Configuration for one heap instance.
#[derive(Debug, Clone)]
pub struct HeapSettings {
    /// Region capacity in bytes. Must be a word multiple.
    pub heap_size: usize,
    /// Freed-list length strictly above which the free phase drains the
    /// whole list instead of compacting it.
    pub free_threshold: usize,
    /// Largest honourable single request. At most `heap_size`.
    pub max_alloc: usize,
    /// Record profiler events from construction on.
    pub profiler: bool,
    /// Folder the profiler trace is written into on dispose.
    pub log_dir: PathBuf,
}

impl Default for HeapSettings {
    fn default() -> Self {
        Self {
            heap_size: 65536, // 64 KiB
            free_threshold: 8,
            max_alloc: 65536,
            profiler: false,
            log_dir: PathBuf::from("logs"),
        }
    }
}

impl HeapSettings {
    #[inline]
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.heap_size == 0 {
            return Err("heap_size must be > 0");
        }
        if !self.heap_size.is_multiple_of(WORD_SIZE) {
            return Err("heap_size must be a multiple of the word size");
        }
        if self.max_alloc == 0 || self.max_alloc > self.heap_size {
            return Err("max_alloc must be within (0, heap_size]");
        }
        Ok(())
    }
}

// ── Errors ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum HeapError {
    #[error("cannot allocate zero bytes")]
    ZeroSize,
    #[error("allocation of {requested} bytes exceeds the {max} byte limit")]
    TooLarge { requested: usize, max: usize },
    #[error("out of memory: {requested} bytes requested, {used} of {capacity} in use")]
    OutOfMemory {
        requested: usize,
        used: usize,
        capacity: usize,
    },
    #[error("heap is not initialized")]
    NotInitialized,
    #[error("heap is already initialized")]
    AlreadyInitialized,
}

// ── Chunk metadata ────────────────────────────────────────────────────

/// Metadata for one contiguous sub-region of the heap's backing bytes.
///
/// Chunks are cheap records owned by the heap's two lists; identity is the
/// record, not the address range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    /// Address within the region where the sub-region begins.
    pub start: usize,
    /// Byte length.
    pub size: usize,
    /// Transient bit, set during mark, cleared by sweep.
    pub marked: bool,
}

impl Chunk {
    #[inline]
    #[must_use]
    pub fn end(&self) -> usize {
        self.start + self.size
    }

    /// Conservative membership: any address in `[start, end)` counts.
    #[inline]
    #[must_use]
    pub fn contains(&self, addr: usize) -> bool {
        self.start <= addr && addr < self.end()
    }

    #[must_use]
    pub fn snapshot(&self) -> ChunkSnapshot {
        ChunkSnapshot {
            start: self.start,
            size: self.size,
            marked: self.marked,
        }
    }
}

// ── Stack capture ─────────────────────────────────────────────────────

/// Captures a word-aligned address inside the caller's stack frame.
///
/// Stand-in for a frame-address intrinsic: the function must stay
/// `#[inline(always)]` so the anchor local is materialized in the caller's
/// frame rather than in a callee frame below it. Assumes a downward-growing
/// stack; an address captured in an outer frame bounds the high end of the
/// range a later collection scans, and every root must live below it.
#[inline(always)]
#[must_use]
pub fn stack_anchor() -> usize {
    let anchor: usize = 0;
    core::hint::black_box(&anchor) as *const usize as usize
}

// ── Collection options ────────────────────────────────────────────────

bitflags! {
    /// Phase selection for [`Heap::collect_with`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CollectOptions: u8 {
        const MARK = 1 << 0;
        const SWEEP = 1 << 1;
        const FREE = 1 << 2;
    }
}

// ── Heap ──────────────────────────────────────────────────────────────

/// Owner of the backing region and both chunk lists.
///
/// All chunk metadata and the region itself are exclusively owned here;
/// addresses handed out by [`Heap::alloc`] are borrows into the region and
/// must not be freed through any other path.
#[derive(Debug)]
pub struct Heap {
    settings: HeapSettings,
    region: NonNull<u8>,
    /// Bytes consumed by bump allocation from the low end of the region.
    used: usize,
    /// Live chunks handed to the mutator and not yet swept.
    allocated: Vec<Chunk>,
    /// Chunks retired by sweep whose backing bytes remain reusable.
    freed: Vec<Chunk>,
    /// High end of the stack range to scan, captured at initialization.
    stack_top: usize,
    profiler: Profiler,
    profiler_enabled: bool,
}

impl Heap {
    /// Maps the backing region and installs `stack_top` as the high end of
    /// the scanned stack range. Capture the anchor with [`stack_anchor`]
    /// from a frame that outlives every later allocation.
    #[must_use]
    pub fn new(settings: HeapSettings, stack_top: usize) -> Self {
        settings.validate().expect("invalid heap settings");

        let region =
            system::map_region(settings.heap_size).expect("map heap region");

        let mut heap = Self {
            region,
            used: 0,
            allocated: Vec::new(),
            freed: Vec::new(),
            stack_top,
            profiler: Profiler::new(),
            profiler_enabled: settings.profiler,
            settings,
        };
        heap.record(GcEvent::HeapInit);
        heap
    }

    #[inline]
    #[must_use]
    pub fn base(&self) -> *mut u8 {
        self.region.as_ptr()
    }

    #[inline]
    #[must_use]
    pub fn used(&self) -> usize {
        self.used
    }

    #[must_use]
    pub fn allocated(&self) -> &[Chunk] {
        &self.allocated
    }

    #[must_use]
    pub fn freed(&self) -> &[Chunk] {
        &self.freed
    }

    #[must_use]
    pub fn settings(&self) -> &HeapSettings {
        &self.settings
    }

    pub fn set_profiler(&mut self, enabled: bool) {
        self.profiler_enabled = enabled;
    }

    #[inline]
    fn record(&mut self, event: GcEvent) {
        if self.profiler_enabled {
            self.profiler.record(event);
        }
    }

    // ── Allocation ────────────────────────────────────────────────────

    /// Allocates `size` bytes and returns an address inside the region.
    ///
    /// The returned memory is not re-initialized; recycled chunks still
    /// hold whatever the previous owner wrote. A zero-byte request returns
    /// a null pointer with a diagnostic; an unsatisfiable request panics.
    pub fn alloc(&mut self, size: usize) -> *mut u8 {
        match self.try_alloc(size) {
            Ok(ptr) => ptr.as_ptr(),
            Err(HeapError::ZeroSize) => {
                tracing::warn!("cannot allocate zero bytes, no bytes allocated");
                std::ptr::null_mut()
            }
            Err(err) => panic!("{err}"),
        }
    }

    /// Recoverable allocation channel; same policy as [`Heap::alloc`] but
    /// every failure comes back as an error instead of a null pointer or a
    /// panic.
    pub fn try_alloc(&mut self, size: usize) -> Result<NonNull<u8>, HeapError> {
        self.record(GcEvent::AllocStart { size });

        if size == 0 {
            return Err(HeapError::ZeroSize);
        }
        if size > self.settings.max_alloc {
            return Err(HeapError::TooLarge {
                requested: size,
                max: self.settings.max_alloc,
            });
        }

        if self.used + size > self.settings.heap_size {
            self.collect();
        }

        if let Some(chunk) = self.try_recycle_chunks(size) {
            self.record(GcEvent::ReusedChunk(chunk.snapshot()));
            // SAFETY: the chunk starts inside the mapped region, never at null.
            return Ok(unsafe { NonNull::new_unchecked(chunk.start as *mut u8) });
        }

        if self.used + size > self.settings.heap_size {
            return Err(HeapError::OutOfMemory {
                requested: size,
                used: self.used,
                capacity: self.settings.heap_size,
            });
        }

        let chunk = Chunk {
            start: self.base() as usize + self.used,
            size,
            marked: false,
        };
        self.used += size;
        self.allocated.push(chunk);
        self.record(GcEvent::NewChunk(chunk.snapshot()));

        // SAFETY: the chunk starts inside the mapped region, never at null.
        Ok(unsafe { NonNull::new_unchecked(chunk.start as *mut u8) })
    }

    /// First-fit walk of the freed list. An exact-size chunk moves back to
    /// the allocated list whole; a strictly larger chunk is split, the
    /// requested prefix handed out and the remainder kept reusable.
    fn try_recycle_chunks(&mut self, size: usize) -> Option<Chunk> {
        for i in 0..self.freed.len() {
            let chunk = self.freed[i];
            if chunk.size > size {
                let complement = Chunk {
                    start: chunk.start + size,
                    size: chunk.size - size,
                    marked: false,
                };
                let recycled = Chunk {
                    start: chunk.start,
                    size,
                    marked: false,
                };
                self.freed.remove(i);
                self.freed.push(complement);
                self.allocated.push(recycled);
                return Some(recycled);
            } else if chunk.size == size {
                let recycled = self.freed.remove(i);
                self.allocated.push(recycled);
                return Some(recycled);
            }
        }
        None
    }

    // ── Collection ────────────────────────────────────────────────────

    fn collect(&mut self) {
        self.collect_with(CollectOptions::all());
    }

    /// Runs the selected collection phases in mark → sweep → free order.
    ///
    /// Phase selection exists for debugging; a real collection always runs
    /// all three. The scan covers the stack from the current frame up to
    /// and including the word at `stack_top`.
    pub fn collect_with(&mut self, options: CollectOptions) {
        self.record(GcEvent::CollectStart);

        assert!(self.stack_top != 0, "{}", HeapError::NotInitialized);

        let stack_bottom = stack_anchor();
        tracing::debug!(
            stack_bottom = %format_args!("{stack_bottom:#x}"),
            stack_top = %format_args!("{:#x}", self.stack_top),
            allocated = self.allocated.len(),
            freed = self.freed.len(),
            "collect"
        );

        if options.contains(CollectOptions::MARK) {
            self.mark(stack_bottom, self.stack_top);
        }
        if options.contains(CollectOptions::SWEEP) {
            self.sweep();
        }
        if options.contains(CollectOptions::FREE) {
            self.free();
        }
    }

    /// Conservative scan: walks one word at a time from `stack_bottom` up
    /// to and including `stack_top`; any word whose value lies inside an
    /// unmarked allocated chunk marks that chunk and queues its interior
    /// for the same scan. Each chunk is visited at most once per
    /// collection.
    ///
    /// The stack window is aligned up front. Chunk interiors step from the
    /// chunk's own start, which need not sit on the word grid: request
    /// sizes are never padded, and rounding an interior cursor up to an
    /// absolute word boundary would skip the chunk's first bytes — where a
    /// reference conventionally lives.
    fn mark(&mut self, stack_bottom: usize, stack_top: usize) {
        self.record(GcEvent::MarkStart);

        // Chunks not yet reached this cycle.
        let mut worklist: Vec<usize> = (0..self.allocated.len()).collect();
        // Pending inclusive ranges of (first word address, last word
        // address): the stack window, then the interiors of chunks as
        // they are reached.
        let mut pending: Vec<(usize, usize)> =
            vec![(align_up(stack_bottom), stack_top)];
        let mut marked = 0usize;

        while let Some((lo, hi)) = pending.pop() {
            if worklist.is_empty() {
                break;
            }
            let mut cursor = lo;
            while cursor <= hi {
                // SAFETY: cursor lies within the scanned stack window or a
                // mapped chunk interior; both stay readable for the scan.
                // Interior cursors can sit off the word grid, so the read
                // must not assume alignment.
                let word = unsafe { (cursor as *const usize).read_unaligned() };

                let mut i = 0;
                while i < worklist.len() {
                    let idx = worklist[i];
                    let chunk = self.allocated[idx];
                    if chunk.contains(word) {
                        self.allocated[idx].marked = true;
                        marked += 1;
                        let snapshot = self.allocated[idx].snapshot();
                        self.record(GcEvent::ChunkMarked(snapshot));
                        worklist.swap_remove(i);
                        if chunk.size >= WORD_SIZE {
                            pending.push((
                                chunk.start,
                                chunk.start + chunk.size - WORD_SIZE,
                            ));
                        }
                    } else {
                        i += 1;
                    }
                }
                cursor += WORD_SIZE;
            }
        }

        tracing::trace!(marked, unreached = worklist.len(), "mark done");
    }

    /// Retains marked chunks (clearing the bit for the next cycle) and
    /// retires the rest onto the freed list.
    fn sweep(&mut self) {
        let chunks = mem::take(&mut self.allocated);
        let mut retired = 0usize;
        for mut chunk in chunks {
            if chunk.marked {
                chunk.marked = false;
                self.allocated.push(chunk);
            } else {
                retired += 1;
                self.record(GcEvent::ChunkSwept(chunk.snapshot()));
                self.freed.push(chunk);
            }
        }
        tracing::trace!(retained = self.allocated.len(), retired, "sweep done");
    }

    /// Reclaims the freed list: past the threshold the whole list is
    /// discarded, otherwise overlapping entries are compacted away. Either
    /// way the high-water mark is recomputed from the surviving chunks.
    fn free(&mut self) {
        if self.freed.len() > self.settings.free_threshold {
            let drained = self.freed.len();
            while let Some(chunk) = self.freed.pop() {
                self.record(GcEvent::ChunkFreed(chunk.snapshot()));
            }
            tracing::trace!(drained, "freed list drained");
        } else if !self.freed.is_empty() {
            let before = self.freed.len();
            self.freed.sort_unstable_by_key(|chunk| chunk.start);
            self.free_overlap();
            tracing::trace!(
                dropped = before - self.freed.len(),
                surviving = self.freed.len(),
                "freed list compacted"
            );
        }
        self.used = self.high_water();
    }

    /// Drops freed chunks that overlap an earlier chunk, preferring lower
    /// addresses. Expects the freed list sorted by start address.
    fn free_overlap(&mut self) {
        let chunks = mem::take(&mut self.freed);
        let mut iter = chunks.into_iter();
        let Some(first) = iter.next() else {
            return;
        };

        let mut prev_end = first.end();
        let mut filtered = vec![first];
        for next in iter {
            if next.start >= prev_end {
                prev_end = next.end();
                filtered.push(next);
            } else {
                self.record(GcEvent::ChunkFreed(next.snapshot()));
            }
        }
        self.freed = filtered;
    }

    /// Highest end offset over both chunk lists. Freed chunks count: their
    /// backing bytes stay reusable inside the committed prefix.
    fn high_water(&self) -> usize {
        let base = self.base() as usize;
        self.allocated
            .iter()
            .chain(self.freed.iter())
            .map(|chunk| chunk.end() - base)
            .max()
            .unwrap_or(0)
    }

    // ── Teardown / debugging ──────────────────────────────────────────

    /// Writes the profiler trace (when enabled), then releases all chunk
    /// metadata and the backing region.
    pub fn dispose(mut self) {
        if self.profiler_enabled {
            match self.profiler.dump(&self.settings.log_dir) {
                Ok(path) => {
                    tracing::debug!(path = %path.display(), "heap trace written");
                }
                Err(err) => {
                    tracing::error!(%err, "failed to write heap trace");
                }
            }
        }
    }

    /// Renders both chunk lists through the tracing subscriber.
    pub fn dump_contents(&self) {
        tracing::debug!(
            used = self.used,
            allocated = self.allocated.len(),
            freed = self.freed.len(),
            "heap contents"
        );
        for chunk in &self.allocated {
            tracing::debug!(
                start = %format_args!("{:#x}", chunk.start),
                size = chunk.size,
                marked = chunk.marked,
                "allocated chunk"
            );
        }
        for chunk in &self.freed {
            tracing::debug!(
                start = %format_args!("{:#x}", chunk.start),
                size = chunk.size,
                "freed chunk"
            );
        }
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        system::unmap_region(self.region, self.settings.heap_size);
    }
}

// ── Tests ─────────────────────────────────────────────────────────────
