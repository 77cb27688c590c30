//! Thread-default heap handle.
//!
//! The collector scans the stack of the thread that allocates, so the
//! default handle is thread local: every thread (and every test) gets an
//! independent instance. [`init`] must run in a frame that outlives all
//! later calls to [`alloc`], or the scan misses roots.

use std::cell::RefCell;

use crate::{CollectOptions, Heap, HeapError, HeapSettings, stack_anchor};

thread_local! {
    static HEAP: RefCell<Option<Heap>> = const { RefCell::new(None) };
}

/// Installs the default heap, capturing the caller's frame as the high end
/// of the scanned stack range.
///
/// Kept `#[inline(always)]` so the captured anchor lands in the caller's
/// frame. Panics when a default heap is already installed.
#[inline(always)]
pub fn init() {
    init_with(HeapSettings::default());
}

/// [`init`] with explicit settings.
#[inline(always)]
pub fn init_with(settings: HeapSettings) {
    let stack_top = stack_anchor();
    HEAP.with(|slot| {
        let mut slot = slot.borrow_mut();
        assert!(slot.is_none(), "{}", HeapError::AlreadyInitialized);
        *slot = Some(Heap::new(settings, stack_top));
    });
}

#[must_use]
pub fn is_initialized() -> bool {
    HEAP.with(|slot| slot.borrow().is_some())
}

/// Allocates from the default heap. See [`Heap::alloc`].
pub fn alloc(size: usize) -> *mut u8 {
    with_heap(|heap| heap.alloc(size))
}

/// Runs the selected collection phases on the default heap.
pub fn collect_with(options: CollectOptions) {
    with_heap(|heap| heap.collect_with(options));
}

/// Toggles profiler event recording on the default heap.
pub fn set_profiler(enabled: bool) {
    with_heap(|heap| heap.set_profiler(enabled));
}

/// Drops the default heap, writing the profiler trace if enabled.
/// A no-op when no heap is installed.
pub fn dispose() {
    HEAP.with(|slot| {
        if let Some(heap) = slot.borrow_mut().take() {
            heap.dispose();
        }
    });
}

fn with_heap<R>(f: impl FnOnce(&mut Heap) -> R) -> R {
    HEAP.with(|slot| {
        let mut slot = slot.borrow_mut();
        let Some(heap) = slot.as_mut() else {
            panic!("{}", HeapError::NotInitialized);
        };
        f(heap)
    })
}

// ── Tests ─────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_alloc_dispose_roundtrip() {
        dispose();

        init();
        assert!(is_initialized());

        let ptr = alloc(32);
        assert!(!ptr.is_null());

        collect_with(CollectOptions::SWEEP | CollectOptions::FREE);
        set_profiler(false);

        dispose();
        assert!(!is_initialized());

        // A fresh install is allowed after dispose.
        init();
        dispose();
    }

    #[test]
    #[should_panic(expected = "already initialized")]
    fn repeated_init_panics() {
        dispose();
        init();
        init();
    }

    #[test]
    #[should_panic(expected = "not initialized")]
    fn alloc_without_init_panics() {
        dispose();
        alloc(8);
    }
}
