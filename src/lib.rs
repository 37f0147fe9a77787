//! Memory-management substrate of the Whisper runtime.
//!
//! The heap is generational and slab based. Each thread owns a hatchery, a
//! nursery and a tenured generation made of card-structured slabs; the
//! [`Runtime`](runtime::Runtime) owns the immortal generation shared by all
//! threads. Objects are bump allocated through an
//! [`AllocationContext`](allocation::AllocationContext), carry a format tag in
//! their header, and expose their references through the [`Trace`](trace::Trace)
//! protocol, which dispatches on that tag.
//!
//! Roots are explicit. Values on the native stack are registered with
//! [`local!`]; traced fields inside heap objects are [`HeapField`]s whose
//! stores run the write barrier hooks.
//!
//! ```ignore
//! let runtime = Arc::new(Runtime::new(Config::default())?);
//! let cx = runtime.register_thread()?;
//! local!(array = &cx, RefArray::create(&cx.in_hatchery(), 4)?);
//! let blob = Blob::create(&cx.in_hatchery(), b"payload")?;
//! array.set(0, Some(blob.untyped()));
//! ```

macro_rules! logln_if {
    ($cond: expr, $($t:tt)*) => {
        if $cond {
            tracing::info!(target: "whisper::gc", $($t)*);
        } else {
            tracing::debug!(target: "whisper::gc", $($t)*);
        }
    };
}

pub mod allocation;
pub mod builtins;
pub mod bump;
pub mod error;
pub mod format;
pub mod gcref;
pub mod header;
pub mod heap_field;
pub mod mmap;
pub mod pool;
pub mod rooting;
pub mod runtime;
pub mod slab;
pub mod slab_list;
pub mod statistics;
pub mod thread_context;
pub mod trace;
pub mod util;

#[cfg(test)]
mod tests;

pub use allocation::AllocationContext;
pub use builtins::{Blob, RefArray, RuntimeState};
pub use bump::BumpAllocator;
pub use error::{BumpAllocError, HeapError};
pub use format::{AllocFormat, HeapTraits, StackFormat, StackTraits};
pub use gcref::{Gc, UntypedGc};
pub use header::Generation;
pub use heap_field::HeapField;
pub use pool::PoolAllocator;
pub use rooting::{Handle, Local, LocalCell, MutHandle};
pub use runtime::Runtime;
pub use statistics::HeapStatistics;
pub use thread_context::ThreadContext;
pub use trace::{ScanBounds, Scanner, Trace, Updater};

/// Heap configuration, fixed when the [`Runtime`] is created.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    /// Minimum number of 1 KiB cards in a standard slab. Rounded up to whole
    /// pages.
    pub standard_slab_cards: usize,
    /// Report slab and thread events at `info` instead of `debug` level.
    pub verbose: bool,
    /// Default chunk size of bump allocators made by
    /// [`Runtime::bump_allocator`].
    pub bump_chunk_size: usize,
    /// Number of well-known slots in the runtime state.
    pub well_known_slots: usize,
}

impl Config {
    /// Rejects settings no heap can be built from.
    pub fn validate(&self) -> Result<(), HeapError> {
        if self.bump_chunk_size <= bump::CHUNK_OVERHEAD {
            return Err(HeapError::InvalidConfig {
                field: "bump_chunk_size",
                value: self.bump_chunk_size,
            });
        }
        if self.standard_slab_cards == 0 {
            return Err(HeapError::InvalidConfig {
                field: "standard_slab_cards",
                value: 0,
            });
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            standard_slab_cards: slab::STANDARD_SLAB_CARDS,
            verbose: false,
            bump_chunk_size: bump::DEFAULT_CHUNK_SIZE,
            well_known_slots: 16,
        }
    }
}
