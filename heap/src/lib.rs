//! MiniMark: a generational garbage collector with a copying nursery and a
//! non-moving mark and sweep old generation.
//!
//! This crate is decoupled from any specific VM. Consumers provide:
//! - A [`TypeTable`] describing the layout of every object type.
//! - A [`RootProvider`] to supply live roots at collection time.
//!
//! and call the write barrier before storing a GC pointer into an object.

mod arena;
mod barrier;
mod cards;
mod config;
mod error;
mod identity;
mod major;
mod minimark;
mod minor;
mod nursery;
mod roots;
mod simple_arena;
mod system;
mod types;

pub use arena::{ArenaAllocator, ArenaCollection, PAGE_HEADER_SIZE};
pub use config::{ENV_MAJOR_COLLECT, ENV_MAX, ENV_NURSERY, GcSettings, parse_size};
pub use error::{GcError, GcResult, fatal_error};
pub use minimark::{GcStats, Generation, MiniMark};
pub use nursery::Nursery;
pub use roots::{RootProvider, ShadowStack};
pub use simple_arena::SimpleArenaCollection;
pub use system::{OS_PAGE_SIZE, map_memory, raw_free, raw_malloc, unmap_memory};
pub use types::{FinalizerFn, TypeInfo, TypeTable, TypeTableBuilder, VarsizeInfo};

pub use object::{Address, GcFlags, HEADER_SIZE, TypeId, WORD};
