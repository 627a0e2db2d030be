//! Object model primitives shared by the collector and its mutators.
//!
//! Every heap object is preceded by a one-word [`Header`]. Object references
//! are plain [`Address`]es pointing just past that header.

mod address;
mod header;

pub use address::{Address, WORD, align_up, round_up_to_word};
pub use header::{
    FORWARDED_TID, GcFlags, HEADER_SIZE, Header, MIN_NURSERY_OBJECT_SIZE,
    TypeId, forwarding_address, header_of, init_header, set_forwarded,
};
