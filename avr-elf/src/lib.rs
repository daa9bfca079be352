//! Firmware-image engine for merging AVR sketches
//!
//! This crate holds the binary side of the sketch-merging flow: an in-memory
//! model of the ELF images the AVR toolchain emits, an instruction-level
//! patcher for relocating vectors and data-space references, and a
//! run-compressed set type for tracking which interrupt vectors a sketch
//! implements.

pub mod avr;
pub mod elf;
pub mod runset;

pub use avr::{AvrImage, DEFAULT_HANDLER_SYMBOL};
pub use elf::{ElfError, ElfImage, SectionHeader, SectionId, Symbol, SymbolRef};
pub use runset::{ParseRunSetError, RunCursor, RunSet};

#[cfg(test)]
pub(crate) mod test_image;
