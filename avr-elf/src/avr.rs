//! AVR specialization of the ELF image model
//!
//! Knows just enough about the AVR instruction set to find the implemented
//! interrupt vectors and to relocate statically allocated variables when
//! merged sketches would otherwise collide in data space.

use std::path::Path;

use crate::elf::{ElfError, ElfImage, SectionId};
use crate::runset::RunSet;

/// Symbol the toolchain's runtime points unused vectors at.
pub const DEFAULT_HANDLER_SYMBOL: &str = "__bad_interrupt";

/// Opcode bits of the two-word `jmp` instruction, in the low word.
const JMP_OPCODE: u32 = 0x940C;
/// Mask isolating the `jmp` opcode bits regardless of the target address.
const JMP_OPCODE_MASK: u32 = 0xFE0E;

/// LDS/STS (direct data-space load/store) opcode bits and family mask.
const LDS_OPCODE: u16 = 0x9000;
const STS_OPCODE: u16 = 0x9200;
const DIRECT_OPCODE_MASK: u16 = 0xFE0F;

/// An AVR firmware image: an [`ElfImage`] plus instruction-level patching.
pub struct AvrImage {
    elf: ElfImage,
}

impl AvrImage {
    pub fn new(elf: ElfImage) -> Self {
        AvrImage { elf }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ElfError> {
        Ok(AvrImage::new(ElfImage::load(path)?))
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ElfError> {
        self.elf.save(path)
    }

    pub fn elf(&self) -> &ElfImage {
        &self.elf
    }

    pub fn into_elf(self) -> ElfImage {
        self.elf
    }

    fn section_size(&self, id: SectionId) -> u32 {
        self.elf.section(id).map_or(0, |s| s.size)
    }

    /// Flash footprint: `.text` plus the initialized `.data` image.
    pub fn flash_used(&self) -> u32 {
        self.section_size(SectionId::Text) + self.section_size(SectionId::Data)
    }

    /// SRAM footprint: `.data` plus `.bss`.
    pub fn data_size(&self) -> u32 {
        self.section_size(SectionId::Data) + self.section_size(SectionId::Bss)
    }

    /// Packs the two-word `jmp` to `byte_addr` (assumed even) into one u32,
    /// low instruction word in the low half, directly comparable to a
    /// little-endian 32-bit read of the image.
    ///
    /// The 17..23 address bits land in the opcode word's 1F1 field; bit 0
    /// of the byte address is dropped by the word addressing (shift by 15
    /// and 17 rather than 16).
    pub fn encode_jump(byte_addr: u32) -> u32 {
        let shifted_low = ((byte_addr as u64) << 15) as u32;
        let mut packed = JMP_OPCODE + (shifted_low & 0xFFFF_0000);
        let high6 = byte_addr >> 17;
        if high6 != 0 {
            packed |= ((high6 & 0x3E) << 3) + (high6 & 1);
        }
        packed
    }

    /// Scans the vector table for implemented interrupt vectors.
    ///
    /// Every vector slot holding a jump to somewhere other than the default
    /// handler is recorded. Index 0, the reset vector, is always
    /// implemented and not recorded. Returns `None` when the default
    /// handler symbol cannot be resolved.
    ///
    /// The scan ends at the first word that is not a `jmp`. That is a
    /// structural assumption about the table, not a verified boundary:
    /// devices whose vectors use a short `rjmp` are not recognized.
    pub fn implemented_vectors(&self) -> Option<RunSet> {
        let handler = self.elf.resolve_symbol(DEFAULT_HANDLER_SYMBOL)?;
        let text = self.elf.section(SectionId::Text)?;
        let default_jump = Self::encode_jump(handler.symbol.value);

        let text_offset = text.offset as usize;
        let slot_count = (text.size / 4) as usize;
        let mut vectors = RunSet::new();
        let mut index = 1usize;
        while index < slot_count {
            let Some(word) = self.elf.u32_at(text_offset + index * 4) else {
                break;
            };
            if word & JMP_OPCODE_MASK != JMP_OPCODE {
                break;
            }
            if word != default_jump {
                vectors.set(index as u32, index as u32);
            }
            index += 1;
        }
        log::debug!(
            "vector scan stopped at slot {index}; {} implemented",
            vectors.count()
        );
        Some(vectors)
    }

    /// Rewrites every LDS/STS operand referencing `name` to `new_addr`.
    ///
    /// The symbol's old 16-bit address is matched against every word of
    /// `.text`; a match counts only when the preceding word carries the
    /// LDS/STS opcode bits. Multi-byte symbols are accessed one byte at a
    /// time, so after a hit the following words are checked every second
    /// word for `old + 1, old + 2, ...` up to the symbol's size, stopping
    /// at the first break in the pattern.
    ///
    /// Returns the number of operand words rewritten; 0 when the symbol is
    /// unresolved or nothing references it.
    pub fn patch_symbol_address(&mut self, name: &str, new_addr: u16) -> usize {
        let Some(found) = self.elf.resolve_symbol(name) else {
            log::debug!("symbol {name} not found; nothing to patch");
            return 0;
        };
        let Some(text) = self.elf.section(SectionId::Text).copied() else {
            return 0;
        };
        let old_addr = found.symbol.value as u16;
        let value_size = found.symbol.size;
        let text_offset = text.offset as usize;
        let word_count = (text.size / 2) as usize;

        let mut patched = 0usize;
        // The operand of an LDS/STS can never be the first text word, and
        // starting at 1 keeps the preceding-word check in bounds.
        let mut w = 1usize;
        while w < word_count {
            let Some(word) = self.elf.u16_at(text_offset + w * 2) else {
                break;
            };
            if word == old_addr
                && let Some(prev) = self.elf.u16_at(text_offset + (w - 1) * 2)
            {
                let opcode = prev & DIRECT_OPCODE_MASK;
                if opcode == LDS_OPCODE || opcode == STS_OPCODE {
                    if self.elf.put_u16_at(text_offset + w * 2, new_addr) {
                        patched += 1;
                    }
                    // Each LDS/STS occupies two words, so the access for
                    // the next byte of the value sits two words on.
                    let mut k = 1u32;
                    while k < value_size {
                        w += 2;
                        if w >= word_count {
                            break;
                        }
                        let expect = old_addr.wrapping_add(k as u16);
                        if self.elf.u16_at(text_offset + w * 2) != Some(expect) {
                            break;
                        }
                        let Some(op) = self.elf.u16_at(text_offset + (w - 1) * 2) else {
                            break;
                        };
                        let op = op & DIRECT_OPCODE_MASK;
                        if op != LDS_OPCODE && op != STS_OPCODE {
                            break;
                        }
                        if self.elf.put_u16_at(
                            text_offset + w * 2,
                            new_addr.wrapping_add(k as u16),
                        ) {
                            patched += 1;
                        }
                        k += 1;
                    }
                }
            }
            w += 1;
        }
        if patched > 0 {
            log::info!(
                "relocated {name}: {patched} operand word(s) rewritten to 0x{new_addr:04X}"
            );
        }
        patched
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_image::{DATA_ADDR, ImageBuilder, words};

    const DEFAULT_HANDLER_ADDR: u32 = 0x40;

    fn push_jump(out: &mut Vec<u16>, packed: u32) {
        out.push(packed as u16);
        out.push((packed >> 16) as u16);
    }

    /// 8-slot vector table with real handlers in slots 0 (reset), 1 and 4,
    /// the rest jumping to the shared default handler.
    fn vector_table_text() -> Vec<u8> {
        let default = AvrImage::encode_jump(DEFAULT_HANDLER_ADDR);
        let mut w = Vec::new();
        push_jump(&mut w, AvrImage::encode_jump(0x34));
        push_jump(&mut w, AvrImage::encode_jump(0x48));
        push_jump(&mut w, default);
        push_jump(&mut w, default);
        push_jump(&mut w, AvrImage::encode_jump(0x4C));
        push_jump(&mut w, default);
        push_jump(&mut w, default);
        push_jump(&mut w, default);
        // two nops: fails the jmp mask, ends the scan
        w.push(0x0000);
        w.push(0x0000);
        while w.len() < 0x50 / 2 {
            w.push(0xFFFF);
        }
        words(&w)
    }

    fn vector_image() -> AvrImage {
        let bytes = ImageBuilder::new()
            .text(vector_table_text())
            .symbol(DEFAULT_HANDLER_SYMBOL, DEFAULT_HANDLER_ADDR, 0, 1)
            .build();
        AvrImage::new(ElfImage::parse(bytes).unwrap())
    }

    #[test]
    fn test_encode_jump() {
        assert_eq!(AvrImage::encode_jump(0), 0x940C);
        assert_eq!(AvrImage::encode_jump(0x40), 0x0020_940C);
        // 128 KiB: the address overflows into the opcode word's 1F1 field
        assert_eq!(AvrImage::encode_jump(0x0002_0000), 0x940D);
        assert_eq!(AvrImage::encode_jump(0x0004_0000), 0x941C);
        assert_eq!(AvrImage::encode_jump(0x0003_FFFE), 0xFFFF_940D);
    }

    #[test]
    fn test_jump_pattern_mask() {
        for addr in [0u32, 0x40, 0x2_0000, 0x3_FFFE] {
            let packed = AvrImage::encode_jump(addr);
            assert_eq!(packed & JMP_OPCODE_MASK, JMP_OPCODE, "addr 0x{addr:X}");
        }
    }

    #[test]
    fn test_implemented_vectors() {
        let vectors = vector_image().implemented_vectors().unwrap();
        assert_eq!(vectors.runs(), &[0, 1, 2, 4, 5]);
        assert_eq!(vectors.count(), 2);
        assert!(vectors.contains(1));
        assert!(vectors.contains(4));
        assert!(!vectors.contains(0));
        assert!(!vectors.contains(2));
        assert!(!vectors.contains(7));
    }

    #[test]
    fn test_implemented_vectors_without_default_handler() {
        let bytes = ImageBuilder::new().text(vector_table_text()).build();
        let image = AvrImage::new(ElfImage::parse(bytes).unwrap());
        assert!(image.implemented_vectors().is_none());
    }

    /// `.text` with four consecutive LDS/STS pairs accessing a 4-byte
    /// variable at DATA_ADDR+4, byte by byte.
    fn patch_text(break_third_pair: bool) -> Vec<u8> {
        let old = (DATA_ADDR + 4) as u16;
        let mut w: Vec<u16> = vec![0xCFFF, 0x0000]; // rjmp .-2, nop
        w.extend([0x9180, old]); // lds r24, old
        w.extend([0x9190, old + 1]);
        let third = if break_third_pair { 0x0999 } else { old + 2 };
        w.extend([0x91A0, third]);
        w.extend([0x93B0, old + 3]); // sts old+3, r27
        words(&w)
    }

    fn patch_image(break_third_pair: bool) -> AvrImage {
        let bytes = ImageBuilder::new()
            .text(patch_text(break_third_pair))
            .data(vec![0; 16])
            .symbol("tick_count", DATA_ADDR + 4, 4, 2)
            .build();
        AvrImage::new(ElfImage::parse(bytes).unwrap())
    }

    fn text_word(image: &AvrImage, index: usize) -> u16 {
        let text = image.elf().section(SectionId::Text).unwrap();
        image.elf().u16_at(text.offset as usize + index * 2).unwrap()
    }

    #[test]
    fn test_patch_multi_byte_symbol() {
        let mut image = patch_image(false);
        assert_eq!(image.patch_symbol_address("tick_count", 0x0200), 4);
        assert_eq!(text_word(&image, 3), 0x0200);
        assert_eq!(text_word(&image, 5), 0x0201);
        assert_eq!(text_word(&image, 7), 0x0202);
        assert_eq!(text_word(&image, 9), 0x0203);
        // opcode words untouched
        assert_eq!(text_word(&image, 2), 0x9180);
        assert_eq!(text_word(&image, 8), 0x93B0);
    }

    #[test]
    fn test_patch_stops_at_broken_chain() {
        let mut image = patch_image(true);
        assert_eq!(image.patch_symbol_address("tick_count", 0x0200), 2);
        assert_eq!(text_word(&image, 3), 0x0200);
        assert_eq!(text_word(&image, 5), 0x0201);
        assert_eq!(text_word(&image, 7), 0x0999);
        assert_eq!(text_word(&image, 9), (DATA_ADDR + 4) as u16 + 3);
    }

    #[test]
    fn test_patch_unresolved_symbol() {
        let mut image = patch_image(false);
        assert_eq!(image.patch_symbol_address("no_such_symbol", 0x0200), 0);
    }

    #[test]
    fn test_patch_unreferenced_symbol() {
        let bytes = ImageBuilder::new()
            .text(words(&[0xCFFF, 0x0000, 0x0000, 0x0000]))
            .data(vec![0; 16])
            .symbol("unused_flag", DATA_ADDR, 1, 2)
            .build();
        let mut image = AvrImage::new(ElfImage::parse(bytes).unwrap());
        assert_eq!(image.patch_symbol_address("unused_flag", 0x0200), 0);
    }

    #[test]
    fn test_footprint_sums() {
        let bytes = ImageBuilder::new()
            .text(vec![0; 0x30])
            .data(vec![0; 0x10])
            .bss_size(0x20)
            .build();
        let image = AvrImage::new(ElfImage::parse(bytes).unwrap());
        assert_eq!(image.flash_used(), 0x40);
        assert_eq!(image.data_size(), 0x30);
    }
}
