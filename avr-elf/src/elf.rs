//! Byte-exact model of 32-bit little-endian ELF firmware images
//!
//! The ELF file here is purely a firmware container as emitted by the AVR
//! toolchain. Only seven named sections are interpreted; every other byte
//! is carried through untouched and written back verbatim on save. Program
//! headers are not processed.

use std::fs;
use std::path::Path;

use thiserror::Error;

const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];
const CLASS_32: u8 = 1;
const DATA_LITTLE_ENDIAN: u8 = 1;

// Fixed ELF32 header field offsets
const EI_CLASS: usize = 4;
const EI_DATA: usize = 5;
const E_MACHINE: usize = 18;
const E_SHOFF: usize = 32;
const E_SHENTSIZE: usize = 46;
const E_SHNUM: usize = 48;
const E_SHSTRNDX: usize = 50;

const ELF_HEADER_LEN: usize = 52;
const SECTION_HEADER_LEN: usize = 40;
const SYMBOL_ENTRY_LEN: usize = 16;

#[derive(Error, Debug)]
pub enum ElfError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("not an ELF image")]
    BadMagic,

    #[error("unsupported ELF layout: {0}")]
    Unsupported(&'static str),

    #[error("truncated ELF image reading {0}")]
    Truncated(&'static str),

    #[error("required section missing: {0}")]
    MissingSection(&'static str),
}

/// The sections the engine interprets. Declaration order matches the
/// registry's alphabetical sort order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionId {
    Bss,
    Comment,
    Data,
    SectionNames,
    StringTable,
    SymbolTable,
    Text,
}

impl SectionId {
    pub const COUNT: usize = 7;

    pub const fn name(self) -> &'static str {
        match self {
            SectionId::Bss => ".bss",
            SectionId::Comment => ".comment",
            SectionId::Data => ".data",
            SectionId::SectionNames => ".shstrtab",
            SectionId::StringTable => ".strtab",
            SectionId::SymbolTable => ".symtab",
            SectionId::Text => ".text",
        }
    }
}

/// Sorted `(name, id)` registry, binary-searched when section headers are
/// matched at load time.
const SECTION_REGISTRY: [(&str, SectionId); SectionId::COUNT] = [
    (SectionId::Bss.name(), SectionId::Bss),
    (SectionId::Comment.name(), SectionId::Comment),
    (SectionId::Data.name(), SectionId::Data),
    (SectionId::SectionNames.name(), SectionId::SectionNames),
    (SectionId::StringTable.name(), SectionId::StringTable),
    (SectionId::SymbolTable.name(), SectionId::SymbolTable),
    (SectionId::Text.name(), SectionId::Text),
];

fn section_id_for(name: &[u8]) -> Option<SectionId> {
    SECTION_REGISTRY
        .binary_search_by(|&(entry, _)| entry.as_bytes().cmp(name))
        .ok()
        .map(|i| SECTION_REGISTRY[i].1)
}

/// One decoded section table entry. Offsets and sizes are in bytes; `addr`
/// is the section's load address in the target's memory space.
#[derive(Debug, Clone, Copy)]
pub struct SectionHeader {
    pub name_offset: u32,
    pub kind: u32,
    pub flags: u32,
    pub addr: u32,
    pub offset: u32,
    pub size: u32,
    pub link: u32,
    pub info: u32,
    pub align: u32,
    pub entry_size: u32,
}

/// One decoded symbol table entry.
#[derive(Debug, Clone, Copy)]
pub struct Symbol {
    pub name_offset: u32,
    /// Virtual address, or the absolute value for symbols without a section.
    pub value: u32,
    /// Byte size of the symbol's object; drives multi-byte relocation.
    pub size: u32,
    pub info: u8,
    pub other: u8,
    /// Raw section header index; section-less symbols are absolute values.
    pub shndx: u16,
}

/// A symbol found by [`ElfImage::resolve_symbol`].
#[derive(Debug, Clone, Copy)]
pub struct SymbolRef {
    pub symbol: Symbol,
    /// Offset of the symbol's bytes within the image buffer, or `None` for
    /// absolute symbols. Invalidated by reload or destruction.
    pub file_offset: Option<usize>,
}

fn u16_at(data: &[u8], offset: usize, what: &'static str) -> Result<u16, ElfError> {
    let bytes = data
        .get(offset..offset + 2)
        .ok_or(ElfError::Truncated(what))?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

fn u32_at(data: &[u8], offset: usize, what: &'static str) -> Result<u32, ElfError> {
    let bytes = data
        .get(offset..offset + 4)
        .ok_or(ElfError::Truncated(what))?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// NUL-terminated bytes starting at `offset`, without the terminator.
fn cstr_at(data: &[u8], offset: usize) -> Result<&[u8], ElfError> {
    let tail = data
        .get(offset..)
        .ok_or(ElfError::Truncated("string table"))?;
    let len = tail
        .iter()
        .position(|&b| b == 0)
        .ok_or(ElfError::Truncated("string table"))?;
    Ok(&tail[..len])
}

fn section_header_at(data: &[u8], offset: usize) -> Result<SectionHeader, ElfError> {
    let field = |rel: usize| u32_at(data, offset + rel, "section header");
    Ok(SectionHeader {
        name_offset: field(0)?,
        kind: field(4)?,
        flags: field(8)?,
        addr: field(12)?,
        offset: field(16)?,
        size: field(20)?,
        link: field(24)?,
        info: field(28)?,
        align: field(32)?,
        entry_size: field(36)?,
    })
}

fn symbol_at(data: &[u8], offset: usize) -> Option<Symbol> {
    let bytes = data.get(offset..offset + SYMBOL_ENTRY_LEN)?;
    Some(Symbol {
        name_offset: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
        value: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        size: u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]),
        info: bytes[12],
        other: bytes[13],
        shndx: u16::from_le_bytes([bytes[14], bytes[15]]),
    })
}

/// An ELF firmware image held entirely in memory.
///
/// The buffer is exclusively owned; patches mutate it in place and
/// [`ElfImage::save`] writes it back byte for byte.
pub struct ElfImage {
    data: Vec<u8>,
    sections: [Option<SectionHeader>; SectionId::COUNT],
    /// Raw section-header index to [`SectionId`], for the toolchain's
    /// compact convention of symbol `shndx` values below [`SectionId::COUNT`].
    shndx_map: [Option<SectionId>; SectionId::COUNT],
}

impl ElfImage {
    /// Parses an image from its raw bytes.
    ///
    /// Fails when the magic, class, or endianness bytes do not match the
    /// AVR toolchain's 32-bit little-endian output, or when any of
    /// {.text, .strtab, .symtab} cannot be resolved. On failure no partial
    /// image is retained.
    pub fn parse(data: Vec<u8>) -> Result<Self, ElfError> {
        if data.len() < ELF_HEADER_LEN {
            return Err(ElfError::Truncated("ELF header"));
        }
        if data[..4] != ELF_MAGIC {
            return Err(ElfError::BadMagic);
        }
        if data[EI_CLASS] != CLASS_32 {
            return Err(ElfError::Unsupported("only 32-bit images are handled"));
        }
        if data[EI_DATA] != DATA_LITTLE_ENDIAN {
            return Err(ElfError::Unsupported(
                "only little-endian images are handled",
            ));
        }

        let machine = u16_at(&data, E_MACHINE, "ELF header")?;
        let shoff = u32_at(&data, E_SHOFF, "ELF header")? as usize;
        let shentsize = u16_at(&data, E_SHENTSIZE, "ELF header")? as usize;
        let shnum = u16_at(&data, E_SHNUM, "ELF header")? as usize;
        let shstrndx = u16_at(&data, E_SHSTRNDX, "ELF header")? as usize;
        if shentsize < SECTION_HEADER_LEN {
            return Err(ElfError::Unsupported("section header entry size"));
        }
        if shstrndx >= shnum {
            return Err(ElfError::Truncated("section name table index"));
        }
        let name_table = section_header_at(&data, shoff + shstrndx * shentsize)?;

        let mut sections = [None; SectionId::COUNT];
        let mut shndx_map = [None; SectionId::COUNT];
        for i in 0..shnum {
            let header = section_header_at(&data, shoff + i * shentsize)?;
            let name = cstr_at(
                &data,
                name_table.offset as usize + header.name_offset as usize,
            )?;
            let id = section_id_for(name);
            if let Some(id) = id {
                sections[id as usize] = Some(header);
            }
            if i < SectionId::COUNT {
                shndx_map[i] = id;
            }
        }
        for required in [SectionId::Text, SectionId::StringTable, SectionId::SymbolTable] {
            if sections[required as usize].is_none() {
                return Err(ElfError::MissingSection(required.name()));
            }
        }

        log::debug!(
            "parsed ELF image: machine 0x{machine:02X}, {shnum} sections, {} bytes",
            data.len()
        );
        Ok(ElfImage {
            data,
            sections,
            shndx_map,
        })
    }

    /// Reads and parses the whole file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ElfError> {
        let path = path.as_ref();
        let image = Self::parse(fs::read(path)?)?;
        log::info!("loaded {} ({} bytes)", path.display(), image.len());
        Ok(image)
    }

    /// Writes the buffer back verbatim, same length, no reformatting.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ElfError> {
        let path = path.as_ref();
        fs::write(path, &self.data)?;
        log::info!("wrote {} ({} bytes)", path.display(), self.len());
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// The decoded header for a named section, when the image has it.
    pub fn section(&self, id: SectionId) -> Option<&SectionHeader> {
        self.sections[id as usize].as_ref()
    }

    /// Bounds-checked little-endian u16 read from the image buffer.
    pub fn u16_at(&self, offset: usize) -> Option<u16> {
        let bytes = self.data.get(offset..offset.checked_add(2)?)?;
        Some(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    /// Bounds-checked little-endian u32 read from the image buffer.
    pub fn u32_at(&self, offset: usize) -> Option<u32> {
        let bytes = self.data.get(offset..offset.checked_add(4)?)?;
        Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Bounds-checked little-endian u16 write into the image buffer.
    /// Returns false when `offset` is out of range.
    pub fn put_u16_at(&mut self, offset: usize, value: u16) -> bool {
        let Some(end) = offset.checked_add(2) else {
            return false;
        };
        match self.data.get_mut(offset..end) {
            Some(slice) => {
                slice.copy_from_slice(&value.to_le_bytes());
                true
            }
            None => false,
        }
    }

    /// Looks `name` up in the symbol table by linear scan.
    ///
    /// `None` is a normal negative result, not an error. For symbols in a
    /// known section the returned `file_offset` translates the symbol's
    /// address through the section table into the image buffer; absolute
    /// symbols carry their value in the entry and no offset.
    pub fn resolve_symbol(&self, name: &str) -> Option<SymbolRef> {
        let symtab = self.section(SectionId::SymbolTable)?;
        let strtab = self.section(SectionId::StringTable)?;
        let entry_size = match symtab.entry_size as usize {
            0 => SYMBOL_ENTRY_LEN,
            n => n,
        };
        let count = symtab.size as usize / entry_size;
        for i in 0..count {
            let symbol = symbol_at(&self.data, symtab.offset as usize + i * entry_size)?;
            let name_off = strtab.offset as usize + symbol.name_offset as usize;
            let Ok(entry_name) = cstr_at(&self.data, name_off) else {
                continue;
            };
            if entry_name != name.as_bytes() {
                continue;
            }
            return Some(SymbolRef {
                symbol,
                file_offset: self.symbol_file_offset(&symbol),
            });
        }
        None
    }

    fn symbol_file_offset(&self, symbol: &Symbol) -> Option<usize> {
        let id = (*self.shndx_map.get(symbol.shndx as usize)?)?;
        let section = self.section(id)?;
        Some(section.offset as usize + symbol.value.wrapping_sub(section.addr) as usize)
    }
}
