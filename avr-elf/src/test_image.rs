//! Synthetic AVR-style ELF images for tests.
//!
//! The layout mirrors what the AVR toolchain emits closely enough for the
//! engine: ELF header, section contents, then the section header table.
//! Raw section indices follow the compact convention (1 = .text, 2 = .data,
//! 3 = .bss) so symbol `shndx` values stay below the registry size.

/// File offset of the `.text` contents (right after the ELF header).
pub const TEXT_OFFSET: usize = 52;
/// Load address of `.text`.
pub const TEXT_ADDR: u32 = 0;
/// Load address of `.data`.
pub const DATA_ADDR: u32 = 0x0100;

const SECTION_HEADER_LEN: usize = 40;
const SHNUM: u16 = 7;
const SHSTRNDX: u16 = 6;

pub struct ImageBuilder {
    text: Vec<u8>,
    data: Vec<u8>,
    bss_size: u32,
    /// (name, value, size, raw shndx)
    symbols: Vec<(String, u32, u32, u16)>,
}

impl ImageBuilder {
    pub fn new() -> Self {
        ImageBuilder {
            text: Vec::new(),
            data: Vec::new(),
            bss_size: 0,
            symbols: Vec::new(),
        }
    }

    pub fn text(mut self, bytes: Vec<u8>) -> Self {
        self.text = bytes;
        self
    }

    pub fn data(mut self, bytes: Vec<u8>) -> Self {
        self.data = bytes;
        self
    }

    pub fn bss_size(mut self, size: u32) -> Self {
        self.bss_size = size;
        self
    }

    pub fn symbol(mut self, name: &str, value: u32, size: u32, shndx: u16) -> Self {
        self.symbols.push((name.to_string(), value, size, shndx));
        self
    }

    pub fn build(self) -> Vec<u8> {
        // String table: leading NUL, then one entry per symbol.
        let mut strtab = vec![0u8];
        let mut sym_name_offsets = Vec::new();
        for (name, ..) in &self.symbols {
            sym_name_offsets.push(strtab.len() as u32);
            strtab.extend_from_slice(name.as_bytes());
            strtab.push(0);
        }

        // Symbol table: null entry, then the declared symbols.
        let mut symtab = vec![0u8; 16];
        for (i, (_, value, size, shndx)) in self.symbols.iter().enumerate() {
            symtab.extend_from_slice(&sym_name_offsets[i].to_le_bytes());
            symtab.extend_from_slice(&value.to_le_bytes());
            symtab.extend_from_slice(&size.to_le_bytes());
            symtab.push(0);
            symtab.push(0);
            symtab.extend_from_slice(&shndx.to_le_bytes());
        }

        // Section name table, indexed in raw section order.
        let section_names = [".text", ".data", ".bss", ".symtab", ".strtab", ".shstrtab"];
        let mut shstrtab = vec![0u8];
        let mut name_offsets = vec![0u32];
        for name in section_names {
            name_offsets.push(shstrtab.len() as u32);
            shstrtab.extend_from_slice(name.as_bytes());
            shstrtab.push(0);
        }

        let text_off = TEXT_OFFSET;
        let data_off = text_off + self.text.len();
        let symtab_off = data_off + self.data.len();
        let strtab_off = symtab_off + symtab.len();
        let shstrtab_off = strtab_off + strtab.len();
        let shoff = shstrtab_off + shstrtab.len();

        let mut out = Vec::new();
        out.extend_from_slice(&[0x7F, b'E', b'L', b'F', 1, 1, 1, 0]);
        out.extend_from_slice(&[0u8; 8]);
        out.extend_from_slice(&2u16.to_le_bytes()); // e_type: EXEC
        out.extend_from_slice(&0x53u16.to_le_bytes()); // e_machine: AVR
        out.extend_from_slice(&1u32.to_le_bytes()); // e_version
        out.extend_from_slice(&0u32.to_le_bytes()); // e_entry
        out.extend_from_slice(&0u32.to_le_bytes()); // e_phoff
        out.extend_from_slice(&(shoff as u32).to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes()); // e_flags
        out.extend_from_slice(&52u16.to_le_bytes()); // e_ehsize
        out.extend_from_slice(&0u16.to_le_bytes()); // e_phentsize
        out.extend_from_slice(&0u16.to_le_bytes()); // e_phnum
        out.extend_from_slice(&(SECTION_HEADER_LEN as u16).to_le_bytes());
        out.extend_from_slice(&SHNUM.to_le_bytes());
        out.extend_from_slice(&SHSTRNDX.to_le_bytes());
        assert_eq!(out.len(), TEXT_OFFSET);

        out.extend_from_slice(&self.text);
        out.extend_from_slice(&self.data);
        out.extend_from_slice(&symtab);
        out.extend_from_slice(&strtab);
        out.extend_from_slice(&shstrtab);

        let bss_addr = DATA_ADDR + self.data.len() as u32;
        let headers: [[u32; 10]; SHNUM as usize] = [
            [0; 10],
            [
                name_offsets[1],
                1, // PROGBITS
                6, // ALLOC | EXECINSTR
                TEXT_ADDR,
                text_off as u32,
                self.text.len() as u32,
                0,
                0,
                2,
                0,
            ],
            [
                name_offsets[2],
                1,
                3, // WRITE | ALLOC
                DATA_ADDR,
                data_off as u32,
                self.data.len() as u32,
                0,
                0,
                1,
                0,
            ],
            [
                name_offsets[3],
                8, // NOBITS
                3,
                bss_addr,
                symtab_off as u32,
                self.bss_size,
                0,
                0,
                1,
                0,
            ],
            [
                name_offsets[4],
                2, // SYMTAB
                0,
                0,
                symtab_off as u32,
                symtab.len() as u32,
                5,
                1,
                4,
                16,
            ],
            [
                name_offsets[5],
                3, // STRTAB
                0,
                0,
                strtab_off as u32,
                strtab.len() as u32,
                0,
                0,
                1,
                0,
            ],
            [
                name_offsets[6],
                3,
                0,
                0,
                shstrtab_off as u32,
                shstrtab.len() as u32,
                0,
                0,
                1,
                0,
            ],
        ];
        for header in headers {
            for field in header {
                out.extend_from_slice(&field.to_le_bytes());
            }
        }
        out
    }
}

/// Little-endian byte stream from 16-bit instruction words.
pub fn words(words: &[u16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(words.len() * 2);
    for w in words {
        out.extend_from_slice(&w.to_le_bytes());
    }
    out
}
