//! Binary module image format (`.stm`).
//!
//! ```text
//! +--------------------+ 0
//! | header (60 bytes)  |
//! +--------------------+ reloc_offset
//! | relocations (8 B)* |
//! +--------------------+ code_offset
//! | code               |
//! +--------------------+ data_offset
//! | data               |
//! +--------------------+ symbol_offset
//! | symbols            |   offset u32, section u8, name_len u8, name
//! +--------------------+
//! ```
//!
//! All multi-byte fields are little-endian. Every offset is relative to the
//! start of the file.

use bitflags::bitflags;

use crate::error::{Error, Result};

pub const MODULE_MAGIC: [u8; 4] = *b"STMD";
pub const FORMAT_VERSION: u16 = 1;
/// Interface epoch this runtime was built against.
pub const INTERFACE_VERSION: u32 = 0x0001_0000;
pub const HEADER_SIZE: usize = 60;
pub const RELOCATION_SIZE: usize = 8;
pub const MAX_MODULE_FILE_SIZE: usize = 0x10_0000; // 1MB

/// Capability a module provides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde-config", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde-config", serde(rename_all = "lowercase"))]
#[repr(u16)]
pub enum ModuleType {
    Cpu = 1,
    Video = 2,
    Audio = 3,
    Io = 4,
    System = 5,
}

impl ModuleType {
    pub fn from_raw(raw: u16) -> Option<Self> {
        match raw {
            1 => Some(Self::Cpu),
            2 => Some(Self::Video),
            3 => Some(Self::Audio),
            4 => Some(Self::Io),
            5 => Some(Self::System),
            _ => None,
        }
    }

    pub fn as_raw(self) -> u16 {
        self as u16
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ModuleFlags: u32 {
        /// Image was built position independent.
        const PIC = 0x01;
        /// A symbol table follows the data section.
        const HAS_SYMBOLS = 0x02;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RelocationKind {
    Absolute = 0,
    Relative = 1,
    High16 = 2,
    Low16 = 3,
}

impl RelocationKind {
    fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::Absolute),
            1 => Some(Self::Relative),
            2 => Some(Self::High16),
            3 => Some(Self::Low16),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Section {
    Code = 0,
    Data = 1,
}

impl Section {
    fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::Code),
            1 => Some(Self::Data),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Relocation {
    pub offset: u32,
    pub kind: RelocationKind,
    pub section: Section,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol {
    pub offset: u32,
    pub section: Section,
    pub name: String,
}

/// Fixed 60-byte module header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModuleHeader {
    pub magic: [u8; 4],
    pub version: u16,
    pub module_type: u16,
    pub flags: u32,
    pub code_size: u32,
    pub data_size: u32,
    pub bss_size: u32,
    pub entry_offset: u32,
    pub interface_version: u32,
    pub min_ram: u32,
    pub reloc_count: u32,
    pub reloc_offset: u32,
    pub code_offset: u32,
    pub data_offset: u32,
    pub symbol_offset: u32,
    pub symbol_count: u32,
}

fn read_u16_le(buf: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([buf[offset], buf[offset + 1]])
}

fn read_u32_le(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        buf[offset],
        buf[offset + 1],
        buf[offset + 2],
        buf[offset + 3],
    ])
}

impl ModuleHeader {
    /// Decode the header from the first [`HEADER_SIZE`] bytes of `buf`.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(Error::InvalidSize {
                what: "module header",
                actual: buf.len(),
                limit: HEADER_SIZE,
            });
        }
        Ok(Self {
            magic: [buf[0], buf[1], buf[2], buf[3]],
            version: read_u16_le(buf, 4),
            module_type: read_u16_le(buf, 6),
            flags: read_u32_le(buf, 8),
            code_size: read_u32_le(buf, 12),
            data_size: read_u32_le(buf, 16),
            bss_size: read_u32_le(buf, 20),
            entry_offset: read_u32_le(buf, 24),
            interface_version: read_u32_le(buf, 28),
            min_ram: read_u32_le(buf, 32),
            reloc_count: read_u32_le(buf, 36),
            reloc_offset: read_u32_le(buf, 40),
            code_offset: read_u32_le(buf, 44),
            data_offset: read_u32_le(buf, 48),
            symbol_offset: read_u32_le(buf, 52),
            symbol_count: read_u32_le(buf, 56),
        })
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[0..4].copy_from_slice(&self.magic);
        out[4..6].copy_from_slice(&self.version.to_le_bytes());
        out[6..8].copy_from_slice(&self.module_type.to_le_bytes());
        let words = [
            self.flags,
            self.code_size,
            self.data_size,
            self.bss_size,
            self.entry_offset,
            self.interface_version,
            self.min_ram,
            self.reloc_count,
            self.reloc_offset,
            self.code_offset,
            self.data_offset,
            self.symbol_offset,
            self.symbol_count,
        ];
        for (i, word) in words.iter().enumerate() {
            let at = 8 + i * 4;
            out[at..at + 4].copy_from_slice(&word.to_le_bytes());
        }
        out
    }

    pub fn flags(&self) -> ModuleFlags {
        ModuleFlags::from_bits_truncate(self.flags)
    }

    /// Bytes needed to hold code, data and bss contiguously.
    pub fn footprint(&self) -> usize {
        self.code_size as usize + self.data_size as usize + self.bss_size as usize
    }
}

/// A parsed module file borrowing its code and data from the input buffer.
#[derive(Debug)]
pub struct ModuleImage<'a> {
    pub header: ModuleHeader,
    pub relocations: Vec<Relocation>,
    pub code: &'a [u8],
    pub data: &'a [u8],
    pub symbols: Vec<Symbol>,
}

fn section_slice<'a>(buf: &'a [u8], offset: u32, len: u32, what: &'static str) -> Result<&'a [u8]> {
    let start = offset as usize;
    let end = start.checked_add(len as usize).unwrap_or(usize::MAX);
    buf.get(start..end).ok_or(Error::InvalidSize {
        what,
        actual: buf.len(),
        limit: end,
    })
}

impl<'a> ModuleImage<'a> {
    /// Parse and structurally validate a module file.
    ///
    /// Checks size bounds, magic and format version. Capability type,
    /// interface epoch and memory requirements are the loader's business.
    pub fn parse(buf: &'a [u8]) -> Result<Self> {
        if buf.len() > MAX_MODULE_FILE_SIZE {
            return Err(Error::InvalidSize {
                what: "module file",
                actual: buf.len(),
                limit: MAX_MODULE_FILE_SIZE,
            });
        }
        let header = ModuleHeader::parse(buf)?;
        if header.magic != MODULE_MAGIC {
            return Err(Error::invalid_argument(format!(
                "bad module magic {:02X?}",
                header.magic
            )));
        }
        if header.version != FORMAT_VERSION {
            return Err(Error::InvalidVersion {
                what: "module format",
                found: u32::from(header.version),
                expected: u32::from(FORMAT_VERSION),
            });
        }

        let reloc_bytes = header
            .reloc_count
            .checked_mul(RELOCATION_SIZE as u32)
            .ok_or(Error::InvalidSize {
                what: "relocation table",
                actual: header.reloc_count as usize,
                limit: MAX_MODULE_FILE_SIZE / RELOCATION_SIZE,
            })?;
        let table = section_slice(buf, header.reloc_offset, reloc_bytes, "relocation table")?;
        let relocations = table
            .chunks_exact(RELOCATION_SIZE)
            .map(|entry| {
                let offset = read_u32_le(entry, 0);
                let kind = RelocationKind::from_raw(entry[4]).ok_or_else(|| {
                    Error::invalid_argument(format!("unknown relocation type {}", entry[4]))
                })?;
                let section = Section::from_raw(entry[5]).ok_or_else(|| {
                    Error::invalid_argument(format!("unknown relocation section {}", entry[5]))
                })?;
                Ok(Relocation {
                    offset,
                    kind,
                    section,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let code = section_slice(buf, header.code_offset, header.code_size, "code section")?;
        let data = section_slice(buf, header.data_offset, header.data_size, "data section")?;
        let symbols = Self::parse_symbols(buf, &header)?;

        Ok(Self {
            header,
            relocations,
            code,
            data,
            symbols,
        })
    }

    fn parse_symbols(buf: &[u8], header: &ModuleHeader) -> Result<Vec<Symbol>> {
        let mut symbols = Vec::with_capacity(header.symbol_count as usize);
        let mut at = header.symbol_offset as usize;
        for _ in 0..header.symbol_count {
            let fixed = buf.get(at..at + 6).ok_or(Error::InvalidSize {
                what: "symbol table",
                actual: buf.len(),
                limit: at + 6,
            })?;
            let offset = read_u32_le(fixed, 0);
            let section = Section::from_raw(fixed[4]).ok_or_else(|| {
                Error::invalid_argument(format!("unknown symbol section {}", fixed[4]))
            })?;
            let name_len = fixed[5] as usize;
            let name = buf.get(at + 6..at + 6 + name_len).ok_or(Error::InvalidSize {
                what: "symbol table",
                actual: buf.len(),
                limit: at + 6 + name_len,
            })?;
            symbols.push(Symbol {
                offset,
                section,
                name: String::from_utf8_lossy(name).into_owned(),
            });
            at += 6 + name_len;
        }
        Ok(symbols)
    }

    /// The code symbol sitting exactly at the header's entry offset.
    pub fn entry_symbol(&self) -> Option<&Symbol> {
        self.symbols
            .iter()
            .find(|s| s.section == Section::Code && s.offset == self.header.entry_offset)
    }
}

/// Authoring-side writer for module images.
#[derive(Debug, Clone)]
pub struct ModuleImageBuilder {
    module_type: ModuleType,
    flags: ModuleFlags,
    code: Vec<u8>,
    data: Vec<u8>,
    bss_size: u32,
    entry_offset: u32,
    interface_version: u32,
    min_ram: u32,
    relocations: Vec<Relocation>,
    symbols: Vec<Symbol>,
}

impl ModuleImageBuilder {
    pub fn new(module_type: ModuleType) -> Self {
        Self {
            module_type,
            flags: ModuleFlags::PIC,
            code: Vec::new(),
            data: Vec::new(),
            bss_size: 0,
            entry_offset: 0,
            interface_version: INTERFACE_VERSION,
            min_ram: 0,
            relocations: Vec::new(),
            symbols: Vec::new(),
        }
    }

    pub fn code(mut self, code: &[u8]) -> Self {
        self.code = code.to_vec();
        self
    }

    pub fn data(mut self, data: &[u8]) -> Self {
        self.data = data.to_vec();
        self
    }

    pub fn bss(mut self, size: u32) -> Self {
        self.bss_size = size;
        self
    }

    pub fn interface_version(mut self, version: u32) -> Self {
        self.interface_version = version;
        self
    }

    pub fn min_ram(mut self, bytes: u32) -> Self {
        self.min_ram = bytes;
        self
    }

    pub fn relocation(mut self, section: Section, offset: u32, kind: RelocationKind) -> Self {
        self.relocations.push(Relocation {
            offset,
            kind,
            section,
        });
        self
    }

    pub fn symbol(mut self, name: &str, section: Section, offset: u32) -> Self {
        self.symbols.push(Symbol {
            offset,
            section,
            name: name.to_string(),
        });
        self
    }

    /// Mark `name` at `offset` in the code section as the exported entry.
    pub fn entry(mut self, name: &str, offset: u32) -> Self {
        self.entry_offset = offset;
        self.symbol(name, Section::Code, offset)
    }

    pub fn build(&self) -> Result<Vec<u8>> {
        if let Some(long) = self.symbols.iter().find(|s| s.name.len() > u8::MAX as usize) {
            return Err(Error::invalid_argument(format!(
                "symbol name '{}' exceeds 255 bytes",
                long.name
            )));
        }

        let reloc_offset = HEADER_SIZE;
        let code_offset = reloc_offset + self.relocations.len() * RELOCATION_SIZE;
        let data_offset = code_offset + self.code.len();
        let symbol_offset = data_offset + self.data.len();

        let mut flags = self.flags;
        flags.set(ModuleFlags::HAS_SYMBOLS, !self.symbols.is_empty());

        let header = ModuleHeader {
            magic: MODULE_MAGIC,
            version: FORMAT_VERSION,
            module_type: self.module_type.as_raw(),
            flags: flags.bits(),
            code_size: self.code.len() as u32,
            data_size: self.data.len() as u32,
            bss_size: self.bss_size,
            entry_offset: self.entry_offset,
            interface_version: self.interface_version,
            min_ram: self.min_ram,
            reloc_count: self.relocations.len() as u32,
            reloc_offset: reloc_offset as u32,
            code_offset: code_offset as u32,
            data_offset: data_offset as u32,
            symbol_offset: if self.symbols.is_empty() {
                0
            } else {
                symbol_offset as u32
            },
            symbol_count: self.symbols.len() as u32,
        };

        let mut out = Vec::with_capacity(symbol_offset + self.symbols.len() * 16);
        out.extend_from_slice(&header.to_bytes());
        for reloc in &self.relocations {
            out.extend_from_slice(&reloc.offset.to_le_bytes());
            out.push(reloc.kind as u8);
            out.push(reloc.section as u8);
            out.extend_from_slice(&[0, 0]);
        }
        out.extend_from_slice(&self.code);
        out.extend_from_slice(&self.data);
        for sym in &self.symbols {
            out.extend_from_slice(&sym.offset.to_le_bytes());
            out.push(sym.section as u8);
            out.push(sym.name.len() as u8);
            out.extend_from_slice(sym.name.as_bytes());
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<u8> {
        ModuleImageBuilder::new(ModuleType::Audio)
            .code(&[0x4E, 0x75, 0x00, 0x00, 0x00, 0x00, 0x00, 0x08])
            .data(&[1, 2, 3, 4])
            .bss(32)
            .relocation(Section::Code, 4, RelocationKind::Absolute)
            .entry("psg_entry", 0)
            .symbol("volume_table", Section::Data, 0)
            .build()
            .expect("build image")
    }

    #[test]
    fn header_layout_is_sixty_bytes_little_endian() {
        let image = sample();
        assert_eq!(&image[0..4], b"STMD");
        assert_eq!(u16::from_le_bytes([image[4], image[5]]), FORMAT_VERSION);
        assert_eq!(u16::from_le_bytes([image[6], image[7]]), 3);
        // reloc table directly follows the header
        assert_eq!(u32::from_le_bytes(image[40..44].try_into().unwrap()), 60);
        assert_eq!(u32::from_le_bytes(image[44..48].try_into().unwrap()), 68);
    }

    #[test]
    fn parse_recovers_sections_and_symbols() {
        let bytes = sample();
        let image = ModuleImage::parse(&bytes).unwrap();
        assert_eq!(image.header.code_size, 8);
        assert_eq!(image.header.bss_size, 32);
        assert_eq!(image.header.footprint(), 44);
        assert!(image.header.flags().contains(ModuleFlags::HAS_SYMBOLS));
        assert_eq!(image.code[0..2], [0x4E, 0x75]);
        assert_eq!(image.data, &[1, 2, 3, 4]);
        assert_eq!(
            image.relocations,
            vec![Relocation {
                offset: 4,
                kind: RelocationKind::Absolute,
                section: Section::Code,
            }]
        );
        assert_eq!(image.symbols.len(), 2);
        assert_eq!(image.entry_symbol().map(|s| s.name.as_str()), Some("psg_entry"));
    }

    #[test]
    fn bad_magic_and_version_are_rejected() {
        let mut bytes = sample();
        bytes[0] = b'X';
        assert!(matches!(
            ModuleImage::parse(&bytes),
            Err(Error::InvalidArgument(_))
        ));

        let mut bytes = sample();
        bytes[4] = 9;
        assert!(matches!(
            ModuleImage::parse(&bytes),
            Err(Error::InvalidVersion { .. })
        ));
    }

    #[test]
    fn truncated_files_are_invalid_size() {
        let bytes = sample();
        assert!(matches!(
            ModuleImage::parse(&bytes[..40]),
            Err(Error::InvalidSize { .. })
        ));
        // chop into the symbol table
        assert!(matches!(
            ModuleImage::parse(&bytes[..bytes.len() - 3]),
            Err(Error::InvalidSize { .. })
        ));
        let huge = vec![0u8; MAX_MODULE_FILE_SIZE + 1];
        assert!(matches!(
            ModuleImage::parse(&huge),
            Err(Error::InvalidSize { .. })
        ));
    }

    #[test]
    fn header_round_trips_through_bytes() {
        let bytes = sample();
        let header = ModuleHeader::parse(&bytes).unwrap();
        assert_eq!(header.to_bytes()[..], bytes[..HEADER_SIZE]);
    }
}
