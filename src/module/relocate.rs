//! Load-address fixups for module sections.
//!
//! The whole table is checked before the first byte is written, so a failed
//! relocation leaves both sections exactly as they were copied from the file.

use log::trace;

use super::format::{Relocation, RelocationKind, Section};
use crate::error::{Error, Result};

const FIXUP_WIDTH: usize = 4;

fn check(reloc: &Relocation, code_len: usize, data_len: usize) -> Result<()> {
    if reloc.kind != RelocationKind::Absolute {
        // Relative and split-halfword fixups have no agreed patch arithmetic yet.
        return Err(Error::invalid_argument(format!(
            "unsupported relocation type {:?} at {:?}+{:#x}",
            reloc.kind, reloc.section, reloc.offset
        )));
    }
    let limit = match reloc.section {
        Section::Code => code_len,
        Section::Data => data_len,
    };
    let end = (reloc.offset as usize).checked_add(FIXUP_WIDTH);
    if end.is_none_or(|end| end > limit) {
        return Err(Error::invalid_state(format!(
            "relocation at {:?}+{:#x} runs past the section ({} bytes)",
            reloc.section, reloc.offset, limit
        )));
    }
    Ok(())
}

/// Patch `code` and `data` for a module placed at `load_address`.
///
/// Absolute entries hold a 32-bit value authored against base 0; the load
/// address is added to it in place. Returns the number of patched words.
pub fn relocate(
    code: &mut [u8],
    data: &mut [u8],
    relocations: &[Relocation],
    load_address: u32,
) -> Result<usize> {
    for reloc in relocations {
        check(reloc, code.len(), data.len())?;
    }

    for reloc in relocations {
        let section: &mut [u8] = match reloc.section {
            Section::Code => &mut *code,
            Section::Data => &mut *data,
        };
        let at = reloc.offset as usize;
        let slot = &mut section[at..at + FIXUP_WIDTH];
        let authored = u32::from_le_bytes([slot[0], slot[1], slot[2], slot[3]]);
        let patched = authored.wrapping_add(load_address);
        slot.copy_from_slice(&patched.to_le_bytes());
        trace!(
            "reloc {:?}+{:#x}: {:#010x} -> {:#010x}",
            reloc.section, reloc.offset, authored, patched
        );
    }
    Ok(relocations.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn abs(section: Section, offset: u32) -> Relocation {
        Relocation {
            offset,
            kind: RelocationKind::Absolute,
            section,
        }
    }

    #[test]
    fn absolute_fixup_adds_load_address() {
        let mut code = vec![0u8; 8];
        code[4..8].copy_from_slice(&0x10u32.to_le_bytes());
        let mut data = 0x20u32.to_le_bytes().to_vec();

        let count = relocate(
            &mut code,
            &mut data,
            &[abs(Section::Code, 4), abs(Section::Data, 0)],
            0x3F80_0000,
        )
        .unwrap();

        assert_eq!(count, 2);
        assert_eq!(code[4..8], 0x3F80_0010u32.to_le_bytes());
        assert_eq!(data[..], 0x3F80_0020u32.to_le_bytes());
        assert_eq!(code[0..4], [0, 0, 0, 0]);
    }

    #[test]
    fn empty_table_leaves_sections_untouched() {
        let mut code: Vec<u8> = (0..32).collect();
        let mut data: Vec<u8> = (100..116).collect();
        let (code_before, data_before) = (code.clone(), data.clone());

        assert_eq!(relocate(&mut code, &mut data, &[], 0x1234_0000).unwrap(), 0);
        assert_eq!(code, code_before);
        assert_eq!(data, data_before);
    }

    #[test]
    fn out_of_bounds_entry_fails_without_partial_patch() {
        let mut code = vec![0u8; 8];
        let mut data = vec![0u8; 6];
        let table = [
            abs(Section::Code, 0),
            abs(Section::Data, 0),
            // 3 + 4 > 6
            abs(Section::Data, 3),
        ];

        let err = relocate(&mut code, &mut data, &table, 0x8000).unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
        assert_eq!(code, vec![0u8; 8]);
        assert_eq!(data, vec![0u8; 6]);
    }

    #[test]
    fn fixup_exactly_at_section_end_is_allowed() {
        let mut code = vec![0u8; 8];
        let mut data = Vec::new();
        relocate(&mut code, &mut data, &[abs(Section::Code, 4)], 1).unwrap();
        assert_eq!(code[4], 1);
    }

    #[test]
    fn offset_overflow_is_rejected() {
        let mut code = vec![0u8; 8];
        let mut data = Vec::new();
        let err = relocate(&mut code, &mut data, &[abs(Section::Code, u32::MAX)], 1);
        assert!(matches!(err, Err(Error::InvalidState(_))));
    }

    #[test]
    fn reserved_kinds_are_not_guessed() {
        let mut code = vec![0u8; 8];
        let mut data = Vec::new();
        for kind in [
            RelocationKind::Relative,
            RelocationKind::High16,
            RelocationKind::Low16,
        ] {
            let reloc = Relocation {
                offset: 0,
                kind,
                section: Section::Code,
            };
            assert!(matches!(
                relocate(&mut code, &mut data, &[reloc], 0x100),
                Err(Error::InvalidArgument(_))
            ));
        }
        assert_eq!(code, vec![0u8; 8]);
    }
}
