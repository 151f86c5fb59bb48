cfg_if::cfg_if! {
    if #[cfg(target_pointer_width = "64")] {
        use goblin::elf64 as elf;
    } else if #[cfg(target_pointer_width = "32")] {
        use goblin::elf32 as elf;
    } else {
        compile_error!("unsupported pointer size");
    }
}

use elf::{header::Header, program_header::ProgramHeader};

const MAX_ID_SIZE: usize = 64;

/// The unique identifier of a loaded ELF image.
///
/// ld defaults to sha1 build-ids (20 bytes) and lld to xxhash64, but both
/// also accept user-specified hex strings, so leave some headroom.
pub struct ElfId {
    id: [u8; MAX_ID_SIZE],
    len: usize,
}

impl ElfId {
    fn new(slice: &[u8]) -> Option<Self> {
        if slice.len() > MAX_ID_SIZE {
            return None;
        }

        let mut id = [0u8; MAX_ID_SIZE];
        id[..slice.len()].copy_from_slice(slice);

        Some(Self {
            id,
            len: slice.len(),
        })
    }

    /// Computes the identifier of an ELF image from its mapped bytes.
    ///
    /// Prefers the build-id note embedded by the linker. Images stripped of
    /// their build-id fall back to a hash of the first page, the same
    /// fallback Breakpad tooling uses.
    ///
    /// Everything is parsed with bounds-checked slices out of `mapped`, a
    /// damaged or truncated image yields `None` rather than a wild read.
    pub fn from_mapped_image(mapped: &[u8]) -> Option<Self> {
        // The batteries included elf parser in goblin performs heap
        // allocations, so we lazily parse the handful of things we need
        // ourselves
        if mapped.len() < elf::header::SIZEOF_EHDR {
            return None;
        }

        let mut header_bytes = [0u8; elf::header::SIZEOF_EHDR];
        header_bytes.copy_from_slice(&mapped[..elf::header::SIZEOF_EHDR]);
        let header = Header::from_bytes(&header_bytes);

        if &header.e_ident[..4] != goblin::elf::header::ELFMAG {
            return None;
        }

        read_build_id_note(header, mapped).or_else(|| hash_first_page(mapped))
    }
}

impl AsRef<[u8]> for ElfId {
    fn as_ref(&self) -> &[u8] {
        &self.id[..self.len]
    }
}

fn build_id_from_note(note_section: &[u8]) -> Option<ElfId> {
    use scroll::Pread;

    // goblin gates the Pread implementation for the note structs behind the
    // `alloc` feature even though pread doesn't allocate, so we just make
    // our own.
    struct ElfNote<'buffer> {
        kind: u32,
        description: &'buffer [u8],
    }

    impl<'buffer> scroll::ctx::TryFromCtx<'buffer, scroll::Endian> for ElfNote<'buffer> {
        type Error = scroll::Error;

        fn try_from_ctx(
            this: &'buffer [u8],
            le: scroll::Endian,
        ) -> Result<(Self, usize), Self::Error> {
            let offset = &mut 0;

            // Note strings are always 32-bit word aligned
            let align = |offset: &mut usize| {
                let diff = *offset % 4;
                if diff != 0 {
                    *offset += 4 - diff;
                }
            };

            // Notes always use 32-bit words for each field even on 64-bit
            // architectures.
            // Length of the note's name, including null terminator
            let name_size = this.gread_with::<u32>(offset, le)?;
            // Length of the note's description
            let desc_size = this.gread_with::<u32>(offset, le)?;
            // The note type
            let kind = this.gread_with::<u32>(offset, le)?;

            // Just skip the name, we don't care
            *offset += name_size as usize;
            align(offset);

            let description = this.gread_with::<&'buffer [u8]>(offset, desc_size as usize)?;
            align(offset);

            Ok((Self { kind, description }, *offset))
        }
    }

    let offset = &mut 0;
    while let Ok(note) = note_section.gread::<ElfNote>(offset) {
        if note.kind == goblin::elf::note::NT_GNU_BUILD_ID {
            if let Some(elf_id) = ElfId::new(note.description) {
                return Some(elf_id);
            }
        }
    }

    None
}

/// Iterates the segments of the given kind, bounds checked against the
/// mapped image.
fn iter_segments<'buffer>(
    header: &Header,
    mapped: &'buffer [u8],
    kind: u32,
) -> impl Iterator<Item = &'buffer [u8]> {
    let phoff = header.e_phoff as usize;
    let phnum = header.e_phnum as usize;

    const PH_SIZE: usize = std::mem::size_of::<ProgramHeader>();

    (0..phnum).filter_map(move |i| {
        let entry = phoff.checked_add(i * PH_SIZE)?;
        let bytes = mapped.get(entry..entry + PH_SIZE)?;

        // The table inside the image isn't necessarily aligned for us
        let ph = unsafe { std::ptr::read_unaligned(bytes.as_ptr().cast::<ProgramHeader>()) };

        if ph.p_type != kind {
            return None;
        }

        let start = ph.p_offset as usize;
        mapped.get(start..start.checked_add(ph.p_filesz as usize)?)
    })
}

fn read_build_id_note(header: &Header, mapped: &[u8]) -> Option<ElfId> {
    // lld normally creates 2 PT_NOTEs, ld/gold normally creates 1
    for note in iter_segments(header, mapped, goblin::elf::program_header::PT_NOTE) {
        if let Some(elf_id) = build_id_from_note(note) {
            return Some(elf_id);
        }
    }

    None
}

fn hash_first_page(mapped: &[u8]) -> Option<ElfId> {
    // Breakpad limits this to a 16-byte (GUID-ish) identifier and hard
    // codes a 4k page, so do the same for compatibility with its tooling
    let mut identifier = [0u8; 16];

    let first_page = &mapped[..std::cmp::min(mapped.len(), 4 * 1024)];

    // This intentionally disregards a trailing chunk shorter than 16 bytes
    for chunk in first_page.chunks_exact(16) {
        for (id, byte) in identifier.iter_mut().zip(chunk.iter()) {
            *id ^= *byte;
        }
    }

    ElfId::new(&identifier)
}

#[cfg(test)]
mod test {
    use super::*;

    // name size, desc size, kind, "GNU\0", then the id
    fn note_bytes(kind: u32, desc: &[u8]) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&4u32.to_ne_bytes());
        bytes.extend_from_slice(&(desc.len() as u32).to_ne_bytes());
        bytes.extend_from_slice(&kind.to_ne_bytes());
        bytes.extend_from_slice(b"GNU\0");
        bytes.extend_from_slice(desc);
        while bytes.len() % 4 != 0 {
            bytes.push(0);
        }
        bytes
    }

    #[test]
    fn finds_build_id_note() {
        let sha1 = [0xabu8; 20];

        // An unrelated note first, then the build id
        let mut section = note_bytes(goblin::elf::note::NT_GNU_ABI_TAG, &[0u8; 16]);
        section.extend_from_slice(&note_bytes(goblin::elf::note::NT_GNU_BUILD_ID, &sha1));

        let id = build_id_from_note(&section).unwrap();
        assert_eq!(id.as_ref(), &sha1);
    }

    #[test]
    fn no_build_id_note() {
        let section = note_bytes(goblin::elf::note::NT_GNU_ABI_TAG, &[0u8; 16]);
        assert!(build_id_from_note(&section).is_none());
    }

    #[test]
    fn identifies_own_executable() {
        let exe = std::fs::read("/proc/self/exe").unwrap();

        // Whether or not the linker embedded a build-id, some identifier
        // comes out
        let id = ElfId::from_mapped_image(&exe).unwrap();
        assert!(!id.as_ref().is_empty());

        assert!(ElfId::from_mapped_image(&exe[..4]).is_none());
    }
}
