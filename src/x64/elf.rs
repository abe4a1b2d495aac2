//! ELF64 Executable Generation
//!
//! Generates minimal Linux x86-64 ELF executables.
//! No external linker required.
//!
//! The image is a 64-byte ELF header, two PT_LOAD program headers (text
//! and BSS), and the text payload. The whole file is mapped at the text
//! virtual address, so the text segment's file offset is zero and the
//! entry point skips past the headers to the first emitted instruction.

use std::fs::File;
use std::io::{self, Write};
use std::path::Path;

/// ELF64 file constants
pub mod consts {
    // ELF magic number
    pub const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];

    // ELF class
    pub const ELFCLASS64: u8 = 2;

    // Data encoding
    pub const ELFDATA2LSB: u8 = 1; // Little endian

    // ELF version
    pub const EV_CURRENT: u8 = 1;

    // OS/ABI
    pub const ELFOSABI_NONE: u8 = 0; // UNIX System V ABI

    // Object file type
    pub const ET_EXEC: u16 = 2; // Executable file

    // Machine type
    pub const EM_X86_64: u16 = 62;

    // Program header types
    pub const PT_LOAD: u32 = 1;

    // Program header flags
    pub const PF_X: u32 = 1; // Execute
    pub const PF_W: u32 = 2; // Write
    pub const PF_R: u32 = 4; // Read

    // Header sizes
    pub const ELF64_EHDR_SIZE: u16 = 64;
    pub const ELF64_PHDR_SIZE: u16 = 56;

    /// Virtual address of the text segment (System V psABI convention)
    pub const TEXT_VADDR: u64 = 0x400000;

    /// Virtual address of the BSS segment, disjoint from the text range
    pub const BSS_VADDR: u64 = 0x600000;

    /// Segment alignment (2 MiB pages)
    pub const SEGMENT_ALIGN: u64 = 0x200000;

    /// File offset of the text payload: ELF header + two program headers
    pub const TEXT_OFFSET: u64 = ELF64_EHDR_SIZE as u64 + 2 * ELF64_PHDR_SIZE as u64;
}

/// ELF64 file header
#[derive(Debug, Clone)]
pub struct Elf64Header {
    pub e_type: u16,      // Object file type
    pub e_machine: u16,   // Machine type
    pub e_version: u32,   // Object file version
    pub e_entry: u64,     // Entry point address
    pub e_phoff: u64,     // Program header offset
    pub e_shoff: u64,     // Section header offset
    pub e_flags: u32,     // Processor-specific flags
    pub e_ehsize: u16,    // ELF header size
    pub e_phentsize: u16, // Program header entry size
    pub e_phnum: u16,     // Number of program headers
    pub e_shentsize: u16, // Section header entry size
    pub e_shnum: u16,     // Number of section headers
    pub e_shstrndx: u16,  // Section name string table index
}

impl Default for Elf64Header {
    fn default() -> Self {
        Self {
            e_type: consts::ET_EXEC,
            e_machine: consts::EM_X86_64,
            e_version: consts::EV_CURRENT as u32,
            e_entry: 0,
            e_phoff: consts::ELF64_EHDR_SIZE as u64,
            e_shoff: 0, // No section headers for minimal executable
            e_flags: 0,
            e_ehsize: consts::ELF64_EHDR_SIZE,
            e_phentsize: consts::ELF64_PHDR_SIZE,
            e_phnum: 2,
            e_shentsize: 0,
            e_shnum: 0,
            e_shstrndx: 0,
        }
    }
}

impl Elf64Header {
    pub fn write<W: Write>(&self, w: &mut W) -> io::Result<()> {
        // e_ident (16 bytes)
        w.write_all(&consts::ELF_MAGIC)?;
        w.write_all(&[consts::ELFCLASS64])?; // EI_CLASS
        w.write_all(&[consts::ELFDATA2LSB])?; // EI_DATA
        w.write_all(&[consts::EV_CURRENT])?; // EI_VERSION
        w.write_all(&[consts::ELFOSABI_NONE])?; // EI_OSABI
        w.write_all(&[0u8; 8])?; // EI_PAD

        // Rest of header
        w.write_all(&self.e_type.to_le_bytes())?;
        w.write_all(&self.e_machine.to_le_bytes())?;
        w.write_all(&self.e_version.to_le_bytes())?;
        w.write_all(&self.e_entry.to_le_bytes())?;
        w.write_all(&self.e_phoff.to_le_bytes())?;
        w.write_all(&self.e_shoff.to_le_bytes())?;
        w.write_all(&self.e_flags.to_le_bytes())?;
        w.write_all(&self.e_ehsize.to_le_bytes())?;
        w.write_all(&self.e_phentsize.to_le_bytes())?;
        w.write_all(&self.e_phnum.to_le_bytes())?;
        w.write_all(&self.e_shentsize.to_le_bytes())?;
        w.write_all(&self.e_shnum.to_le_bytes())?;
        w.write_all(&self.e_shstrndx.to_le_bytes())?;

        Ok(())
    }
}

/// ELF64 program header
#[derive(Debug, Clone)]
pub struct Elf64ProgramHeader {
    pub p_type: u32,   // Segment type
    pub p_flags: u32,  // Segment flags
    pub p_offset: u64, // Segment file offset
    pub p_vaddr: u64,  // Segment virtual address
    pub p_paddr: u64,  // Segment physical address
    pub p_filesz: u64, // Segment size in file
    pub p_memsz: u64,  // Segment size in memory
    pub p_align: u64,  // Segment alignment
}

impl Elf64ProgramHeader {
    pub fn write<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(&self.p_type.to_le_bytes())?;
        w.write_all(&self.p_flags.to_le_bytes())?;
        w.write_all(&self.p_offset.to_le_bytes())?;
        w.write_all(&self.p_vaddr.to_le_bytes())?;
        w.write_all(&self.p_paddr.to_le_bytes())?;
        w.write_all(&self.p_filesz.to_le_bytes())?;
        w.write_all(&self.p_memsz.to_le_bytes())?;
        w.write_all(&self.p_align.to_le_bytes())?;
        Ok(())
    }
}

/// ELF64 executable builder: text section + BSS size -> executable image
#[derive(Debug, Default)]
pub struct Elf64Builder {
    text: Vec<u8>,
    bss_size: u32,
}

impl Elf64Builder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the text section (raw machine code)
    pub fn text(mut self, text: Vec<u8>) -> Self {
        self.text = text;
        self
    }

    /// Set the size of the zero-initialized BSS segment
    pub fn bss_size(mut self, size: u32) -> Self {
        self.bss_size = size;
        self
    }

    /// Build the complete ELF file
    pub fn build(self) -> Vec<u8> {
        let text_size = self.text.len() as u64;

        let ehdr = Elf64Header {
            e_entry: consts::TEXT_VADDR + consts::TEXT_OFFSET,
            ..Default::default()
        };

        // Text: the whole file is mapped, so the offset is zero and the
        // entry point accounts for the header bytes.
        let text_phdr = Elf64ProgramHeader {
            p_type: consts::PT_LOAD,
            p_flags: consts::PF_R | consts::PF_X,
            p_offset: 0,
            p_vaddr: consts::TEXT_VADDR,
            p_paddr: consts::TEXT_VADDR,
            p_filesz: text_size,
            p_memsz: text_size,
            p_align: consts::SEGMENT_ALIGN,
        };

        // BSS: nothing in the file image; the kernel zero-fills memsz bytes.
        let bss_phdr = Elf64ProgramHeader {
            p_type: consts::PT_LOAD,
            p_flags: consts::PF_R | consts::PF_W | consts::PF_X,
            p_offset: 0,
            p_vaddr: consts::BSS_VADDR,
            p_paddr: consts::BSS_VADDR,
            p_filesz: 0,
            p_memsz: self.bss_size as u64,
            p_align: consts::SEGMENT_ALIGN,
        };

        let mut buf = Vec::with_capacity(consts::TEXT_OFFSET as usize + self.text.len());
        ehdr.write(&mut buf).unwrap();
        text_phdr.write(&mut buf).unwrap();
        bss_phdr.write(&mut buf).unwrap();
        buf.extend_from_slice(&self.text);

        buf
    }
}

/// Write an executable image to disk and set the executable bit (Unix).
pub fn write_executable(path: &Path, image: &[u8]) -> io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(image)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = file.metadata()?.permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(path, perms)?;
    }

    Ok(())
}
