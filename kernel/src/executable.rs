// User Executable Loading (ELF64)
//
// Parses statically linked ELF64 images and loads them into an
// environment's address space.
//
// Key responsibilities:
// - Validate the ELF header and every program header before mapping
// - Back each PT_LOAD segment with fresh frames, one per covered page
// - Copy file bytes and zero the in-memory tail (.bss)
// - Map the initial user stack page just below USTACKTOP
// - Point the environment's saved RIP at the image entry
//
// Design and implementation:
// - Copies go through the target address space itself: its root is made
//   active for the duration of the load, so segment addresses are used as
//   plain pointers, and the kernel root is reinstalled on every exit path
// - Headers are read with unaligned loads from the raw byte slice; the
//   image buffer carries no alignment promise
// - Segment permission flags are ignored; every page is P|W|U
//
// Safety and correctness notes:
// - Segments must lie entirely below UTOP and inside the image file
// - Two segments touching the same page are rejected rather than merged
// - A failed load leaves mapped pages in the address space; releasing the
//   environment reclaims them
//
// Limitations:
// - No relocation, no dynamic linking, no interpreter segments

use core::fmt;
use core::mem::size_of;
use core::ptr;

use x86_64::structures::paging::PhysFrame;
use x86_64::VirtAddr;

use crate::arch::Machine;
use crate::env::Env;
use crate::mm::addrspace::{AddressSpace, USER_RW};
use crate::mm::paging::MapError;
use crate::mm::{align_down, align_up, PAGE_SIZE, USTACKTOP, UTOP};
use crate::{log_debug, log_info};

const LOG_ORIGIN: &str = "exec";

/// "\x7FELF" read as a little-endian u32.
pub const ELF_MAGIC: u32 = 0x464C_457F;

pub const PT_LOAD: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageDefect {
    BadMagic,
    Truncated,
    FileSizeExceedsMemSize,
    OutsideUserRange,
    OverlappingSegments,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadError {
    MalformedImage(ImageDefect),
    OutOfMemory,
    NoAddressSpace,
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadError::MalformedImage(defect) => write!(f, "malformed image: {:?}", defect),
            LoadError::OutOfMemory => f.write_str("out of memory while loading"),
            LoadError::NoAddressSpace => f.write_str("environment has no address space"),
        }
    }
}

impl From<ImageDefect> for LoadError {
    fn from(defect: ImageDefect) -> Self {
        LoadError::MalformedImage(defect)
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct Elf64Header {
    e_ident: [u8; 16],
    e_type: u16,
    e_machine: u16,
    e_version: u32,
    e_entry: u64,
    e_phoff: u64,
    e_shoff: u64,
    e_flags: u32,
    e_ehsize: u16,
    e_phentsize: u16,
    e_phnum: u16,
    e_shentsize: u16,
    e_shnum: u16,
    e_shstrndx: u16,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ProgramHeader {
    pub p_type: u32,
    pub p_flags: u32,
    pub p_offset: u64,
    pub p_vaddr: u64,
    pub p_paddr: u64,
    pub p_filesz: u64,
    pub p_memsz: u64,
    pub p_align: u64,
}

const _: () = assert!(size_of::<Elf64Header>() == 64);
const _: () = assert!(size_of::<ProgramHeader>() == 56);

fn read_struct<T: Copy>(bytes: &[u8], offset: usize) -> Option<T> {
    let end = offset.checked_add(size_of::<T>())?;
    if end > bytes.len() {
        return None;
    }
    // SAFETY: bounds checked above; T is plain old data.
    Some(unsafe { ptr::read_unaligned(bytes.as_ptr().add(offset) as *const T) })
}

/// A validated view over an ELF64 image.
#[derive(Clone, Copy)]
pub struct ElfImage<'a> {
    bytes: &'a [u8],
    entry: u64,
    phoff: usize,
    phentsize: usize,
    phnum: usize,
}

impl<'a> ElfImage<'a> {
    pub fn parse(bytes: &'a [u8]) -> Result<Self, ImageDefect> {
        let header: Elf64Header = read_struct(bytes, 0).ok_or(ImageDefect::Truncated)?;

        let magic = u32::from_le_bytes([
            header.e_ident[0],
            header.e_ident[1],
            header.e_ident[2],
            header.e_ident[3],
        ]);
        if magic != ELF_MAGIC {
            return Err(ImageDefect::BadMagic);
        }

        let phentsize = header.e_phentsize as usize;
        if header.e_phnum > 0 && phentsize < size_of::<ProgramHeader>() {
            return Err(ImageDefect::Truncated);
        }

        let image = Self {
            bytes,
            entry: header.e_entry,
            phoff: header.e_phoff as usize,
            phentsize,
            phnum: header.e_phnum as usize,
        };

        let table_end = image
            .phnum
            .checked_mul(phentsize)
            .and_then(|size| size.checked_add(image.phoff))
            .ok_or(ImageDefect::Truncated)?;
        if table_end > bytes.len() {
            return Err(ImageDefect::Truncated);
        }

        for ph in image.loadable_segments() {
            validate_segment(&ph, bytes.len())?;
        }

        Ok(image)
    }

    pub fn entry(&self) -> u64 {
        self.entry
    }

    pub fn program_headers(&self) -> impl Iterator<Item = ProgramHeader> + 'a {
        let Self {
            bytes,
            phoff,
            phentsize,
            phnum,
            ..
        } = *self;
        (0..phnum).filter_map(move |index| read_struct(bytes, phoff + index * phentsize))
    }

    pub fn loadable_segments(&self) -> impl Iterator<Item = ProgramHeader> + 'a {
        self.program_headers().filter(|ph| ph.p_type == PT_LOAD)
    }

    fn file_bytes(&self, ph: &ProgramHeader) -> &'a [u8] {
        let start = ph.p_offset as usize;
        &self.bytes[start..start + ph.p_filesz as usize]
    }
}

fn validate_segment(ph: &ProgramHeader, image_len: usize) -> Result<(), ImageDefect> {
    if ph.p_filesz > ph.p_memsz {
        return Err(ImageDefect::FileSizeExceedsMemSize);
    }

    let file_end = ph
        .p_offset
        .checked_add(ph.p_filesz)
        .ok_or(ImageDefect::Truncated)?;
    if file_end > image_len as u64 {
        return Err(ImageDefect::Truncated);
    }

    let mem_end = ph
        .p_vaddr
        .checked_add(ph.p_memsz)
        .ok_or(ImageDefect::OutsideUserRange)?;
    if mem_end > UTOP {
        return Err(ImageDefect::OutsideUserRange);
    }

    Ok(())
}

/// Summary of a finished load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadedImage {
    pub entry: u64,
    pub segment_pages: usize,
}

/// Allocate and map one frame per page covering `[va, va + len)`. Frame
/// contents are left as the allocator hands them out.
fn region_alloc<M: Machine + ?Sized>(
    machine: &mut M,
    space: &mut AddressSpace,
    va: u64,
    len: u64,
) -> Result<usize, LoadError> {
    let start = align_down(va, PAGE_SIZE as u64);
    let end = align_up(va + len, PAGE_SIZE as u64);
    let mut pages = 0;

    for page in (start..end).step_by(PAGE_SIZE) {
        let frame = machine
            .allocate_frame(false)
            .map_err(|_| LoadError::OutOfMemory)?;

        if let Err(err) = space.map(machine, frame, VirtAddr::new_truncate(page), USER_RW) {
            machine.release_frame(frame);
            return Err(match err {
                MapError::OutOfMemory => LoadError::OutOfMemory,
                MapError::AlreadyMapped => ImageDefect::OverlappingSegments.into(),
                MapError::NotMapped | MapError::OutsideUserRange => {
                    ImageDefect::OutsideUserRange.into()
                }
            });
        }
        pages += 1;
    }

    Ok(pages)
}

/// Runs with `space` as the active translation root.
fn load_segments<M: Machine + ?Sized>(
    machine: &mut M,
    space: &mut AddressSpace,
    elf: &ElfImage<'_>,
) -> Result<usize, LoadError> {
    let mut segment_pages = 0;

    for ph in elf.loadable_segments() {
        segment_pages += region_alloc(machine, space, ph.p_vaddr, ph.p_memsz)?;

        let file = elf.file_bytes(&ph);
        let dst = VirtAddr::new_truncate(ph.p_vaddr);
        // SAFETY: region_alloc just mapped [p_vaddr, p_vaddr + p_memsz)
        // writable in the active root, and p_filesz <= p_memsz.
        unsafe {
            machine.copy_to_active(dst, file);
            machine.zero_active(dst + ph.p_filesz, (ph.p_memsz - ph.p_filesz) as usize);
        }

        log_debug!(
            LOG_ORIGIN,
            "segment va={:#x} filesz={:#x} memsz={:#x}",
            ph.p_vaddr,
            ph.p_filesz,
            ph.p_memsz
        );
    }

    region_alloc(machine, space, USTACKTOP - PAGE_SIZE as u64, PAGE_SIZE as u64)?;
    Ok(segment_pages)
}

/// Load `image` into `env`'s address space and set its entry point.
///
/// The environment's root is active while segments are copied; `kernel_root`
/// is reinstalled before returning, whether or not the load succeeded.
pub fn load<M: Machine + ?Sized>(
    machine: &mut M,
    kernel_root: PhysFrame,
    env: &mut Env,
    image: &[u8],
) -> Result<LoadedImage, LoadError> {
    let elf = ElfImage::parse(image)?;
    let space = env.address_space.as_mut().ok_or(LoadError::NoAddressSpace)?;

    // SAFETY: every environment root carries the kernel half of
    // `kernel_root`, so execution continues across both switches.
    unsafe { machine.switch_root(space.root()) };
    let result = load_segments(machine, space, &elf);
    unsafe { machine.switch_root(kernel_root) };
    let segment_pages = result?;

    env.saved_frame.rip = elf.entry();

    log_info!(
        LOG_ORIGIN,
        "env {:08x}: loaded {} segment pages, entry={:#x}",
        env.id,
        segment_pages,
        elf.entry()
    );

    Ok(LoadedImage {
        entry: elf.entry(),
        segment_pages,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::Cpu;
    use crate::env::{EnvId, EnvPool};
    use crate::mm::FrameAllocator;
    use crate::testing::{ElfBuilder, SimMachine};

    fn setup() -> (SimMachine, PhysFrame, EnvPool<4>, EnvId) {
        let mut sim = SimMachine::new();
        let root = sim.kernel_root();
        let mut pool = EnvPool::new();
        let id = pool.allocate(&mut sim, root, EnvId::CURRENT).unwrap().id;
        (sim, root, pool, id)
    }

    fn read_user(sim: &mut SimMachine, env: &Env, va: u64, len: usize) -> Vec<u8> {
        let mut out = vec![0u8; len];
        let saved = sim.active_root();
        unsafe {
            sim.switch_root(env.address_space.as_ref().unwrap().root());
            sim.copy_from_active(VirtAddr::new(va), &mut out);
            sim.switch_root(saved);
        }
        out
    }

    #[test]
    fn file_bytes_then_zeroed_tail() {
        let (mut sim, root, mut pool, id) = setup();
        let payload: Vec<u8> = (1..=10).collect();
        let image = ElfBuilder::new(0x80_0010)
            .segment(0x80_0000, &payload, 20)
            .build();

        let env = pool.lookup_mut(id, false).unwrap();
        load(&mut sim, root, env, &image).unwrap();

        let bytes = read_user(&mut sim, env, 0x80_0000, 20);
        assert_eq!(&bytes[..10], &payload[..]);
        assert!(bytes[10..].iter().all(|&b| b == 0));
        assert_eq!(env.saved_frame.rip, 0x80_0010);
    }

    #[test]
    fn bss_zeroing_crosses_page_boundaries() {
        let (mut sim, root, mut pool, id) = setup();
        let image = ElfBuilder::new(0x40_0000)
            .segment(0x40_0ff0, &[0xAB; 0x20], 0x2000)
            .build();

        let env = pool.lookup_mut(id, false).unwrap();
        let loaded = load(&mut sim, root, env, &image).unwrap();
        assert_eq!(loaded.segment_pages, 3);

        let bytes = read_user(&mut sim, env, 0x40_0ff0, 0x2000);
        assert!(bytes[..0x20].iter().all(|&b| b == 0xAB));
        assert!(bytes[0x20..].iter().all(|&b| b == 0));
    }

    #[test]
    fn frame_accounting_matches_mapped_size() {
        let (mut sim, root, mut pool, _) = setup();
        let before = sim.allocations();

        let id = pool.allocate(&mut sim, root, EnvId::CURRENT).unwrap().id;
        assert_eq!(sim.allocations() - before, 1, "one frame for the top-level table");

        // 0x3000 + 0x1800 bytes of segments, page aligned: 3 + 2 pages.
        let image = ElfBuilder::new(0x40_0000)
            .segment(0x40_0000, &[0x90; 0x100], 0x3000)
            .segment(0x60_0000, &[], 0x1800)
            .build();
        let env = pool.lookup_mut(id, false).unwrap();
        let after_build = sim.allocations();
        let loaded = load(&mut sim, root, env, &image).unwrap();

        assert_eq!(loaded.segment_pages, 5);
        let tables = sim.page_table_frames(env.address_space.as_ref().unwrap().root());
        // 5 segment pages + 1 stack page + intermediate tables
        assert_eq!(sim.allocations() - after_build, 5 + 1 + tables);
    }

    #[test]
    fn stack_page_sits_below_ustacktop() {
        let (mut sim, root, mut pool, id) = setup();
        let image = ElfBuilder::new(0x40_0000).segment(0x40_0000, &[1], 1).build();
        let env = pool.lookup_mut(id, false).unwrap();
        load(&mut sim, root, env, &image).unwrap();

        let space = env.address_space.as_ref().unwrap();
        let (_, flags) = space
            .translate(&sim, VirtAddr::new(USTACKTOP - 8))
            .expect("stack page mapped");
        assert!(flags.contains(USER_RW));
        assert!(space.translate(&sim, VirtAddr::new(USTACKTOP)).is_none());
        assert_eq!(env.saved_frame.rsp, USTACKTOP);
    }

    #[test]
    fn kernel_root_is_restored_on_success_and_failure() {
        let (mut sim, root, mut pool, id) = setup();
        let good = ElfBuilder::new(0x40_0000).segment(0x40_0000, &[1, 2, 3], 3).build();
        let env = pool.lookup_mut(id, false).unwrap();
        load(&mut sim, root, env, &good).unwrap();
        assert_eq!(sim.active_root(), root);

        let id2 = pool.allocate(&mut sim, root, EnvId::CURRENT).unwrap().id;
        let overlapping = ElfBuilder::new(0x40_0000)
            .segment(0x40_0000, &[1], 0x10)
            .segment(0x40_0800, &[2], 0x10)
            .build();
        let env2 = pool.lookup_mut(id2, false).unwrap();
        assert_eq!(
            load(&mut sim, root, env2, &overlapping),
            Err(LoadError::MalformedImage(ImageDefect::OverlappingSegments))
        );
        assert_eq!(sim.active_root(), root);
        assert_eq!(sim.switches_to(root), 2);
    }

    #[test]
    fn failed_load_is_fully_reclaimed_by_release() {
        let (mut sim, root, mut pool, id) = setup();
        pool.release(&mut sim, root, id).unwrap();
        let baseline = sim.free_frames();

        let id = pool.allocate(&mut sim, root, EnvId::CURRENT).unwrap().id;
        let overlapping = ElfBuilder::new(0)
            .segment(0x1000, &[1], 0x10)
            .segment(0x1008, &[2], 0x10)
            .build();
        let env = pool.lookup_mut(id, false).unwrap();
        assert!(load(&mut sim, root, env, &overlapping).is_err());

        pool.release(&mut sim, root, id).unwrap();
        assert_eq!(sim.free_frames(), baseline);
    }

    #[test]
    fn rejects_bad_magic() {
        let (mut sim, root, mut pool, id) = setup();
        let mut image = ElfBuilder::new(0x40_0000).segment(0x40_0000, &[1], 1).build();
        image[1] = b'X';

        let env = pool.lookup_mut(id, false).unwrap();
        let before = sim.allocations();
        assert_eq!(
            load(&mut sim, root, env, &image),
            Err(LoadError::MalformedImage(ImageDefect::BadMagic))
        );
        assert_eq!(sim.allocations(), before);
    }

    #[test]
    fn rejects_file_size_above_memory_size() {
        let image = ElfBuilder::new(0x40_0000).segment(0x40_0000, &[0; 32], 16).build();
        assert_eq!(
            ElfImage::parse(&image).err(),
            Some(ImageDefect::FileSizeExceedsMemSize)
        );
    }

    #[test]
    fn rejects_segments_reaching_the_kernel_half() {
        let image = ElfBuilder::new(0).segment(UTOP - 0x1000, &[], 0x2000).build();
        assert_eq!(ElfImage::parse(&image).err(), Some(ImageDefect::OutsideUserRange));

        let image = ElfBuilder::new(0).segment(u64::MAX - 4, &[], 0x10).build();
        assert_eq!(ElfImage::parse(&image).err(), Some(ImageDefect::OutsideUserRange));
    }

    #[test]
    fn rejects_truncated_images() {
        let image = ElfBuilder::new(0x40_0000).segment(0x40_0000, &[7; 64], 64).build();
        assert_eq!(ElfImage::parse(&image[..40]).err(), Some(ImageDefect::Truncated));
        assert_eq!(ElfImage::parse(&image[..100]).err(), Some(ImageDefect::Truncated));
        assert_eq!(
            ElfImage::parse(&image[..image.len() - 1]).err(),
            Some(ImageDefect::Truncated)
        );
    }

    #[test]
    fn non_load_segments_are_skipped() {
        let (mut sim, root, mut pool, id) = setup();
        let image = ElfBuilder::new(0x40_0000)
            .note(0x50_0000, 0x1000)
            .segment(0x40_0000, &[5], 1)
            .build();
        let elf = ElfImage::parse(&image).unwrap();
        assert_eq!(elf.program_headers().count(), 2);
        assert_eq!(elf.loadable_segments().count(), 1);

        let env = pool.lookup_mut(id, false).unwrap();
        let loaded = load(&mut sim, root, env, &image).unwrap();
        assert_eq!(loaded.segment_pages, 1);
        let space = env.address_space.as_ref().unwrap();
        assert!(space.translate(&sim, VirtAddr::new(0x50_0000)).is_none());
    }

    #[test]
    fn out_of_memory_is_reported() {
        let (mut sim, root, mut pool, id) = setup();
        let image = ElfBuilder::new(0x40_0000).segment(0x40_0000, &[1], 0x4000).build();
        let env = pool.lookup_mut(id, false).unwrap();
        sim.fail_allocations_after(2);

        assert_eq!(load(&mut sim, root, env, &image), Err(LoadError::OutOfMemory));
        assert_eq!(sim.active_root(), root);
    }
}
