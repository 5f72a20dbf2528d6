//! Boot hand-off contract.
//!
//! The platform boot stub fills a [`BootInfo`] and jumps to `kmain`. Nothing
//! here is firmware-specific: the kernel only needs the physical memory map,
//! the image of the first environment and a verbosity switch.
//!
//! The stub must also leave the kernel running on a 4-level hierarchy whose
//! upper half (PML4 slots 256..512) maps the kernel image and a direct window
//! of physical memory at [`crate::mm::PHYS_OFFSET`]. That upper half becomes
//! the template every environment shares.

pub const EFI_CONVENTIONAL_MEMORY: u32 = 7;

#[repr(C)]
pub struct MemoryMap {
    pub buffer: *const u8,
    pub size: usize,
    pub descriptor_size: usize,
}

unsafe impl Send for MemoryMap {}
unsafe impl Sync for MemoryMap {}

impl MemoryMap {
    pub const fn new(buffer: *const u8, size: usize, descriptor_size: usize) -> Self {
        Self {
            buffer,
            size,
            descriptor_size,
        }
    }

    pub fn descriptors(&self) -> MemoryMapIter<'_> {
        MemoryMapIter {
            map: self,
            offset: 0,
        }
    }
}

pub struct MemoryMapIter<'a> {
    map: &'a MemoryMap,
    offset: usize,
}

impl<'a> Iterator for MemoryMapIter<'a> {
    type Item = &'a EfiMemoryDescriptor;

    fn next(&mut self) -> Option<Self::Item> {
        if self.map.descriptor_size == 0 || self.offset + self.map.descriptor_size > self.map.size {
            return None;
        }

        // SAFETY: the boot stub guarantees `buffer[..size]` holds whole descriptors.
        unsafe {
            let desc = self.map.buffer.add(self.offset) as *const EfiMemoryDescriptor;
            self.offset += self.map.descriptor_size;
            Some(&*desc)
        }
    }
}

#[repr(C)]
pub struct EfiMemoryDescriptor {
    pub typ: u32,
    pub pad: u32,
    pub physical_start: u64,
    pub virtual_start: u64,
    pub number_of_pages: u64,
    pub attribute: u64,
}

impl EfiMemoryDescriptor {
    pub fn is_usable(&self) -> bool {
        self.typ == EFI_CONVENTIONAL_MEMORY
    }
}

/// Raw bytes of an executable handed over by the boot stub.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct ExecutableImage {
    pub ptr: *const u8,
    pub size: usize,
}

impl ExecutableImage {
    pub const fn empty() -> Self {
        Self {
            ptr: core::ptr::null(),
            size: 0,
        }
    }

    pub fn is_present(&self) -> bool {
        !self.ptr.is_null() && self.size > 0
    }

    /// # Safety
    ///
    /// `ptr[..size]` must stay mapped and unmodified for `'a`.
    pub unsafe fn as_bytes<'a>(&self) -> &'a [u8] {
        if !self.is_present() {
            return &[];
        }
        core::slice::from_raw_parts(self.ptr, self.size)
    }
}

unsafe impl Send for ExecutableImage {}
unsafe impl Sync for ExecutableImage {}

#[repr(C)]
#[derive(Copy, Clone, Debug)]
pub enum BootMethod {
    Uefi,
    Legacy,
}

#[repr(C)]
pub struct BootInfo {
    pub memory_map: MemoryMap,
    pub init_image: ExecutableImage,
    pub boot_method: BootMethod,
    pub verbose: bool,
}
