//! Address Space - Per-Process Page Classification
//!
//! An address space knows, for every virtual page, where a never-resident
//! copy of it comes from: a page of an executable section, or nothing at
//! all (stack, heap and the argument page are zero-filled). The mutable
//! translation state lives in the frame manager's core map; this type is
//! immutable once built and can be shared freely between the threads of a
//! process.

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::error::ImageError;
use crate::kern::loader::{ExecutableImage, ProcessLayout};
use crate::types::{AddressSpaceId, Vpn};
use crate::vm::pmap::{PageTable, TranslationEntry};

/// Where the first copy of a page comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageOrigin {
    /// Page `page` of image section `section`
    Section {
        section: usize,
        page: usize,
        read_only: bool,
    },
    /// Stack, heap or argument page
    Anonymous,
}

impl PageOrigin {
    pub fn is_read_only(&self) -> bool {
        matches!(self, PageOrigin::Section { read_only: true, .. })
    }
}

/// Virtual address space of one process
pub struct AddressSpace {
    id: AddressSpaceId,
    page_size: usize,
    layout: ProcessLayout,
    origins: Vec<PageOrigin>,
    image: Arc<dyn ExecutableImage>,
}

impl AddressSpace {
    /// Lay out an address space for `image`
    pub fn new(
        image: Arc<dyn ExecutableImage>,
        stack_pages: usize,
        page_size: usize,
    ) -> Result<Self, ImageError> {
        let layout = ProcessLayout::compute(image.as_ref(), stack_pages, page_size)?;

        let mut origins = Vec::with_capacity(layout.num_pages);
        for (section, info) in layout.sections.iter().enumerate() {
            origins.extend((0..info.length).map(|page| PageOrigin::Section {
                section,
                page,
                read_only: info.read_only,
            }));
        }
        // Everything past the sections is anonymous
        origins.resize(layout.num_pages, PageOrigin::Anonymous);

        Ok(Self {
            id: AddressSpaceId::new(),
            page_size,
            layout,
            origins,
            image,
        })
    }

    pub fn id(&self) -> AddressSpaceId {
        self.id
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn num_pages(&self) -> usize {
        self.origins.len()
    }

    /// Size in bytes
    pub fn size(&self) -> usize {
        self.num_pages() * self.page_size
    }

    pub fn layout(&self) -> &ProcessLayout {
        &self.layout
    }

    pub fn image(&self) -> &Arc<dyn ExecutableImage> {
        &self.image
    }

    /// Virtual page containing `vaddr`, if inside the address space
    pub fn page_of(&self, vaddr: usize) -> Option<Vpn> {
        let index = vaddr / self.page_size;
        (index < self.num_pages()).then(|| Vpn(index as u32))
    }

    /// Offset of `vaddr` within its page
    pub fn offset_of(&self, vaddr: usize) -> usize {
        vaddr % self.page_size
    }

    /// First byte of `vpn`
    pub fn vaddr_of(&self, vpn: Vpn) -> usize {
        vpn.index() * self.page_size
    }

    /// Classify `vpn`
    pub fn origin(&self, vpn: Vpn) -> Option<PageOrigin> {
        self.origins.get(vpn.index()).copied()
    }

    /// Is `vpn` part of a read-only section?
    pub fn is_read_only(&self, vpn: Vpn) -> bool {
        self.origin(vpn).is_some_and(|o| o.is_read_only())
    }

    /// Translation table with every page unmapped
    pub fn initial_page_table(&self) -> PageTable {
        let entries = self
            .origins
            .iter()
            .enumerate()
            .map(|(i, origin)| TranslationEntry::new(Vpn(i as u32), origin.is_read_only()))
            .collect();
        PageTable::new(self.id, entries)
    }

    /// Copy the image page backing `vpn` into `frame`
    ///
    /// Returns false, leaving `frame` untouched, for anonymous pages.
    pub fn load_section_page(&self, vpn: Vpn, frame: &mut [u8]) -> bool {
        match self.origin(vpn) {
            Some(PageOrigin::Section { section, page, .. }) => {
                self.image.load_page(section, page, frame);
                true
            }
            _ => false,
        }
    }
}

impl core::fmt::Debug for AddressSpace {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AddressSpace")
            .field("id", &self.id)
            .field("page_size", &self.page_size)
            .field("num_pages", &self.num_pages())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kern::loader::MemoryImage;

    fn space() -> AddressSpace {
        let image = MemoryImage::new(64)
            .with_filled_section(".text", true, 2, 0x11)
            .with_filled_section(".data", false, 1, 0x22);
        AddressSpace::new(Arc::new(image), 2, 64).unwrap()
    }

    #[test]
    fn test_classification() {
        let space = space();
        assert_eq!(space.num_pages(), 6);
        assert_eq!(
            space.origin(Vpn(1)),
            Some(PageOrigin::Section {
                section: 0,
                page: 1,
                read_only: true
            })
        );
        assert_eq!(
            space.origin(Vpn(2)),
            Some(PageOrigin::Section {
                section: 1,
                page: 0,
                read_only: false
            })
        );
        assert_eq!(space.origin(Vpn(3)), Some(PageOrigin::Anonymous));
        assert_eq!(space.origin(Vpn(5)), Some(PageOrigin::Anonymous));
        assert_eq!(space.origin(Vpn(6)), None);
        assert!(space.is_read_only(Vpn(0)));
        assert!(!space.is_read_only(Vpn(2)));
    }

    #[test]
    fn test_address_arithmetic() {
        let space = space();
        assert_eq!(space.page_of(130), Some(Vpn(2)));
        assert_eq!(space.offset_of(130), 2);
        assert_eq!(space.page_of(space.size() - 1), Some(Vpn(5)));
        assert_eq!(space.page_of(space.size()), None);
        assert_eq!(space.vaddr_of(Vpn(3)), 192);
    }

    #[test]
    fn test_initial_page_table() {
        let space = space();
        let table = space.initial_page_table();
        assert_eq!(table.len(), 6);
        assert_eq!(table.space(), space.id());
        assert_eq!(table.resident_count(), 0);
        assert!(table.get(Vpn(0)).unwrap().read_only);
        assert!(!table.get(Vpn(4)).unwrap().read_only);
    }

    #[test]
    fn test_load_section_page() {
        let space = space();
        let mut frame = [0u8; 64];
        assert!(space.load_section_page(Vpn(2), &mut frame));
        assert!(frame.iter().all(|&b| b == 0x22));

        let mut frame = [7u8; 64];
        assert!(!space.load_section_page(Vpn(4), &mut frame));
        assert!(frame.iter().all(|&b| b == 7));
    }
}
