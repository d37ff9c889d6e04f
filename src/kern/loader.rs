//! Executable Image Loader Interface
//!
//! The paging code never parses executables. It consumes an image through
//! the `ExecutableImage` capability: a list of sections, each covering a
//! run of virtual pages, and a way to copy one page of a section into a
//! physical frame.
//!
//! `ProcessLayout` turns an image into the address space shape every
//! process gets:
//!
//! ```text
//! vpn 0                                                   num_pages
//! | section 0 | section 1 | ... | stack (stack_pages) | argv (1) |
//!                                ^ anonymous, zero-filled on demand
//! ```

use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::config::ARGUMENT_PAGES;
use crate::error::ImageError;
use crate::types::Vpn;

// ============================================================================
// Section Description
// ============================================================================

/// One loadable section of an executable
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionInfo {
    /// Section name (e.g. ".text")
    pub name: String,
    /// First virtual page covered
    pub first_vpn: Vpn,
    /// Length in pages
    pub length: usize,
    /// Code and constant data are read-only
    pub read_only: bool,
}

impl SectionInfo {
    /// Does this section cover `vpn`?
    pub fn contains(&self, vpn: Vpn) -> bool {
        let first = self.first_vpn.index();
        (first..first + self.length).contains(&vpn.index())
    }

    /// One past the last page
    pub fn end_vpn(&self) -> Vpn {
        Vpn(self.first_vpn.0 + self.length as u32)
    }
}

// ============================================================================
// Executable Image Capability
// ============================================================================

/// A loaded executable, as seen by the pager
pub trait ExecutableImage: Send + Sync {
    /// Number of sections
    fn section_count(&self) -> usize;

    /// Describe section `index`
    fn section(&self, index: usize) -> Option<SectionInfo>;

    /// Copy page `page` of section `section` into `frame`
    ///
    /// `frame` is exactly one page long. Bytes past the end of the
    /// section's file data must be zeroed.
    fn load_page(&self, section: usize, page: usize, frame: &mut [u8]);
}

// ============================================================================
// In-Memory Image
// ============================================================================

/// Executable image held in memory
///
/// Sections are laid out back to back from vpn 0 in the order they are
/// added. Counts page loads so callers can observe reloads.
#[derive(Debug)]
pub struct MemoryImage {
    page_size: usize,
    sections: Vec<(SectionInfo, Vec<u8>)>,
    loads: AtomicU64,
}

impl MemoryImage {
    /// Create an image with no sections
    pub fn new(page_size: usize) -> Self {
        Self {
            page_size,
            sections: Vec::new(),
            loads: AtomicU64::new(0),
        }
    }

    /// Append a section holding `data`, padded to whole pages
    ///
    /// An empty `data` still occupies one zero page.
    pub fn with_section(mut self, name: &str, read_only: bool, data: &[u8]) -> Self {
        let first_vpn = self
            .sections
            .last()
            .map(|(info, _)| info.end_vpn())
            .unwrap_or(Vpn(0));
        let length = data.len().div_ceil(self.page_size).max(1);
        self.sections.push((
            SectionInfo {
                name: name.into(),
                first_vpn,
                length,
                read_only,
            },
            data.to_vec(),
        ));
        self
    }

    /// Append a section of `pages` pages filled with `fill`
    pub fn with_filled_section(self, name: &str, read_only: bool, pages: usize, fill: u8) -> Self {
        let data = vec![fill; pages * self.page_size];
        self.with_section(name, read_only, &data)
    }

    /// Raw bytes of one page of a section, zero padded
    pub fn page_bytes(&self, section: usize, page: usize) -> Vec<u8> {
        let mut frame = vec![0u8; self.page_size];
        self.copy_page(section, page, &mut frame);
        frame
    }

    /// Total pages loaded through `load_page`
    pub fn load_count(&self) -> u64 {
        self.loads.load(Ordering::Relaxed)
    }

    fn copy_page(&self, section: usize, page: usize, frame: &mut [u8]) {
        frame.fill(0);
        let Some((_, data)) = self.sections.get(section) else {
            return;
        };
        let start = page * self.page_size;
        if start < data.len() {
            let end = (start + self.page_size).min(data.len());
            frame[..end - start].copy_from_slice(&data[start..end]);
        }
    }
}

impl ExecutableImage for MemoryImage {
    fn section_count(&self) -> usize {
        self.sections.len()
    }

    fn section(&self, index: usize) -> Option<SectionInfo> {
        self.sections.get(index).map(|(info, _)| info.clone())
    }

    fn load_page(&self, section: usize, page: usize, frame: &mut [u8]) {
        self.copy_page(section, page, frame);
        self.loads.fetch_add(1, Ordering::Relaxed);
    }
}

// ============================================================================
// Process Layout
// ============================================================================

/// Address space shape derived from an image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessLayout {
    /// Sections in image order
    pub sections: Vec<SectionInfo>,
    /// Pages covered by sections
    pub section_pages: usize,
    /// Stack pages
    pub stack_pages: usize,
    /// Total pages: sections + stack + argument page
    pub num_pages: usize,
    /// Initial stack pointer (top of the stack)
    pub initial_sp: usize,
    /// Page holding argv
    pub argv_vpn: Vpn,
}

impl ProcessLayout {
    /// Lay out `image`, checking sections are contiguous from vpn 0
    pub fn compute(
        image: &dyn ExecutableImage,
        stack_pages: usize,
        page_size: usize,
    ) -> Result<Self, ImageError> {
        let mut sections = Vec::with_capacity(image.section_count());
        let mut next = Vpn(0);

        for index in 0..image.section_count() {
            let info = image
                .section(index)
                .ok_or(ImageError::NoSuchSection(index))?;
            if info.length == 0 {
                return Err(ImageError::EmptySection(index));
            }
            if info.first_vpn != next {
                return Err(ImageError::Fragmented {
                    section: index,
                    expected: next,
                    found: info.first_vpn,
                });
            }
            next = info.end_vpn();
            sections.push(info);
        }

        let section_pages = next.index();
        let num_pages = section_pages + stack_pages + ARGUMENT_PAGES;

        Ok(Self {
            sections,
            section_pages,
            stack_pages,
            num_pages,
            initial_sp: (section_pages + stack_pages) * page_size,
            argv_vpn: Vpn((num_pages - 1) as u32),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Image whose sections are described explicitly
    struct FixedImage(Vec<SectionInfo>);

    impl ExecutableImage for FixedImage {
        fn section_count(&self) -> usize {
            self.0.len()
        }

        fn section(&self, index: usize) -> Option<SectionInfo> {
            self.0.get(index).cloned()
        }

        fn load_page(&self, _section: usize, _page: usize, frame: &mut [u8]) {
            frame.fill(0xAA);
        }
    }

    fn section(first: u32, length: usize) -> SectionInfo {
        SectionInfo {
            name: ".data".into(),
            first_vpn: Vpn(first),
            length,
            read_only: false,
        }
    }

    #[test]
    fn test_memory_image_layout() {
        let image = MemoryImage::new(64)
            .with_section(".text", true, &[1u8; 100])
            .with_section(".data", false, &[]);

        let text = image.section(0).unwrap();
        assert_eq!(text.first_vpn, Vpn(0));
        assert_eq!(text.length, 2);
        assert!(text.read_only);

        let data = image.section(1).unwrap();
        assert_eq!(data.first_vpn, Vpn(2));
        assert_eq!(data.length, 1);
        assert!(data.contains(Vpn(2)));
        assert!(!data.contains(Vpn(3)));
    }

    #[test]
    fn test_load_page_pads_with_zero() {
        let image = MemoryImage::new(64).with_section(".text", true, &[7u8; 80]);
        let mut frame = [0xFFu8; 64];
        image.load_page(0, 1, &mut frame);
        assert!(frame[..16].iter().all(|&b| b == 7));
        assert!(frame[16..].iter().all(|&b| b == 0));
        assert_eq!(image.load_count(), 1);
    }

    #[test]
    fn test_layout() {
        let image = MemoryImage::new(64)
            .with_filled_section(".text", true, 2, 1)
            .with_filled_section(".data", false, 1, 2);
        let layout = ProcessLayout::compute(&image, 4, 64).unwrap();
        assert_eq!(layout.section_pages, 3);
        assert_eq!(layout.num_pages, 8);
        assert_eq!(layout.initial_sp, 7 * 64);
        assert_eq!(layout.argv_vpn, Vpn(7));
    }

    #[test]
    fn test_layout_rejects_fragmented() {
        let image = FixedImage(vec![section(0, 1), section(2, 1)]);
        assert_eq!(
            ProcessLayout::compute(&image, 1, 64),
            Err(ImageError::Fragmented {
                section: 1,
                expected: Vpn(1),
                found: Vpn(2),
            })
        );
    }

    #[test]
    fn test_layout_rejects_empty_section() {
        let image = FixedImage(vec![section(0, 0)]);
        assert_eq!(
            ProcessLayout::compute(&image, 1, 64),
            Err(ImageError::EmptySection(0))
        );
    }

    #[test]
    fn test_image_without_sections() {
        let image = MemoryImage::new(64);
        let layout = ProcessLayout::compute(&image, 2, 64).unwrap();
        assert_eq!(layout.num_pages, 3);
        assert_eq!(layout.section_pages, 0);
    }
}
