//! Physical Map (pmap) - Per-Process Translation Table
//!
//! Translation is a flat array indexed by virtual page number. There is no
//! hardware behind it: the fault handler and the copy routines consult it
//! directly, and every update happens under the frame manager's core-map
//! lock so it stays consistent with the inverted table.
//!
//! ## Page States
//!
//! ```text
//! Unmapped --fault--> ResidentClean  (read-only section page)
//!          --fault--> ResidentDirty  (writable section page or anonymous)
//! ResidentClean --evict--> Unmapped  (dropped, reloaded from the image)
//! ResidentDirty --evict--> InTransit --> Evicted (contents in a swap slot)
//! Evicted --fault--> InTransit --> ResidentDirty (slot freed)
//! ```

use alloc::vec::Vec;

use crate::types::{AddressSpaceId, Ppn, SwapSlot, Vpn};

// ============================================================================
// Translation Entry
// ============================================================================

/// Mapping record for one virtual page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TranslationEntry {
    /// Virtual page this entry maps
    pub vpn: Vpn,
    /// Frame holding the page; meaningful only while `valid`
    pub ppn: Ppn,
    /// A frame is currently mapped
    pub valid: bool,
    /// Page belongs to a read-only section
    pub read_only: bool,
    /// Reference bit, cleared by the clock scan
    pub used: bool,
    /// Contents cannot be recovered from the image; they go through swap
    pub dirty: bool,
    /// Slot holding the contents while evicted
    pub swap_slot: Option<SwapSlot>,
    /// A thread is paging this page in or out
    pub in_transit: bool,
}

impl TranslationEntry {
    /// Entry for a page that has never been resident
    pub const fn new(vpn: Vpn, read_only: bool) -> Self {
        Self {
            vpn,
            ppn: Ppn(0),
            valid: false,
            read_only,
            used: false,
            dirty: false,
            swap_slot: None,
            in_transit: false,
        }
    }

    /// Must this page be written to swap before its frame is reused?
    pub const fn needs_swap(&self) -> bool {
        self.dirty && !self.read_only
    }

    /// Current lifecycle state
    pub fn state(&self) -> PageState {
        if self.in_transit {
            PageState::InTransit
        } else if self.valid && self.dirty {
            PageState::ResidentDirty
        } else if self.valid {
            PageState::ResidentClean
        } else if self.swap_slot.is_some() {
            PageState::Evicted
        } else {
            PageState::Unmapped
        }
    }
}

/// Lifecycle state of a virtual page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageState {
    /// No frame and nothing in swap
    Unmapped,
    /// Mapped and reloadable from the image
    ResidentClean,
    /// Mapped and modified or anonymous
    ResidentDirty,
    /// Not mapped; contents held in a swap slot
    Evicted,
    /// Being paged in or out
    InTransit,
}

// ============================================================================
// Page Table
// ============================================================================

/// Flat translation table of one address space
#[derive(Debug, Clone)]
pub struct PageTable {
    space: AddressSpaceId,
    entries: Vec<TranslationEntry>,
}

impl PageTable {
    /// Create a table from its entries, which must be in vpn order
    pub fn new(space: AddressSpaceId, entries: Vec<TranslationEntry>) -> Self {
        debug_assert!(entries.iter().enumerate().all(|(i, e)| e.vpn.index() == i));
        Self { space, entries }
    }

    /// Owning address space
    pub fn space(&self) -> AddressSpaceId {
        self.space
    }

    pub fn get(&self, vpn: Vpn) -> Option<&TranslationEntry> {
        self.entries.get(vpn.index())
    }

    pub fn get_mut(&mut self, vpn: Vpn) -> Option<&mut TranslationEntry> {
        self.entries.get_mut(vpn.index())
    }

    /// Number of pages
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TranslationEntry> {
        self.entries.iter()
    }

    /// Pages currently backed by a frame
    pub fn resident_count(&self) -> usize {
        self.entries.iter().filter(|e| e.valid).count()
    }

    /// Swap slots held by evicted pages
    pub fn swap_slots(&self) -> impl Iterator<Item = SwapSlot> + '_ {
        self.entries.iter().filter_map(|e| e.swap_slot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    #[test]
    fn test_entry_states() {
        let mut entry = TranslationEntry::new(Vpn(3), false);
        assert_eq!(entry.state(), PageState::Unmapped);

        entry.valid = true;
        assert_eq!(entry.state(), PageState::ResidentClean);

        entry.dirty = true;
        assert_eq!(entry.state(), PageState::ResidentDirty);
        assert!(entry.needs_swap());

        entry.valid = false;
        entry.in_transit = true;
        assert_eq!(entry.state(), PageState::InTransit);

        entry.in_transit = false;
        entry.swap_slot = Some(SwapSlot(0));
        assert_eq!(entry.state(), PageState::Evicted);
    }

    #[test]
    fn test_read_only_never_needs_swap() {
        let mut entry = TranslationEntry::new(Vpn(0), true);
        entry.valid = true;
        entry.dirty = true;
        assert!(!entry.needs_swap());
    }

    #[test]
    fn test_page_table() {
        let space = AddressSpaceId::new();
        let mut table = PageTable::new(
            space,
            vec![
                TranslationEntry::new(Vpn(0), true),
                TranslationEntry::new(Vpn(1), false),
            ],
        );
        assert_eq!(table.len(), 2);
        assert_eq!(table.space(), space);
        assert!(table.get(Vpn(2)).is_none());

        table.get_mut(Vpn(1)).unwrap().valid = true;
        table.get_mut(Vpn(0)).unwrap().swap_slot = Some(SwapSlot(4));
        assert_eq!(table.resident_count(), 1);
        assert_eq!(table.swap_slots().collect::<Vec<_>>(), vec![SwapSlot(4)]);
    }
}
