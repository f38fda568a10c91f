//! Page allocation, rotation and load-time repair.
//!
//! The manager keeps used pages in sequence order with the single ACTIVE
//! page at the back, and holds erased pages in a free heap. One free page is
//! always kept in reserve so a full page can be drained into it.

use crate::error::Error;
use crate::page::Page;
use crate::platform::Platform;
use crate::raw::{ENTRY_COUNT, EntryState, PageState, SECTOR_SIZE};
use crate::u24::u24;
use crate::{CHUNK_ANY, Key};
use alloc::collections::{BTreeMap, BinaryHeap};
use alloc::vec::Vec;
#[cfg(feature = "defmt")]
use defmt::{trace, warn};

pub(crate) struct PageManager {
    base_sector: u32,
    page_count: usize,
    pages: Vec<Page>,
    free_pages: BinaryHeap<Page>,
}

impl PageManager {
    /// Scans every sector of the partition and rebuilds a consistent page
    /// set: exactly one ACTIVE page, no half-moved FREEING page, and at most
    /// one live entry per item identity.
    pub(crate) fn load<T: Platform>(
        hal: &mut T,
        base_sector: u32,
        page_count: usize,
    ) -> Result<Self, Error> {
        #[cfg(feature = "defmt")]
        trace!("page_manager load: {} sectors @{}", page_count, base_sector);

        let mut manager = Self {
            base_sector,
            page_count,
            pages: Vec::new(),
            free_pages: BinaryHeap::new(),
        };
        manager
            .pages
            .try_reserve(page_count)
            .map_err(|_| Error::NoMem)?;

        for sector in 0..page_count {
            let address = ((base_sector as usize + sector) * SECTOR_SIZE) as u32;
            let page = Page::load(hal, address)?;
            match page.state() {
                PageState::Active | PageState::Full | PageState::Freeing => {
                    manager.pages.push(page)
                }
                _ => manager.free_pages.push(page),
            }
        }

        manager.pages.sort_by_key(Page::sequence);
        manager.ensure_single_active(hal)?;
        manager.resume_freeing(hal)?;
        if !manager.has_active() {
            manager.activate_free_page(hal)?;
        }
        manager.cleanup_duplicates(hal)?;
        Ok(manager)
    }

    /// Rotates in a fresh ACTIVE page. When only the spare free page
    /// remains, the used page with the most reclaimable entries is drained
    /// onto the new page first, which turns it into the next spare.
    pub(crate) fn request_new_page<T: Platform>(&mut self, hal: &mut T) -> Result<(), Error> {
        if self.free_pages.is_empty() {
            return Err(Error::NoSpace);
        }
        if self.free_pages.len() > 1 {
            return self.activate_free_page(hal);
        }

        let next_sequence = self.next_sequence();
        let victim = self
            .pages
            .iter()
            .enumerate()
            .filter(|(_, page)| page.state() == PageState::Full && page.erased_entries() > 0)
            .max_by_key(|(_, page)| {
                // weigh reclaimable entries over age, but let old sparsely
                // erased pages come up eventually for wear evening
                page.erased_entries() as u32 * 10 + (next_sequence - page.sequence())
            })
            .map(|(pos, _)| pos)
            .ok_or(Error::NoSpace)?;

        self.activate_free_page(hal)?;
        let mut source = self.pages.remove(victim);
        source.set_state(hal, PageState::Freeing)?;
        self.move_items(hal, source)
    }

    pub(crate) fn current(&self) -> &Page {
        self.pages
            .last()
            .expect("a loaded partition always has an active page")
    }

    pub(crate) fn current_mut(&mut self) -> &mut Page {
        self.pages
            .last_mut()
            .expect("a loaded partition always has an active page")
    }

    pub(crate) fn current_index(&self) -> usize {
        self.pages.len() - 1
    }

    pub(crate) fn pages(&self) -> &[Page] {
        &self.pages
    }

    pub(crate) fn page_mut(&mut self, index: usize) -> &mut Page {
        &mut self.pages[index]
    }

    pub(crate) fn position_by_address(&self, address: u32) -> Option<usize> {
        self.pages.iter().position(|page| page.address == address)
    }

    pub(crate) fn page_count(&self) -> usize {
        self.page_count
    }

    pub(crate) fn base_sector(&self) -> u32 {
        self.base_sector
    }

    /// (used entries, writable entries, total entries)
    pub(crate) fn fill_stats(&self) -> (usize, usize, usize) {
        let mut used = 0;
        let mut free = 0;
        for page in &self.pages {
            used += page.used_entries() as usize;
            if page.state() == PageState::Active {
                free += page.free_entries();
            }
        }
        free += self.free_pages.len() * ENTRY_COUNT;
        (used, free, self.page_count * ENTRY_COUNT)
    }

    fn has_active(&self) -> bool {
        self.pages
            .last()
            .is_some_and(|page| page.state() == PageState::Active)
    }

    fn next_sequence(&self) -> u32 {
        self.pages
            .iter()
            .map(Page::sequence)
            .max()
            .map_or(0, |sequence| sequence + 1)
    }

    /// An interrupted activation can leave more than one ACTIVE page behind;
    /// only the newest stays writable. The ACTIVE page also has to sit at
    /// the back of the list, where `current` expects it.
    fn ensure_single_active<T: Platform>(&mut self, hal: &mut T) -> Result<(), Error> {
        let mut keep: Option<(usize, u32)> = None;
        for (pos, page) in self.pages.iter().enumerate() {
            if page.state() != PageState::Active {
                continue;
            }
            match keep {
                Some((_, sequence)) if sequence >= page.sequence() => {}
                _ => keep = Some((pos, page.sequence())),
            }
        }
        let Some((keep, _)) = keep else {
            return Ok(());
        };

        for pos in 0..self.pages.len() {
            if pos != keep && self.pages[pos].state() == PageState::Active {
                #[cfg(feature = "defmt")]
                warn!(
                    "demoting duplicate active page @{:#08x}",
                    self.pages[pos].address
                );
                self.pages[pos].set_state(hal, PageState::Full)?;
            }
        }

        if keep != self.pages.len() - 1 {
            let page = self.pages.remove(keep);
            self.pages.push(page);
        }
        Ok(())
    }

    /// Completes a page move that was cut short by a power loss. Items are
    /// moved one at a time and erased from the source right after, so
    /// re-running the move picks up exactly where it stopped.
    fn resume_freeing<T: Platform>(&mut self, hal: &mut T) -> Result<(), Error> {
        let Some(pos) = self
            .pages
            .iter()
            .position(|page| page.state() == PageState::Freeing)
        else {
            return Ok(());
        };

        #[cfg(feature = "debug-logs")]
        println!("page_manager: resuming interrupted page move");

        let source = self.pages.remove(pos);
        if !self.has_active() {
            self.activate_free_page(hal)?;
        }
        self.move_items(hal, source)
    }

    fn move_items<T: Platform>(&mut self, hal: &mut T, mut source: Page) -> Result<(), Error> {
        let mut idx: u8 = 0;
        while (idx as usize) < ENTRY_COUNT {
            if source.entry_state(idx) != EntryState::Written {
                idx += 1;
                continue;
            }
            let item = match source.load_item(hal, idx) {
                Ok(item) => item,
                Err(Error::Flash) => return Err(Error::Flash),
                Err(_) => {
                    idx += 1;
                    continue;
                }
            };
            let span = item.span.max(1);
            let chunk = (item.chunk_index != CHUNK_ANY).then_some(item.chunk_index);

            let moved = if item.typ().is_variable() {
                match source.read_payload(hal, idx, &item) {
                    Ok(data) => self
                        .current_mut()
                        .write_var_item(hal, item.ns_index, item.typ(), item.key, chunk, &data)
                        .map(|_| ()),
                    // an unreadable payload is not worth carrying over
                    Err(Error::CorruptedData) => Ok(()),
                    Err(e) => return Err(e),
                }
            } else {
                self.current_mut()
                    .write_item(hal, item.ns_index, item.typ(), item.key, chunk, item.data)
                    .map(|_| ())
            };

            match moved {
                Ok(()) => {}
                Err(Error::PageFull) => return Err(Error::NoSpace),
                Err(e) => return Err(e),
            }

            source.erase_item_at(hal, idx, span)?;
            idx += span;
        }

        self.retire(hal, source)
    }

    fn activate_free_page<T: Platform>(&mut self, hal: &mut T) -> Result<(), Error> {
        let page = self.free_pages.pop().ok_or(Error::NoSpace)?;
        let mut page = if page.state() == PageState::Uninitialized {
            page
        } else {
            hal.erase(page.address, page.address + SECTOR_SIZE as u32)
                .map_err(|_| Error::Flash)?;
            Page::blank(page.address)
        };
        page.initialize(hal, self.next_sequence())?;
        self.pages.push(page);
        Ok(())
    }

    fn retire<T: Platform>(&mut self, hal: &mut T, page: Page) -> Result<(), Error> {
        hal.erase(page.address, page.address + SECTOR_SIZE as u32)
            .map_err(|_| Error::Flash)?;
        self.free_pages.push(Page::blank(page.address));
        Ok(())
    }

    /// A write commits its new entry before the superseded one is erased, so
    /// a crash between the two leaves both behind. Of every item identity
    /// only the newest copy survives, judged by page sequence and then slot
    /// order. This also settles the two-index window of a blob overwrite.
    fn cleanup_duplicates<T: Platform>(&mut self, hal: &mut T) -> Result<(), Error> {
        let mut by_hash: BTreeMap<u24, Vec<(usize, u8)>> = BTreeMap::new();
        for (pos, page) in self.pages.iter().enumerate() {
            for entry in page.hash_entries() {
                by_hash
                    .entry(entry.hash)
                    .or_default()
                    .push((pos, entry.index));
            }
        }

        let mut stale: Vec<(usize, u8, u8)> = Vec::new();
        for (_, candidates) in by_hash {
            if candidates.len() <= 1 {
                continue;
            }

            // hash collisions are possible, group by the full identity
            let mut groups: BTreeMap<(u8, u8, Key, u8), Vec<(u32, usize, u8, u8)>> =
                BTreeMap::new();
            for (pos, index) in candidates {
                let item = match self.pages[pos].load_item(hal, index) {
                    Ok(item) => item,
                    Err(Error::Flash) => return Err(Error::Flash),
                    Err(_) => continue,
                };
                groups
                    .entry((item.ns_index, item.typ() as u8, item.key, item.chunk_index))
                    .or_default()
                    .push((
                        self.pages[pos].sequence(),
                        pos,
                        index,
                        item.span.max(1),
                    ));
            }

            for (_, mut group) in groups {
                if group.len() <= 1 {
                    continue;
                }
                group.sort_by_key(|&(sequence, _, index, _)| (sequence, index));
                for &(_, pos, index, span) in group.iter().take(group.len() - 1) {
                    stale.push((pos, index, span));
                }
            }
        }

        for (pos, index, span) in stale {
            #[cfg(feature = "debug-logs")]
            println!("page_manager: erasing superseded duplicate at page {pos} entry {index}");
            self.pages[pos].erase_item_at(hal, index, span)?;
        }
        Ok(())
    }
}
