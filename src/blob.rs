//! Multi-page blobs.
//!
//! A blob is split into `BlobData` chunks, one var-length item per page, and
//! committed by a single `BlobIndex` entry naming the chunk range. Chunk
//! indices come from one of two disjoint ranges so that overwriting a blob
//! can fully commit the new generation before the old one is torn down; a
//! power cut in between leaves either the old or the new value intact,
//! never a mix.

use crate::error::Error;
use crate::platform::Platform;
use crate::raw::{
    CHUNK_MAX_SIZE, ENTRY_SIZE, ItemData, ItemDataBlobIndex, ItemType, PageState, VerOffset,
};
use crate::storage::Storage;
use crate::{CHUNK_ANY, Key};
use alloc::vec::Vec;
use core::cmp;
#[cfg(feature = "defmt")]
use defmt::trace;

impl<T: Platform> Storage<T> {
    /// Writes a blob under the generation opposite to the committed one,
    /// then erases the old generation. Identical content short-circuits
    /// without touching the flash.
    pub(crate) fn write_blob(&mut self, ns_index: u8, key: &Key, data: &[u8]) -> Result<(), Error> {
        #[cfg(feature = "defmt")]
        trace!("write_blob: ns {} len {}", ns_index, data.len());

        let previous = self.find_optional(ns_index, ItemType::BlobIndex, key)?;
        let previous_start = previous
            .as_ref()
            .map(|slot| VerOffset::from(unsafe { slot.item.data.blob_index }.chunk_start));

        if previous.is_some() {
            match self.cmp_multi_page_blob(ns_index, key, data) {
                Ok(()) => return Ok(()),
                Err(Error::ContentDiffers) | Err(Error::NotFound) | Err(Error::CorruptedData) => {}
                Err(e) => return Err(e),
            }
        }

        let next_start = match previous_start {
            Some(version) => version.invert(),
            None => VerOffset::V0,
        };

        match self.write_multi_page_blob(ns_index, key, data, next_start) {
            Ok(()) => {}
            Err(Error::PageFull) => return Err(Error::NoSpace),
            Err(e) => return Err(e),
        }

        if previous_start.is_some() {
            self.erase_multi_page_blob(ns_index, key, previous_start)?;
        } else {
            // writers without index support stored the blob as one
            // single-page item; it is superseded now
            match self.find_item(ns_index, ItemType::Blob, Some(key), CHUNK_ANY, None) {
                Ok(legacy) => {
                    let span = legacy.item.span.max(1);
                    let Storage { hal, pm, .. } = self;
                    let pm = pm.as_mut().ok_or(Error::NotInitialized)?;
                    pm.page_mut(legacy.page).erase_item_at(hal, legacy.index, span)?;
                }
                Err(Error::NotFound) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Writes all chunks of one blob generation and commits them with the
    /// index entry. On failure the written chunks are erased best-effort;
    /// whatever survives is an orphan that the next init collects.
    pub(crate) fn write_multi_page_blob(
        &mut self,
        ns_index: u8,
        key: &Key,
        data: &[u8],
        chunk_start: VerOffset,
    ) -> Result<(), Error> {
        {
            let pm = self.pm.as_ref().ok_or(Error::NotInitialized)?;
            let max_pages = cmp::min(
                pm.page_count().saturating_sub(1),
                ((CHUNK_ANY - 1) / 2) as usize,
            );
            if data.len() > max_pages * CHUNK_MAX_SIZE {
                return Err(Error::ValueTooLong);
            }
        }

        let mut used: Vec<u32> = Vec::new();
        let result = self.write_blob_chunks(ns_index, key, data, chunk_start, &mut used);

        if result.is_err() {
            // Rollback addresses chunks from zero regardless of the
            // generation the write used; recovery reconciles the rest.
            for (sequential, &address) in used.iter().enumerate() {
                let Storage { hal, pm, .. } = self;
                let Some(pm) = pm.as_mut() else { break };
                let Some(pos) = pm.position_by_address(address) else {
                    continue;
                };
                if let Ok((index, item)) = pm.pages()[pos].find_item(
                    hal,
                    ns_index,
                    ItemType::BlobData,
                    Some(key),
                    0,
                    sequential as u8,
                    None,
                ) {
                    let _ = pm
                        .page_mut(pos)
                        .erase_item_at(hal, index, item.span.max(1));
                }
            }
        }
        result
    }

    fn write_blob_chunks(
        &mut self,
        ns_index: u8,
        key: &Key,
        data: &[u8],
        chunk_start: VerOffset,
        used: &mut Vec<u32>,
    ) -> Result<(), Error> {
        let mut chunk_count: u8 = 0;
        let mut remaining = data.len();
        let mut offset = 0usize;

        loop {
            let Storage { hal, pm, .. } = self;
            let pm = pm.as_mut().ok_or(Error::NotInitialized)?;
            let tailroom = pm.current().var_data_tailroom();

            if chunk_count == 0 && tailroom < data.len() && tailroom < CHUNK_MAX_SIZE / 10 {
                // Too little room to be worth splitting the first chunk
                // over; start on a fresh page instead.
                if pm.current().state() != PageState::Full {
                    pm.current_mut().set_state(hal, PageState::Full)?;
                }
                pm.request_new_page(hal)?;
                if pm.current().var_data_tailroom() == tailroom {
                    return Err(Error::NoSpace);
                }
                continue;
            }
            if tailroom == 0 {
                return Err(Error::NoSpace);
            }

            let chunk_size = cmp::min(remaining, tailroom);
            let chunk_index = chunk_start as u8 + chunk_count;
            let written = pm.current_mut().write_var_item(
                hal,
                ns_index,
                ItemType::BlobData,
                *key,
                Some(chunk_index),
                &data[offset..offset + chunk_size],
            );
            debug_assert!(
                !matches!(written, Err(Error::PageFull)),
                "tailroom guaranteed the chunk fits"
            );
            written?;

            chunk_count += 1;
            used.try_reserve(1).map_err(|_| Error::NoMem)?;
            used.push(pm.current().address);
            remaining -= chunk_size;
            offset += chunk_size;

            if remaining != 0 || tailroom - chunk_size < ENTRY_SIZE {
                if pm.current().state() != PageState::Full {
                    pm.current_mut().set_state(hal, PageState::Full)?;
                }
                pm.request_new_page(hal)?;
            }

            if remaining == 0 {
                let index_data = ItemData {
                    blob_index: ItemDataBlobIndex::new(
                        data.len() as u32,
                        chunk_count,
                        chunk_start as u8,
                    ),
                };
                let committed = pm.current_mut().write_item(
                    hal,
                    ns_index,
                    ItemType::BlobIndex,
                    *key,
                    None,
                    index_data,
                );
                debug_assert!(
                    !matches!(committed, Err(Error::PageFull)),
                    "the page rotation above left room for the index entry"
                );
                committed?;
                return Ok(());
            }
        }
    }

    /// Reads a committed blob. A missing chunk means an erase was cut short;
    /// the remains are dropped so the key reads consistently as absent.
    pub(crate) fn read_multi_page_blob(
        &mut self,
        ns_index: u8,
        key: &Key,
        buf: &mut [u8],
    ) -> Result<(), Error> {
        let slot = self.find_item(ns_index, ItemType::BlobIndex, Some(key), CHUNK_ANY, None)?;
        let index = unsafe { slot.item.data.blob_index };

        if buf.len() != index.data_size as usize {
            return Err(Error::InvalidArg);
        }

        let mut offset = 0usize;
        let mut complete = true;
        for chunk in 0..index.chunk_count {
            let chunk_index = index.chunk_start.wrapping_add(chunk);
            match self.find_item(ns_index, ItemType::BlobData, Some(key), chunk_index, None) {
                Ok(chunk_slot) => {
                    let size = unsafe { chunk_slot.item.data.var }.size as usize;
                    if offset + size > buf.len() {
                        return Err(Error::CorruptedData);
                    }
                    self.read_slot_payload(&chunk_slot, &mut buf[offset..offset + size])?;
                    offset += size;
                }
                Err(Error::NotFound) => {
                    complete = false;
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        if complete && offset == buf.len() {
            return Ok(());
        }

        let _ = self.erase_multi_page_blob(ns_index, key, None);
        Err(Error::NotFound)
    }

    /// `Ok(())` when the committed blob equals `data` byte for byte.
    pub(crate) fn cmp_multi_page_blob(
        &mut self,
        ns_index: u8,
        key: &Key,
        data: &[u8],
    ) -> Result<(), Error> {
        let slot = self.find_item(ns_index, ItemType::BlobIndex, Some(key), CHUNK_ANY, None)?;
        let index = unsafe { slot.item.data.blob_index };

        if data.len() != index.data_size as usize {
            return Err(Error::ContentDiffers);
        }

        let mut offset = 0usize;
        for chunk in 0..index.chunk_count {
            let chunk_index = index.chunk_start.wrapping_add(chunk);
            let chunk_slot =
                self.find_item(ns_index, ItemType::BlobData, Some(key), chunk_index, None)?;
            let size = unsafe { chunk_slot.item.data.var }.size as usize;
            if offset + size > data.len() {
                return Err(Error::ContentDiffers);
            }

            let Storage { hal, pm, .. } = self;
            let pm = pm.as_ref().ok_or(Error::NotInitialized)?;
            pm.pages()[chunk_slot.page].cmp_item(
                hal,
                chunk_slot.index,
                &chunk_slot.item,
                &data[offset..offset + size],
            )?;
            offset += size;
        }

        if offset != data.len() {
            return Err(Error::ContentDiffers);
        }
        Ok(())
    }

    /// Erases one blob generation. The index goes first: from that moment
    /// the chunks are orphans and even a crash mid-erase is repaired by the
    /// next init. Chunks already gone are skipped.
    pub(crate) fn erase_multi_page_blob(
        &mut self,
        ns_index: u8,
        key: &Key,
        chunk_start: Option<VerOffset>,
    ) -> Result<(), Error> {
        let slot = self.find_item(ns_index, ItemType::BlobIndex, Some(key), CHUNK_ANY, chunk_start)?;
        let index = unsafe { slot.item.data.blob_index };

        {
            let Storage { hal, pm, .. } = self;
            let pm = pm.as_mut().ok_or(Error::NotInitialized)?;
            pm.page_mut(slot.page)
                .erase_item_at(hal, slot.index, slot.item.span.max(1))?;
        }

        let start = match chunk_start {
            Some(version) => version as u8,
            None => index.chunk_start,
        };
        for chunk in 0..index.chunk_count {
            let chunk_index = start.wrapping_add(chunk);
            match self.find_item(ns_index, ItemType::BlobData, Some(key), chunk_index, None) {
                Ok(chunk_slot) => {
                    let Storage { hal, pm, .. } = self;
                    let pm = pm.as_mut().ok_or(Error::NotInitialized)?;
                    pm.page_mut(chunk_slot.page).erase_item_at(
                        hal,
                        chunk_slot.index,
                        chunk_slot.item.span.max(1),
                    )?;
                }
                Err(Error::NotFound) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}
