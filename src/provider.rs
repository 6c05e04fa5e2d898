//! The page provider: the external collaborator that supplies whole
//! pages of backing memory and tracks which ones are checked out.
//!
//! The engine only ever talks to the [`PageProvider`] trait, so an
//! embedder that runs somewhere pages aren't permanently mapped (a
//! kernel, a remote store) can swap in their own implementation. The
//! default, [`PageArenaProvider`], reserves one large anonymous mapping
//! up front and hands out fixed-size slices of it; because the whole
//! arena stays mapped for the provider's lifetime, `map`/`unmap` around
//! each access degenerate to a direct slice borrow.
use log::warn;
use std::ptr::NonNull;

use crate::error::{XvError, XvResult};
use crate::page::PageIndex;
use crate::size_class::PAGE_BYTES;

/// Default number of pages an arena reserves when the caller doesn't ask
/// for a specific capacity. 16 MiB at the standard 4 KiB page size.
pub const DEFAULT_ARENA_PAGES: usize = 4096;

/// Supplies and reclaims whole pages for the pool to carve into blocks.
pub trait PageProvider {
    /// Reserve one page, returning its handle, or `None` if the provider
    /// is exhausted.
    fn acquire_page(&mut self) -> Option<PageIndex>;

    /// Return a page the caller no longer references.
    fn release_page(&mut self, page: PageIndex);

    /// Map `page` and run `f` against its bytes. The mapping is only
    /// guaranteed valid for the duration of the call.
    fn with_page<R>(&mut self, page: PageIndex, f: impl FnOnce(&mut [u8]) -> R) -> R;

    /// Every page currently checked out. Used by diagnostic walks that
    /// need to visit a pool's whole live state, not by the allocation
    /// path itself.
    fn owned_pages(&self) -> Vec<PageIndex>;
}

/// A most-significant-bit-first bitmap over page indices, used to find
/// the lowest free page in O(words) time.
///
/// Bit 0 of a word is its most significant bit, matching the convention
/// [`crate::index::FreeListIndex`] uses for its own bitmaps, applied
/// uniformly rather than mixing MSB- and LSB-first arithmetic between a
/// word and its remainder the way the harness this design descends from
/// once did.
struct PageBitmap {
    words: Vec<u64>,
    capacity: usize,
}

impl PageBitmap {
    fn new(capacity: usize) -> Self {
        let num_words = (capacity + 63) / 64;
        PageBitmap { words: vec![0; num_words], capacity }
    }

    fn bit_mask(bit: usize) -> u64 {
        1u64 << (63 - bit)
    }

    fn set(&mut self, idx: usize) {
        self.words[idx / 64] |= Self::bit_mask(idx % 64);
    }

    fn clear(&mut self, idx: usize) {
        self.words[idx / 64] &= !Self::bit_mask(idx % 64);
    }

    fn find_first_unset(&self) -> Option<usize> {
        for (word_idx, word) in self.words.iter().enumerate() {
            let inverted = !word;
            if inverted != 0 {
                let bit = inverted.leading_zeros() as usize;
                let idx = word_idx * 64 + bit;
                if idx < self.capacity {
                    return Some(idx);
                }
            }
        }
        None
    }

    fn set_indices(&self) -> Vec<usize> {
        let mut out = Vec::new();
        for (word_idx, &word) in self.words.iter().enumerate() {
            let mut remaining = word;
            while remaining != 0 {
                let bit = remaining.leading_zeros() as usize;
                let idx = word_idx * 64 + bit;
                if idx < self.capacity {
                    out.push(idx);
                }
                remaining &= !Self::bit_mask(bit);
            }
        }
        out
    }
}

/// A single large anonymous mapping, sliced into `PAGE_BYTES` pages and
/// handed out/reclaimed via a bitmap.
pub struct PageArenaProvider {
    arena: NonNull<u8>,
    capacity_pages: usize,
    bitmap: PageBitmap,
}

impl PageArenaProvider {
    /// Reserve an arena sized for `capacity_pages` pages.
    pub fn new(capacity_pages: usize) -> XvResult<Self> {
        assert!(capacity_pages > 0 && capacity_pages < PageIndex::MAX as usize);
        let len = capacity_pages * PAGE_BYTES;
        let arena = os::map_anonymous(len)?;
        Ok(PageArenaProvider { arena, capacity_pages, bitmap: PageBitmap::new(capacity_pages) })
    }

    pub fn capacity_pages(&self) -> usize {
        self.capacity_pages
    }

    pub fn pages_in_use(&self) -> usize {
        self.bitmap.words.iter().map(|w| w.count_ones() as usize).sum()
    }
}

impl PageProvider for PageArenaProvider {
    fn acquire_page(&mut self) -> Option<PageIndex> {
        let idx = self.bitmap.find_first_unset()?;
        self.bitmap.set(idx);
        Some(idx as PageIndex)
    }

    fn release_page(&mut self, page: PageIndex) {
        self.bitmap.clear(page as usize);
    }

    fn owned_pages(&self) -> Vec<PageIndex> {
        self.bitmap.set_indices().into_iter().map(|idx| idx as PageIndex).collect()
    }

    fn with_page<R>(&mut self, page: PageIndex, f: impl FnOnce(&mut [u8]) -> R) -> R {
        debug_assert!((page as usize) < self.capacity_pages);
        let offset = page as usize * PAGE_BYTES;
        let slice = unsafe {
            std::slice::from_raw_parts_mut(self.arena.as_ptr().add(offset), PAGE_BYTES)
        };
        f(slice)
    }
}

impl Drop for PageArenaProvider {
    fn drop(&mut self) {
        let len = self.capacity_pages * PAGE_BYTES;
        if let Err(err) = unsafe { os::unmap(self.arena, len) } {
            warn!("failed to release page arena: {}", err);
        }
    }
}

#[cfg(unix)]
mod os {
    use super::*;
    use libc::{mmap, munmap, MAP_ANONYMOUS, MAP_PRIVATE, PROT_READ, PROT_WRITE};
    use std::ptr::null_mut;

    pub fn map_anonymous(len: usize) -> XvResult<NonNull<u8>> {
        let p = unsafe {
            mmap(null_mut(), len, PROT_READ | PROT_WRITE, MAP_PRIVATE | MAP_ANONYMOUS, -1, 0)
        };
        if p == libc::MAP_FAILED {
            warn!("mmap failed: {}, len {}", errno::errno(), len);
            return Err(XvError::OutOfMemory);
        }
        Ok(NonNull::new(p as *mut u8).expect("mmap returned non-null on success"))
    }

    pub unsafe fn unmap(p: NonNull<u8>, len: usize) -> Result<(), errno::Errno> {
        if munmap(p.as_ptr() as *mut libc::c_void, len) == -1 {
            Err(errno::errno())
        } else {
            Ok(())
        }
    }
}

#[cfg(windows)]
mod os {
    use super::*;
    use std::ptr::null_mut;
    use winapi::um::errhandlingapi::GetLastError;
    use winapi::um::memoryapi::{VirtualAlloc, VirtualFree};
    use winapi::um::winnt::{MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_READWRITE};

    pub fn map_anonymous(len: usize) -> XvResult<NonNull<u8>> {
        let p = unsafe { VirtualAlloc(null_mut(), len, MEM_RESERVE | MEM_COMMIT, PAGE_READWRITE) };
        if p.is_null() {
            warn!("VirtualAlloc failed: error {}, len {}", unsafe { GetLastError() }, len);
            return Err(XvError::OutOfMemory);
        }
        Ok(NonNull::new(p as *mut u8).expect("VirtualAlloc returned non-null on success"))
    }

    pub unsafe fn unmap(p: NonNull<u8>, _len: usize) -> Result<(), u32> {
        if VirtualFree(p.as_ptr() as *mut _, 0, MEM_RELEASE) == 0 {
            Err(GetLastError())
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_and_release_cycle_reuses_lowest_index() {
        let mut provider = PageArenaProvider::new(8).unwrap();
        let a = provider.acquire_page().unwrap();
        let b = provider.acquire_page().unwrap();
        assert_eq!(a, 0);
        assert_eq!(b, 1);
        provider.release_page(a);
        let c = provider.acquire_page().unwrap();
        assert_eq!(c, 0);
    }

    #[test]
    fn owned_pages_reflects_acquire_and_release() {
        let mut provider = PageArenaProvider::new(4).unwrap();
        let a = provider.acquire_page().unwrap();
        let b = provider.acquire_page().unwrap();
        assert_eq!(provider.owned_pages(), vec![a, b]);
        provider.release_page(a);
        assert_eq!(provider.owned_pages(), vec![b]);
    }

    #[test]
    fn exhausts_after_capacity() {
        let mut provider = PageArenaProvider::new(2).unwrap();
        assert!(provider.acquire_page().is_some());
        assert!(provider.acquire_page().is_some());
        assert!(provider.acquire_page().is_none());
    }

    #[test]
    fn with_page_sees_a_full_page_of_zeroed_bytes() {
        let mut provider = PageArenaProvider::new(1).unwrap();
        let page = provider.acquire_page().unwrap();
        provider.with_page(page, |bytes| {
            assert_eq!(bytes.len(), PAGE_BYTES);
            assert!(bytes.iter().all(|&b| b == 0));
            bytes[0] = 42;
        });
        provider.with_page(page, |bytes| assert_eq!(bytes[0], 42));
    }
}
