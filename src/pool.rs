//! The pool: the engine that turns a [`PageProvider`] into a small-object
//! allocator with O(1) allocation and eager, same-page-only coalescing.
use std::collections::HashSet;

use log::trace;

use crate::error::{XvError, XvResult};
use crate::index::FreeListIndex;
use crate::page::{BlockHeader, Handle, LinkRecord, PageHeader, PageIndex, PageView};
use crate::provider::{PageArenaProvider, PageProvider, DEFAULT_ARENA_PAGES};
use crate::size_class::{
    class_index, class_of, floor_class, num_classes, size_of_class, BLOCK_HEADER_BYTES,
    PAGE_BYTES, PAGE_HEADER_BYTES, XV_MIN_ALLOC_SIZE,
};
use crate::stats::Stats;

/// Diagnostics from walking every owned page's block chain directly,
/// bypassing the pool's own bookkeeping. Byte-accounting stats can't
/// catch a tiling or coalescing bug — a wrong `prev_size` write, say,
/// moves no bytes in `Stats::bytes_allocated` — so tests that want to
/// check those invariants under random load need to read the pages
/// back out and check them directly, which is what this does.
#[derive(Debug, Default)]
pub struct WalkReport {
    /// Pages whose block chain didn't exactly tile `PAGE_BYTES - PAGE_HEADER_BYTES`.
    pub coverage_mismatches: Vec<PageIndex>,
    /// A free block immediately followed by another free block. Eager
    /// coalescing should never let this survive a `free` call.
    pub adjacent_frees: Vec<Handle>,
    /// Every block the walk found marked free, by its block-header handle.
    pub free_blocks: HashSet<Handle>,
    /// Every block reachable from the free-list index, by the same handle
    /// convention. Should equal `free_blocks` exactly.
    pub indexed_blocks: HashSet<Handle>,
}

impl WalkReport {
    /// True if the chain walk and the free-list index agree on exactly
    /// which blocks are free, and no page has an unmerged adjacent pair.
    pub fn is_consistent(&self) -> bool {
        self.coverage_mismatches.is_empty()
            && self.adjacent_frees.is_empty()
            && self.free_blocks == self.indexed_blocks
    }
}

/// A small-object allocator over pages supplied by `P`.
///
/// Single-threaded by design (see the crate's concurrency notes): every
/// operation runs to completion on the calling thread and the pool never
/// re-enters itself. Callers needing multi-threaded access wrap a `Pool`
/// in their own mutex.
pub struct Pool<P: PageProvider> {
    provider: P,
    index: FreeListIndex,
    stats: Stats,
}

impl<P: PageProvider> Pool<P> {
    pub fn new(provider: P) -> Self {
        Pool { provider, index: FreeListIndex::new(), stats: Stats::default() }
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    /// Walk every owned page's block chain and the free-list index and
    /// cross-check them. Not on the allocation hot path; meant for tests
    /// and debugging.
    pub fn debug_walk(&mut self) -> WalkReport {
        let mut report = WalkReport::default();

        for page in self.provider.owned_pages() {
            let mut covered = 0usize;
            let mut prev_was_free = false;
            let mut offset = PAGE_HEADER_BYTES as u16;

            loop {
                let (header, in_range) = self.provider.with_page(page, |bytes| {
                    let view = PageView::new(bytes);
                    (view.block_header(offset), (offset as usize) < PAGE_BYTES)
                });
                if !in_range {
                    break;
                }

                covered += header.this_size as usize;
                if header.this_free {
                    if prev_was_free {
                        report.adjacent_frees.push(Handle::new(page, offset));
                    }
                    report.free_blocks.insert(Handle::new(page, offset));
                }
                prev_was_free = header.this_free;

                let next = offset as usize + header.this_size as usize;
                if next >= PAGE_BYTES || header.this_size == 0 {
                    break;
                }
                offset = next as u16;
            }

            if covered != PAGE_BYTES - PAGE_HEADER_BYTES {
                report.coverage_mismatches.push(page);
            }
        }

        for class in 0..num_classes() {
            let mut cur = self.index.head(class);
            while let Some(h) = cur {
                report.indexed_blocks.insert(h);
                let link = self.provider.with_page(h.page(), |bytes| PageView::new(bytes).link(h.offset()));
                cur = link.next;
            }
        }

        report
    }

    /// Request a block that can hold `size` payload bytes.
    pub fn alloc(&mut self, size: usize) -> XvResult<Handle> {
        let (row, col) = class_of(size).ok_or(XvError::InvalidSize)?;
        let target = class_index(row, col);
        let req = size_of_class(target);

        if let Some(found) = self.index.find_fit(target) {
            return Ok(self.take_block(found, req));
        }

        let page = self.provider.acquire_page().ok_or(XvError::OutOfMemory)?;
        self.init_page(page);
        self.stats.record_page_acquired();

        let found = self
            .index
            .find_fit(target)
            .expect("a freshly initialized page satisfies any in-range request");
        Ok(self.take_block(found, req))
    }

    /// Zero `len` payload bytes at `handle`. `len` must not exceed the
    /// block's actual payload capacity.
    pub fn clear(&mut self, handle: Handle, len: usize) {
        let block_offset = handle.offset() - BLOCK_HEADER_BYTES as u16;
        self.provider.with_page(handle.page(), |bytes| {
            let mut view = PageView::new(bytes);
            let payload = view.payload_mut(block_offset, len as u16);
            payload.fill(0);
        });
    }

    /// Copy `out.len()` payload bytes at `handle` into `out`. `out.len()`
    /// must not exceed the block's actual payload capacity.
    pub fn read(&mut self, handle: Handle, out: &mut [u8]) {
        let block_offset = handle.offset() - BLOCK_HEADER_BYTES as u16;
        self.provider.with_page(handle.page(), |bytes| {
            let view = PageView::new(bytes);
            let payload = view.payload(block_offset, out.len() as u16);
            out.copy_from_slice(payload);
        });
    }

    /// Return a block previously returned by `alloc` on this pool.
    pub fn free(&mut self, handle: Handle) {
        let page = handle.page();
        let block_offset = handle.offset() - BLOCK_HEADER_BYTES as u16;

        let header = self.provider.with_page(page, |bytes| PageView::new(bytes).block_header(block_offset));
        let freed_bytes = header.this_size as usize;
        self.bump_in_use(page, -1);

        let mut merged_offset = block_offset;
        let mut merged_size = header.this_size as usize;

        // Forward merge: the next block, if free, is absorbed.
        let next_offset = merged_offset as usize + merged_size;
        if next_offset < PAGE_BYTES {
            let next_header =
                self.provider.with_page(page, |bytes| PageView::new(bytes).block_header(next_offset as u16));
            if next_header.this_free {
                let next_link =
                    self.provider.with_page(page, |bytes| PageView::new(bytes).link(next_offset as u16));
                let next_class = floor_class(next_header.this_size as usize);
                self.remove_from_free_list(next_class, next_link);
                merged_size += next_header.this_size as usize;
                self.stats.record_coalesce();
            }
        }

        // Backward merge: become the previous block if it is free.
        if header.prev_free {
            let prev_size = header.prev_size as usize;
            let prev_offset = merged_offset as usize - prev_size;
            let prev_link =
                self.provider.with_page(page, |bytes| PageView::new(bytes).link(prev_offset as u16));
            let prev_class = floor_class(prev_size);
            self.remove_from_free_list(prev_class, prev_link);
            merged_size += prev_size;
            merged_offset = prev_offset as u16;
            self.stats.record_coalesce();
        }

        let in_use_count = self.provider.with_page(page, |bytes| PageView::new(bytes).header().in_use_count);
        self.stats.record_free(freed_bytes);

        if in_use_count == 0 {
            trace!("page {} fully free, releasing to provider", page);
            self.provider.release_page(page);
            self.stats.record_page_released();
            return;
        }

        let after = merged_offset as usize + merged_size;
        if after < PAGE_BYTES {
            self.provider.with_page(page, |bytes| {
                let mut view = PageView::new(bytes);
                let mut neighbor = view.block_header(after as u16);
                neighbor.prev_free = true;
                neighbor.prev_size = merged_size as u16;
                view.set_block_header(after as u16, neighbor);
            });
        }

        self.provider.with_page(page, |bytes| {
            let mut view = PageView::new(bytes);
            let mut h = view.block_header(merged_offset);
            h.this_size = merged_size as u16;
            h.this_free = true;
            view.set_block_header(merged_offset, h);
        });

        let class = floor_class(merged_size);
        self.insert_into_free_list(class, page, merged_offset);
    }

    fn init_page(&mut self, page: PageIndex) {
        let block_offset = PAGE_HEADER_BYTES as u16;
        let this_size = (PAGE_BYTES - PAGE_HEADER_BYTES) as u16;
        self.provider.with_page(page, |bytes| {
            let mut view = PageView::new(bytes);
            view.set_header(PageHeader { in_use_count: 0 });
            view.set_block_header(
                block_offset,
                BlockHeader { this_size, prev_size: 0, this_free: true, prev_free: false },
            );
            view.set_link(block_offset, LinkRecord { next: None, prev: None });
        });
        let class = floor_class(this_size as usize);
        self.index.set_head(class, Some(Handle::new(page, block_offset)));
    }

    /// Take the head block of `class`, split it down to `req` bytes if
    /// the remainder would still be a valid block, and return the
    /// payload handle.
    fn take_block(&mut self, class: usize, req: usize) -> Handle {
        let head = self.index.head(class).expect("find_fit only returns classes with a head");
        let page = head.page();
        let offset = head.offset();

        let link = self.provider.with_page(page, |bytes| PageView::new(bytes).link(offset));
        self.remove_from_free_list(class, link);

        let split = self.provider.with_page(page, |bytes| {
            let mut view = PageView::new(bytes);
            let mut header = view.block_header(offset);
            header.this_free = false;
            let this_size = header.this_size as usize;
            let remainder = this_size - req;

            if remainder >= XV_MIN_ALLOC_SIZE {
                header.this_size = req as u16;
                view.set_block_header(offset, header);

                let new_offset = offset + req as u16;
                view.set_block_header(
                    new_offset,
                    BlockHeader {
                        this_size: remainder as u16,
                        prev_size: req as u16,
                        this_free: true,
                        prev_free: false,
                    },
                );
                view.set_link(new_offset, LinkRecord { next: None, prev: None });

                let after = new_offset as usize + remainder;
                if after < PAGE_BYTES {
                    let mut neighbor = view.block_header(after as u16);
                    neighbor.prev_free = true;
                    neighbor.prev_size = remainder as u16;
                    view.set_block_header(after as u16, neighbor);
                }
                Some((new_offset, remainder))
            } else {
                view.set_block_header(offset, header);
                let after = offset as usize + this_size;
                if after < PAGE_BYTES {
                    let mut neighbor = view.block_header(after as u16);
                    neighbor.prev_free = false;
                    view.set_block_header(after as u16, neighbor);
                }
                None
            }
        });

        if let Some((new_offset, remainder)) = split {
            let rem_class = floor_class(remainder);
            self.insert_into_free_list(rem_class, page, new_offset);
            self.stats.record_split();
        }

        self.bump_in_use(page, 1);
        self.stats.record_alloc(req);

        Handle::new(page, offset + BLOCK_HEADER_BYTES as u16)
    }

    fn bump_in_use(&mut self, page: PageIndex, delta: i32) {
        self.provider.with_page(page, |bytes| {
            let mut view = PageView::new(bytes);
            let mut header = view.header();
            header.in_use_count = (header.in_use_count as i32 + delta) as u16;
            view.set_header(header);
        });
    }

    /// Push `(page, offset)` onto the head of `class`'s free list.
    fn insert_into_free_list(&mut self, class: usize, page: PageIndex, offset: u16) {
        let old_head = self.index.head(class);
        self.provider.with_page(page, |bytes| {
            PageView::new(bytes).set_link(offset, LinkRecord { next: old_head, prev: None });
        });
        if let Some(h) = old_head {
            self.provider.with_page(h.page(), |bytes| {
                let mut view = PageView::new(bytes);
                let mut l = view.link(h.offset());
                l.prev = Some(Handle::new(page, offset));
                view.set_link(h.offset(), l);
            });
        }
        self.index.set_head(class, Some(Handle::new(page, offset)));
    }

    /// Splice a node with link record `link` out of `class`'s free list.
    /// Works whether the node is the head or an interior node, which
    /// coalescing relies on.
    fn remove_from_free_list(&mut self, class: usize, link: LinkRecord) {
        match link.prev {
            Some(p) => {
                self.provider.with_page(p.page(), |bytes| {
                    let mut view = PageView::new(bytes);
                    let mut l = view.link(p.offset());
                    l.next = link.next;
                    view.set_link(p.offset(), l);
                });
            }
            None => {
                self.index.set_head(class, link.next);
            }
        }
        if let Some(n) = link.next {
            self.provider.with_page(n.page(), |bytes| {
                let mut view = PageView::new(bytes);
                let mut l = view.link(n.offset());
                l.prev = link.prev;
                view.set_link(n.offset(), l);
            });
        }
    }
}

impl Pool<PageArenaProvider> {
    /// Create a pool backed by a fresh `mmap`-backed arena sized for
    /// [`DEFAULT_ARENA_PAGES`] pages.
    pub fn create_pool() -> XvResult<Box<Self>> {
        Self::create_pool_with_capacity(DEFAULT_ARENA_PAGES)
    }

    /// Create a pool backed by an arena sized for `capacity_pages` pages.
    pub fn create_pool_with_capacity(capacity_pages: usize) -> XvResult<Box<Self>> {
        let provider = PageArenaProvider::new(capacity_pages)?;
        Ok(Box::new(Pool::new(provider)))
    }

    /// Release every page the pool still owns. Equivalent to dropping
    /// the pool; kept as an explicit entry point for callers that prefer
    /// to name the lifecycle step.
    pub fn destroy_pool(self: Box<Self>) {
        drop(self);
    }
}
