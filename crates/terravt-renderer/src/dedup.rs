//! Page Deduplication
//!
//! Turns a raw page-ID readback into the list of distinct pages to make
//! resident, and orders it so coarse pages are rendered first.

use ahash::AHashSet;

use terravt_core::codec::PageId;
use terravt_core::{BackgroundJob, ImageKey, VtResult};

/// Distinct non-empty page IDs of `readback`, plus the whole-image page of
/// every allocated image so each image always has a coarsest fallback
pub fn deduplicate(readback: &[u32], images: &[ImageKey], capacity: usize) -> Vec<u32> {
    let mut unique: AHashSet<u32> = AHashSet::with_capacity(capacity);
    unique.extend(readback.iter().copied().filter(|&packed| packed != 0));
    unique.extend(
        images
            .iter()
            .map(|image| PageId::whole_image(image.x, image.z, image.size).pack()),
    );
    unique.into_iter().collect()
}

/// Order pages by `size_log2 - mip`, whole-image pages first
pub fn sort_by_priority(pages: &mut [u32]) {
    pages.sort_unstable_by_key(|&packed| (PageId::unpack(packed).priority(), packed));
}

/// Run [`deduplicate`] on a worker thread
pub fn spawn_deduplicate(
    readback: Vec<u32>,
    images: Vec<ImageKey>,
    capacity: usize,
) -> VtResult<BackgroundJob<Vec<u32>>> {
    BackgroundJob::spawn("vt-deduplicate", move || {
        let _span = tracing::trace_span!("vt.deduplicate_job").entered();
        deduplicate(&readback, &images, capacity)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(x: u32, z: u32, size: u32) -> ImageKey {
        ImageKey { x, z, size }
    }

    #[test]
    fn test_deduplicate_drops_empty_and_repeats() {
        let a = PageId::new(5, 6, 0, 3).pack();
        let b = PageId::new(2, 3, 1, 3).pack();
        let mut pages = deduplicate(&[0, a, b, a, 0, b, a], &[], 16);
        pages.sort_unstable();
        let mut expected = vec![a, b];
        expected.sort_unstable();
        assert_eq!(pages, expected);
    }

    #[test]
    fn test_deduplicate_adds_whole_image_pages() {
        let images = [key(0, 0, 256), key(256, 0, 8), key(264, 8, 8)];
        let pages: AHashSet<u32> = deduplicate(&[], &images, 16).into_iter().collect();

        assert_eq!(pages.len(), 3);
        assert!(pages.contains(&PageId::new(0, 0, 8, 8).pack()));
        assert!(pages.contains(&PageId::new(32, 0, 3, 3).pack()));
        assert!(pages.contains(&PageId::new(33, 1, 3, 3).pack()));
    }

    #[test]
    fn test_whole_image_page_already_requested() {
        let whole = PageId::new(1, 1, 4, 4).pack();
        let pages = deduplicate(&[whole, whole], &[key(16, 16, 16)], 4);
        assert_eq!(pages, vec![whole]);
    }

    #[test]
    fn test_sort_puts_coarse_pages_first() {
        let fine = PageId::new(10, 10, 0, 5).pack();
        let middle = PageId::new(2, 2, 2, 5).pack();
        let whole = PageId::new(0, 0, 3, 3).pack();
        let mut pages = vec![fine, middle, whole];
        sort_by_priority(&mut pages);
        assert_eq!(pages, vec![whole, middle, fine]);
    }

    #[test]
    fn test_background_deduplicate() {
        let page = PageId::new(1, 2, 0, 3).pack();
        let job = spawn_deduplicate(vec![page, 0, page], Vec::new(), 8).unwrap();
        assert_eq!(job.name(), "vt-deduplicate");
        assert_eq!(job.join().unwrap(), vec![page]);
    }
}
