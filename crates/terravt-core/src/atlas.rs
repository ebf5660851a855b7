//! Virtual Image Atlas
//!
//! Quadtree allocator over the indirection texture's page address space.
//! Every tracked sector owns one square, size-aligned region whose side is
//! the sector's current virtual image size in pages.
//!
//! Nodes are stored implicitly: index 0 is the root and the children of node
//! `n` are `4n + 1 ..= 4n + 4` (origin, +x, +z, +x+z). The deepest level holds
//! minimal-size images and has no occupancy counter.

use ahash::AHashMap;
use smallvec::SmallVec;

use crate::config::VirtualTextureConfig;
use crate::math::{ceil_log2, Sector};

/// Region of the indirection address space owned by one sector
///
/// `size == 0` means the sector has no image yet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ImageInfo {
    /// Quadtree node index
    pub node_index: u32,
    /// Region origin in mip-0 pages
    pub x: u32,
    pub z: u32,
    /// Region side in pages
    pub size: u32,
}

/// Identity of an allocated region, independent of its node index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ImageKey {
    pub x: u32,
    pub z: u32,
    pub size: u32,
}

impl ImageInfo {
    pub fn is_allocated(&self) -> bool {
        self.size > 0
    }

    pub fn key(&self) -> ImageKey {
        ImageKey {
            x: self.x,
            z: self.z,
            size: self.size,
        }
    }

    pub fn size_log2(&self) -> u32 {
        ceil_log2(self.size)
    }

    /// True if the two regions share at least one page
    pub fn overlaps(&self, other: &ImageInfo) -> bool {
        self.x < other.x + other.size
            && other.x < self.x + self.size
            && self.z < other.z + other.size
            && other.z < self.z + self.size
    }
}

#[derive(Debug, Clone, Copy)]
struct TraversalNode {
    index: u32,
    x: u32,
    z: u32,
    size: u32,
}

/// Quadtree allocator for per-sector virtual images
#[derive(Debug)]
pub struct VirtualImageAtlas {
    /// Side of the address space in pages
    atlas_size: u32,
    /// Side of the smallest image in pages
    minimal_size: u32,
    page_size_shift: u32,
    used_self: Vec<bool>,
    used_children: Vec<u32>,
    sector_to_image: AHashMap<Sector, ImageInfo>,
}

impl VirtualImageAtlas {
    /// Create an atlas of `atlas_size` pages per side whose smallest image is
    /// `minimal_image_size` texels
    pub fn new(atlas_size: u32, page_size_shift: u32, minimal_image_size: u32) -> Self {
        let minimal_size = (minimal_image_size >> page_size_shift).max(1);
        debug_assert!(atlas_size.is_power_of_two() && minimal_size.is_power_of_two());
        debug_assert!(minimal_size <= atlas_size);

        let mut internal_count = 0usize;
        let mut level_count = 1usize;
        let mut node_size = atlas_size;
        while node_size > minimal_size {
            internal_count += level_count;
            node_size >>= 1;
            level_count <<= 2;
        }

        log::debug!(
            "Virtual image atlas: {atlas_size} pages, minimal image {minimal_size} pages, {} nodes",
            internal_count + level_count
        );

        Self {
            atlas_size,
            minimal_size,
            page_size_shift,
            used_self: vec![false; internal_count + level_count],
            used_children: vec![0; internal_count],
            sector_to_image: AHashMap::new(),
        }
    }

    pub fn from_config(config: &VirtualTextureConfig) -> Self {
        Self::new(
            config.indirection_texture_size,
            config.page_size_shift,
            config.minimal_virtual_image_size,
        )
    }

    /// Side of the address space in pages
    pub fn atlas_size(&self) -> u32 {
        self.atlas_size
    }

    /// Side of the smallest image in pages
    pub fn minimal_size(&self) -> u32 {
        self.minimal_size
    }

    pub fn node_count(&self) -> usize {
        self.used_self.len()
    }

    /// Allocate a region for `sector` holding an image of `image_size` texels
    ///
    /// Returns `None` when the request is not a power of two, is outside the
    /// supported range, or no free region of that size is left. On success the
    /// sector's recorded image is replaced; the previous region stays claimed
    /// until [`Self::remove_image`] frees it.
    pub fn insert_image(&mut self, sector: Sector, image_size: u32) -> Option<ImageInfo> {
        if !image_size.is_power_of_two() {
            return None;
        }
        let requested = image_size >> self.page_size_shift;
        if requested < self.minimal_size || requested > self.atlas_size {
            return None;
        }

        let mut stack: SmallVec<[TraversalNode; 32]> = SmallVec::new();
        stack.push(TraversalNode {
            index: 0,
            x: 0,
            z: 0,
            size: self.atlas_size,
        });

        while let Some(node) = stack.pop() {
            if self.used_self[node.index as usize] {
                continue;
            }

            if node.size > requested {
                let half = node.size >> 1;
                let first_child = node.index * 4 + 1;
                stack.push(TraversalNode { index: first_child + 3, x: node.x + half, z: node.z + half, size: half });
                stack.push(TraversalNode { index: first_child + 2, x: node.x, z: node.z + half, size: half });
                stack.push(TraversalNode { index: first_child + 1, x: node.x + half, z: node.z, size: half });
                stack.push(TraversalNode { index: first_child, x: node.x, z: node.z, size: half });
            } else if requested == self.minimal_size || self.used_children[node.index as usize] == 0 {
                self.mark(node.index, true);
                let info = ImageInfo {
                    node_index: node.index,
                    x: node.x,
                    z: node.z,
                    size: node.size,
                };
                self.sector_to_image.insert(sector, info);
                return Some(info);
            }
        }

        None
    }

    /// Free the region of `image` without touching the sector mapping
    pub fn remove_image(&mut self, image: &ImageInfo) {
        if !image.is_allocated() {
            return;
        }
        debug_assert!(
            self.used_self[image.node_index as usize],
            "freeing unclaimed atlas node {}",
            image.node_index
        );
        self.mark(image.node_index, false);
    }

    /// Free the sector's current region and forget the sector
    pub fn remove_sector(&mut self, sector: Sector) -> bool {
        match self.sector_to_image.remove(&sector) {
            Some(image) => {
                self.remove_image(&image);
                true
            }
            None => false,
        }
    }

    /// Most recently allocated image of `sector`
    pub fn image_info(&self, sector: Sector) -> Option<ImageInfo> {
        self.sector_to_image.get(&sector).copied()
    }

    pub fn is_node_used(&self, index: u32) -> bool {
        self.used_self.get(index as usize).copied().unwrap_or(false)
    }

    /// Number of occupied strict descendants of an internal node
    pub fn used_children(&self, index: u32) -> u32 {
        self.used_children.get(index as usize).copied().unwrap_or(0)
    }

    /// Number of claimed regions
    pub fn occupied_count(&self) -> usize {
        self.used_children(0) as usize + self.is_node_used(0) as usize
    }

    /// Every claimed region, reconstructed from the occupancy array
    pub fn occupied_nodes(&self) -> Vec<ImageInfo> {
        self.used_self
            .iter()
            .enumerate()
            .filter(|(_, used)| **used)
            .map(|(index, _)| self.node_region(index as u32))
            .collect()
    }

    /// Region covered by a node index
    pub fn node_region(&self, index: u32) -> ImageInfo {
        let mut path: SmallVec<[u32; 16]> = SmallVec::new();
        let mut n = index;
        while n > 0 {
            path.push((n - 1) % 4);
            n = (n - 1) / 4;
        }

        let (mut x, mut z, mut size) = (0, 0, self.atlas_size);
        for quadrant in path.iter().rev() {
            size >>= 1;
            x += (quadrant & 1) * size;
            z += (quadrant >> 1) * size;
        }
        ImageInfo {
            node_index: index,
            x,
            z,
            size,
        }
    }

    fn mark(&mut self, index: u32, used: bool) {
        self.used_self[index as usize] = used;
        let mut n = index;
        while n > 0 {
            n = (n - 1) / 4;
            let counter = &mut self.used_children[n as usize];
            if used {
                *counter += 1;
            } else {
                debug_assert!(*counter > 0, "occupancy underflow at node {n}");
                *counter = counter.saturating_sub(1);
            }
        }
    }

    #[cfg(test)]
    fn internal_count(&self) -> usize {
        self.used_children.len()
    }
}
