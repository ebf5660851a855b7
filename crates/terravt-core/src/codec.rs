//! Wire formats shared with the GPU
//!
//! - [`PageId`]: 32-bit visible-page identifier written by the feedback pass
//! - [`LruKey`]: 64-bit canonical physical page identity used by the page cache
//! - [`SectorInfoRecord`]: 32-bit sector-info texel locating a sector's region

use crate::math::{ceil_log2, Sector, UVec2};

/// Slot value stored in the indirection texture for "no physical page"
pub const INVALID_SLOT: u16 = u16::MAX;

/// LRU keys at or above this value are startup placeholders, never real pages
pub const LRU_PLACEHOLDER_THRESHOLD: u64 = 0x7FFF_FFFF_FFFF_FFFF;

const PAGE_COORD_MASK: u32 = 0xFFF;
const NIBBLE_MASK: u32 = 0xF;
const LRU_COORD_MASK: u64 = 0xFF_FFFF;

/// One page of one virtual image at one mip level
///
/// `x`/`z` are page coordinates in the indirection texture at mip `mip`;
/// `size_log2` is log2 of the owning image's size in pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageId {
    pub x: u32,
    pub z: u32,
    pub mip: u32,
    pub size_log2: u32,
}

impl PageId {
    pub const fn new(x: u32, z: u32, mip: u32, size_log2: u32) -> Self {
        Self { x, z, mip, size_log2 }
    }

    /// Pack as `[31:20] x | [19:8] z | [7:4] mip | [3:0] size_log2`
    #[inline]
    pub fn pack(self) -> u32 {
        ((self.x & PAGE_COORD_MASK) << 20)
            | ((self.z & PAGE_COORD_MASK) << 8)
            | ((self.mip & NIBBLE_MASK) << 4)
            | (self.size_log2 & NIBBLE_MASK)
    }

    #[inline]
    pub fn unpack(packed: u32) -> Self {
        Self {
            x: packed >> 20,
            z: (packed >> 8) & PAGE_COORD_MASK,
            mip: (packed >> 4) & NIBBLE_MASK,
            size_log2: packed & NIBBLE_MASK,
        }
    }

    /// The single page covering a whole image at its coarsest mip
    pub fn whole_image(region_x: u32, region_z: u32, size_in_pages: u32) -> Self {
        let log = ceil_log2(size_in_pages);
        Self::new(region_x >> log, region_z >> log, log, log)
    }

    /// Owning image size in pages
    pub fn image_size_pages(self) -> u32 {
        1 << self.size_log2
    }

    /// Position of this page's first texel page at mip 0
    pub fn mip0_position(self) -> UVec2 {
        UVec2::new(self.x << self.mip, self.z << self.mip)
    }

    /// Mip-0 origin of the image region this page belongs to
    ///
    /// Regions are aligned to their size, so rounding down the mip-0
    /// position recovers the region origin.
    pub fn region_origin(self) -> UVec2 {
        (self.mip0_position() >> self.size_log2) << self.size_log2
    }

    /// Mip-0 page offset of this page inside its image region
    pub fn local_page(self) -> UVec2 {
        self.mip0_position() - self.region_origin()
    }

    /// Render ordering key: whole-image pages (0) first, finest mips last
    pub fn priority(self) -> i32 {
        self.size_log2 as i32 - self.mip as i32
    }
}

/// Canonical identity of a physical page's content
///
/// Pages are addressed in a terrain-wide grid of `max_virtual_page_size`
/// pages per sector side, taken down to the page's physical mip. The same
/// terrain footprint therefore maps to the same key whichever LOD the owning
/// sector's image currently has.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LruKey(pub u64);

impl LruKey {
    /// Build the key for `local_page` (mip-0 pages within an image of
    /// `1 << size_log2` pages) of `sector` at `mip`.
    pub fn encode(
        sector: Sector,
        local_page: UVec2,
        mip: u32,
        size_log2: u32,
        max_page_shift: u32,
    ) -> Self {
        debug_assert!(sector.x >= 0 && sector.y >= 0, "sector {sector} outside the terrain");
        debug_assert!(size_log2 <= max_page_shift);
        let grid_mip0 =
            (sector.as_uvec2() << max_page_shift) + (local_page << (max_page_shift - size_log2));
        let physical_mip = max_page_shift - size_log2 + mip;
        let page = grid_mip0 >> physical_mip;
        Self(
            ((page.x as u64 & LRU_COORD_MASK) << 32)
                | ((page.y as u64 & LRU_COORD_MASK) << 8)
                | physical_mip as u64,
        )
    }

    /// Startup placeholder number `index`
    pub fn placeholder(index: u32) -> Self {
        Self(u64::MAX - index as u64)
    }

    pub fn is_placeholder(self) -> bool {
        self.0 >= LRU_PLACEHOLDER_THRESHOLD
    }

    /// Canonical page coordinate and physical mip
    pub fn decode(self) -> (UVec2, u32) {
        let x = ((self.0 >> 32) & LRU_COORD_MASK) as u32;
        let z = ((self.0 >> 8) & LRU_COORD_MASK) as u32;
        let physical_mip = (self.0 & 0xFF) as u32;
        (UVec2::new(x, z), physical_mip)
    }

    /// Sector whose footprint contains this page
    pub fn owner_sector(self, max_page_shift: u32) -> Sector {
        let (page, physical_mip) = self.decode();
        ((page << physical_mip) >> max_page_shift).as_ivec2()
    }

    /// Offset of the page inside its sector, in full-resolution mip-0 pages
    pub fn sector_local_page(self, max_page_shift: u32) -> UVec2 {
        let (page, physical_mip) = self.decode();
        let mask = (1u32 << max_page_shift) - 1;
        (page << physical_mip) & UVec2::splat(mask)
    }
}

/// Encoded sector-info texel: `[31:20] region x | [19:8] region z | [7:0] size_log2`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SectorInfoRecord(pub u32);

impl SectorInfoRecord {
    pub fn encode(region_x: u32, region_z: u32, size_in_pages: u32) -> Self {
        Self(
            ((region_x & PAGE_COORD_MASK) << 20)
                | ((region_z & PAGE_COORD_MASK) << 8)
                | ceil_log2(size_in_pages),
        )
    }

    /// Region origin and size in pages
    pub fn decode(self) -> (UVec2, u32) {
        let x = self.0 >> 20;
        let z = (self.0 >> 8) & PAGE_COORD_MASK;
        let log = self.0 & 0xFF;
        (UVec2::new(x, z), 1 << log)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::IVec2;

    #[test]
    fn test_page_id_round_trip_at_field_limits() {
        for page in [
            PageId::new(0, 0, 0, 0),
            PageId::new(4095, 4095, 15, 15),
            PageId::new(1023, 5, 3, 8),
            PageId::new(17, 900, 8, 8),
        ] {
            assert_eq!(PageId::unpack(page.pack()), page);
        }
    }

    #[test]
    fn test_page_id_bit_layout() {
        let packed = PageId::new(0xABC, 0x123, 0x4, 0x5).pack();
        assert_eq!(packed, 0xABC1_2345);
    }

    #[test]
    fn test_page_id_region_and_local_page() {
        // Image of 32 pages at (64, 96); page at mip 2 covering mip-0 (80, 100)
        let page = PageId::new(20, 25, 2, 5);
        assert_eq!(page.region_origin(), UVec2::new(64, 96));
        assert_eq!(page.local_page(), UVec2::new(16, 4));
        assert_eq!(page.priority(), 3);
    }

    #[test]
    fn test_whole_image_page() {
        let page = PageId::whole_image(64, 96, 32);
        assert_eq!(page, PageId::new(2, 3, 5, 5));
        assert_eq!(page.region_origin(), UVec2::new(64, 96));
        assert_eq!(page.local_page(), UVec2::ZERO);
        assert_eq!(page.priority(), 0);
    }

    #[test]
    fn test_lru_key_is_lod_independent() {
        let sector = IVec2::new(1, 2);
        // 256-page image, mip 1, local (2, 4) and 128-page image, mip 0, local (1, 2)
        let fine = LruKey::encode(sector, UVec2::new(2, 4), 1, 8, 8);
        let coarse = LruKey::encode(sector, UVec2::new(1, 2), 0, 7, 8);
        assert_eq!(fine, coarse);

        let (page, physical_mip) = fine.decode();
        assert_eq!(physical_mip, 1);
        assert_eq!(page, UVec2::new(129, 258));
        assert_eq!(fine.owner_sector(8), sector);
        assert_eq!(fine.sector_local_page(8), UVec2::new(2, 4));
    }

    #[test]
    fn test_placeholders_are_recognised() {
        assert!(LruKey::placeholder(0).is_placeholder());
        assert!(LruKey::placeholder(1022).is_placeholder());
        let real = LruKey::encode(IVec2::new(63, 63), UVec2::new(255, 255), 0, 8, 8);
        assert!(!real.is_placeholder());
    }

    #[test]
    fn test_sector_info_record() {
        let record = SectorInfoRecord::encode(512, 256, 64);
        assert_eq!(record.0, (512 << 20) | (256 << 8) | 6);
        assert_eq!(record.decode(), (UVec2::new(512, 256), 64));
    }
}
