//! LOD Selection
//!
//! Camera-distance image sizing and the sector radius search used by the
//! streaming stage.

use smallvec::SmallVec;

use crate::config::VirtualTextureConfig;
use crate::math::{length_squared_i, IVec2, Sector, Vec2};

/// Target virtual image size (texels) for a sector centred at `sector_center`
///
/// Every doubling of the squared distance past `switch_distance` halves the
/// size. The result is clamped to `[minimal_virtual_image_size,
/// highest_resolution]`.
pub fn target_image_size(sector_center: Vec2, camera_xz: Vec2, config: &VirtualTextureConfig) -> u32 {
    let ratio = (sector_center - camera_xz).length_squared() / config.switch_distance;
    let lod = if ratio >= 1.0 {
        (ratio.log2().floor() as u32).saturating_add(1)
    } else {
        0
    };
    let highest = config.highest_resolution();
    let size = highest.checked_shr(lod).unwrap_or(0);
    size.clamp(config.minimal_virtual_image_size, highest)
}

/// True when resizing from `old_size` to `new_size` skips at least one LOD
pub fn is_multi_step_change(old_size: u32, new_size: u32) -> bool {
    old_size != 0 && old_size != new_size && old_size != new_size * 2 && new_size != old_size * 2
}

/// Sectors of a `sector_count`² terrain within `preload_distance` of
/// `camera_sector`
///
/// Depth-first search over a sector quadtree whose root spans the next power
/// of two of `sector_count`; nodes whose centre is farther than
/// `(half + preload) * sqrt(2)` cannot contain a sector in range and are
/// pruned.
pub fn sectors_in_range(camera_sector: Sector, sector_count: u32, preload_distance: f32) -> Vec<Sector> {
    let mut result = Vec::new();
    if sector_count == 0 {
        return result;
    }

    let preload_sq = (preload_distance * preload_distance) as f64;
    let root_size = sector_count.next_power_of_two() as i32;
    let limit = sector_count as i32;

    let mut stack: SmallVec<[(IVec2, i32); 64]> = SmallVec::new();
    stack.push((IVec2::ZERO, root_size));

    while let Some((origin, size)) = stack.pop() {
        if origin.x >= limit || origin.y >= limit {
            continue;
        }

        let half = size >> 1;
        let sqr_distance = length_squared_i(origin - camera_sector + IVec2::splat(half)) as f64;
        if size == 1 {
            if sqr_distance < preload_sq {
                result.push(origin);
            }
            continue;
        }

        let reach = half as f64 + preload_distance as f64;
        if sqr_distance < 2.0 * reach * reach {
            stack.push((origin + IVec2::new(half, half), half));
            stack.push((origin + IVec2::new(0, half), half));
            stack.push((origin + IVec2::new(half, 0), half));
            stack.push((origin, half));
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::sector_center;
    use ahash::AHashSet;

    #[test]
    fn test_target_image_size_steps() {
        let config = VirtualTextureConfig::default();
        let camera = Vec2::new(32.0, 32.0);

        assert_eq!(target_image_size(camera, camera, &config), 65536);
        // d² = 6144 exactly: first step
        let d = 6144f32.sqrt();
        assert_eq!(target_image_size(camera + Vec2::new(d + 0.01, 0.0), camera, &config), 32768);
        // d² = 4 * 6144: third size
        assert_eq!(target_image_size(camera + Vec2::new(2.0 * d + 0.01, 0.0), camera, &config), 8192);
    }

    #[test]
    fn test_target_image_size_is_clamped() {
        let config = VirtualTextureConfig::default();
        let far = target_image_size(Vec2::new(100_000.0, 0.0), Vec2::ZERO, &config);
        assert_eq!(far, config.minimal_virtual_image_size);
        let very_far = target_image_size(Vec2::new(1.0e18, 0.0), Vec2::ZERO, &config);
        assert_eq!(very_far, config.minimal_virtual_image_size);
    }

    #[test]
    fn test_multi_step_detection() {
        assert!(!is_multi_step_change(0, 65536));
        assert!(!is_multi_step_change(8192, 16384));
        assert!(!is_multi_step_change(8192, 4096));
        assert!(is_multi_step_change(8192, 32768));
        assert!(is_multi_step_change(8192, 2048));
    }

    #[test]
    fn test_sectors_in_range_matches_brute_force() {
        let sector_count = 40;
        for camera in [IVec2::new(0, 0), IVec2::new(20, 17), IVec2::new(39, 2), IVec2::new(-3, 45)] {
            let found: AHashSet<Sector> = sectors_in_range(camera, sector_count, 6.0).into_iter().collect();

            let mut expected = AHashSet::new();
            for x in 0..sector_count as i32 {
                for z in 0..sector_count as i32 {
                    let s = IVec2::new(x, z);
                    if length_squared_i(s - camera) < 36 {
                        expected.insert(s);
                    }
                }
            }
            assert_eq!(found, expected, "camera sector {camera}");
        }
    }

    #[test]
    fn test_sectors_in_range_has_no_duplicates() {
        let sectors = sectors_in_range(IVec2::new(10, 10), 64, 6.0);
        let unique: AHashSet<Sector> = sectors.iter().copied().collect();
        assert_eq!(sectors.len(), unique.len());
        // Integer points strictly inside a radius-6 disc
        assert_eq!(sectors.len(), 109);
    }

    #[test]
    fn test_sector_center_distance_feeds_lod() {
        let config = VirtualTextureConfig::default();
        let camera = Vec2::new(288.5, 288.5);
        let near = target_image_size(sector_center(IVec2::new(4, 4), 64), camera, &config);
        let far = target_image_size(sector_center(IVec2::new(0, 0), 64), camera, &config);
        assert!(near > far);
        assert_eq!(near, 65536);
    }
}
