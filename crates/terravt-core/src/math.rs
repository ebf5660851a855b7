//! Math utilities
//!
//! Re-exports from glam and the integer helpers shared by the allocator,
//! the codecs and the streaming stage.

pub use glam::{IVec2, UVec2, Vec2, Vec3};

/// Integer terrain sector coordinate (x, z)
pub type Sector = IVec2;

/// Smallest `n` such that `1 << n >= value`
///
/// Returns 0 for 0 and 1.
#[inline]
pub fn ceil_log2(value: u32) -> u32 {
    if value <= 1 {
        0
    } else {
        32 - (value - 1).leading_zeros()
    }
}

/// Sector containing the given XZ world position
#[inline]
pub fn sector_of(position_xz: Vec2, sector_size: u32) -> Sector {
    let size = sector_size as f32;
    IVec2::new(
        (position_xz.x / size).floor() as i32,
        (position_xz.y / size).floor() as i32,
    )
}

/// World-space XZ centre of a sector
#[inline]
pub fn sector_center(sector: Sector, sector_size: u32) -> Vec2 {
    let size = sector_size as f32;
    sector.as_vec2() * size + Vec2::splat(size * 0.5)
}

/// Squared length of an integer vector, widened to avoid overflow
#[inline]
pub fn length_squared_i(v: IVec2) -> i64 {
    let x = v.x as i64;
    let y = v.y as i64;
    x * x + y * y
}
