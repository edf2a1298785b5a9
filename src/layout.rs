//! Tile layout for the composited output frame.
//!
//! The widest profile becomes the "hero" tile on the first row; every other
//! profile is packed left to right on a single second row directly below it.
//! When the second row is wider than the hero, the hero is centred over it.
//!
//! ```text
//!        +-------------------+
//!        |       hero        |
//! +------+-----+-------------+----+
//! | order[1]   | order[2]   | ... |
//! +------------+------------+-----+
//! ```
//!
//! # Limitations
//!
//! This is not a general bin-packing layout. It only gives a sensible
//! composite when one profile clearly dominates in width. Row two ignores
//! tile heights, never wraps, and with several comparably wide profiles the
//! tiles can overlap or the hero can look oddly centred. The behaviour is
//! kept as-is for compatibility with existing configurations.

use crate::profile::{ProfileIndex, StreamProfile};

/// Placement of one branch's output inside the composite frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutTile {
    /// Profile (and branch) this tile belongs to.
    pub profile_index: ProfileIndex,
    /// Left edge in the composite frame.
    pub x: i32,
    /// Top edge in the composite frame.
    pub y: i32,
    /// Tile width.
    pub width: u32,
    /// Tile height.
    pub height: u32,
}

/// Profile indices ordered by descending width.
///
/// Uses an in-place selection sort: for each position the widest remaining
/// entry (first one found on ties) is swapped forward. The swap moves the
/// displaced entry to the back of the remainder, so equal widths do not keep
/// their input order.
pub fn layout_order(profiles: &[StreamProfile]) -> Vec<ProfileIndex> {
    let mut order: Vec<ProfileIndex> = (0..profiles.len()).map(ProfileIndex).collect();
    let width = |idx: ProfileIndex| profiles[idx.get()].width();

    for i in 0..order.len() {
        let mut best = i;
        for j in (i + 1)..order.len() {
            if width(order[j]) > width(order[best]) {
                best = j;
            }
        }
        order.swap(i, best);
    }

    order
}

/// Compute one tile per profile.
///
/// The result is indexed by [`ProfileIndex`]: `tiles[i].profile_index == i`.
/// An empty input yields an empty layout.
pub fn compute_layout(profiles: &[StreamProfile]) -> Vec<LayoutTile> {
    let order = layout_order(profiles);
    let Some((&hero, rest)) = order.split_first() else {
        return Vec::new();
    };

    let hero_profile = &profiles[hero.get()];
    let row_two_y = offset(i64::from(hero_profile.height()));

    let mut tiles: Vec<Option<LayoutTile>> = vec![None; profiles.len()];
    let mut row_two_width: i64 = 0;
    for &idx in rest {
        let profile = &profiles[idx.get()];
        tiles[idx.get()] = Some(LayoutTile {
            profile_index: idx,
            x: offset(row_two_width),
            y: row_two_y,
            width: profile.width(),
            height: profile.height(),
        });
        row_two_width += i64::from(profile.width());
    }

    let hero_width = i64::from(hero_profile.width());
    let hero_x = if row_two_width <= hero_width {
        0
    } else {
        (row_two_width - hero_width) / 2
    };
    tiles[hero.get()] = Some(LayoutTile {
        profile_index: hero,
        x: offset(hero_x),
        y: 0,
        width: hero_profile.width(),
        height: hero_profile.height(),
    });

    tiles.into_iter().flatten().collect()
}

fn offset(value: i64) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

/// Size of the smallest canvas that contains every tile.
pub fn canvas_size(tiles: &[LayoutTile]) -> (u32, u32) {
    tiles.iter().fold((0, 0), |(w, h), tile| {
        let right = (tile.x.max(0) as u32).saturating_add(tile.width);
        let bottom = (tile.y.max(0) as u32).saturating_add(tile.height);
        (w.max(right), h.max(bottom))
    })
}
