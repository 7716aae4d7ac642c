//! Distributes a dirty region of the virtual canvas across the physical surfaces.
//!
//! Surfaces sit left to right without gaps. A region is intersected with each surface's
//! horizontal extent (and its height, which may be shorter than the canvas), and every non-empty
//! intersection is translated into that surface's local coordinates.

use crate::geometry::Rect;

/// Placement of one physical surface inside the virtual canvas.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SurfaceSpan {
    pub origin_x: u32,
    pub width: u32,
    pub height: u32,
}

impl SurfaceSpan {
    /// The canvas-space rectangle this surface displays.
    pub fn extent(&self) -> Option<Rect> {
        if self.width == 0 || self.height == 0 {
            return None;
        }
        let x1 = i32::try_from(self.origin_x).ok()?;
        let x2 = i32::try_from(self.origin_x as i64 + self.width as i64 - 1).ok()?;
        let y2 = i32::try_from(self.height - 1).ok()?;
        Some(Rect::new(x1, 0, x2, y2))
    }
}

/// The part of a dirty region that lands on one surface.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SubRegion {
    pub surface_index: usize,
    /// Canvas coordinates.
    pub global: Rect,
    /// Coordinates relative to the surface's top-left pixel.
    pub local: Rect,
}

/// Splits `dirty` into one sub-region per surface it touches, in layout order.
///
/// Empty intersections are omitted, so the result has between zero and `surfaces.len()` entries.
pub fn split(dirty: Rect, surfaces: &[SurfaceSpan]) -> Vec<SubRegion> {
    let mut out = Vec::with_capacity(2);
    if dirty.is_empty() {
        return out;
    }

    for (surface_index, span) in surfaces.iter().enumerate() {
        if span.origin_x as i64 > dirty.x2 as i64 {
            break;
        }
        let Some(extent) = span.extent() else {
            continue;
        };
        let Some(global) = dirty.intersect(&extent) else {
            continue;
        };
        out.push(SubRegion {
            surface_index,
            global,
            local: global.translate(-extent.x1, 0),
        });
    }
    out
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LayoutError {
    Empty,
    ZeroSized { index: usize },
    Gap { index: usize, expected_origin: u32, origin_x: u32 },
    Overflow,
}

/// Checks that the spans tile `[0, virtual_width)` left to right with no gaps or overlaps.
///
/// Returns the virtual canvas size `(width, height)`.
pub fn validate_layout(surfaces: &[SurfaceSpan]) -> Result<(u32, u32), LayoutError> {
    if surfaces.is_empty() {
        return Err(LayoutError::Empty);
    }

    let mut next_origin = 0u32;
    let mut height = 0u32;
    for (index, span) in surfaces.iter().enumerate() {
        if span.width == 0 || span.height == 0 {
            return Err(LayoutError::ZeroSized { index });
        }
        if span.origin_x != next_origin {
            return Err(LayoutError::Gap {
                index,
                expected_origin: next_origin,
                origin_x: span.origin_x,
            });
        }
        next_origin = next_origin
            .checked_add(span.width)
            .filter(|w| *w <= i32::MAX as u32)
            .ok_or(LayoutError::Overflow)?;
        height = height.max(span.height);
    }
    if height > i32::MAX as u32 {
        return Err(LayoutError::Overflow);
    }
    Ok((next_origin, height))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const PANEL_W: u32 = 960;
    const PANEL_H: u32 = 720;

    fn panels() -> [SurfaceSpan; 2] {
        [
            SurfaceSpan {
                origin_x: 0,
                width: PANEL_W,
                height: PANEL_H,
            },
            SurfaceSpan {
                origin_x: PANEL_W,
                width: PANEL_W,
                height: PANEL_H,
            },
        ]
    }

    #[test]
    fn straddling_region_splits_at_the_boundary() {
        let parts = split(Rect::new(900, 10, 1020, 20), &panels());
        assert_eq!(
            parts,
            vec![
                SubRegion {
                    surface_index: 0,
                    global: Rect::new(900, 10, 959, 20),
                    local: Rect::new(900, 10, 959, 20),
                },
                SubRegion {
                    surface_index: 1,
                    global: Rect::new(960, 10, 1020, 20),
                    local: Rect::new(0, 10, 60, 20),
                },
            ]
        );
    }

    #[test]
    fn boundary_pixels_belong_to_one_surface_each() {
        let last_left = split(Rect::new(959, 0, 959, 0), &panels());
        assert_eq!(last_left.len(), 1);
        assert_eq!(last_left[0].surface_index, 0);
        assert_eq!(last_left[0].local, Rect::new(959, 0, 959, 0));

        let first_right = split(Rect::new(960, 0, 960, 0), &panels());
        assert_eq!(first_right.len(), 1);
        assert_eq!(first_right[0].surface_index, 1);
        assert_eq!(first_right[0].local, Rect::new(0, 0, 0, 0));
    }

    #[test]
    fn empty_or_outside_regions_produce_nothing() {
        assert!(split(Rect::new(10, 10, 9, 10), &panels()).is_empty());
        assert!(split(Rect::new(1920, 0, 2000, 10), &panels()).is_empty());
        assert!(split(Rect::new(0, 720, 100, 800), &panels()).is_empty());
        assert!(split(Rect::new(0, 0, 10, 10), &[]).is_empty());
    }

    #[test]
    fn shorter_surface_clamps_rows() {
        let spans = [
            SurfaceSpan {
                origin_x: 0,
                width: 100,
                height: 50,
            },
            SurfaceSpan {
                origin_x: 100,
                width: 100,
                height: 80,
            },
        ];
        let parts = split(Rect::new(90, 40, 110, 70), &spans);
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].local, Rect::new(90, 40, 99, 49));
        assert_eq!(parts[1].local, Rect::new(0, 40, 10, 70));

        let below_left = split(Rect::new(0, 60, 150, 70), &spans);
        assert_eq!(below_left.len(), 1);
        assert_eq!(below_left[0].surface_index, 1);
    }

    #[test]
    fn three_surfaces_generalize() {
        let spans = [
            SurfaceSpan {
                origin_x: 0,
                width: 10,
                height: 10,
            },
            SurfaceSpan {
                origin_x: 10,
                width: 10,
                height: 10,
            },
            SurfaceSpan {
                origin_x: 20,
                width: 10,
                height: 10,
            },
        ];
        let parts = split(Rect::new(5, 0, 25, 9), &spans);
        let locals: Vec<_> = parts.iter().map(|p| (p.surface_index, p.local)).collect();
        assert_eq!(
            locals,
            vec![
                (0, Rect::new(5, 0, 9, 9)),
                (1, Rect::new(0, 0, 9, 9)),
                (2, Rect::new(0, 0, 5, 9)),
            ]
        );
    }

    #[test]
    fn layout_validation() {
        assert_eq!(validate_layout(&panels()), Ok((1920, 720)));
        assert_eq!(validate_layout(&[]), Err(LayoutError::Empty));

        let mut gap = panels();
        gap[1].origin_x = 961;
        assert_eq!(
            validate_layout(&gap),
            Err(LayoutError::Gap {
                index: 1,
                expected_origin: 960,
                origin_x: 961
            })
        );

        let mut zero = panels();
        zero[0].width = 0;
        assert_eq!(
            validate_layout(&zero),
            Err(LayoutError::ZeroSized { index: 0 })
        );
    }

    prop_compose! {
        fn arb_rect_in(x_lo: i32, x_hi: i32)(
            x1 in x_lo..x_hi,
            w in 0i32..400,
            y1 in 0i32..(PANEL_H as i32),
            h in 0i32..200,
        ) -> Rect {
            Rect::new(
                x1,
                y1,
                (x1 + w).min(x_hi - 1),
                (y1 + h).min(PANEL_H as i32 - 1),
            )
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(512))]

        #[test]
        fn left_regions_stay_on_surface_zero(r in arb_rect_in(0, PANEL_W as i32)) {
            let parts = split(r, &panels());
            prop_assert_eq!(parts.len(), 1);
            prop_assert_eq!(parts[0].surface_index, 0);
            prop_assert_eq!(parts[0].local, r);
        }

        #[test]
        fn right_regions_shift_by_the_boundary(r in arb_rect_in(PANEL_W as i32, 2 * PANEL_W as i32)) {
            let parts = split(r, &panels());
            prop_assert_eq!(parts.len(), 1);
            prop_assert_eq!(parts[0].surface_index, 1);
            prop_assert_eq!(parts[0].local, r.translate(-(PANEL_W as i32), 0));
        }

        #[test]
        fn straddling_regions_reconstruct_exactly(
            x1 in 0i32..(PANEL_W as i32),
            x2 in (PANEL_W as i32)..(2 * PANEL_W as i32),
            y1 in 0i32..(PANEL_H as i32),
            h in 0i32..50,
        ) {
            let r = Rect::new(x1, y1, x2, (y1 + h).min(PANEL_H as i32 - 1));
            let parts = split(r, &panels());
            prop_assert_eq!(parts.len(), 2);
            prop_assert_eq!(parts[0].local.width() + parts[1].local.width(), r.width());

            let left = parts[0].local;
            let right = parts[1].local.translate(PANEL_W as i32, 0);
            prop_assert_eq!(left.x2 + 1, right.x1);
            prop_assert_eq!(Rect::new(left.x1, left.y1, right.x2, right.y2), r);
            prop_assert_eq!(left.y1, right.y1);
            prop_assert_eq!(left.y2, right.y2);
        }
    }
}
