use crate::types::{LandmarkFrame, LandmarkPoint, NormalizedVector};

/// Makes a hand shape translation and scale invariant.
///
/// Every point is shifted so point 0 sits at the origin, the pairs are
/// flattened row-major and divided by the largest absolute coordinate. A
/// frame whose points all coincide yields the all-zero vector.
pub fn normalize(frame: &LandmarkFrame) -> NormalizedVector {
    let base = frame.points.first().copied().unwrap_or_default();

    let mut flat: Vec<f32> = Vec::with_capacity(frame.len() * 2);
    for point in &frame.points {
        flat.push((point.x - base.x) as f32);
        flat.push((point.y - base.y) as f32);
    }

    let max_value = flat.iter().fold(0.0f32, |acc, v| acc.max(v.abs()));
    if max_value == 0.0 {
        log::debug!("degenerate landmark frame, all points coincide");
        return NormalizedVector(vec![0.0; flat.len()]);
    }

    for value in flat.iter_mut() {
        *value /= max_value;
    }

    NormalizedVector(flat)
}

/// Point-history preprocessing for the trajectory classifier: offsets from
/// the oldest sample, x divided by frame width and y by frame height.
pub fn trajectory_features<'a, I>(points: I, width: u32, height: u32) -> Vec<f32>
where
    I: IntoIterator<Item = &'a LandmarkPoint>,
{
    let mut iter = points.into_iter().peekable();
    let Some(base) = iter.peek().copied().copied() else {
        return Vec::new();
    };

    let relative = |offset: i32, extent: u32| {
        if extent == 0 {
            0.0
        } else {
            offset as f32 / extent as f32
        }
    };

    iter.flat_map(|p| {
        [
            relative(p.x - base.x, width),
            relative(p.y - base.y, height),
        ]
    })
    .collect()
}
