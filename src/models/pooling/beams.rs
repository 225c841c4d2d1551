//! Host-side selection of boundary points along polar beams and rays.
//!
//! Every function returns one offset per beam, `chosen_point - position`, in
//! world coordinates. A beam with no usable boundary point is filled either at
//! the beam centre on the radius (`true_points == false`) or with a zero
//! offset (`true_points == true`), so "far" and "no data" stay distinguishable.

use std::f32::consts::PI;

pub const RAY_DECIMALS: i32 = 2;

/// Heading angle of a displacement; a zero displacement faces along +x.
pub fn heading(displacement: [f32; 2]) -> f32 {
    displacement[1].atan2(displacement[0])
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
    radius: f32,
    offset: [f32; 2],
}

impl Candidate {
    fn closer_than(&self, other: &Candidate) -> bool {
        match self.radius.total_cmp(&other.radius) {
            std::cmp::Ordering::Less => true,
            std::cmp::Ordering::Greater => false,
            std::cmp::Ordering::Equal => {
                (self.offset[0], self.offset[1])
                    .partial_cmp(&(other.offset[0], other.offset[1]))
                    == Some(std::cmp::Ordering::Less)
            }
        }
    }
}

fn keep_closest(slot: &mut Option<Candidate>, candidate: Candidate) {
    match slot {
        Some(current) if !candidate.closer_than(current) => {}
        _ => *slot = Some(candidate),
    }
}

/// Beam index of a heading-relative angle over the forward half plane, bins
/// `(a, b]` from `-pi/2` to `pi/2`.
pub fn polar_bin(angle: f32, num_beams: usize) -> Option<usize> {
    if !(angle > -PI / 2.0 && angle <= PI / 2.0) {
        return None;
    }
    let width = PI / num_beams as f32;
    let bin = ((angle + PI / 2.0) / width).ceil() as i64 - 1;
    Some(bin.clamp(0, num_beams as i64 - 1) as usize)
}

pub fn polar_beam_points(
    position: [f32; 2],
    heading: f32,
    boundary: &[[f32; 2]],
    num_beams: usize,
    radius: f32,
    true_points: bool,
) -> Vec<[f32; 2]> {
    let (sin, cos) = heading.sin_cos();
    let mut beams: Vec<Option<Candidate>> = vec![None; num_beams];

    for point in boundary {
        let offset = [point[0] - position[0], point[1] - position[1]];
        // rotate into the pedestrian frame, +x along the heading
        let local = [
            offset[0] * cos + offset[1] * sin,
            -offset[0] * sin + offset[1] * cos,
        ];
        let r = (local[0] * local[0] + local[1] * local[1]).sqrt();
        if r > radius {
            continue;
        }
        if let Some(bin) = polar_bin(local[1].atan2(local[0]), num_beams) {
            keep_closest(&mut beams[bin], Candidate { radius: r, offset });
        }
    }

    let width = PI / num_beams as f32;
    beams
        .into_iter()
        .enumerate()
        .map(|(bin, chosen)| match chosen {
            Some(candidate) => candidate.offset,
            None if true_points => [0.0, 0.0],
            None => {
                let angle = heading - PI / 2.0 + width * (bin as f32 + 0.5);
                [radius * angle.cos(), radius * angle.sin()]
            }
        })
        .collect()
}

fn angle_key(angle: f32) -> i64 {
    let scale = 10f32.powi(RAY_DECIMALS);
    let key = (angle * scale).round() as i64;
    let half_turn = (PI * scale).round() as i64;
    // +pi and -pi are the same ray
    if key >= half_turn {
        key - 2 * half_turn
    } else {
        key
    }
}

/// Ray directions `-pi .. pi - 2pi/n`, world frame.
pub fn ray_angles(num_rays: usize) -> Vec<f32> {
    let step = 2.0 * PI / num_rays as f32;
    (0..num_rays).map(|k| -PI + step * k as f32).collect()
}

/// Only boundary points whose rounded bearing equals a rounded ray direction are
/// considered.
pub fn raycast_points(
    position: [f32; 2],
    boundary: &[[f32; 2]],
    num_rays: usize,
    radius: f32,
    true_points: bool,
) -> Vec<[f32; 2]> {
    let angles = ray_angles(num_rays);
    let keys: Vec<i64> = angles.iter().map(|angle| angle_key(*angle)).collect();
    let mut rays: Vec<Option<Candidate>> = vec![None; num_rays];

    for point in boundary {
        let offset = [point[0] - position[0], point[1] - position[1]];
        let r = (offset[0] * offset[0] + offset[1] * offset[1]).sqrt();
        if r > radius {
            continue;
        }
        let key = angle_key(offset[1].atan2(offset[0]));
        if let Some(ray) = keys.iter().position(|k| *k == key) {
            keep_closest(&mut rays[ray], Candidate { radius: r, offset });
        }
    }

    rays.into_iter()
        .zip(angles)
        .map(|(chosen, angle)| match chosen {
            Some(candidate) => candidate.offset,
            None if true_points => [0.0, 0.0],
            None => [radius * angle.cos(), radius * angle.sin()],
        })
        .collect()
}

/// Fixed-size sample of the cloud shared by every pedestrian of a scene: at most
/// `samples` points, short clouds padded by cycling.
pub fn cyclic_sample(boundary: &[[f32; 2]], samples: usize) -> Vec<[f32; 2]> {
    if boundary.is_empty() {
        return Vec::new();
    }
    let stride = (boundary.len() / samples).max(1);
    let strided: Vec<[f32; 2]> = boundary.iter().step_by(stride).copied().collect();
    strided.iter().cycle().take(samples).copied().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_polar_bins_are_right_closed() {
        assert_eq!(polar_bin(-PI / 2.0, 2), None);
        assert_eq!(polar_bin(0.0, 2), Some(0));
        assert_eq!(polar_bin(0.1, 2), Some(1));
        assert_eq!(polar_bin(PI / 2.0, 2), Some(1));
        assert_eq!(polar_bin(2.0, 2), None);
    }

    #[test]
    fn test_polar_picks_closest_point_per_beam() {
        // heading +x, two beams: right (-pi/2, 0] and left (0, pi/2]
        let boundary = [[1.0, -0.5], [0.5, -0.2], [0.3, 0.9], [-1.0, 0.0]];
        let points = polar_beam_points([0.0, 0.0], 0.0, &boundary, 2, 2.0, false);
        assert_eq!(points, vec![[0.5, -0.2], [0.3, 0.9]]);
    }

    #[test]
    fn test_polar_follows_heading() {
        // facing -x, the point behind the origin in world terms is now in front
        let boundary = [[-1.0, 0.5]];
        let points = polar_beam_points([0.0, 0.0], heading([-1.0, 0.0]), &boundary, 2, 2.0, true);
        assert_eq!(points, vec![[-1.0, 0.5], [0.0, 0.0]]);
    }

    #[test]
    fn test_polar_fill_policies() {
        let far = [[5.0, 0.0]];
        let filled = polar_beam_points([1.0, 1.0], 0.0, &far, 1, 2.0, false);
        assert!((filled[0][0] - 2.0).abs() < 1e-6 && filled[0][1].abs() < 1e-6);

        let empty = polar_beam_points([1.0, 1.0], 0.0, &far, 1, 2.0, true);
        assert_eq!(empty, vec![[0.0, 0.0]]);
    }

    #[test]
    fn test_raycast_matches_rounded_directions() {
        // four rays: -pi, -pi/2, 0, pi/2
        let boundary = [[1.0, 0.0], [0.5, 0.0], [0.0, 1.5], [-1.0, 0.0], [1.0, 1.0]];
        let points = raycast_points([0.0, 0.0], &boundary, 4, 2.0, true);
        assert_eq!(points[0], [-1.0, 0.0]);
        assert_eq!(points[1], [0.0, 0.0]);
        assert_eq!(points[2], [0.5, 0.0]);
        assert_eq!(points[3], [0.0, 1.5]);
    }

    #[test]
    fn test_half_turn_angles_share_a_ray() {
        assert_eq!(angle_key(PI), angle_key(-PI));
        assert_eq!(angle_key(PI), angle_key(ray_angles(4)[0]));
        // both signs of the half turn lie behind the heading
        assert_eq!(polar_bin(PI, 4), polar_bin(-PI, 4));

        // atan2 gives +pi for the first neighbour and -pi for the second
        let above = [[-1.0, 0.0]];
        let below = [[-1.0, -0.0]];
        assert_eq!(0.0f32.atan2(-1.0), PI);
        assert_eq!((-0.0f32).atan2(-1.0), -PI);
        let from_above = raycast_points([0.0, 0.0], &above, 4, 2.0, true);
        let from_below = raycast_points([0.0, 0.0], &below, 4, 2.0, true);
        assert_eq!(from_above[0], [-1.0, 0.0]);
        assert_eq!(from_above, from_below);

        let both = raycast_points([0.0, 0.0], &[[-1.0, 0.0], [-0.5, -0.0]], 4, 2.0, true);
        assert_eq!(both[0], [-0.5, 0.0]);
        assert_eq!(&both[1..], &[[0.0, 0.0]; 3]);
    }

    #[test]
    fn test_cyclic_sample_pads_and_thins() {
        let short = [[1.0, 1.0], [2.0, 2.0]];
        assert_eq!(cyclic_sample(&short, 5).len(), 5);
        assert_eq!(cyclic_sample(&short, 5)[2], [1.0, 1.0]);

        let long: Vec<[f32; 2]> = (0..9).map(|i| [i as f32, 0.0]).collect();
        assert_eq!(cyclic_sample(&long, 3), vec![[0.0, 0.0], [3.0, 0.0], [6.0, 0.0]]);
        assert!(cyclic_sample(&[], 3).is_empty());
    }

    proptest! {
        #[test]
        fn prop_beam_choice_ignores_boundary_order(
            points in proptest::collection::vec((-3.0f32..3.0, -3.0f32..3.0), 1..30),
            dir in (-1.0f32..1.0, -1.0f32..1.0),
            rotate in 0usize..30,
        ) {
            let boundary: Vec<[f32; 2]> = points.iter().map(|(x, y)| [*x, *y]).collect();
            let mut rotated = boundary.clone();
            rotated.rotate_left(rotate % boundary.len());

            let theta = heading([dir.0, dir.1]);
            prop_assert_eq!(
                polar_beam_points([0.2, -0.1], theta, &boundary, 7, 2.0, false),
                polar_beam_points([0.2, -0.1], theta, &rotated, 7, 2.0, false)
            );
            prop_assert_eq!(
                raycast_points([0.0, 0.0], &boundary, 8, 2.5, true),
                raycast_points([0.0, 0.0], &rotated, 8, 2.5, true)
            );
        }
    }
}
