//! Force-directed placement of participants on the global-view grid.
//!
//! Measured round-trip times become spring rest lengths; after a fixed
//! number of relaxation passes every node is quantized to a grid cell,
//! with a diamond-ring search resolving cell collisions.

use std::collections::{HashMap, HashSet};

use log::{debug, warn};

use crate::models::connection::ConnId;
use crate::models::grid::GridCoordinate;

/// Side length of the continuous space nodes relax in.
const SPACE_WIDTH: f64 = 1000.0;
const SPACE_HEIGHT: f64 = 1000.0;

/// Rest lengths are round-trip sums scaled into draw units.
const RTT_SCALE: f64 = 100.0;

/// Springs shorter than this are left alone; the direction of a
/// zero-length spring is undefined.
const MIN_SEPARATION: f64 = 1.0;

#[derive(Debug, Clone)]
pub struct LayoutParams {
    /// Cells per grid side.
    pub grid_dim: i32,
    pub bijection_value: i64,
    /// Ring radius at which the collision search gives up and falls back
    /// to cell (0,0). A degenerate case, not an error.
    pub spiral_max_radius: i32,
    pub relaxation_iterations: u32,
}

impl Default for LayoutParams {
    fn default() -> Self {
        Self {
            grid_dim: 16,
            bijection_value: 10_000,
            spiral_max_radius: 40,
            relaxation_iterations: 2000,
        }
    }
}

struct LayoutNode {
    id: ConnId,
    weight: f64,
    x: f64,
    y: f64,
    force_x: f64,
    force_y: f64,
    target: GridCoordinate,
    cell: GridCoordinate,
}

/// Derives one grid cell per connection from measured round-trip times.
/// Placement is one of several valid arrangements; only collision freedom
/// and determinism for a given input order are guaranteed.
pub fn generate_grid_coords(
    rtts: &[(ConnId, f64)],
    params: &LayoutParams,
) -> HashMap<ConnId, GridCoordinate> {
    let n = rtts.len();
    if n == 0 {
        return HashMap::new();
    }
    if n == 1 {
        return HashMap::from([(rtts[0].0, GridCoordinate::new(0, 0))]);
    }

    // Seed around a circle in ascending round-trip order; the ordering
    // only shapes the initial arrangement.
    let mut ordered: Vec<(ConnId, f64)> = rtts.to_vec();
    ordered.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));

    let radius = 100.0 / (std::f64::consts::PI / n as f64).sin();
    let mut nodes: Vec<LayoutNode> = ordered
        .iter()
        .enumerate()
        .map(|(i, &(id, rtt))| {
            let angle = (i as f64 / n as f64) * std::f64::consts::TAU + 0.5;
            LayoutNode {
                id,
                weight: rtt * RTT_SCALE,
                x: SPACE_WIDTH / 2.0 + radius * angle.cos(),
                y: SPACE_HEIGHT / 2.0 + radius * angle.sin(),
                force_x: 0.0,
                force_y: 0.0,
                target: GridCoordinate::new(-1, -1),
                cell: GridCoordinate::new(-1, -1),
            }
        })
        .collect();

    let force_factor = 1.0 / n as f64;
    for _ in 0..params.relaxation_iterations {
        accumulate_spring_forces(&mut nodes);
        for node in nodes.iter_mut() {
            node.x += node.force_x * force_factor;
            node.y += node.force_y * force_factor;
        }
        quantize_to_cells(&mut nodes, params);
        for node in nodes.iter_mut() {
            node.force_x = 0.0;
            node.force_y = 0.0;
        }
    }

    debug!("layout settled for {} nodes", n);
    nodes.into_iter().map(|node| (node.id, node.cell)).collect()
}

fn accumulate_spring_forces(nodes: &mut [LayoutNode]) {
    for i in 0..nodes.len() {
        for j in 0..i {
            let rest_length = nodes[i].weight + nodes[j].weight;
            let dx = nodes[i].x - nodes[j].x;
            let dy = nodes[i].y - nodes[j].y;
            let separation = (dx * dx + dy * dy).sqrt();
            if separation < MIN_SEPARATION {
                continue;
            }
            // Push apart when the spring is compressed, pull when stretched.
            let direction = if rest_length >= separation { 1.0 } else { -1.0 };
            let magnitude = (separation - rest_length).abs() / rest_length;
            let fx = direction * magnitude * dx / separation;
            let fy = direction * magnitude * dy / separation;
            nodes[i].force_x += fx;
            nodes[i].force_y += fy;
            nodes[j].force_x -= fx;
            nodes[j].force_y -= fy;
        }
    }
}

fn quantize_to_cells(nodes: &mut [LayoutNode], params: &LayoutParams) {
    let mut min_x = f64::INFINITY;
    let mut min_y = f64::INFINITY;
    let mut max_x = f64::NEG_INFINITY;
    let mut max_y = f64::NEG_INFINITY;
    for node in nodes.iter() {
        min_x = min_x.min(node.x);
        min_y = min_y.min(node.y);
        max_x = max_x.max(node.x);
        max_y = max_y.max(node.y);
    }

    // Square bounding box, rounded up to a whole number of cells.
    let extent = (max_x - min_x).max(max_y - min_y);
    let bb_width = (extent / params.grid_dim as f64).ceil() * params.grid_dim as f64;
    let cell_size = if bb_width > 0.0 {
        bb_width / params.grid_dim as f64
    } else {
        1.0
    };

    // Target cells first, so an early placement cannot steal a later
    // node's exact cell before that node is considered.
    for node in nodes.iter_mut() {
        node.target = GridCoordinate::new(
            ((node.x - min_x) / cell_size).round() as i32,
            ((node.y - min_y) / cell_size).round() as i32,
        );
    }

    let mut occupied: HashSet<i64> = HashSet::new();
    for idx in 0..nodes.len() {
        let target = nodes[idx].target;
        let key = bijection_key(target, params.bijection_value);
        let cell = if occupied.insert(key) {
            target
        } else {
            let fallback = search_free_cell(target, &occupied, params);
            occupied.insert(bijection_key(fallback, params.bijection_value));
            fallback
        };
        nodes[idx].cell = cell;
    }
}

fn bijection_key(coord: GridCoordinate, bijection_value: i64) -> i64 {
    (coord.x as i64 + 1) * bijection_value + (coord.y as i64 + 1)
}

fn cell_is_free(
    x: i32,
    y: i32,
    occupied: &HashSet<i64>,
    params: &LayoutParams,
) -> bool {
    x >= 0
        && y >= 0
        && x <= params.grid_dim
        && y <= params.grid_dim
        && !occupied.contains(&bijection_key(GridCoordinate::new(x, y), params.bijection_value))
}

/// Expanding diamond ring scan around the contested cell: four symmetric
/// offsets per ring radius, in a fixed order, so placement is
/// deterministic. Exhaustion falls back to (0,0).
fn search_free_cell(
    around: GridCoordinate,
    occupied: &HashSet<i64>,
    params: &LayoutParams,
) -> GridCoordinate {
    for ring in 1..params.spiral_max_radius {
        for i1 in (1..=ring).rev() {
            let i2 = (i1 - ring).abs();
            let candidates = [
                (around.x + i2, around.y + i1),
                (around.x + i1, around.y - i2),
                (around.x - i1, around.y + i2),
                (around.x - i2, around.y - i1),
            ];
            for (x, y) in candidates {
                if cell_is_free(x, y, occupied, params) {
                    return GridCoordinate::new(x, y);
                }
            }
        }
    }
    warn!(
        "no free cell within {} rings of ({}, {}); falling back to origin",
        params.spiral_max_radius, around.x, around.y
    );
    GridCoordinate::new(0, 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys_of(coords: &HashMap<ConnId, GridCoordinate>, bijection_value: i64) -> HashSet<i64> {
        coords
            .values()
            .map(|&c| bijection_key(c, bijection_value))
            .collect()
    }

    #[test]
    fn no_two_connections_share_a_cell() {
        let params = LayoutParams::default();
        for n in 1..=20 {
            let rtts: Vec<(ConnId, f64)> = (0..n)
                .map(|i| (i, 0.01 + 0.013 * (i as f64 % 7.0)))
                .collect();
            let coords = generate_grid_coords(&rtts, &params);
            assert_eq!(coords.len(), n as usize);
            assert_eq!(
                keys_of(&coords, params.bijection_value).len(),
                n as usize,
                "collision with {} nodes",
                n
            );
        }
    }

    #[test]
    fn identical_rtts_still_place_everyone() {
        let params = LayoutParams::default();
        let rtts: Vec<(ConnId, f64)> = (0..8).map(|i| (i, 0.05)).collect();
        let coords = generate_grid_coords(&rtts, &params);
        assert_eq!(keys_of(&coords, params.bijection_value).len(), 8);
    }

    #[test]
    fn single_node_sits_at_origin() {
        let params = LayoutParams::default();
        let coords = generate_grid_coords(&[(3, 0.2)], &params);
        assert_eq!(coords[&3], GridCoordinate::new(0, 0));
    }

    #[test]
    fn layout_is_deterministic_for_an_input() {
        let params = LayoutParams::default();
        let rtts: Vec<(ConnId, f64)> = vec![(0, 0.03), (1, 0.12), (2, 0.07), (3, 0.30)];
        let first = generate_grid_coords(&rtts, &params);
        let second = generate_grid_coords(&rtts, &params);
        assert_eq!(first, second);
    }

    #[test]
    fn ring_search_prefers_nearby_cells() {
        let params = LayoutParams::default();
        let mut occupied = HashSet::new();
        occupied.insert(bijection_key(GridCoordinate::new(5, 5), params.bijection_value));
        let found = search_free_cell(GridCoordinate::new(5, 5), &occupied, &params);
        assert_eq!(found.manhattan_distance(&GridCoordinate::new(5, 5)), 1);
    }

    #[test]
    fn exhausted_search_falls_back_to_origin() {
        let params = LayoutParams {
            grid_dim: 1,
            ..LayoutParams::default()
        };
        let mut occupied = HashSet::new();
        for x in 0..=1 {
            for y in 0..=1 {
                occupied.insert(bijection_key(GridCoordinate::new(x, y), params.bijection_value));
            }
        }
        let found = search_free_cell(GridCoordinate::new(0, 0), &occupied, &params);
        assert_eq!(found, GridCoordinate::new(0, 0));
    }
}
