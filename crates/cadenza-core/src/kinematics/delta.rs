// Delta kinematics - three vertical carriages linked to the effector by
// fixed-length rods.

/// Tower geometry in step units, precomputed from the machine
/// configuration so the per-segment solve works on integers plus one
/// square root.
#[derive(Debug, Clone)]
pub struct DeltaTowers {
    tower_x: [i64; 3],
    tower_y: [i64; 3],
    /// Diagonal rod length squared, in steps^2.
    rod_squared: i64,
    /// Soft clamp for the carriage travel.
    pub max_tower_steps: i32,
}

impl DeltaTowers {
    /// Build tower positions from the rod length and the horizontal
    /// radius (both mm). Towers sit at 210, 330 and 90 degrees.
    pub fn new(
        diagonal_rod: f64,
        horizontal_radius: f64,
        steps_per_mm: f64,
        max_tower_steps: i32,
    ) -> Self {
        let sin_60 = 3f64.sqrt() * 0.5;
        let cos_60 = 0.5;
        let r = horizontal_radius * steps_per_mm;
        let rod = diagonal_rod * steps_per_mm;
        Self {
            tower_x: [
                (-sin_60 * r) as i64,
                (sin_60 * r) as i64,
                0,
            ],
            tower_y: [
                (-cos_60 * r) as i64,
                (-cos_60 * r) as i64,
                r as i64,
            ],
            rod_squared: (rod * rod) as i64,
            max_tower_steps,
        }
    }

    /// Carriage step positions for a cartesian step position.
    ///
    /// Solves `c_i = sqrt(rod^2 - (tx_i - x)^2 - (ty_i - y)^2) + z` per
    /// tower. Returns `None` when any discriminant is negative, i.e. the
    /// effector cannot reach the target.
    pub fn carriage_positions(&self, cart: [i32; 3]) -> Option<[i32; 3]> {
        let x = cart[0] as i64;
        let y = cart[1] as i64;
        let z = cart[2] as i64;
        let mut out = [0i32; 3];
        for i in 0..3 {
            let dx = self.tower_x[i] - x;
            let dy = self.tower_y[i] - y;
            let disc = self.rod_squared - dx * dx - dy * dy;
            if disc < 0 {
                return None;
            }
            out[i] = ((disc as f64).sqrt() as i64 + z) as i32;
        }
        Some(out)
    }
}

// Bed leveling support: fit a plane through three probed points and read
// the height correction back out. Inputs are step coordinates.

pub fn plane_from_points(p1: [i64; 3], p2: [i64; 3], p3: [i64; 3]) -> [i64; 4] {
    [
        p1[1] * (p2[2] - p3[2]) + p2[1] * (p3[2] - p1[2]) + p3[1] * (p1[2] - p2[2]),
        p1[2] * (p2[0] - p3[0]) + p2[2] * (p3[0] - p1[0]) + p3[2] * (p1[0] - p2[0]),
        p1[0] * (p2[1] - p3[1]) + p2[0] * (p3[1] - p1[1]) + p3[0] * (p1[1] - p2[1]),
        p1[0] * (p2[1] * p3[2] - p3[1] * p2[2])
            + p2[0] * (p3[1] * p1[2] - p1[1] * p3[2])
            + p3[0] * (p1[1] * p2[2] - p2[1] * p1[2]),
    ]
}

pub fn z_offset(factors: [i64; 4], x: i64, y: i64) -> f64 {
    (factors[3] - factors[0] * x - factors[1] * y) as f64 / factors[2] as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn towers() -> DeltaTowers {
        // 250 mm rods, 100 mm radius, 80 steps/mm, 300 mm travel.
        DeltaTowers::new(250.0, 100.0, 80.0, 24_000)
    }

    #[test]
    fn center_position_is_symmetric() {
        let t = towers();
        let c = t.carriage_positions([0, 0, 0]).unwrap();
        assert_eq!(c[0], c[1]);
        // sqrt(rod^2 - radius^2) = sqrt(20000^2 - 8000^2) ~= 18330
        assert!((c[0] - 18_330).abs() <= 1, "c = {c:?}");
        assert!((c[2] - c[0]).abs() <= 1);
    }

    #[test]
    fn z_shift_moves_all_towers_equally() {
        let t = towers();
        let low = t.carriage_positions([0, 0, 0]).unwrap();
        let high = t.carriage_positions([0, 0, 4000]).unwrap();
        for i in 0..3 {
            assert_eq!(high[i] - low[i], 4000);
        }
    }

    #[test]
    fn solution_lands_within_a_step() {
        // Check the solve against the rod-length constraint directly.
        let t = towers();
        let cart = [3000, -2500, 1000];
        let c = t.carriage_positions(cart).unwrap();
        for i in 0..3 {
            let dx = t.tower_x[i] - cart[0] as i64;
            let dy = t.tower_y[i] - cart[1] as i64;
            let dz = c[i] as i64 - cart[2] as i64;
            let reach = ((dx * dx + dy * dy + dz * dz) as f64).sqrt();
            let rod = (t.rod_squared as f64).sqrt();
            assert!((reach - rod).abs() <= 1.0, "tower {i}: {reach} vs {rod}");
        }
    }

    #[test]
    fn out_of_reach_is_rejected() {
        let t = towers();
        // Far outside the rod reach of tower 3.
        assert!(t.carriage_positions([0, -30_000, 0]).is_none());
    }

    #[test]
    fn plane_fit_recovers_height() {
        // Three points on the plane z = 10 + x / 100.
        let p1 = [0, 0, 10];
        let p2 = [1000, 0, 20];
        let p3 = [0, 1000, 10];
        let f = plane_from_points(p1, p2, p3);
        assert!((z_offset(f, 0, 0) - 10.0).abs() < 1e-9);
        assert!((z_offset(f, 500, 500) - 15.0).abs() < 1e-9);
        assert!((z_offset(f, 1000, 1000) - 20.0).abs() < 1e-9);
    }
}
