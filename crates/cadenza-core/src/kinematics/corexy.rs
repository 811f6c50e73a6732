// CoreXY / H-Bot kinematics - two belts drive x and y jointly.

use serde::{Deserialize, Serialize};

/// Belt routing variant. `Xy` is the common CoreXY arrangement
/// (tower A = x + y, tower B = x - y); `Yx` swaps the roles.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GantryVariant {
    #[default]
    Xy,
    Yx,
}

impl GantryVariant {
    /// Parse a variant from a configuration string.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "xy" | "corexy" => Some(GantryVariant::Xy),
            "yx" | "hbot" => Some(GantryVariant::Yx),
            _ => None,
        }
    }

    pub fn to_towers(&self, cart: [i32; 3]) -> [i32; 3] {
        let [x, y, z] = cart;
        match self {
            GantryVariant::Xy => [x + y, x - y, z],
            GantryVariant::Yx => [y + x, y - x, z],
        }
    }

    pub fn from_towers(&self, towers: [i32; 3]) -> [i32; 3] {
        let [a, b, z] = towers;
        match self {
            GantryVariant::Xy => [(a + b) / 2, (a - b) / 2, z],
            GantryVariant::Yx => [(a - b) / 2, (a + b) / 2, z],
        }
    }

    /// Map tower travel (mm) back to cartesian x/y components, for
    /// distance computation on gantry moves.
    pub fn cartesian_components(&self, a: f64, b: f64) -> (f64, f64) {
        match self {
            GantryVariant::Xy => {
                let x = 0.5 * (a + b);
                (x, a - x)
            }
            GantryVariant::Yx => {
                let y = 0.5 * (a + b);
                (a - y, y)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn variant_parse() {
        assert_eq!(GantryVariant::parse("xy"), Some(GantryVariant::Xy));
        assert_eq!(GantryVariant::parse("corexy"), Some(GantryVariant::Xy));
        assert_eq!(GantryVariant::parse("hbot"), Some(GantryVariant::Yx));
        assert_eq!(GantryVariant::parse("polar"), None);
    }

    #[test]
    fn xy_sums_and_differences() {
        let towers = GantryVariant::Xy.to_towers([30, 10, 5]);
        assert_eq!(towers, [40, 20, 5]);
        assert_eq!(GantryVariant::Xy.from_towers(towers), [30, 10, 5]);
    }

    #[test]
    fn yx_swaps_the_difference() {
        let towers = GantryVariant::Yx.to_towers([30, 10, 5]);
        assert_eq!(towers, [40, -20, 5]);
        assert_eq!(GantryVariant::Yx.from_towers(towers), [30, 10, 5]);
    }

    #[test]
    fn pure_x_drives_both_towers() {
        let towers = GantryVariant::Xy.to_towers([100, 0, 0]);
        assert_eq!(towers, [100, 100, 0]);
    }
}
