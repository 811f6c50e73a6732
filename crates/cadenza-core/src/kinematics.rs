// Kinematics variants for the supported drive systems.

pub mod cartesian;
pub mod corexy;
pub mod delta;

pub use corexy::GantryVariant;
pub use delta::DeltaTowers;

/// Drive-system kinematics, selected from the machine configuration.
///
/// The transform maps absolute cartesian step positions onto actuator
/// (tower) step positions. For the linear variants it is exact and
/// invertible; for delta it fails when the target lies outside the
/// reachable volume.
#[derive(Debug, Clone)]
pub enum Kinematics {
    Cartesian,
    CoreXy(GantryVariant),
    Delta(DeltaTowers),
}

impl Kinematics {
    pub fn is_delta(&self) -> bool {
        matches!(self, Kinematics::Delta(_))
    }

    /// Absolute cartesian steps to absolute actuator steps.
    ///
    /// Returns `None` when a delta target is geometrically unreachable.
    pub fn to_towers(&self, cart: [i32; 3]) -> Option<[i32; 3]> {
        match self {
            Kinematics::Cartesian => Some(cartesian::to_towers(cart)),
            Kinematics::CoreXy(variant) => Some(variant.to_towers(cart)),
            Kinematics::Delta(towers) => towers.carriage_positions(cart),
        }
    }

    /// Tower step deltas for a relative cartesian move. Exact on the
    /// linear variants; `None` on delta, where displacements depend on
    /// the absolute position.
    pub fn to_tower_deltas(&self, cart: [i64; 3]) -> Option<[i64; 3]> {
        match self {
            Kinematics::Cartesian => Some(cart),
            Kinematics::CoreXy(variant) => {
                let [x, y, z] = cart;
                Some(match variant {
                    GantryVariant::Xy => [x + y, x - y, z],
                    GantryVariant::Yx => [y + x, y - x, z],
                })
            }
            Kinematics::Delta(_) => None,
        }
    }

    /// Inverse transform, used at homing on the linear variants.
    ///
    /// Delta machines home by setting carriage steps directly, so no
    /// inverse is provided for them.
    pub fn from_towers(&self, towers: [i32; 3]) -> Option<[i32; 3]> {
        match self {
            Kinematics::Cartesian => Some(cartesian::from_towers(towers)),
            Kinematics::CoreXy(variant) => Some(variant.from_towers(towers)),
            Kinematics::Delta(_) => None,
        }
    }
}
