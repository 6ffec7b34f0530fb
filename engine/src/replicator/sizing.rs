use broker::types::round_lots;

/// Scale a master volume by the follower's lot multiplier.
///
/// A multiplier of 0 (or below) disables sizing and copies 1:1. The result
/// is rounded to broker lot granularity; min-lot and max-lot clamping happen
/// at the terminal layer where live symbol info is available.
pub fn scale_volume(master_volume: f64, lot_multiplier: f64) -> f64 {
    let factor = if lot_multiplier > 0.0 {
        lot_multiplier
    } else {
        1.0
    };
    round_lots(master_volume * factor)
}
