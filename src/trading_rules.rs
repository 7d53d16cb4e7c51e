use crate::models::Direction;
use crate::symbols::round_to_digits;

pub const PRICE_EPSILON: f64 = 1e-6;
const ROUNDING_EPSILON: f64 = 1e-7;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClampedStops {
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub stop_loss_adjusted: bool,
    pub take_profit_adjusted: bool,
}

/// Pulls stop-loss and take-profit to at least `min_distance` from `current_price`
/// and rounds both to `digits`. Already-legal levels come back unchanged.
pub fn clamp_stops(
    direction: Direction,
    current_price: f64,
    proposed_sl: Option<f64>,
    proposed_tp: Option<f64>,
    min_distance: f64,
    digits: u32,
) -> ClampedStops {
    let min_distance = min_distance.max(0.0);
    let (sl_boundary, tp_boundary) = match direction {
        Direction::Buy => (current_price - min_distance, current_price + min_distance),
        Direction::Sell => (current_price + min_distance, current_price - min_distance),
    };

    let (stop_loss, stop_loss_adjusted) = match usable_level(proposed_sl) {
        Some(level) => {
            let (value, adjusted) = clamp_level(level, sl_boundary, direction.sign(), digits);
            (Some(value), adjusted)
        }
        None => (None, false),
    };
    // Take-profit sits on the opposite side of price, so the outward direction flips.
    let (take_profit, take_profit_adjusted) = match usable_level(proposed_tp) {
        Some(level) => {
            let (value, adjusted) = clamp_level(level, tp_boundary, -direction.sign(), digits);
            (Some(value), adjusted)
        }
        None => (None, false),
    };

    ClampedStops {
        stop_loss,
        take_profit,
        stop_loss_adjusted,
        take_profit_adjusted,
    }
}

fn usable_level(level: Option<f64>) -> Option<f64> {
    level.filter(|value| value.is_finite() && *value > 0.0)
}

/// `side` is +1 when the level must stay at or below the boundary, -1 when at or above.
fn clamp_level(level: f64, boundary: f64, side: f64, digits: u32) -> (f64, bool) {
    let rounded = round_to_digits(level, digits);
    let violation = (rounded - boundary) * side;
    if violation > PRICE_EPSILON {
        (round_outward(boundary, side, digits), true)
    } else {
        (rounded, false)
    }
}

fn round_outward(boundary: f64, side: f64, digits: u32) -> f64 {
    let factor = 10f64.powi(digits as i32);
    if side > 0.0 {
        (boundary * factor + ROUNDING_EPSILON).floor() / factor
    } else {
        (boundary * factor - ROUNDING_EPSILON).ceil() / factor
    }
}

/// True when `stop` keeps the broker minimum distance from `current_price` on the protective side.
pub fn is_stop_legal(direction: Direction, current_price: f64, stop: f64, min_distance: f64) -> bool {
    match direction {
        Direction::Buy => stop <= current_price - min_distance + PRICE_EPSILON,
        Direction::Sell => stop >= current_price + min_distance - PRICE_EPSILON,
    }
}

/// True when `candidate` protects more than `current` (higher for longs, lower for shorts).
pub fn is_tighter(direction: Direction, candidate: f64, current: Option<f64>) -> bool {
    match current {
        None => true,
        Some(existing) => (candidate - existing) * direction.sign() > PRICE_EPSILON,
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StopMove {
    /// Move the stop to entry (plus offset). `needs_modify` is false when the
    /// broker stop already protects at least that much.
    Breakeven { level: f64, needs_modify: bool },
    Trailing(f64),
}

impl StopMove {
    pub fn value(&self) -> f64 {
        match self {
            StopMove::Breakeven { level, .. } => *level,
            StopMove::Trailing(value) => *value,
        }
    }

    pub fn reason(&self) -> &'static str {
        match self {
            StopMove::Breakeven { .. } => "breakeven",
            StopMove::Trailing(_) => "trailing",
        }
    }
}

pub struct StopMoveParams {
    pub direction: Direction,
    pub entry_price: f64,
    /// Distance from entry to the stop the trade opened with, in price units.
    pub initial_stop_distance: Option<f64>,
    pub current_stop: Option<f64>,
    pub current_price: f64,
    pub breakeven_armed: bool,
    pub trigger_ratio: f64,
    /// Offset beyond entry, in price units.
    pub breakeven_offset: f64,
    /// Trailing distance in price units; zero disables trailing.
    pub trailing_distance: f64,
    pub min_distance: f64,
    pub digits: u32,
}

/// Decides the next protective stop adjustment, if any. Moves are one-way and
/// only proposed when the resulting level is broker-legal at `current_price`.
pub fn compute_stop_move(params: StopMoveParams) -> Option<StopMove> {
    let StopMoveParams {
        direction,
        entry_price,
        initial_stop_distance,
        current_stop,
        current_price,
        breakeven_armed,
        trigger_ratio,
        breakeven_offset,
        trailing_distance,
        min_distance,
        digits,
    } = params;

    if !current_price.is_finite() || current_price <= 0.0 {
        return None;
    }
    let favourable_move = (current_price - entry_price) * direction.sign();

    if !breakeven_armed {
        let distance = initial_stop_distance?;
        if favourable_move <= 0.0 || favourable_move + PRICE_EPSILON < trigger_ratio * distance {
            return None;
        }
        let level = round_to_digits(
            entry_price + direction.sign() * breakeven_offset.max(0.0),
            digits,
        );
        if !is_tighter(direction, level, current_stop) {
            return Some(StopMove::Breakeven {
                level,
                needs_modify: false,
            });
        }
        if !is_stop_legal(direction, current_price, level, min_distance) {
            return None;
        }
        return Some(StopMove::Breakeven {
            level,
            needs_modify: true,
        });
    }

    if trailing_distance <= 0.0 {
        return None;
    }
    let distance = trailing_distance.max(min_distance);
    let side = direction.sign();
    let candidate = round_outward(current_price - side * distance, side, digits);
    if is_tighter(direction, candidate, current_stop)
        && is_stop_legal(direction, current_price, candidate, min_distance)
    {
        return Some(StopMove::Trailing(candidate));
    }

    None
}
