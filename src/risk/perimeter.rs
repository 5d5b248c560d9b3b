use serde::{Deserialize, Serialize};

use crate::config::PerimeterConfig;
use crate::indicators::volatility_unit;
use crate::models::{Side, Timeframe};
use crate::reports::ReportBundle;

const MIN_VOLATILITY: f64 = 1e-9;
const PRICE_EPSILON: f64 = 1e-9;

/// Where the protective stop was anchored
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopAnchor {
    Strategic,
    Tactical,
    Volatility,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProfitTarget {
    pub price: f64,
    /// Share of the original size to take off at this price
    pub exit_fraction: f64,
}

/// Stops and staged targets for a prospective or resized position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskPlan {
    pub protective_stop: f64,
    pub catastrophic_stop: f64,
    pub targets: Vec<ProfitTarget>,
    pub volatility: f64,
    pub anchor: StopAnchor,
}

/// Derives stop and target levels from structure and volatility. Holds no state
/// beyond its configuration.
#[derive(Debug, Clone)]
pub struct PerimeterArchitect {
    config: PerimeterConfig,
}

impl PerimeterArchitect {
    pub fn new(config: &PerimeterConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    pub fn config(&self) -> &PerimeterConfig {
        &self.config
    }

    /// Plan a position's perimeter. None means no numerically safe stop exists and
    /// the entry must not go ahead.
    pub fn plan(&self, side: Side, entry_price: f64, bundle: &ReportBundle) -> Option<RiskPlan> {
        if !(entry_price > 0.0) {
            tracing::error!("Perimeter unavailable: invalid entry price {}", entry_price);
            return None;
        }

        let tactical = self.config.tactical_timeframe;
        let candles = bundle.candles(tactical);
        if candles.is_empty() {
            tracing::error!(
                "Perimeter unavailable: {} data missing for {}",
                tactical,
                bundle.symbol
            );
            return None;
        }

        let atr = volatility_unit(candles, self.config.atr_period).unwrap_or(0.0);
        if !(atr >= MIN_VOLATILITY) {
            tracing::error!(
                "Perimeter unavailable: zero volatility on {} for {}",
                tactical,
                bundle.symbol
            );
            return None;
        }

        let (protective_stop, anchor) = self.protective_stop(side, entry_price, atr, bundle);
        let catastrophic_stop = protective_stop - side.sign() * atr * self.config.catastrophic_atr_extension;
        let targets = self.targets(side, entry_price, catastrophic_stop, bundle);

        tracing::info!(
            "Perimeter for {:?} @ {:.4}: stop {:.4} ({:?}), catastrophic {:.4}, {} target(s)",
            side,
            entry_price,
            protective_stop,
            anchor,
            catastrophic_stop,
            targets.len()
        );

        Some(RiskPlan {
            protective_stop,
            catastrophic_stop,
            targets,
            volatility: atr,
            anchor,
        })
    }

    /// Nearest qualifying structure on the loss side, widened by a volatility buffer.
    /// Strategic timeframes first, then the tactical one, then a pure ATR offset.
    fn protective_stop(
        &self,
        side: Side,
        entry_price: f64,
        atr: f64,
        bundle: &ReportBundle,
    ) -> (f64, StopAnchor) {
        let buffer = atr * self.config.structure_buffer_atr;
        let tiers = [
            (StopAnchor::Strategic, self.config.strategic_timeframes.as_slice()),
            (StopAnchor::Tactical, std::slice::from_ref(&self.config.tactical_timeframe)),
        ];

        for (anchor, timeframes) in tiers {
            let nearest = support_points(side, bundle, timeframes)
                .into_iter()
                .filter(|&p| is_beyond(side.opposite(), entry_price, p))
                .min_by(|a, b| distance(entry_price, *a).total_cmp(&distance(entry_price, *b)));

            if let Some(point) = nearest {
                tracing::debug!("Stop anchored on {:?} structure at {:.4}", anchor, point);
                return (point - side.sign() * buffer, anchor);
            }
        }

        tracing::warn!("No structure for stop placement, falling back to volatility offset");
        (
            entry_price - side.sign() * atr * self.config.atr_multiplier,
            StopAnchor::Volatility,
        )
    }

    fn targets(
        &self,
        side: Side,
        entry_price: f64,
        catastrophic_stop: f64,
        bundle: &ReportBundle,
    ) -> Vec<ProfitTarget> {
        let policy = &self.config.exit_policy;
        if policy.is_empty() {
            return Vec::new();
        }

        let mut timeframes = self.config.strategic_timeframes.clone();
        if !timeframes.contains(&self.config.tactical_timeframe) {
            timeframes.push(self.config.tactical_timeframe);
        }

        // Opposing structure: the levels that would stop an entry on the other side
        let mut structural: Vec<f64> = support_points(side.opposite(), bundle, &timeframes)
            .into_iter()
            .filter(|&p| is_beyond(side, entry_price, p))
            .collect();
        structural.sort_by(|a, b| distance(entry_price, *a).total_cmp(&distance(entry_price, *b)));
        structural.dedup_by(|a, b| (*a - *b).abs() < PRICE_EPSILON);
        structural.truncate(2.min(policy.len()));

        let risk_per_unit = (entry_price - catastrophic_stop).abs();
        let rr_price = entry_price + side.sign() * risk_per_unit * self.config.min_reward_risk;
        let qualifies = |p: f64| distance(entry_price, p) >= distance(entry_price, rr_price) - PRICE_EPSILON;

        let mut prices = structural.clone();
        if !structural.iter().any(|&p| qualifies(p)) {
            prices.truncate(policy.len() - 1);
            prices.push(rr_price);
            tracing::debug!(
                "No structural target meets {:.2}R, added {:.4}",
                self.config.min_reward_risk,
                rr_price
            );
        }

        // Strictly ordered moving away from entry
        prices.sort_by(|a, b| distance(entry_price, *a).total_cmp(&distance(entry_price, *b)));
        prices.dedup_by(|a, b| (*a - *b).abs() < PRICE_EPSILON);

        let last = prices.len().saturating_sub(1);
        let mut assigned = 0.0;
        prices
            .into_iter()
            .enumerate()
            .map(|(i, price)| {
                let exit_fraction = if i == last { 1.0 - assigned } else { policy[i] };
                assigned += exit_fraction;
                ProfitTarget {
                    price,
                    exit_fraction,
                }
            })
            .collect()
    }
}

/// Structural levels that would support a position on `side`: swing lows, bullish
/// block bottoms and bullish gap tops for a long; the mirror for a short.
fn support_points(side: Side, bundle: &ReportBundle, timeframes: &[Timeframe]) -> Vec<f64> {
    let mut points = Vec::new();

    for &tf in timeframes {
        if let Some(structure) = &bundle.structure {
            points.extend(structure.swing_levels(side, tf));
        }

        let blocks = bundle.order_blocks.get(tf).for_side(side);
        let gaps = bundle.fair_value_gaps.get(tf).for_side(side);
        match side {
            Side::Long => {
                points.extend(blocks.iter().map(|b| b.price_low));
                points.extend(gaps.iter().map(|g| g.price_high));
            }
            Side::Short => {
                points.extend(blocks.iter().map(|b| b.price_high));
                points.extend(gaps.iter().map(|g| g.price_low));
            }
        }
    }

    points.retain(|p| p.is_finite() && *p > 0.0);
    points
}

/// True when `price` lies strictly on the profit side of `entry` for `side`
fn is_beyond(side: Side, entry: f64, price: f64) -> bool {
    (price - entry) * side.sign() > PRICE_EPSILON
}

fn distance(entry: f64, price: f64) -> f64 {
    (price - entry).abs()
}
