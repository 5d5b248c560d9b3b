//! Engine configuration.
//!
//! Built once at startup (defaults, then an optional TOML file, then `TRADEGUARD__*`
//! environment overrides), validated, and handed to each component by reference.

use std::path::Path;

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::models::{RiskLevel, Timeframe, TimeframeMap};
use crate::Result;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub initial_capital: f64,
    pub symbol: String,
    pub capital: CapitalConfig,
    pub perimeter: PerimeterConfig,
    pub execution: ExecutionConfig,
    pub tactical: TacticalConfig,
    pub gateway: GatewayConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            initial_capital: 10_000.0,
            symbol: "BTC/USDT".to_string(),
            capital: CapitalConfig::default(),
            perimeter: PerimeterConfig::default(),
            execution: ExecutionConfig::default(),
            tactical: TacticalConfig::default(),
            gateway: GatewayConfig::default(),
        }
    }
}

/// What to do when a reservation would push allocated cost past the exposure cap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExposureOverflow {
    Deny,
    /// Reserve only the remaining headroom
    Cap,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RiskLevelMultipliers {
    pub full: f64,
    pub half: f64,
    pub scout: f64,
}

impl RiskLevelMultipliers {
    pub fn for_level(&self, level: RiskLevel) -> f64 {
        match level {
            RiskLevel::Full => self.full,
            RiskLevel::Half => self.half,
            RiskLevel::Scout => self.scout,
        }
    }
}

impl Default for RiskLevelMultipliers {
    fn default() -> Self {
        Self {
            full: 1.0,
            half: 0.5,
            scout: 0.25,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CapitalConfig {
    pub risk_per_trade_percent: f64,
    pub max_exposure_percent: f64,
    pub risk_level_multipliers: RiskLevelMultipliers,
    /// Share of realized profit folded back into the risk base (0 = never compound)
    pub reinvestment_aggressiveness: f64,
    pub min_allocation_notional: f64,
    pub exposure_overflow: ExposureOverflow,
}

impl Default for CapitalConfig {
    fn default() -> Self {
        Self {
            risk_per_trade_percent: 1.0,
            max_exposure_percent: 10.0,
            risk_level_multipliers: RiskLevelMultipliers::default(),
            reinvestment_aggressiveness: 0.0,
            min_allocation_notional: 1.0,
            exposure_overflow: ExposureOverflow::Deny,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PerimeterConfig {
    pub atr_period: usize,
    /// Stop distance in ATR units when no structure is available
    pub atr_multiplier: f64,
    pub catastrophic_atr_extension: f64,
    /// Buffer placed beyond a structural stop point, in ATR units
    pub structure_buffer_atr: f64,
    pub min_reward_risk: f64,
    pub strategic_timeframes: Vec<Timeframe>,
    pub tactical_timeframe: Timeframe,
    /// Staged exit fractions, nearest target first
    pub exit_policy: Vec<f64>,
}

impl Default for PerimeterConfig {
    fn default() -> Self {
        Self {
            atr_period: 14,
            atr_multiplier: 2.0,
            catastrophic_atr_extension: 1.0,
            structure_buffer_atr: 0.2,
            min_reward_risk: 1.5,
            strategic_timeframes: vec![Timeframe::H4, Timeframe::H1],
            tactical_timeframe: Timeframe::M5,
            exit_policy: vec![0.5, 0.5],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    pub leverage: f64,
    pub max_flips_allowed: u32,
    pub flip_size_multiplier: f64,
    pub full_power_flip_multiplier: f64,
    /// Directional force magnitude that escalates the flip multiplier
    pub full_power_flip_threshold: f64,
    pub min_viable_size: f64,
    pub default_scale_in_ratio: f64,
    pub default_exit_ratio: f64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            leverage: 1.0,
            max_flips_allowed: 1,
            flip_size_multiplier: 1.5,
            full_power_flip_multiplier: 2.0,
            full_power_flip_threshold: 500.0,
            min_viable_size: 1e-8,
            default_scale_in_ratio: 0.5,
            default_exit_ratio: 0.5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringWeights {
    pub order_block: f64,
    pub fair_value_gap: f64,
    pub fibonacci: f64,
    pub divergence: f64,
    pub structure_break: f64,
    pub timeframes: TimeframeMap<f64>,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            order_block: 1.0,
            fair_value_gap: 1.0,
            fibonacci: 1.0,
            divergence: 1.0,
            structure_break: 1.5,
            timeframes: [
                (Timeframe::H4, 2.0),
                (Timeframe::H1, 1.5),
                (Timeframe::M15, 1.2),
                (Timeframe::M5, 1.0),
            ]
            .into_iter()
            .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TacticalConfig {
    /// Percentage distance (0.5 means 0.5%), not a fraction
    pub aov_proximity_percent: f64,
    pub min_true_net_force_for_entry: f64,
    /// Highest-ranked timeframe first
    pub regime_timeframes: Vec<Timeframe>,
    pub zone_timeframes: Vec<Timeframe>,
    pub catastrophic_threat_threshold: f64,
    pub proactive_threat_threshold: f64,
    pub proactive_exit_ratio: f64,
    pub weights: ScoringWeights,
}

impl Default for TacticalConfig {
    fn default() -> Self {
        Self {
            aov_proximity_percent: 0.5,
            min_true_net_force_for_entry: 15.0,
            regime_timeframes: vec![Timeframe::H4, Timeframe::H1, Timeframe::M15, Timeframe::M5],
            zone_timeframes: vec![Timeframe::H1, Timeframe::M15, Timeframe::M5],
            catastrophic_threat_threshold: 4.0,
            proactive_threat_threshold: 2.5,
            proactive_exit_ratio: 0.5,
            weights: ScoringWeights::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_factor: f64,
    pub requests_per_second: u32,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 100,
            max_delay_ms: 5_000,
            jitter_factor: 0.3,
            requests_per_second: 10,
        }
    }
}

impl EngineConfig {
    /// Load defaults, then `path` (if given), then `TRADEGUARD__SECTION__KEY` env vars
    pub fn load(path: Option<&Path>) -> Result<Self> {
        dotenvy::dotenv().ok();

        let mut builder = Config::builder().add_source(Config::try_from(&EngineConfig::default())?);
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        }
        builder = builder.add_source(
            Environment::with_prefix("TRADEGUARD")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: EngineConfig = builder.build()?.try_deserialize()?;
        config.validate()?;

        tracing::info!(
            "Configuration loaded for {} (capital ${:.2}, risk {}%, exposure cap {}%)",
            config.symbol,
            config.initial_capital,
            config.capital.risk_per_trade_percent,
            config.capital.max_exposure_percent
        );

        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.initial_capital > 0.0) {
            return Err(EngineError::config("initial_capital must be positive"));
        }
        if self.symbol.trim().is_empty() {
            return Err(EngineError::config("symbol must not be empty"));
        }

        let capital = &self.capital;
        check_percent("capital.risk_per_trade_percent", capital.risk_per_trade_percent)?;
        check_percent("capital.max_exposure_percent", capital.max_exposure_percent)?;
        let m = &capital.risk_level_multipliers;
        if [m.full, m.half, m.scout].iter().any(|v| !(*v > 0.0)) {
            return Err(EngineError::config("risk_level_multipliers must be positive"));
        }
        if !(0.0..=1.0).contains(&capital.reinvestment_aggressiveness) {
            return Err(EngineError::config(
                "capital.reinvestment_aggressiveness must be within [0, 1]",
            ));
        }
        if capital.min_allocation_notional < 0.0 {
            return Err(EngineError::config("capital.min_allocation_notional must not be negative"));
        }

        let perimeter = &self.perimeter;
        if perimeter.atr_period == 0 {
            return Err(EngineError::config("perimeter.atr_period must be at least 1"));
        }
        if !(perimeter.atr_multiplier > 0.0) {
            return Err(EngineError::config("perimeter.atr_multiplier must be positive"));
        }
        if !(perimeter.catastrophic_atr_extension > 0.0) {
            return Err(EngineError::config(
                "perimeter.catastrophic_atr_extension must be positive",
            ));
        }
        if perimeter.structure_buffer_atr < 0.0 {
            return Err(EngineError::config("perimeter.structure_buffer_atr must not be negative"));
        }
        if !(perimeter.min_reward_risk > 0.0) {
            return Err(EngineError::config("perimeter.min_reward_risk must be positive"));
        }
        if perimeter.exit_policy.is_empty() {
            return Err(EngineError::config("perimeter.exit_policy must not be empty"));
        }
        if perimeter.exit_policy.iter().any(|f| !(*f > 0.0 && *f <= 1.0)) {
            return Err(EngineError::config(
                "perimeter.exit_policy fractions must be within (0, 1]",
            ));
        }
        if perimeter.exit_policy.iter().sum::<f64>() > 1.0 + 1e-9 {
            return Err(EngineError::config("perimeter.exit_policy must not sum above 1"));
        }

        let execution = &self.execution;
        if !(execution.leverage > 0.0) {
            return Err(EngineError::config("execution.leverage must be positive"));
        }
        if !(execution.flip_size_multiplier > 1.0) || !(execution.full_power_flip_multiplier > 1.0) {
            return Err(EngineError::config(
                "flip multipliers must exceed 1 so a flip leaves a reverse position",
            ));
        }
        if !(execution.min_viable_size > 0.0) {
            return Err(EngineError::config("execution.min_viable_size must be positive"));
        }
        if !(execution.default_scale_in_ratio > 0.0 && execution.default_scale_in_ratio <= 2.0) {
            return Err(EngineError::config(
                "execution.default_scale_in_ratio must be within (0, 2]",
            ));
        }
        check_ratio("execution.default_exit_ratio", execution.default_exit_ratio)?;

        let tactical = &self.tactical;
        if !(tactical.aov_proximity_percent > 0.0) {
            return Err(EngineError::config("tactical.aov_proximity_percent must be positive"));
        }
        if tactical.min_true_net_force_for_entry < 0.0 {
            return Err(EngineError::config(
                "tactical.min_true_net_force_for_entry must not be negative",
            ));
        }
        if tactical.regime_timeframes.is_empty() || tactical.zone_timeframes.is_empty() {
            return Err(EngineError::config("tactical timeframe rankings must not be empty"));
        }
        if tactical.proactive_threat_threshold > tactical.catastrophic_threat_threshold {
            return Err(EngineError::config(
                "tactical.proactive_threat_threshold must not exceed catastrophic_threat_threshold",
            ));
        }
        check_ratio("tactical.proactive_exit_ratio", tactical.proactive_exit_ratio)?;

        if self.gateway.requests_per_second == 0 {
            return Err(EngineError::config("gateway.requests_per_second must be at least 1"));
        }
        if self.gateway.base_delay_ms > self.gateway.max_delay_ms {
            return Err(EngineError::config("gateway.base_delay_ms must not exceed max_delay_ms"));
        }
        if !(0.0..=1.0).contains(&self.gateway.jitter_factor) {
            return Err(EngineError::config("gateway.jitter_factor must be within [0, 1]"));
        }

        Ok(())
    }

    /// Allocated cost may never exceed this share of current capital
    pub fn max_exposure_fraction(&self) -> f64 {
        self.capital.max_exposure_percent / 100.0
    }
}

fn check_percent(name: &str, value: f64) -> Result<()> {
    if value > 0.0 && value <= 100.0 {
        Ok(())
    } else {
        Err(EngineError::config(format!("{name} must be within (0, 100], got {value}")))
    }
}

fn check_ratio(name: &str, value: f64) -> Result<()> {
    if value > 0.0 && value < 1.0 {
        Ok(())
    } else {
        Err(EngineError::config(format!("{name} must be within (0, 1), got {value}")))
    }
}
