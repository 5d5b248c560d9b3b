// Technical indicators module
// Only the volatility unit used for stop placement lives here

pub mod atr;

pub use atr::{calculate_atr, volatility_unit};
