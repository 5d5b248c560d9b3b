use serde::de::Deserializer;
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Timeframes the analyzers report on
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "4h")]
    H4,
}

impl Timeframe {
    pub const ALL: [Timeframe; 4] = [Timeframe::M5, Timeframe::M15, Timeframe::H1, Timeframe::H4];

    fn index(self) -> usize {
        match self {
            Timeframe::M5 => 0,
            Timeframe::M15 => 1,
            Timeframe::H1 => 2,
            Timeframe::H4 => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Timeframe::M5 => "5m",
            Timeframe::M15 => "15m",
            Timeframe::H1 => "1h",
            Timeframe::H4 => "4h",
        }
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fixed table with one slot per [`Timeframe`]
///
/// Serialized as a map keyed by timeframe label (`"5m"`, `"1h"`, ...). Unknown labels
/// are rejected while deserializing, so a bad key fails when the report or config is
/// loaded instead of silently missing at lookup time. Absent keys hold `T::default()`.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeframeMap<T> {
    slots: [T; 4],
}

impl<T: Default> Default for TimeframeMap<T> {
    fn default() -> Self {
        Self {
            slots: std::array::from_fn(|_| T::default()),
        }
    }
}

impl<T> TimeframeMap<T> {
    pub fn get(&self, timeframe: Timeframe) -> &T {
        &self.slots[timeframe.index()]
    }

    pub fn get_mut(&mut self, timeframe: Timeframe) -> &mut T {
        &mut self.slots[timeframe.index()]
    }

    pub fn set(&mut self, timeframe: Timeframe, value: T) {
        self.slots[timeframe.index()] = value;
    }

    pub fn iter(&self) -> impl Iterator<Item = (Timeframe, &T)> {
        Timeframe::ALL.into_iter().zip(self.slots.iter())
    }
}

impl<T: Default> FromIterator<(Timeframe, T)> for TimeframeMap<T> {
    fn from_iter<I: IntoIterator<Item = (Timeframe, T)>>(iter: I) -> Self {
        let mut map = Self::default();
        for (timeframe, value) in iter {
            map.set(timeframe, value);
        }
        map
    }
}

impl<T: Serialize> Serialize for TimeframeMap<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.slots.len()))?;
        for (timeframe, value) in self.iter() {
            map.serialize_entry(&timeframe, value)?;
        }
        map.end()
    }
}

impl<'de, T: Deserialize<'de> + Default> Deserialize<'de> for TimeframeMap<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let entries = BTreeMap::<Timeframe, T>::deserialize(deserializer)?;
        Ok(entries.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_slots_default() {
        let map: TimeframeMap<Vec<f64>> = serde_json::from_str(r#"{"1h": [1.0, 2.0]}"#).unwrap();
        assert_eq!(map.get(Timeframe::H1), &vec![1.0, 2.0]);
        assert!(map.get(Timeframe::M5).is_empty());
        assert!(map.get(Timeframe::H4).is_empty());
    }

    #[test]
    fn test_unknown_timeframe_rejected_at_load() {
        let result: Result<TimeframeMap<f64>, _> = serde_json::from_str(r#"{"3m": 1.0}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_serializes_as_labelled_map() {
        let map: TimeframeMap<f64> = [(Timeframe::M5, 1.0), (Timeframe::H4, 2.0)]
            .into_iter()
            .collect();
        let json = serde_json::to_value(&map).unwrap();
        assert_eq!(json["5m"], 1.0);
        assert_eq!(json["4h"], 2.0);
        assert_eq!(json["15m"], 0.0);
    }

    #[test]
    fn test_iter_visits_every_timeframe_in_order() {
        let map: TimeframeMap<u8> = TimeframeMap::default();
        let order: Vec<Timeframe> = map.iter().map(|(tf, _)| tf).collect();
        assert_eq!(order, Timeframe::ALL.to_vec());
    }
}
