//! Hourly/daily/weekly accuracy summaries over matched pairs.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::accuracy::round_half_up;
use crate::matcher::{MatchWindow, MatchedPair};
use crate::records::FuelType;
use crate::timestamp::{truncate, Granularity};

/// How one actual value is chosen when several telemetry records fall in a
/// prediction's window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TieBreak {
    /// Closest telemetry hour to the prediction's creation hour, then the
    /// latest-arriving record.
    #[default]
    NearestHour,
    /// Every candidate pair contributes.
    AllCandidates,
}

impl TieBreak {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NearestHour => "nearest_hour",
            Self::AllCandidates => "all_candidates",
        }
    }
}

impl fmt::Display for TieBreak {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TieBreak {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "nearest" | "nearest_hour" => Ok(Self::NearestHour),
            "all" | "all_candidates" => Ok(Self::AllCandidates),
            other => Err(format!("unknown tie-break policy: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateSummary {
    pub granularity: Granularity,
    pub period_start: DateTime<Utc>,
    pub fuel_type: FuelType,
    pub total_predictions: u64,
    pub avg_error_pct: Option<f64>,
    pub worst_error_pct: Option<f64>,
    pub error_std_dev: Option<f64>,
}

/// Scored pairs after the tie-break, in input order.
pub fn select_pairs(pairs: &[MatchedPair], tie_break: TieBreak) -> Vec<&MatchedPair> {
    let scored = pairs.iter().filter(|pair| pair.actual_value.is_some());

    match tie_break {
        TieBreak::AllCandidates => scored.collect(),
        TieBreak::NearestHour => {
            let mut best: HashMap<i64, &MatchedPair> = HashMap::new();
            for pair in scored {
                best.entry(pair.prediction_id)
                    .and_modify(|current| {
                        if prefer(pair, *current) {
                            *current = pair;
                        }
                    })
                    .or_insert(pair);
            }
            pairs
                .iter()
                .filter(|pair| {
                    best.get(&pair.prediction_id)
                        .map(|chosen| std::ptr::eq(*chosen, *pair))
                        .unwrap_or(false)
                })
                .collect()
        }
    }
}

pub fn aggregate(
    pairs: &[MatchedPair],
    granularity: Granularity,
    tie_break: TieBreak,
) -> Vec<AggregateSummary> {
    let selected = select_pairs(pairs, tie_break);

    let mut groups: BTreeMap<(DateTime<Utc>, FuelType), Vec<Option<f64>>> = BTreeMap::new();
    for pair in &selected {
        let period_start = truncate(pair.actual_timestamp, granularity);
        groups
            .entry((period_start, pair.fuel_type.clone()))
            .or_default()
            .push(pair.error_percentage);
    }

    debug!(
        component = "aggregate",
        event = "aggregate.grouped",
        granularity = granularity.as_str(),
        tie_break = tie_break.as_str(),
        input_pairs = pairs.len(),
        selected_pairs = selected.len(),
        groups = groups.len()
    );

    let mut out: Vec<AggregateSummary> = groups
        .into_iter()
        .map(|((period_start, fuel_type), percentages)| {
            summarize(granularity, period_start, fuel_type, &percentages)
        })
        .collect();

    out.sort_by(|a, b| {
        b.period_start
            .cmp(&a.period_start)
            .then(a.fuel_type.cmp(&b.fuel_type))
    });
    out
}

/// Identifies the matching semantics a summary set was built with.
pub fn matching_fingerprint(window: &MatchWindow, tie_break: TieBreak) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("lookback_hours:{};", window.lookback_hours));
    hasher.update(format!("lookahead_hours:{};", window.lookahead_hours));
    hasher.update(format!("tie_break:{};", tie_break.as_str()));
    hex::encode(hasher.finalize())
}

fn prefer(candidate: &MatchedPair, current: &MatchedPair) -> bool {
    candidate
        .hour_distance()
        .cmp(&current.hour_distance())
        .then(current.telemetry_id.cmp(&candidate.telemetry_id))
        .is_lt()
}

fn summarize(
    granularity: Granularity,
    period_start: DateTime<Utc>,
    fuel_type: FuelType,
    percentages: &[Option<f64>],
) -> AggregateSummary {
    let mut values: Vec<f64> = percentages.iter().flatten().copied().collect();
    values.sort_by(f64::total_cmp);

    let (avg, worst, std_dev) = if values.is_empty() {
        (None, None, None)
    } else {
        let n = values.len() as f64;
        let mean = values.iter().sum::<f64>() / n;
        let worst = values.last().copied();
        let std_dev = if values.len() < 2 {
            None
        } else {
            let variance = values
                .iter()
                .map(|v| {
                    let d = *v - mean;
                    d * d
                })
                .sum::<f64>()
                / (n - 1.0);
            Some(variance.sqrt())
        };
        (Some(mean), worst, std_dev)
    };

    AggregateSummary {
        granularity,
        period_start,
        fuel_type,
        total_predictions: percentages.len() as u64,
        avg_error_pct: avg.and_then(round_half_up),
        worst_error_pct: worst.and_then(round_half_up),
        error_std_dev: std_dev.and_then(round_half_up),
    }
}
