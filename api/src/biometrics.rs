use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Placeholder for a metric that could not be read today.
pub const SENTINEL: &str = "-";

/// One intraday sample, e.g. `{"time": "14:32:00", "value": 71}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataPoint {
    pub time: String,
    pub value: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SleepSummary {
    pub asleep: u64,
    pub eff: u64,
    pub rem: u64,
    pub deep: u64,
    pub wake: u64,
    #[serde(skip)]
    pub light: u64,
}

/// Best-effort view of the user's current readings.
///
/// Every metric degrades on its own: a failed vendor call leaves [`SENTINEL`]
/// in that field, and a day without a sleep session drops the sleep keys.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BiometricSnapshot {
    pub date: String,
    pub time: Option<String>,
    pub steps: Value,
    pub calories: Value,
    pub bpm: Value,
    pub sedentary: Value,
    #[serde(flatten)]
    pub sleep: Option<SleepSummary>,
}

impl BiometricSnapshot {
    pub fn empty(date: impl Into<String>) -> Self {
        Self {
            date: date.into(),
            time: None,
            steps: sentinel(),
            calories: sentinel(),
            bpm: sentinel(),
            sedentary: sentinel(),
            sleep: None,
        }
    }

    /// Single-line summary printed by `poll_biometrics`.
    pub fn compact(&self) -> String {
        let sleep = self.sleep.clone().unwrap_or_default();
        format!(
            "date:{} time:{} heartrate:{} steps:{} calories:{} minutessedentary:{} \
             asleep:{} eff:{} rem:{} deep:{} wake:{}",
            self.date,
            self.time.as_deref().unwrap_or("--:--"),
            plain(&self.bpm),
            plain(&self.steps),
            plain(&self.calories),
            plain(&self.sedentary),
            sleep.asleep,
            sleep.eff,
            sleep.rem,
            sleep.deep,
            sleep.wake,
        )
    }
}

pub fn sentinel() -> Value {
    Value::String(SENTINEL.to_string())
}

/// Render a JSON value without quotes around strings.
pub fn plain(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
