//! Fitbit Web API reads for "today": intraday series and the sleep log.

use std::time::Duration;

use chrono::NaiveDate;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use thiserror::Error;

use crate::biometrics::{BiometricSnapshot, DataPoint, SleepSummary};

pub const FITBIT_API_BASE: &str = "https://api.fitbit.com";

/// Points returned by the history routes.
pub const HISTORY_WINDOW: usize = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resource {
    Steps,
    Calories,
    HeartRate,
    MinutesSedentary,
    Distance,
    Floors,
    Elevation,
    MinutesLightlyActive,
    MinutesFairlyActive,
    MinutesVeryActive,
}

impl Resource {
    /// Resources that make up a [`BiometricSnapshot`], in request order.
    pub const SNAPSHOT: [Resource; 4] = [
        Resource::Steps,
        Resource::Calories,
        Resource::HeartRate,
        Resource::MinutesSedentary,
    ];

    pub const ALL: [Resource; 10] = [
        Resource::Steps,
        Resource::Calories,
        Resource::Distance,
        Resource::Floors,
        Resource::Elevation,
        Resource::HeartRate,
        Resource::MinutesSedentary,
        Resource::MinutesLightlyActive,
        Resource::MinutesFairlyActive,
        Resource::MinutesVeryActive,
    ];

    pub fn path(&self) -> &'static str {
        match self {
            Resource::Steps => "activities/steps",
            Resource::Calories => "activities/calories",
            Resource::HeartRate => "activities/heart",
            Resource::MinutesSedentary => "activities/minutesSedentary",
            Resource::Distance => "activities/distance",
            Resource::Floors => "activities/floors",
            Resource::Elevation => "activities/elevation",
            Resource::MinutesLightlyActive => "activities/minutesLightlyActive",
            Resource::MinutesFairlyActive => "activities/minutesFairlyActive",
            Resource::MinutesVeryActive => "activities/minutesVeryActive",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Resource::Steps => "Steps",
            Resource::Calories => "Calories",
            Resource::HeartRate => "HeartRate",
            Resource::MinutesSedentary => "MinutesSedentary",
            Resource::Distance => "Distance",
            Resource::Floors => "Floors",
            Resource::Elevation => "Elevation",
            Resource::MinutesLightlyActive => "MinutesLightlyActive",
            Resource::MinutesFairlyActive => "MinutesFairlyActive",
            Resource::MinutesVeryActive => "MinutesVeryActive",
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected status {0}")]
    Status(StatusCode),

    #[error("still rate limited after {0} attempts")]
    RateLimited(u32),
}

impl FetchError {
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, FetchError::Status(StatusCode::UNAUTHORIZED))
    }
}

/// How often to re-issue a request the vendor answered with 429.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    /// Single attempt; what the web routes use.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
        }
    }

    /// Five attempts waiting 1s, 2s, 4s, 8s between them.
    pub fn rate_limited() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
        }
    }

    fn delay(&self, attempt: u32) -> Duration {
        self.base_delay * 2u32.saturating_pow(attempt)
    }
}

#[derive(Clone)]
pub struct FitbitClient {
    http: Client,
    base_url: String,
    access_token: String,
    retry: RetryPolicy,
}

impl FitbitClient {
    pub fn new(http: Client, base_url: &str, access_token: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            access_token: access_token.into(),
            retry: RetryPolicy::none(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn intraday_url(&self, resource: Resource, date: NaiveDate) -> String {
        format!(
            "{}/1/user/-/{}/date/{}/1d/1min.json",
            self.base_url,
            resource.path(),
            date.format("%Y-%m-%d")
        )
    }

    pub fn sleep_url(&self, date: NaiveDate) -> String {
        format!(
            "{}/1.2/user/-/sleep/date/{}.json",
            self.base_url,
            date.format("%Y-%m-%d")
        )
    }

    async fn get_json(&self, url: &str) -> Result<Value, FetchError> {
        let mut attempt = 0;
        loop {
            let response = self
                .http
                .get(url)
                .bearer_auth(&self.access_token)
                .send()
                .await?;

            let status = response.status();
            if status == StatusCode::TOO_MANY_REQUESTS {
                if attempt + 1 >= self.retry.max_attempts {
                    return Err(if self.retry.max_attempts > 1 {
                        FetchError::RateLimited(self.retry.max_attempts)
                    } else {
                        FetchError::Status(status)
                    });
                }
                let wait = self.retry.delay(attempt);
                tracing::warn!("rate limited on {}, waiting {:?}", url, wait);
                tokio::time::sleep(wait).await;
                attempt += 1;
                continue;
            }

            if status != StatusCode::OK {
                return Err(FetchError::Status(status));
            }

            return Ok(response.json().await?);
        }
    }

    pub async fn intraday(
        &self,
        resource: Resource,
        date: NaiveDate,
    ) -> Result<Vec<Value>, FetchError> {
        let body = self.get_json(&self.intraday_url(resource, date)).await?;
        Ok(extract_intraday(&body))
    }

    pub async fn latest(
        &self,
        resource: Resource,
        date: NaiveDate,
    ) -> Result<Option<DataPoint>, FetchError> {
        Ok(self.intraday(resource, date).await?.pop().and_then(data_point))
    }

    pub async fn sleep_summary(&self, date: NaiveDate) -> Result<Option<SleepSummary>, FetchError> {
        let body = self.get_json(&self.sleep_url(date)).await?;
        Ok(extract_sleep(&body))
    }

    /// Poll every snapshot resource one after another. Never fails: each
    /// resource that errors keeps its sentinel.
    pub async fn fetch_snapshot(&self, date: NaiveDate) -> BiometricSnapshot {
        let mut snapshot = BiometricSnapshot::empty(date.format("%Y-%m-%d").to_string());

        for resource in Resource::SNAPSHOT {
            let point = match self.latest(resource, date).await {
                Ok(Some(point)) => point,
                Ok(None) => {
                    tracing::debug!("no {} samples yet for {}", resource.label(), date);
                    continue;
                }
                Err(e) => {
                    tracing::warn!("failed to fetch {}: {}", resource.label(), e);
                    continue;
                }
            };

            // last writer wins, even if an earlier resource reported a later minute
            snapshot.time = Some(point.time);
            match resource {
                Resource::Steps => snapshot.steps = point.value,
                Resource::Calories => snapshot.calories = point.value,
                Resource::HeartRate => snapshot.bpm = point.value,
                Resource::MinutesSedentary => snapshot.sedentary = point.value,
                _ => {}
            }
        }

        match self.sleep_summary(date).await {
            Ok(sleep) => snapshot.sleep = sleep,
            Err(e) => tracing::warn!("failed to fetch sleep log: {}", e),
        }

        snapshot
    }

    /// Trailing `window` points of today's series exactly as the vendor sent
    /// them; empty on any failure.
    pub async fn last_values(
        &self,
        resource: Resource,
        date: NaiveDate,
        window: usize,
    ) -> Vec<Value> {
        match self.intraday(resource, date).await {
            Ok(points) => trailing(points, window),
            Err(e) => {
                tracing::warn!("failed to fetch {} history: {}", resource.label(), e);
                Vec::new()
            }
        }
    }
}

/// Dataset under the first key mentioning "intraday", e.g. `activities-heart-intraday`.
pub fn extract_intraday(body: &Value) -> Vec<Value> {
    body.as_object()
        .and_then(|obj| obj.iter().find(|(key, _)| key.contains("intraday")))
        .and_then(|(_, series)| series.get("dataset"))
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
}

/// `time` and `value` of one raw sample; `None` when either is missing.
pub fn data_point(sample: Value) -> Option<DataPoint> {
    let time = sample.get("time")?.as_str()?.to_string();
    let value = sample.get("value")?.clone();
    Some(DataPoint { time, value })
}

/// First sleep session of the day, if any.
pub fn extract_sleep(body: &Value) -> Option<SleepSummary> {
    let session = body.get("sleep")?.as_array()?.first()?;
    let summary = session.pointer("/levels/summary");
    let stage_minutes = |stage: &str| {
        summary
            .and_then(|s| s.get(stage))
            .and_then(|s| s.get("minutes"))
            .and_then(Value::as_u64)
            .unwrap_or(0)
    };

    Some(SleepSummary {
        asleep: session
            .get("minutesAsleep")
            .and_then(Value::as_u64)
            .unwrap_or(0),
        eff: session.get("efficiency").and_then(Value::as_u64).unwrap_or(0),
        rem: stage_minutes("rem"),
        deep: stage_minutes("deep"),
        wake: stage_minutes("wake"),
        light: stage_minutes("light"),
    })
}

pub fn trailing<T>(mut points: Vec<T>, window: usize) -> Vec<T> {
    let skip = points.len().saturating_sub(window);
    points.drain(..skip);
    points
}
