// ============================================================================
// CORE TYPE SYSTEM
// ============================================================================
// The entities flowing through the engine. Every metric point is immutable
// after construction; alerts and buckets are derived from points and never
// mutated either.
// ============================================================================

use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use compact_str::CompactString;
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

use crate::error::{ValidationError, ValidationResult};
use crate::{MAX_SERVICE_NAME_LENGTH, MAX_TAGS_PER_POINT, MAX_TAG_KEY_LENGTH};

// ----------------------------------------------------------------------------
// Timestamp - Nanosecond UTC Instant
// ----------------------------------------------------------------------------

/// Nanoseconds in `duration`, saturating at `i64::MAX`
#[inline]
fn duration_nanos(duration: Duration) -> i64 {
    i64::try_from(duration.as_nanos()).unwrap_or(i64::MAX)
}

/// UTC instant in nanoseconds since the Unix epoch.
/// Serialized as an ISO-8601 / RFC 3339 string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct Timestamp(i64);

impl Timestamp {
    /// Create a new timestamp from nanoseconds since Unix epoch
    #[inline]
    pub const fn from_nanos(nanos: i64) -> Self {
        Self(nanos)
    }

    /// Create a new timestamp from milliseconds since Unix epoch
    #[inline]
    pub const fn from_millis(millis: i64) -> Self {
        Self(millis * 1_000_000)
    }

    /// Create a new timestamp from seconds since Unix epoch
    #[inline]
    pub const fn from_secs(secs: i64) -> Self {
        Self(secs * 1_000_000_000)
    }

    /// Get the current wall-clock time
    #[inline]
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self(duration_nanos(duration))
    }

    #[inline]
    pub const fn as_nanos(&self) -> i64 {
        self.0
    }

    #[inline]
    pub const fn as_secs(&self) -> i64 {
        self.0.div_euclid(1_000_000_000)
    }

    /// Add duration to timestamp
    #[inline]
    pub fn add_duration(&self, duration: Duration) -> Self {
        Self(self.0.saturating_add(duration_nanos(duration)))
    }

    /// Subtract duration from timestamp
    #[inline]
    pub fn sub_duration(&self, duration: Duration) -> Self {
        Self(self.0.saturating_sub(duration_nanos(duration)))
    }

    /// Check if timestamp is within a closed time range
    #[inline]
    pub fn is_within(&self, start: Timestamp, end: Timestamp) -> bool {
        self.0 >= start.0 && self.0 <= end.0
    }

    /// Round down to the interval boundary (epoch-aligned)
    #[inline]
    pub fn floor_to(&self, interval: Duration) -> Self {
        let step = duration_nanos(interval);
        if step <= 0 {
            return *self;
        }
        Self(self.0.div_euclid(step).saturating_mul(step))
    }

    /// Convert to chrono DateTime<Utc>
    pub fn to_datetime(&self) -> DateTime<Utc> {
        let secs = self.0.div_euclid(1_000_000_000);
        let nanos = self.0.rem_euclid(1_000_000_000) as u32;
        DateTime::from_timestamp(secs, nanos).unwrap_or_default()
    }

    /// Create from chrono DateTime<Utc>; `None` outside the representable range
    pub fn from_datetime(dt: DateTime<Utc>) -> Option<Self> {
        dt.timestamp_nanos_opt().map(Self)
    }

    /// Parse an ISO-8601 string. Offsets are honoured; naive times are UTC.
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
            return Self::from_datetime(dt.with_timezone(&Utc));
        }
        ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
            .iter()
            .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
            .and_then(|naive| Self::from_datetime(Utc.from_utc_datetime(&naive)))
    }

    /// RFC 3339 rendering used on the wire
    pub fn to_rfc3339(&self) -> String {
        self.to_datetime().to_rfc3339_opts(SecondsFormat::AutoSi, true)
    }

    pub const EPOCH: Timestamp = Timestamp(0);
    pub const MAX: Timestamp = Timestamp(i64::MAX);
    pub const MIN: Timestamp = Timestamp(i64::MIN);
}

impl Default for Timestamp {
    fn default() -> Self {
        Self::now()
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_rfc3339())
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(dt: DateTime<Utc>) -> Self {
        Self::from_datetime(dt).unwrap_or(Timestamp::EPOCH)
    }
}

impl FromStr for Timestamp {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Timestamp::parse(s).ok_or_else(|| ValidationError::InvalidTimestamp {
            value: s.to_string(),
        })
    }
}

impl Serialize for Timestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_rfc3339())
    }
}

impl<'de> Deserialize<'de> for Timestamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct TimestampVisitor;

        impl<'de> Visitor<'de> for TimestampVisitor {
            type Value = Timestamp;

            fn expecting(&self, f: &mut Formatter<'_>) -> fmt::Result {
                f.write_str("an ISO-8601 UTC timestamp string")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Timestamp, E> {
                Timestamp::parse(v).ok_or_else(|| E::custom(format!("invalid timestamp '{v}'")))
            }
        }

        deserializer.deserialize_str(TimestampVisitor)
    }
}

// ----------------------------------------------------------------------------
// Metric Type - Closed Enumeration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    Latency,
    Throughput,
    ErrorRate,
    Cpu,
    Memory,
}

impl MetricType {
    pub const ALL: [MetricType; 5] = [
        MetricType::Latency,
        MetricType::Throughput,
        MetricType::ErrorRate,
        MetricType::Cpu,
        MetricType::Memory,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MetricType::Latency => "latency",
            MetricType::Throughput => "throughput",
            MetricType::ErrorRate => "error_rate",
            MetricType::Cpu => "cpu",
            MetricType::Memory => "memory",
        }
    }
}

impl Display for MetricType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetricType {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MetricType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| ValidationError::UnknownMetricType {
                value: s.to_string(),
            })
    }
}

// ----------------------------------------------------------------------------
// Tags
// ----------------------------------------------------------------------------

/// A scalar tag value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TagValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl From<&str> for TagValue {
    fn from(v: &str) -> Self {
        TagValue::Text(v.to_string())
    }
}

impl From<String> for TagValue {
    fn from(v: String) -> Self {
        TagValue::Text(v)
    }
}

impl From<i64> for TagValue {
    fn from(v: i64) -> Self {
        TagValue::Int(v)
    }
}

impl From<f64> for TagValue {
    fn from(v: f64) -> Self {
        TagValue::Float(v)
    }
}

impl From<bool> for TagValue {
    fn from(v: bool) -> Self {
        TagValue::Bool(v)
    }
}

pub type Tags = BTreeMap<String, TagValue>;

fn deserialize_tags<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Tags, D::Error> {
    Ok(Option::<Tags>::deserialize(deserializer)?.unwrap_or_default())
}

// ----------------------------------------------------------------------------
// Metric Point - The Unit of Ingestion
// ----------------------------------------------------------------------------

/// A single timestamped measurement for one service and metric type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricPoint {
    pub timestamp: Timestamp,
    pub service: CompactString,
    pub metric_type: MetricType,
    pub value: f64,
    #[serde(default, deserialize_with = "deserialize_tags")]
    pub tags: Tags,
}

impl MetricPoint {
    /// Create a point stamped with the current time
    pub fn new(service: impl Into<CompactString>, metric_type: MetricType, value: f64) -> Self {
        Self {
            timestamp: Timestamp::now(),
            service: service.into(),
            metric_type,
            value,
            tags: Tags::new(),
        }
    }

    pub fn with_timestamp(mut self, timestamp: Timestamp) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<TagValue>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn series_key(&self) -> SeriesKey {
        SeriesKey::new(self.service.clone(), self.metric_type)
    }

    /// Enforce the ingestion invariants.
    pub fn validate(&self) -> ValidationResult<()> {
        let service = self.service.trim();
        if service.is_empty() {
            return Err(ValidationError::EmptyService);
        }
        if self.service.len() > MAX_SERVICE_NAME_LENGTH {
            return Err(ValidationError::ServiceTooLong {
                len: self.service.len(),
                max: MAX_SERVICE_NAME_LENGTH,
            });
        }
        if !self.value.is_finite() {
            return Err(ValidationError::NonFiniteValue { value: self.value });
        }
        if self.tags.len() > MAX_TAGS_PER_POINT {
            return Err(ValidationError::TooManyTags {
                count: self.tags.len(),
                max: MAX_TAGS_PER_POINT,
            });
        }
        for (key, value) in &self.tags {
            if key.is_empty() || key.len() > MAX_TAG_KEY_LENGTH {
                return Err(ValidationError::InvalidTag {
                    key: key.clone(),
                    reason: format!("key length must be 1..={MAX_TAG_KEY_LENGTH}"),
                });
            }
            if let TagValue::Float(v) = value {
                if !v.is_finite() {
                    return Err(ValidationError::InvalidTag {
                        key: key.clone(),
                        reason: "numeric tag must be finite".into(),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Identity of a live-window series.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SeriesKey {
    pub service: CompactString,
    pub metric_type: MetricType,
}

impl SeriesKey {
    pub fn new(service: impl Into<CompactString>, metric_type: MetricType) -> Self {
        Self {
            service: service.into(),
            metric_type,
        }
    }
}

impl Display for SeriesKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.service, self.metric_type)
    }
}

// ----------------------------------------------------------------------------
// Alerts
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }
}

impl Display for Severity {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A threshold crossing raised for one metric point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: Uuid,
    pub timestamp: Timestamp,
    pub service: CompactString,
    pub metric_type: MetricType,
    pub severity: Severity,
    pub message: String,
    pub value: f64,
    pub threshold: f64,
}

impl Alert {
    pub fn new(point: &MetricPoint, severity: Severity, threshold: f64, message: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: point.timestamp,
            service: point.service.clone(),
            metric_type: point.metric_type,
            severity,
            message,
            value: point.value,
            threshold,
        }
    }

    pub fn is_critical(&self) -> bool {
        self.severity == Severity::Critical
    }
}

// ----------------------------------------------------------------------------
// Aggregation
// ----------------------------------------------------------------------------

/// Bucket width for aggregated queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum AggregationInterval {
    #[serde(rename = "1m")]
    OneMinute,
    #[serde(rename = "5m")]
    FiveMinutes,
    #[serde(rename = "1h")]
    OneHour,
}

impl AggregationInterval {
    pub const ALL: [AggregationInterval; 3] = [
        AggregationInterval::OneMinute,
        AggregationInterval::FiveMinutes,
        AggregationInterval::OneHour,
    ];

    /// Every other interval divides this one
    pub const LARGEST: AggregationInterval = AggregationInterval::OneHour;

    pub const fn as_secs(&self) -> u64 {
        match self {
            AggregationInterval::OneMinute => 60,
            AggregationInterval::FiveMinutes => 300,
            AggregationInterval::OneHour => 3600,
        }
    }

    pub const fn as_duration(&self) -> Duration {
        Duration::from_secs(self.as_secs())
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AggregationInterval::OneMinute => "1m",
            AggregationInterval::FiveMinutes => "5m",
            AggregationInterval::OneHour => "1h",
        }
    }

    /// Start of the bucket containing `ts`
    pub fn bucket_start(&self, ts: Timestamp) -> Timestamp {
        ts.floor_to(self.as_duration())
    }
}

impl Display for AggregationInterval {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Requested shape of a query result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Aggregation {
    #[default]
    Raw,
    Bucketed(AggregationInterval),
}

impl Aggregation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Aggregation::Raw => "raw",
            Aggregation::Bucketed(interval) => interval.as_str(),
        }
    }
}

impl FromStr for Aggregation {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "raw" {
            return Ok(Aggregation::Raw);
        }
        AggregationInterval::ALL
            .iter()
            .copied()
            .find(|i| i.as_str() == s)
            .map(Aggregation::Bucketed)
            .ok_or_else(|| ValidationError::UnknownAggregation {
                value: s.to_string(),
            })
    }
}

impl Serialize for Aggregation {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Aggregation {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Option::<String>::deserialize(deserializer)?;
        match raw {
            None => Ok(Aggregation::Raw),
            Some(s) => s.parse().map_err(de::Error::custom),
        }
    }
}

/// Summary statistics for one (bucket, service, metric type) group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedBucket {
    pub bucket_start: Timestamp,
    pub service: CompactString,
    pub metric_type: MetricType,
    pub interval: AggregationInterval,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
    pub min: f64,
    pub max: f64,
    pub avg: f64,
    pub count: u64,
}

impl AggregatedBucket {
    pub fn key(&self) -> BucketKey {
        BucketKey {
            interval: self.interval,
            bucket_start: self.bucket_start,
            service: self.service.clone(),
            metric_type: self.metric_type,
        }
    }

    pub fn bucket_end(&self) -> Timestamp {
        self.bucket_start.add_duration(self.interval.as_duration())
    }
}

/// Identity of an aggregated bucket.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BucketKey {
    pub interval: AggregationInterval,
    pub bucket_start: Timestamp,
    pub service: CompactString,
    pub metric_type: MetricType,
}

// ----------------------------------------------------------------------------
// Queries
// ----------------------------------------------------------------------------

/// A time-range query over stored points.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricQuery {
    pub start_time: Timestamp,
    pub end_time: Timestamp,
    #[serde(default)]
    pub services: Option<Vec<String>>,
    #[serde(default)]
    pub metric_types: Option<Vec<MetricType>>,
    #[serde(default)]
    pub aggregation: Aggregation,
}

impl MetricQuery {
    pub fn range(start_time: Timestamp, end_time: Timestamp) -> Self {
        Self {
            start_time,
            end_time,
            services: None,
            metric_types: None,
            aggregation: Aggregation::Raw,
        }
    }

    pub fn with_services<I, S>(mut self, services: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.services = Some(services.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_metric_types(mut self, types: impl IntoIterator<Item = MetricType>) -> Self {
        self.metric_types = Some(types.into_iter().collect());
        self
    }

    pub fn with_aggregation(mut self, aggregation: Aggregation) -> Self {
        self.aggregation = aggregation;
        self
    }

    pub fn validate(&self) -> ValidationResult<()> {
        if self.start_time > self.end_time {
            return Err(ValidationError::InvalidTimeRange {
                start: self.start_time,
                end: self.end_time,
            });
        }
        Ok(())
    }

    /// Range and filter check. An empty filter list means "no filter".
    pub fn matches(&self, point: &MetricPoint) -> bool {
        if !point.timestamp.is_within(self.start_time, self.end_time) {
            return false;
        }
        if let Some(services) = self.services.as_ref().filter(|s| !s.is_empty()) {
            if !services.iter().any(|s| s.as_str() == point.service.as_str()) {
                return false;
            }
        }
        if let Some(types) = self.metric_types.as_ref().filter(|t| !t.is_empty()) {
            if !types.contains(&point.metric_type) {
                return false;
            }
        }
        true
    }

    pub fn matches_bucket(&self, bucket: &AggregatedBucket) -> bool {
        if !bucket.bucket_start.is_within(self.start_time, self.end_time) {
            return false;
        }
        if let Some(services) = self.services.as_ref().filter(|s| !s.is_empty()) {
            if !services.iter().any(|s| s.as_str() == bucket.service.as_str()) {
                return false;
            }
        }
        if let Some(types) = self.metric_types.as_ref().filter(|t| !t.is_empty()) {
            if !types.contains(&bucket.metric_type) {
                return false;
            }
        }
        true
    }
}

/// Raw points or aggregated buckets, depending on the requested aggregation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum QueryResult {
    Points(Vec<MetricPoint>),
    Buckets(Vec<AggregatedBucket>),
}

impl QueryResult {
    pub fn len(&self) -> usize {
        match self {
            QueryResult::Points(p) => p.len(),
            QueryResult::Buckets(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ----------------------------------------------------------------------------
// Service Health
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
        }
    }
}

/// Statistics over the live window of one series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSummary {
    pub current: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
    pub min: f64,
    pub max: f64,
    pub avg: f64,
    pub count: u64,
}

/// Read-time view of one service, recomputed from the live window on every call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceHealth {
    pub service: String,
    pub status: HealthStatus,
    pub metrics: BTreeMap<MetricType, MetricSummary>,
}

// ----------------------------------------------------------------------------
// Stream Events
// ----------------------------------------------------------------------------

/// One message on a streaming subscription: `{"type": ..., "data": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum StreamEvent {
    Initial(Vec<MetricPoint>),
    Metric(MetricPoint),
    Alert(Alert),
}

impl StreamEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            StreamEvent::Initial(_) => "initial",
            StreamEvent::Metric(_) => "metric",
            StreamEvent::Alert(_) => "alert",
        }
    }
}
