use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// One observed metric value.
///
/// On the wire:
/// ```json
/// {"metric_key": "cpu.usage", "value": 93.5, "timestamp": "2024-05-01T12:00:00Z"}
/// ```
/// `timestamp` defaults to the time of parsing; a `null` value reads as NaN.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub metric_key: String,
    #[serde(deserialize_with = "nullable_f64")]
    pub value: f64,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl MetricSample {
    pub fn new(metric_key: impl Into<String>, value: f64, timestamp: DateTime<Utc>) -> Self {
        Self {
            metric_key: metric_key.into(),
            value,
            timestamp,
        }
    }

    /// Sample stamped with the current time
    pub fn now(metric_key: impl Into<String>, value: f64) -> Self {
        Self::new(metric_key, value, Utc::now())
    }
}

fn nullable_f64<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<f64>::deserialize(deserializer)?.unwrap_or(f64::NAN))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_sample() {
        let sample: MetricSample = serde_json::from_str(
            r#"{"metric_key":"cpu.usage","value":93.5,"timestamp":"2024-05-01T12:00:00Z"}"#,
        )
        .unwrap();

        assert_eq!(sample.metric_key, "cpu.usage");
        assert_eq!(sample.value, 93.5);
        assert_eq!(sample.timestamp.to_rfc3339(), "2024-05-01T12:00:00+00:00");
    }

    #[test]
    fn test_missing_timestamp_defaults_to_now() {
        let before = Utc::now();
        let sample: MetricSample =
            serde_json::from_str(r#"{"metric_key":"mem","value":1}"#).unwrap();
        assert!(sample.timestamp >= before);
    }

    #[test]
    fn test_null_value_is_nan() {
        let sample: MetricSample =
            serde_json::from_str(r#"{"metric_key":"mem","value":null}"#).unwrap();
        assert!(sample.value.is_nan());
    }
}
