use std::borrow::Borrow;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

/// An enum that contains all supported measurements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Measurement {
    RoundLoss,
    RoundPerplexity,
    SiloAccuracy,
    SiloUncertainty,
    CodebookCount,
    Phase,
}

impl From<Measurement> for &'static str {
    fn from(measurement: Measurement) -> &'static str {
        match measurement {
            Measurement::RoundLoss => "round_loss",
            Measurement::RoundPerplexity => "round_perplexity",
            Measurement::SiloAccuracy => "silo_accuracy",
            Measurement::SiloUncertainty => "silo_uncertainty",
            Measurement::CodebookCount => "codebook_count",
            Measurement::Phase => "phase",
        }
    }
}

impl From<Measurement> for String {
    fn from(measurement: Measurement) -> Self {
        <&str>::from(measurement).into()
    }
}

/// A container that contains the tags of a metric.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Tags(Map<String, Value>);

impl Tags {
    /// Creates a new empty container for tags.
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Adds a tag to the metric.
    pub fn add(&mut self, tag: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(tag.into(), value.into());
    }
}

/// A metrics data point.
#[derive(Debug, Serialize)]
pub(in crate::metrics) struct Metric {
    measurement: Measurement,
    time: DateTime<Utc>,
    value: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    tags: Option<Tags>,
}

impl Metric {
    pub(in crate::metrics) fn new(measurement: Measurement, value: impl Into<Value>) -> Self {
        Self {
            measurement,
            time: Utc::now(),
            value: value.into(),
            tags: None,
        }
    }

    pub(in crate::metrics) fn with_tags(mut self, tags: Tags) -> Self {
        self.tags = Some(tags);
        self
    }
}

/// An event data point.
#[derive(Debug, Serialize)]
pub(in crate::metrics) struct Event {
    time: DateTime<Utc>,
    title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tags: Option<String>,
}

impl Event {
    pub(in crate::metrics) fn new(title: impl Into<String>) -> Self {
        Self {
            time: Utc::now(),
            title: title.into(),
            description: None,
            tags: None,
        }
    }

    pub(in crate::metrics) fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub(in crate::metrics) fn with_tags(mut self, tags: &[impl Borrow<str>]) -> Self {
        self.tags = Some(tags.join(","));
        self
    }
}
