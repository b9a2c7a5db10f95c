//! In-memory streaming connector.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use super::{Meter, MeterAggregation, MeterRow, QueryParams, StreamingConnector, UsageResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageEvent {
    pub subject: String,
    pub time: DateTime<Utc>,
    pub value: Decimal,
}

impl UsageEvent {
    pub fn new(subject: impl Into<String>, time: DateTime<Utc>, value: Decimal) -> Self {
        Self {
            subject: subject.into(),
            time,
            value,
        }
    }
}

/// Events kept per meter slug (for testing and single-instance deployments)
#[derive(Debug, Default, Clone)]
pub struct MemoryStreamingConnector {
    events: Arc<RwLock<HashMap<String, Vec<UsageEvent>>>>,
}

impl MemoryStreamingConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_event(&self, meter: &str, event: UsageEvent) {
        self.events
            .write()
            .await
            .entry(meter.to_string())
            .or_default()
            .push(event);
    }

    pub async fn add_events(&self, meter: &str, events: impl IntoIterator<Item = UsageEvent>) {
        self.events
            .write()
            .await
            .entry(meter.to_string())
            .or_default()
            .extend(events);
    }
}

fn aggregate(aggregation: MeterAggregation, events: &[&UsageEvent]) -> Decimal {
    match aggregation {
        MeterAggregation::Sum => events.iter().map(|e| e.value).sum(),
        MeterAggregation::Count => Decimal::from(events.len()),
        MeterAggregation::Max => events
            .iter()
            .map(|e| e.value)
            .max()
            .unwrap_or(Decimal::ZERO),
        MeterAggregation::Latest => events
            .iter()
            .max_by_key(|e| e.time)
            .map_or(Decimal::ZERO, |e| e.value),
    }
}

#[async_trait::async_trait]
impl StreamingConnector for MemoryStreamingConnector {
    fn name(&self) -> &str {
        "memory"
    }

    async fn query_meter(&self, meter: &Meter, params: &QueryParams) -> UsageResult<Vec<MeterRow>> {
        let events = self.events.read().await;
        let matching: Vec<&UsageEvent> = events
            .get(&meter.slug)
            .map(|list| {
                list.iter()
                    .filter(|e| params.from <= e.time && e.time < params.to)
                    .filter(|e| params.subjects.is_empty() || params.subjects.contains(&e.subject))
                    .collect()
            })
            .unwrap_or_default();

        if matching.is_empty() {
            return Ok(Vec::new());
        }

        let row = |subject: Option<String>, events: &[&UsageEvent]| MeterRow {
            window_start: params.from,
            window_end: params.to,
            subject,
            value: aggregate(meter.aggregation, events),
        };

        if !params.group_by_subject {
            return Ok(vec![row(None, &matching)]);
        }

        let mut by_subject: BTreeMap<&str, Vec<&UsageEvent>> = BTreeMap::new();
        for event in matching {
            by_subject.entry(event.subject.as_str()).or_default().push(event);
        }
        Ok(by_subject
            .into_iter()
            .map(|(subject, events)| row(Some(subject.to_string()), &events))
            .collect())
    }
}
