use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use serde::{Serialize, Serializer};

use crate::db::QueryType;

/// Timing aggregate for one query type.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TypeStats {
    pub count: u64,
    #[serde(serialize_with = "secs")]
    pub total_time: Duration,
    #[serde(serialize_with = "secs")]
    pub avg: Duration,
    #[serde(serialize_with = "secs")]
    pub min: Duration,
    #[serde(serialize_with = "secs")]
    pub max: Duration,
}

impl TypeStats {
    fn first(elapsed: Duration) -> Self {
        Self {
            count: 1,
            total_time: elapsed,
            avg: elapsed,
            min: elapsed,
            max: elapsed,
        }
    }

    fn record(&mut self, elapsed: Duration) {
        self.count += 1;
        self.total_time += elapsed;
        self.min = self.min.min(elapsed);
        self.max = self.max.max(elapsed);
        self.avg = self.total_time.div_f64(self.count as f64);
    }
}

fn secs<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(value.as_secs_f64())
}

/// Per query type execution timings. In-memory only.
#[derive(Debug, Default)]
pub struct QueryMetrics {
    by_type: Mutex<BTreeMap<QueryType, TypeStats>>,
}

impl QueryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, query_type: QueryType, elapsed: Duration) {
        let mut by_type = self
            .by_type
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        by_type
            .entry(query_type)
            .and_modify(|stats| stats.record(elapsed))
            .or_insert_with(|| TypeStats::first(elapsed));
    }

    pub fn snapshot(&self) -> BTreeMap<QueryType, TypeStats> {
        self.by_type
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn total_queries(&self) -> u64 {
        self.snapshot().values().map(|s| s.count).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_aggregates() {
        let metrics = QueryMetrics::new();
        metrics.record(QueryType::Select, Duration::from_millis(10));
        metrics.record(QueryType::Select, Duration::from_millis(30));
        metrics.record(QueryType::Insert, Duration::from_millis(5));

        let snapshot = metrics.snapshot();
        let select = snapshot[&QueryType::Select];
        assert_eq!(select.count, 2);
        assert_eq!(select.total_time, Duration::from_millis(40));
        assert_eq!(select.avg, Duration::from_millis(20));
        assert_eq!(select.min, Duration::from_millis(10));
        assert_eq!(select.max, Duration::from_millis(30));
        assert_eq!(snapshot[&QueryType::Insert].count, 1);
        assert_eq!(metrics.total_queries(), 3);
    }

    #[test]
    fn test_serializes_by_type_name() {
        let metrics = QueryMetrics::new();
        metrics.record(QueryType::Delete, Duration::from_millis(500));
        let json = serde_json::to_value(metrics.snapshot()).unwrap();
        assert_eq!(json["DELETE"]["count"], 1);
        assert_eq!(json["DELETE"]["avg"], 0.5);
    }
}
