//! Optional anomaly enrichment of metric snapshots

use crate::emergency::Severity;
use crate::error::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use tokio::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlaggedMetric {
    pub metric_name: String,
    pub deviation_score: f64,
    pub severity: Severity,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AnomalyReport {
    /// 0.0 (normal) to 1.0 (highly anomalous)
    pub anomaly_score: f64,
    pub flagged: Vec<FlaggedMetric>,
}

impl AnomalyReport {
    /// Merge the report into a metric snapshot.
    ///
    /// Adds `anomaly_score`, plus `anomaly_<metric>` holding the deviation
    /// score for every flagged metric of high severity or worse.
    pub fn enrich(&self, metrics: &mut HashMap<String, f64>) {
        metrics.insert("anomaly_score".to_string(), self.anomaly_score);
        for flagged in self.flagged.iter().filter(|f| f.severity >= Severity::High) {
            metrics.insert(format!("anomaly_{}", flagged.metric_name), flagged.deviation_score);
        }
    }
}

/// External anomaly analysis. Called under a timeout by the supervisor.
#[async_trait]
pub trait AnomalyDetector: Send + Sync {
    async fn analyze(&self, metrics: &HashMap<String, f64>) -> Result<AnomalyReport>;
}

/// Rolling z-score detector used when no external analyzer is configured
pub struct RollingZScore {
    window: usize,
    z_limit: f64,
    history: Mutex<HashMap<String, VecDeque<f64>>>,
}

impl RollingZScore {
    pub fn new(window: usize, z_limit: f64) -> Self {
        Self {
            window: window.max(2),
            z_limit,
            history: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for RollingZScore {
    fn default() -> Self {
        Self::new(30, 3.0)
    }
}

#[async_trait]
impl AnomalyDetector for RollingZScore {
    async fn analyze(&self, metrics: &HashMap<String, f64>) -> Result<AnomalyReport> {
        let mut history = self.history.lock().await;
        let mut flagged = Vec::new();
        let mut worst: f64 = 0.0;

        for (name, &value) in metrics {
            if name.starts_with("anomaly_") {
                continue;
            }
            let window = history.entry(name.clone()).or_default();

            if window.len() >= 2 {
                let n = window.len() as f64;
                let mean = window.iter().sum::<f64>() / n;
                let variance = window.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
                let std_dev = variance.sqrt();
                if std_dev > f64::EPSILON {
                    let z = ((value - mean) / std_dev).abs();
                    worst = worst.max(z);
                    if z > self.z_limit {
                        let severity = if z > self.z_limit * 2.0 {
                            Severity::Critical
                        } else {
                            Severity::High
                        };
                        flagged.push(FlaggedMetric {
                            metric_name: name.clone(),
                            deviation_score: z,
                            severity,
                        });
                    }
                }
            }

            if window.len() >= self.window {
                window.pop_front();
            }
            window.push_back(value);
        }

        flagged.sort_by(|a, b| a.metric_name.cmp(&b.metric_name));
        Ok(AnomalyReport {
            anomaly_score: (worst / (self.z_limit * 2.0)).min(1.0),
            flagged,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_spike_is_flagged() {
        let detector = RollingZScore::new(10, 3.0);
        for v in [100.0, 102.0, 98.0, 101.0, 99.0, 100.0] {
            let report = detector
                .analyze(&HashMap::from([("latency".to_string(), v)]))
                .await
                .unwrap();
            assert!(report.flagged.is_empty());
        }

        let report = detector
            .analyze(&HashMap::from([("latency".to_string(), 400.0)]))
            .await
            .unwrap();
        assert_eq!(report.flagged.len(), 1);
        assert_eq!(report.flagged[0].severity, Severity::Critical);
        assert_eq!(report.anomaly_score, 1.0);
    }

    #[test]
    fn test_enrich_skips_low_severity() {
        let report = AnomalyReport {
            anomaly_score: 0.4,
            flagged: vec![
                FlaggedMetric {
                    metric_name: "cpu".into(),
                    deviation_score: 3.5,
                    severity: Severity::High,
                },
                FlaggedMetric {
                    metric_name: "memory".into(),
                    deviation_score: 1.2,
                    severity: Severity::Low,
                },
            ],
        };
        let mut metrics = HashMap::new();
        report.enrich(&mut metrics);
        assert_eq!(metrics.get("anomaly_score"), Some(&0.4));
        assert_eq!(metrics.get("anomaly_cpu"), Some(&3.5));
        assert!(!metrics.contains_key("anomaly_memory"));
    }
}
