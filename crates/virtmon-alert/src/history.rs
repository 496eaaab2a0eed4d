use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use virtmon_common::types::{Guest, GuestMetrics};

/// One stored sample: raw counters plus rates derived from the previous
/// sample of the same guest.
#[derive(Debug, Clone, Serialize)]
pub struct DataPoint {
    pub timestamp: DateTime<Utc>,
    pub cpu: Option<f64>,
    pub mem: Option<u64>,
    pub disk: Option<u64>,
    pub diskread: Option<u64>,
    pub diskwrite: Option<u64>,
    pub netin: Option<u64>,
    pub netout: Option<u64>,
    /// Derived bytes/s. `None` when there is no previous sample or the
    /// counter went backwards (reset after a reboot).
    pub diskread_rate: Option<f64>,
    pub diskwrite_rate: Option<f64>,
    pub netin_rate: Option<f64>,
    pub netout_rate: Option<f64>,
}

/// A single (timestamp, value) pair in a projected chart series.
#[derive(Debug, Clone, Serialize)]
pub struct SeriesPoint {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

/// Named series projected from a guest's stored points.
#[derive(Debug, Clone, Default, Serialize)]
pub struct GuestChartData {
    pub cpu: Vec<SeriesPoint>,
    pub memory: Vec<SeriesPoint>,
    pub disk: Vec<SeriesPoint>,
    pub diskread: Vec<SeriesPoint>,
    pub diskwrite: Vec<SeriesPoint>,
    pub netin: Vec<SeriesPoint>,
    pub netout: Vec<SeriesPoint>,
}

/// Bounded rolling time series per guest.
pub struct MetricsHistory {
    max_points: usize,
    retention: Duration,
    series: HashMap<String, VecDeque<DataPoint>>,
}

impl MetricsHistory {
    pub fn new(max_points: usize, retention_secs: i64) -> Self {
        Self {
            max_points,
            retention: Duration::seconds(retention_secs),
            series: HashMap::new(),
        }
    }

    /// Append a timestamped point for the guest, deriving rates for the
    /// cumulative counters against the previous point.
    pub fn add_metric_data(&mut self, guest_id: &str, metrics: &GuestMetrics) {
        let entry = self
            .series
            .entry(guest_id.to_string())
            .or_insert_with(VecDeque::new);

        let prev = entry.back();
        let dt_secs = prev
            .map(|p| (metrics.timestamp - p.timestamp).num_milliseconds() as f64 / 1000.0)
            .unwrap_or(0.0);

        let rate = |prev_val: Option<u64>, cur_val: Option<u64>| -> Option<f64> {
            derive_rate(prev_val, cur_val, dt_secs)
        };

        let point = DataPoint {
            timestamp: metrics.timestamp,
            cpu: metrics.cpu,
            mem: metrics.mem,
            disk: metrics.disk,
            diskread: metrics.diskread,
            diskwrite: metrics.diskwrite,
            netin: metrics.netin,
            netout: metrics.netout,
            diskread_rate: rate(prev.and_then(|p| p.diskread), metrics.diskread),
            diskwrite_rate: rate(prev.and_then(|p| p.diskwrite), metrics.diskwrite),
            netin_rate: rate(prev.and_then(|p| p.netin), metrics.netin),
            netout_rate: rate(prev.and_then(|p| p.netout), metrics.netout),
        };

        entry.push_back(point);
        while entry.len() > self.max_points {
            entry.pop_front();
        }
    }

    /// Most recent stored point for a guest.
    pub fn latest(&self, guest_id: &str) -> Option<&DataPoint> {
        self.series.get(guest_id).and_then(|s| s.back())
    }

    pub fn points(&self, guest_id: &str) -> Option<&VecDeque<DataPoint>> {
        self.series.get(guest_id)
    }

    /// Prune points older than the retention window; guests left with zero
    /// points are removed entirely.
    pub fn cleanup(&mut self, now: DateTime<Utc>) {
        let cutoff = now - self.retention;
        self.series.retain(|_, points| {
            while let Some(front) = points.front() {
                if front.timestamp < cutoff {
                    points.pop_front();
                } else {
                    break;
                }
            }
            !points.is_empty()
        });
    }

    /// Project stored points into named chart series for every guest.
    ///
    /// Memory/disk percentages are resolved against the guest's capacity;
    /// guests absent from `guests` keep their raw-rate series but get no
    /// percentage series for memory/disk.
    pub fn all_guest_chart_data(&self, guests: &[Guest]) -> HashMap<String, GuestChartData> {
        let capacity: HashMap<String, (u64, u64)> = guests
            .iter()
            .map(|g| (g.guest_id(), (g.maxmem, g.maxdisk)))
            .collect();

        let mut charts = HashMap::new();
        for (guest_id, points) in &self.series {
            let (maxmem, maxdisk) = capacity.get(guest_id).copied().unwrap_or((0, 0));
            let mut chart = GuestChartData::default();

            for p in points {
                let push = |series: &mut Vec<SeriesPoint>, value: Option<f64>| {
                    if let Some(value) = value.filter(|v| v.is_finite()) {
                        series.push(SeriesPoint {
                            timestamp: p.timestamp,
                            value,
                        });
                    }
                };

                push(&mut chart.cpu, p.cpu.map(normalize_cpu));
                push(&mut chart.memory, percent_of(p.mem, maxmem));
                push(&mut chart.disk, percent_of(p.disk, maxdisk));
                push(&mut chart.diskread, p.diskread_rate);
                push(&mut chart.diskwrite, p.diskwrite_rate);
                push(&mut chart.netin, p.netin_rate);
                push(&mut chart.netout, p.netout_rate);
            }

            charts.insert(guest_id.clone(), chart);
        }
        charts
    }

    pub fn guest_count(&self) -> usize {
        self.series.len()
    }
}

/// Rate in bytes/s between two cumulative counter readings. A negative
/// delta means the counter reset, which yields no rate rather than a
/// negative one.
pub fn derive_rate(prev: Option<u64>, current: Option<u64>, dt_secs: f64) -> Option<f64> {
    let prev = prev?;
    let current = current?;
    if dt_secs <= 0.0 || current < prev {
        return None;
    }
    Some((current - prev) as f64 / dt_secs)
}

/// CPU values <= 1.0 are fractions and scale to percent; larger values are
/// assumed to already be percentages.
pub fn normalize_cpu(cpu: f64) -> f64 {
    if cpu <= 1.0 {
        cpu * 100.0
    } else {
        cpu
    }
}

fn percent_of(used: Option<u64>, capacity: u64) -> Option<f64> {
    let used = used?;
    if capacity == 0 {
        return None;
    }
    Some(used as f64 / capacity as f64 * 100.0)
}
