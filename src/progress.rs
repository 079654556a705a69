use std::io::{self, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::cli::ProgressScale;

/// Completion is tracked in ten-thousandths: `0.0001` as a fraction, `0.01` as a percentage.
const UNITS: u64 = 10_000;

#[derive(Debug, Clone, Copy)]
pub struct ProgressSnapshot {
    pub bytes_done: u64,
    pub bytes_total: Option<u64>,
    pub taken_at: Instant,
}

impl ProgressSnapshot {
    pub fn fraction(&self) -> Option<f64> {
        match self.bytes_total {
            Some(0) => Some(1.0),
            Some(total) => Some(self.bytes_done.min(total) as f64 / total as f64),
            None => None,
        }
    }

    /// Completion in units, never reaching `UNITS` while the transfer is running.
    fn in_flight_units(&self) -> Option<u64> {
        let total = self.bytes_total.filter(|t| *t > 0)?;
        let done = self.bytes_done.min(total) as u128;
        let units = (done * UNITS as u128 / total as u128) as u64;
        Some(units.min(UNITS - 1))
    }
}

fn format_units(scale: ProgressScale, units: u64) -> String {
    match scale {
        ProgressScale::Fraction => format!("{}.{:04}", units / UNITS, units % UNITS),
        ProgressScale::Percent => format!("{}.{:02}", units / 100, units % 100),
    }
}

/// Sums the per-segment counters and writes one bare number per line to `out`.
///
/// Values never go down, and the complete value is only written by [`finish`],
/// which the orchestrator calls once the file has been finalised.
///
/// [`finish`]: ProgressAggregator::finish
pub struct ProgressAggregator {
    counters: Vec<Arc<AtomicU64>>,
    total: Option<u64>,
    scale: ProgressScale,
    out: Box<dyn Write + Send>,
    last_units: Option<u64>,
}

impl ProgressAggregator {
    pub fn new(
        counters: Vec<Arc<AtomicU64>>,
        total: Option<u64>,
        scale: ProgressScale,
        out: Box<dyn Write + Send>,
    ) -> Self {
        Self {
            counters,
            total,
            scale,
            out,
            last_units: None,
        }
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        let bytes_done = self
            .counters
            .iter()
            .map(|c| c.load(Ordering::Acquire))
            .sum();
        ProgressSnapshot {
            bytes_done,
            bytes_total: self.total,
            taken_at: Instant::now(),
        }
    }

    /// Emits the current value if it moved past the last emitted one.
    pub fn tick(&mut self) -> io::Result<Option<String>> {
        let units = match self.snapshot().in_flight_units() {
            Some(units) => units,
            None => return Ok(None),
        };
        if self.last_units.is_some_and(|last| units <= last) {
            return Ok(None);
        }
        self.last_units = Some(units);
        self.emit(units).map(Some)
    }

    /// Emits the complete value. Call only after the download fully succeeded.
    pub fn finish(&mut self) -> io::Result<String> {
        self.last_units = Some(UNITS);
        self.emit(UNITS)
    }

    fn emit(&mut self, units: u64) -> io::Result<String> {
        let line = format_units(self.scale, units);
        writeln!(self.out, "{}", line)?;
        self.out.flush()?;
        Ok(line)
    }

    /// Runs `tick` on a fixed interval until `stop` fires, then hands the
    /// aggregator back so the caller can decide whether to `finish`.
    pub fn spawn(mut self, interval: Duration, stop: CancellationToken) -> JoinHandle<Self> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.tick() {
                            tracing::warn!("failed to write progress: {}", e);
                        }
                    }
                }
            }
            self
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Clone, Default)]
    struct Sink(Arc<Mutex<Vec<u8>>>);

    impl Write for Sink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().write(buf)
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Sink {
        fn lines(&self) -> Vec<String> {
            String::from_utf8(self.0.lock().unwrap().clone())
                .unwrap()
                .lines()
                .map(str::to_string)
                .collect()
        }
    }

    fn aggregator(total: Option<u64>, scale: ProgressScale) -> (ProgressAggregator, Vec<Arc<AtomicU64>>, Sink) {
        let counters: Vec<_> = (0..3).map(|_| Arc::new(AtomicU64::new(0))).collect();
        let sink = Sink::default();
        let agg = ProgressAggregator::new(counters.clone(), total, scale, Box::new(sink.clone()));
        (agg, counters, sink)
    }

    #[test]
    fn emits_only_when_value_advances() {
        let (mut agg, counters, sink) = aggregator(Some(1000), ProgressScale::Fraction);
        assert_eq!(agg.tick().unwrap().as_deref(), Some("0.0000"));
        assert_eq!(agg.tick().unwrap(), None);
        counters[0].fetch_add(250, Ordering::Relaxed);
        counters[2].fetch_add(125, Ordering::Relaxed);
        assert_eq!(agg.tick().unwrap().as_deref(), Some("0.3750"));
        assert_eq!(agg.snapshot().fraction(), Some(0.375));
        assert_eq!(agg.tick().unwrap(), None);
        assert_eq!(sink.lines(), vec!["0.0000", "0.3750"]);
    }

    #[test]
    fn ticks_never_report_completion() {
        let (mut agg, counters, sink) = aggregator(Some(300), ProgressScale::Fraction);
        for c in &counters {
            c.fetch_add(100, Ordering::Relaxed);
        }
        assert_eq!(agg.tick().unwrap().as_deref(), Some("0.9999"));
        assert_eq!(agg.finish().unwrap(), "1.0000");
        assert_eq!(sink.lines().last().map(String::as_str), Some("1.0000"));
    }

    #[test]
    fn percent_scale_uses_two_decimals() {
        let (mut agg, counters, sink) = aggregator(Some(3), ProgressScale::Percent);
        counters[1].fetch_add(1, Ordering::Relaxed);
        agg.tick().unwrap();
        agg.finish().unwrap();
        assert_eq!(sink.lines(), vec!["33.33", "100.00"]);
    }

    #[test]
    fn unknown_size_stays_silent_until_finish() {
        let (mut agg, counters, sink) = aggregator(None, ProgressScale::Fraction);
        counters[0].fetch_add(4096, Ordering::Relaxed);
        assert_eq!(agg.tick().unwrap(), None);
        assert!(sink.lines().is_empty());
        agg.finish().unwrap();
        assert_eq!(sink.lines(), vec!["1.0000"]);
    }

    #[test]
    fn every_line_parses_as_float_and_never_regresses() {
        let (mut agg, counters, sink) = aggregator(Some(7_777), ProgressScale::Fraction);
        for step in 0..50 {
            counters[step % 3].fetch_add(150, Ordering::Relaxed);
            agg.tick().unwrap();
        }
        agg.finish().unwrap();
        let values: Vec<f64> = sink.lines().iter().map(|l| l.parse().unwrap()).collect();
        assert!(values.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(values.last(), Some(&1.0));
        assert_eq!(values.iter().filter(|v| **v == 1.0).count(), 1);
    }

    #[tokio::test]
    async fn spawned_aggregator_returns_after_stop() {
        let (agg, counters, sink) = aggregator(Some(10), ProgressScale::Fraction);
        let stop = CancellationToken::new();
        let handle = agg.spawn(Duration::from_millis(5), stop.clone());
        counters[0].fetch_add(5, Ordering::Relaxed);
        tokio::time::sleep(Duration::from_millis(50)).await;
        stop.cancel();
        let mut agg = handle.await.unwrap();
        agg.finish().unwrap();
        assert_eq!(sink.lines().last().map(String::as_str), Some("1.0000"));
        assert!(sink.lines().contains(&"0.5000".to_string()));
    }
}
