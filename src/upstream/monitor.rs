//! Outbound bitrate measurement over the transport sink.

use parking_lot::Mutex;
use tokio::time::Instant;

use super::BITRATE_AVG_PERIOD;

#[derive(Debug)]
struct MonitorInner {
    active: bool,
    bitrate_sum: u64,
    bitrate_avg: u32,
    measure_start: Instant,
}

/// Accumulates outbound payload sizes and periodically folds them into a
/// smoothed kbit/s average. Attached exactly while the upstream is
/// transmitting; `record` is a no-op otherwise.
#[derive(Debug)]
pub struct BitrateMonitor {
    inner: Mutex<MonitorInner>,
}

impl BitrateMonitor {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MonitorInner {
                active: false,
                bitrate_sum: 0,
                bitrate_avg: 0,
                measure_start: Instant::now(),
            }),
        }
    }

    /// Start measuring. Clears the accumulator and the smoothed average.
    pub fn attach(&self) {
        let mut m = self.inner.lock();
        m.active = true;
        m.bitrate_sum = 0;
        m.bitrate_avg = 0;
        m.measure_start = Instant::now();
    }

    pub fn detach(&self) {
        self.inner.lock().active = false;
    }

    /// Account one outbound buffer. Returns the measured kbit/s once per
    /// averaging period, `None` in between and while detached.
    pub fn record(&self, len: usize) -> Option<u32> {
        let mut m = self.inner.lock();
        if !m.active {
            return None;
        }
        m.bitrate_sum += len as u64;

        let now = Instant::now();
        if now <= m.measure_start + BITRATE_AVG_PERIOD {
            return None;
        }
        // bytes * 8 / ms = kbit/s
        let bitrate = (m.bitrate_sum * 8 / BITRATE_AVG_PERIOD.as_millis() as u64) as u32;
        m.bitrate_avg = if m.bitrate_avg != 0 {
            (m.bitrate_avg + bitrate) / 2
        } else {
            bitrate
        };
        m.bitrate_sum = 0;
        m.measure_start = now;
        Some(bitrate)
    }

    /// Smoothed average in kbit/s, 0 before the first measurement.
    pub fn average(&self) -> u32 {
        self.inner.lock().bitrate_avg
    }
}

impl Default for BitrateMonitor {
    fn default() -> Self {
        Self::new()
    }
}
