// Helpers for measuring how long things take
//
// Austin Shafer - 2020
use std::time::{Duration, Instant};

// A stopclock for measuring time intervals
//
// The order of use MUST be `new`, `start`, `end`
// after that the recorded duration can be
// got with `get_duration`
pub struct StopWatch {
    sw_start: Option<Instant>,
    sw_end: Option<Instant>,
}

impl StopWatch {
    // Create an empty stopwatch
    pub fn new() -> StopWatch {
        StopWatch {
            sw_start: None,
            sw_end: None,
        }
    }

    pub fn start(&mut self) {
        self.sw_start = Some(Instant::now());
        self.sw_end = None;
    }

    pub fn end(&mut self) {
        self.sw_end = Some(Instant::now());
    }

    pub fn get_duration(&self) -> Duration {
        match (self.sw_start, self.sw_end) {
            (Some(start), Some(end)) => end.duration_since(start),
            _ => Duration::from_millis(0),
        }
    }
}

/// Scoped timer for one operation
///
/// Starts counting when it is created and logs the elapsed time at
/// debug level when it goes out of scope:
///
/// ```
/// let _t = utils::timing::PerfTimer::new("import dmabuf");
/// // work to measure
/// ```
pub struct PerfTimer {
    pt_op: &'static str,
    pt_watch: StopWatch,
}

impl PerfTimer {
    pub fn new(op: &'static str) -> Self {
        let mut watch = StopWatch::new();
        watch.start();
        Self {
            pt_op: op,
            pt_watch: watch,
        }
    }

    /// Time spent so far, without ending the timer
    pub fn elapsed(&self) -> Duration {
        match self.pt_watch.sw_start {
            Some(start) => start.elapsed(),
            None => Duration::from_millis(0),
        }
    }
}

impl Drop for PerfTimer {
    fn drop(&mut self) {
        self.pt_watch.end();
        tracing::debug!(
            "Performance: {} took {} microseconds",
            self.pt_op,
            self.pt_watch.get_duration().as_micros()
        );
    }
}
