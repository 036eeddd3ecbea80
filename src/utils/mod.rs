use std::time::{Duration, Instant};
use tracing::info;

/// Run stopwatch. On drop it logs elapsed time and, once [`Timer::pages`]
/// has been called, pages per second.
pub struct Timer {
    label: &'static str,
    start: Instant,
    pages: Option<usize>,
}

impl Timer {
    pub fn start(label: &'static str) -> Self {
        info!("⏱  Starting: {}", label);
        Self {
            label,
            start: Instant::now(),
            pages: None,
        }
    }

    pub fn pages(&mut self, n: usize) {
        self.pages = Some(n);
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        let took = self.start.elapsed();
        match self.pages.and_then(|n| pages_per_sec(n, took)) {
            Some(rate) => info!("⏱  Finished: {} (took {:.2?}, {:.2} pages/s)", self.label, took, rate),
            None => info!("⏱  Finished: {} (took {:.2?})", self.label, took),
        }
    }
}

fn pages_per_sec(pages: usize, took: Duration) -> Option<f64> {
    let secs = took.as_secs_f64();
    (pages > 0 && secs > 0.0).then(|| pages as f64 / secs)
}

/// Thousands separators: `5432` → `5,432`.
pub fn fmt_count(n: usize) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}

/// Human-readable file size in binary units.
pub fn fmt_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["KiB", "MiB", "GiB", "TiB"];
    if bytes < 1024 {
        return format!("{} B", bytes);
    }
    let mut size = bytes as f64 / 1024.0;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    format!("{:.1} {}", size, UNITS[unit])
}
