/// Within-step percentage announced by an output line, if any.
///
/// Recognises `::progress:: <n>` and `progress: <n>%` (case-insensitive).
pub fn parse_marker(line: &str) -> Option<u8> {
    let trimmed = line.trim();
    if let Some(rest) = trimmed.strip_prefix("::progress::") {
        return parse_percent(rest.trim());
    }
    let lower = trimmed.to_ascii_lowercase();
    let idx = lower.find("progress:")?;
    let rest = &lower[idx + "progress:".len()..];
    let (digits, _) = rest.split_once('%')?;
    parse_percent(digits.trim())
}

fn parse_percent(s: &str) -> Option<u8> {
    let n: f64 = s.parse().ok()?;
    if !(0.0..=100.0).contains(&n) {
        return None;
    }
    Some(n.round() as u8)
}

/// Maps per-step markers onto the 0-100 range of a whole install plan.
///
/// Each of the `steps` owns an equal band. The overall value never decreases.
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    steps: usize,
    current: usize,
    percent: u8,
    determinate: bool,
}

impl ProgressTracker {
    pub fn new(steps: usize) -> Self {
        Self {
            steps: steps.max(1),
            current: 0,
            percent: 0,
            determinate: false,
        }
    }

    pub fn percent(&self) -> u8 {
        self.percent
    }

    pub fn determinate(&self) -> bool {
        self.determinate
    }

    pub fn begin_step(&mut self, index: usize) {
        self.current = index.min(self.steps - 1);
    }

    fn band(&self) -> (usize, usize) {
        (
            self.current * 100 / self.steps,
            (self.current + 1) * 100 / self.steps,
        )
    }

    fn advance(&mut self, value: u8) -> Option<u8> {
        let was_determinate = self.determinate;
        self.determinate = true;
        if value > self.percent {
            self.percent = value;
            Some(value)
        } else if !was_determinate {
            Some(self.percent)
        } else {
            None
        }
    }

    /// Apply a within-step marker. Returns the new overall value if it changed.
    pub fn observe(&mut self, marker: u8) -> Option<u8> {
        let (start, end) = self.band();
        let value = start + (end - start) * usize::from(marker.min(100)) / 100;
        self.advance(value as u8)
    }

    /// The current step finished; jump to the end of its band.
    pub fn complete_step(&mut self) -> Option<u8> {
        let (_, end) = self.band();
        self.advance(end as u8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marker_formats() {
        assert_eq!(parse_marker("::progress:: 40"), Some(40));
        assert_eq!(parse_marker("  ::progress::100  "), Some(100));
        assert_eq!(parse_marker("Download progress: 12.6%"), Some(13));
        assert_eq!(parse_marker("PROGRESS: 7%"), Some(7));
        assert_eq!(parse_marker("progress: soon"), None);
        assert_eq!(parse_marker("progress: 50"), None);
        assert_eq!(parse_marker("::progress:: 250"), None);
        assert_eq!(parse_marker("Collecting torch"), None);
    }

    #[test]
    fn single_step_maps_directly() {
        let mut t = ProgressTracker::new(1);
        assert!(!t.determinate());
        assert_eq!(t.observe(10), Some(10));
        assert!(t.determinate());
        assert_eq!(t.observe(50), Some(50));
        assert_eq!(t.complete_step(), Some(100));
    }

    #[test]
    fn bands_split_evenly() {
        let mut t = ProgressTracker::new(2);
        assert_eq!(t.observe(50), Some(25));
        assert_eq!(t.complete_step(), Some(50));
        t.begin_step(1);
        assert_eq!(t.observe(0), None);
        assert_eq!(t.observe(50), Some(75));
        assert_eq!(t.complete_step(), Some(100));
    }

    #[test]
    fn never_decreases() {
        let mut t = ProgressTracker::new(1);
        t.observe(60);
        assert_eq!(t.observe(30), None);
        assert_eq!(t.percent(), 60);
    }

    #[test]
    fn first_completion_without_markers_becomes_determinate() {
        let mut t = ProgressTracker::new(3);
        assert_eq!(t.complete_step(), Some(33));
        assert!(t.determinate());
    }

    #[test]
    fn first_zero_marker_reports_determinate_zero() {
        let mut t = ProgressTracker::new(1);
        assert_eq!(t.observe(0), Some(0));
        assert_eq!(t.observe(0), None);
    }
}
