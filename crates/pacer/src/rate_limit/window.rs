use serde::{Deserialize, Serialize};

/// Static definition of one fixed-window counter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimiterSpec {
    pub label: String,
    /// Window length in ms.
    pub period_ms: i64,
    /// Uses permitted per window.
    pub limit: u32,
    /// Spread permitted uses evenly across the window instead of releasing the
    /// whole quota at the window start.
    #[serde(default)]
    pub spread: bool,
}

impl LimiterSpec {
    pub fn new(label: impl Into<String>, period_ms: i64, limit: u32, spread: bool) -> Self {
        Self {
            label: label.into(),
            period_ms,
            limit,
            spread,
        }
    }
}

/// Usage within the current window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowState {
    /// Time of the first use; the window ends at `first + period_ms`.
    pub first: i64,
    /// Time of the latest use.
    pub last: i64,
    pub count: u32,
}

/// A single fixed-window usage counter.
#[derive(Debug, Clone)]
pub struct FixedWindowLimiter {
    spec: LimiterSpec,
    state: Option<WindowState>,
}

impl FixedWindowLimiter {
    pub fn new(spec: LimiterSpec) -> Self {
        Self { spec, state: None }
    }

    pub fn spec(&self) -> &LimiterSpec {
        &self.spec
    }

    pub fn label(&self) -> &str {
        &self.spec.label
    }

    /// Current window, if one is open at `now`.
    pub fn state(&self, now: i64) -> Option<WindowState> {
        self.state
            .filter(|s| s.first.saturating_add(self.spec.period_ms) > now)
    }

    pub(crate) fn set_state(&mut self, state: Option<WindowState>) {
        self.state = state;
    }

    /// Minimum spacing between uses when spreading.
    fn interval_ms(&self) -> i64 {
        self.spec.period_ms / i64::from(self.spec.limit.max(1))
    }

    /// How long a caller must wait at `now` before one more use is permitted.
    pub fn suspend_for(&self, now: i64) -> i64 {
        let Some(state) = self.state(now) else {
            return 0;
        };
        let mut wait = 0;
        if state.count >= self.spec.limit {
            wait = state.first + self.spec.period_ms - now;
        }
        if self.spec.spread {
            wait = wait.max(state.last + self.interval_ms() - now);
        }
        wait.max(0)
    }

    /// Count one use at `now`.
    pub fn increment(&mut self, now: i64) {
        self.state = Some(match self.state(now) {
            Some(s) => WindowState {
                first: s.first,
                last: now.max(s.last),
                count: s.count.saturating_add(1),
            },
            None => WindowState {
                first: now,
                last: now,
                count: 1,
            },
        });
    }

    /// Uses counted in the current window.
    pub fn used(&self, now: i64) -> u32 {
        self.state(now).map_or(0, |s| s.count)
    }

    /// Time until the current window closes, 0 if none is open.
    pub fn resets_in(&self, now: i64) -> i64 {
        self.state(now)
            .map_or(0, |s| s.first + self.spec.period_ms - now)
    }
}
