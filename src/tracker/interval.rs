//! Decides how long to wait before the next scan.

/// Longest cooldown after repeated classification failures, in seconds.
pub const MAX_BACKOFF_SECONDS: u64 = 180;
/// Consecutive failures counted towards the backoff exponent.
pub const MAX_ERROR_STREAK: u32 = 3;
/// Upper bound of the adaptive multiplier.
const MAX_MULTIPLIER: u64 = 4;

/// Scans less often while the same project keeps being confirmed. Any change of context brings
/// the interval straight back to the base value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdaptiveInterval {
    base: u64,
    stable_match_id: Option<String>,
    stable_match_count: u32,
    effective: u64,
}

impl AdaptiveInterval {
    pub fn new(base: u64) -> Self {
        Self {
            base,
            stable_match_id: None,
            stable_match_count: 0,
            effective: base,
        }
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn effective(&self) -> u64 {
        self.effective
    }

    pub fn stable_match(&self) -> (Option<&str>, u32) {
        (self.stable_match_id.as_deref(), self.stable_match_count)
    }

    /// Changing the base interval drops the streak.
    pub fn set_base(&mut self, base: u64) {
        self.base = base;
        self.reset();
    }

    pub fn reset(&mut self) {
        self.stable_match_id = None;
        self.stable_match_count = 0;
        self.effective = self.base;
    }

    /// Feeds the match of a completed scan and returns the interval until the next one.
    pub fn update(&mut self, match_id: Option<&str>) -> u64 {
        let Some(match_id) = match_id else {
            self.reset();
            return self.base;
        };

        if self.stable_match_id.as_deref() == Some(match_id) {
            self.stable_match_count += 1;
        } else {
            self.stable_match_id = Some(match_id.to_string());
            self.stable_match_count = 1;
        }

        let multiplier = match self.stable_match_count {
            6.. => 4,
            4.. => 3,
            2.. => 2,
            _ => 1,
        };
        self.effective = self
            .base
            .saturating_mul(multiplier)
            .clamp(self.base, self.base.saturating_mul(MAX_MULTIPLIER));
        self.effective
    }
}

/// Exponential cooldown after failed classifications.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorBackoff {
    error_count: u32,
    cooldown: u64,
}

impl ErrorBackoff {
    pub fn error_count(&self) -> u32 {
        self.error_count
    }

    pub fn cooldown(&self) -> u64 {
        self.cooldown
    }

    pub fn is_cooling_down(&self) -> bool {
        self.cooldown > 0
    }

    /// Registers a failure and returns the cooldown, which is also the delay until the next
    /// scan attempt.
    pub fn apply(&mut self, base: u64) -> u64 {
        self.error_count = (self.error_count + 1).min(MAX_ERROR_STREAK);
        self.cooldown = base
            .saturating_mul(1 << self.error_count)
            .min(MAX_BACKOFF_SECONDS);
        self.cooldown
    }

    /// One second of cooldown has passed.
    pub fn tick(&mut self) {
        self.cooldown = self.cooldown.saturating_sub(1);
    }

    pub fn reset(&mut self) {
        self.error_count = 0;
        self.cooldown = 0;
    }
}
