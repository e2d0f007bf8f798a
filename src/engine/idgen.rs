//! Monotonic ULID generation and identifier classification.

use crate::core::error::{RekeyError, Result};
use regex::Regex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use ulid::Ulid;

/// Largest timestamp a ULID can carry (48 bits of milliseconds).
pub const MAX_TIMESTAMP_MS: u64 = (1 << 48) - 1;

pub trait Clock: Send {
    fn now_ms(&self) -> u64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// Produces strictly increasing ULIDs for the lifetime of a run.
///
/// Within one millisecond the random component of the previous id is
/// incremented. When that overflows the generator moves to the next
/// millisecond, but never further than `max_drift_ms` ahead of the clock.
pub struct IdGenerator {
    clock: Box<dyn Clock>,
    last: Option<Ulid>,
    max_drift_ms: u64,
    issued: u64,
}

impl IdGenerator {
    pub fn new(max_drift_ms: u64) -> Self {
        Self::with_clock(Box::new(SystemClock), max_drift_ms)
    }

    pub fn with_clock(clock: Box<dyn Clock>, max_drift_ms: u64) -> Self {
        Self {
            clock,
            last: None,
            max_drift_ms,
            issued: 0,
        }
    }

    /// Continue after `last` instead of starting fresh.
    pub fn resume_after(mut self, last: Ulid) -> Self {
        self.last = Some(last);
        self
    }

    pub fn issued(&self) -> u64 {
        self.issued
    }

    pub fn next_id(&mut self) -> Result<Ulid> {
        let now = self.clock.now_ms();
        let id = match self.last {
            None => mint(now)?,
            Some(last) if now > last.timestamp_ms() => mint(now)?,
            Some(last) => match last.increment() {
                Some(next) => next,
                None => {
                    let borrowed = last.timestamp_ms() + 1;
                    if borrowed > now.saturating_add(self.max_drift_ms) {
                        return Err(RekeyError::GeneratorExhausted(format!(
                            "random space exhausted through {} ms, {} ms ahead of the clock",
                            last.timestamp_ms(),
                            borrowed.saturating_sub(now)
                        )));
                    }
                    mint(borrowed)?
                }
            },
        };
        self.last = Some(id);
        self.issued += 1;
        Ok(id)
    }
}

fn mint(timestamp_ms: u64) -> Result<Ulid> {
    if timestamp_ms > MAX_TIMESTAMP_MS {
        return Err(RekeyError::GeneratorExhausted(format!(
            "timestamp {} ms is beyond the ULID range",
            timestamp_ms
        )));
    }
    Ok(Ulid::from_datetime(
        UNIX_EPOCH + Duration::from_millis(timestamp_ms),
    ))
}

/// Canonical upper-case ULID text, the form rekey writes.
pub fn is_target_id(value: &str) -> bool {
    value.len() == 26
        && Ulid::from_string(value)
            .map(|u| u.to_string() == value)
            .unwrap_or(false)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdKind {
    Target,
    Legacy,
    Unrecognized,
}

/// Classifies stored identifiers. Without a legacy pattern every non-ULID
/// value counts as legacy.
#[derive(Debug, Clone, Default)]
pub struct IdScheme {
    legacy: Option<Regex>,
}

impl IdScheme {
    pub fn new(legacy_pattern: Option<&str>) -> Result<Self> {
        let legacy = legacy_pattern
            .map(|p| {
                Regex::new(p).map_err(|e| {
                    RekeyError::ConfigError(format!("legacy_pattern is not a valid regex: {}", e))
                })
            })
            .transpose()?;
        Ok(Self { legacy })
    }

    pub fn has_pattern(&self) -> bool {
        self.legacy.is_some()
    }

    pub fn classify(&self, value: &str) -> IdKind {
        if is_target_id(value) {
            return IdKind::Target;
        }
        match &self.legacy {
            Some(re) if !re.is_match(value) => IdKind::Unrecognized,
            _ => IdKind::Legacy,
        }
    }
}
