//! Maintenance windows
//!
//! Windows are wall-clock ranges in UTC and may span midnight
//! (`22:00-04:00`). `start == end` means always open.

use chrono::{DateTime, Duration, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tokio::sync::watch;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaintenanceWindow {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl MaintenanceWindow {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        Self { start, end }
    }

    pub fn always() -> Self {
        Self::new(NaiveTime::default(), NaiveTime::default())
    }

    /// Membership test with midnight wraparound; end is exclusive
    pub fn contains(&self, t: NaiveTime) -> bool {
        if self.start == self.end {
            true
        } else if self.start < self.end {
            self.start <= t && t < self.end
        } else {
            t >= self.start || t < self.end
        }
    }

    pub fn is_open_at(&self, now: DateTime<Utc>) -> bool {
        self.contains(now.time())
    }

    /// Time until the window next opens; zero when already open
    pub fn until_open(&self, now: DateTime<Utc>) -> Duration {
        if self.is_open_at(now) {
            return Duration::zero();
        }
        let today_start = now.date_naive().and_time(self.start).and_utc();
        if today_start > now {
            today_start - now
        } else {
            today_start + Duration::days(1) - now
        }
    }

    /// Sleep until the window opens; returns false if shutdown fired first
    pub async fn wait_until_open(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        loop {
            if *shutdown.borrow() {
                return false;
            }
            let wait = self.until_open(Utc::now());
            if wait <= Duration::zero() {
                return true;
            }
            info!("Waiting {}s for maintenance window {}", wait.num_seconds(), self);
            let sleep = wait.to_std().unwrap_or(std::time::Duration::from_secs(60));
            tokio::select! {
                _ = tokio::time::sleep(sleep) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return false;
                    }
                }
            }
        }
    }
}

impl Default for MaintenanceWindow {
    fn default() -> Self {
        Self::always()
    }
}

impl fmt::Display for MaintenanceWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start.format("%H:%M"), self.end.format("%H:%M"))
    }
}

impl FromStr for MaintenanceWindow {
    type Err = String;

    /// Parses `HH:MM-HH:MM`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (start, end) = s
            .split_once('-')
            .ok_or_else(|| format!("maintenance window must be HH:MM-HH:MM, got {:?}", s))?;
        let parse = |v: &str| {
            NaiveTime::parse_from_str(v.trim(), "%H:%M")
                .map_err(|e| format!("bad time {:?}: {}", v, e))
        };
        Ok(Self::new(parse(start)?, parse(end)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn test_same_day_window() {
        let w: MaintenanceWindow = "02:00-05:00".parse().unwrap();
        assert!(w.contains(t(2, 0)));
        assert!(w.contains(t(4, 59)));
        assert!(!w.contains(t(5, 0)));
        assert!(!w.contains(t(1, 59)));
    }

    #[test]
    fn test_window_spanning_midnight() {
        let w: MaintenanceWindow = "22:00-04:00".parse().unwrap();
        assert!(w.contains(t(23, 30)));
        assert!(w.contains(t(0, 0)));
        assert!(w.contains(t(3, 59)));
        assert!(!w.contains(t(4, 0)));
        assert!(!w.contains(t(12, 0)));
        assert!(!w.contains(t(21, 59)));
    }

    #[test]
    fn test_equal_bounds_always_open() {
        assert!(MaintenanceWindow::always().contains(t(13, 37)));
    }

    #[test]
    fn test_until_open() {
        let w: MaintenanceWindow = "22:00-04:00".parse().unwrap();
        let noon = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        assert_eq!(w.until_open(noon), Duration::hours(10));

        let early: MaintenanceWindow = "01:00-02:00".parse().unwrap();
        assert_eq!(early.until_open(noon), Duration::hours(13));

        let late_night = Utc.with_ymd_and_hms(2026, 3, 1, 23, 0, 0).unwrap();
        assert_eq!(w.until_open(late_night), Duration::zero());
    }

    #[test]
    fn test_parse_errors() {
        assert!("0200-0500".parse::<MaintenanceWindow>().is_err());
        assert!("25:00-01:00".parse::<MaintenanceWindow>().is_err());
    }

    #[tokio::test]
    async fn test_wait_is_cancelable() {
        let now = Utc::now();
        let start = (now + Duration::hours(2)).time();
        let end = (now + Duration::hours(3)).time();
        let w = MaintenanceWindow::new(start, end);

        let (tx, mut rx) = watch::channel(false);
        let waiter = tokio::spawn(async move { w.wait_until_open(&mut rx).await });
        tx.send(true).unwrap();
        assert!(!waiter.await.unwrap());
    }
}
