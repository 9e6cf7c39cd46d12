//! Battery discharge tracking and time-to-empty estimation.
//!
//! Battery drops are recorded per worn component (left/right bud, or the
//! headphone) and a least-squares discharge rate is fitted over the samples
//! inside a fixed horizon.

use std::{
   borrow::Borrow,
   time::{Duration, Instant},
};

use log::{debug, info};

use crate::{airpods::device::Battery, ringbuf::Ring};

/// Ring buffer capacity for battery history.
const BATTERY_HISTORY_SIZE: usize = 32;
/// Minimum number of samples before an estimate is produced.
const MIN_SAMPLES: usize = 2;
/// Samples at which the estimate starts trusting new values more.
const CONFIDENT_SAMPLES: usize = 10;
/// Upper bound on a plausible estimate.
const MAX_TTL_MINUTES: u32 = 24 * 60;

#[derive(Debug, Clone, Copy, Default)]
struct Sample {
   /// Offset from the tracker's base time.
   at: Duration,
   level: u8,
}

#[derive(Debug, Clone, Copy, Default)]
struct BatteryHistory {
   samples: Ring<Sample, BATTERY_HISTORY_SIZE>,
}

impl BatteryHistory {
   fn last_level(&self) -> Option<u8> {
      self.samples.last().map(|s| s.level)
   }

   /// Returns whether a sample was recorded.
   fn record_battery_drop(&mut self, at: Duration, level: u8) -> bool {
      if let Some(last_level) = self.last_level() {
         if level >= last_level {
            return false;
         }
         debug!("Battery dropped from {last_level} to {level}");
      }
      self.samples.push(Sample { at, level });
      true
   }

   /// Fits a discharge rate (percent per hour) over samples newer than `cutoff`.
   fn drain_rate(&self, cutoff: Duration) -> Option<(f64, usize)> {
      let samples: heapless::Vec<(Duration, u8), BATTERY_HISTORY_SIZE> = self
         .samples
         .iter()
         .filter(|s| s.at >= cutoff)
         .map(|s| (s.at, s.level))
         .collect();
      if samples.len() < MIN_SAMPLES {
         return None;
      }
      let rate = calculate_slope(&samples)?;
      Some((rate, samples.len()))
   }
}

/// Per-device discharge tracker.
#[derive(Debug, Clone)]
pub struct BatteryTracker {
   base: Instant,
   horizon: Duration,
   histories: [BatteryHistory; 2],
   last_estimate: Option<u32>,
}

impl BatteryTracker {
   pub fn new(horizon: Duration) -> Self {
      Self::with_base(Instant::now(), horizon)
   }

   pub fn with_base(base: Instant, horizon: Duration) -> Self {
      Self {
         base,
         horizon,
         histories: Default::default(),
         last_estimate: None,
      }
   }

   /// Records a battery reading and recomputes the time-to-empty estimate.
   ///
   /// Returns the estimate in minutes, or `None` while anything is charging
   /// or not enough discharge history exists.
   pub fn update(&mut self, battery: &Battery, now: Instant) -> Option<u32> {
      let at = now.saturating_duration_since(self.base);
      let charging = match battery {
         Battery::Dual { left, right, .. } => {
            [left, right].map(|c| c.is_some_and(|c| c.is_charging()))
         },
         Battery::Single { headphone } => [headphone.is_some_and(|c| c.is_charging()), false],
      };

      let levels = battery.worn_levels();
      let mut changed = false;
      for ((history, level), charging) in self.histories.iter_mut().zip(levels).zip(charging) {
         if charging {
            if !history.samples.is_empty() {
               debug!("Component started charging, clearing battery history");
               history.samples.clear();
               changed = true;
            }
         } else if let Some(level) = level {
            changed |= history.record_battery_drop(at, level);
         }
      }

      if battery.any_charging() {
         if self.last_estimate.take().is_some() {
            debug!("Battery TTL estimation unavailable: charging");
         }
         return None;
      }

      // A repeated reading adds no information, keep the estimate stable
      if changed {
         self.last_estimate = self.estimate(levels, at);
      }
      self.last_estimate
   }

   fn estimate(&self, levels: [Option<u8>; 2], at: Duration) -> Option<u32> {
      let cutoff = at.saturating_sub(self.horizon);
      let (rate, samples) = self
         .histories
         .iter()
         .zip(levels)
         .filter(|(_, level)| level.is_some())
         .filter_map(|(history, _)| history.drain_rate(cutoff))
         .reduce(|(r1, n1), (r2, n2)| (r1.max(r2), n1.min(n2)))?;

      // Most drained component bounds the estimate
      let min_level = levels.into_iter().flatten().min()?;
      let new_minutes = (f64::from(min_level) / rate * 60.0) as u32;
      if new_minutes == 0 || new_minutes >= MAX_TTL_MINUTES {
         debug!("Battery TTL estimation unavailable: implausible {new_minutes} minutes");
         return None;
      }

      let alpha = if samples >= CONFIDENT_SAMPLES { 0.3 } else { 0.1 };
      Some(match self.last_estimate {
         Some(last) => {
            (f64::from(new_minutes) * alpha + f64::from(last) * (1.0 - alpha)).round() as u32
         },
         None => {
            info!("Battery TTL estimation now available: {new_minutes} minutes remaining");
            new_minutes
         },
      })
   }
}

/// Least-squares slope of level over time, as a positive drain rate per hour.
fn calculate_slope<I>(samples: I) -> Option<f64>
where
   I: IntoIterator<Item: Borrow<(Duration, u8)>>,
   I::IntoIter: ExactSizeIterator,
{
   let samples = samples.into_iter();
   let len = samples.len();
   if len < 2 {
      return None;
   }

   let n = len as f64;
   let mut sum_x = 0.0;
   let mut sum_y = 0.0;
   let mut sum_xy = 0.0;
   let mut sum_xx = 0.0;
   let mut base_time = None;

   for v in samples {
      let (at, level) = *v.borrow();
      let base = *base_time.get_or_insert(at);
      let x = at.saturating_sub(base).as_secs_f64() / 3600.0;
      let y = f64::from(level);

      sum_x += x;
      sum_y += y;
      sum_xy += x * y;
      sum_xx += x * x;
   }

   let denominator = n * sum_xx - sum_x * sum_x;
   if denominator.abs() < f64::EPSILON {
      return None;
   }

   let slope = (n * sum_xy - sum_x * sum_y) / denominator;
   (slope < 0.0).then_some(-slope)
}
