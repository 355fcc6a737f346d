// Release plan scheduling

use chrono::{Days, NaiveDate};

use super::ReleasePlan;
use crate::domain::error::{DomainError, Result};

/// One row of the plan: vouchers released for a single arrival day
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArrivalDay {
    /// Arrival (wave) number, 1-based
    pub arrival_number: u32,
    /// Day number inside the arrival, 1-based
    pub day_number: u32,
    pub arrival_date: NaiveDate,
    pub departure_date: NaiveDate,
    pub vouchers: u32,
    /// Occupied beds after this day's arrivals
    pub occupancy: u32,
    pub capacity: u32,
    /// Empty days following this day (non-zero only on the last day of an arrival)
    pub gap_after: u32,
    pub voucher_from: u64,
    pub voucher_to: u64,
}

/// How filling one arrival ended
enum WaveEnd {
    Completed,
    /// A stay window ran into the stop period
    Stopped,
    /// A stay window would end after the plan period
    PlanEnd,
}

impl ReleasePlan {
    /// Build the arrival schedule, numbering vouchers from `first_voucher`.
    ///
    /// Call on a validated plan. Voucher numbers are consecutive across rows;
    /// numbering past `u64::MAX` is a validation error.
    pub fn schedule(&self, first_voucher: u64) -> Result<Vec<ArrivalDay>> {
        let mut rows = Vec::new();
        let mut start = self.period.from;
        let mut next_voucher = first_voucher;
        let mut arrival_number = 1;

        loop {
            let (days, end, after) = self.fill_arrival(arrival_number, start, next_voucher)?;
            next_voucher = after;

            match end {
                WaveEnd::PlanEnd => {
                    rows.extend(days);
                    break;
                }
                WaveEnd::Completed => {
                    let Some(next_start) = days
                        .last()
                        .and_then(|last| shift(last.departure_date, u64::from(last.gap_after) + 1))
                    else {
                        rows.extend(days);
                        break;
                    };
                    rows.extend(days);
                    start = next_start;
                    arrival_number += 1;
                }
                WaveEnd::Stopped => {
                    // Resume the day after the stop period; a partial arrival keeps its number
                    let Some(resume) = self.stop_period.and_then(|stop| shift(stop.to, 1)) else {
                        rows.extend(days);
                        break;
                    };
                    if !days.is_empty() {
                        rows.extend(days);
                        arrival_number += 1;
                    }
                    start = resume;
                }
            }
        }

        Ok(rows)
    }

    /// Returns the arrival's days, how it ended and the next free voucher number
    fn fill_arrival(
        &self,
        arrival_number: u32,
        start: NaiveDate,
        first_voucher: u64,
    ) -> Result<(Vec<ArrivalDay>, WaveEnd, u64)> {
        let mut days: Vec<ArrivalDay> = Vec::new();
        let mut occupancy: u32 = 0;
        let mut voucher = first_voucher;
        let mut offset: u64 = 0;

        while (days.len() as u32) < self.arrival_days {
            let Some(arrival_date) = shift(start, offset) else {
                return Ok((days, WaveEnd::PlanEnd, voucher));
            };
            let Some(departure_date) = shift(arrival_date, u64::from(self.stay_days).saturating_sub(1)) else {
                return Ok((days, WaveEnd::PlanEnd, voucher));
            };

            if let Some(stop) = &self.stop_period {
                if stop.overlaps(arrival_date, departure_date) {
                    return Ok((days, WaveEnd::Stopped, voucher));
                }
            }
            if departure_date > self.period.to {
                return Ok((days, WaveEnd::PlanEnd, voucher));
            }

            let (per_day, capacity) = match &self.reduction {
                Some(r) if r.period.overlaps(arrival_date, departure_date) => (
                    self.reduced_vouchers_per_day(),
                    self.bed_capacity.saturating_sub(r.beds),
                ),
                _ => (self.vouchers_per_day(), self.bed_capacity),
            };

            if !self.is_non_arrival_day(arrival_date) && occupancy + per_day <= capacity {
                let mut vouchers = per_day;
                occupancy += per_day;

                let is_last = days.len() as u32 + 1 == self.arrival_days;
                if is_last && occupancy < capacity {
                    // Top up the last day to the full capacity
                    vouchers += capacity - occupancy;
                    occupancy = capacity;
                }

                let voucher_to = voucher
                    .checked_add(u64::from(vouchers) - 1)
                    .ok_or_else(voucher_overflow)?;
                days.push(ArrivalDay {
                    arrival_number,
                    day_number: days.len() as u32 + 1,
                    arrival_date,
                    departure_date,
                    vouchers,
                    occupancy,
                    capacity,
                    gap_after: if is_last { self.trailing_gap() } else { 0 },
                    voucher_from: voucher,
                    voucher_to,
                });
                voucher = voucher_to.checked_add(1).ok_or_else(voucher_overflow)?;
            }
            offset += 1;
        }

        Ok((days, WaveEnd::Completed, voucher))
    }
}

fn voucher_overflow() -> DomainError {
    DomainError::ValidationError("voucher numbers exceed the numbering range".to_string())
}

fn shift(date: NaiveDate, days: u64) -> Option<NaiveDate> {
    date.checked_add_days(Days::new(days))
}
