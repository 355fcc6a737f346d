// Voucher Release Plan Domain Model
//
// A release plan distributes a department's beds over arrival days inside a
// planning period. Arrival plans fill the capacity over several arrival days
// followed by sanitary days; daily plans release a fixed share every day.

mod request;
mod schedule;

pub use request::ReleasePlanRequest;
pub use schedule::ArrivalDay;

use chrono::{NaiveDate, Weekday};

use super::error::{DomainError, Result};

/// Plan type (`plan_type.code` 2 = arrival plan, anything else = daily plan)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanType {
    Arrival,
    Daily,
}

impl PlanType {
    pub fn from_code(code: i64) -> Self {
        if code == 2 {
            PlanType::Arrival
        } else {
            PlanType::Daily
        }
    }
}

/// Inclusive date range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRange {
    pub from: NaiveDate,
    pub to: NaiveDate,
}

impl DateRange {
    pub fn new(from: NaiveDate, to: NaiveDate) -> Self {
        Self { from, to }
    }

    pub fn contains(&self, other: &DateRange) -> bool {
        other.from >= self.from && other.to <= self.to
    }

    pub fn overlaps(&self, from: NaiveDate, to: NaiveDate) -> bool {
        from <= self.to && to >= self.from
    }
}

/// Temporary bed reduction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reduction {
    pub period: DateRange,
    pub beds: u32,
}

/// Validated input of the release plan algorithm
#[derive(Debug, Clone, PartialEq)]
pub struct ReleasePlan {
    pub plan_type: PlanType,
    pub bed_capacity: u32,
    pub stay_days: u32,
    pub arrival_days: u32,
    pub period: DateRange,
    pub stop_period: Option<DateRange>,
    pub reduction: Option<Reduction>,
    pub sanitary_days: u32,
    pub days_between_arrivals: u32,
    pub non_arrival_days: Vec<Weekday>,
}

impl ReleasePlan {
    pub fn validate(&self) -> Result<()> {
        if self.bed_capacity == 0 {
            return Err(invalid("bed capacity must be greater than 0"));
        }
        if self.stay_days == 0 {
            return Err(invalid("number of stay days must be greater than 0"));
        }
        if self.period.from > self.period.to {
            return Err(invalid("plan period must start before it ends"));
        }
        // Daily plans also end an arrival after `arrival_days` used days
        if self.arrival_days == 0 || self.arrival_days > self.stay_days {
            return Err(invalid(
                "number of arrival days must be greater than 0 and not exceed stay days",
            ));
        }
        if self.non_arrival_days.len() >= 7 {
            return Err(invalid("not every day of the week can be a non-arrival day"));
        }
        if self.vouchers_per_day() == 0 {
            return Err(invalid("bed capacity is too small to release vouchers"));
        }
        if let Some(stop) = &self.stop_period {
            if stop.from > stop.to || !self.period.contains(stop) {
                return Err(invalid("stop period must lie within the plan period"));
            }
        }
        if let Some(reduction) = &self.reduction {
            if reduction.period.from > reduction.period.to
                || !self.period.contains(&reduction.period)
            {
                return Err(invalid("reducing period must lie within the plan period"));
            }
            if reduction.beds == 0 || reduction.beds >= self.bed_capacity {
                return Err(invalid(
                    "reduced beds must be greater than 0 and below bed capacity",
                ));
            }
            if self.reduced_vouchers_per_day() == 0 {
                return Err(invalid("bed reduction leaves no vouchers to release"));
            }
        }
        Ok(())
    }

    /// Vouchers released per arrival day
    pub fn vouchers_per_day(&self) -> u32 {
        match self.plan_type {
            PlanType::Arrival => self.bed_capacity / self.arrival_days.max(1),
            PlanType::Daily => self.bed_capacity / self.stay_days.max(1),
        }
    }

    /// Vouchers released per arrival day while beds are reduced
    pub fn reduced_vouchers_per_day(&self) -> u32 {
        let beds = self.reduction.map(|r| r.beds).unwrap_or(0);
        self.vouchers_per_day()
            .saturating_sub(beds / self.arrival_days.max(1))
    }

    /// Days left empty after the last day of an arrival
    pub fn trailing_gap(&self) -> u32 {
        match self.plan_type {
            PlanType::Arrival => self.sanitary_days,
            PlanType::Daily => self.days_between_arrivals,
        }
    }

    pub fn is_non_arrival_day(&self, date: NaiveDate) -> bool {
        use chrono::Datelike;
        self.non_arrival_days.contains(&date.weekday())
    }
}

/// Weekday from its 1-based code (1 = Monday .. 7 = Sunday)
pub fn weekday_from_code(code: i64) -> Option<Weekday> {
    match code {
        1 => Some(Weekday::Mon),
        2 => Some(Weekday::Tue),
        3 => Some(Weekday::Wed),
        4 => Some(Weekday::Thu),
        5 => Some(Weekday::Fri),
        6 => Some(Weekday::Sat),
        7 => Some(Weekday::Sun),
        _ => None,
    }
}

fn invalid(message: &str) -> DomainError {
    DomainError::ValidationError(message.to_string())
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    pub fn arrival_plan() -> ReleasePlan {
        ReleasePlan {
            plan_type: PlanType::Arrival,
            bed_capacity: 300,
            stay_days: 14,
            arrival_days: 5,
            period: DateRange::new(date(2026, 1, 1), date(2026, 4, 9)),
            stop_period: None,
            reduction: None,
            sanitary_days: 2,
            days_between_arrivals: 1,
            non_arrival_days: vec![],
        }
    }
}
