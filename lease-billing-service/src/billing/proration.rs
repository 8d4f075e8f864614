//! Calendar helpers and rent proration.

use crate::error::BillingError;
use crate::models::ProrationMethod;
use chrono::{Datelike, Months, NaiveDate};
use rust_decimal::{Decimal, RoundingStrategy};

/// Round a money amount to cents, midpoint away from zero.
pub fn round_money(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// Last calendar day of the month containing `date`.
pub fn last_day_of_month(date: NaiveDate) -> NaiveDate {
    date.with_day(1)
        .and_then(|first| first.checked_add_months(Months::new(1)))
        .and_then(|next| next.pred_opt())
        .unwrap_or(NaiveDate::MAX)
}

/// Length of the month containing `date`.
pub fn days_in_month(date: NaiveDate) -> u32 {
    last_day_of_month(date).day()
}

/// The part of a date range that falls inside one calendar month.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonthSegment {
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub days_in_month: u32,
}

impl MonthSegment {
    pub fn covered_days(&self) -> u32 {
        self.end.day() - self.start.day() + 1
    }

    pub fn is_full_month(&self) -> bool {
        self.start.day() == 1 && self.end.day() == self.days_in_month
    }
}

/// Split the inclusive range `[start, end]` at calendar-month boundaries.
/// An inverted range yields no segments.
pub fn month_segments(start: NaiveDate, end: NaiveDate) -> Vec<MonthSegment> {
    let mut segments = Vec::new();
    let mut cursor = start;
    while cursor <= end {
        let month_end = last_day_of_month(cursor);
        let seg_end = month_end.min(end);
        segments.push(MonthSegment {
            start: cursor,
            end: seg_end,
            days_in_month: month_end.day(),
        });
        let Some(next) = month_end.succ_opt() else {
            break;
        };
        cursor = next;
    }
    segments
}

/// Prorate a monthly amount over the inclusive period.
///
/// Each calendar-month segment contributes `covered / days_in_month` of the
/// monthly amount (`ActualDaysInMonth`) or `min(covered, 30) / 30` with full
/// months counting as a whole month (`ThirtyDayMonth`). The sum is rounded once.
pub fn prorate_rent(
    monthly_amount: Decimal,
    period_start: NaiveDate,
    period_end: NaiveDate,
    method: ProrationMethod,
) -> Result<Decimal, BillingError> {
    if period_end < period_start {
        return Err(BillingError::validation(format!(
            "period end {} is before period start {}",
            period_end, period_start
        )));
    }

    let thirty = Decimal::from(30);
    let mut total = Decimal::ZERO;
    for segment in month_segments(period_start, period_end) {
        let covered = Decimal::from(segment.covered_days());
        total += match method {
            ProrationMethod::ActualDaysInMonth => {
                monthly_amount * covered / Decimal::from(segment.days_in_month)
            }
            ProrationMethod::ThirtyDayMonth if segment.is_full_month() => monthly_amount,
            ProrationMethod::ThirtyDayMonth => monthly_amount * covered.min(thirty) / thirty,
        };
    }

    Ok(round_money(total))
}
