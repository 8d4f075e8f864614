//! Invoice line assembly for one lease and billing period.
//!
//! Everything here is pure: the caller loads a [`BillingContext`] snapshot and
//! persists the result.

use super::proration::{prorate_rent, round_money};
use crate::error::BillingError;
use crate::models::{
    ChargeFrequency, ChargeType, Lease, LeaseRecurringCharge, LeaseTerm, LineSource,
    ProrationMethod, RecordState, UtilityStatement, UtilityType,
};
use chrono::{Months, NaiveDate};
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

/// Inputs to line building for one lease.
#[derive(Debug, Clone)]
pub struct BillingContext {
    pub lease: Lease,
    pub terms: Vec<LeaseTerm>,
    pub proration_method: ProrationMethod,
    pub recurring_charges: Vec<LeaseRecurringCharge>,
    /// Charge types referenced by the recurring charges, by id.
    pub charge_types: HashMap<Uuid, ChargeType>,
    pub rent_charge_type: Option<ChargeType>,
    pub utility_charge_types: HashMap<UtilityType, ChargeType>,
    /// Final statements not invoiced elsewhere.
    pub statements: Vec<UtilityStatement>,
    /// Recurring charges already billed on another non-voided invoice.
    pub billed_elsewhere: HashSet<Uuid>,
}

/// A computed line before it is attached to an invoice.
#[derive(Debug, Clone, PartialEq)]
pub struct DraftLine {
    pub line_number: i32,
    pub description: String,
    pub source: LineSource,
    pub source_ref_id: Option<Uuid>,
    pub charge_type_id: Option<Uuid>,
    pub quantity: Decimal,
    pub unit_price: Decimal,
    pub amount: Decimal,
    pub tax_rate: Decimal,
    pub tax_amount: Decimal,
    pub total_amount: Decimal,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BuiltLines {
    pub lines: Vec<DraftLine>,
    pub sub_total: Decimal,
    pub tax_amount: Decimal,
    pub total_amount: Decimal,
}

struct LineSpec {
    description: String,
    source: LineSource,
    source_ref_id: Uuid,
    charge_type: Option<ChargeType>,
    amount: Decimal,
}

/// Build rent, recurring-charge and utility lines, in that order.
pub fn build_lines(
    ctx: &BillingContext,
    period_start: NaiveDate,
    period_end: NaiveDate,
) -> Result<BuiltLines, BillingError> {
    if period_end < period_start {
        return Err(BillingError::validation(format!(
            "period end {} is before period start {}",
            period_end, period_start
        )));
    }

    let mut specs = rent_lines(ctx, period_start, period_end)?;
    specs.extend(recurring_lines(ctx, period_start, period_end)?);
    specs.extend(utility_lines(ctx, period_start, period_end));

    let mut lines = Vec::with_capacity(specs.len());
    for (i, spec) in specs.into_iter().enumerate() {
        let tax_rate = spec
            .charge_type
            .as_ref()
            .map_or(Decimal::ZERO, ChargeType::effective_tax_rate);
        let amount = round_money(spec.amount);
        let tax_amount = round_money(amount * tax_rate);
        lines.push(DraftLine {
            line_number: i as i32 + 1,
            description: spec.description,
            source: spec.source,
            source_ref_id: Some(spec.source_ref_id),
            charge_type_id: spec.charge_type.map(|c| c.charge_type_id),
            quantity: Decimal::ONE,
            unit_price: amount,
            amount,
            tax_rate,
            tax_amount,
            total_amount: amount + tax_amount,
        });
    }

    let sub_total: Decimal = lines.iter().map(|l| l.amount).sum();
    let tax_amount: Decimal = lines.iter().map(|l| l.tax_amount).sum();

    Ok(BuiltLines {
        lines,
        sub_total,
        tax_amount,
        total_amount: sub_total + tax_amount,
    })
}

fn rent_lines(
    ctx: &BillingContext,
    period_start: NaiveDate,
    period_end: NaiveDate,
) -> Result<Vec<LineSpec>, BillingError> {
    let mut terms: Vec<&LeaseTerm> = ctx.terms.iter().collect();
    terms.sort_by_key(|t| (t.start_date, t.term_id));

    let mut specs = Vec::new();
    for term in terms {
        let start = term
            .start_date
            .max(ctx.lease.start_date)
            .max(period_start);
        let end = [term.end_date, ctx.lease.end_date, Some(period_end)]
            .into_iter()
            .flatten()
            .min()
            .unwrap_or(period_end);
        if start > end {
            continue;
        }

        let amount = prorate_rent(term.monthly_rent, start, end, ctx.proration_method)?;
        let description = if start == period_start && end == period_end {
            format!("Rent {} to {}", start, end)
        } else {
            format!("Rent {} to {} (prorated)", start, end)
        };
        specs.push(LineSpec {
            description,
            source: LineSource::Rent,
            source_ref_id: term.term_id,
            charge_type: ctx.rent_charge_type.clone(),
            amount,
        });
    }
    Ok(specs)
}

/// Whether an anniversary of the charge start falls in the period and
/// inside the charge's effective range.
fn has_anniversary_in(
    charge: &LeaseRecurringCharge,
    interval_months: u32,
    period_start: NaiveDate,
    period_end: NaiveDate,
) -> bool {
    let last_effective = charge.end_date.map_or(period_end, |e| e.min(period_end));
    let mut k: u32 = 0;
    while let Some(anniversary) = charge
        .start_date
        .checked_add_months(Months::new(k * interval_months))
    {
        if anniversary > last_effective {
            return false;
        }
        if anniversary >= period_start {
            return true;
        }
        k += 1;
    }
    false
}

fn recurring_lines(
    ctx: &BillingContext,
    period_start: NaiveDate,
    period_end: NaiveDate,
) -> Result<Vec<LineSpec>, BillingError> {
    let mut charges: Vec<&LeaseRecurringCharge> = ctx
        .recurring_charges
        .iter()
        .filter(|c| c.state == RecordState::Active && c.intersects(period_start, period_end))
        .collect();
    charges.sort_by_key(|c| (c.start_date, c.charge_id));

    let mut specs = Vec::new();
    for charge in charges {
        let due = match charge.frequency {
            ChargeFrequency::Monthly => true,
            ChargeFrequency::OneTime => {
                charge.start_date >= period_start
                    && charge.start_date <= period_end
                    && !ctx.billed_elsewhere.contains(&charge.charge_id)
            }
            ChargeFrequency::Quarterly | ChargeFrequency::Yearly => charge
                .frequency
                .interval_months()
                .is_some_and(|m| has_anniversary_in(charge, m, period_start, period_end)),
        };
        if !due {
            continue;
        }

        let charge_type = ctx
            .charge_types
            .get(&charge.charge_type_id)
            .cloned()
            .ok_or_else(|| BillingError::not_found("charge_type", charge.charge_type_id))?;
        specs.push(LineSpec {
            description: charge.description.clone(),
            source: LineSource::RecurringCharge,
            source_ref_id: charge.charge_id,
            charge_type: Some(charge_type),
            amount: charge.amount,
        });
    }
    Ok(specs)
}

fn utility_lines(
    ctx: &BillingContext,
    period_start: NaiveDate,
    period_end: NaiveDate,
) -> Vec<LineSpec> {
    let mut statements: Vec<&UtilityStatement> = ctx
        .statements
        .iter()
        .filter(|s| {
            s.is_final
                && s.state == RecordState::Active
                && s.period_start >= period_start
                && s.period_end <= period_end
        })
        .collect();
    statements.sort_by_key(|s| (s.utility_type, s.period_start, s.statement_id));

    statements
        .into_iter()
        .map(|s| {
            let description = match s.units_consumed {
                Some(units) => format!(
                    "{} {} to {} ({} units)",
                    s.utility_type.label(),
                    s.period_start,
                    s.period_end,
                    units.normalize()
                ),
                None => format!(
                    "{} {} to {}",
                    s.utility_type.label(),
                    s.period_start,
                    s.period_end
                ),
            };
            LineSpec {
                description,
                source: LineSource::Utility,
                source_ref_id: s.statement_id,
                charge_type: ctx.utility_charge_types.get(&s.utility_type).cloned(),
                amount: s.amount,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::LeaseStatus;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn charge_type(code: &str, taxable: bool, rate: Decimal) -> ChargeType {
        ChargeType {
            charge_type_id: Uuid::new_v4(),
            org_id: None,
            code: code.to_string(),
            name: code.to_string(),
            is_taxable: taxable,
            tax_rate: rate,
            default_amount: Decimal::ZERO,
            state: RecordState::Active,
            created_utc: Utc::now(),
        }
    }

    fn context(lease_start: NaiveDate, rent: Decimal) -> BillingContext {
        let lease = Lease {
            lease_id: Uuid::new_v4(),
            org_id: Uuid::new_v4(),
            unit_id: Uuid::new_v4(),
            status: LeaseStatus::Active,
            start_date: lease_start,
            end_date: None,
            version: 1,
            created_utc: Utc::now(),
        };
        let term = LeaseTerm {
            term_id: Uuid::new_v4(),
            lease_id: lease.lease_id,
            monthly_rent: rent,
            start_date: lease_start,
            end_date: None,
            created_utc: Utc::now(),
        };
        BillingContext {
            lease,
            terms: vec![term],
            proration_method: ProrationMethod::ActualDaysInMonth,
            recurring_charges: vec![],
            charge_types: HashMap::new(),
            rent_charge_type: None,
            utility_charge_types: HashMap::new(),
            statements: vec![],
            billed_elsewhere: HashSet::new(),
        }
    }

    fn recurring(
        ctx: &mut BillingContext,
        ct: &ChargeType,
        amount: Decimal,
        frequency: ChargeFrequency,
        start: NaiveDate,
    ) -> Uuid {
        let charge = LeaseRecurringCharge {
            charge_id: Uuid::new_v4(),
            org_id: ctx.lease.org_id,
            lease_id: ctx.lease.lease_id,
            charge_type_id: ct.charge_type_id,
            description: format!("{:?} charge", frequency),
            amount,
            frequency,
            start_date: start,
            end_date: None,
            state: RecordState::Active,
            version: 1,
            created_utc: Utc::now(),
            updated_utc: Utc::now(),
        };
        ctx.charge_types.insert(ct.charge_type_id, ct.clone());
        let id = charge.charge_id;
        ctx.recurring_charges.push(charge);
        id
    }

    #[test]
    fn test_rent_is_clipped_to_lease_start() {
        let ctx = context(date(2024, 4, 16), dec!(1200));
        let built = build_lines(&ctx, date(2024, 4, 1), date(2024, 4, 30)).unwrap();
        assert_eq!(built.lines.len(), 1);
        assert_eq!(built.lines[0].amount, dec!(600.00));
        assert!(built.lines[0].description.contains("prorated"));
    }

    #[test]
    fn test_rent_change_mid_period_yields_two_lines() {
        let mut ctx = context(date(2023, 1, 1), dec!(1000));
        ctx.terms[0].end_date = Some(date(2024, 6, 15));
        ctx.terms.push(LeaseTerm {
            term_id: Uuid::new_v4(),
            lease_id: ctx.lease.lease_id,
            monthly_rent: dec!(1200),
            start_date: date(2024, 6, 16),
            end_date: None,
            created_utc: Utc::now(),
        });

        let built = build_lines(&ctx, date(2024, 6, 1), date(2024, 6, 30)).unwrap();
        assert_eq!(built.lines.len(), 2);
        assert_eq!(built.lines[0].amount, dec!(500.00));
        assert_eq!(built.lines[1].amount, dec!(600.00));
        assert_eq!(built.sub_total, dec!(1100.00));
    }

    #[test]
    fn test_taxable_charge_and_ordering() {
        let mut ctx = context(date(2024, 1, 1), dec!(1000));
        ctx.rent_charge_type = Some(charge_type("RENT", false, Decimal::ZERO));
        let parking = charge_type("PARKING", true, dec!(0.05));
        recurring(&mut ctx, &parking, dec!(50), ChargeFrequency::Monthly, date(2024, 1, 1));

        let built = build_lines(&ctx, date(2024, 3, 1), date(2024, 3, 31)).unwrap();
        assert_eq!(built.lines.len(), 2);
        assert_eq!(built.lines[0].source, LineSource::Rent);
        assert_eq!(built.lines[0].tax_amount, Decimal::ZERO);
        assert_eq!(built.lines[1].line_number, 2);
        assert_eq!(built.lines[1].tax_amount, dec!(2.50));
        assert_eq!(built.tax_amount, dec!(2.50));
        assert_eq!(built.total_amount, dec!(1052.50));
    }

    #[test]
    fn test_quarterly_charge_bills_on_anniversary_months() {
        let mut ctx = context(date(2024, 1, 1), dec!(1000));
        let maintenance = charge_type("MAINT", false, Decimal::ZERO);
        recurring(
            &mut ctx,
            &maintenance,
            dec!(90),
            ChargeFrequency::Quarterly,
            date(2024, 1, 10),
        );

        let billed_in = |m: u32| {
            let start = date(2024, m, 1);
            let end = super::super::proration::last_day_of_month(start);
            build_lines(&ctx, start, end).unwrap().lines.len() == 2
        };
        assert!(billed_in(1));
        assert!(!billed_in(2));
        assert!(!billed_in(3));
        assert!(billed_in(4));
        assert!(billed_in(7));
    }

    #[test]
    fn test_one_time_charge_bills_once() {
        let mut ctx = context(date(2024, 1, 1), dec!(1000));
        let deposit_fee = charge_type("KEYS", false, Decimal::ZERO);
        let id = recurring(
            &mut ctx,
            &deposit_fee,
            dec!(25),
            ChargeFrequency::OneTime,
            date(2024, 2, 5),
        );

        let jan = build_lines(&ctx, date(2024, 1, 1), date(2024, 1, 31)).unwrap();
        assert_eq!(jan.lines.len(), 1);
        let feb = build_lines(&ctx, date(2024, 2, 1), date(2024, 2, 29)).unwrap();
        assert_eq!(feb.lines.len(), 2);

        ctx.billed_elsewhere.insert(id);
        let feb_again = build_lines(&ctx, date(2024, 2, 1), date(2024, 2, 29)).unwrap();
        assert_eq!(feb_again.lines.len(), 1);
    }

    #[test]
    fn test_missing_recurring_charge_type_is_not_found() {
        let mut ctx = context(date(2024, 1, 1), dec!(1000));
        let ghost = charge_type("GHOST", false, Decimal::ZERO);
        recurring(&mut ctx, &ghost, dec!(10), ChargeFrequency::Monthly, date(2024, 1, 1));
        ctx.charge_types.clear();

        let err = build_lines(&ctx, date(2024, 1, 1), date(2024, 1, 31)).unwrap_err();
        assert!(matches!(err, BillingError::NotFound { .. }));
    }

    #[test]
    fn test_utility_lines_follow_charges_in_type_order() {
        let mut ctx = context(date(2024, 1, 1), dec!(1000));
        let now = Utc::now();
        for (utility_type, amount) in [(UtilityType::Water, dec!(12.40)), (UtilityType::Electricity, dec!(35))] {
            ctx.statements.push(UtilityStatement {
                statement_id: Uuid::new_v4(),
                org_id: ctx.lease.org_id,
                lease_id: ctx.lease.lease_id,
                utility_type,
                period_start: date(2024, 3, 1),
                period_end: date(2024, 3, 31),
                statement_version: 1,
                is_final: true,
                rate_plan_id: None,
                previous_reading: None,
                current_reading: None,
                units_consumed: None,
                amount,
                invoice_id: None,
                invoice_line_id: None,
                state: RecordState::Active,
                version: 1,
                created_utc: now,
                updated_utc: now,
            });
        }
        ctx.utility_charge_types.insert(
            UtilityType::Electricity,
            charge_type("UTILITY_ELECTRICITY", true, dec!(0.10)),
        );

        let built = build_lines(&ctx, date(2024, 3, 1), date(2024, 3, 31)).unwrap();
        assert_eq!(built.lines.len(), 3);
        assert_eq!(built.lines[1].source, LineSource::Utility);
        assert!(built.lines[1].description.starts_with("Electricity"));
        assert_eq!(built.lines[1].tax_amount, dec!(3.50));
        assert!(built.lines[2].description.starts_with("Water"));
        assert_eq!(built.lines[2].tax_amount, Decimal::ZERO);
    }

    #[test]
    fn test_regeneration_is_deterministic() {
        let mut ctx = context(date(2024, 1, 1), dec!(1000));
        let parking = charge_type("PARKING", true, dec!(0.05));
        recurring(&mut ctx, &parking, dec!(50), ChargeFrequency::Monthly, date(2024, 1, 1));

        let first = build_lines(&ctx, date(2024, 3, 1), date(2024, 3, 31)).unwrap();
        let second = build_lines(&ctx, date(2024, 3, 1), date(2024, 3, 31)).unwrap();
        assert_eq!(first, second);
    }
}
