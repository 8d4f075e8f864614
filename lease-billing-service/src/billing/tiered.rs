//! Tiered (slab) utility pricing.

use super::proration::round_money;
use crate::error::BillingError;
use crate::models::UtilityRateSlab;
use rust_decimal::Decimal;

/// Check that slabs start at 0 or 1, are contiguous and ordered, that only
/// the last slab is unbounded and that no rate or fixed charge is negative.
pub fn validate_slabs(slabs: &[UtilityRateSlab]) -> Result<(), BillingError> {
    let Some(first) = slabs.first() else {
        return Err(BillingError::validation("rate plan has no slabs"));
    };
    if first.from_units != Decimal::ZERO && first.from_units != Decimal::ONE {
        return Err(BillingError::validation(format!(
            "first slab starts at {} units, expected 0 or 1",
            first.from_units
        )));
    }

    for (i, slab) in slabs.iter().enumerate() {
        if slab.rate_per_unit < Decimal::ZERO {
            return Err(BillingError::validation(format!(
                "slab {} has a negative rate",
                slab.slab_order
            )));
        }
        if slab.fixed_charge.is_some_and(|f| f < Decimal::ZERO) {
            return Err(BillingError::validation(format!(
                "slab {} has a negative fixed charge",
                slab.slab_order
            )));
        }

        let next = slabs.get(i + 1);
        match (slab.to_units, next) {
            (Some(to), _) if to < slab.from_units => {
                return Err(BillingError::validation(format!(
                    "slab {} ends before it starts",
                    slab.slab_order
                )));
            }
            (Some(to), Some(next)) if to + Decimal::ONE != next.from_units => {
                return Err(BillingError::validation(format!(
                    "slab {} is not contiguous with slab {}",
                    slab.slab_order, next.slab_order
                )));
            }
            (Some(_), Some(next)) if next.slab_order <= slab.slab_order => {
                return Err(BillingError::validation("slabs are not ordered"));
            }
            (None, Some(_)) => {
                return Err(BillingError::validation(
                    "only the last slab may be unbounded",
                ));
            }
            _ => {}
        }
    }

    Ok(())
}

/// Price `units_consumed` through the slabs.
///
/// Units are counted from 1, so a slab `0..=100` or `1..=100` holds the first 100 units
/// and `101..=200` the next 100. A slab's fixed charge is added once when it
/// receives any units. Non-positive consumption costs nothing.
pub fn compute_tiered_utility_amount(
    units_consumed: Decimal,
    slabs: &[UtilityRateSlab],
) -> Result<Decimal, BillingError> {
    let mut ordered = slabs.to_vec();
    ordered.sort_by_key(|s| s.slab_order);
    validate_slabs(&ordered)?;

    if units_consumed <= Decimal::ZERO {
        return Ok(Decimal::ZERO);
    }

    let mut remaining = units_consumed;
    let mut amount = Decimal::ZERO;
    for slab in &ordered {
        if remaining <= Decimal::ZERO {
            break;
        }
        let allocated = match slab.to_units {
            Some(to) => {
                let capacity = to - slab.from_units.max(Decimal::ONE) + Decimal::ONE;
                remaining.min(capacity.max(Decimal::ZERO))
            }
            None => remaining,
        };
        if allocated <= Decimal::ZERO {
            continue;
        }
        amount += allocated * slab.rate_per_unit + slab.fixed_charge.unwrap_or(Decimal::ZERO);
        remaining -= allocated;
    }

    Ok(round_money(amount))
}
