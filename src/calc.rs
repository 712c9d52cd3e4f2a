use chrono::{Duration, NaiveDate};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Cent precision for derived late fees; round half away from zero.
pub const MONEY_DP: u32 = 2;

pub fn round_money(x: Decimal) -> Decimal {
    x.round_dp_with_strategy(MONEY_DP, RoundingStrategy::MidpointAwayFromZero)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiscountKind {
    Percentage,
    Fixed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscountAdjustment {
    #[serde(rename = "type")]
    pub kind: DiscountKind,
    pub value: Decimal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtraCharge {
    pub amount: Decimal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LateFeePolicy {
    None,
    Fixed(Decimal),
    Percentage(Decimal),
}

impl LateFeePolicy {
    pub fn from_parts(kind: &str, value: Decimal) -> Result<Self, BillingError> {
        let policy = match kind {
            "none" => Self::None,
            "fixed" => Self::Fixed(value),
            "percentage" => Self::Percentage(value),
            other => {
                return Err(BillingError::Invalid(format!(
                    "unknown late fee type: {}",
                    other
                )))
            }
        };
        policy.validate()?;
        Ok(policy)
    }

    pub fn kind(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Fixed(_) => "fixed",
            Self::Percentage(_) => "percentage",
        }
    }

    pub fn value(self) -> Decimal {
        match self {
            Self::None => Decimal::ZERO,
            Self::Fixed(v) | Self::Percentage(v) => v,
        }
    }

    pub fn validate(self) -> Result<(), BillingError> {
        match self {
            Self::None => Ok(()),
            Self::Fixed(v) => non_negative("lateFeeValue", v),
            Self::Percentage(v) => {
                non_negative("lateFeeValue", v)?;
                if v > Decimal::ONE_HUNDRED {
                    return Err(BillingError::PercentageOutOfRange {
                        field: "lateFeeValue".to_string(),
                        value: v,
                    });
                }
                Ok(())
            }
        }
    }

    /// Late fee owed on `tuition` once a period becomes delayed.
    pub fn fee_for(self, tuition: Decimal) -> Result<Decimal, BillingError> {
        match self {
            Self::None => Ok(Decimal::ZERO),
            Self::Fixed(v) => Ok(v),
            Self::Percentage(p) => percent_of(tuition, p, "lateFeeValue").map(round_money),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Delayed,
    PartialPayment,
    Paid,
}

impl PaymentStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "delayed" => Some(Self::Delayed),
            "partial_payment" => Some(Self::PartialPayment),
            "paid" => Some(Self::Paid),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Delayed => "delayed",
            Self::PartialPayment => "partial_payment",
            Self::Paid => "paid",
        }
    }

    pub const ALL: [PaymentStatus; 4] = [
        Self::Pending,
        Self::Delayed,
        Self::PartialPayment,
        Self::Paid,
    ];
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum BillingError {
    #[error("{field} must not be negative (got {value})")]
    NegativeAmount { field: String, value: Decimal },

    #[error("{field}: percentage exceeds 100% (got {value})")]
    PercentageOutOfRange { field: String, value: Decimal },

    #[error("payment amount must be greater than zero")]
    NonPositivePayment,

    #[error("{0}")]
    Invalid(String),

    #[error("billing record is locked")]
    RecordLocked,

    #[error("billing record is already paid")]
    RecordPaid,

    #[error("{field}: amount out of range")]
    AmountOverflow { field: String },
}

impl BillingError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::NegativeAmount { .. }
            | Self::PercentageOutOfRange { .. }
            | Self::NonPositivePayment
            | Self::AmountOverflow { .. }
            | Self::Invalid(_) => "validation_failed",
            Self::RecordLocked => "record_locked",
            Self::RecordPaid => "record_paid",
        }
    }

    pub fn field(&self) -> Option<&str> {
        match self {
            Self::NegativeAmount { field, .. }
            | Self::PercentageOutOfRange { field, .. }
            | Self::AmountOverflow { field } => Some(field),
            _ => None,
        }
    }
}

fn non_negative(field: &str, value: Decimal) -> Result<(), BillingError> {
    if value < Decimal::ZERO {
        return Err(BillingError::NegativeAmount {
            field: field.to_string(),
            value,
        });
    }
    Ok(())
}

fn overflow(field: &str) -> BillingError {
    BillingError::AmountOverflow {
        field: field.to_string(),
    }
}

/// `base * pct / 100`, scaling the percentage first so large bases stay in range.
fn percent_of(base: Decimal, pct: Decimal, field: &str) -> Result<Decimal, BillingError> {
    pct.checked_div(Decimal::ONE_HUNDRED)
        .and_then(|rate| base.checked_mul(rate))
        .ok_or_else(|| overflow(field))
}

/// Sums `values`, failing instead of panicking when the total leaves `Decimal`'s range.
pub fn checked_total<I>(values: I, field: &str) -> Result<Decimal, BillingError>
where
    I: IntoIterator<Item = Decimal>,
{
    values.into_iter().try_fold(Decimal::ZERO, |acc, v| {
        acc.checked_add(v).ok_or_else(|| overflow(field))
    })
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CalcOptions {
    /// Floor `tuition - scholarship` at zero before applying percentage discounts.
    pub clamp_discount_base: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct BillingInputs<'a> {
    pub tuition: Decimal,
    pub scholarship: Decimal,
    pub discounts: &'a [DiscountAdjustment],
    pub extra_charges: &'a [ExtraCharge],
    pub late_fee: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BillingBreakdown {
    pub discount_base: Decimal,
    pub discount_total: Decimal,
    pub extra_total: Decimal,
    pub late_fee: Decimal,
    pub final_amount: Decimal,
}

pub fn validate_inputs(inputs: &BillingInputs<'_>) -> Result<(), BillingError> {
    non_negative("effectiveTuitionAmount", inputs.tuition)?;
    non_negative("scholarshipAmount", inputs.scholarship)?;
    non_negative("lateFeeAmount", inputs.late_fee)?;
    for (i, d) in inputs.discounts.iter().enumerate() {
        let field = format!("discountAdjustments[{}].value", i);
        non_negative(&field, d.value)?;
        if d.kind == DiscountKind::Percentage && d.value > Decimal::ONE_HUNDRED {
            return Err(BillingError::PercentageOutOfRange {
                field,
                value: d.value,
            });
        }
    }
    for (i, c) in inputs.extra_charges.iter().enumerate() {
        non_negative(&format!("extraCharges[{}].amount", i), c.amount)?;
    }
    Ok(())
}

/// Contribution of one discount line against `base` (tuition net of scholarship).
/// Percentage lines are exact; no rounding is applied.
pub fn discount_amount(
    discount: &DiscountAdjustment,
    base: Decimal,
) -> Result<Decimal, BillingError> {
    match discount.kind {
        DiscountKind::Fixed => Ok(discount.value),
        DiscountKind::Percentage => percent_of(base, discount.value, "discountAdjustments"),
    }
}

pub fn compute_breakdown(
    inputs: &BillingInputs<'_>,
    opts: CalcOptions,
) -> Result<BillingBreakdown, BillingError> {
    validate_inputs(inputs)?;

    // Both operands are non-negative, so the difference is always in range.
    let net = inputs.tuition - inputs.scholarship;
    let base = if opts.clamp_discount_base && net < Decimal::ZERO {
        Decimal::ZERO
    } else {
        net
    };

    let discount_lines = inputs
        .discounts
        .iter()
        .map(|d| discount_amount(d, base))
        .collect::<Result<Vec<_>, _>>()?;
    let discount_total = checked_total(discount_lines, "discountAdjustments")?;
    let extra_total = checked_total(inputs.extra_charges.iter().map(|c| c.amount), "extraCharges")?;

    let final_amount = net
        .checked_sub(discount_total)
        .and_then(|v| v.checked_add(extra_total))
        .and_then(|v| v.checked_add(inputs.late_fee))
        .ok_or_else(|| overflow("finalAmount"))?;

    Ok(BillingBreakdown {
        discount_base: base,
        discount_total,
        extra_total,
        late_fee: inputs.late_fee,
        final_amount,
    })
}

pub fn compute_final_amount(
    tuition: Decimal,
    scholarship: Decimal,
    discounts: &[DiscountAdjustment],
    extra_charges: &[ExtraCharge],
    late_fee: Decimal,
) -> Result<Decimal, BillingError> {
    let inputs = BillingInputs {
        tuition,
        scholarship,
        discounts,
        extra_charges,
        late_fee,
    };
    compute_breakdown(&inputs, CalcOptions::default()).map(|b| b.final_amount)
}

/// `finalAmount - paidAmount`; negative when the record carries a credit.
pub fn remaining_amount(
    final_amount: Decimal,
    paid: Option<Decimal>,
) -> Result<Decimal, BillingError> {
    final_amount
        .checked_sub(paid.unwrap_or(Decimal::ZERO))
        .ok_or_else(|| overflow("remainingAmount"))
}

/// Paid records are checked first: a paid record reports `RecordPaid` even when also locked.
pub fn ensure_editable(status: PaymentStatus, is_locked: bool) -> Result<(), BillingError> {
    if status == PaymentStatus::Paid {
        return Err(BillingError::RecordPaid);
    }
    if is_locked {
        return Err(BillingError::RecordLocked);
    }
    Ok(())
}

/// Status implied by the amounts on a record.
///
/// A record with nothing left to pay is `paid`, even when nothing was paid
/// because the final amount is zero or negative. Otherwise nothing paid keeps
/// the time-based status (`pending`/`delayed`) and any payment leaves it in
/// `partial_payment`.
pub fn settle_status(
    current: PaymentStatus,
    paid: Option<Decimal>,
    final_amount: Decimal,
) -> PaymentStatus {
    let paid = paid.unwrap_or(Decimal::ZERO);
    if paid >= final_amount {
        return PaymentStatus::Paid;
    }
    if paid <= Decimal::ZERO {
        return match current {
            PaymentStatus::Delayed => PaymentStatus::Delayed,
            _ => PaymentStatus::Pending,
        };
    }
    PaymentStatus::PartialPayment
}

/// Applies a payment and returns the new cumulative paid amount and status.
pub fn apply_payment(
    current: PaymentStatus,
    paid: Option<Decimal>,
    final_amount: Decimal,
    amount: Decimal,
) -> Result<(Decimal, PaymentStatus), BillingError> {
    if current == PaymentStatus::Paid {
        return Err(BillingError::RecordPaid);
    }
    if amount <= Decimal::ZERO {
        return Err(BillingError::NonPositivePayment);
    }
    let new_paid = paid
        .unwrap_or(Decimal::ZERO)
        .checked_add(amount)
        .ok_or_else(|| overflow("amount"))?;
    Ok((new_paid, settle_status(current, Some(new_paid), final_amount)))
}

pub fn due_date(year: i32, month: u32, due_day: u32) -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt(year, month, due_day)
}

/// A pending period becomes delayed the day after `due + grace_days`.
pub fn is_overdue(due: NaiveDate, grace_days: i64, as_of: NaiveDate) -> bool {
    as_of > due + Duration::days(grace_days)
}
