use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde_json::Value;

use crate::error::{AppError, AppResult, ReconciliationError};
use crate::ledger::models::{max_money, FieldChange, SaleRecord, MONEY_SCALE};

const TIER_PREFIX: &str = "price_breakdown.";

/// A single editable sale field with its new value.
///
/// Tier fields are addressed as `price_breakdown.<tier_id>.<field>`; the rest
/// by their plain column name.
#[derive(Debug, Clone, PartialEq)]
pub enum SaleCorrection {
    BagCount { tier_id: String, bag_count: i32 },
    UnitPrice { tier_id: String, unit_price: Decimal },
    Label { tier_id: String, label: String },
    Category(String),
    Date(NaiveDate),
}

impl SaleCorrection {
    pub fn parse(field: &str, value: &Value) -> AppResult<Self> {
        let field = field.trim();

        if let Some(rest) = field.strip_prefix(TIER_PREFIX) {
            let (tier_id, tier_field) = rest.rsplit_once('.').ok_or_else(|| {
                AppError::InvalidInput(format!(
                    "tier field must look like {}<tier_id>.<field>, got {}",
                    TIER_PREFIX, field
                ))
            })?;
            if tier_id.is_empty() {
                return Err(AppError::InvalidInput("tier id is empty".to_string()));
            }
            let tier_id = tier_id.to_string();

            return match tier_field {
                "bag_count" => {
                    let bag_count = value
                        .as_i64()
                        .and_then(|n| i32::try_from(n).ok())
                        .ok_or_else(|| invalid(field, value))?;
                    if bag_count < 0 {
                        return Err(AppError::InvalidInput(format!(
                            "{} cannot be negative",
                            field
                        )));
                    }
                    Ok(SaleCorrection::BagCount { tier_id, bag_count })
                }
                "unit_price" => {
                    let unit_price = parse_decimal(value).ok_or_else(|| invalid(field, value))?;
                    if unit_price < Decimal::ZERO {
                        return Err(AppError::InvalidInput(format!(
                            "{} cannot be negative",
                            field
                        )));
                    }
                    if unit_price.normalize().scale() > MONEY_SCALE {
                        return Err(AppError::InvalidInput(format!(
                            "{} allows at most {} decimal places",
                            field, MONEY_SCALE
                        )));
                    }
                    if unit_price > max_money() {
                        return Err(AppError::InvalidInput(format!("{} is too large", field)));
                    }
                    Ok(SaleCorrection::UnitPrice { tier_id, unit_price })
                }
                "label" => {
                    let label = value.as_str().ok_or_else(|| invalid(field, value))?;
                    Ok(SaleCorrection::Label {
                        tier_id,
                        label: label.to_string(),
                    })
                }
                other => Err(AppError::InvalidInput(format!(
                    "price tier field {} cannot be corrected",
                    other
                ))),
            };
        }

        match field {
            "category" => {
                let category = value
                    .as_str()
                    .map(str::trim)
                    .filter(|c| !c.is_empty())
                    .ok_or_else(|| invalid(field, value))?;
                Ok(SaleCorrection::Category(category.to_string()))
            }
            "date" => {
                let date = value
                    .as_str()
                    .and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok())
                    .ok_or_else(|| invalid(field, value))?;
                Ok(SaleCorrection::Date(date))
            }
            other => Err(AppError::InvalidInput(format!(
                "sale field {} cannot be corrected",
                other
            ))),
        }
    }

    pub fn field_name(&self) -> String {
        match self {
            SaleCorrection::BagCount { tier_id, .. } => format!("{}{}.bag_count", TIER_PREFIX, tier_id),
            SaleCorrection::UnitPrice { tier_id, .. } => format!("{}{}.unit_price", TIER_PREFIX, tier_id),
            SaleCorrection::Label { tier_id, .. } => format!("{}{}.label", TIER_PREFIX, tier_id),
            SaleCorrection::Category(_) => "category".to_string(),
            SaleCorrection::Date(_) => "date".to_string(),
        }
    }

    /// Apply to `target` and return every field that changed, derived totals
    /// included. Nothing is touched when the tier does not exist or the new
    /// totals are out of range.
    pub fn apply(&self, target: &mut SaleRecord) -> AppResult<Vec<FieldChange>> {
        let field = self.field_name();
        let mut sale = target.clone();
        let (old_bags, old_expected) = (sale.total_bags, sale.expected_amount);
        let sale_id = sale.id;
        let missing_tier = |tier_id: &str| -> AppError {
            ReconciliationError::NotFound(format!("price tier {} on sale {}", tier_id, sale_id)).into()
        };

        let mut changes = Vec::new();
        match self {
            SaleCorrection::BagCount { tier_id, bag_count } => {
                let tier = sale.tier_mut(tier_id).ok_or_else(|| missing_tier(tier_id.as_str()))?;
                changes.push(FieldChange::new(field, tier.bag_count, bag_count));
                tier.bag_count = *bag_count;
            }
            SaleCorrection::UnitPrice { tier_id, unit_price } => {
                let tier = sale.tier_mut(tier_id).ok_or_else(|| missing_tier(tier_id.as_str()))?;
                changes.push(FieldChange::new(field, tier.unit_price, unit_price));
                tier.unit_price = *unit_price;
            }
            SaleCorrection::Label { tier_id, label } => {
                let tier = sale.tier_mut(tier_id).ok_or_else(|| missing_tier(tier_id.as_str()))?;
                changes.push(FieldChange::new(field, &tier.label, label));
                tier.label = label.clone();
            }
            SaleCorrection::Category(category) => {
                changes.push(FieldChange::new(field, &sale.category, category));
                sale.category = category.clone();
            }
            SaleCorrection::Date(date) => {
                changes.push(FieldChange::new(field, sale.date, date));
                sale.date = *date;
            }
        }

        sale.recompute_totals()?;
        if sale.total_bags != old_bags {
            changes.push(FieldChange::new("total_bags", old_bags, sale.total_bags));
        }
        if sale.expected_amount != old_expected {
            changes.push(FieldChange::new("expected_amount", old_expected, sale.expected_amount));
        }

        *target = sale;
        Ok(changes)
    }
}

fn parse_decimal(value: &Value) -> Option<Decimal> {
    match value {
        Value::String(s) => s.trim().parse().ok(),
        Value::Number(n) => n.to_string().parse().ok(),
        _ => None,
    }
}

fn invalid(field: &str, value: &Value) -> AppError {
    AppError::InvalidInput(format!("invalid value {} for {}", value, field))
}
