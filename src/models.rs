//! Row types for the desk tables and the payloads exchanged with the
//! frontend. Serialized shapes use the snake_case column names the React
//! dashboard already reads from Supabase.

use rusqlite::types::Type;
use rusqlite::Row;
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{DeskError, DeskResult};

// ---------------------------------------------------------------------------
// Clients
// ---------------------------------------------------------------------------

/// Column list matching `Client::from_row`.
pub const CLIENT_COLUMNS: &str =
    "id, client_code, barcode, full_name, phone, email, active, is_active, created_at, updated_at";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Client {
    pub id: String,
    pub client_code: String,
    pub barcode: String,
    pub full_name: String,
    pub phone: Option<String>,
    pub email: Option<String>,
    /// Currently on premises.
    pub active: bool,
    /// Not soft-deleted.
    pub is_active: bool,
    pub created_at: String,
    pub updated_at: String,
}

impl Client {
    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            client_code: row.get(1)?,
            barcode: row.get(2)?,
            full_name: row.get(3)?,
            phone: row.get(4)?,
            email: row.get(5)?,
            active: row.get(6)?,
            is_active: row.get(7)?,
            created_at: row.get(8)?,
            updated_at: row.get(9)?,
        })
    }

    pub fn checkin_state(&self) -> CheckInState {
        CheckInState::from_active(self.active)
    }
}

/// Presence of a client at the space. Persisted as the `clients.active`
/// boolean; every valid scan moves it to the other variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckInState {
    CheckedIn,
    CheckedOut,
}

impl CheckInState {
    pub fn from_active(active: bool) -> Self {
        if active {
            CheckInState::CheckedIn
        } else {
            CheckInState::CheckedOut
        }
    }

    pub fn is_active(self) -> bool {
        matches!(self, CheckInState::CheckedIn)
    }

    pub fn toggled(self) -> Self {
        match self {
            CheckInState::CheckedIn => CheckInState::CheckedOut,
            CheckInState::CheckedOut => CheckInState::CheckedIn,
        }
    }

    /// Label reported back to the scanner UI and written to the audit log.
    pub fn as_str(self) -> &'static str {
        match self {
            CheckInState::CheckedIn => "checked_in",
            CheckInState::CheckedOut => "checked_out",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckInRecord {
    pub id: String,
    pub client_id: String,
    pub status: CheckInState,
    pub checked_in_at: String,
    pub checked_out_at: Option<String>,
}

impl CheckInRecord {
    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let status: String = row.get(2)?;
        Ok(Self {
            id: row.get(0)?,
            client_id: row.get(1)?,
            status: if status == "checked_in" {
                CheckInState::CheckedIn
            } else {
                CheckInState::CheckedOut
            },
            checked_in_at: row.get(3)?,
            checked_out_at: row.get(4)?,
        })
    }
}

// ---------------------------------------------------------------------------
// Session line items
// ---------------------------------------------------------------------------

pub const LINE_ITEM_COLUMNS: &str =
    "id, user_id, item_name, quantity, price, status, created_at, updated_at";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineItemStatus {
    Pending,
    Preparing,
    Completed,
    Served,
    Cancelled,
}

impl LineItemStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            LineItemStatus::Pending => "pending",
            LineItemStatus::Preparing => "preparing",
            LineItemStatus::Completed => "completed",
            LineItemStatus::Served => "served",
            LineItemStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(raw: &str) -> DeskResult<Self> {
        match raw.trim() {
            "pending" => Ok(LineItemStatus::Pending),
            "preparing" => Ok(LineItemStatus::Preparing),
            "completed" => Ok(LineItemStatus::Completed),
            "served" => Ok(LineItemStatus::Served),
            "cancelled" => Ok(LineItemStatus::Cancelled),
            other => Err(DeskError::validation(format!(
                "Invalid line item status: {other}"
            ))),
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, LineItemStatus::Completed | LineItemStatus::Cancelled)
    }

    /// Kitchen/bar flow: pending -> preparing -> served -> completed, with
    /// cancellation allowed from any non-terminal state.
    pub fn can_transition_to(self, next: LineItemStatus) -> bool {
        use LineItemStatus::*;
        match (self, next) {
            (from, Cancelled) => !from.is_terminal(),
            (Pending, Preparing) | (Preparing, Served) => true,
            (Pending | Preparing | Served, Completed) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionLineItem {
    pub id: String,
    pub user_id: String,
    pub item_name: String,
    pub quantity: i64,
    pub price: f64,
    pub status: LineItemStatus,
    pub created_at: String,
    pub updated_at: String,
}

impl SessionLineItem {
    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let status: String = row.get(5)?;
        Ok(Self {
            id: row.get(0)?,
            user_id: row.get(1)?,
            item_name: row.get(2)?,
            quantity: row.get(3)?,
            price: row.get(4)?,
            status: LineItemStatus::parse(&status).map_err(|e| conversion_error(5, e))?,
            created_at: row.get(6)?,
            updated_at: row.get(7)?,
        })
    }
}

// ---------------------------------------------------------------------------
// Cart / payments / receipts
// ---------------------------------------------------------------------------

/// One entry of the POS cart as sent by the frontend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CartItem {
    /// Product or service id; for `category == "product"` it keys the
    /// ingredient recipe.
    pub id: String,
    pub name: String,
    pub quantity: i64,
    pub price: f64,
    #[serde(default)]
    pub category: Option<String>,
}

impl CartItem {
    pub fn is_product(&self) -> bool {
        self.category.as_deref() == Some("product")
    }

    pub fn total(&self) -> f64 {
        round_cents(self.price * self.quantity as f64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Cash,
    Card,
    Other,
}

impl PaymentMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            PaymentMethod::Cash => "cash",
            PaymentMethod::Card => "card",
            PaymentMethod::Other => "other",
        }
    }

    pub fn parse(raw: &str) -> DeskResult<Self> {
        match raw.trim() {
            "cash" => Ok(PaymentMethod::Cash),
            "card" => Ok(PaymentMethod::Card),
            "other" => Ok(PaymentMethod::Other),
            other => Err(DeskError::validation(format!(
                "Invalid method: {other}. Must be cash, card, or other"
            ))),
        }
    }
}

/// Receipt snapshot line as persisted in `receipts.line_items`. Older
/// snapshots may omit `total` or carry a fractional `quantity`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceiptLine {
    #[serde(alias = "item_name")]
    pub name: String,
    #[serde(deserialize_with = "whole_quantity")]
    pub quantity: i64,
    pub price: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product_id: Option<String>,
}

impl ReceiptLine {
    pub fn line_total(&self) -> f64 {
        self.total
            .unwrap_or_else(|| round_cents(self.price * self.quantity as f64))
    }
}

fn whole_quantity<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
    let raw = f64::deserialize(deserializer)?;
    if !raw.is_finite() || raw < 0.0 {
        return Err(serde::de::Error::custom(format!("invalid quantity {raw}")));
    }
    Ok(raw.round() as i64)
}

impl From<&CartItem> for ReceiptLine {
    fn from(item: &CartItem) -> Self {
        Self {
            name: item.name.clone(),
            quantity: item.quantity,
            price: item.price,
            total: Some(item.total()),
            category: item.category.clone(),
            product_id: Some(item.id.clone()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiptStatus {
    Active,
    Cancelled,
}

pub const RECEIPT_COLUMNS: &str = "id, receipt_number, user_id, line_items, subtotal, discount,
     total_amount, payment_method, status, cancelled_at, cancelled_by,
     cancellation_reason, created_at";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Receipt {
    pub id: String,
    pub receipt_number: String,
    pub user_id: String,
    pub line_items: Vec<ReceiptLine>,
    pub subtotal: f64,
    pub discount: f64,
    pub total_amount: f64,
    pub payment_method: String,
    pub status: ReceiptStatus,
    pub cancelled_at: Option<String>,
    pub cancelled_by: Option<String>,
    pub cancellation_reason: Option<String>,
    pub created_at: String,
}

impl Receipt {
    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let raw_items: String = row.get(3)?;
        let line_items = serde_json::from_str(&raw_items).map_err(|e| conversion_error(3, e))?;
        let status: String = row.get(8)?;
        let status = match status.as_str() {
            "active" => ReceiptStatus::Active,
            "cancelled" => ReceiptStatus::Cancelled,
            other => {
                return Err(conversion_error(
                    8,
                    DeskError::validation(format!("Invalid receipt status: {other}")),
                ))
            }
        };
        Ok(Self {
            id: row.get(0)?,
            receipt_number: row.get(1)?,
            user_id: row.get(2)?,
            line_items,
            subtotal: row.get(4)?,
            discount: row.get(5)?,
            total_amount: row.get(6)?,
            payment_method: row.get(7)?,
            status,
            cancelled_at: row.get(9)?,
            cancelled_by: row.get(10)?,
            cancellation_reason: row.get(11)?,
            created_at: row.get(12)?,
        })
    }
}

// ---------------------------------------------------------------------------
// Stock
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StockItem {
    pub id: String,
    pub name: String,
    pub current_quantity: f64,
    pub min_quantity: f64,
    pub cost_per_unit: f64,
}

impl StockItem {
    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            current_quantity: row.get(2)?,
            min_quantity: row.get(3)?,
            cost_per_unit: row.get(4)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductIngredient {
    pub product_id: String,
    pub stock_id: String,
    pub quantity_needed: f64,
}

/// Round a monetary amount to two decimals.
/// Text column that does not decode into its domain type.
fn conversion_error(
    column: usize,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(column, Type::Text, Box::new(err))
}

pub fn round_cents(amount: f64) -> f64 {
    (amount * 100.0).round() / 100.0
}
