//! Core domain models for the referral network
//!
//! Members form a binary placement tree: every member hangs off exactly one
//! parent slot (side A or side B), which is not necessarily its introducer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which child slot a member occupies under its tree parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    #[serde(rename = "A")]
    A,
    #[serde(rename = "B")]
    B,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::A => "A",
            Side::B => "B",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "A" => Some(Side::A),
            "B" => Some(Side::B),
            _ => None,
        }
    }

    pub fn other(&self) -> Side {
        match self {
            Side::A => Side::B,
            Side::B => Side::A,
        }
    }
}

/// Member lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProfileStatus {
    #[serde(rename = "pending_verification")]
    PendingVerification,
    #[serde(rename = "verified")]
    Verified,
    #[serde(rename = "activated")]
    Activated,
    #[serde(rename = "dormant")]
    Dormant,
}

impl ProfileStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProfileStatus::PendingVerification => "PendingVerification",
            ProfileStatus::Verified => "Verified",
            ProfileStatus::Activated => "Activated",
            ProfileStatus::Dormant => "Dormant",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "PendingVerification" => Some(ProfileStatus::PendingVerification),
            "Verified" => Some(ProfileStatus::Verified),
            "Activated" => Some(ProfileStatus::Activated),
            "Dormant" => Some(ProfileStatus::Dormant),
            _ => None,
        }
    }
}

/// A member row: tree links, point accumulators and financial counters.
///
/// `introducer_id` (who recruited the member, gets direct-sales credit) and
/// the slot link under the tree parent are distinct relations and are stored
/// separately.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Member {
    pub member_id: i64,
    pub introducer_id: i64,
    pub referral_type: Side,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub side_a_child_id: Option<i64>,
    pub side_b_child_id: Option<i64>,
    pub side_a_points: f64,
    pub side_b_points: f64,
    pub profile_status: ProfileStatus,
    pub plan_id: Option<i64>,
    pub current_balance: f64,
    pub total_earnings: f64,
    pub total_withdrawals: f64,
    pub direct_sales: f64,
    pub binary_commission: f64,
    /// One-shot cash-back bonus. Zero means "not yet awarded".
    pub cash_back: f64,
    pub created_at: DateTime<Utc>,
    pub activated_at: Option<DateTime<Utc>>,
}

impl Member {
    pub fn child_id(&self, side: Side) -> Option<i64> {
        match side {
            Side::A => self.side_a_child_id,
            Side::B => self.side_b_child_id,
        }
    }

    pub fn side_points(&self, side: Side) -> f64 {
        match side {
            Side::A => self.side_a_points,
            Side::B => self.side_b_points,
        }
    }
}

/// Plan tier (read-only to the engine).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub id: i64,
    pub name: String,
    pub product_price: f64,
    /// Referral points injected into the network per activation of this plan.
    pub referral_points: f64,
}

/// Payout category recorded in the sales ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommissionType {
    DirectSales,
    BinaryCommission,
    CashBack,
}

impl CommissionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommissionType::DirectSales => "Direct Sales Commission",
            CommissionType::BinaryCommission => "Binary Commission",
            CommissionType::CashBack => "Cash Back",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "Direct Sales Commission" => Some(CommissionType::DirectSales),
            "Binary Commission" => Some(CommissionType::BinaryCommission),
            "Cash Back" => Some(CommissionType::CashBack),
            _ => None,
        }
    }
}

/// Append-only sales-ledger row. Never updated or deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: String,
    pub commission_type: CommissionType,
    pub member_id: i64,
    pub amount: f64,
    pub created_at: DateTime<Utc>,
}

/// Status of a gateway payment confirmation handed to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentStatus {
    Pending,
    Verified,
    Rejected,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "Pending",
            PaymentStatus::Verified => "Verified",
            PaymentStatus::Rejected => "Rejected",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "Pending" => Some(PaymentStatus::Pending),
            "Verified" => Some(PaymentStatus::Verified),
            "Rejected" => Some(PaymentStatus::Rejected),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentTransaction {
    pub id: i64,
    /// Unique gateway reference (payment intent / trx id).
    pub reference: String,
    pub member_id: i64,
    pub plan_id: i64,
    pub amount: f64,
    pub status: PaymentStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WithdrawalStatus {
    Pending,
    Completed,
    Rejected,
}

impl WithdrawalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WithdrawalStatus::Pending => "Pending",
            WithdrawalStatus::Completed => "Completed",
            WithdrawalStatus::Rejected => "Rejected",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "Pending" => Some(WithdrawalStatus::Pending),
            "Completed" => Some(WithdrawalStatus::Completed),
            "Rejected" => Some(WithdrawalStatus::Rejected),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Withdrawal {
    pub id: i64,
    pub member_id: i64,
    pub amount: f64,
    pub wallet_address: String,
    pub status: WithdrawalStatus,
    pub created_at: DateTime<Utc>,
}

/// Registration request.
#[derive(Debug, Clone, Deserialize)]
pub struct NewMember {
    pub introducer_id: i64,
    pub referral_type: Side,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
}

/// Registration outcome: the assigned id and the resolved tree parent
/// (which may differ from the introducer).
#[derive(Debug, Clone, Serialize)]
pub struct RegisteredMember {
    pub member_id: i64,
    pub parent_member_id: i64,
}

/// Result of one activation walk.
#[derive(Debug, Clone, Serialize)]
pub struct PropagationResult {
    /// Ancestor ids whose rows were touched, in walk order (nearest first).
    pub touched_member_ids: Vec<i64>,
    /// Sum of every commission and bonus credited during this activation.
    pub total_paid: f64,
}
