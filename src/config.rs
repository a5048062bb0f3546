//! Engine configuration
//!
//! Defaults mirror the production compensation plan; every knob can be
//! overridden through `REFNET_*` environment variables.

use std::env;

/// When cash-back eligibility is evaluated relative to the binary match.
///
/// The compensation plan is ambiguous here: the latest revision checks the
/// side counters before the match consumes them, older ones after. Kept
/// configurable instead of guessing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CashBackTiming {
    /// Eligibility uses the side values as credited, before the match
    /// subtracts the matched amount (default).
    BeforeMatch,
    /// Eligibility uses the side values left over after the match.
    AfterMatch,
}

impl CashBackTiming {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "before" | "before_match" => Some(CashBackTiming::BeforeMatch),
            "after" | "after_match" => Some(CashBackTiming::AfterMatch),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Plan id that counts as the entry tier (triggers direct-sales credit).
    pub entry_plan_id: i64,
    /// Direct-sales commission rate on the entry-tier plan price.
    pub direct_commission_pct: f64,
    /// Cash-back rate applied to twice the starter plan price.
    pub cash_back_pct: f64,
    /// USD value of one matched referral point (paid per side).
    pub point_usd_value: f64,
    /// Extra charge applied on top of a withdrawal amount.
    pub withdrawal_charge_pct: f64,
    pub cash_back_timing: CashBackTiming,
    /// Hard bound on placement descent and ancestor walks. Exceeding it
    /// indicates a cycle in the tree.
    pub max_tree_depth: usize,
    /// Bounded internal retries when the store reports busy.
    pub busy_retries: u32,
    /// First member id handed out when the members table is empty.
    pub member_id_seed: i64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            entry_plan_id: 1,
            direct_commission_pct: 0.10,
            cash_back_pct: 0.19,
            point_usd_value: 3.0,
            withdrawal_charge_pct: 0.06,
            cash_back_timing: CashBackTiming::BeforeMatch,
            max_tree_depth: 10_000,
            busy_retries: 5,
            member_id_seed: 7500,
        }
    }
}

impl EngineConfig {
    /// Build a config from the environment, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            entry_plan_id: env_parse("REFNET_ENTRY_PLAN_ID", defaults.entry_plan_id),
            direct_commission_pct: env_parse(
                "REFNET_DIRECT_COMMISSION_PCT",
                defaults.direct_commission_pct,
            ),
            cash_back_pct: env_parse("REFNET_CASH_BACK_PCT", defaults.cash_back_pct),
            point_usd_value: env_parse("REFNET_POINT_USD_VALUE", defaults.point_usd_value),
            withdrawal_charge_pct: env_parse(
                "REFNET_WITHDRAWAL_CHARGE_PCT",
                defaults.withdrawal_charge_pct,
            ),
            cash_back_timing: env::var("REFNET_CASH_BACK_TIMING")
                .ok()
                .and_then(|v| CashBackTiming::from_str(&v))
                .unwrap_or(defaults.cash_back_timing),
            max_tree_depth: env_parse("REFNET_MAX_TREE_DEPTH", defaults.max_tree_depth),
            busy_retries: env_parse("REFNET_BUSY_RETRIES", defaults.busy_retries),
            member_id_seed: env_parse("REFNET_MEMBER_ID_SEED", defaults.member_id_seed),
        }
    }
}

fn env_parse<T: std::str::FromStr>(var: &str, default: T) -> T {
    env::var(var)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}
