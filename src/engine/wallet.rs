//! Wallet paths: withdrawal requests and settlement
//!
//! The payout side of member balances. A request moves funds out of
//! `current_balance` immediately and parks them in a Pending withdrawal row;
//! completion is an external (manual) confirmation, rejection refunds.

use chrono::Utc;
use tracing::info;

use crate::errors::{EngineError, EngineResult};
use crate::events::DomainEvent;
use crate::models::{Withdrawal, WithdrawalStatus};
use crate::store::MemberStore;

use super::ReferralEngine;

impl ReferralEngine {
    /// Create a withdrawal request and debit the balance. The balance must
    /// strictly exceed the amount plus the processing charge; only the
    /// amount itself leaves the balance.
    pub async fn request_withdrawal(
        &self,
        member_id: i64,
        amount: f64,
        wallet_address: &str,
    ) -> EngineResult<Withdrawal> {
        if !(amount > 0.0) {
            return Err(EngineError::InvariantViolation(format!(
                "withdrawal amount must be positive, got {amount}"
            )));
        }
        let charge_pct = self.config.withdrawal_charge_pct;
        let wallet_address = wallet_address.to_string();

        let withdrawal = self
            .with_retry("request_withdrawal", move |conn| {
                let tx = conn.transaction()?;

                let member = MemberStore::member_by_id(&tx, member_id)?
                    .ok_or(EngineError::MemberNotFound(member_id))?;

                let required = amount * (1.0 + charge_pct);
                if member.current_balance <= required {
                    return Err(EngineError::InsufficientBalance {
                        available: member.current_balance,
                        required,
                    });
                }

                let id =
                    MemberStore::insert_withdrawal(&tx, member_id, amount, &wallet_address, Utc::now())?;
                MemberStore::apply_withdrawal_debit(&tx, member_id, amount)?;
                let withdrawal = MemberStore::withdrawal_by_id(&tx, id)?
                    .ok_or(EngineError::WithdrawalNotFound(id))?;
                tx.commit()?;

                let events = vec![DomainEvent::WithdrawalRequested {
                    withdrawal_id: id,
                    member_id,
                    amount,
                }];
                Ok((withdrawal, events))
            })
            .await?;

        info!(
            member_id,
            withdrawal_id = withdrawal.id,
            amount,
            "withdrawal requested"
        );
        Ok(withdrawal)
    }

    /// Settle a pending withdrawal as completed.
    pub async fn complete_withdrawal(&self, withdrawal_id: i64) -> EngineResult<()> {
        self.with_retry("complete_withdrawal", move |conn| {
            let tx = conn.transaction()?;
            let withdrawal = MemberStore::withdrawal_by_id(&tx, withdrawal_id)?
                .ok_or(EngineError::WithdrawalNotFound(withdrawal_id))?;
            if !MemberStore::settle_withdrawal(&tx, withdrawal_id, WithdrawalStatus::Completed)? {
                return Err(EngineError::AlreadyProcessed(format!(
                    "withdrawal {withdrawal_id}"
                )));
            }
            tx.commit()?;

            let events = vec![DomainEvent::WithdrawalCompleted {
                withdrawal_id,
                member_id: withdrawal.member_id,
            }];
            Ok(((), events))
        })
        .await
    }

    /// Reject a pending withdrawal and refund the debited amount.
    pub async fn reject_withdrawal(&self, withdrawal_id: i64) -> EngineResult<()> {
        self.with_retry("reject_withdrawal", move |conn| {
            let tx = conn.transaction()?;
            let withdrawal = MemberStore::withdrawal_by_id(&tx, withdrawal_id)?
                .ok_or(EngineError::WithdrawalNotFound(withdrawal_id))?;
            if !MemberStore::settle_withdrawal(&tx, withdrawal_id, WithdrawalStatus::Rejected)? {
                return Err(EngineError::AlreadyProcessed(format!(
                    "withdrawal {withdrawal_id}"
                )));
            }
            MemberStore::apply_withdrawal_refund(&tx, withdrawal.member_id, withdrawal.amount)?;
            tx.commit()?;
            Ok(((), Vec::new()))
        })
        .await
    }
}
