//! Referral point ledger & commission propagation
//!
//! One activation = one transaction: mark the member activated, pay the
//! direct-sales commission on the entry tier, then walk the tree-slot
//! ancestry upward crediting side points, consuming binary matches and
//! awarding the one-time cash-back. Either the whole walk commits or none
//! of it does.

use chrono::Utc;
use rusqlite::Connection;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::CashBackTiming;
use crate::errors::{EngineError, EngineResult};
use crate::events::DomainEvent;
use crate::models::{
    CommissionType, LedgerEntry, PaymentStatus, ProfileStatus, PropagationResult, Side,
};
use crate::store::MemberStore;

use super::ReferralEngine;

impl ReferralEngine {
    /// Activate a plan for a member and run the full propagation walk.
    /// Invoked exactly once per verified payment; a repeat invocation is
    /// rejected as `AlreadyActivated` with nothing committed.
    pub async fn on_plan_activated(
        &self,
        member_id: i64,
        plan_id: i64,
    ) -> EngineResult<PropagationResult> {
        let result = self
            .with_retry("on_plan_activated", move |conn| {
                let tx = conn.transaction()?;
                let mut events = Vec::new();
                let result = self.activate_in_tx(&tx, member_id, plan_id, &mut events)?;
                tx.commit()?;
                Ok((result, events))
            })
            .await?;

        info!(
            member_id,
            plan_id,
            touched = result.touched_member_ids.len(),
            total_paid = result.total_paid,
            "plan activation propagated"
        );
        Ok(result)
    }

    /// Record a pending gateway payment for later confirmation.
    pub async fn record_payment(
        &self,
        reference: &str,
        member_id: i64,
        plan_id: i64,
        amount: f64,
    ) -> EngineResult<i64> {
        let reference = reference.to_string();
        self.with_retry("record_payment", move |conn| {
            let tx = conn.transaction()?;
            MemberStore::member_by_id(&tx, member_id)?
                .ok_or(EngineError::MemberNotFound(member_id))?;
            MemberStore::plan_by_id(&tx, plan_id)?.ok_or(EngineError::PlanNotFound(plan_id))?;
            let id = MemberStore::insert_transaction(
                &tx,
                &reference,
                member_id,
                plan_id,
                amount,
                Utc::now(),
            )?;
            tx.commit()?;
            Ok((id, Vec::new()))
        })
        .await
    }

    /// Confirm a pending payment and activate in the same transaction. A
    /// reference settles at most once; re-confirmation is `AlreadyProcessed`.
    pub async fn confirm_payment(&self, reference: &str) -> EngineResult<PropagationResult> {
        let reference = reference.to_string();
        self.with_retry("confirm_payment", move |conn| {
            let tx = conn.transaction()?;

            let payment = MemberStore::transaction_by_reference(&tx, &reference)?
                .ok_or_else(|| EngineError::TransactionNotFound(reference.clone()))?;
            if payment.status != PaymentStatus::Pending {
                return Err(EngineError::AlreadyProcessed(reference.clone()));
            }
            MemberStore::settle_transaction(&tx, &reference, PaymentStatus::Verified)?;

            let mut events = Vec::new();
            let result =
                self.activate_in_tx(&tx, payment.member_id, payment.plan_id, &mut events)?;
            tx.commit()?;
            Ok((result, events))
        })
        .await
    }

    /// Reject a pending payment. Touches no member state.
    pub async fn reject_payment(&self, reference: &str) -> EngineResult<()> {
        let reference = reference.to_string();
        self.with_retry("reject_payment", move |conn| {
            let tx = conn.transaction()?;
            let payment = MemberStore::transaction_by_reference(&tx, &reference)?
                .ok_or_else(|| EngineError::TransactionNotFound(reference.clone()))?;
            if payment.status != PaymentStatus::Pending {
                return Err(EngineError::AlreadyProcessed(reference.clone()));
            }
            MemberStore::settle_transaction(&tx, &reference, PaymentStatus::Rejected)?;
            tx.commit()?;
            Ok(((), Vec::new()))
        })
        .await
    }

    /// The activation body, shared by `on_plan_activated` and
    /// `confirm_payment`. Runs entirely inside the caller's transaction.
    fn activate_in_tx(
        &self,
        tx: &Connection,
        member_id: i64,
        plan_id: i64,
        events: &mut Vec<DomainEvent>,
    ) -> EngineResult<PropagationResult> {
        let plan =
            MemberStore::plan_by_id(tx, plan_id)?.ok_or(EngineError::PlanNotFound(plan_id))?;
        let member = MemberStore::member_by_id(tx, member_id)?
            .ok_or(EngineError::MemberNotFound(member_id))?;
        if member.profile_status == ProfileStatus::Activated {
            return Err(EngineError::AlreadyActivated(member_id));
        }

        MemberStore::set_activated(tx, member_id, plan_id, Utc::now())?;

        let mut total_paid = 0.0;

        // Entry-tier activations pay the introducer (the recruiter, not the
        // tree parent) a direct-sales cut, but only if the introducer has
        // activated a plan of their own. Skipping is a business rule, not an
        // error; a missing introducer row is.
        if plan_id == self.config.entry_plan_id && member.introducer_id != member.member_id {
            let introducer = MemberStore::member_by_id(tx, member.introducer_id)?
                .ok_or(EngineError::IntroducerNotFound(member.introducer_id))?;

            if introducer.profile_status == ProfileStatus::Activated {
                let commission = plan.product_price * self.config.direct_commission_pct;
                MemberStore::apply_direct_commission(tx, introducer.member_id, commission)?;
                self.append_ledger(tx, CommissionType::DirectSales, introducer.member_id, commission)?;
                events.push(DomainEvent::CommissionPaid {
                    member_id: introducer.member_id,
                    commission_type: CommissionType::DirectSales,
                    amount: commission,
                });
                total_paid += commission;
            } else {
                debug!(
                    introducer = introducer.member_id,
                    "introducer not activated, direct commission skipped"
                );
            }
        }

        let starter = MemberStore::plan_by_id(tx, self.config.entry_plan_id)?
            .ok_or(EngineError::PlanNotFound(self.config.entry_plan_id))?;
        let points = plan.referral_points;

        let mut touched = Vec::new();
        let mut current_id = member_id;
        let mut steps = 0usize;

        // Iterative walk to the root via slot links. An explicit loop with a
        // step bound: deep legs are expected and recursion is not an option.
        while let Some((ancestor, side)) = MemberStore::slot_parent(tx, current_id)? {
            steps += 1;
            if steps > self.config.max_tree_depth {
                return Err(EngineError::InvariantViolation(format!(
                    "ancestor walk from {member_id} exceeded {} levels, cycle suspected",
                    self.config.max_tree_depth
                )));
            }

            MemberStore::add_side_points(tx, ancestor.member_id, side, points)?;

            let mut side_a = ancestor.side_a_points;
            let mut side_b = ancestor.side_b_points;
            match side {
                Side::A => side_a += points,
                Side::B => side_b += points,
            }
            let credited = (side_a, side_b);

            if ancestor.profile_status == ProfileStatus::Activated {
                let matched = side_a.min(side_b).floor();
                if matched >= 1.0 {
                    let bonus = matched * 2.0 * self.config.point_usd_value;
                    MemberStore::apply_binary_match(tx, ancestor.member_id, matched, bonus)?;
                    self.append_ledger(tx, CommissionType::BinaryCommission, ancestor.member_id, bonus)?;
                    events.push(DomainEvent::CommissionPaid {
                        member_id: ancestor.member_id,
                        commission_type: CommissionType::BinaryCommission,
                        amount: bonus,
                    });
                    total_paid += bonus;
                    side_a -= matched;
                    side_b -= matched;
                }
            }

            let (eligible_a, eligible_b) = match self.config.cash_back_timing {
                CashBackTiming::BeforeMatch => credited,
                CashBackTiming::AfterMatch => (side_a, side_b),
            };
            if ancestor.cash_back == 0.0 && eligible_a >= 1.0 && eligible_b >= 1.0 {
                // Twice the starter price: one starter sale on each side.
                let bonus = starter.product_price * 2.0 * self.config.cash_back_pct;
                if MemberStore::apply_cash_back(tx, ancestor.member_id, bonus)? {
                    self.append_ledger(tx, CommissionType::CashBack, ancestor.member_id, bonus)?;
                    events.push(DomainEvent::CashBackAwarded {
                        member_id: ancestor.member_id,
                        amount: bonus,
                    });
                    total_paid += bonus;
                }
            }

            touched.push(ancestor.member_id);
            current_id = ancestor.member_id;
        }

        events.push(DomainEvent::MemberActivated {
            member_id,
            plan_id,
            total_paid,
        });

        Ok(PropagationResult {
            touched_member_ids: touched,
            total_paid,
        })
    }

    fn append_ledger(
        &self,
        tx: &Connection,
        commission_type: CommissionType,
        member_id: i64,
        amount: f64,
    ) -> EngineResult<()> {
        MemberStore::insert_ledger(
            tx,
            &LedgerEntry {
                id: Uuid::new_v4().to_string(),
                commission_type,
                member_id,
                amount,
                created_at: Utc::now(),
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_util::{new_member, seed_root, test_engine, test_engine_with_config};
    use crate::config::{CashBackTiming, EngineConfig};
    use crate::errors::EngineError;
    use crate::models::{CommissionType, ProfileStatus, Side};

    // Starter plan: $120, 1 point. Commission plan defaults: 10% direct,
    // $3/point paid on both sides, 19% cash-back on 2x starter price.
    const STARTER: i64 = 1;

    #[tokio::test]
    async fn activation_credits_points_up_the_chain() {
        let (engine, _temp) = test_engine().await;
        seed_root(&engine, 7500, ProfileStatus::Activated).await;

        let a1 = engine
            .register(new_member(7500, Side::A, "a1"))
            .await
            .unwrap();
        let a2 = engine
            .register(new_member(7500, Side::A, "a2"))
            .await
            .unwrap();

        let result = engine.on_plan_activated(a2.member_id, STARTER).await.unwrap();

        // Both the intermediate member and the root are touched, nearest
        // ancestor first, each credited the full injected amount.
        assert_eq!(result.touched_member_ids, vec![a1.member_id, 7500]);

        let mid = engine.store().get_member(a1.member_id).await.unwrap().unwrap();
        assert!((mid.side_a_points - 1.0).abs() < 1e-9);
        assert!((mid.side_b_points - 0.0).abs() < 1e-9);

        let root = engine.store().get_member(7500).await.unwrap().unwrap();
        assert!((root.side_a_points - 1.0).abs() < 1e-9);
        assert!((root.side_b_points - 0.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn one_sided_points_never_match_or_cash_back() {
        let (engine, _temp) = test_engine().await;
        seed_root(&engine, 7500, ProfileStatus::Activated).await;
        let a1 = engine
            .register(new_member(7500, Side::A, "a1"))
            .await
            .unwrap();

        engine.on_plan_activated(a1.member_id, STARTER).await.unwrap();

        let root = engine.store().get_member(7500).await.unwrap().unwrap();
        assert!((root.side_a_points - 1.0).abs() < 1e-9);
        assert_eq!(root.side_b_points, 0.0);
        assert_eq!(root.binary_commission, 0.0);
        assert_eq!(root.cash_back, 0.0);
        // The root still earned the direct-sales cut as a1's introducer.
        assert!((root.direct_sales - 12.0).abs() < 1e-9);
        assert!((root.current_balance - 12.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn first_one_to_one_match_pays_commission_and_cash_back() {
        let (engine, _temp) = test_engine().await;
        seed_root(&engine, 7500, ProfileStatus::Activated).await;
        let a1 = engine
            .register(new_member(7500, Side::A, "a1"))
            .await
            .unwrap();
        let b1 = engine
            .register(new_member(7500, Side::B, "b1"))
            .await
            .unwrap();

        engine.on_plan_activated(a1.member_id, STARTER).await.unwrap();
        let result = engine.on_plan_activated(b1.member_id, STARTER).await.unwrap();

        let root = engine.store().get_member(7500).await.unwrap().unwrap();
        // match=1 consumed both sides
        assert_eq!(root.side_a_points, 0.0);
        assert_eq!(root.side_b_points, 0.0);
        // binary commission: 1 * 2 * $3
        assert!((root.binary_commission - 6.0).abs() < 1e-9);
        // cash-back: $120 * 2 * 19%
        assert!((root.cash_back - 45.6).abs() < 1e-9);
        // plus the $12 direct-sales cut per starter activation
        assert!((root.direct_sales - 24.0).abs() < 1e-9);
        assert!((root.current_balance - 75.6).abs() < 1e-9);
        assert!((root.total_earnings - 75.6).abs() < 1e-9);
        // b1's activation alone paid direct + binary + cash-back
        assert!((result.total_paid - 63.6).abs() < 1e-9);

        let ledger = engine.store().list_ledger(7500, 10).await.unwrap();
        let kinds: Vec<_> = ledger.iter().map(|e| e.commission_type).collect();
        assert!(kinds.contains(&CommissionType::BinaryCommission));
        assert!(kinds.contains(&CommissionType::CashBack));
    }

    #[tokio::test]
    async fn after_match_timing_withholds_cash_back_on_exact_match() {
        let config = EngineConfig {
            cash_back_timing: CashBackTiming::AfterMatch,
            ..EngineConfig::default()
        };
        let (engine, _temp) = test_engine_with_config(config).await;
        seed_root(&engine, 7500, ProfileStatus::Activated).await;
        let a1 = engine
            .register(new_member(7500, Side::A, "a1"))
            .await
            .unwrap();
        let b1 = engine
            .register(new_member(7500, Side::B, "b1"))
            .await
            .unwrap();

        engine.on_plan_activated(a1.member_id, STARTER).await.unwrap();
        engine.on_plan_activated(b1.member_id, STARTER).await.unwrap();

        let root = engine.store().get_member(7500).await.unwrap().unwrap();
        // The exact 1:1 match pays out and consumes both sides, leaving
        // nothing for the post-match eligibility check.
        assert!((root.binary_commission - 6.0).abs() < 1e-9);
        assert_eq!(root.side_a_points, 0.0);
        assert_eq!(root.side_b_points, 0.0);
        assert_eq!(root.cash_back, 0.0);

        let ledger = engine.store().list_ledger(7500, 10).await.unwrap();
        assert!(!ledger
            .iter()
            .any(|e| e.commission_type == CommissionType::CashBack));
    }

    #[tokio::test]
    async fn cash_back_is_awarded_at_most_once() {
        let (engine, _temp) = test_engine().await;
        seed_root(&engine, 7500, ProfileStatus::Activated).await;

        // Two 1:1 rounds under the root.
        for tag in ["a1", "b1", "a2", "b2"] {
            let side = if tag.starts_with('a') { Side::A } else { Side::B };
            let reg = engine.register(new_member(7500, side, tag)).await.unwrap();
            engine.on_plan_activated(reg.member_id, STARTER).await.unwrap();
        }

        let root = engine.store().get_member(7500).await.unwrap().unwrap();
        // Two binary matches but a single cash-back.
        assert!((root.binary_commission - 12.0).abs() < 1e-9);
        assert!((root.cash_back - 45.6).abs() < 1e-9);

        let ledger = engine.store().list_ledger(7500, 10).await.unwrap();
        let cash_backs = ledger
            .iter()
            .filter(|e| e.commission_type == CommissionType::CashBack)
            .count();
        assert_eq!(cash_backs, 1);
    }

    #[tokio::test]
    async fn direct_commission_requires_activated_introducer() {
        let (engine, _temp) = test_engine().await;
        seed_root(&engine, 7500, ProfileStatus::Activated).await;

        // alice introduced by root (Activated), bob introduced by alice
        // while she is still pending.
        let alice = engine
            .register(new_member(7500, Side::A, "alice"))
            .await
            .unwrap();
        let bob = engine
            .register(new_member(alice.member_id, Side::A, "bob"))
            .await
            .unwrap();

        engine.on_plan_activated(bob.member_id, STARTER).await.unwrap();

        // Pending introducer: no credit and no error.
        let pending = engine
            .store()
            .get_member(alice.member_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(pending.direct_sales, 0.0);

        // Activated introducer earns 10% of the starter price.
        engine
            .on_plan_activated(alice.member_id, STARTER)
            .await
            .unwrap();
        let root = engine.store().get_member(7500).await.unwrap().unwrap();
        assert!((root.direct_sales - 12.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn second_activation_is_rejected_without_side_effects() {
        let (engine, _temp) = test_engine().await;
        seed_root(&engine, 7500, ProfileStatus::Activated).await;
        let a1 = engine
            .register(new_member(7500, Side::A, "a1"))
            .await
            .unwrap();

        engine.on_plan_activated(a1.member_id, STARTER).await.unwrap();
        let err = engine
            .on_plan_activated(a1.member_id, STARTER)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::AlreadyActivated(_)));

        // No double credit.
        let root = engine.store().get_member(7500).await.unwrap().unwrap();
        assert!((root.side_a_points - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn unknown_plan_and_member_abort() {
        let (engine, _temp) = test_engine().await;
        seed_root(&engine, 7500, ProfileStatus::Activated).await;
        let a1 = engine
            .register(new_member(7500, Side::A, "a1"))
            .await
            .unwrap();

        assert!(matches!(
            engine.on_plan_activated(a1.member_id, 99).await.unwrap_err(),
            EngineError::PlanNotFound(99)
        ));
        assert!(matches!(
            engine.on_plan_activated(9999, STARTER).await.unwrap_err(),
            EngineError::MemberNotFound(9999)
        ));

        // The failed calls left nothing behind.
        let member = engine
            .store()
            .get_member(a1.member_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(member.profile_status, ProfileStatus::PendingVerification);
    }

    #[tokio::test]
    async fn bigger_plans_inject_more_points() {
        let (engine, _temp) = test_engine().await;
        seed_root(&engine, 7500, ProfileStatus::Activated).await;
        let a1 = engine
            .register(new_member(7500, Side::A, "a1"))
            .await
            .unwrap();
        let b1 = engine
            .register(new_member(7500, Side::B, "b1"))
            .await
            .unwrap();

        // Advanced plan injects 4 points.
        engine.on_plan_activated(a1.member_id, 2).await.unwrap();
        engine.on_plan_activated(b1.member_id, 2).await.unwrap();

        let root = engine.store().get_member(7500).await.unwrap().unwrap();
        // 4:4 matched fully, commission 4 * 2 * $3.
        assert_eq!(root.side_a_points, 0.0);
        assert_eq!(root.side_b_points, 0.0);
        assert!((root.binary_commission - 24.0).abs() < 1e-9);
        // No direct commission on non-entry tiers.
        assert_eq!(root.direct_sales, 0.0);
    }

    #[tokio::test]
    async fn payment_confirmation_activates_exactly_once() {
        let (engine, _temp) = test_engine().await;
        seed_root(&engine, 7500, ProfileStatus::Activated).await;
        let a1 = engine
            .register(new_member(7500, Side::A, "a1"))
            .await
            .unwrap();

        engine
            .record_payment("trx-100", a1.member_id, STARTER, 120.0)
            .await
            .unwrap();
        let result = engine.confirm_payment("trx-100").await.unwrap();
        assert_eq!(result.touched_member_ids, vec![7500]);

        assert!(matches!(
            engine.confirm_payment("trx-100").await.unwrap_err(),
            EngineError::AlreadyProcessed(_)
        ));
        assert!(matches!(
            engine.confirm_payment("trx-missing").await.unwrap_err(),
            EngineError::TransactionNotFound(_)
        ));
    }

    #[tokio::test]
    async fn rejected_payment_touches_no_member_state() {
        let (engine, _temp) = test_engine().await;
        seed_root(&engine, 7500, ProfileStatus::Activated).await;
        let a1 = engine
            .register(new_member(7500, Side::A, "a1"))
            .await
            .unwrap();

        engine
            .record_payment("trx-200", a1.member_id, STARTER, 120.0)
            .await
            .unwrap();
        engine.reject_payment("trx-200").await.unwrap();

        let member = engine
            .store()
            .get_member(a1.member_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(member.profile_status, ProfileStatus::PendingVerification);

        assert!(matches!(
            engine.reject_payment("trx-200").await.unwrap_err(),
            EngineError::AlreadyProcessed(_)
        ));
    }

    #[tokio::test]
    async fn activation_emits_events_after_commit() {
        use crate::events::DomainEvent;

        let (engine, _temp) = test_engine().await;
        seed_root(&engine, 7500, ProfileStatus::Activated).await;
        let a1 = engine
            .register(new_member(7500, Side::A, "a1"))
            .await
            .unwrap();
        let b1 = engine
            .register(new_member(7500, Side::B, "b1"))
            .await
            .unwrap();
        engine.on_plan_activated(a1.member_id, STARTER).await.unwrap();

        let mut rx = engine.events().subscribe();
        engine.on_plan_activated(b1.member_id, STARTER).await.unwrap();

        let mut saw_binary = false;
        let mut saw_cash_back = false;
        let mut saw_activated = false;
        while let Ok(event) = rx.try_recv() {
            match event {
                DomainEvent::CommissionPaid {
                    commission_type: CommissionType::BinaryCommission,
                    ..
                } => saw_binary = true,
                DomainEvent::CashBackAwarded { .. } => saw_cash_back = true,
                DomainEvent::MemberActivated { .. } => saw_activated = true,
                _ => {}
            }
        }
        assert!(saw_binary && saw_cash_back && saw_activated);
    }
}
