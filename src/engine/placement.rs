//! Placement resolver
//!
//! New members are pushed down the introducer's preferred-side line until an
//! empty slot of that side is found, so the eventual tree parent may differ
//! from the introducer. The slot write and the member-row insert commit as
//! one transaction.

use chrono::Utc;
use rusqlite::Connection;
use tracing::info;

use crate::errors::{EngineError, EngineResult};
use crate::events::DomainEvent;
use crate::models::{Member, NewMember, ProfileStatus, RegisteredMember, Side};
use crate::store::MemberStore;

use super::ReferralEngine;

impl ReferralEngine {
    /// Create the designated root member. Refused once any member exists.
    pub async fn seed_root(
        &self,
        first_name: &str,
        last_name: &str,
        email: &str,
    ) -> EngineResult<i64> {
        let seed = self.config.member_id_seed;
        let first_name = first_name.to_string();
        let last_name = last_name.to_string();
        let email = email.to_string();

        self.with_retry("seed_root", move |conn| {
            let tx = conn.transaction()?;

            let count: i64 = tx.query_row("SELECT COUNT(*) FROM members", [], |row| row.get(0))?;
            if count > 0 {
                return Err(EngineError::InvariantViolation(
                    "root member already seeded".into(),
                ));
            }

            // The walk terminates on "no slot parent", so the root's
            // self-referential introducer link never loops.
            MemberStore::insert_member(
                &tx,
                &Member {
                    member_id: seed,
                    introducer_id: seed,
                    referral_type: Side::A,
                    first_name: first_name.clone(),
                    last_name: last_name.clone(),
                    email: email.clone(),
                    side_a_child_id: None,
                    side_b_child_id: None,
                    side_a_points: 0.0,
                    side_b_points: 0.0,
                    profile_status: ProfileStatus::PendingVerification,
                    plan_id: None,
                    current_balance: 0.0,
                    total_earnings: 0.0,
                    total_withdrawals: 0.0,
                    direct_sales: 0.0,
                    binary_commission: 0.0,
                    cash_back: 0.0,
                    created_at: Utc::now(),
                    activated_at: None,
                },
            )?;
            MemberStore::set_status(&tx, seed, ProfileStatus::Activated)?;
            tx.commit()?;

            info!(member_id = seed, "root member seeded");
            Ok((seed, Vec::new()))
        })
        .await
    }

    /// Register a new member: assign an id, resolve the open slot under the
    /// introducer, insert the row and link it, all in one transaction.
    pub async fn register(&self, new_member: NewMember) -> EngineResult<RegisteredMember> {
        let seed = self.config.member_id_seed;
        let max_depth = self.config.max_tree_depth;

        let registered = self
            .with_retry("register", move |conn| {
                let tx = conn.transaction()?;

                let parent_id = resolve_open_slot(
                    &tx,
                    new_member.introducer_id,
                    new_member.referral_type,
                    max_depth,
                )?;
                let member_id = MemberStore::next_member_id(&tx, seed)?;

                MemberStore::insert_member(
                    &tx,
                    &Member {
                        member_id,
                        introducer_id: new_member.introducer_id,
                        referral_type: new_member.referral_type,
                        first_name: new_member.first_name.clone(),
                        last_name: new_member.last_name.clone(),
                        email: new_member.email.clone(),
                        side_a_child_id: None,
                        side_b_child_id: None,
                        side_a_points: 0.0,
                        side_b_points: 0.0,
                        profile_status: ProfileStatus::PendingVerification,
                        plan_id: None,
                        current_balance: 0.0,
                        total_earnings: 0.0,
                        total_withdrawals: 0.0,
                        direct_sales: 0.0,
                        binary_commission: 0.0,
                        cash_back: 0.0,
                        created_at: Utc::now(),
                        activated_at: None,
                    },
                )?;
                MemberStore::link_child(&tx, parent_id, new_member.referral_type, member_id)?;
                tx.commit()?;

                let registered = RegisteredMember {
                    member_id,
                    parent_member_id: parent_id,
                };
                let events = vec![DomainEvent::MemberRegistered {
                    member_id,
                    introducer_id: new_member.introducer_id,
                    parent_member_id: parent_id,
                    side: new_member.referral_type,
                    email: new_member.email.clone(),
                }];
                Ok((registered, events))
            })
            .await?;

        info!(
            member_id = registered.member_id,
            parent = registered.parent_member_id,
            "member registered"
        );
        Ok(registered)
    }

    /// Resolve the open slot under `introducer_id` on `side` and link
    /// `new_member_id` into it. Returns the resolved parent id.
    pub async fn place(
        &self,
        introducer_id: i64,
        side: Side,
        new_member_id: i64,
    ) -> EngineResult<i64> {
        let max_depth = self.config.max_tree_depth;
        self.with_retry("place", move |conn| {
            let tx = conn.transaction()?;
            let parent_id = resolve_open_slot(&tx, introducer_id, side, max_depth)?;
            MemberStore::link_child(&tx, parent_id, side, new_member_id)?;
            tx.commit()?;
            Ok((parent_id, Vec::new()))
        })
        .await
    }

    /// Email-confirmation transition: PendingVerification -> Verified.
    /// Returns false when the member was already past that state.
    pub async fn mark_verified(&self, member_id: i64) -> EngineResult<bool> {
        self.with_retry("mark_verified", move |conn| {
            let tx = conn.transaction()?;
            let member = MemberStore::member_by_id(&tx, member_id)?
                .ok_or(EngineError::MemberNotFound(member_id))?;

            if member.profile_status != ProfileStatus::PendingVerification {
                return Ok((false, Vec::new()));
            }

            MemberStore::set_status(&tx, member_id, ProfileStatus::Verified)?;
            tx.commit()?;
            Ok((true, vec![DomainEvent::MemberVerified { member_id }]))
        })
        .await
    }
}

/// Same-side descent from the introducer: follow the preferred-side slot
/// link until a member with that slot empty is found. Iterative with a hard
/// depth bound; recursion on a deep leg would blow the stack.
fn resolve_open_slot(
    conn: &Connection,
    introducer_id: i64,
    side: Side,
    max_depth: usize,
) -> EngineResult<i64> {
    let mut current = MemberStore::member_by_id(conn, introducer_id)?
        .ok_or(EngineError::ParentNotFound(introducer_id))?;

    for _ in 0..max_depth {
        match current.child_id(side) {
            None => return Ok(current.member_id),
            Some(child_id) => {
                current = MemberStore::member_by_slot(conn, current.member_id, side)?
                    .ok_or_else(|| {
                        EngineError::InvariantViolation(format!(
                            "slot link from {} points at missing member {child_id}",
                            current.member_id
                        ))
                    })?;
            }
        }
    }

    Err(EngineError::InvariantViolation(format!(
        "placement descent under {introducer_id} exceeded {max_depth} levels, cycle suspected"
    )))
}

#[cfg(test)]
mod tests {
    use super::super::test_util::{new_member, seed_root, test_engine};
    use crate::errors::EngineError;
    use crate::models::{ProfileStatus, Side};
    use crate::store::MemberStore;

    #[tokio::test]
    async fn seed_root_refuses_second_root() {
        let (engine, _temp) = test_engine().await;
        let root = engine.seed_root("Root", "Member", "root@example.com").await.unwrap();
        assert_eq!(root, 7500);

        let err = engine
            .seed_root("Other", "Root", "other@example.com")
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvariantViolation(_)));
    }

    #[tokio::test]
    async fn register_places_under_introducer_when_slot_open() {
        let (engine, _temp) = test_engine().await;
        seed_root(&engine, 7500, ProfileStatus::Activated).await;

        let reg = engine
            .register(new_member(7500, Side::A, "alice"))
            .await
            .unwrap();
        assert_eq!(reg.member_id, 7501);
        assert_eq!(reg.parent_member_id, 7500);

        let root = engine.store().get_member(7500).await.unwrap().unwrap();
        assert_eq!(root.side_a_child_id, Some(7501));
        assert_eq!(root.side_b_child_id, None);
    }

    #[tokio::test]
    async fn three_same_side_registrations_form_a_chain() {
        let (engine, _temp) = test_engine().await;
        seed_root(&engine, 7500, ProfileStatus::Activated).await;

        let first = engine
            .register(new_member(7500, Side::A, "m1"))
            .await
            .unwrap();
        let second = engine
            .register(new_member(7500, Side::A, "m2"))
            .await
            .unwrap();
        let third = engine
            .register(new_member(7500, Side::A, "m3"))
            .await
            .unwrap();

        // Depth-first on the preferred side: each lands under the previous.
        assert_eq!(first.parent_member_id, 7500);
        assert_eq!(second.parent_member_id, first.member_id);
        assert_eq!(third.parent_member_id, second.member_id);

        let conn = engine.store().lock().await;
        let (p, side) = MemberStore::slot_parent(&conn, third.member_id)
            .unwrap()
            .unwrap();
        assert_eq!(p.member_id, second.member_id);
        assert_eq!(side, Side::A);
    }

    #[tokio::test]
    async fn opposite_sides_fill_independently() {
        let (engine, _temp) = test_engine().await;
        seed_root(&engine, 7500, ProfileStatus::Activated).await;

        let a = engine
            .register(new_member(7500, Side::A, "a1"))
            .await
            .unwrap();
        let b = engine
            .register(new_member(7500, Side::B, "b1"))
            .await
            .unwrap();

        assert_eq!(a.parent_member_id, 7500);
        assert_eq!(b.parent_member_id, 7500);

        let root = engine.store().get_member(7500).await.unwrap().unwrap();
        assert_eq!(root.side_a_child_id, Some(a.member_id));
        assert_eq!(root.side_b_child_id, Some(b.member_id));
    }

    #[tokio::test]
    async fn unknown_introducer_is_parent_not_found() {
        let (engine, _temp) = test_engine().await;
        seed_root(&engine, 7500, ProfileStatus::Activated).await;

        let err = engine
            .register(new_member(4242, Side::A, "ghost"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::ParentNotFound(4242)));
    }

    #[tokio::test]
    async fn mark_verified_transitions_once() {
        let (engine, _temp) = test_engine().await;
        seed_root(&engine, 7500, ProfileStatus::Activated).await;
        let reg = engine
            .register(new_member(7500, Side::A, "alice"))
            .await
            .unwrap();

        assert!(engine.mark_verified(reg.member_id).await.unwrap());
        assert!(!engine.mark_verified(reg.member_id).await.unwrap());

        let member = engine
            .store()
            .get_member(reg.member_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(member.profile_status, ProfileStatus::Verified);

        assert!(matches!(
            engine.mark_verified(9999).await.unwrap_err(),
            EngineError::MemberNotFound(9999)
        ));
    }
}
