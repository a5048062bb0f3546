//! Tree query service
//!
//! Read-only reconstruction of a member's downline for reporting. Shares the
//! entity model with the write path but never mutates; staleness is
//! acceptable here, financial state comes from the ledger.

use rusqlite::Connection;
use serde::Serialize;

use crate::errors::{EngineError, EngineResult};
use crate::models::{Member, ProfileStatus, Side};
use crate::store::MemberStore;

/// Depth cap regardless of what the caller asks for.
pub const MAX_QUERY_DEPTH: usize = 32;

/// One node of the reconstructed downline.
///
/// `truncated` distinguishes "no children" from "children beyond the depth
/// bound were not fetched".
#[derive(Debug, Clone, Serialize)]
pub struct TreeNode {
    pub member_id: i64,
    pub first_name: String,
    pub last_name: String,
    pub introducer_id: i64,
    pub referral_type: Side,
    pub profile_status: ProfileStatus,
    pub side_a_points: f64,
    pub side_b_points: f64,
    /// Points still needed on each side to reach the next 1:1 match.
    pub side_a_remaining: f64,
    pub side_b_remaining: f64,
    /// 1-based depth relative to the queried member.
    pub level: usize,
    pub truncated: bool,
    pub side_a: Option<Box<TreeNode>>,
    pub side_b: Option<Box<TreeNode>>,
}

#[derive(Clone)]
pub struct TreeQueryService {
    store: MemberStore,
}

impl TreeQueryService {
    pub fn new(store: MemberStore) -> Self {
        Self { store }
    }

    /// Reconstruct the two-sided downline of `member_id`, `max_depth` levels
    /// deep (the queried member is level 1).
    pub async fn get_downline(&self, member_id: i64, max_depth: usize) -> EngineResult<TreeNode> {
        let max_depth = max_depth.clamp(1, MAX_QUERY_DEPTH);
        let conn = self.store.lock().await;
        let root = MemberStore::member_by_id(&conn, member_id)?
            .ok_or(EngineError::MemberNotFound(member_id))?;
        build_node(&conn, root, 1, max_depth)
    }
}

fn build_node(
    conn: &Connection,
    member: Member,
    level: usize,
    max_depth: usize,
) -> EngineResult<TreeNode> {
    let (side_a_remaining, side_b_remaining) =
        remaining_to_match(member.side_a_points, member.side_b_points);

    let has_children = member.side_a_child_id.is_some() || member.side_b_child_id.is_some();
    let at_bound = level >= max_depth;

    let mut node = TreeNode {
        member_id: member.member_id,
        first_name: member.first_name.clone(),
        last_name: member.last_name.clone(),
        introducer_id: member.introducer_id,
        referral_type: member.referral_type,
        profile_status: member.profile_status,
        side_a_points: member.side_a_points,
        side_b_points: member.side_b_points,
        side_a_remaining,
        side_b_remaining,
        level,
        truncated: at_bound && has_children,
        side_a: None,
        side_b: None,
    };

    if at_bound {
        return Ok(node);
    }

    for side in [Side::A, Side::B] {
        if let Some(child_id) = member.child_id(side) {
            let child = MemberStore::member_by_id(conn, child_id)?.ok_or_else(|| {
                EngineError::InvariantViolation(format!(
                    "slot link from {} points at missing member {child_id}",
                    member.member_id
                ))
            })?;
            let subtree = Box::new(build_node(conn, child, level + 1, max_depth)?);
            match side {
                Side::A => node.side_a = Some(subtree),
                Side::B => node.side_b = Some(subtree),
            }
        }
    }

    Ok(node)
}

/// Points each side still needs before the next whole 1:1 match. The side
/// that is ahead reports zero.
fn remaining_to_match(side_a: f64, side_b: f64) -> (f64, f64) {
    let min_side = side_a.min(side_b);
    let remaining_a = if side_a > side_b {
        0.0
    } else {
        min_side + 1.0 - side_a
    };
    let remaining_b = if side_b > side_a {
        0.0
    } else {
        min_side + 1.0 - side_b
    };
    (remaining_a, remaining_b)
}
