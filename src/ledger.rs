// Goal-progress milestones and money helpers. The running total itself is
// maintained inside store transactions; this module only interprets it.

use serde::{Deserialize, Serialize};

/// A goal-progress threshold crossed by a single ledger update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Milestone {
    HalfGoal,
    GoalReached,
}

/// Detect a 50% or 100% crossing between `previous` and `new` totals.
/// Reports at most one milestone per update; 100% wins when both thresholds
/// are crossed at once. Never re-fires for a threshold `previous` had already
/// passed.
pub fn milestone_crossed(previous_cents: i64, new_cents: i64, goal_cents: i64) -> Option<Milestone> {
    if goal_cents <= 0 || new_cents <= previous_cents {
        return None;
    }
    if previous_cents < goal_cents && new_cents >= goal_cents {
        return Some(Milestone::GoalReached);
    }
    let half = goal_cents.div_euclid(2) + goal_cents.rem_euclid(2); // ceil(goal / 2)
    if previous_cents < half && new_cents >= half {
        return Some(Milestone::HalfGoal);
    }
    None
}

/// Format cents as a dollar string, e.g. 1500 -> "15.00".
pub fn format_cents(cents: i64) -> String {
    let sign = if cents < 0 { "-" } else { "" };
    let abs = cents.unsigned_abs();
    format!("{}{}.{:02}", sign, abs / 100, abs % 100)
}

/// Parse a dollar string ("15.00", "15.5", "15") into cents.
pub fn parse_dollars(s: &str) -> Option<i64> {
    let s = s.trim();
    let (whole, frac) = match s.split_once('.') {
        Some((w, f)) => (w, f),
        None => (s, ""),
    };
    if frac.len() > 2 || !frac.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let whole: i64 = whole.parse().ok()?;
    let frac_cents: i64 = if frac.is_empty() {
        0
    } else {
        let padded = format!("{:0<2}", frac);
        padded.parse().ok()?
    };
    if whole < 0 {
        None
    } else {
        Some(whole * 100 + frac_cents)
    }
}
