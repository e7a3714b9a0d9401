//! Pure mapping from (remaining quota, distribution, stage) to a
//! concrete parameter bundle (C7).
//!
//! A small derived enum ordered by a single numeric property, consumed
//! by a lookup rather than scattered conditionals. `select_strategy`
//! takes no `&self` by design (spec.md §4.7, P8) — it is a free
//! function so determinism is structural, not just observed.

use crate::distribution::{Confidence, DistributionSnapshot};

const GIB: u64 = 1024 * 1024 * 1024;
const SAFETY_MARGIN_FRACTION: f64 = 0.05;

/// Quota headroom tier, derived from `remaining / quota_cap`
/// (spec.md §4.7 step 1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaTier {
    /// More than 80% of quota remaining.
    Fresh,
    /// 50-80% of quota remaining.
    Mid,
    /// 25-50% of quota remaining.
    Low,
    /// Less than 25% of quota remaining.
    Critical,
}

impl QuotaTier {
    fn from_ratio(ratio: f64) -> Self {
        if ratio > 0.80 {
            QuotaTier::Fresh
        } else if ratio > 0.50 {
            QuotaTier::Mid
        } else if ratio > 0.25 {
            QuotaTier::Low
        } else {
            QuotaTier::Critical
        }
    }
}

/// File-size distribution regime, derived from `large_file_fraction`
/// (spec.md §4.7 step 2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistributionRegime {
    /// More than 10% of files are 50 GB+ by count.
    UltraHeavy,
    /// 2-10% of files are 50 GB+.
    Heavy,
    /// 0.5-2% of files are 50 GB+.
    Balanced,
    /// Less than 0.5% of files are 50 GB+.
    Light,
    /// No snapshot, or confidence below medium: conservative default.
    Conservative,
}

impl DistributionRegime {
    fn from_snapshot(snapshot: Option<&DistributionSnapshot>) -> Self {
        let Some(snapshot) = snapshot else {
            return DistributionRegime::Conservative;
        };
        if snapshot.confidence < Confidence::Medium {
            return DistributionRegime::Conservative;
        }
        let fraction = snapshot.large_file_fraction;
        if fraction > 0.10 {
            DistributionRegime::UltraHeavy
        } else if fraction > 0.02 {
            DistributionRegime::Heavy
        } else if fraction > 0.005 {
            DistributionRegime::Balanced
        } else {
            DistributionRegime::Light
        }
    }
}

/// Ordering preference for a stage's file transfer order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderBy {
    /// Largest files first.
    SizeDesc,
    /// Engine default order.
    None,
}

/// The output of [`select_strategy`] (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageParams {
    /// Parallel transfer count, 1..=8.
    pub concurrency: u8,
    /// Per-stage byte cap (`--max-transfer`).
    pub stage_byte_cap: u64,
    /// Per-file size cap (`--max-size`), if any.
    pub per_file_size_cap: Option<u64>,
    /// File ordering preference.
    pub order_by: OrderBy,
    /// Always `"cautious"` per spec.md §4.7.
    pub cutoff_mode: &'static str,
    /// Label identifying which table cell produced this bundle, useful
    /// for logging and tests.
    pub strategy_tag: &'static str,
}

/// Maps `(remaining_bytes, distribution_snapshot_or_none, stage_index)`
/// to a [`StageParams`] bundle.
///
/// Pure and deterministic (P8): depends only on its arguments. The
/// `stage_byte_cap ≤ remaining − safety_margin` clamp (P3) is applied
/// once, after the table lookup, so every returned bundle satisfies it
/// regardless of which table cell produced it.
#[must_use]
pub fn select_strategy(
    remaining_bytes: u64,
    quota_cap_bytes: u64,
    snapshot: Option<&DistributionSnapshot>,
    _stage_index: u32,
) -> StageParams {
    #[allow(clippy::cast_precision_loss)]
    let ratio = remaining_bytes as f64 / quota_cap_bytes as f64;
    let tier = QuotaTier::from_ratio(ratio);
    let regime = DistributionRegime::from_snapshot(snapshot);

    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let safety_margin = (quota_cap_bytes as f64 * SAFETY_MARGIN_FRACTION) as u64;

    let mut params = table_lookup(tier, regime, remaining_bytes, safety_margin);

    let max_allowed = remaining_bytes.saturating_sub(safety_margin);
    params.stage_byte_cap = params.stage_byte_cap.min(max_allowed);
    params
}

fn table_lookup(
    tier: QuotaTier,
    regime: DistributionRegime,
    remaining_bytes: u64,
    safety_margin: u64,
) -> StageParams {
    use DistributionRegime::{Balanced, Conservative, Heavy, Light, UltraHeavy};
    use QuotaTier::{Critical, Fresh, Low, Mid};

    if tier == Critical {
        // spec.md §4.7: critical tier forces this bundle regardless of
        // distribution regime, so tail stages drain small files.
        return StageParams {
            concurrency: 8,
            stage_byte_cap: remaining_bytes.saturating_sub(safety_margin),
            per_file_size_cap: Some((150 * GIB).min(remaining_bytes / 2)),
            order_by: OrderBy::None,
            cutoff_mode: "cautious",
            strategy_tag: "critical",
        };
    }

    match (tier, regime) {
        (Fresh, Light) => StageParams {
            concurrency: 8,
            stage_byte_cap: 375 * GIB,
            per_file_size_cap: Some(600 * GIB),
            order_by: OrderBy::SizeDesc,
            cutoff_mode: "cautious",
            strategy_tag: "fresh-light",
        },
        (Fresh, Balanced | Conservative) => StageParams {
            concurrency: 6,
            stage_byte_cap: 375 * GIB,
            per_file_size_cap: Some(450 * GIB),
            order_by: OrderBy::SizeDesc,
            cutoff_mode: "cautious",
            strategy_tag: "fresh-balanced",
        },
        (Fresh, Heavy) => StageParams {
            concurrency: 4,
            stage_byte_cap: 350 * GIB,
            per_file_size_cap: Some(250 * GIB),
            order_by: OrderBy::SizeDesc,
            cutoff_mode: "cautious",
            strategy_tag: "fresh-heavy",
        },
        (Fresh, UltraHeavy) => StageParams {
            concurrency: 2,
            stage_byte_cap: 300 * GIB,
            per_file_size_cap: Some(150 * GIB),
            order_by: OrderBy::SizeDesc,
            cutoff_mode: "cautious",
            strategy_tag: "fresh-ultra-heavy",
        },
        (Mid, Light) => StageParams {
            concurrency: 6,
            stage_byte_cap: 450 * GIB,
            per_file_size_cap: Some(450 * GIB),
            order_by: OrderBy::SizeDesc,
            cutoff_mode: "cautious",
            strategy_tag: "mid-light",
        },
        (Mid, Balanced | Conservative) => StageParams {
            concurrency: 5,
            stage_byte_cap: 450 * GIB,
            per_file_size_cap: Some(400 * GIB),
            order_by: OrderBy::SizeDesc,
            cutoff_mode: "cautious",
            strategy_tag: "mid-balanced",
        },
        (Mid, Heavy) => StageParams {
            concurrency: 4,
            stage_byte_cap: 450 * GIB,
            per_file_size_cap: Some(375 * GIB),
            order_by: OrderBy::SizeDesc,
            cutoff_mode: "cautious",
            strategy_tag: "mid-heavy",
        },
        (Mid, UltraHeavy) => StageParams {
            concurrency: 2,
            stage_byte_cap: 400 * GIB,
            per_file_size_cap: Some(150 * GIB),
            order_by: OrderBy::SizeDesc,
            cutoff_mode: "cautious",
            strategy_tag: "mid-ultra-heavy",
        },
        (Low, Light) => StageParams {
            concurrency: 6,
            stage_byte_cap: 250 * GIB,
            per_file_size_cap: Some(200 * GIB),
            order_by: OrderBy::SizeDesc,
            cutoff_mode: "cautious",
            strategy_tag: "low-light",
        },
        (Low, Balanced | Conservative) => StageParams {
            concurrency: 5,
            stage_byte_cap: 250 * GIB,
            per_file_size_cap: Some(150 * GIB),
            order_by: OrderBy::SizeDesc,
            cutoff_mode: "cautious",
            strategy_tag: "low-balanced",
        },
        (Low, Heavy) => StageParams {
            concurrency: 3,
            stage_byte_cap: 225 * GIB,
            per_file_size_cap: Some(100 * GIB),
            order_by: OrderBy::SizeDesc,
            cutoff_mode: "cautious",
            strategy_tag: "low-heavy",
        },
        (Low, UltraHeavy) => StageParams {
            concurrency: 2,
            stage_byte_cap: 200 * GIB,
            per_file_size_cap: Some(75 * GIB),
            order_by: OrderBy::SizeDesc,
            cutoff_mode: "cautious",
            strategy_tag: "low-ultra-heavy",
        },
        (Critical, _) => unreachable!("handled above"),
    }
}
