//! Queue allocation planning.
//!
//! [`plan`] turns a [`QueueDemand`] plus the hardware's queue-family
//! snapshot into a [`QueueAllocationPlan`]: how many queues to request
//! from each family and which roles those queues serve. Planning is a
//! pure function over the snapshot, so every policy here is unit
//! testable without a driver. The plan is consumed by
//! [`Device::create`](crate::device::Device::create).

use std::collections::BTreeMap;

use thiserror::Error;

use crate::device::QueueRole;
use crate::physical::QueueFamilyInfo;

/// How many queues the caller wants, and with which policy.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum QueueDemand {
    /// One compute-capable queue and one transfer-capable queue,
    /// sharing a single queue when a mixed family exists.
    #[default]
    Default,
    /// Every queue in every family.
    All,
    /// `n` independent streams, each pairing one compute-capable queue
    /// with one transfer-capable queue (one physical queue may serve
    /// both roles of a stream).
    Streams(u32),
    /// Caller-chosen families and index ranges.
    Explicit(Vec<QueueSpec>),
}

/// An explicit per-family queue range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueSpec {
    pub family_id: u32,
    pub first_index: u32,
    pub count: u32,
}

/// One family's share of an allocation plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanEntry {
    pub family_id: u32,
    pub count: u32,
    pub compute: bool,
    pub transfer: bool,
}

/// The queue counts and roles a logical device will be created with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueAllocationPlan {
    entries: Vec<PlanEntry>,
}

impl QueueAllocationPlan {
    pub fn entries(&self) -> &[PlanEntry] {
        &self.entries
    }

    /// Queues granted from `family_id`, zero if the family is not in
    /// the plan.
    pub fn granted(&self, family_id: u32) -> u32 {
        self.entries
            .iter()
            .find(|e| e.family_id == family_id)
            .map(|e| e.count)
            .unwrap_or(0)
    }

    pub fn total_compute(&self) -> u32 {
        self.entries
            .iter()
            .filter(|e| e.compute)
            .map(|e| e.count)
            .sum()
    }

    pub fn total_transfer(&self) -> u32 {
        self.entries
            .iter()
            .filter(|e| e.transfer)
            .map(|e| e.count)
            .sum()
    }

    /// Merge with `other`: per family the granted count is the maximum
    /// of the two plans and roles are unioned. Merging a plan with
    /// itself yields the plan unchanged.
    pub fn merge(&self, other: &QueueAllocationPlan) -> QueueAllocationPlan {
        let mut by_family: BTreeMap<u32, PlanEntry> = BTreeMap::new();
        for e in self.entries.iter().chain(other.entries.iter()) {
            by_family
                .entry(e.family_id)
                .and_modify(|m| {
                    m.count = m.count.max(e.count);
                    m.compute |= e.compute;
                    m.transfer |= e.transfer;
                })
                .or_insert(*e);
        }
        QueueAllocationPlan {
            entries: by_family.into_values().collect(),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PlanQueuesError {
    #[error("Device reports no compute-capable queue family")]
    NoComputeFamily,
    #[error(
        "Queue family {family_id} has {available} queue(s), demand requires {requested}"
    )]
    InsufficientQueues {
        family_id: u32,
        requested: u32,
        available: u32,
    },
    #[error("Device reports no queue family with id {family_id}")]
    UnknownFamily { family_id: u32 },
    #[error(
        "Device offers {available} {role:?}-capable queue(s), demand requires {needed}"
    )]
    InsufficientCapacity {
        role: QueueRole,
        needed: u32,
        available: u32,
    },
}

/// Plan queue allocation for `demand` against the family snapshot.
///
/// A demand that cannot be satisfied in full fails; counts are never
/// silently clamped.
pub fn plan(
    families: &[QueueFamilyInfo],
    demand: &QueueDemand,
) -> Result<QueueAllocationPlan, PlanQueuesError> {
    match demand {
        QueueDemand::Default => plan_default(families),
        QueueDemand::All => Ok(plan_all(families)),
        QueueDemand::Streams(n) => plan_streams(families, *n),
        QueueDemand::Explicit(specs) => plan_explicit(families, specs),
    }
}

fn plan_default(
    families: &[QueueFamilyInfo],
) -> Result<QueueAllocationPlan, PlanQueuesError> {
    // Prefer one queue from the lowest-id mixed family.
    if let Some(mixed) = families
        .iter()
        .find(|f| f.is_mixed() && f.queue_count > 0)
    {
        return Ok(QueueAllocationPlan {
            entries: vec![PlanEntry {
                family_id: mixed.family_id,
                count: 1,
                compute: true,
                transfer: true,
            }],
        });
    }

    let compute = families
        .iter()
        .find(|f| f.can_compute && f.queue_count > 0)
        .ok_or(PlanQueuesError::NoComputeFamily)?;
    // Compute implies transfer, so a transfer family always exists
    // here; it just happens to be a different one than any mixed pick.
    let transfer = families
        .iter()
        .find(|f| f.can_transfer && f.queue_count > 0)
        .ok_or(PlanQueuesError::NoComputeFamily)?;

    let mut entries = vec![PlanEntry {
        family_id: compute.family_id,
        count: 1,
        compute: true,
        transfer: compute.can_transfer,
    }];
    if transfer.family_id != compute.family_id {
        entries.push(PlanEntry {
            family_id: transfer.family_id,
            count: 1,
            compute: transfer.can_compute,
            transfer: true,
        });
        entries.sort_by_key(|e| e.family_id);
    }
    Ok(QueueAllocationPlan { entries })
}

fn plan_all(families: &[QueueFamilyInfo]) -> QueueAllocationPlan {
    QueueAllocationPlan {
        entries: families
            .iter()
            .filter(|f| f.queue_count > 0)
            .map(|f| PlanEntry {
                family_id: f.family_id,
                count: f.queue_count,
                compute: f.can_compute,
                transfer: f.can_transfer,
            })
            .collect(),
    }
}

fn plan_streams(
    families: &[QueueFamilyInfo],
    n: u32,
) -> Result<QueueAllocationPlan, PlanQueuesError> {
    // Zero streams need zero queues, even on a device with no
    // compute-capable family at all.
    if n == 0 {
        return Ok(QueueAllocationPlan { entries: Vec::new() });
    }
    let compute_cap: u32 = families
        .iter()
        .filter(|f| f.can_compute)
        .map(|f| f.queue_count)
        .sum();
    let transfer_cap: u32 = families
        .iter()
        .filter(|f| f.can_transfer)
        .map(|f| f.queue_count)
        .sum();
    if compute_cap == 0 {
        return Err(PlanQueuesError::NoComputeFamily);
    }
    if compute_cap < n {
        return Err(PlanQueuesError::InsufficientCapacity {
            role: QueueRole::Compute,
            needed: n,
            available: compute_cap,
        });
    }
    if transfer_cap < n {
        return Err(PlanQueuesError::InsufficientCapacity {
            role: QueueRole::Transfer,
            needed: n,
            available: transfer_cap,
        });
    }

    // A queue in a mixed family covers both halves of a stream, so
    // satisfy as many streams as possible from mixed families first,
    // lowest family id first, then split the remainder across
    // single-role families.
    let mut entries = Vec::new();
    let mut remaining = n;
    for f in families.iter().filter(|f| f.is_mixed()) {
        if remaining == 0 {
            break;
        }
        let take = remaining.min(f.queue_count);
        if take > 0 {
            entries.push(PlanEntry {
                family_id: f.family_id,
                count: take,
                compute: true,
                transfer: true,
            });
            remaining -= take;
        }
    }

    let mut need_compute = remaining;
    for f in families.iter().filter(|f| f.can_compute && !f.is_mixed()) {
        if need_compute == 0 {
            break;
        }
        let take = need_compute.min(f.queue_count);
        if take > 0 {
            entries.push(PlanEntry {
                family_id: f.family_id,
                count: take,
                compute: true,
                transfer: false,
            });
            need_compute -= take;
        }
    }

    let mut need_transfer = remaining;
    for f in families.iter().filter(|f| f.can_transfer && !f.is_mixed()) {
        if need_transfer == 0 {
            break;
        }
        let take = need_transfer.min(f.queue_count);
        if take > 0 {
            entries.push(PlanEntry {
                family_id: f.family_id,
                count: take,
                compute: false,
                transfer: true,
            });
            need_transfer -= take;
        }
    }

    // The capacity prechecks cover the remainder: every non-mixed
    // compute queue counts toward compute_cap and nothing else, so
    // compute_cap - mixed capacity >= remaining (same for transfer).
    debug_assert_eq!(need_compute, 0);
    debug_assert_eq!(need_transfer, 0);

    entries.sort_by_key(|e| e.family_id);
    Ok(QueueAllocationPlan { entries })
}

fn plan_explicit(
    families: &[QueueFamilyInfo],
    specs: &[QueueSpec],
) -> Result<QueueAllocationPlan, PlanQueuesError> {
    let mut by_family: BTreeMap<u32, u32> = BTreeMap::new();
    for spec in specs {
        let family = families
            .iter()
            .find(|f| f.family_id == spec.family_id)
            .ok_or(PlanQueuesError::UnknownFamily {
                family_id: spec.family_id,
            })?;
        let end = spec.first_index.checked_add(spec.count).ok_or(
            PlanQueuesError::InsufficientQueues {
                family_id: spec.family_id,
                requested: u32::MAX,
                available: family.queue_count,
            },
        )?;
        if end > family.queue_count {
            return Err(PlanQueuesError::InsufficientQueues {
                family_id: spec.family_id,
                requested: end,
                available: family.queue_count,
            });
        }
        // The plan must cover the highest index any spec touches.
        let granted = by_family.entry(spec.family_id).or_insert(0);
        *granted = (*granted).max(end);
    }

    let entries = by_family
        .into_iter()
        .filter(|&(_, count)| count > 0)
        .map(|(family_id, count)| {
            // Family lookup succeeded above for every spec.
            let family = families
                .iter()
                .find(|f| f.family_id == family_id)
                .copied()
                .unwrap_or(QueueFamilyInfo {
                    family_id,
                    queue_count: 0,
                    can_compute: false,
                    can_transfer: false,
                });
            PlanEntry {
                family_id,
                count,
                compute: family.can_compute,
                transfer: family.can_transfer,
            }
        })
        .collect();
    Ok(QueueAllocationPlan { entries })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(
        family_id: u32,
        queue_count: u32,
        can_compute: bool,
        can_transfer: bool,
    ) -> QueueFamilyInfo {
        QueueFamilyInfo {
            family_id,
            queue_count,
            can_compute,
            can_transfer,
        }
    }

    #[test]
    fn default_prefers_lowest_mixed_family() {
        let families = [
            family(0, 2, false, true),
            family(1, 4, true, true),
            family(2, 1, true, true),
        ];
        let plan = plan(&families, &QueueDemand::Default).unwrap();

        assert_eq!(
            plan.entries(),
            &[PlanEntry {
                family_id: 1,
                count: 1,
                compute: true,
                transfer: true,
            }]
        );
    }

    #[test]
    fn default_fails_without_compute_family() {
        let families = [family(0, 2, false, true)];
        assert_eq!(
            plan(&families, &QueueDemand::Default).unwrap_err(),
            PlanQueuesError::NoComputeFamily
        );
    }

    #[test]
    fn all_takes_every_queue() {
        let families = [
            family(0, 4, true, true),
            family(1, 0, true, true),
            family(2, 2, false, true),
        ];
        let plan = plan(&families, &QueueDemand::All).unwrap();

        assert_eq!(plan.granted(0), 4);
        assert_eq!(plan.granted(1), 0);
        assert_eq!(plan.granted(2), 2);
        assert_eq!(plan.total_compute(), 4);
        assert_eq!(plan.total_transfer(), 6);
    }

    #[test]
    fn streams_pairs_from_mixed_family() {
        let families = [family(0, 4, true, true)];
        let plan = plan(&families, &QueueDemand::Streams(3)).unwrap();

        assert_eq!(plan.granted(0), 3);
        assert_eq!(plan.total_compute(), 3);
        assert_eq!(plan.total_transfer(), 3);
    }

    #[test]
    fn streams_splits_remainder_across_single_role_families() {
        let families = [
            family(0, 2, true, true),
            family(1, 2, true, false),
            family(2, 2, false, true),
        ];
        let plan = plan(&families, &QueueDemand::Streams(4)).unwrap();

        assert_eq!(plan.granted(0), 2);
        assert_eq!(plan.granted(1), 2);
        assert_eq!(plan.granted(2), 2);
        assert_eq!(plan.total_compute(), 4);
        assert_eq!(plan.total_transfer(), 4);
    }

    #[test]
    fn streams_fails_when_compute_capacity_is_short() {
        // 2 mixed + 2 transfer-only cannot yield 4 compute-capable
        // queues even though 4 transfer-capable queues exist.
        let families = [
            family(0, 2, true, true),
            family(1, 2, false, true),
        ];
        assert_eq!(
            plan(&families, &QueueDemand::Streams(4)).unwrap_err(),
            PlanQueuesError::InsufficientCapacity {
                role: QueueRole::Compute,
                needed: 4,
                available: 2,
            }
        );
    }

    #[test]
    fn streams_zero_is_an_empty_plan() {
        let families = [family(0, 4, true, true)];
        let plan = plan(&families, &QueueDemand::Streams(0)).unwrap();
        assert!(plan.entries().is_empty());
    }

    #[test]
    fn streams_zero_needs_no_compute_family() {
        let families = [family(0, 2, false, true)];
        let empty_plan = plan(&families, &QueueDemand::Streams(0)).unwrap();
        assert!(empty_plan.entries().is_empty());

        let err = plan(&families, &QueueDemand::Streams(1)).unwrap_err();
        assert!(matches!(err, PlanQueuesError::NoComputeFamily));
    }

    #[test]
    fn explicit_covers_highest_touched_index() {
        let families = [family(0, 8, true, true)];
        let specs = vec![
            QueueSpec {
                family_id: 0,
                first_index: 2,
                count: 2,
            },
            QueueSpec {
                family_id: 0,
                first_index: 0,
                count: 1,
            },
        ];
        let plan = plan(&families, &QueueDemand::Explicit(specs)).unwrap();

        // Index 3 is the highest touched, so 4 queues must exist.
        assert_eq!(plan.granted(0), 4);
    }

    #[test]
    fn explicit_rejects_out_of_range_span() {
        let families = [family(0, 2, true, true)];
        let specs = vec![QueueSpec {
            family_id: 0,
            first_index: 1,
            count: 2,
        }];
        assert_eq!(
            plan(&families, &QueueDemand::Explicit(specs)).unwrap_err(),
            PlanQueuesError::InsufficientQueues {
                family_id: 0,
                requested: 3,
                available: 2,
            }
        );
    }

    #[test]
    fn explicit_rejects_unknown_family() {
        let families = [family(0, 2, true, true)];
        let specs = vec![QueueSpec {
            family_id: 5,
            first_index: 0,
            count: 1,
        }];
        assert_eq!(
            plan(&families, &QueueDemand::Explicit(specs)).unwrap_err(),
            PlanQueuesError::UnknownFamily { family_id: 5 }
        );
    }

    #[test]
    fn merge_takes_per_family_maximum_and_unions_roles() {
        let a = QueueAllocationPlan {
            entries: vec![
                PlanEntry {
                    family_id: 0,
                    count: 2,
                    compute: true,
                    transfer: false,
                },
                PlanEntry {
                    family_id: 1,
                    count: 1,
                    compute: false,
                    transfer: true,
                },
            ],
        };
        let b = QueueAllocationPlan {
            entries: vec![PlanEntry {
                family_id: 0,
                count: 1,
                compute: false,
                transfer: true,
            }],
        };
        let merged = a.merge(&b);

        assert_eq!(merged.granted(0), 2);
        assert_eq!(merged.granted(1), 1);
        let f0 = merged.entries().iter().find(|e| e.family_id == 0).unwrap();
        assert!(f0.compute && f0.transfer);
        assert_eq!(a.merge(&a), a);
    }
}
