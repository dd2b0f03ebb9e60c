use crate::config::ObjectConfig;
use crate::layout::sanitize;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectSpec {
    pub name: String,
    pub config: ObjectConfig,
}

/// One fetcher's share of the work: a contiguous slice of one org's objects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchJob {
    pub fetcher_id: String,
    pub org: String,
    pub shard_index: usize,
    pub comparison_id: String,
    pub objects: Vec<ObjectSpec>,
}

impl FetchJob {
    pub fn object_names(&self) -> Vec<String> {
        self.objects.iter().map(|o| o.name.clone()).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardPlan {
    pub fetcher_budget: usize,
    pub process_per_org: usize,
    pub org_count: usize,
    pub object_count: usize,
    pub jobs: Vec<FetchJob>,
}

/// `max(1, floor(budget / orgs))`
pub fn processes_per_org(fetcher_budget: usize, org_count: usize) -> usize {
    if org_count == 0 {
        return 1;
    }
    (fetcher_budget / org_count).max(1)
}

/// Split into at most `shards` contiguous slices of `ceil(len / shards)`
/// items; the last slice may be shorter. Never yields an empty slice.
pub fn split_into_shards<T: Clone>(items: &[T], shards: usize) -> Vec<Vec<T>> {
    if items.is_empty() {
        return Vec::new();
    }
    let shards = shards.max(1);
    let chunk_size = items.len().div_ceil(shards);
    items.chunks(chunk_size).map(|c| c.to_vec()).collect()
}

/// Deterministic assignment of (org, object) pairs to fetcher jobs.
pub fn plan_jobs(
    orgs: &[String],
    objects: &[(String, ObjectConfig)],
    comparison_id: &str,
    fetcher_budget: usize,
) -> ShardPlan {
    let process_per_org = processes_per_org(fetcher_budget, orgs.len());
    let specs: Vec<ObjectSpec> = objects
        .iter()
        .map(|(name, config)| ObjectSpec { name: name.clone(), config: config.clone() })
        .collect();

    let mut jobs = Vec::new();
    for org in orgs {
        for (shard_index, shard) in split_into_shards(&specs, process_per_org).into_iter().enumerate() {
            jobs.push(FetchJob {
                fetcher_id: format!("{}_{}", sanitize(org), shard_index),
                org: org.clone(),
                shard_index,
                comparison_id: comparison_id.to_string(),
                objects: shard,
            });
        }
    }

    ShardPlan {
        fetcher_budget,
        process_per_org,
        org_count: orgs.len(),
        object_count: objects.len(),
        jobs,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn objects(names: &[&str]) -> Vec<(String, ObjectConfig)> {
        names.iter().map(|n| (n.to_string(), ObjectConfig::default())).collect()
    }

    fn orgs(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn test_processes_per_org() {
        assert_eq!(processes_per_org(3, 3), 1);
        assert_eq!(processes_per_org(2, 1), 2);
        assert_eq!(processes_per_org(1, 5), 1);
        assert_eq!(processes_per_org(7, 2), 3);
    }

    #[test]
    fn test_three_orgs_two_objects_budget_three() {
        let plan = plan_jobs(&orgs(&["A", "B", "C"]), &objects(&["X", "Y"]), "cmp", 3);
        assert_eq!(plan.process_per_org, 1);
        assert_eq!(plan.jobs.len(), 3);
        for (job, org) in plan.jobs.iter().zip(["A", "B", "C"]) {
            assert_eq!(job.org, org);
            assert_eq!(job.object_names(), vec!["X", "Y"]);
            assert_eq!(job.shard_index, 0);
        }
    }

    #[test]
    fn test_one_org_three_objects_budget_two() {
        let plan = plan_jobs(&orgs(&["A"]), &objects(&["X", "Y", "Z"]), "cmp", 2);
        assert_eq!(plan.process_per_org, 2);
        let sizes: Vec<usize> = plan.jobs.iter().map(|j| j.objects.len()).collect();
        assert_eq!(sizes, vec![2, 1]);
        assert_eq!(plan.jobs[0].object_names(), vec!["X", "Y"]);
        assert_eq!(plan.jobs[1].object_names(), vec!["Z"]);
        assert_eq!(plan.jobs[0].fetcher_id, "A_0");
        assert_eq!(plan.jobs[1].fetcher_id, "A_1");
    }

    #[test]
    fn test_no_object_dropped_or_duplicated() {
        let names: Vec<String> = (0..13).map(|i| format!("Obj{}", i)).collect();
        let objs: Vec<(String, ObjectConfig)> =
            names.iter().map(|n| (n.clone(), ObjectConfig::default())).collect();
        for org_count in 1..=5 {
            let org_list: Vec<String> = (0..org_count).map(|i| format!("org{}", i)).collect();
            for budget in 1..=20 {
                let plan = plan_jobs(&org_list, &objs, "cmp", budget);
                assert_eq!(plan.process_per_org, (budget / org_count).max(1));
                for org in &org_list {
                    let assigned: Vec<String> = plan
                        .jobs
                        .iter()
                        .filter(|j| &j.org == org)
                        .flat_map(|j| j.object_names())
                        .collect();
                    assert_eq!(assigned, names, "org {} budget {}", org, budget);
                    assert!(plan.jobs.iter().filter(|j| &j.org == org).count() <= plan.process_per_org);
                }
            }
        }
    }

    #[test]
    fn test_plan_is_deterministic() {
        let o = orgs(&["dev@x.com", "qa@x.com"]);
        let objs = objects(&["A", "B", "C", "D", "E"]);
        assert_eq!(plan_jobs(&o, &objs, "cmp", 4), plan_jobs(&o, &objs, "cmp", 4));
    }

    #[test]
    fn test_more_shards_than_objects() {
        let shards = split_into_shards(&[1, 2], 5);
        assert_eq!(shards, vec![vec![1], vec![2]]);
        assert!(split_into_shards::<u8>(&[], 3).is_empty());
    }
}
