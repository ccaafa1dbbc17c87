//! Concurrency scheduler for one model turn's tool calls.
//!
//! `plan_batch` splits the batch by target-file ownership: a call runs in
//! the parallel group only when it derives target paths, is not a mutation,
//! and touches no path already claimed earlier in the batch. Everything else
//! runs afterwards, one at a time, in submission order. Two calls in the
//! parallel group never share a target path.

use std::collections::HashSet;
use std::future::Future;

use forge_protocol::ToolCall;
use forge_protocol::ToolInput;
use futures::future::join_all;
use tracing::debug;

#[derive(Clone, Debug, PartialEq)]
pub struct PlannedCall {
    /// Position in the model's batch.
    pub index: usize,
    pub call: ToolCall,
    /// `None` when the input failed to parse; the dispatcher reports why.
    pub input: Option<ToolInput>,
    pub paths: Vec<String>,
}

impl PlannedCall {
    pub fn is_delegate(&self) -> bool {
        matches!(self.input, Some(ToolInput::Delegate { .. }))
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct BatchPlan {
    pub parallel: Vec<PlannedCall>,
    pub sequential: Vec<PlannedCall>,
}

impl BatchPlan {
    pub fn len(&self) -> usize {
        self.parallel.len() + self.sequential.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Parallel delegations, which get their own worktrees when there is
    /// more than one.
    pub fn parallel_delegates(&self) -> usize {
        self.parallel.iter().filter(|call| call.is_delegate()).count()
    }
}

pub fn plan_batch(calls: &[ToolCall]) -> BatchPlan {
    let mut claimed: HashSet<String> = HashSet::new();
    let mut plan = BatchPlan::default();

    for (index, call) in calls.iter().enumerate() {
        let input = call.parse().ok();
        let paths = input.as_ref().map(ToolInput::target_paths).unwrap_or_default();
        let is_mutation = input.as_ref().is_some_and(ToolInput::is_mutation);
        let is_pattern = input.as_ref().is_some_and(ToolInput::is_pattern_based);
        let overlaps = paths.iter().any(|path| claimed.contains(path));
        let sequential =
            input.is_none() || paths.is_empty() || is_mutation || is_pattern || overlaps;
        claimed.extend(paths.iter().cloned());

        let planned = PlannedCall {
            index,
            call: call.clone(),
            input,
            paths,
        };
        if sequential {
            plan.sequential.push(planned);
        } else {
            plan.parallel.push(planned);
        }
    }

    debug!(
        parallel = plan.parallel.len(),
        sequential = plan.sequential.len(),
        "planned tool batch"
    );
    plan
}

/// Runs the parallel group in chunks of `fan_out`, then the sequential
/// group in order. Results come back in batch order.
pub async fn execute_plan<'a, T, F, Fut>(plan: &'a BatchPlan, fan_out: usize, run: F) -> Vec<T>
where
    F: Fn(&'a PlannedCall) -> Fut,
    Fut: Future<Output = T>,
{
    let mut results: Vec<(usize, T)> = Vec::with_capacity(plan.len());
    for chunk in plan.parallel.chunks(fan_out.max(1)) {
        let outputs = join_all(chunk.iter().map(&run)).await;
        results.extend(chunk.iter().map(|planned| planned.index).zip(outputs));
    }
    for planned in &plan.sequential {
        let output = run(planned).await;
        results.push((planned.index, output));
    }
    results.sort_by_key(|(index, _)| *index);
    results.into_iter().map(|(_, output)| output).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use serde_json::json;
    use std::sync::Arc;
    use std::sync::Mutex;
    use std::time::Duration;

    fn read(id: &str, path: &str) -> ToolCall {
        ToolCall::new(id, "read_file", json!({ "path": path }))
    }

    fn edit(id: &str, path: &str) -> ToolCall {
        ToolCall::new(id, "edit_file", json!({ "path": path, "old_text": "a", "new_text": "b" }))
    }

    fn indices(calls: &[PlannedCall]) -> Vec<usize> {
        calls.iter().map(|call| call.index).collect()
    }

    #[test]
    fn test_disjoint_reads_run_in_parallel() {
        let plan = plan_batch(&[
            read("1", "a.liquid"),
            read("2", "b.liquid"),
            read("3", "./a.liquid"),
        ]);
        assert_eq!(indices(&plan.parallel), vec![0, 1]);
        assert_eq!(indices(&plan.sequential), vec![2]);
    }

    #[test]
    fn test_mutations_and_patterns_are_sequential() {
        let plan = plan_batch(&[
            edit("1", "a.liquid"),
            read("2", "a.liquid"),
            ToolCall::new("3", "grep", json!({ "pattern": "x" })),
            ToolCall::new("4", "read_file", json!({})),
            read("5", "b.liquid"),
            ToolCall::new("6", "grep", json!({ "pattern": "x", "path": "c.liquid" })),
            read("7", "c.liquid"),
        ]);
        assert_eq!(indices(&plan.parallel), vec![4]);
        assert_eq!(indices(&plan.sequential), vec![0, 1, 2, 3, 5, 6]);
    }

    #[test]
    fn test_delegates_claim_their_files() {
        let plan = plan_batch(&[
            ToolCall::new("1", "delegate", json!({ "task": "header", "files": ["a.liquid"] })),
            ToolCall::new("2", "delegate", json!({ "task": "footer", "files": ["b.liquid"] })),
            ToolCall::new(
                "3",
                "delegate",
                json!({ "task": "both", "files": ["b.liquid", "c.liquid"] }),
            ),
        ]);
        assert_eq!(plan.parallel_delegates(), 2);
        assert_eq!(indices(&plan.sequential), vec![2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_plan_orders_results_and_bounds_fan_out() {
        let calls: Vec<ToolCall> = (0..5)
            .map(|i| read(&i.to_string(), &format!("f{i}.liquid")))
            .chain([edit("e", "f0.liquid")])
            .collect();
        let plan = plan_batch(&calls);
        let in_flight = Arc::new(Mutex::new((0usize, 0usize)));

        let results = execute_plan(&plan, 2, |planned| {
            let in_flight = Arc::clone(&in_flight);
            async move {
                {
                    let mut guard = in_flight.lock().unwrap();
                    guard.0 += 1;
                    guard.1 = guard.1.max(guard.0);
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
                in_flight.lock().unwrap().0 -= 1;
                planned.call.id.clone()
            }
        })
        .await;

        assert_eq!(results, vec!["0", "1", "2", "3", "4", "e"]);
        assert_eq!(in_flight.lock().unwrap().1, 2);
    }

    fn arb_call() -> impl Strategy<Value = ToolCall> {
        let path = prop::sample::select(vec!["a.liquid", "b.liquid", "c.liquid", "d.liquid"]);
        (0u8..5, path.clone(), path).prop_map(|(kind, first, second)| match kind {
            0 => read("r", first),
            1 => edit("e", first),
            2 => ToolCall::new("g", "grep", json!({ "pattern": "x", "path": first })),
            3 => ToolCall::new("s", "search_files", json!({ "pattern": "x" })),
            _ => ToolCall::new("d", "delegate", json!({ "task": "t", "files": [first, second] })),
        })
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn parallel_calls_never_share_a_path(calls in prop::collection::vec(arb_call(), 0..12)) {
            let plan = plan_batch(&calls);
            let mut seen = HashSet::new();
            for planned in &plan.parallel {
                for path in &planned.paths {
                    prop_assert!(seen.insert(path.clone()), "{path} scheduled twice in parallel");
                }
                prop_assert!(!planned.input.as_ref().is_some_and(ToolInput::is_mutation));
            }
            let mut all: Vec<usize> = indices(&plan.parallel);
            all.extend(indices(&plan.sequential));
            all.sort_unstable();
            prop_assert_eq!(all, (0..calls.len()).collect::<Vec<_>>());
        }
    }
}
