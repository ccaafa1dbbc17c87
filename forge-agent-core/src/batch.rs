//! Runs one model turn's tool calls through the scheduler.
//!
//! When more than one delegation lands in the parallel group, each gets a
//! worktree forked from the current store content. The parallel group runs
//! first, the worktrees are merged back, then the sequential group runs
//! against the merged store.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::sync::Arc;

use forge_core::FileAccess;
use forge_core::FileStore;
use forge_core::ToolContext;
use forge_core::ToolDispatcher;
use forge_core::WorktreeManager;
use forge_core::scheduler::BatchPlan;
use forge_core::scheduler::PlannedCall;
use forge_core::scheduler::execute_plan;
use forge_core::scheduler::plan_batch;
use forge_core::tools::DispatchResult;
use forge_core::worktree::MergeReport;
use forge_core::worktree::Worktree;
use forge_protocol::ToolCall;
use forge_protocol::tools;
use forge_protocol::tools::normalize_path;
use tracing::debug;

pub struct BatchRunner<'a> {
    pub dispatcher: &'a ToolDispatcher,
    pub store: &'a Arc<FileStore>,
    pub worktrees: &'a WorktreeManager,
    /// Context of the agent that issued the batch.
    pub ctx: &'a ToolContext,
    pub fan_out: usize,
}

#[derive(Debug, Default)]
pub struct BatchOutcome {
    /// One result per call, in batch order.
    pub results: Vec<DispatchResult>,
    pub merge: Option<MergeReport>,
    /// Agent that last changed each path in this batch.
    pub touched_by: BTreeMap<String, String>,
}

/// Name a delegate call runs under.
pub fn delegate_agent(call: &ToolCall) -> String {
    format!("delegate-{}", call.id)
}

impl BatchRunner<'_> {
    pub async fn run(&self, calls: &[ToolCall]) -> forge_core::Result<BatchOutcome> {
        let plan = plan_batch(calls);
        if plan.parallel_delegates() > 1 {
            self.run_isolated(plan).await
        } else {
            let shared: Arc<dyn FileAccess> = self.store.clone();
            let results = execute_plan(&plan, self.fan_out, |planned| {
                let ctx = self.context_for(planned, &shared);
                async move { self.dispatcher.dispatch(&planned.call, &ctx).await }
            })
            .await;
            let mut outcome = BatchOutcome::default();
            self.collect(&mut outcome, results, &BTreeSet::new());
            Ok(outcome)
        }
    }

    fn context_for(&self, planned: &PlannedCall, files: &Arc<dyn FileAccess>) -> ToolContext {
        if planned.is_delegate() {
            self.ctx.for_agent(delegate_agent(&planned.call), Arc::clone(files))
        } else {
            self.ctx.clone()
        }
    }

    async fn run_isolated(&self, plan: BatchPlan) -> forge_core::Result<BatchOutcome> {
        let delegates: Vec<&PlannedCall> = plan
            .parallel
            .iter()
            .filter(|planned| planned.is_delegate())
            .collect();
        let agents: Vec<String> = delegates
            .iter()
            .map(|planned| delegate_agent(&planned.call))
            .collect();
        let forked = self.worktrees.fork(self.store, &agents).await?;
        let by_index: HashMap<usize, Arc<Worktree>> = delegates
            .iter()
            .map(|planned| planned.index)
            .zip(forked.iter().cloned())
            .collect();
        debug!(worktrees = forked.len(), "running parallel delegates in worktrees");

        let shared: Arc<dyn FileAccess> = self.store.clone();
        let parallel = BatchPlan {
            parallel: plan.parallel.clone(),
            sequential: Vec::new(),
        };
        let mut results = execute_plan(&parallel, self.fan_out, |planned| {
            let files = match by_index.get(&planned.index) {
                Some(worktree) => Arc::clone(worktree) as Arc<dyn FileAccess>,
                None => Arc::clone(&shared),
            };
            let ctx = self.context_for(planned, &files);
            async move { (planned.index, self.dispatcher.dispatch(&planned.call, &ctx).await) }
        })
        .await;

        let report = self.worktrees.merge(self.store, &forked).await?;

        let sequential = BatchPlan {
            parallel: Vec::new(),
            sequential: plan.sequential.clone(),
        };
        let later = execute_plan(&sequential, self.fan_out, |planned| {
            let ctx = self.context_for(planned, &shared);
            async move { (planned.index, self.dispatcher.dispatch(&planned.call, &ctx).await) }
        })
        .await;
        results.extend(later);
        results.sort_by_key(|(index, _)| *index);

        let isolated: BTreeSet<String> = delegates
            .iter()
            .map(|planned| planned.call.id.clone())
            .collect();
        let mut outcome = BatchOutcome::default();
        for applied in &report.applied {
            outcome.touched_by.insert(applied.path.clone(), applied.agent.clone());
        }
        self.collect(
            &mut outcome,
            results.into_iter().map(|(_, result)| result).collect(),
            &isolated,
        );
        outcome.merge = Some(report);
        Ok(outcome)
    }

    /// Records which agent touched each path. Worktree delegates are
    /// already covered by the merge report.
    fn collect(
        &self,
        outcome: &mut BatchOutcome,
        results: Vec<DispatchResult>,
        isolated: &BTreeSet<String>,
    ) {
        for result in results
            .iter()
            .filter(|result| !result.is_error() && !isolated.contains(&result.call_id))
        {
            let agent = if result.tool == tools::DELEGATE {
                format!("delegate-{}", result.call_id)
            } else {
                self.ctx.agent.clone()
            };
            for path in &result.output.touched {
                outcome.touched_by.insert(normalize_path(path), agent.clone());
            }
        }
        outcome.results = results;
    }
}
