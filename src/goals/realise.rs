use anyhow::anyhow;

use crate::engine::{Context, GoalId, Step, Task};
use crate::store::StorePath;

/// Administration goal standing in for a requested derivation.
///
/// It takes over the derivation goal's error, so a failure is reported once,
/// under the name the caller asked for, even when several goals wait on the
/// same build.
pub struct RealiseGoal {
    drv: StorePath,
    goal: Option<GoalId>,
}

impl RealiseGoal {
    pub fn new(drv: StorePath) -> Self {
        Self { drv, goal: None }
    }
}

impl Task for RealiseGoal {
    fn resume(&mut self, cx: &mut Context<'_>) -> anyhow::Result<Step> {
        let Some(goal) = self.goal else {
            let goal = cx.make_derivation_goal(&self.drv);
            cx.set_preserve_exception(goal, true);
            self.goal = Some(goal);
            return Ok(Step::Await(vec![goal]));
        };

        let result = cx.build_result(goal).clone();
        cx.build_result_mut().built_outputs = result.built_outputs;

        // Another goal may already have taken the error itself
        let error = cx
            .take_error(goal)
            .or_else(|| result.error.map(|message| anyhow!(message)));

        Ok(Step::Done(result.exit_code, error))
    }
}
