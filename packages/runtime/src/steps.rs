// ABOUTME: Step list controller tracking the status of each command of the pipeline
// ABOUTME: Steps are index-aligned with Commands and published on a watch channel

use tokio::sync::watch;
use tracing::warn;
use tutorbox_core::{Commands, Step, StepStatus};

#[derive(Debug)]
pub struct StepsController {
    steps: watch::Sender<Vec<Step>>,
}

impl Default for StepsController {
    fn default() -> Self {
        Self::new()
    }
}

impl StepsController {
    pub fn new() -> Self {
        let (steps, _) = watch::channel(Vec::new());
        Self { steps }
    }

    pub fn steps(&self) -> Vec<Step> {
        self.steps.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<Step>> {
        self.steps.subscribe()
    }

    /// One idle step per command, in order. No commands clears the list.
    pub fn set_from_commands(&self, commands: &Commands) {
        let steps = commands
            .iter()
            .map(|command| Step::new(command.title.clone(), StepStatus::Idle))
            .collect();
        self.steps.send_replace(steps);
    }

    /// Replace the step at `index`. Indexes past the end are ignored.
    pub fn update_step(&self, index: usize, step: Step) {
        self.steps.send_if_modified(|steps| match steps.get_mut(index) {
            Some(current) if *current != step => {
                *current = step;
                true
            }
            Some(_) => false,
            None => {
                warn!(index, len = steps.len(), "Ignoring update of unknown step");
                false
            }
        });
    }

    /// Set the status of the step at `index`, keeping its title.
    pub fn set_status(&self, index: usize, status: StepStatus) {
        let step = self.steps.borrow().get(index).map(|s| s.with_status(status));
        if let Some(step) = step {
            self.update_step(index, step);
        }
    }

    /// Mark every step at or after `index` as skipped.
    pub fn skip_remaining(&self, index: usize) {
        self.steps.send_if_modified(|steps| {
            let mut changed = false;
            for step in steps.iter_mut().skip(index) {
                if step.status != StepStatus::Skipped {
                    step.status = StepStatus::Skipped;
                    changed = true;
                }
            }
            changed
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tutorbox_core::Command;

    fn commands(n: usize) -> Commands {
        Commands::new(
            (0..n)
                .map(|i| Command::new(format!("cmd {}", i), format!("Step {}", i)))
                .collect(),
            None,
        )
    }

    fn statuses(controller: &StepsController) -> Vec<StepStatus> {
        controller.steps().iter().map(|s| s.status).collect()
    }

    #[test]
    fn test_one_idle_step_per_command() {
        let controller = StepsController::new();
        let commands = Commands::new(vec!["npm install".into()], Some("npm start".into()));
        controller.set_from_commands(&commands);

        assert_eq!(
            controller.steps(),
            vec![
                Step::new("npm install", StepStatus::Idle),
                Step::new("npm start", StepStatus::Idle),
            ]
        );

        controller.set_from_commands(&Commands::default());
        assert!(controller.steps().is_empty());
    }

    #[test]
    fn test_skip_remaining_leaves_prefix_untouched() {
        for n in 0..5 {
            for i in 0..=n {
                let controller = StepsController::new();
                controller.set_from_commands(&commands(n));
                if n > 0 {
                    controller.set_status(0, StepStatus::Completed);
                }

                controller.skip_remaining(i);

                let statuses = statuses(&controller);
                for (index, status) in statuses.iter().enumerate() {
                    if index >= i {
                        assert_eq!(*status, StepStatus::Skipped);
                    } else if index == 0 {
                        assert_eq!(*status, StepStatus::Completed);
                    } else {
                        assert_eq!(*status, StepStatus::Idle);
                    }
                }
            }
        }
    }

    #[test]
    fn test_update_step_out_of_range_is_ignored() {
        let controller = StepsController::new();
        controller.set_from_commands(&commands(1));
        controller.update_step(5, Step::new("ghost", StepStatus::Running));
        assert_eq!(statuses(&controller), vec![StepStatus::Idle]);
    }

    #[tokio::test]
    async fn test_updates_are_observable() {
        let controller = StepsController::new();
        controller.set_from_commands(&commands(2));
        let mut steps = controller.subscribe();
        steps.borrow_and_update();

        controller.set_status(0, StepStatus::Running);
        steps.changed().await.unwrap();
        assert_eq!(steps.borrow_and_update()[0].status, StepStatus::Running);

        controller.set_status(0, StepStatus::Running);
        assert!(!steps.has_changed().unwrap());
    }
}
