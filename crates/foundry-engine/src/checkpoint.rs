use crate::artifacts::collect_generated_files;
use crate::types::{Build, BuildStatus, Checkpoint};
use chrono::Utc;
use foundry_core::{EngineError, EngineResult};
use tracing::info;

/// Checkpoint capture and rollback, operating under the build's write lock.
///
/// The checkpoint list is append-only with strictly increasing sequence
/// numbers; rollback truncates the list and restores progress, never
/// touching artifacts already applied externally.
impl Build {
    /// Snapshot the deduplicated artifact set and current progress.
    pub fn create_checkpoint(
        &mut self,
        name: impl Into<String>,
        description: impl Into<String>,
    ) -> Checkpoint {
        let files = collect_generated_files(self);
        let sequence = self.checkpoints.last().map_or(1, |c| c.sequence + 1);
        let checkpoint = Checkpoint {
            sequence,
            name: name.into(),
            description: description.into(),
            files,
            progress: self.progress,
            created_at: Utc::now(),
        };
        info!(
            build_id = %self.id,
            sequence,
            files = checkpoint.files.len(),
            "checkpoint created"
        );
        self.checkpoints.push(checkpoint.clone());
        self.touch();
        checkpoint
    }

    /// Truncate the checkpoint list to and including `sequence`, restore its
    /// progress, and force the build back to `InProgress`.
    ///
    /// Rollback is logical: files already written to a destination project
    /// are reconciled by the apply collaborator, not here. Terminal builds
    /// cannot be rolled back.
    pub fn rollback_to_checkpoint(&mut self, sequence: u32) -> EngineResult<Checkpoint> {
        if !self.is_active() {
            return Err(EngineError::BuildNotActive(self.id));
        }
        let index = self
            .checkpoints
            .iter()
            .position(|c| c.sequence == sequence)
            .ok_or_else(|| {
                EngineError::Config(format!(
                    "checkpoint {sequence} not found for build {}",
                    self.id
                ))
            })?;
        self.checkpoints.truncate(index + 1);
        #[allow(clippy::expect_used)]
        let checkpoint = self
            .checkpoints
            .last()
            .expect("truncate(index + 1) keeps the target")
            .clone();
        self.force_progress(checkpoint.progress);
        self.set_status(BuildStatus::InProgress);
        info!(build_id = %self.id, sequence, "rolled back to checkpoint");
        Ok(checkpoint)
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::types::{Agent, AgentRole, BuildRequest, Task, TaskOutput, TaskType};
    use foundry_core::{GeneratedFile, ProviderId};

    fn build_with_file() -> Build {
        let mut build = Build::new("owner", BuildRequest::new("app"));
        build.set_status(BuildStatus::InProgress);
        let agent = Agent::new(build.id, AgentRole::Backend, ProviderId::Gpt4);
        let agent_id = build.add_agent(agent);
        let task = Task::new(build.id, TaskType::GenerateApi, "api");
        let task_id = build.assign_task(agent_id, task).unwrap();
        build.mark_task_in_progress(task_id);
        build.mark_task_completed(
            task_id,
            TaskOutput {
                files: vec![GeneratedFile::new("src/api.ts", "export {}", "typescript")],
                messages: vec![],
            },
        );
        build
    }

    #[test]
    fn sequences_strictly_increase() {
        let mut build = build_with_file();
        let c1 = build.create_checkpoint("after schema", "");
        let c2 = build.create_checkpoint("after codegen", "");
        let c3 = build.create_checkpoint("after tests", "");
        assert_eq!((c1.sequence, c2.sequence, c3.sequence), (1, 2, 3));
    }

    #[test]
    fn checkpoint_captures_files_and_progress() {
        let mut build = build_with_file();
        build.set_progress(42);
        let checkpoint = build.create_checkpoint("mid-build", "desc");
        assert_eq!(checkpoint.progress, 42);
        assert_eq!(checkpoint.files.len(), 1);
        assert_eq!(checkpoint.files[0].path, "src/api.ts");
    }

    #[test]
    fn rollback_truncates_to_target() {
        let mut build = build_with_file();
        build.set_progress(30);
        build.create_checkpoint("one", "");
        build.set_progress(60);
        build.create_checkpoint("two", "");
        build.set_progress(90);
        build.create_checkpoint("three", "");
        build.set_status(BuildStatus::Reviewing);

        let restored = build.rollback_to_checkpoint(2).unwrap();
        assert_eq!(restored.sequence, 2);
        assert_eq!(build.checkpoints.len(), 2);
        assert_eq!(build.checkpoints.last().unwrap().sequence, 2);
        assert_eq!(build.progress, 60);
        assert_eq!(build.status, BuildStatus::InProgress);
    }

    #[test]
    fn rollback_to_latest_is_a_truncation_noop() {
        let mut build = build_with_file();
        build.create_checkpoint("only", "");
        let restored = build.rollback_to_checkpoint(1).unwrap();
        assert_eq!(restored.sequence, 1);
        assert_eq!(build.checkpoints.len(), 1);
    }

    #[test]
    fn rollback_unknown_sequence_fails() {
        let mut build = build_with_file();
        build.create_checkpoint("one", "");
        assert!(build.rollback_to_checkpoint(9).is_err());
        assert_eq!(build.checkpoints.len(), 1);
    }

    #[test]
    fn rollback_refused_on_terminal_build() {
        let mut build = build_with_file();
        build.create_checkpoint("one", "");
        build.set_status(BuildStatus::Failed);
        assert!(matches!(
            build.rollback_to_checkpoint(1),
            Err(EngineError::BuildNotActive(_))
        ));
    }

    #[test]
    fn sequence_continues_after_rollback() {
        let mut build = build_with_file();
        build.create_checkpoint("one", "");
        build.create_checkpoint("two", "");
        build.rollback_to_checkpoint(1).unwrap();
        let next = build.create_checkpoint("post-rollback", "");
        assert_eq!(next.sequence, 2);
    }
}
