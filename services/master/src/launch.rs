//! Validation of a framework's launch request against the offer it uses.
//!
//! A launch is all-or-nothing: either every task in the batch is valid and
//! fits in the offer together with the executors it starts, or nothing is
//! launched.

use std::collections::{HashMap, HashSet};

use corral_id::{ExecutorId, OfferId, SlaveId, TaskId};
use corral_protocol::{ExecutorInfo, Offer, TaskInfo};
use corral_resources::{ResourceError, Resources};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum LaunchError {
    #[error("Task launched with invalid offer {0}")]
    UnknownOffer(OfferId),

    #[error("Task {task_id} targets slave {actual} but the offer is for slave {expected}")]
    WrongSlave {
        task_id: TaskId,
        expected: SlaveId,
        actual: SlaveId,
    },

    #[error("Task {0} uses a duplicate task ID")]
    DuplicateTaskId(TaskId),

    #[error("Task {0} should have either CommandInfo or ExecutorInfo present but not both")]
    ExecutorAndCommand(TaskId),

    #[error("Task {0} has neither CommandInfo nor ExecutorInfo")]
    NeitherExecutorNorCommand(TaskId),

    #[error("Task {task_id} has an ExecutorInfo for {executor_id} that differs from the running executor")]
    ExecutorMismatch {
        task_id: TaskId,
        executor_id: ExecutorId,
    },

    #[error("Task uses more resources ({requested}) than available in the offer ({offered})")]
    InsufficientResources {
        requested: Resources,
        offered: Resources,
    },

    #[error("Task uses invalid resources: {0}")]
    InvalidResources(#[from] ResourceError),
}

/// Outcome of a valid launch.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchPlan {
    /// Task resources plus resources of executors started by this batch.
    pub consumed: Resources,
    /// What is left of the offer; returned to the allocator.
    pub remaining: Resources,
    /// Executors not yet running on the slave, each listed once.
    pub new_executors: Vec<ExecutorInfo>,
}

/// Check `tasks` against `offer`.
///
/// `known_tasks` are IDs the framework already uses; `running_executors` are
/// the framework's executors on the offer's slave.
pub fn validate_launch(
    offer: &Offer,
    tasks: &[TaskInfo],
    known_tasks: &HashSet<TaskId>,
    running_executors: Option<&HashMap<ExecutorId, ExecutorInfo>>,
) -> Result<LaunchPlan, LaunchError> {
    let mut seen: HashSet<&TaskId> = HashSet::with_capacity(tasks.len());
    let mut new_executors: Vec<ExecutorInfo> = Vec::new();
    let mut consumed = Resources::new();

    for task in tasks {
        if task.slave_id != offer.slave_id {
            return Err(LaunchError::WrongSlave {
                task_id: task.task_id.clone(),
                expected: offer.slave_id,
                actual: task.slave_id,
            });
        }

        if known_tasks.contains(&task.task_id) || !seen.insert(&task.task_id) {
            return Err(LaunchError::DuplicateTaskId(task.task_id.clone()));
        }

        match (&task.executor, &task.command) {
            (Some(_), Some(_)) => {
                return Err(LaunchError::ExecutorAndCommand(task.task_id.clone()));
            }
            (None, None) => {
                return Err(LaunchError::NeitherExecutorNorCommand(task.task_id.clone()));
            }
            (None, Some(_)) => {}
            (Some(executor), None) => {
                let running = running_executors.and_then(|e| e.get(&executor.executor_id));
                let pending = new_executors
                    .iter()
                    .find(|e| e.executor_id == executor.executor_id);
                match running.or(pending) {
                    Some(existing) if existing != executor => {
                        return Err(LaunchError::ExecutorMismatch {
                            task_id: task.task_id.clone(),
                            executor_id: executor.executor_id.clone(),
                        });
                    }
                    Some(_) => {}
                    None => {
                        consumed.try_add_assign(&executor.resources)?;
                        new_executors.push(executor.clone());
                    }
                }
            }
        }

        consumed.try_add_assign(&task.resources)?;
    }

    if !offer.resources.contains(&consumed) {
        return Err(LaunchError::InsufficientResources {
            requested: consumed,
            offered: offer.resources.clone(),
        });
    }
    let remaining = offer.resources.checked_sub(&consumed)?;

    Ok(LaunchPlan {
        consumed,
        remaining,
        new_executors,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use corral_id::FrameworkId;
    use rstest::rstest;

    fn r(text: &str) -> Resources {
        Resources::parse(text).unwrap()
    }

    fn offer(resources: &str) -> Offer {
        Offer {
            id: OfferId::new(),
            framework_id: FrameworkId::new(),
            slave_id: SlaveId::new(),
            hostname: "host1".into(),
            resources: r(resources),
        }
    }

    fn tid(s: &str) -> TaskId {
        TaskId::parse(s).unwrap()
    }

    fn executor(id: &str, resources: &str) -> ExecutorInfo {
        ExecutorInfo {
            executor_id: ExecutorId::parse(id).unwrap(),
            command: "exec".into(),
            resources: r(resources),
        }
    }

    fn command_task(offer: &Offer, id: &str, resources: &str) -> TaskInfo {
        TaskInfo::command(tid(id), offer.slave_id, r(resources), "sleep 10")
    }

    #[test]
    fn test_partial_use_returns_remainder() {
        let offer = offer("cpus:4;mem:1024;ports:[1-10]");
        let tasks = vec![command_task(&offer, "t1", "cpus:1;mem:256;ports:[1-2]")];
        let plan = validate_launch(&offer, &tasks, &HashSet::new(), None).unwrap();
        assert_eq!(plan.consumed, r("cpus:1;mem:256;ports:[1-2]"));
        assert_eq!(plan.remaining, r("cpus:3;mem:768;ports:[3-10]"));
        assert!(plan.new_executors.is_empty());
    }

    #[test]
    fn test_new_executor_counted_once() {
        let offer = offer("cpus:2;mem:1024");
        let exec = executor("e1", "cpus:0.5;mem:128");
        let tasks = vec![
            TaskInfo::with_executor(tid("t1"), offer.slave_id, r("cpus:0.5"), exec.clone()),
            TaskInfo::with_executor(tid("t2"), offer.slave_id, r("cpus:0.5"), exec.clone()),
        ];
        let plan = validate_launch(&offer, &tasks, &HashSet::new(), None).unwrap();
        assert_eq!(plan.consumed, r("cpus:1.5;mem:128"));
        assert_eq!(plan.new_executors, vec![exec]);
    }

    #[test]
    fn test_running_executor_is_free() {
        let offer = offer("cpus:1");
        let exec = executor("e1", "cpus:0.5");
        let running = HashMap::from([(exec.executor_id.clone(), exec.clone())]);
        let tasks = vec![TaskInfo::with_executor(tid("t1"), offer.slave_id, r("cpus:1"), exec)];
        let plan = validate_launch(&offer, &tasks, &HashSet::new(), Some(&running)).unwrap();
        assert!(plan.remaining.is_empty());
        assert!(plan.new_executors.is_empty());
    }

    #[test]
    fn test_executor_mismatch_rejected() {
        let offer = offer("cpus:4");
        let running_exec = executor("e1", "cpus:0.5");
        let running = HashMap::from([(running_exec.executor_id.clone(), running_exec)]);
        let tasks = vec![TaskInfo::with_executor(
            tid("t1"),
            offer.slave_id,
            r("cpus:1"),
            executor("e1", "cpus:1"),
        )];
        let err = validate_launch(&offer, &tasks, &HashSet::new(), Some(&running)).unwrap_err();
        assert!(matches!(err, LaunchError::ExecutorMismatch { .. }));
    }

    #[rstest]
    #[case("cpus:5")]
    #[case("mem:1")]
    #[case("cpus:1;ports:[11-12]")]
    fn test_exceeding_offer_rejected(#[case] requested: &str) {
        let offer = offer("cpus:4;mem:0.5;ports:[1-10]");
        let tasks = vec![command_task(&offer, "t1", requested)];
        let err = validate_launch(&offer, &tasks, &HashSet::new(), None).unwrap_err();
        assert!(matches!(err, LaunchError::InsufficientResources { .. }), "{err}");
    }

    #[test]
    fn test_batch_sum_must_fit() {
        let offer = offer("cpus:2");
        let tasks = vec![
            command_task(&offer, "t1", "cpus:1.5"),
            command_task(&offer, "t2", "cpus:1"),
        ];
        assert!(validate_launch(&offer, &tasks, &HashSet::new(), None).is_err());
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let offer = offer("cpus:4");
        let tasks = vec![
            command_task(&offer, "t1", "cpus:1"),
            command_task(&offer, "t1", "cpus:1"),
        ];
        assert_eq!(
            validate_launch(&offer, &tasks, &HashSet::new(), None),
            Err(LaunchError::DuplicateTaskId(tid("t1")))
        );

        let known = HashSet::from([tid("t9")]);
        let tasks = vec![command_task(&offer, "t9", "cpus:1")];
        assert!(matches!(
            validate_launch(&offer, &tasks, &known, None),
            Err(LaunchError::DuplicateTaskId(_))
        ));
    }

    #[test]
    fn test_wrong_slave_rejected() {
        let offer = offer("cpus:4");
        let tasks = vec![TaskInfo::command(tid("t1"), SlaveId::new(), r("cpus:1"), "true")];
        assert!(matches!(
            validate_launch(&offer, &tasks, &HashSet::new(), None),
            Err(LaunchError::WrongSlave { .. })
        ));
    }

    #[test]
    fn test_executor_and_command_are_exclusive() {
        let offer = offer("cpus:4");
        let mut both = command_task(&offer, "t1", "cpus:1");
        both.executor = Some(executor("e1", "cpus:0.1"));
        assert!(matches!(
            validate_launch(&offer, &[both], &HashSet::new(), None),
            Err(LaunchError::ExecutorAndCommand(_))
        ));

        let mut neither = command_task(&offer, "t2", "cpus:1");
        neither.command = None;
        assert!(matches!(
            validate_launch(&offer, &[neither], &HashSet::new(), None),
            Err(LaunchError::NeitherExecutorNorCommand(_))
        ));
    }
}
