//! Branch-per-task isolation with real git worktrees.

use std::collections::HashSet;
use std::sync::Arc;

use hive::core::Task;
use hive::git::GitOps;
use hive::orchestration::{CoordinatorOptions, Workspace};

use crate::fixtures::{quick_options, Harness, ScriptedExecutor, TestRepo};

fn workspace(repo: &TestRepo) -> Arc<Workspace> {
    Arc::new(Workspace::new(&repo.path, repo.worktrees.path()).unwrap())
}

#[tokio::test]
async fn test_parallel_tasks_land_on_their_own_branches() {
    let repo = TestRepo::new();
    let executor = ScriptedExecutor::new();
    let mut h = Harness::new(executor.clone(), quick_options(3));
    h.coordinator = h.coordinator.with_workspace(workspace(&repo));
    h.coordinator
        .submit(vec![
            Task::new("alpha", "first change"),
            Task::new("beta", "second change"),
            Task::new("gamma", "third change"),
        ])
        .unwrap();

    let summary = h.coordinator.run().await.unwrap();
    assert_eq!(summary.completed, 3);

    let workdirs: HashSet<_> = executor.workdirs().into_iter().collect();
    assert_eq!(workdirs.len(), 3);
    for dir in &workdirs {
        assert!(dir.starts_with(repo.worktrees.path()));
        assert!(!dir.exists(), "worktree {} was not cleaned up", dir.display());
    }

    for id in ["alpha", "beta", "gamma"] {
        let branch = format!("hive/{id}");
        assert!(repo.branch_has_file(&branch, &format!("{id}.txt")));
        for other in ["alpha", "beta", "gamma"].iter().filter(|o| **o != id) {
            assert!(!repo.branch_has_file(&branch, &format!("{other}.txt")));
        }

        let task = h.coordinator.graph().get_task(&id.into()).unwrap();
        assert_eq!(task.branch_name.as_deref(), Some(branch.as_str()));
        assert_eq!(task.files_changed, vec![format!("{id}.txt")]);
    }

    assert!(!repo.path.join("alpha.txt").exists());
    assert!(GitOps::new(&repo.path).unwrap().list_worktrees().unwrap().is_empty());
}

#[tokio::test]
async fn test_retry_reuses_the_task_branch() {
    let repo = TestRepo::new();
    let executor = ScriptedExecutor::new();
    executor.fail_times("flaky", 1);
    let mut h = Harness::new(executor.clone(), CoordinatorOptions::default());
    h.coordinator = h.coordinator.with_workspace(workspace(&repo));
    h.coordinator.submit(vec![Task::new("flaky", "try twice")]).unwrap();

    let summary = h.coordinator.run().await.unwrap();
    assert_eq!(summary.completed, 1);
    assert_eq!(executor.attempts("flaky"), 2);
    assert!(repo.branch_has_file("hive/flaky", "flaky.txt"));
}

#[tokio::test]
async fn test_branches_are_cut_from_the_base_branch() {
    let repo = TestRepo::new();
    let git = GitOps::new(&repo.path).unwrap();
    let setup = repo.worktrees.path().join("setup");
    git.create_worktree("develop", None, &setup).unwrap();
    std::fs::write(setup.join("base.txt"), "from develop\n").unwrap();
    git.commit_all(&setup, "develop work").unwrap();
    git.remove_worktree(&setup).unwrap();

    let executor = ScriptedExecutor::new();
    let mut h = Harness::new(executor, quick_options(1));
    let ws = Workspace::new(&repo.path, repo.worktrees.path())
        .unwrap()
        .with_base_branch(Some("develop".into()));
    h.coordinator = h.coordinator.with_workspace(Arc::new(ws));
    h.coordinator.submit(vec![Task::new("feature", "build on develop")]).unwrap();

    let summary = h.coordinator.run().await.unwrap();
    assert_eq!(summary.completed, 1);
    assert!(repo.branch_has_file("hive/feature", "base.txt"));
    assert!(repo.branch_has_file("hive/feature", "feature.txt"));
}

#[tokio::test]
async fn test_dependent_task_starts_from_base_not_sibling() {
    let repo = TestRepo::new();
    let executor = ScriptedExecutor::new();
    let mut h = Harness::new(executor, quick_options(2));
    h.coordinator = h.coordinator.with_workspace(workspace(&repo));
    h.coordinator
        .submit(vec![
            Task::new("one", "first"),
            Task::new("two", "second").with_dependencies(["one"]),
        ])
        .unwrap();

    h.coordinator.run().await.unwrap();
    assert!(repo.branch_has_file("hive/two", "two.txt"));
    assert!(!repo.branch_has_file("hive/two", "one.txt"));
}

#[tokio::test]
async fn test_unsafe_task_ids_get_valid_branches() {
    let repo = TestRepo::new();
    let executor = ScriptedExecutor::new();
    let mut h = Harness::new(executor, quick_options(1));
    h.coordinator = h.coordinator.with_workspace(workspace(&repo));
    h.coordinator
        .submit(vec![Task::new("fix bug #12", "spaces and hashes")])
        .unwrap();

    let summary = h.coordinator.run().await.unwrap();
    assert_eq!(summary.completed, 1);
    let task = h.coordinator.graph().get_task(&"fix bug #12".into()).unwrap();
    let branch = task.branch_name.clone().unwrap();
    assert!(branch.starts_with("hive/"));
    assert!(!branch.contains(' '));
    assert!(git2::Branch::name_is_valid(&branch).unwrap());
}
