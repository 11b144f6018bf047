//! One thread per named resource, each running a recursive `execute` over
//! whatever [`TestId`] it is handed: a bare Case, or a whole Suite unit that
//! was kept together by `Tree::dispatch_children` (`spec.md` §4.4/§5).

use std::collections::HashSet;
use std::sync::mpsc::{Receiver, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;

use log::{debug, trace};

use crate::case::{self, CaseExecutionResult};
use crate::suite::{Node, TestId, Tree};
use crate::tap::TapEvent;

/// Sent to a worker's inbox by the scheduler.
pub enum Job {
    Run(TestId),
    Terminate,
}

/// Sent by a worker onto the shared output channel, consumed solely by the
/// scheduler (`spec.md` §5: "no shared mutable state outside channels").
pub enum OutputItem {
    Event {
        resource: String,
        test: TestId,
        event: TapEvent,
    },
    CaseFinished {
        resource: String,
        test: TestId,
        result: CaseExecutionResult,
    },
    /// Emitted once a dispatched unit (Case or whole Suite) has fully run,
    /// so the scheduler knows the resource is free again.
    Done { resource: String, test: TestId },
}

/// Spawns the named worker thread, returning its inbox and join handle.
pub fn spawn(
    resource: String,
    tree: Arc<Tree>,
    output: Sender<OutputItem>,
) -> (Sender<Job>, JoinHandle<()>) {
    let (tx, rx) = std::sync::mpsc::channel();
    let handle = std::thread::Builder::new()
        .name(format!("worker-{resource}"))
        .spawn(move || run_worker(resource, tree, rx, output))
        .expect("failed to spawn worker thread");
    (tx, handle)
}

fn run_worker(resource: String, tree: Arc<Tree>, jobs: Receiver<Job>, output: Sender<OutputItem>) {
    // Owned by this worker for its whole lifetime, not per dispatched job:
    // a dependency already run for an earlier unit on this resource must
    // not run again for a later one (`spec.md` §4.4's `completedDependencies`
    // field, §8's dependency-idempotence property).
    let mut completed = HashSet::new();
    while let Ok(job) = jobs.recv() {
        match job {
            Job::Terminate => {
                debug!("{resource}: terminating");
                break;
            }
            Job::Run(id) => {
                debug!("{resource}: dispatched {id:?}");
                execute(&tree, id, &resource, &output, &mut completed);
                debug!("{resource}: completed {id:?}");
                let _ = output.send(OutputItem::Done {
                    resource: resource.clone(),
                    test: id,
                });
            }
        }
    }
}

/// Runs `id`'s dependencies (skipping ones already run on this worker,
/// ever) then `id` itself; recurses into Suite children in declared order.
/// `completed` is worker-local and lives for the worker's whole lifetime,
/// never shared across workers, so the same dependency may legitimately run
/// again on a different resource (`spec.md` §4.4).
fn execute(
    tree: &Tree,
    id: TestId,
    resource: &str,
    output: &Sender<OutputItem>,
    completed: &mut HashSet<TestId>,
) {
    for &dep in tree.dependencies(id) {
        if completed.contains(&dep) {
            trace!("{resource}: dependency {dep:?} already satisfied, skipping");
            continue;
        }
        trace!("{resource}: running dependency {dep:?} of {id:?}");
        execute(tree, dep, resource, output, completed);
        completed.insert(dep);
    }

    match tree.node(id) {
        Node::Case(case_node) => {
            let output_for_events = output.clone();
            let resource_owned = resource.to_string();
            let result = case::execute(&case_node.spec, resource, |event| {
                let _ = output_for_events.send(OutputItem::Event {
                    resource: resource_owned.clone(),
                    test: id,
                    event,
                });
            });
            let _ = output.send(OutputItem::CaseFinished {
                resource: resource.to_string(),
                test: id,
                result,
            });
        }
        Node::Suite(suite_node) => {
            for &child in &suite_node.children {
                execute(tree, child, resource, output, completed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::suite::Loader;
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;

    fn write_case(dir: &std::path::Path, name: &str) -> std::path::PathBuf {
        let path = dir.join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "#!/bin/sh\necho '1..1'\necho 'ok 1'").unwrap();
        let mut perms = file.metadata().unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path
    }

    #[test]
    fn executing_a_case_emits_finished_and_done() {
        let dir = tempfile::tempdir().unwrap();
        let case = write_case(dir.path(), "a.sh");
        let mut loader = Loader::new();
        let root = loader
            .build_root(&[case.to_string_lossy().into_owned()])
            .unwrap();
        let tree = loader.into_tree(root);
        let dispatched = tree.dispatch_children(tree.root)[0];

        let (tx, rx) = std::sync::mpsc::channel();
        let mut completed = HashSet::new();
        execute(&tree, dispatched, "local", &tx, &mut completed);
        drop(tx);

        let items: Vec<_> = rx.try_iter().collect();
        assert!(items
            .iter()
            .any(|i| matches!(i, OutputItem::CaseFinished { .. })));
    }

    #[test]
    fn dependency_runs_before_dependent_and_once_per_worker() {
        let dir = tempfile::tempdir().unwrap();
        write_case(dir.path(), "dep.sh");
        write_case(dir.path(), "a.sh");
        std::fs::write(
            dir.path().join("suite.yaml"),
            "Dependencies:\n  - dep.sh\nTests:\n  - a.sh\n",
        )
        .unwrap();
        let mut loader = Loader::new();
        let suite_path = dir.path().join("suite.yaml");
        let root = loader
            .build_root(&[suite_path.to_string_lossy().into_owned()])
            .unwrap();
        let tree = loader.into_tree(root);
        let dispatched = tree.dispatch_children(tree.root)[0];

        let (tx, rx) = std::sync::mpsc::channel();
        let mut completed = HashSet::new();
        execute(&tree, dispatched, "local", &tx, &mut completed);
        drop(tx);

        let finished: Vec<_> = rx
            .try_iter()
            .filter_map(|i| match i {
                OutputItem::CaseFinished { test, .. } => Some(test),
                _ => None,
            })
            .collect();
        // dep.sh runs once, before a.sh; a.sh's own run follows.
        assert_eq!(finished.len(), 2);
        assert_eq!(completed.len(), 1);
    }

    #[test]
    fn shared_dependency_runs_once_across_dispatches_to_the_same_worker() {
        // Two units, both dispatched to the same worker, each depending on
        // the same Case: the dependency must run once for the worker's
        // whole lifetime, not once per dispatched job (`spec.md` §4.4's
        // `completedDependencies`, §8's dependency-idempotence property).
        let dir = tempfile::tempdir().unwrap();
        write_case(dir.path(), "dep.sh");
        write_case(dir.path(), "a.sh");
        write_case(dir.path(), "b.sh");
        std::fs::write(
            dir.path().join("suite.yaml"),
            "Dependencies:\n  - dep.sh\nTests:\n  - a.sh\n  - b.sh\n",
        )
        .unwrap();
        let mut loader = Loader::new();
        let suite_path = dir.path().join("suite.yaml");
        let root = loader
            .build_root(&[suite_path.to_string_lossy().into_owned()])
            .unwrap();
        let tree = loader.into_tree(root);
        let dispatched = tree.dispatch_children(tree.root);
        assert_eq!(dispatched.len(), 2, "a.sh and b.sh dispatch independently");

        let (tx, rx) = std::sync::mpsc::channel();
        // A single worker-lifetime `completed` set, shared across both
        // dispatches, same as `run_worker`'s loop-hoisted declaration.
        let mut completed = HashSet::new();
        for &unit in &dispatched {
            execute(&tree, unit, "local", &tx, &mut completed);
        }
        drop(tx);

        let finished: Vec<_> = rx
            .try_iter()
            .filter_map(|i| match i {
                OutputItem::CaseFinished { test, .. } => Some(test),
                _ => None,
            })
            .collect();
        // dep.sh once, plus one run each for a.sh and b.sh.
        assert_eq!(finished.len(), 3);
        assert_eq!(completed.len(), 1);
    }
}
