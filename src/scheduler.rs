//! The first-come-first-served dispatch loop: hands dispatch units to
//! whichever named resource is free next, draining worker output as it
//! arrives (`spec.md` §4.5).

use std::collections::{HashMap, VecDeque};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;

use log::{debug, trace};

use crate::output::Sink;
use crate::suite::{TestId, Tree};
use crate::worker::{self, Job, OutputItem};

pub struct Scheduler {
    tree: Arc<Tree>,
    order: Vec<String>,
    inputs: HashMap<String, Sender<Job>>,
    handles: Vec<JoinHandle<()>>,
    output_rx: Receiver<OutputItem>,
}

impl Scheduler {
    /// Spawns one worker per resource name.
    pub fn new(resources: &[String], tree: Arc<Tree>) -> Self {
        let (output_tx, output_rx) = mpsc::channel();
        let mut inputs = HashMap::with_capacity(resources.len());
        let mut handles = Vec::with_capacity(resources.len());
        for resource in resources {
            let (tx, handle) = worker::spawn(resource.clone(), Arc::clone(&tree), output_tx.clone());
            inputs.insert(resource.clone(), tx);
            handles.push(handle);
        }
        Self {
            tree,
            order: resources.to_vec(),
            inputs,
            handles,
            output_rx,
        }
    }

    /// Dispatches the root's children FCFS across the worker pool, forwarding
    /// every [`OutputItem`] to `sink` as it arrives, until all units have
    /// been dispatched and every resource has gone idle again.
    ///
    /// Free resources are always picked in declared order (`spec.md` §4.5:
    /// "tie-break when multiple resources are free: deterministic by
    /// declared resource order"), not by `HashMap` iteration order.
    pub fn run(mut self, sink: &mut Sink) {
        let mut queue: VecDeque<TestId> = self.tree.dispatch_children(self.tree.root).into();
        // VecDeque so declared-order resources are dequeued front-first.
        let mut free_resources: VecDeque<String> = self.order.iter().cloned().collect();
        let mut busy = 0usize;

        self.fill_free_resources(&mut queue, &mut free_resources, &mut busy);

        while busy > 0 {
            match self.output_rx.recv() {
                Ok(OutputItem::Done { resource, test }) => {
                    debug!("{resource}: freed after {test:?}, {} still busy", busy - 1);
                    busy -= 1;
                    free_resources.push_back(resource);
                    self.fill_free_resources(&mut queue, &mut free_resources, &mut busy);
                }
                Ok(other) => sink.handle(other),
                Err(_) => break,
            }
        }

        debug!("all resources idle, terminating {} worker(s)", self.inputs.len());
        for (_, tx) in self.inputs.drain() {
            let _ = tx.send(Job::Terminate);
        }
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }

    fn fill_free_resources(
        &self,
        queue: &mut VecDeque<TestId>,
        free_resources: &mut VecDeque<String>,
        busy: &mut usize,
    ) {
        // Sort the currently-free set back into declared order before
        // handing any of them work, so repeated refills stay deterministic
        // regardless of the order workers reported back as idle.
        let mut free: Vec<String> = free_resources.drain(..).collect();
        free.sort_by_key(|r| self.order.iter().position(|o| o == r).unwrap_or(usize::MAX));

        for resource in free {
            let Some(test) = queue.pop_front() else {
                trace!("{resource}: no work queued, staying idle");
                free_resources.push_back(resource);
                continue;
            };
            if let Some(tx) = self.inputs.get(&resource) {
                debug!("{resource}: dispatching {test:?}");
                let _ = tx.send(Job::Run(test));
                *busy += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::Sink;
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
    fn runs_two_independent_cases_to_completion() {
        let dir = tempfile::tempdir().unwrap();
        let a = write_case(dir.path(), "a.sh");
        let b = write_case(dir.path(), "b.sh");
        let mut loader = Loader::new();
        let root = loader
            .build_root(&[
                a.to_string_lossy().into_owned(),
                b.to_string_lossy().into_owned(),
            ])
            .unwrap();
        let tree = Arc::new(loader.into_tree(root));

        let resources = vec!["local0".to_string(), "local1".to_string()];
        let scheduler = Scheduler::new(&resources, Arc::clone(&tree));
        let mut sink = Sink::new(false, false, None);
        scheduler.run(&mut sink);

        let ok = sink.finish(&tree).unwrap();
        assert!(ok);
    }
}
