//! Renders worker output as it arrives (or, if not `immediate`, buffers it
//! until the run finishes) and produces the final aggregated result.

use std::collections::HashMap;
use std::io::{self, Stdout, Write};
use std::path::PathBuf;

use crate::case::CaseExecutionResult;
use crate::result::{self, TestResult};
use crate::suite::{TestId, Tree};
use crate::worker::OutputItem;

fn count_cases(result: &TestResult) -> usize {
    match result {
        TestResult::Case(_) => 1,
        TestResult::Suite(s) => s.children.iter().map(count_cases).sum(),
    }
}

fn count_passed(result: &TestResult) -> usize {
    match result {
        TestResult::Case(c) => usize::from(c.ok),
        TestResult::Suite(s) => s.children.iter().map(count_passed).sum(),
    }
}

/// The single consumer of worker output, owned directly by the
/// [`crate::scheduler::Scheduler`] rather than run on its own thread —
/// mirroring `scheduler.py`'s inline `self.output(result)` call while
/// draining, since nothing else needs to observe results concurrently.
pub struct Sink<W: Write = Stdout> {
    writer: W,
    immediate: bool,
    prefix_with_resource: bool,
    junit_xml_path: Option<PathBuf>,
    results: HashMap<TestId, Vec<CaseExecutionResult>>,
    pending_lines: Vec<String>,
}

impl Sink<Stdout> {
    pub fn new(immediate: bool, prefix_with_resource: bool, junit_xml_path: Option<PathBuf>) -> Self {
        Self::with_writer(io::stdout(), immediate, prefix_with_resource, junit_xml_path)
    }
}

impl<W: Write> Sink<W> {
    pub fn with_writer(
        writer: W,
        immediate: bool,
        prefix_with_resource: bool,
        junit_xml_path: Option<PathBuf>,
    ) -> Self {
        Self {
            writer,
            immediate,
            prefix_with_resource,
            junit_xml_path,
            results: HashMap::new(),
            pending_lines: Vec::new(),
        }
    }

    pub fn handle(&mut self, item: OutputItem) {
        match item {
            OutputItem::Event {
                resource, event, ..
            } => {
                let line = self.render(&resource, &event.to_string());
                self.emit(line);
            }
            OutputItem::CaseFinished {
                resource,
                test,
                result,
            } => {
                let line = self.render(&resource, &result.summary());
                self.emit(line);
                self.results.entry(test).or_default().push(result);
            }
            OutputItem::Done { .. } => {}
        }
    }

    fn render(&self, resource: &str, text: &str) -> String {
        if self.prefix_with_resource {
            format!("[{resource}] {text}")
        } else {
            text.to_string()
        }
    }

    fn emit(&mut self, line: String) {
        if self.immediate {
            let _ = writeln!(self.writer, "{line}");
        } else {
            self.pending_lines.push(line);
        }
    }

    /// Flushes any buffered output, builds the aggregated result tree,
    /// optionally writes a JUnit XML report, and returns whether the whole
    /// run passed.
    pub fn finish(&mut self, tree: &Tree) -> anyhow::Result<bool> {
        if !self.immediate {
            for line in self.pending_lines.drain(..) {
                writeln!(self.writer, "{line}")?;
            }
        }

        let root_result = result::build_test_result(tree, tree.root, &self.results)?;
        // Dependency Cases run off to the side of the reported Suite/Case
        // tree (spec.md §4.3's dependencies aren't tree children), so their
        // outcome wouldn't otherwise affect the overall verdict at all.
        let dependencies_ok = self.results.iter().all(|(_, executions)| {
            result::CaseResult::aggregate(String::new(), String::new(), executions)
                .map(|r| r.ok)
                .unwrap_or(false)
        });
        let ok = root_result.ok() && dependencies_ok;

        let total = count_cases(&root_result);
        let passed = count_passed(&root_result);
        writeln!(
            self.writer,
            "{passed}/{total} cases passed{}",
            if ok { "" } else { " (FAILED)" }
        )?;

        if let Some(path) = &self.junit_xml_path {
            match &root_result {
                result::TestResult::Suite(suite) => result::write_junit(suite, path)?,
                result::TestResult::Case(_) => {
                    // A bare single Case at the top level still gets wrapped,
                    // build_test_result only returns Case for a Case root.
                }
            }
        }

        Ok(ok)
    }
}
