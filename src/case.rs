//! Spawning a test executable, streaming its TAP output through [`crate::tap`]
//! and accumulating a [`CaseExecutionResult`].

use std::collections::HashMap;
use std::io::BufReader;
use std::path::PathBuf;
use std::process::{Command, Stdio};

use crate::error::CaseError;
use crate::tap::{DirectiveKind, EventStream, TapEvent};

/// Everything needed to spawn one invocation of a test case.
#[derive(Debug, Clone)]
pub struct CaseSpec {
    pub file: PathBuf,
    pub arguments: Vec<String>,
    pub environment: Option<HashMap<String, String>>,
    /// Name used for display and JUnit naming; defaults to the entry's path
    /// as written in its suite file (or on the command line).
    pub name: String,
}

impl CaseSpec {
    /// Validates that `file` exists and is executable before building the
    /// spec, matching `case.py`'s `os.path.isfile`/`os.access(X_OK)` check.
    pub fn new(
        file: PathBuf,
        arguments: Vec<String>,
        environment: Option<HashMap<String, String>>,
        name: String,
    ) -> Result<Self, CaseError> {
        if !looks_executable(&file) {
            return Err(CaseError::NotExecutable(file));
        }
        Ok(Self {
            file,
            arguments,
            environment,
            name,
        })
    }
}

#[cfg(unix)]
fn looks_executable(file: &std::path::Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(file)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn looks_executable(file: &std::path::Path) -> bool {
    file.is_file()
}

/// The outcome of one invocation of a `Case`. Counters start at zero;
/// `planned` stays `None` until a `Plan` event arrives; `failed` set means
/// the run aborted due to a parser or plan error (or a spawn failure).
#[derive(Debug, Clone, Default)]
pub struct CaseExecutionResult {
    pub planned: Option<u32>,
    pub ran: u32,
    pub ok: u32,
    pub not_ok: u32,
    pub skip: u32,
    pub todo: u32,
    pub failed: Option<String>,
    pub events: Vec<TapEvent>,
}

impl CaseExecutionResult {
    /// The one-line rendering required by `spec.md` §7: `# failed: …` for
    /// aborted runs, otherwise `# planned: P ran: R ok: X not ok: Y skip: S
    /// todo: T` (the `planned:` segment omitted when no plan was seen).
    pub fn summary(&self) -> String {
        if let Some(failed) = &self.failed {
            return format!("# failed: {failed}");
        }
        let mut s = String::from("# ");
        if let Some(planned) = self.planned {
            s += &format!("planned: {planned} ");
        }
        s += &format!(
            "ran: {} ok: {} not ok: {} skip: {} todo: {}",
            self.ran, self.ok, self.not_ok, self.skip, self.todo
        );
        s
    }
}

/// Spawns `spec`, streams its stdout through the TAP parser, invoking
/// `on_event` for the diagnostic preamble and every parsed event as it
/// arrives, and returns the accumulated [`CaseExecutionResult`] once the
/// child exits or the parser raises.
///
/// This is the lazy "one event per step, terminal element is the result"
/// contract from `spec.md` §4.2, expressed as a callback rather than a
/// nested iterator so the caller (the worker loop) can forward events onto
/// its output channel while still receiving the final struct.
pub fn execute(spec: &CaseSpec, resource: &str, mut on_event: impl FnMut(TapEvent)) -> CaseExecutionResult {
    let mut result = CaseExecutionResult::default();

    let preamble = TapEvent::Diagnostic(format!(
        "Running test case: \"{}\" on {resource}",
        spec.name
    ));
    on_event(preamble.clone());
    result.events.push(preamble);

    let mut command = Command::new(&spec.file);
    command
        .args(&spec.arguments)
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .stdin(Stdio::null());
    if let Some(env) = &spec.environment {
        command.env_clear();
        command.envs(env);
    }

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(err) => {
            result.failed = Some(err.to_string());
            return result;
        }
    };

    let stdout = child.stdout.take().expect("stdout was piped");
    let stream = EventStream::new(BufReader::new(stdout));

    for item in stream {
        match item {
            Ok(event) => {
                accumulate(&mut result, &event);
                on_event(event.clone());
                result.events.push(event);
            }
            Err(err) => {
                let _ = child.kill();
                let _ = child.wait();
                result.failed = Some(err.to_string());
                return result;
            }
        }
    }

    let _ = child.wait();
    result
}

fn accumulate(result: &mut CaseExecutionResult, event: &TapEvent) {
    match event {
        TapEvent::Plan { number, .. } => result.planned = Some(*number),
        TapEvent::TestLine { ok, directive, .. } => {
            result.ran += 1;
            if *ok {
                result.ok += 1;
            } else {
                result.not_ok += 1;
            }
            match directive.as_ref().map(|d| d.kind) {
                Some(DirectiveKind::Todo) => result.todo += 1,
                Some(DirectiveKind::Skip) => result.skip += 1,
                None => {}
            }
        }
        TapEvent::Diagnostic(_) => {}
    }
}
