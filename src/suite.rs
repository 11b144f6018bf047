//! The Suite/Case tree: an arena of `Test` nodes addressed by index, with
//! ordering-aware dispatch helpers and a `serde_yaml`-backed loader.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use log::warn;
use serde::Deserialize;

use crate::case::CaseSpec;
use crate::error::SuiteError;

/// An index into a [`Tree`]'s arena. Stands in for the owning-reference
/// cycles a `Case`/`Suite` parent/child/dependency graph would otherwise
/// need, per the non-owning-reference guidance in `spec.md` §9.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TestId(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ordering {
    Sequential,
    Any,
}

#[derive(Debug)]
pub struct CaseNode {
    pub spec: CaseSpec,
    pub parent: Option<TestId>,
    pub sequence: u32,
    pub dependencies: Vec<TestId>,
}

#[derive(Debug)]
pub struct SuiteNode {
    pub name: String,
    pub parent: Option<TestId>,
    pub sequence: Option<u32>,
    pub ordering: Ordering,
    pub children: Vec<TestId>,
    pub dependencies: Vec<TestId>,
}

#[derive(Debug)]
pub enum Node {
    Case(CaseNode),
    Suite(SuiteNode),
}

/// The whole Suite/Case tree, built once before scheduling starts and
/// immutable thereafter (per `spec.md` §3's lifecycle note; execution
/// results live outside the tree, see `crate::output::Sink`).
#[derive(Debug)]
pub struct Tree {
    nodes: Vec<Node>,
    pub root: TestId,
}

impl Tree {
    pub fn node(&self, id: TestId) -> &Node {
        &self.nodes[id.0]
    }

    pub fn dependencies(&self, id: TestId) -> &[TestId] {
        match self.node(id) {
            Node::Case(c) => &c.dependencies,
            Node::Suite(s) => &s.dependencies,
        }
    }

    /// The scheduler-facing dispatch order for `id` (normally the root):
    /// each child is yielded as one unit unless it's an `any`-ordered
    /// Suite, in which case its own children are spliced in in place,
    /// recursively. See `spec.md` §4.3.
    pub fn dispatch_children(&self, id: TestId) -> Vec<TestId> {
        let children = match self.node(id) {
            Node::Suite(s) => &s.children,
            Node::Case(_) => return vec![id],
        };
        let mut out = Vec::new();
        for &child in children {
            match self.node(child) {
                Node::Case(_) => out.push(child),
                Node::Suite(s) => match s.ordering {
                    Ordering::Sequential => out.push(child),
                    Ordering::Any => out.extend(self.dispatch_children(child)),
                },
            }
        }
        out
    }

    /// Fully recursive Case flattening, used by a worker that was handed a
    /// whole (`sequential`) Suite to run by itself: every descendant Case,
    /// in declared order, regardless of nested ordering markers.
    pub fn flatten_cases(&self, id: TestId, out: &mut Vec<TestId>) {
        match self.node(id) {
            Node::Case(_) => out.push(id),
            Node::Suite(s) => {
                for &child in &s.children {
                    self.flatten_cases(child, out);
                }
            }
        }
    }

    /// `junitName = parent.junitName + "." + zfill(sequence, digits(len(parent))+1)
    /// + "_" + stem(basename(name))`, the top-level Suite contributing no
    /// segment (`spec.md` §4.3).
    pub fn junit_name(&self, id: TestId) -> String {
        match self.node(id) {
            Node::Suite(s) if s.parent.is_none() => String::new(),
            Node::Suite(s) => self.named_segment(s.parent.unwrap(), s.sequence.unwrap_or(0), &s.name),
            Node::Case(c) => self.named_segment(
                c.parent.expect("a Case always has a parent"),
                c.sequence,
                &c.spec.name,
            ),
        }
    }

    fn named_segment(&self, parent: TestId, sequence: u32, name: &str) -> String {
        let sibling_count = match self.node(parent) {
            Node::Suite(p) => p.children.len(),
            Node::Case(_) => unreachable!("a Test's parent is always a Suite"),
        };
        let width = digits(sibling_count) + 1;
        let parent_name = self.junit_name(parent);
        let stem = stem(name);
        format!("{parent_name}.{sequence:0width$}_{stem}")
    }
}

fn digits(n: usize) -> usize {
    if n == 0 {
        1
    } else {
        (n as f64).log10().floor() as usize + 1
    }
}

fn stem(name: &str) -> String {
    Path::new(name)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| name.to_string())
}

// ---------------------------------------------------------------------
// Declarative suite file format (spec.md §6)
// ---------------------------------------------------------------------

#[derive(Deserialize, Default)]
struct CaseDirectives {
    arguments: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum TestEntry {
    Path(String),
    WithDirectives(HashMap<String, CaseDirectives>),
}

impl TestEntry {
    fn path(&self) -> &str {
        match self {
            TestEntry::Path(p) => p,
            TestEntry::WithDirectives(map) => map
                .keys()
                .next()
                .map(String::as_str)
                .unwrap_or_default(),
        }
    }

    fn arguments(&self) -> Vec<String> {
        match self {
            TestEntry::Path(_) => Vec::new(),
            TestEntry::WithDirectives(map) => map
                .values()
                .next()
                .and_then(|d| d.arguments.as_ref())
                .map(|s| s.split_whitespace().map(String::from).collect())
                .unwrap_or_default(),
        }
    }
}

#[derive(Deserialize, Clone, Copy, Default)]
#[serde(rename_all = "lowercase")]
enum OrderingRaw {
    #[default]
    Sequential,
    Any,
}

impl From<OrderingRaw> for Ordering {
    fn from(raw: OrderingRaw) -> Self {
        match raw {
            OrderingRaw::Sequential => Ordering::Sequential,
            OrderingRaw::Any => Ordering::Any,
        }
    }
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "PascalCase")]
struct RawSuiteFile {
    #[serde(default)]
    ordering: OrderingRaw,
    #[serde(default)]
    dependencies: Vec<TestEntry>,
    #[serde(default)]
    tests: Vec<TestEntry>,
}

/// Builds a [`Tree`] from a suite file and/or the CLI's top-level token
/// list, de-duplicating repeated dependency paths by [`TestId`] so a
/// dependency declared at multiple nesting levels resolves to one node
/// (`spec.md` §3: "duplicate occurrences are de-duplicated by identity").
pub struct Loader {
    arena: Vec<Node>,
    dependency_cache: HashMap<PathBuf, TestId>,
    synthetic_root: Option<TestId>,
}

impl Loader {
    pub fn new() -> Self {
        Self {
            arena: Vec::new(),
            dependency_cache: HashMap::new(),
            synthetic_root: None,
        }
    }

    pub fn into_tree(self, root: TestId) -> Tree {
        Tree {
            nodes: self.arena,
            root,
        }
    }

    fn push(&mut self, node: Node) -> TestId {
        self.arena.push(node);
        TestId(self.arena.len() - 1)
    }

    /// Builds the synthetic top-level Suite directly from CLI-resolved test
    /// tokens (paths relative to the current directory), matching the
    /// "top level suite" `mistest.py` builds from `sys.argv`.
    pub fn build_root(&mut self, tokens: &[String]) -> Result<TestId, SuiteError> {
        let root_id = self.push(Node::Suite(SuiteNode {
            name: "<top-level>".to_string(),
            parent: None,
            sequence: None,
            ordering: Ordering::Sequential,
            children: Vec::new(),
            dependencies: Vec::new(),
        }));

        let mut children = Vec::with_capacity(tokens.len());
        for (i, token) in tokens.iter().enumerate() {
            let path = PathBuf::from(token);
            if !looks_like_suite(&path) && !looks_like_case(&path) {
                return Err(SuiteError::NotATest(path));
            }
            let entry = TestEntry::Path(token.clone());
            let id = self.load_entry(&entry, Path::new("."), &[], root_id, (i + 1) as u32)?;
            children.push(id);
        }
        if let Node::Suite(s) = &mut self.arena[root_id.0] {
            s.children = children;
        }
        Ok(root_id)
    }

    fn load_suite_file(
        &mut self,
        path: &Path,
        inherited: &[TestId],
        parent: Option<TestId>,
        sequence: Option<u32>,
    ) -> Result<TestId, SuiteError> {
        let text = fs::read_to_string(path).map_err(|source| SuiteError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let raw: RawSuiteFile = serde_yaml::from_str(&text).map_err(|source| SuiteError::Yaml {
            path: path.to_path_buf(),
            source,
        })?;
        if raw.tests.is_empty() {
            return Err(SuiteError::Empty(path.to_path_buf()));
        }
        if raw.dependencies.is_empty() && !inherited.is_empty() {
            warn!(
                "suite {} declares no Dependencies of its own; only inherited dependencies apply",
                path.display()
            );
        }
        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));

        let mut own_deps: Vec<TestId> = inherited.to_vec();
        for dep_entry in &raw.dependencies {
            let id = self.load_dependency(dep_entry, base_dir)?;
            if !own_deps.contains(&id) {
                own_deps.push(id);
            }
        }

        let name = path.to_string_lossy().into_owned();
        let suite_id = self.push(Node::Suite(SuiteNode {
            name,
            parent,
            sequence,
            ordering: raw.ordering.into(),
            children: Vec::new(),
            dependencies: own_deps.clone(),
        }));

        let mut children = Vec::with_capacity(raw.tests.len());
        for (i, entry) in raw.tests.iter().enumerate() {
            let child_id = self.load_entry(entry, base_dir, &own_deps, suite_id, (i + 1) as u32)?;
            children.push(child_id);
        }
        if let Node::Suite(s) = &mut self.arena[suite_id.0] {
            s.children = children;
        }
        Ok(suite_id)
    }

    fn load_entry(
        &mut self,
        entry: &TestEntry,
        base_dir: &Path,
        inherited: &[TestId],
        parent: TestId,
        sequence: u32,
    ) -> Result<TestId, SuiteError> {
        let path_str = entry.path();
        let path = base_dir.join(path_str);
        if path_str.ends_with(".yaml") {
            self.load_suite_file(&path, inherited, Some(parent), Some(sequence))
                .map_err(|source| SuiteError::SubSuite {
                    path: path.clone(),
                    source: Box::new(source),
                })
        } else {
            let spec = CaseSpec::new(path, entry.arguments(), None, path_str.to_string())?;
            Ok(self.push(Node::Case(CaseNode {
                spec,
                parent: Some(parent),
                sequence,
                dependencies: inherited.to_vec(),
            })))
        }
    }

    /// Dependencies run with no dependencies of their own (`spec.md` §4.3)
    /// and are cached by resolved path so the same dependency declared at
    /// several nesting levels resolves to the same [`TestId`].
    fn load_dependency(&mut self, entry: &TestEntry, base_dir: &Path) -> Result<TestId, SuiteError> {
        let path_str = entry.path();
        let resolved = base_dir.join(path_str);
        if let Some(&id) = self.dependency_cache.get(&resolved) {
            return Ok(id);
        }
        let placeholder_parent = self.synthetic_dependency_root();
        let id = self.load_entry(entry, base_dir, &[], placeholder_parent, 0)?;
        self.dependency_cache.insert(resolved, id);
        Ok(id)
    }

    /// Dependency nodes aren't part of the reported tree (they have no
    /// meaningful sequence/parent for JUnit naming), but `CaseNode`/
    /// `SuiteNode` require a parent. A single lazily-created, childless
    /// Suite node stands in for all of them.
    fn synthetic_dependency_root(&mut self) -> TestId {
        if let Some(id) = self.synthetic_root {
            return id;
        }
        let id = self.push(Node::Suite(SuiteNode {
            name: "<dependencies>".to_string(),
            parent: None,
            sequence: None,
            ordering: Ordering::Any,
            children: Vec::new(),
            dependencies: Vec::new(),
        }));
        self.synthetic_root = Some(id);
        id
    }
}

impl Default for Loader {
    fn default() -> Self {
        Self::new()
    }
}

pub fn looks_like_suite(path: &Path) -> bool {
    path.extension().map(|e| e == "yaml").unwrap_or(false) && path.is_file()
}

pub fn looks_like_case(path: &Path) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::metadata(path)
            .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
            .unwrap_or(false)
    }
    #[cfg(not(unix))]
    {
        path.is_file()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;

    fn write_case(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "#!/bin/sh\necho '1..0'").unwrap();
        let mut perms = file.metadata().unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path
    }

    #[test]
    fn build_root_rejects_unknown_token() {
        let dir = tempfile::tempdir().unwrap();
        let mut loader = Loader::new();
        let missing = dir.path().join("nope").to_string_lossy().into_owned();
        let err = loader.build_root(&[missing]).unwrap_err();
        assert!(matches!(err, SuiteError::NotATest(_)));
    }

    #[test]
    fn build_root_accepts_bare_cases() {
        let dir = tempfile::tempdir().unwrap();
        let case = write_case(dir.path(), "one.sh");
        let mut loader = Loader::new();
        let root = loader
            .build_root(&[case.to_string_lossy().into_owned()])
            .unwrap();
        let tree = loader.into_tree(root);
        assert_eq!(tree.dispatch_children(tree.root).len(), 1);
    }

    #[test]
    fn sequential_suite_dispatches_as_one_unit() {
        let dir = tempfile::tempdir().unwrap();
        write_case(dir.path(), "a.sh");
        write_case(dir.path(), "b.sh");
        std::fs::write(
            dir.path().join("suite.yaml"),
            "Tests:\n  - a.sh\n  - b.sh\n",
        )
        .unwrap();

        let mut loader = Loader::new();
        let suite_path = dir.path().join("suite.yaml");
        let root = loader
            .build_root(&[suite_path.to_string_lossy().into_owned()])
            .unwrap();
        let tree = loader.into_tree(root);
        // The nested suite is sequential by default, so it is one dispatch unit.
        assert_eq!(tree.dispatch_children(tree.root).len(), 1);
        let mut cases = Vec::new();
        tree.flatten_cases(tree.root, &mut cases);
        assert_eq!(cases.len(), 2);
    }

    #[test]
    fn any_ordered_suite_flattens_into_parent_dispatch() {
        let dir = tempfile::tempdir().unwrap();
        write_case(dir.path(), "a.sh");
        write_case(dir.path(), "b.sh");
        std::fs::write(
            dir.path().join("suite.yaml"),
            "Ordering: any\nTests:\n  - a.sh\n  - b.sh\n",
        )
        .unwrap();

        let mut loader = Loader::new();
        let suite_path = dir.path().join("suite.yaml");
        let root = loader
            .build_root(&[suite_path.to_string_lossy().into_owned()])
            .unwrap();
        let tree = loader.into_tree(root);
        assert_eq!(tree.dispatch_children(tree.root).len(), 2);
    }

    #[test]
    fn dependencies_are_deduplicated_by_identity() {
        let dir = tempfile::tempdir().unwrap();
        write_case(dir.path(), "dep.sh");
        write_case(dir.path(), "a.sh");
        std::fs::write(
            dir.path().join("inner.yaml"),
            "Dependencies:\n  - dep.sh\nTests:\n  - a.sh\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("outer.yaml"),
            "Dependencies:\n  - dep.sh\nTests:\n  - inner.yaml\n",
        )
        .unwrap();

        let mut loader = Loader::new();
        let suite_path = dir.path().join("outer.yaml");
        let root = loader
            .build_root(&[suite_path.to_string_lossy().into_owned()])
            .unwrap();
        let tree = loader.into_tree(root);
        let mut cases = Vec::new();
        tree.flatten_cases(tree.root, &mut cases);
        let inner_case = cases
            .iter()
            .find(|id| match tree.node(**id) {
                Node::Case(c) => c.spec.name == "a.sh",
                _ => false,
            })
            .unwrap();
        let deps = tree.dependencies(*inner_case);
        assert_eq!(deps.len(), 1, "the same dep.sh path must resolve once");
    }

    #[test]
    fn empty_suite_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("empty.yaml"), "Tests: []\n").unwrap();
        let mut loader = Loader::new();
        let suite_path = dir.path().join("empty.yaml");
        let err = loader
            .build_root(&[suite_path.to_string_lossy().into_owned()])
            .unwrap_err();
        assert!(matches!(err, SuiteError::SubSuite { .. }));
    }
}
