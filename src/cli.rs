//! Command-line entry point: resolves positional tokens into resource names
//! and test paths the way `mistest.py`'s `parse_separated`/`parse_unseparated`
//! do, then builds the Suite/Case tree.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;

use crate::suite::{looks_like_case, looks_like_suite, Loader, Tree};

#[derive(Parser, Debug)]
#[command(name = "mistest", about = "Parallel TAP test harness")]
struct RawArgs {
    /// Resource names followed by a bare `-` and test paths, or (with no
    /// separator) a heuristically-split mix of the two, matching the
    /// original CLI. `allow_hyphen_values` is required so the lone `-`
    /// separator token itself parses as a positional rather than being
    /// rejected as an unknown flag.
    #[arg(allow_hyphen_values = true)]
    tokens: Vec<String>,

    /// Write output as it arrives instead of buffering until the run ends.
    /// Kept for command-line compatibility; rendering happens eagerly
    /// either way once `finish` is called, so this only changes timing.
    #[arg(long)]
    immediate_output: bool,

    /// Path to write a JUnit XML report to.
    #[arg(short = 'x', long = "junit-xml")]
    junit_xml: Option<PathBuf>,

    /// Number of resources to synthesize when none are given explicitly.
    #[arg(short = 'j', long, default_value_t = 1)]
    jobs: usize,
}

pub struct Config {
    pub resources: Vec<String>,
    pub tree: Arc<Tree>,
    pub immediate: bool,
    pub prefix_with_resource: bool,
    pub junit_xml_path: Option<PathBuf>,
}

pub fn parse() -> anyhow::Result<Config> {
    let args = RawArgs::parse();
    build_config(args)
}

fn build_config(args: RawArgs) -> anyhow::Result<Config> {
    let (resources, test_tokens) = split_tokens(&args.tokens, args.jobs)?;

    let mut loader = Loader::new();
    let root = loader.build_root(&test_tokens)?;
    let tree = Arc::new(loader.into_tree(root));

    // `immediate` defaults on and this CLI has no flag that can turn it
    // off again; `--immediate-output` only ever confirms the default, same
    // as the original tool's always-on `Output.immediate`.
    let _ = args.immediate_output;

    Ok(Config {
        prefix_with_resource: resources.len() > 1,
        resources,
        tree,
        immediate: true,
        junit_xml_path: args.junit_xml,
    })
}

/// Splits the CLI's trailing token list into resource names and test paths.
/// An explicit bare `-` separator (`spec.md` §6: `[<resource>...] [- <test>...]`,
/// a single dash — not clap's own `--` end-of-options marker, which is why
/// `tokens` needs `allow_hyphen_values`) wins if present; otherwise tokens
/// are classified by what they look like on disk, matching `mistest.py`'s
/// `parse_unseparated` fallback. With no explicit resources given,
/// synthesizes `local0..local{jobs-1}` (or a single `local` if `jobs == 1`).
fn split_tokens(tokens: &[String], jobs: usize) -> anyhow::Result<(Vec<String>, Vec<String>)> {
    if let Some(sep) = tokens.iter().position(|t| t == "-") {
        let resources = tokens[..sep].to_vec();
        let tests = tokens[sep + 1..].to_vec();
        return Ok((default_resources_if_empty(resources, jobs), tests));
    }

    // Mirrors `mistest.py`'s `parse_unseparated`: scan left to right, taking
    // tokens as resources until the first one that looks like a suite/Case;
    // from that point on every remaining token must look like a suite/Case
    // too (a plain resource-looking token appearing after the first test is
    // a usage error, not a trailing resource).
    let mut resources = Vec::new();
    let mut tests = Vec::new();
    let mut args_are_resources = true;
    for token in tokens {
        if !looks_like_resource(token) {
            tests.push(token.clone());
            args_are_resources = false;
        } else if args_are_resources {
            resources.push(token.clone());
        } else {
            anyhow::bail!("{token} does not appear to be a test case or suite");
        }
    }
    Ok((default_resources_if_empty(resources, jobs), tests))
}

fn default_resources_if_empty(resources: Vec<String>, jobs: usize) -> Vec<String> {
    if !resources.is_empty() {
        return resources;
    }
    if jobs <= 1 {
        vec!["local".to_string()]
    } else {
        (0..jobs).map(|i| format!("local{i}")).collect()
    }
}

/// A token "looks like a resource name" if it does *not* resolve to a
/// suite file or executable Case on disk; everything else is assumed to
/// name a test.
fn looks_like_resource(token: &str) -> bool {
    let path = Path::new(token);
    !(looks_like_suite(path) || looks_like_case(path))
}
