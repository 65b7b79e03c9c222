use std::path::PathBuf;

use anyhow::Result;
use clap::Args;
use tracing::warn;

use runway_core::compare::{compare, CompareFilters, Comparison};

#[derive(Args)]
pub struct Compare {
    /// Reference side: an output directory or a manifest file
    pub a: PathBuf,

    /// Candidate side: an output directory or a manifest file
    pub b: PathBuf,

    /// Restrict the comparison to matching paths (repeatable)
    #[arg(long = "pattern", value_name = "GLOB")]
    pub patterns: Vec<String>,

    /// Paths to leave out of the comparison (repeatable)
    #[arg(long = "ignore", value_name = "GLOB")]
    pub ignore: Vec<String>,

    /// Also fail on files present on only one side
    #[arg(long)]
    pub strict: bool,
}

impl Compare {
    pub async fn execute(self) -> Result<bool> {
        let filters = CompareFilters {
            patterns: self.patterns,
            ignore: self.ignore,
        };
        let comparison = compare(&self.a, &self.b, &filters)?;
        print_report(&comparison);
        if comparison.is_empty() {
            warn!("nothing was compared, check the paths and filters");
        }
        Ok(comparison.passed(self.strict))
    }
}

fn print_report(comparison: &Comparison) {
    println!(
        "{} matched, {} mismatched, {} only in A, {} only in B, {} errors",
        comparison.matched.len(),
        comparison.mismatch.len(),
        comparison.only_in_a.len(),
        comparison.only_in_b.len(),
        comparison.errors.len(),
    );
    for path in &comparison.mismatch {
        println!("mismatch: {path}");
    }
    for path in &comparison.only_in_a {
        println!("only in A: {path}");
    }
    for path in &comparison.only_in_b {
        println!("only in B: {path}");
    }
    for (path, error) in &comparison.errors {
        println!("error: {path}: {error}");
    }
}
