use clap::Subcommand;

pub mod batch;
pub mod compare;

pub use batch::Batch;
pub use compare::Compare;

#[derive(Subcommand)]
pub enum Commands {
    /// Expand batches into tasks and dispatch them on a runner
    Batch(Batch),

    /// Bit-accuracy comparison of two output trees or manifests
    Compare(Compare),
}
