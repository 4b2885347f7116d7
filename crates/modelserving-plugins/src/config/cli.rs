use clap::Parser;
use clap::Subcommand;
use utils::version;

use crate::config::cluster::ReconcileArgs;
use crate::config::offline::RenderArgs;
use crate::config::offline::ValidateArgs;

#[derive(Parser)]
#[command(about, long_about, version = &**version::VERSION)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the rank table plugin against local templates and pod annotations
    Render(RenderArgs),
    /// Check that a rank table template resolves and renders
    Validate(ValidateArgs),
    /// Run a plugin hook of a ModelServing against the cluster
    Reconcile(ReconcileArgs),
}
