use std::path::PathBuf;

use clap::Parser;
use clap::ValueEnum;

use crate::config::offline::RetryArgs;
use crate::domain::ranktable::DEFAULT_TEMPLATE_NAMESPACE;

/// Lifecycle hook run against a live cluster.
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Hook {
    /// Publish the artifacts of the serving group
    Ready,
    /// Remove the artifacts of one role instance
    RoleDelete,
    /// Remove every artifact of the serving group
    GroupDelete,
}

#[derive(Parser, Clone, Debug)]
pub struct ReconcileArgs {
    #[arg(
        long,
        env = "KUBECONFIG",
        value_hint = clap::ValueHint::FilePath,
        help = "Kubeconfig to use instead of the in-cluster configuration"
    )]
    pub kubeconfig: Option<PathBuf>,

    #[arg(
        long,
        default_value = "default",
        help = "Namespace of the ModelServing and its pods"
    )]
    pub namespace: String,

    #[arg(
        long,
        env = "POD_NAMESPACE",
        default_value = DEFAULT_TEMPLATE_NAMESPACE,
        help = "Namespace the rank table templates are looked up in"
    )]
    pub template_namespace: String,

    #[arg(long, help = "ModelServing name")]
    pub model_serving: String,

    #[arg(long, help = "Serving group name")]
    pub serving_group: String,

    #[arg(long, default_value = "", help = "Role name")]
    pub role: String,

    #[arg(long, default_value = "", help = "Role instance id")]
    pub role_id: String,

    #[arg(long, help = "Whether the hook runs for the entry pod of the role instance")]
    pub entry: bool,

    #[arg(long, value_enum, default_value_t = Hook::Ready, help = "Hook to run")]
    pub hook: Hook,

    #[command(flatten)]
    pub retry: RetryArgs,

    #[arg(
        long,
        env = utils::logging::LOG_PATH_ENV_VAR,
        value_hint = clap::ValueHint::FilePath,
        help = "Write logs to this file instead of stderr"
    )]
    pub log_path: Option<PathBuf>,
}
