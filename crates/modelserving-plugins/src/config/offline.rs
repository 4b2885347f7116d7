use std::path::PathBuf;
use std::time::Duration;

use clap::Args;
use clap::Parser;

use crate::domain::ranktable::DEFAULT_TEMPLATE_NAMESPACE;
use crate::domain::RetryPolicy;

/// Where rank table templates are loaded from.
#[derive(Args, Clone, Debug)]
pub struct TemplateArgs {
    #[arg(
        long,
        env = "RANKTABLE_TEMPLATE_DIR",
        value_hint = clap::ValueHint::DirPath,
        help = "Directory of ConfigMap YAML documents holding the templates"
    )]
    pub template_dir: PathBuf,

    #[arg(long, help = "Name of the rank table template ConfigMap")]
    pub template: String,

    #[arg(
        long,
        env = "POD_NAMESPACE",
        default_value = DEFAULT_TEMPLATE_NAMESPACE,
        help = "Namespace the templates are looked up in"
    )]
    pub namespace: String,

    #[arg(
        long,
        env = utils::logging::LOG_PATH_ENV_VAR,
        value_hint = clap::ValueHint::FilePath,
        help = "Write logs to this file instead of stderr"
    )]
    pub log_path: Option<PathBuf>,
}

#[derive(Parser, Clone, Debug)]
pub struct RenderArgs {
    #[command(flatten)]
    pub templates: TemplateArgs,

    #[arg(
        long,
        value_hint = clap::ValueHint::FilePath,
        help = "JSON object mapping pod names to their rank table annotation"
    )]
    pub annotations: PathBuf,

    #[arg(long, default_value = "offline", help = "ModelServing name")]
    pub model_serving: String,

    #[arg(long, default_value = "offline-0", help = "Serving group name")]
    pub serving_group: String,

    #[arg(long, default_value = "worker", help = "Role name of the pods")]
    pub role: String,

    #[arg(long, default_value = "worker-0", help = "Role instance id of the pods")]
    pub role_id: String,

    #[command(flatten)]
    pub retry: RetryArgs,
}

impl RenderArgs {
    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry.policy()
    }
}

/// Pacing of optimistic ConfigMap writes.
#[derive(Args, Clone, Debug)]
pub struct RetryArgs {
    #[arg(
        long,
        env = "RANKTABLE_RETRY_INTERVAL_MS",
        default_value_t = 100,
        help = "Interval between ConfigMap write attempts"
    )]
    pub retry_interval_ms: u64,

    #[arg(
        long,
        env = "RANKTABLE_RETRY_TIMEOUT_MS",
        default_value_t = 5000,
        help = "Give up on a ConfigMap write after this long"
    )]
    pub retry_timeout_ms: u64,
}

impl RetryArgs {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            interval: Duration::from_millis(self.retry_interval_ms),
            timeout: Duration::from_millis(self.retry_timeout_ms),
        }
    }
}

#[derive(Parser, Clone, Debug)]
pub struct ValidateArgs {
    #[command(flatten)]
    pub templates: TemplateArgs,
}

#[cfg(test)]
mod tests {
    use clap::Parser;
    use similar_asserts::assert_eq;

    use super::*;
    use crate::config::Cli;
    use crate::config::Commands;

    #[test]
    fn render_defaults() {
        let cli = Cli::try_parse_from([
            "modelserving-plugins",
            "render",
            "--template-dir",
            "/templates",
            "--template",
            "mindie-role",
            "--annotations",
            "pods.json",
            "--namespace",
            "kthena-system",
        ])
        .unwrap();

        let Commands::Render(args) = cli.command else {
            panic!("expected render");
        };
        assert_eq!(args.templates.namespace, "kthena-system");
        assert_eq!(args.templates.template, "mindie-role");
        assert_eq!(args.retry_policy(), RetryPolicy::default());
    }

    #[test]
    fn validate_requires_template() {
        assert!(
            Cli::try_parse_from(["modelserving-plugins", "validate", "--template-dir", "/t"]).is_err()
        );
    }
}
