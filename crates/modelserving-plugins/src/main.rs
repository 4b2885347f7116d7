mod cmd;

use anyhow::Result;
use clap::Parser;
use modelserving_plugins::config::Cli;
use modelserving_plugins::config::Commands;
use utils::version;

/// Sets up global panic hooks.
fn setup_global_hooks() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        tracing::error!("Thread panicked: {}", panic_info);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_global_hooks();

    let cli = Cli::parse();

    match cli.command {
        Commands::Render(render_args) => {
            let _guard = utils::logging::init(render_args.templates.log_path.as_deref());
            tracing::info!("Starting rank table render {}", &**version::VERSION);
            cmd::render::run_render(render_args).await
        }
        Commands::Validate(validate_args) => {
            let _guard = utils::logging::init(validate_args.templates.log_path.as_deref());
            tracing::info!("Validating rank table template {}", &**version::VERSION);
            cmd::validate::run_validate(validate_args)
        }
        Commands::Reconcile(reconcile_args) => {
            let _guard = utils::logging::init(reconcile_args.log_path.as_deref());
            tracing::info!("Starting plugin reconcile {}", &**version::VERSION);
            cmd::reconcile::run_reconcile(reconcile_args).await
        }
    }
}
