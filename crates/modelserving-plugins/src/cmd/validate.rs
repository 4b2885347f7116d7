use std::sync::Arc;

use anyhow::Result;
use modelserving_plugins::config::ValidateArgs;
use modelserving_plugins::domain::ranktable::aggregate;
use modelserving_plugins::domain::ranktable::JinjaEngine;
use modelserving_plugins::domain::ranktable::RanktableStatus;
use modelserving_plugins::domain::ranktable::Renderer;
use modelserving_plugins::domain::ranktable::SystemClock;
use modelserving_plugins::domain::ranktable::TemplateResolver;
use modelserving_plugins::infrastructure::store::memory::InMemoryStore;
use tracing::info;

use super::load_template_dir;

pub fn run_validate(args: ValidateArgs) -> Result<()> {
    let store = InMemoryStore::new();
    load_template_dir(&store, &args.templates.template_dir, &args.templates.namespace)?;

    let template = TemplateResolver::new(args.templates.namespace.clone())
        .resolve(&store, &args.templates.template)
        .map_err(|e| anyhow::anyhow!("Failed to resolve template: {e:?}"))?;
    info!(
        level = %template.level,
        engine = %template.inference_engine,
        annotation = %template.pod_annotation_name,
        "Resolved template"
    );

    let data = aggregate(RanktableStatus::Initializing, &[], &SystemClock);
    let content = Renderer::new(Arc::new(JinjaEngine::new()))
        .render(&template.ranktable_template, &data)
        .map_err(|e| anyhow::anyhow!("Template does not render: {e:?}"))?;

    println!(
        "{}: {} level rank table, {} bytes when initializing, mounted at {}/{}",
        args.templates.template,
        template.level,
        content.len(),
        template.mount_path,
        template.filename
    );
    Ok(())
}
