mod scan;

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use jdataflow::config::AnalysisConfig;
use jdataflow::context::AnalysisContext;
use jdataflow::descriptor::ClassDescriptor;
use jdataflow::engines::analyze_class;
use rayon::prelude::*;
use serde_json::json;
use serde_sarif::sarif::{
    Artifact, Invocation, Message, Notification, Run, SCHEMA_URL, Sarif, Tool, ToolComponent,
};
use tracing::{debug, error, info, info_span, warn};
use tracing_subscriber::EnvFilter;

use crate::scan::scan_inputs;

/// CLI arguments for jdataflow execution.
#[derive(Parser, Debug)]
#[command(
    name = "jdataflow",
    about = "Dataflow analysis over JVM class files and JAR files, reported as SARIF.",
    version
)]
struct Cli {
    #[arg(long, value_name = "PATH")]
    input: PathBuf,
    #[arg(long, value_name = "PATH")]
    classpath: Vec<PathBuf>,
    #[arg(long, value_name = "PATH")]
    output: Option<PathBuf>,
    /// JSON analysis settings; missing keys take their defaults.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
    #[arg(long, value_name = "N")]
    max_iterations: Option<usize>,
    /// Analyze classes on the calling thread only.
    #[arg(long)]
    sequential: bool,
    #[arg(long)]
    quiet: bool,
    #[arg(long)]
    timing: bool,
    #[arg(long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose)?;
    run(cli)
}

fn init_tracing(verbose: bool) -> Result<()> {
    let default_level = if verbose { "debug" } else { "warn" };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(env_filter)
        .with_writer(io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber).context("failed to install log subscriber")
}

fn run(cli: Cli) -> Result<()> {
    if !cli.input.exists() {
        anyhow::bail!("input not found: {}", cli.input.display());
    }
    for entry in &cli.classpath {
        if !entry.exists() {
            anyhow::bail!("classpath entry not found: {}", entry.display());
        }
    }

    let config = load_config(&cli)?;
    let started_at = Instant::now();

    let (artifacts, notifications, successful, ctx, class_count) = match scan_inputs(&cli.input, &cli.classpath) {
        Ok(scan) => {
            let class_count = scan.class_count();
            let classes = scan
                .classes
                .iter()
                .map(|class| (class.uri.as_str(), class.bytes.as_slice(), class.is_input));
            let (ctx, notifications) = analyze(classes, config)?;
            (scan.artifacts, notifications, true, Some(ctx), class_count)
        }
        Err(err) => {
            error!(error = %format!("{err:#}"), "input scanning failed");
            let notification = notification("error", format!("input scanning failed: {err:#}"));
            (Vec::new(), vec![notification], false, None, 0)
        }
    };

    let artifact_count = artifacts.len();
    let invocation = build_invocation(successful, notifications);
    let sarif = build_sarif(artifacts, invocation);

    let mut writer = output_writer(cli.output.as_deref())?;
    serde_json::to_writer_pretty(&mut writer, &sarif).context("failed to serialize SARIF output")?;
    writer.write_all(b"\n").context("failed to write SARIF output")?;

    if cli.timing && !cli.quiet {
        eprintln!(
            "timing: total_ms={} classes={} artifacts={}",
            started_at.elapsed().as_millis(),
            class_count,
            artifact_count
        );
        if let Some(ctx) = &ctx {
            for (kind, entry) in ctx.profiler().snapshot() {
                eprintln!(
                    "timing: analysis={} invocations={} total_ms={}",
                    kind,
                    entry.invocations,
                    entry.elapsed.as_millis()
                );
            }
        }
    }

    Ok(())
}

fn load_config(cli: &Cli) -> Result<AnalysisConfig> {
    let mut config = match &cli.config {
        Some(path) => {
            let json = fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
            AnalysisConfig::from_json(&json).with_context(|| format!("failed to parse {}", path.display()))?
        }
        None => AnalysisConfig::default(),
    };
    if let Some(max_iterations) = cli.max_iterations {
        config.max_iterations = max_iterations;
    }
    if cli.sequential {
        config.parallel = false;
    }
    debug!(?config, "analysis configuration");
    Ok(config)
}

/// Loads every scanned class, then analyzes the input classes.
///
/// Failures of single classes or methods become notifications; only a broken
/// context setup aborts.
fn analyze<'a>(
    classes: impl Iterator<Item = (&'a str, &'a [u8], bool)>,
    config: AnalysisConfig,
) -> Result<(AnalysisContext, Vec<Notification>)> {
    let parallel = config.parallel;
    let ctx = AnalysisContext::new(config).context("failed to set up analysis context")?;
    let mut notifications = Vec::new();
    let mut inputs: Vec<ClassDescriptor> = Vec::new();

    for (uri, bytes, is_input) in classes {
        match ctx.add_class(bytes.to_vec(), uri) {
            Ok(descriptor) => {
                if is_input {
                    inputs.push(descriptor);
                }
            }
            Err(err) => {
                error!(artifact = uri, error = %err, "failed to load class");
                notifications.push(notification("error", format!("{uri}: {err}")));
            }
        }
    }
    inputs.sort();
    inputs.dedup();
    info!(classes = ctx.class_count(), inputs = inputs.len(), "classes loaded");

    let per_class: Vec<Vec<Notification>> = if parallel {
        inputs.par_iter().map(|class| analyze_one(&ctx, class)).collect()
    } else {
        inputs.iter().map(|class| analyze_one(&ctx, class)).collect()
    };
    notifications.extend(per_class.into_iter().flatten());

    Ok((ctx, notifications))
}

fn analyze_one(ctx: &AnalysisContext, class: &ClassDescriptor) -> Vec<Notification> {
    let span = info_span!("class", %class);
    let _entered = span.enter();

    let outcomes = match analyze_class(ctx, class) {
        Ok(outcomes) => outcomes,
        Err(err) => {
            error!(error = %err, "class analysis failed");
            return vec![notification("error", format!("{class}: {err}"))];
        }
    };

    let mut notifications = Vec::new();
    for (method, outcome) in outcomes {
        if let Err(err) = outcome {
            warn!(%method, error = %err, "method analysis failed");
            notifications.push(notification("warning", format!("{method}: {err}")));
        }
    }
    notifications
}

fn notification(level: &str, text: String) -> Notification {
    Notification::builder()
        .message(Message::builder().text(text).build())
        .level(json!(level))
        .build()
}

fn output_writer(output: Option<&Path>) -> Result<Box<dyn Write>> {
    match output {
        Some(path) if path == Path::new("-") => Ok(Box::new(io::stdout())),
        Some(path) => Ok(Box::new(
            File::create(path).with_context(|| format!("failed to open {}", path.display()))?,
        )),
        None => Ok(Box::new(io::stdout())),
    }
}

fn build_invocation(successful: bool, notifications: Vec<Notification>) -> Invocation {
    let arguments: Vec<String> = std::env::args().collect();
    let command_line = arguments.join(" ");

    Invocation::builder()
        .execution_successful(successful)
        .arguments(arguments)
        .command_line(command_line)
        .tool_execution_notifications(notifications)
        .build()
}

fn build_sarif(artifacts: Vec<Artifact>, invocation: Invocation) -> Sarif {
    let driver = ToolComponent::builder()
        .name("jdataflow")
        .version(env!("CARGO_PKG_VERSION"))
        .build();
    let tool = Tool {
        driver,
        extensions: None,
        properties: None,
    };
    let run = if artifacts.is_empty() {
        Run::builder()
            .tool(tool)
            .invocations(vec![invocation])
            .results(Vec::new())
            .build()
    } else {
        Run::builder()
            .tool(tool)
            .invocations(vec![invocation])
            .results(Vec::new())
            .artifacts(artifacts)
            .build()
    };

    Sarif::builder()
        .schema(SCHEMA_URL)
        .runs(vec![run])
        .version(json!("2.1.0"))
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sarif_value(notifications: Vec<Notification>, successful: bool) -> serde_json::Value {
        let invocation = Invocation::builder()
            .execution_successful(successful)
            .arguments(Vec::<String>::new())
            .tool_execution_notifications(notifications)
            .build();
        let sarif = build_sarif(Vec::new(), invocation);
        serde_json::to_value(&sarif).expect("serialize SARIF")
    }

    #[test]
    fn sarif_is_minimal_and_valid_shape() {
        let value = sarif_value(Vec::new(), true);

        assert_eq!(value["version"], "2.1.0");
        assert_eq!(value["$schema"], SCHEMA_URL);
        assert_eq!(value["runs"][0]["tool"]["driver"]["name"], "jdataflow");
        assert!(value["runs"][0]["results"].as_array().expect("results array").is_empty());
        assert_eq!(value["runs"][0]["invocations"][0]["executionSuccessful"], true);
    }

    #[test]
    fn failures_are_reported_as_notifications() {
        let value = sarif_value(vec![notification("warning", "com.example.A.m()V: broken".to_string())], true);

        let reported = &value["runs"][0]["invocations"][0]["toolExecutionNotifications"][0];
        assert_eq!(reported["level"], "warning");
        assert_eq!(reported["message"]["text"], "com.example.A.m()V: broken");
    }

    #[test]
    fn unreadable_class_becomes_a_notification() {
        let classes = vec![("Broken.class", &b"not a class"[..], true)];
        let config = AnalysisConfig {
            parallel: false,
            ..AnalysisConfig::default()
        };

        let (ctx, notifications) = analyze(classes.into_iter(), config).expect("analyze");

        assert_eq!(ctx.class_count(), 0);
        assert_eq!(notifications.len(), 1);
        let value = serde_json::to_value(&notifications[0]).expect("serialize notification");
        assert_eq!(value["level"], "error");
        assert!(
            value["message"]["text"]
                .as_str()
                .expect("text")
                .starts_with("Broken.class: ")
        );
    }
}
