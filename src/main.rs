use std::io::IsTerminal;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::Layer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use anka_provision::anka::{AnkaCli, VmClient};
use anka_provision::artifact::Artifact;
use anka_provision::cli::{Cli, Command, OutputFormat};
use anka_provision::config::{self, BuildConfig};
use anka_provision::error::ProvisionError;
use anka_provision::flow::BuildContext;
use anka_provision::observer::interactive::InteractiveUi;
use anka_provision::observer::json::JsonUi;
use anka_provision::observer::plain::PlainUi;
use anka_provision::observer::{OutputMode, Ui};
use anka_provision::util::RandomNames;
use anka_provision::{builder, logging, paths, push};

#[derive(facet::Facet)]
struct ShowJson {
    name: String,
    uuid: String,
    status: String,
    cpu_cores: u32,
    ram: String,
    hard_drive: u64,
}

#[derive(facet::Facet)]
struct ValidJson {
    valid: bool,
    builder: String,
    vm_name: String,
}

#[tokio::main]
async fn main() -> miette::Result<()> {
    let cli = Cli::parse();

    let output_format = resolve_output_format(cli.output);
    let mode = resolve_output_mode(output_format, cli.verbose, cli.quiet);

    // Spinners own the terminal in Normal/Quiet; tracing there would break redraws.
    let terminal_filter = match mode {
        OutputMode::Verbose => EnvFilter::new("debug"),
        OutputMode::Normal | OutputMode::Quiet => EnvFilter::new("off"),
        OutputMode::Plain => EnvFilter::from_default_env()
            .add_directive("anka_provision=info".parse().expect("valid log directive")),
    };

    let terminal_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(terminal_filter);

    // discards until a build activates its log file
    let (file_writer, file_handle) = logging::DeferredFileWriter::new();
    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(file_writer)
        .with_filter(EnvFilter::new("anka_provision=debug"));

    tracing_subscriber::registry()
        .with(terminal_layer)
        .with(file_layer)
        .init();

    let ui = make_ui(output_format, mode);

    match cli.command {
        Command::Validate => {
            let build_config = config::load_config(&cli.config)?;
            let builder = format!("{:?}", build_config.kind).to_lowercase();
            let vm_name = build_config.vm_name.clone().unwrap_or_default();
            if output_format == OutputFormat::Json {
                println!(
                    "{}",
                    facet_json::to_string(&ValidJson {
                        valid: true,
                        builder,
                        vm_name,
                    })
                    .expect("JSON serialization"),
                );
            } else {
                println!("{}: valid {builder} configuration", cli.config.display());
            }
        }
        Command::Show { vm } => {
            let client = VmClient::new(AnkaCli::new(config::load_tool(&cli.config)?));
            let shown = client.show(&vm).await?;
            if output_format == OutputFormat::Json {
                println!(
                    "{}",
                    facet_json::to_string(&ShowJson {
                        name: shown.name,
                        uuid: shown.uuid,
                        status: shown.status.as_str().into(),
                        cpu_cores: shown.cpu_cores,
                        ram: shown.ram,
                        hard_drive: shown.hard_drive,
                    })
                    .expect("JSON serialization"),
                );
            } else {
                println!("VM '{}': {}", shown.name, shown.status.as_str());
                println!("  UUID: {}", shown.uuid);
                println!("  CPU: {}", shown.cpu_cores);
                println!("  RAM: {}", shown.ram);
                println!("  Disk: {} bytes", shown.hard_drive);
            }
        }
        Command::Delete { vm } => {
            let client = VmClient::new(AnkaCli::new(config::load_tool(&cli.config)?));
            client.delete(&vm).await?;
            ui.say(&format!("Deleted VM {vm}"));
        }
        Command::Push { vm } => {
            let build_config = config::load_config(&cli.config)?;
            let name = vm
                .or_else(|| build_config.vm_name.clone())
                .ok_or_else(|| ProvisionError::Validation {
                    message: "no vm given and vm.name is not set".into(),
                })?;
            let client = VmClient::new(AnkaCli::new(&build_config.tool));
            let shown = client.show(&name).await?;
            let artifact = Artifact {
                vm_name: shown.name,
                uuid: shown.uuid,
                generated: Default::default(),
            };
            run_push(&client, &build_config, &artifact, ui.as_ref()).await?;
        }
        Command::Build { force, no_push } => {
            let mut build_config = config::load_config(&cli.config)?;
            if force {
                build_config.force = true;
            }

            let logs_dir = paths::logs_dir();
            if std::fs::create_dir_all(&logs_dir).is_ok() {
                logging::rotate_build_logs(&logs_dir, logging::KEEP_BUILD_LOGS);
                let label = build_config
                    .vm_name
                    .clone()
                    .or_else(|| build_config.source_vm.clone())
                    .unwrap_or_else(|| "build".into());
                file_handle
                    .set_file(&logging::build_log_path(&logs_dir, &label))
                    .ok();
            }

            let cancel = CancellationToken::new();
            let on_signal = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    on_signal.cancel();
                }
            });

            let client = VmClient::new(AnkaCli::new(&build_config.tool));
            let version = client.version().await?;
            tracing::info!(product = %version.product, version = %version.version, build = %version.build, "anka version");

            let push_after = !no_push && build_config.push.is_some();
            let mut ctx = BuildContext::new(
                build_config,
                client,
                ui.clone(),
                Box::new(RandomNames::new()),
            );
            ctx.logs_dir = Some(logs_dir);

            let artifact = builder::build(&mut ctx, &cancel).await?;
            if push_after {
                run_push(&ctx.client, &ctx.config, &artifact, ui.as_ref()).await?;
            }

            if output_format == OutputFormat::Json {
                println!("{}", artifact.to_json()?);
            } else {
                println!("{artifact}");
            }
        }
    }

    Ok(())
}

async fn run_push(
    client: &VmClient<AnkaCli>,
    config: &BuildConfig,
    artifact: &Artifact,
    ui: &dyn Ui,
) -> Result<(), ProvisionError> {
    let settings = config.push.as_ref().ok_or_else(|| ProvisionError::Validation {
        message: "no [push] section in the config".into(),
    })?;
    push::push_artifact(client, &config.registry, settings, artifact, ui).await
}

fn make_ui(format: OutputFormat, mode: OutputMode) -> Arc<dyn Ui> {
    match format {
        OutputFormat::Json => Arc::new(JsonUi::new()),
        OutputFormat::Interactive | OutputFormat::Auto => Arc::new(InteractiveUi::new(mode)),
        OutputFormat::Plain => Arc::new(PlainUi::new(mode)),
    }
}

/// `Auto` becomes `Plain` when stdout or stdin is not a TTY.
fn resolve_output_format(format: OutputFormat) -> OutputFormat {
    match format {
        OutputFormat::Auto => {
            if !std::io::stdout().is_terminal() || !std::io::stdin().is_terminal() {
                OutputFormat::Plain
            } else {
                OutputFormat::Interactive
            }
        }
        other => other,
    }
}

/// Map the resolved output format plus `--verbose`/`--quiet` to an [`OutputMode`].
fn resolve_output_mode(format: OutputFormat, verbose: bool, quiet: bool) -> OutputMode {
    match format {
        OutputFormat::Json => {
            if verbose || quiet {
                eprintln!("warning: --verbose/--quiet ignored in JSON output mode");
            }
            OutputMode::Plain
        }
        OutputFormat::Plain => {
            if quiet {
                OutputMode::Quiet
            } else if verbose {
                OutputMode::Verbose
            } else {
                OutputMode::Plain
            }
        }
        OutputFormat::Interactive | OutputFormat::Auto => {
            if quiet {
                OutputMode::Quiet
            } else if verbose {
                OutputMode::Verbose
            } else {
                OutputMode::Normal
            }
        }
    }
}
