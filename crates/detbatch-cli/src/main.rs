use clap::Parser;
use tracing_subscriber::EnvFilter;

mod cli;

use cli::{Cli, Command, RunOverrides};

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_writer(std::io::stderr)
        .init();

    tracing::info!("detbatch v{}", env!("CARGO_PKG_VERSION"));

    let mut config = cli::load_config(&cli)?;

    match cli.command {
        Command::Run {
            input_dir,
            output_dir,
            workers,
            pool_multiplier,
            savers,
            mode,
            max_depth,
            json,
        } => {
            RunOverrides {
                input_dir,
                output_dir,
                workers,
                pool_multiplier,
                savers,
                mode,
                max_depth,
            }
            .apply(&mut config);

            tracing::info!(
                input = %config.input_dir.display(),
                output = %config.output_dir.display(),
                workers = config.workers,
                mode = ?config.mode,
                "batch detection"
            );
            let report = cli::run_batch(config)?;

            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            }
            eprintln!(
                "[{}/{} written | {:.1}ms | {:.1} img/s | peak {} of {} slabs]",
                report.written,
                report.discovered,
                report.elapsed_ms,
                report.images_per_second(),
                report.peak_leased,
                report.pool_capacity
            );
            if report.failures() > 0 {
                tracing::warn!(
                    decode = report.decode_failures,
                    inference = report.inference_failures,
                    write = report.write_failures,
                    "some images were skipped"
                );
            }
        }
        Command::Detect { input, repeat } => {
            cli::detect_one(&config, &input, repeat)?;
        }
        Command::ShowConfig => {
            config.validate()?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}
