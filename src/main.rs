use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::fmt::format::FmtSpan;

use percolator::errors::Error;
use percolator::settings::Settings;
use percolator::store::{PgStore, Store};
use percolator::Pipeline;

/// The NBA percolator, preprocessing biodiversity imports into delta files
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the configuration file
    #[arg(long, default_value = "config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Process a job manifest and emit delta files
    Run {
        /// The job manifest dropped in the jobs directory
        manifest: PathBuf,

        /// Truncate current and rebuild it from the import files
        #[arg(long)]
        tabula_rasa: bool,
    },

    /// Create the per-source table pairs and the delete registry
    Init,

    /// Export a source's current records as enriched jsonlines
    Export {
        /// The source to export, eg. brahms-specimen
        source: String,

        /// Write to a file instead of stdout
        #[arg(long)]
        output: Option<PathBuf>,
    },
}


fn main() -> Result<(), Error> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt::fmt()
        .with_span_events(FmtSpan::CLOSE)
        .with_target(false)
        .with_level(false)
        .init();

    let cli = Cli::parse();
    let settings = Settings::load(&cli.config)?;

    match &cli.command {
        Commands::Run { manifest, tabula_rasa } => {
            let store = PgStore::connect(&settings.database_url()?)?;
            let mut pipeline = Pipeline::new(settings, store)?;
            if let Err(err) = pipeline.run_job(manifest, *tabula_rasa) {
                pipeline.notifier.post(&format!("*Percolator* failed: {err}"));
                return Err(err);
            }
        }

        Commands::Init => {
            let mut store = PgStore::connect(&settings.database_url()?)?;
            let sources: Vec<_> = settings.sources.values().cloned().collect();
            store.ensure_schema(&sources)?;
            for source in &sources {
                store.build_indexes(source, percolator::store::TableKind::Import)?;
                store.build_indexes(source, percolator::store::TableKind::Current)?;
            }
        }

        Commands::Export { source, output } => {
            let store = PgStore::connect(&settings.database_url()?)?;
            let mut pipeline = Pipeline::new(settings, store)?;
            pipeline.set_source(source)?;

            let count = match output {
                Some(path) => {
                    let mut file = std::fs::File::create(path)?;
                    pipeline.export_records(&mut file)?
                }
                None => {
                    let stdout = std::io::stdout();
                    let mut out = stdout.lock();
                    pipeline.export_records(&mut out)?
                }
            };
            tracing::info!(source, count, "Exported records");
        }
    }

    Ok(())
}
