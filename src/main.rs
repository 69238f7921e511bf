//! Command-line exporter: JSON-lines document stream in, CSV + JSON files out.

use anyhow::{Context, Result};
use clap::Parser;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use daq_csv_export::config::{ExportConfig, WriteMode};
use daq_csv_export::data::MultiFileManager;
use daq_csv_export::experiment::JsonLinesSource;
use daq_csv_export::try_export;

/// Export a recorded experiment run to CSV files and a JSON metadata sidecar.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// JSON-lines file of ["name", {document}] pairs, or "-" for stdin
    input: PathBuf,

    /// Output directory
    #[arg(short, long, default_value = ".")]
    directory: PathBuf,

    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// File prefix template, e.g. "{plan_name}-{scan_id}-"
    #[arg(long)]
    file_prefix: Option<String>,

    /// Name of the row-index column
    #[arg(long)]
    index_label: Option<String>,

    /// Do not write header rows
    #[arg(long)]
    no_header: bool,

    /// Overwrite existing output files instead of refusing to clobber them
    #[arg(long)]
    truncate: bool,

    /// Sync files to disk after every batch
    #[arg(long)]
    flush: bool,
}

impl Cli {
    fn export_config(&self) -> Result<ExportConfig> {
        let mut config = match &self.config {
            Some(path) => ExportConfig::load_from(path)
                .with_context(|| format!("Failed to load config from {:?}", path))?,
            None => ExportConfig::load().context("Failed to load config")?,
        };
        if let Some(prefix) = &self.file_prefix {
            config = config.with_file_prefix(prefix);
        }
        if let Some(label) = &self.index_label {
            config = config.with_index_label(label);
        }
        if self.no_header {
            config = config.with_header(false);
        }
        if self.truncate {
            config = config.with_mode(WriteMode::Truncate);
        }
        if self.flush {
            config = config.with_flush(true);
        }
        config.validate().context("Invalid export options")?;
        Ok(config)
    }

    fn reader(&self) -> Result<Box<dyn BufRead>> {
        if self.input.as_os_str() == "-" {
            return Ok(Box::new(BufReader::new(io::stdin())));
        }
        let file = File::open(&self.input)
            .with_context(|| format!("Failed to open input {:?}", self.input))?;
        Ok(Box::new(BufReader::new(file)))
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = cli.export_config()?;
    let source = JsonLinesSource::new(cli.reader()?);

    tracing::info!("Exporting {:?} into {:?}", cli.input, cli.directory);
    let artifacts = try_export(source, MultiFileManager::new(&cli.directory), config)
        .context("Export failed")?;

    for (label, paths) in &artifacts {
        for path in paths {
            println!("{label}\t{}", path.display());
        }
    }
    Ok(())
}
