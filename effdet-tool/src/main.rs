use anyhow::{bail, Context, Result};
use bbox::prelude::*;
use effdet::Config;
use log::{info, LevelFilter};
use prettytable::{cell, row, Table};
use std::{env, path::PathBuf};
use structopt::StructOpt;

#[derive(Debug, Clone, StructOpt)]
/// Inspect detection pipeline configurations.
enum Args {
    /// Print the resolved configuration as JSON.
    Config {
        #[structopt(flatten)]
        source: Source,
    },
    /// Print the anchor layout of each feature level.
    Anchors {
        #[structopt(flatten)]
        source: Source,
    },
}

#[derive(Debug, Clone, StructOpt)]
struct Source {
    #[structopt(long)]
    /// JSON5 configuration file
    config_file: Option<PathBuf>,
    #[structopt(long)]
    /// model variant, efficientdet_d0 to efficientdet_d7
    preset: Option<String>,
}

impl Source {
    fn load(&self) -> Result<Config> {
        match (&self.config_file, &self.preset) {
            (Some(_), Some(_)) => bail!("--config-file and --preset cannot be used together"),
            (Some(config_file), None) => Config::open(config_file).with_context(|| {
                format!("failed to load config file '{}'", config_file.display())
            }),
            (None, Some(preset)) => Config::efficientdet(preset),
            (None, None) => Config::efficientdet("efficientdet_d0"),
        }
    }
}

fn main() -> Result<()> {
    let mut builder = pretty_env_logger::formatted_builder();
    match env::var("RUST_LOG") {
        Ok(filters) => builder.parse_filters(&filters),
        Err(_) => builder.filter_level(LevelFilter::Info),
    };
    builder.init();

    match Args::from_args() {
        Args::Config { source } => print_config(&source.load()?)?,
        Args::Anchors { source } => print_anchors(&source.load()?)?,
    }

    Ok(())
}

fn print_config(config: &Config) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(config)?);
    Ok(())
}

fn print_anchors(config: &Config) -> Result<()> {
    let anchors = config.anchors_init().build()?;

    let mut table = Table::new();
    table.add_row(row![
        "level",
        "stride",
        "grid",
        "anchors per cell",
        "anchors",
        "offset",
        "first anchor (t, l, b, r)"
    ]);

    for info in anchors.levels() {
        let first = anchors
            .get(info.offset())
            .map(|anchor| format!("{:?}", anchor.tlbr()))
            .unwrap_or_default();

        table.add_row(row![
            info.level(),
            info.stride(),
            format!("{}x{}", info.grid_h(), info.grid_w()),
            info.anchors_per_cell(),
            info.num_anchors(),
            info.offset(),
            first
        ]);
    }

    table.printstd();
    info!(
        "{} anchors for {}x{} input",
        anchors.num_anchors(),
        anchors.image_size(),
        anchors.image_size()
    );

    Ok(())
}
