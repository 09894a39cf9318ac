use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use env_logger::Env;
use log::{info, warn};
use pore_lib::{
    detectors::worker::serve,
    export::write_event_table_parquet,
    io::{inspect_files, open_reader},
    params::{read_parameters, validate, RawParameters},
    pipeline::{Message, PipelineOptions, PipelineRun, RunOutcome, WorkerCommand},
    store::EventStore,
};
use serde::Serialize;
use std::{
    io,
    path::{Path, PathBuf},
    process::ExitCode,
    time::Duration,
};

#[derive(Parser)]
#[command(
    name = "pore",
    version,
    about = "Detect and store translocation events in nanopore current traces"
)]
struct Cli {
    /// Log level filter (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

/// Detection parameters: an optional TOML file plus per-field overrides.
#[derive(Args, Debug, Default)]
struct ParamArgs {
    #[arg(long)]
    params: Option<PathBuf>,
    #[arg(long)]
    min_event_length: Option<String>,
    #[arg(long)]
    max_event_length: Option<String>,
    #[arg(long)]
    baseline_mode: Option<String>,
    #[arg(long)]
    filter_parameter: Option<String>,
    #[arg(long)]
    baseline_current: Option<String>,
    #[arg(long)]
    threshold_direction: Option<String>,
    #[arg(long)]
    threshold_mode: Option<String>,
    #[arg(long)]
    start_stddev: Option<String>,
    #[arg(long)]
    end_stddev: Option<String>,
    #[arg(long)]
    absolute_change_start: Option<String>,
    #[arg(long)]
    absolute_change_end: Option<String>,
    #[arg(long)]
    percent_change_start: Option<String>,
    #[arg(long)]
    percent_change_end: Option<String>,
}

impl ParamArgs {
    fn raw(&self) -> Result<RawParameters> {
        let mut raw = match &self.params {
            Some(path) => read_parameters(path)?,
            None => RawParameters::default(),
        };
        let overrides = [
            (&self.min_event_length, &mut raw.min_event_length),
            (&self.max_event_length, &mut raw.max_event_length),
            (&self.baseline_mode, &mut raw.baseline_mode),
            (&self.filter_parameter, &mut raw.filter_parameter),
            (&self.baseline_current, &mut raw.baseline_current),
            (&self.threshold_direction, &mut raw.threshold_direction),
            (&self.threshold_mode, &mut raw.threshold_mode),
            (&self.start_stddev, &mut raw.start_stddev),
            (&self.end_stddev, &mut raw.end_stddev),
            (&self.absolute_change_start, &mut raw.absolute_change_start),
            (&self.absolute_change_end, &mut raw.absolute_change_end),
            (&self.percent_change_start, &mut raw.percent_change_start),
            (&self.percent_change_end, &mut raw.percent_change_end),
        ];
        for (value, field) in overrides {
            if let Some(value) = value {
                *field = value.clone();
            }
        }
        Ok(raw)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Validate detection parameters and print the resulting configuration
    Validate {
        #[command(flatten)]
        params: ParamArgs,
    },
    /// Print sample rate and length of each trace file
    Info {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Create an event store holding the samples of a trace file
    Import {
        #[arg(long)]
        input: PathBuf,
        #[arg(long)]
        out: PathBuf,
    },
    /// Run event detection out of process and append the events to a store
    FindEvents {
        #[arg(long)]
        out: PathBuf,
        #[command(flatten)]
        params: ParamArgs,
        /// Delivery tick period in milliseconds
        #[arg(long, default_value_t = 500)]
        tick_ms: u64,
        /// Reset an existing store before detecting
        #[arg(long)]
        clean: bool,
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Print the event count of a store, or one event row
    Events {
        #[arg(long)]
        store: PathBuf,
        #[arg(long)]
        row: Option<usize>,
    },
    /// Delete every event and reset the store's sample area
    Clean {
        #[arg(long)]
        store: PathBuf,
    },
    /// Write the event table to Parquet
    Export {
        #[arg(long)]
        store: PathBuf,
        #[arg(long)]
        out: PathBuf,
    },
    #[command(hide = true)]
    DetectWorker,
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    env_logger::Builder::from_env(Env::default().default_filter_or(&cli.log_level)).init();
    match cli.command {
        Commands::Validate { params } => cmd_validate(&params),
        Commands::Info { files } => cmd_info(&files),
        Commands::Import { input, out } => cmd_import(&input, &out),
        Commands::FindEvents {
            out,
            params,
            tick_ms,
            clean,
            files,
        } => cmd_find_events(&out, &params, tick_ms, clean, &files, &cli.log_level),
        Commands::Events { store, row } => cmd_events(&store, row),
        Commands::Clean { store } => cmd_clean(&store),
        Commands::Export { store, out } => cmd_export(&store, &out),
        Commands::DetectWorker => {
            serve(io::stdin().lock(), io::stdout().lock())?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

const INVALID_PARAMETERS: u8 = 2;

fn cmd_validate(params: &ParamArgs) -> Result<ExitCode> {
    match validate(&params.raw()?) {
        Ok(config) => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(ExitCode::SUCCESS)
        }
        Err(err) => {
            eprintln!("Invalid parameters: {}", err);
            Ok(ExitCode::from(INVALID_PARAMETERS))
        }
    }
}

fn cmd_info(files: &[PathBuf]) -> Result<ExitCode> {
    let mut readable = 0;
    for result in inspect_files(files) {
        match result {
            Ok(meta) => {
                readable += 1;
                println!("{}", serde_json::to_string(&meta)?);
            }
            Err(err) => eprintln!("Error: {}", err),
        }
    }
    Ok(if readable > 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

#[derive(Serialize)]
struct StoreSummary {
    n_points: usize,
    sample_rate: f64,
    events: usize,
}

impl StoreSummary {
    fn of(store: &mut EventStore) -> Result<Self> {
        Ok(Self {
            n_points: store.row_count()?,
            sample_rate: store.sample_rate(),
            events: store.event_count()?,
        })
    }
}

/// Create a store sized to `input` and copy its samples into the raw area.
fn import_trace(input: &Path, out: &Path) -> Result<EventStore> {
    let (mut reader, meta) = open_reader(input)?;
    let data = reader.get_all_data(false)?;
    reader.close();
    let mut store = EventStore::create(out, data.len(), meta.sample_rate)
        .with_context(|| format!("creating store {}", out.display()))?;
    store.write_samples(0, &data)?;
    store.flush()?;
    info!(
        "Imported {} samples from {} into {}",
        data.len(),
        input.display(),
        out.display()
    );
    Ok(store)
}

fn cmd_import(input: &Path, out: &Path) -> Result<ExitCode> {
    let mut store = import_trace(input, out)?;
    println!("{}", serde_json::to_string(&StoreSummary::of(&mut store)?)?);
    Ok(ExitCode::SUCCESS)
}

#[derive(Serialize)]
struct FindEventsSummary {
    events: usize,
    appended: usize,
    last_status: Option<String>,
    outcome: RunOutcome,
}

fn cmd_find_events(
    out: &Path,
    params: &ParamArgs,
    tick_ms: u64,
    clean: bool,
    files: &[PathBuf],
    log_level: &str,
) -> Result<ExitCode> {
    let config = match validate(&params.raw()?) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Invalid parameters: {}", err);
            return Ok(ExitCode::from(INVALID_PARAMETERS));
        }
    };

    let mut store = if out.exists() {
        let mut store = EventStore::open_append(out)
            .with_context(|| format!("opening store {}", out.display()))?;
        if clean {
            store.clean()?;
        }
        store
    } else {
        import_trace(&files[0], out)?
    };

    let command = WorkerCommand::current_exe()
        .context("locating the pore executable")?
        .arg("--log-level")
        .arg(log_level);
    let options = PipelineOptions {
        tick_period: Duration::from_millis(tick_ms.max(1)),
        ..PipelineOptions::default()
    };
    let run = PipelineRun::spawn(&command, files, &config, options)?;
    let cancel = run.cancel_handle();

    let mut appended = 0;
    let mut last_status = None;
    let mut append_error = None;
    let outcome = run.drive(|message| match message {
        Message::StatusUpdate(text) => {
            eprintln!("{}", text);
            last_status = Some(text);
        }
        Message::EventsBatch(batch) => {
            if append_error.is_some() {
                return;
            }
            match store.append_events(&batch) {
                Ok(rows) => appended += rows.len(),
                Err(err) => {
                    warn!("could not store events: {}", err);
                    append_error = Some(err);
                    cancel.cancel();
                }
            }
        }
        Message::Done => {}
    });
    if let Some(err) = append_error {
        return Err(err).context("appending events to the store");
    }

    let summary = FindEventsSummary {
        events: store.event_count()?,
        appended,
        last_status,
        outcome: outcome.clone(),
    };
    println!("{}", serde_json::to_string(&summary)?);
    Ok(match outcome {
        RunOutcome::Completed => ExitCode::SUCCESS,
        _ => ExitCode::FAILURE,
    })
}

fn cmd_events(path: &Path, row: Option<usize>) -> Result<ExitCode> {
    let mut store = EventStore::open_read_only(path)?;
    match row {
        Some(index) => println!("{}", serde_json::to_string(&store.event_row(index)?)?),
        None => println!("{}", serde_json::to_string(&StoreSummary::of(&mut store)?)?),
    }
    Ok(ExitCode::SUCCESS)
}

fn cmd_clean(path: &Path) -> Result<ExitCode> {
    let mut store = EventStore::open_append(path)?;
    store.clean()?;
    println!("{}", serde_json::to_string(&StoreSummary::of(&mut store)?)?);
    Ok(ExitCode::SUCCESS)
}

fn cmd_export(path: &Path, out: &Path) -> Result<ExitCode> {
    let store = EventStore::open_read_only(path)?;
    let rows = write_event_table_parquet(&store, out)?;
    println!("{}", serde_json::json!({ "rows": rows, "out": out }));
    Ok(ExitCode::SUCCESS)
}
