use anyhow::{anyhow, bail, Context, Result};
use celltrack::{
    about,
    config::{TrackingParameters, WorkerTier},
    dataset::SaveSelection,
    engine::{CurationEngine, Engine, OpResult, Operation, ProjectState, Workflow},
    error::EngineError,
    metrics::MetricSelection,
    tracks::TrackId,
};
use serde::Serialize;
use std::{env, fs};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_STATE_PATH: &str = ".celltrack_state.json";
const LOG_ENV: &str = "CELLTRACK_LOG";

#[derive(Serialize)]
struct TrackSummary {
    id: TrackId,
    points: usize,
    first_slice: i32,
    last_slice: i32,
}

#[derive(Serialize)]
struct StateSummary {
    volume_shape: Option<[usize; 3]>,
    has_raw_data: bool,
    track_count: usize,
    displayed_track_count: usize,
    filter: Vec<TrackId>,
    tracks: Vec<TrackSummary>,
    parameters: TrackingParameters,
}

struct GlobalArgs {
    state_path: String,
    config_path: Option<String>,
    cmd_idx: usize,
}

fn usage() {
    eprintln!(
        "Usage:\n  \
  celltrack_cli --version\n  \
  celltrack_cli [--state PATH] [--config PATH] capabilities\n  \
  celltrack_cli [--state PATH] [--config PATH] op '<operation-json>'\n  \
  celltrack_cli [--state PATH] [--config PATH] workflow '<workflow-json>'\n  \
  celltrack_cli [--state PATH] state-summary\n  \
  celltrack_cli [--state PATH] export-state PATH\n  \
  celltrack_cli [--state PATH] import-state PATH\n  \
  celltrack_cli [--state PATH] import-dataset DIR\n  \
  celltrack_cli [--state PATH] export-dataset DIR [--displayed|--all]\n  \
  celltrack_cli [--state PATH] [--config PATH] track-all [--performance]\n  \
  celltrack_cli [--state PATH] filter 'ID[,ID...]'\n  \
  celltrack_cli [--state PATH] export-csv OUTPUT.csv [--speed] [--size]\n\n  \
  Tip: pass @file.json instead of inline JSON\n  \
  Log level: {LOG_ENV}=debug\n  \
  Exit status: 1 on failure, 2 when the input was rejected"
    );
}

fn init_logging() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();
}

fn load_json_arg(value: &str) -> Result<String> {
    if let Some(path) = value.strip_prefix('@') {
        fs::read_to_string(path).with_context(|| format!("Could not read JSON file '{path}'"))
    } else {
        Ok(value.to_string())
    }
}

fn load_state(path: &str) -> Result<ProjectState> {
    if std::path::Path::new(path).exists() {
        Ok(ProjectState::load_from_path(path)?)
    } else {
        Ok(ProjectState::default())
    }
}

fn load_engine(globals: &GlobalArgs) -> Result<CurationEngine> {
    let mut state = load_state(&globals.state_path)?;
    if let Some(config) = &globals.config_path {
        state.parameters = TrackingParameters::load_from_path(config)
            .with_context(|| format!("Invalid tracking config '{config}'"))?;
    }
    Ok(CurationEngine::from_state(state))
}

fn save_engine(engine: &CurationEngine, path: &str) -> Result<()> {
    engine.state().save_to_path(path)?;
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value).context("Could not serialize JSON output")?;
    println!("{text}");
    Ok(())
}

fn parse_global_args(args: &[String]) -> Result<GlobalArgs> {
    let mut globals = GlobalArgs {
        state_path: DEFAULT_STATE_PATH.to_string(),
        config_path: None,
        cmd_idx: 1,
    };
    while let Some(flag) = args.get(globals.cmd_idx) {
        let value = args.get(globals.cmd_idx + 1);
        match (flag.as_str(), value) {
            ("--state", Some(v)) => globals.state_path = v.clone(),
            ("--config", Some(v)) => globals.config_path = Some(v.clone()),
            ("--state" | "--config", None) => bail!("Missing path for {flag}"),
            _ => break,
        }
        globals.cmd_idx += 2;
    }
    Ok(globals)
}

fn summarize_state(engine: &CurationEngine) -> StateSummary {
    let state = engine.state();
    let tracks = state
        .tracks
        .cached()
        .trajectories()
        .into_iter()
        .map(|(id, trajectory)| TrackSummary {
            id,
            points: trajectory.len(),
            first_slice: trajectory.first().map(|p| p.slice).unwrap_or_default(),
            last_slice: trajectory.last().map(|p| p.slice).unwrap_or_default(),
        })
        .collect::<Vec<_>>();
    StateSummary {
        volume_shape: state.labels().map(|l| l.shape()),
        has_raw_data: state.raw_data.is_some(),
        track_count: tracks.len(),
        displayed_track_count: state.tracks.displayed().track_count(),
        filter: state.tracks.filter().to_vec(),
        tracks,
        parameters: state.parameters.clone(),
    }
}

fn required_arg<'a>(args: &'a [String], idx: usize, what: &str) -> Result<&'a String> {
    args.get(idx).ok_or_else(|| {
        usage();
        anyhow!("Missing {what}")
    })
}

fn apply_and_save(globals: &GlobalArgs, op: Operation) -> Result<OpResult> {
    let mut engine = load_engine(globals)?;
    let result = engine.apply(op)?;
    save_engine(&engine, &globals.state_path)?;
    Ok(result)
}

/// Exit status for a failed command: 2 when the input can be corrected and
/// the command retried, 1 otherwise.
fn exit_code(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<EngineError>() {
        Some(e) if e.is_input_error() => 2,
        _ => 1,
    }
}

fn main() {
    if let Err(e) = run() {
        eprintln!("{e:#}");
        std::process::exit(exit_code(&e));
    }
}

fn run() -> Result<()> {
    let args: Vec<String> = env::args().collect();
    if args.len() <= 1 {
        usage();
        bail!("Missing command");
    }
    if args.iter().any(|a| a == "--version" || a == "-V") {
        println!("{}", about::version_cli_text());
        return Ok(());
    }
    init_logging();

    let globals = parse_global_args(&args)?;
    let cmd_idx = globals.cmd_idx;
    let Some(command) = args.get(cmd_idx) else {
        usage();
        bail!("Missing command");
    };
    let flags = &args[cmd_idx + 1..];
    let has_flag = |name: &str| flags.iter().any(|a| a == name);

    match command.as_str() {
        "capabilities" => print_json(&CurationEngine::capabilities()),
        "import-state" => {
            let source = required_arg(&args, cmd_idx + 1, "path for import-state")?;
            let state = ProjectState::load_from_path(source)?;
            state.save_to_path(&globals.state_path)?;
            println!("Loaded state from '{source}' into '{}'", globals.state_path);
            Ok(())
        }
        "export-state" => {
            let target = required_arg(&args, cmd_idx + 1, "path for export-state")?;
            let state = load_state(&globals.state_path)?;
            state.save_to_path(target)?;
            println!("Saved state from '{}' to '{target}'", globals.state_path);
            Ok(())
        }
        "state-summary" => {
            let engine = load_engine(&globals)?;
            print_json(&summarize_state(&engine))
        }
        "import-dataset" => {
            let path = required_arg(&args, cmd_idx + 1, "dataset directory")?;
            let result = apply_and_save(&globals, Operation::LoadDataset { path: path.clone() })?;
            print_json(&result)
        }
        "export-dataset" => {
            let path = required_arg(&args, cmd_idx + 1, "dataset directory")?;
            let selection = match (has_flag("--displayed"), has_flag("--all")) {
                (true, true) => bail!("Use only one of --displayed and --all"),
                (true, false) => Some(SaveSelection::Displayed),
                (false, true) => Some(SaveSelection::All),
                (false, false) => None,
            };
            let result = apply_and_save(
                &globals,
                Operation::SaveDataset {
                    path: path.clone(),
                    selection,
                },
            )
            .context("Use --displayed or --all when only some tracks are shown")?;
            print_json(&result)
        }
        "track-all" => {
            let mut engine = load_engine(&globals)?;
            if has_flag("--performance") {
                engine.state_mut().parameters.worker_tier = WorkerTier::Performance;
            }
            let result = engine.apply(Operation::TrackAll)?;
            save_engine(&engine, &globals.state_path)?;
            print_json(&result)
        }
        "filter" => {
            let text = args.get(cmd_idx + 1).cloned().unwrap_or_default();
            let result = apply_and_save(&globals, Operation::FilterTracks { text })?;
            print_json(&result)
        }
        "export-csv" => {
            let path = required_arg(&args, cmd_idx + 1, "CSV output path")?;
            let metrics = MetricSelection {
                speed: has_flag("--speed"),
                size: has_flag("--size"),
            };
            if !metrics.any() {
                eprintln!("No metric selected, exporting the number of cells only");
            }
            let mut engine = load_engine(&globals)?;
            let result = engine.apply(Operation::ExportCsv {
                path: path.clone(),
                metrics,
            })?;
            print_json(&result)
        }
        "op" => {
            let json = load_json_arg(required_arg(&args, cmd_idx + 1, "operation JSON")?)?;
            let op: Operation = serde_json::from_str(&json).context("Invalid operation JSON")?;
            let result = apply_and_save(&globals, op)?;
            print_json(&result)
        }
        "workflow" => {
            let json = load_json_arg(required_arg(&args, cmd_idx + 1, "workflow JSON")?)?;
            let workflow: Workflow =
                serde_json::from_str(&json).context("Invalid workflow JSON")?;
            let mut engine = load_engine(&globals)?;
            let results = engine.apply_workflow(workflow)?;
            save_engine(&engine, &globals.state_path)?;
            print_json(&results)
        }
        _ => {
            usage();
            bail!("Unknown command '{command}'")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use celltrack::error::ErrorCode;

    #[test]
    fn test_exit_code_separates_input_errors() {
        let rejected = anyhow::Error::new(EngineError::new(ErrorCode::DuplicateSlice, "x"));
        assert_eq!(exit_code(&rejected), 2);
        let with_context =
            anyhow::Error::new(EngineError::invalid_input("x")).context("while loading");
        assert_eq!(exit_code(&with_context), 2);
        let io = anyhow::Error::new(EngineError::io("disk full"));
        assert_eq!(exit_code(&io), 1);
        assert_eq!(exit_code(&anyhow!("Missing command")), 1);
    }

    #[test]
    fn test_global_args_before_command() {
        let args: Vec<String> = [
            "celltrack_cli",
            "--state",
            "s.json",
            "--config",
            "c.json",
            "filter",
            "3",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        let globals = parse_global_args(&args).unwrap();
        assert_eq!(globals.state_path, "s.json");
        assert_eq!(globals.config_path.as_deref(), Some("c.json"));
        assert_eq!(args[globals.cmd_idx], "filter");
    }
}
