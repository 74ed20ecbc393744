// Command-line runner for the `colony_vision` library.
//
// Usage: colony_vision <image_dir> [config.toml] [output.json]

use anyhow::Context;
use colony_vision::core_modules::growth::GrowthRecord;
use colony_vision::{
    AnalysisConfig, AnalysisReport, ColonyError, FileImageLoader, LoggingProgress, ProcessingOrchestrator,
    discover_images, logging,
};
use std::env;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

#[tokio::main]
async fn main() -> ExitCode {
    // --- 1. Argument Parsing & Setup ---
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 || args.len() > 4 {
        println!("Usage: colony_vision <image_dir> [config.toml] [output.json]");
        return ExitCode::FAILURE;
    }
    let image_dir = PathBuf::from(&args[1]);
    let config_path = args.get(2).map(PathBuf::from);
    let output_path = args.get(3).map(PathBuf::from);

    let json_logs = env::var("COLONY_VISION_LOG_FORMAT").is_ok_and(|format| format == "json");
    logging::init_logging("info", json_logs);

    match run(&image_dir, config_path.as_deref(), output_path.as_deref()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => match error.downcast_ref::<ColonyError>() {
            Some(colony_error) if colony_error.is_graceful() => {
                println!("{colony_error}");
                ExitCode::SUCCESS
            }
            _ => {
                eprintln!("error: {error:#}");
                ExitCode::FAILURE
            }
        },
    }
}

async fn run(image_dir: &Path, config_path: Option<&Path>, output_path: Option<&Path>) -> anyhow::Result<()> {
    // --- 2. Configuration ---
    let config = match config_path {
        Some(path) => AnalysisConfig::load(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => AnalysisConfig::default(),
    };

    // --- 3. Discovery ---
    let group_id = image_dir
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "plates".to_string());
    let descriptors = discover_images(image_dir, &group_id)
        .with_context(|| format!("listing images in {}", image_dir.display()))?;

    // --- 4. Orchestrated run ---
    let orchestrator = ProcessingOrchestrator::new(config)?;
    let report = orchestrator
        .run(descriptors, Arc::new(FileImageLoader), Arc::new(LoggingProgress::new()))
        .await?;

    // --- 5. Reporting ---
    print_summary(&report);
    if let Some(path) = output_path {
        write_report(path, &report)?;
        println!("Report written to {}", path.display());
    }
    Ok(())
}

fn print_summary(report: &AnalysisReport) {
    println!(
        "{} timepoints, {} tracks, {} skipped images",
        report.timepoints_processed,
        report.records.len(),
        report.skipped.len()
    );
    for record in &report.records {
        println!("{}", summary_line(record));
    }
    for skipped in &report.skipped {
        println!("skipped {}: {}", skipped.path.display(), skipped.reason);
    }
}

fn summary_line(record: &GrowthRecord) -> String {
    let track = &record.track;
    let center = track
        .mean_center()
        .map(|c| format!("({:.1}, {:.1})", c.x, c.y))
        .unwrap_or_else(|| "-".to_string());
    let final_area = track.last().map(|o| o.colony.area).unwrap_or(0.0);
    let max_rate = record
        .curve
        .map(|curve| format!("{:.4}", curve.max_growth_rate))
        .unwrap_or_else(|| "-".to_string());
    let fitted = match record.fit {
        Some(fit) if fit.converged => format!(
            ", fitted lag {:.0}s rate {:.4} px/s",
            fit.lag_time.as_secs_f64(),
            fit.max_growth_rate
        ),
        Some(_) => ", fit diverged".to_string(),
        None => String::new(),
    };
    format!(
        "track {:>4} {}/{} at {center}: {} observations, final area {final_area:.0}, max rate {max_rate} px/s{fitted}",
        track.id,
        track.group.group_id,
        track.group.plate_id,
        track.len()
    )
}

fn write_report(path: &Path, report: &AnalysisReport) -> Result<(), ColonyError> {
    let output_error = |message: String| ColonyError::Output {
        path: path.to_path_buf(),
        message,
    };
    let json = serde_json::to_string_pretty(report).map_err(|error| output_error(error.to_string()))?;
    std::fs::write(path, json).map_err(|error| output_error(error.to_string()))
}
