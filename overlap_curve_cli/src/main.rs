use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand, ValueHint};
use overlap_curve::{
    process_day, Config, DayProfiles, DayResult, FinalOverlap, Profile, ReferenceCurve, Thresholds,
};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Ceilometer overlap correction CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Derive the daily overlap curve for one or more day files
    Process(ProcessArgs),
    /// Print the effective thresholds and their fingerprint
    Thresholds(ThresholdsArgs),
}

#[derive(Parser, Debug)]
struct ProcessArgs {
    /// Day files (JSON) to process
    #[arg(required = true, value_hint = ValueHint::FilePath)]
    day_files: Vec<PathBuf>,

    /// Thresholds file: JSON, or the `name,value` table for any other extension
    #[arg(short, long, value_hint = ValueHint::FilePath)]
    config: Option<PathBuf>,

    /// Reference overlap curve (tab separated, first line skipped)
    #[arg(short, long, value_hint = ValueHint::FilePath)]
    reference: PathBuf,

    /// Output directory; results land in a sub-directory per site
    #[arg(short, long, default_value = ".", value_hint = ValueHint::DirPath)]
    output: PathBuf,

    /// Range step (m) of the reference curve when it differs from the instrument grid
    #[arg(long)]
    reference_range_step: Option<f64>,

    /// Also write the per-interval CSV and the full JSON report
    #[arg(long, default_value_t = false)]
    report: bool,

    /// Verbose logging
    #[arg(short, long, default_value_t = false)]
    verbose: bool,
}

#[derive(Parser, Debug)]
struct ThresholdsArgs {
    /// Thresholds file to resolve against the defaults
    #[arg(short, long, value_hint = ValueHint::FilePath)]
    config: Option<PathBuf>,
}

/// Station and instrument identifiers carried into the result header.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct SiteMetadata {
    opt_mod_number: String,
    site_location: String,
    wigos_station_id: String,
    instrument_id: String,
    instrument_serial_number: String,
}

impl SiteMetadata {
    /// Location name without the trailing country or region parts.
    fn location(&self) -> &str {
        self.site_location
            .split(',')
            .next()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or("unknown")
    }

    fn header_lines(&self) -> [String; 5] {
        [
            format!("opt_mod_number = {}", self.opt_mod_number),
            format!("site_location = {}", self.site_location),
            format!("wigos_station_id = {}", self.wigos_station_id),
            format!("instrument_id = {}", self.instrument_id),
            format!("instrument_serial_number = {}", self.instrument_serial_number),
        ]
    }
}

#[derive(Debug, Deserialize, Serialize)]
struct DayFile {
    #[serde(default)]
    metadata: SiteMetadata,
    range: Vec<f64>,
    range_resolution: f64,
    profiles: Vec<Profile>,
}

#[derive(Debug)]
struct DayOutcome {
    date: NaiveDate,
    contributors: usize,
    written: Vec<PathBuf>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let default_level = match &cli.command {
        Command::Process(args) if args.verbose => "debug",
        _ => "info",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();

    match cli.command {
        Command::Process(args) => handle_process(args),
        Command::Thresholds(args) => handle_thresholds(args),
    }
}

fn handle_process(args: ProcessArgs) -> Result<()> {
    if args.day_files.is_empty() {
        return Err(anyhow!("no day files supplied"));
    }
    let thresholds = load_thresholds(args.config.as_deref())?;
    let fingerprint = thresholds.fingerprint()?;
    let reference = load_reference(&args.reference)?;
    fs::create_dir_all(&args.output)
        .with_context(|| format!("failed to create {}", args.output.display()))?;
    info!(
        days = args.day_files.len(),
        reference_bins = reference.len(),
        thresholds = %fingerprint,
        "processing"
    );

    let t_start = Instant::now();
    let outcomes: Vec<(PathBuf, Result<Option<DayOutcome>>)> = args
        .day_files
        .par_iter()
        .map(|path| {
            let outcome = run_day(
                path,
                &thresholds,
                &fingerprint,
                &reference,
                args.reference_range_step,
                &args.output,
                args.report,
            );
            (path.clone(), outcome)
        })
        .collect();

    let mut with_curve = 0usize;
    let mut failed = 0usize;
    for (path, outcome) in outcomes {
        match outcome {
            Ok(Some(day)) => {
                with_curve += 1;
                info!(
                    file = %path.display(),
                    date = %day.date,
                    contributors = day.contributors,
                    "wrote {} file(s)",
                    day.written.len()
                );
            }
            Ok(None) => {}
            Err(err) => {
                failed += 1;
                warn!(file = %path.display(), "day skipped: {err:#}");
            }
        }
    }
    info!(
        days = args.day_files.len(),
        with_curve,
        failed,
        "done in {:.1} s",
        t_start.elapsed().as_secs_f64()
    );
    Ok(())
}

fn handle_thresholds(args: ThresholdsArgs) -> Result<()> {
    let thresholds = load_thresholds(args.config.as_deref())?;
    let stdout = io::stdout();
    let mut handle = stdout.lock();
    serde_json::to_writer_pretty(&mut handle, &thresholds)?;
    writeln!(handle)?;
    writeln!(handle, "sha256 {}", thresholds.fingerprint()?)?;
    Ok(())
}

/// Processes one day file end to end. `Ok(None)` means the day produced no
/// overlap curve.
fn run_day(
    path: &Path,
    thresholds: &Thresholds,
    fingerprint: &str,
    reference: &ReferenceCurve,
    reference_range_step: Option<f64>,
    output: &Path,
    report: bool,
) -> Result<Option<DayOutcome>> {
    let text =
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    let day_file: DayFile = serde_json::from_str(&text)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    let DayFile {
        metadata,
        range,
        range_resolution,
        profiles,
    } = day_file;

    let date = profiles
        .first()
        .map(|p| p.time.date_naive())
        .ok_or_else(|| anyhow!("{} holds no profiles", path.display()))?;
    let reference = align_reference(reference, &range, reference_range_step)?;
    let day = DayProfiles::new(range, profiles)?;
    let config = Config::derive(thresholds, &reference, day.range(), range_resolution)?;
    debug!(
        file = %path.display(),
        min_fit_range = config.min_fit_range,
        min_overlap_valid = config.min_overlap_valid,
        "configuration derived"
    );
    let result = process_day(&day, &reference, &config)?;

    let site_dir = output.join(metadata.location());
    fs::create_dir_all(&site_dir)
        .with_context(|| format!("failed to create {}", site_dir.display()))?;

    let mut written = Vec::new();
    if report {
        let intervals_path = site_dir.join(format!("intervals_{date}.csv"));
        write_interval_csv(&result, &intervals_path)?;
        written.push(intervals_path);
        let json_path = site_dir.join(format!("day_{date}.json"));
        write_day_json(&result, &json_path)?;
        written.push(json_path);
    }

    let Some(overlap) = result.final_overlap.as_ref() else {
        warn!(
            file = %path.display(),
            date = %date,
            surviving = result.surviving,
            "no overlap curve, nothing written"
        );
        return Ok(None);
    };
    let results_path = site_dir.join(format!(
        "ov_results_{}_{}_{date}.csv",
        metadata.location(),
        metadata.opt_mod_number
    ));
    write_results_csv(
        &metadata,
        fingerprint,
        day.range(),
        range_resolution,
        overlap,
        &results_path,
    )?;
    written.push(results_path);

    Ok(Some(DayOutcome {
        date,
        contributors: overlap.contributors.len(),
        written,
    }))
}

fn load_thresholds(path: Option<&Path>) -> Result<Thresholds> {
    let Some(path) = path else {
        return Ok(Thresholds::default());
    };
    let text =
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    let is_json = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
    let thresholds = if is_json {
        serde_json::from_str(&text)
            .with_context(|| format!("{} is not valid JSON", path.display()))?
    } else {
        Thresholds::from_table(&text)
            .with_context(|| format!("failed to parse thresholds {}", path.display()))?
    };
    Ok(thresholds)
}

/// First data line of a tab-separated file whose first line is a header.
fn load_reference(path: &Path) -> Result<ReferenceCurve> {
    let text =
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    let line = text
        .lines()
        .skip(1)
        .find(|l| !l.trim().is_empty())
        .ok_or_else(|| anyhow!("{} holds no reference values", path.display()))?;
    let values = line
        .split('\t')
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(|v| {
            v.parse::<f64>()
                .with_context(|| format!("invalid reference value '{v}' in {}", path.display()))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(ReferenceCurve::new(values)?)
}

/// Brings the reference curve onto the instrument range grid. Reference
/// bins sit at `step, 2 step, ...`.
fn align_reference(
    reference: &ReferenceCurve,
    range: &[f64],
    reference_range_step: Option<f64>,
) -> Result<ReferenceCurve> {
    if reference.len() == range.len() {
        return Ok(reference.clone());
    }
    let step = reference_range_step.ok_or_else(|| {
        anyhow!(
            "reference curve has {} bins, instrument {}; pass --reference-range-step to resample",
            reference.len(),
            range.len()
        )
    })?;
    let from: Vec<f64> = (1..=reference.len()).map(|i| step * i as f64).collect();
    Ok(reference.resample(&from, range)?)
}

fn write_results_csv(
    metadata: &SiteMetadata,
    fingerprint: &str,
    range: &[f64],
    range_resolution: f64,
    overlap: &FinalOverlap,
    path: &Path,
) -> Result<()> {
    let mut file =
        File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    for line in metadata.header_lines() {
        writeln!(file, "{line}")?;
    }
    writeln!(file, "thresholds_sha256 = {fingerprint}")?;

    let mut writer = csv::Writer::from_writer(file);
    let mut header: Vec<String> = [
        "start",
        "end",
        "rng lower",
        "rng upper",
        "internal_temperature",
        "range_resolution",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    header.extend(range.iter().map(|r| r.to_string()));
    writer.write_record(&header)?;

    for (contributor, curve) in overlap.contributors.iter().zip(&overlap.curves) {
        let mut row = vec![
            contributor.start.to_rfc3339(),
            contributor.end.to_rfc3339(),
            format!("{:.1}", contributor.window_start),
            format!("{:.1}", contributor.window_end),
            format!("{:.3}", contributor.internal_temperature),
            format!("{range_resolution}"),
        ];
        row.extend(curve.iter().map(|v| format!("{v:.6}")));
        writer.write_record(&row)?;
    }
    writer.flush()?;
    Ok(())
}

fn write_interval_csv(result: &DayResult, path: &Path) -> Result<()> {
    let file =
        File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    let mut writer = csv::Writer::from_writer(file);
    writer.write_record([
        "start",
        "end",
        "passed_prechecks",
        "max_available_fit_range",
        "candidates",
        "passing",
        "reason",
    ])?;
    for interval in &result.intervals {
        let candidates = interval.candidates.as_ref().map_or(0, |c| c.rows.len());
        writer.write_record([
            interval.start.to_rfc3339(),
            interval.end.to_rfc3339(),
            interval.prechecks.passed().to_string(),
            format!("{:.1}", interval.prechecks.max_available_fit_range),
            candidates.to_string(),
            interval.passing_rows().count().to_string(),
            interval.reason(),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

fn write_day_json(result: &DayResult, path: &Path) -> Result<()> {
    let file =
        File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    serde_json::to_writer_pretty(io::BufWriter::new(file), result)
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}
