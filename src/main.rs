use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use segue::assistant::ChatOrderPayload;
use segue::compatibility::Scorer;
use segue::config::AppConfig;
use segue::db::Database;
use segue::ordering::Orderer;
use segue::planner::strategy::{ExternalProposer, ProposalFile, ValidatingPlanner};
use segue::project::{MixEngine, Project};
use segue::segments::RenderCallback;
use serde::Serialize;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "segue", version, about = "DJ mix ordering and transition planner")]
struct Cli {
    /// Path to the SQLite database
    #[arg(long, global = true)]
    db_path: Option<PathBuf>,

    /// Verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Import analysis worker output (JSON files or directories of them)
    Import {
        paths: Vec<PathBuf>,

        /// Re-write records even if they haven't changed
        #[arg(long)]
        force: bool,
    },

    /// List imported analyses
    Tracks,

    /// Score the transition from one track into another
    Score { from: String, to: String },

    /// Create a project over a set of tracks
    NewProject {
        id: String,
        #[arg(long)]
        name: String,
        /// Track IDs, in upload order
        #[arg(required = true)]
        tracks: Vec<String>,
    },

    /// List projects
    Projects,

    /// Order a project's tracks and plan every transition
    Order {
        project: String,

        /// JSON file of externally proposed plans, keyed "from->to";
        /// proposals that fail validation fall back to the rules
        #[arg(long)]
        proposals: Option<PathBuf>,
    },

    /// Apply an order proposed by the chat assistant
    Chat {
        project: String,
        /// Payload file ({"new_order": [...], "changes_made": [...]}); "-" reads stdin
        payload: PathBuf,
    },

    /// Show a project's order, transitions and render state
    Show { project: String },

    /// Claim the next pending segment for rendering
    Claim { project: String },

    /// Report a render result for a segment
    Callback {
        project: String,
        /// Callback file ({"segmentId", "status", ...}); "-" reads stdin
        payload: PathBuf,
    },

    /// Put a failed segment back in the queue
    Retry { project: String, segment: String },

    /// Show database statistics
    Stats,
}

fn read_payload(path: &Path) -> Result<String> {
    if path.as_os_str() == "-" {
        std::io::read_to_string(std::io::stdin()).context("Failed to read stdin")
    } else {
        std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn build_engine(config: &AppConfig, proposals: Option<&Path>) -> Result<MixEngine> {
    let policy = config.curve.policy();
    let orderer = Orderer::new(
        Scorer::new(config.scoring.clone()),
        policy.clone(),
        config.ordering.clone(),
    );
    let planner = match proposals {
        Some(path) => {
            let source = ProposalFile::load(path)
                .with_context(|| format!("Failed to load proposals from {}", path.display()))?;
            ValidatingPlanner::with_proposer(
                policy.clone(),
                Box::new(ExternalProposer::new(source, policy)),
            )
        }
        None => ValidatingPlanner::rules(policy),
    };
    Ok(MixEngine::new(orderer, planner))
}

fn print_project(project: &Project, json: bool) -> Result<()> {
    let snapshot = project.snapshot();
    if json {
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct ProjectView<'a> {
            id: &'a str,
            name: &'a str,
            status: segue::project::ProjectStatus,
            version: u64,
            ordering: &'a segue::ordering::OrderingResult,
            transitions: Vec<segue::project::TransitionView>,
            segments: Vec<segue::segments::MixSegment>,
            total_duration_ms: u64,
            playable_ms: u64,
            progress: segue::segments::RenderProgress,
        }
        return print_json(&ProjectView {
            id: &project.id,
            name: &project.name,
            status: project.status(),
            version: snapshot.version,
            ordering: &snapshot.ordering,
            transitions: snapshot.transitions(),
            segments: snapshot.segments(),
            total_duration_ms: snapshot.total_duration_ms(),
            playable_ms: snapshot.timeline.playable_prefix_ms(),
            progress: project.progress(),
        });
    }

    println!("{} ({}) [{}] plan v{}", project.name, project.id, project.status(), snapshot.version);
    if snapshot.ordering.ordered_tracks.is_empty() {
        println!("  Not ordered yet.");
        return Ok(());
    }
    for (i, track) in snapshot.ordering.ordered_tracks.iter().enumerate() {
        println!("  {:>2}. {}", i + 1, track);
    }
    if !snapshot.ordering.excluded_track_ids.is_empty() {
        println!("  Excluded: {}", snapshot.ordering.excluded_track_ids.join(", "));
    }
    if let Some(avg) = snapshot.ordering.average_mix_score {
        println!("  Average mix score: {avg:.1}");
    }
    for warning in &snapshot.ordering.warnings {
        println!("  warning: {warning}");
    }

    println!();
    println!(
        "  {:<4} {:<12} {:<12} {:>5} {:<11} {:>5} {:<10}",
        "#", "From", "To", "Score", "Type", "Bars", "Audio"
    );
    for t in snapshot.transitions() {
        println!(
            "  {:<4} {:<12} {:<12} {:>5} {:<11} {:>5} {:<10}",
            t.position,
            t.from_track_id,
            t.to_track_id,
            t.score.score,
            t.transition_type.as_str(),
            t.duration_bars,
            t.audio_status.as_str()
        );
    }

    let progress = project.progress();
    println!();
    println!(
        "  Segments: {} total, {} completed, {} processing, {} pending, {} error",
        progress.total(),
        progress.completed,
        progress.processing,
        progress.pending,
        progress.error
    );
    println!(
        "  Mix length: {:.1} min ({:.1} min playable)",
        snapshot.total_duration_ms() as f64 / 60_000.0,
        snapshot.timeline.playable_prefix_ms() as f64 / 60_000.0
    );
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let log_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level))
        .format_timestamp(None)
        .init();

    // Load config file (optional, defaults if missing)
    let config = AppConfig::load();

    rayon::ThreadPoolBuilder::new()
        .num_threads(config.resolve_workers())
        .build_global()
        .context("Failed to start worker pool")?;

    // Resolve database path: CLI > config > XDG default
    let db_path = cli
        .db_path
        .or(config.db_path.clone())
        .unwrap_or_else(segue::config::default_db_path);
    log::info!("Database: {}", db_path.display());

    let db = Database::open(&db_path).context("Failed to open database")?;

    match cli.command {
        Commands::Import { paths, force } => {
            if paths.is_empty() {
                anyhow::bail!("No paths given. Pass analysis JSON files or directories.");
            }
            let result = segue::importer::import(&db, &paths, force).context("Import failed")?;
            println!(
                "Import complete: {} files, {} new, {} updated, {} unchanged, {} errors",
                result.files, result.new, result.updated, result.unchanged, result.errors
            );
        }

        Commands::Tracks => {
            let analyses = db.list_analyses()?;
            if cli.json {
                return print_json(&analyses);
            }
            println!("{:<24} {:>7} {:<6} {:>6} {:>8}", "Track", "BPM", "Key", "Energy", "Length");
            for a in &analyses {
                println!(
                    "{:<24} {:>7.2} {:<6} {:>6.2} {:>5}:{:02}",
                    a.track_id,
                    a.bpm,
                    a.camelot.as_deref().unwrap_or("-"),
                    a.energy,
                    a.duration_ms / 60_000,
                    (a.duration_ms / 1_000) % 60
                );
            }
        }

        Commands::Score { from, to } => {
            let a = db
                .get_analysis(&from)?
                .with_context(|| format!("No analysis for {from}"))?;
            let b = db
                .get_analysis(&to)?
                .with_context(|| format!("No analysis for {to}"))?;
            let score = Scorer::new(config.scoring.clone()).score(&a, &b);
            if cli.json {
                return print_json(&score);
            }
            println!("{from} -> {to}: {}", score.score);
            println!(
                "  harmonic {:.0} ({}), bpm {:.0} ({:.1}% apart), energy {:.0} ({:+.2})",
                score.harmonic_score,
                score.compatibility_type.as_str(),
                score.bpm_score,
                score.bpm_difference,
                score.energy_score,
                score.energy_difference
            );
        }

        Commands::NewProject { id, name, tracks } => {
            db.create_project(&id, &name, &tracks)
                .context("Failed to create project")?;
            println!("Created project {id} with {} tracks", tracks.len());
        }

        Commands::Projects => {
            let projects = db.list_projects()?;
            if cli.json {
                return print_json(&projects);
            }
            for p in &projects {
                let avg = p
                    .average_mix_score
                    .map(|s| format!("{s:.1}"))
                    .unwrap_or_else(|| "-".into());
                println!(
                    "{:<16} {:<24} {:<10} {:>3} tracks  avg {:>5}  plan v{}",
                    p.id, p.name, p.status.as_str(), p.track_count, avg, p.plan_version
                );
            }
        }

        Commands::Order { project, proposals } => {
            let engine = build_engine(&config, proposals.as_deref())?;
            let loaded = db.load_project(&project)?;
            let result = loaded.run_ordering(&engine);
            // a failed run still records the failed status
            db.save_plan(&loaded).context("Failed to save plan")?;
            result.context("Ordering failed")?;
            print_project(&loaded, cli.json)?;
        }

        Commands::Chat { project, payload } => {
            let payload = ChatOrderPayload::from_json(&read_payload(&payload)?)
                .context("Invalid chat payload")?;
            let engine = build_engine(&config, None)?;
            let loaded = db.load_project(&project)?;
            let result = loaded.apply_chat(&engine, &payload);
            db.save_plan(&loaded).context("Failed to save plan")?;
            result.context("Chat order rejected")?;
            print_project(&loaded, cli.json)?;
        }

        Commands::Show { project } => {
            let loaded = db.load_project(&project)?;
            print_project(&loaded, cli.json)?;
        }

        Commands::Claim { project } => match db.claim_next(&project)? {
            Some(segment) => print_json(&segment)?,
            None => {
                if cli.json {
                    println!("null");
                } else {
                    println!("Nothing to render.");
                }
            }
        },

        Commands::Callback { project, payload } => {
            let callback: RenderCallback = serde_json::from_str(&read_payload(&payload)?)
                .context("Invalid render callback")?;
            let outcome = db.apply_callback(&project, &callback)?;
            println!("{}: {:?}", callback.segment_id, outcome);
        }

        Commands::Retry { project, segment } => {
            db.retry_segment(&project, &segment)?;
            println!("{segment} queued for another render");
        }

        Commands::Stats => {
            let stats = db.stats()?;
            if cli.json {
                return print_json(&stats);
            }
            println!("Analyzed tracks: {}", stats.analyzed_tracks);
            println!("Total duration:  {:.1} hours", stats.total_duration_hours);
            println!("Projects:        {}", stats.projects);
            for (status, count) in &stats.projects_by_status {
                println!("  {status:<12} {count}");
            }
            println!("Segments:");
            for (status, count) in &stats.segments_by_status {
                println!("  {status:<12} {count}");
            }
            println!("  superseded   {}", stats.superseded_segments);
        }
    }

    Ok(())
}
