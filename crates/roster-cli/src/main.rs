use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use rand::rngs::StdRng;
use rand::SeedableRng;
use roster_core::augmentation::Augmenter;
use roster_core::{imaging, FacePipeline, PersonRecord, PersonRegistry, Settings, SettingsUpdate};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "roster", about = "Roster face recognition CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train a model from a dataset directory and print its statistics
    Train {
        dataset: PathBuf,
        #[command(flatten)]
        pipeline: PipelineArgs,
    },
    /// Train from a dataset, then recognize the faces in each image
    Recognize {
        dataset: PathBuf,
        #[arg(required = true)]
        images: Vec<PathBuf>,
        #[command(flatten)]
        pipeline: PipelineArgs,
    },
    /// Check whether an image is usable for training
    Validate {
        image: PathBuf,
        /// Write a contrast-enhanced, size-limited copy here
        #[arg(long)]
        enhance: Option<PathBuf>,
        /// Write the equalized and blurred grayscale copy here
        #[arg(long)]
        preprocess: Option<PathBuf>,
    },
    /// Write augmented variants of an image
    Augment {
        image: PathBuf,
        #[arg(short, long, default_value_t = 2)]
        count: usize,
        /// Seed for reproducible output
        #[arg(long)]
        seed: Option<u64>,
        #[arg(short, long, default_value = ".")]
        out: PathBuf,
        /// One sample per transform instead of full variants
        #[arg(long)]
        preview: bool,
    },
    /// Inspect or edit the person registry
    People {
        /// Registry file (default: $XDG_DATA_HOME/roster/people_info.json)
        #[arg(long)]
        file: Option<PathBuf>,
        #[command(subcommand)]
        action: PeopleAction,
    },
    /// Talk to a running rosterd
    Daemon {
        /// Use the system bus instead of the session bus
        #[arg(long)]
        system: bool,
        #[command(subcommand)]
        action: DaemonAction,
    },
}

#[derive(Args)]
struct PipelineArgs {
    /// Directory containing det_10g.onnx and w600k_r50.onnx
    /// (default: $ROSTER_MODEL_DIR, then $XDG_DATA_HOME/roster/models)
    #[arg(long)]
    model_dir: Option<PathBuf>,
    /// Distances below this resolve to a known name
    #[arg(long)]
    threshold: Option<f32>,
    #[arg(long)]
    no_augmentation: bool,
    /// Synthetic variants per training image
    #[arg(long)]
    factor: Option<u32>,
}

#[derive(Subcommand)]
enum PeopleAction {
    /// List every registered person
    List,
    /// Show one person's details
    Show { name: String },
    /// Case-insensitive search over name, position and department
    Search { query: String },
    /// Department and position counts
    Stats,
    /// Register a person under their recognized name
    Add {
        name: String,
        #[arg(long)]
        full_name: Option<String>,
        #[arg(long, default_value = "")]
        position: String,
        #[arg(long, default_value = "")]
        department: String,
        #[arg(long, default_value = "")]
        email: String,
    },
    /// Merge a JSON object into a person's record, e.g. '{"position": "CTO"}'
    Update { name: String, fields: String },
    /// Delete a person's record
    Remove { name: String },
}

#[derive(Subcommand)]
enum DaemonAction {
    /// Show daemon status
    Status,
    /// Queue a training run (empty: the daemon's configured dataset)
    Train { dataset: Option<PathBuf> },
    /// Recognize the faces in an image
    Recognize { image: PathBuf },
    /// Show model information
    ModelInfo,
    /// Show the training summary
    Summary,
    /// Apply a settings update, e.g. '{"confidence_threshold": 80}'
    Config { update: String },
}

#[zbus::proxy(
    interface = "org.roster.Roster1",
    default_service = "org.roster.Roster1",
    default_path = "/org/roster/Roster1"
)]
trait Roster {
    async fn train(&self, dataset: &str) -> zbus::Result<bool>;
    async fn recognize(&self, image_path: &str) -> zbus::Result<String>;
    async fn model_info(&self) -> zbus::Result<String>;
    async fn training_summary(&self) -> zbus::Result<String>;
    async fn update_config(&self, update: &str) -> zbus::Result<String>;
    async fn status(&self) -> zbus::Result<String>;
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Train { dataset, pipeline } => {
            let pipeline = build_pipeline(&pipeline)?;
            let stats = pipeline.train(&dataset)?;
            println!("Trained {} people from {} faces", stats.total_people, stats.total_faces);
            println!(
                "  originals: {}  augmented: {}",
                stats.original_count, stats.augmented_count
            );
            for (name, p) in &stats.quality_assessment {
                println!(
                    "  {:<24} {:>3} original / {:>3} total  {}",
                    name, p.original_images, p.total_images, p.quality
                );
            }
            let r = &stats.load_report;
            if r.skipped() > 0 {
                println!(
                    "  skipped {} of {} images (no face: {}, unreadable: {}, invalid: {}, detector: {})",
                    r.skipped(),
                    r.images_seen,
                    r.no_face,
                    r.unreadable,
                    r.invalid,
                    r.detection_failed
                );
            }
        }
        Commands::Recognize { dataset, images, pipeline } => {
            let pipeline = build_pipeline(&pipeline)?;
            pipeline.train(&dataset)?;
            for path in &images {
                let image = imaging::load(path)?;
                let results = pipeline.recognize(&image)?;
                println!("{}: {} face(s)", path.display(), results.len());
                for r in &results {
                    let l = r.location;
                    println!(
                        "  {:<24} confidence {:>5.1}%  (top {}, right {}, bottom {}, left {})",
                        r.name, r.confidence, l.top, l.right, l.bottom, l.left
                    );
                }
            }
        }
        Commands::Validate { image, enhance, preprocess } => {
            let img = imaging::load(&image)?;
            let shape = imaging::shape_of(&img);
            match imaging::validate(Some(&img)) {
                Ok(()) => println!("{}: ok {:?}", image.display(), shape),
                Err(reason) => println!("{}: rejected: {reason}", image.display()),
            }
            if let Some(out) = enhance {
                let enhanced = imaging::resize_to_fit(&imaging::enhance(&img));
                enhanced.save(&out).with_context(|| format!("writing {}", out.display()))?;
                println!("enhanced copy written to {}", out.display());
            }
            if let Some(out) = preprocess {
                let processed = imaging::preprocess(&imaging::to_grayscale(&img));
                processed.save(&out).with_context(|| format!("writing {}", out.display()))?;
                println!("preprocessed copy written to {}", out.display());
            }
        }
        Commands::Augment { image, count, seed, out, preview } => {
            let settings = Settings::default();
            let gray = imaging::to_grayscale(&imaging::load(&image)?);
            let region = imaging::normalize(&gray, settings.region_size);

            let mut rng = match seed {
                Some(s) => StdRng::seed_from_u64(s),
                None => StdRng::from_entropy(),
            };
            let augmenter = Augmenter::new(settings.augmentation);
            let variants = if preview {
                augmenter.preview_with(&region, &mut rng)
            } else {
                augmenter.augment_with(&region, count, &mut rng)
            };

            std::fs::create_dir_all(&out)?;
            let stem = image.file_stem().and_then(|s| s.to_str()).unwrap_or("face");
            for (i, variant) in variants.iter().enumerate() {
                let path = out.join(format!("{stem}_aug{i}.png"));
                variant.save(&path).with_context(|| format!("writing {}", path.display()))?;
            }
            println!("wrote {} images to {}", variants.len(), out.display());
        }
        Commands::People { file, action } => {
            let file = file.unwrap_or_else(|| roster_core::data_dir().join("people_info.json"));
            run_people(&mut PersonRegistry::load(&file), action)?;
        }
        Commands::Daemon { system, action } => {
            run_daemon(system, action).await?;
        }
    }

    Ok(())
}

fn build_pipeline(args: &PipelineArgs) -> Result<FacePipeline> {
    let model_dir = args
        .model_dir
        .clone()
        .or_else(|| std::env::var_os("ROSTER_MODEL_DIR").map(PathBuf::from))
        .unwrap_or_else(roster_core::default_model_dir);
    let update = SettingsUpdate {
        confidence_threshold: args.threshold,
        use_augmentation: args.no_augmentation.then_some(false),
        augmentation_factor: args.factor,
    };
    let mut settings = Settings::default();
    settings.apply(&update)?;
    tracing::debug!(model_dir = %model_dir.display(), ?settings, "building pipeline");
    roster_core::load_onnx_pipeline(&model_dir, settings)
        .with_context(|| format!("loading models from {}", model_dir.display()))
}

fn run_people(registry: &mut PersonRegistry, action: PeopleAction) -> Result<()> {
    match action {
        PeopleAction::List => {
            if registry.all().is_empty() {
                println!("No people registered in {}", registry.path().display());
            }
            for (name, p) in registry.all() {
                println!("{:<24} {:<24} {}", name, p.position, p.department);
            }
        }
        PeopleAction::Show { name } => {
            println!("{}", serde_json::to_string_pretty(&registry.get_info(&name))?);
        }
        PeopleAction::Search { query } => {
            for (name, p) in registry.search(&query) {
                println!("{:<24} {:<24} {}", name, p.position, p.department);
            }
        }
        PeopleAction::Stats => {
            println!("{}", serde_json::to_string_pretty(&registry.statistics())?);
        }
        PeopleAction::Add { name, full_name, position, department, email } => {
            let record = PersonRecord {
                full_name: full_name.unwrap_or_default(),
                position,
                department,
                email,
                ..PersonRecord::default()
            };
            registry.add(&name, record)?;
            println!("added {name} to {}", registry.path().display());
        }
        PeopleAction::Update { name, fields } => {
            registry.update(&name, &parse_fields(&fields)?)?;
            println!("updated {name}");
        }
        PeopleAction::Remove { name } => {
            if !registry.remove(&name)? {
                bail!("{name} is not registered in {}", registry.path().display());
            }
            println!("removed {name}");
        }
    }
    Ok(())
}

fn parse_fields(json: &str) -> Result<serde_json::Map<String, serde_json::Value>> {
    match serde_json::from_str(json).context("fields must be valid JSON")? {
        serde_json::Value::Object(map) => Ok(map),
        other => bail!("fields must be a JSON object, got {other}"),
    }
}

async fn run_daemon(system: bool, action: DaemonAction) -> Result<()> {
    let conn = if system {
        zbus::Connection::system().await?
    } else {
        zbus::Connection::session().await?
    };
    let proxy = RosterProxy::new(&conn).await.context("connecting to rosterd")?;

    let reply = match action {
        DaemonAction::Status => proxy.status().await?,
        DaemonAction::Train { dataset } => {
            let dataset = dataset.as_deref().map(absolute).transpose()?.unwrap_or_default();
            if !proxy.train(&dataset).await? {
                bail!("rosterd refused the training request");
            }
            "training queued; poll `roster daemon status`".to_string()
        }
        DaemonAction::Recognize { image } => proxy.recognize(&absolute(&image)?).await?,
        DaemonAction::ModelInfo => proxy.model_info().await?,
        DaemonAction::Summary => proxy.training_summary().await?,
        DaemonAction::Config { update } => proxy.update_config(&update).await?,
    };

    match serde_json::from_str::<serde_json::Value>(&reply) {
        Ok(json) => println!("{}", serde_json::to_string_pretty(&json)?),
        Err(_) => println!("{reply}"),
    }
    Ok(())
}

/// The daemon resolves paths against its own working directory.
fn absolute(path: &Path) -> Result<String> {
    let abs = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };
    Ok(abs.to_string_lossy().into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_registry() -> PersonRegistry {
        let path = std::env::temp_dir()
            .join(format!("roster-cli-{}", uuid::Uuid::new_v4()))
            .join("people_info.json");
        PersonRegistry::load(&path)
    }

    #[test]
    fn test_parse_fields_requires_object() {
        let map = parse_fields(r#"{"position": "CTO", "skills": ["rust"]}"#).unwrap();
        assert_eq!(map["position"], "CTO");
        assert!(parse_fields("[1, 2]").is_err());
        assert!(parse_fields("not json").is_err());
    }

    #[test]
    fn test_people_add_update_remove() {
        let mut registry = scratch_registry();
        let path = registry.path().to_path_buf();

        let add = Cli::try_parse_from(["roster", "people", "add", "Jane Doe", "--position", "Engineer"])
            .unwrap();
        let Commands::People { action, .. } = add.command else { panic!("expected people") };
        run_people(&mut registry, action).unwrap();

        let update = PeopleAction::Update {
            name: "Jane Doe".into(),
            fields: r#"{"department": "R&D"}"#.into(),
        };
        run_people(&mut registry, update).unwrap();

        let stored = PersonRegistry::load(&path);
        let jane = stored.get("Jane Doe").unwrap();
        assert_eq!(jane.full_name, "Jane Doe");
        assert_eq!(jane.position, "Engineer");
        assert_eq!(jane.department, "R&D");

        run_people(&mut registry, PeopleAction::Remove { name: "Jane Doe".into() }).unwrap();
        assert!(run_people(&mut registry, PeopleAction::Remove { name: "Jane Doe".into() }).is_err());
        assert!(PersonRegistry::load(&path).all().is_empty());

        std::fs::remove_dir_all(path.parent().unwrap()).unwrap();
    }
}
