use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use likeness_core::{Attributes, BackendKind, Identity, IdentityId, RecognitionDatabase};
use likeness_store::SqliteStore;
use serde_json::json;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

mod config;

use config::Config;

#[derive(Parser)]
#[command(name = "likeness", about = "Likeness face recognition CLI")]
struct Cli {
    /// Face database file (overrides LIKENESS_DB_PATH)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Recognition backend: lbph, eigenfaces, fisherfaces or dnn
    #[arg(long, global = true)]
    backend: Option<BackendKind>,

    /// Decision threshold for the active backend (strictness in [0, 1] for lbph)
    #[arg(long, global = true)]
    threshold: Option<f64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage identities
    #[command(subcommand)]
    Identity(IdentityCommand),
    /// Train the active backend with face crops of one identity
    Train {
        /// Identity ID
        id: i64,
        /// Face crop image files
        #[arg(required = true)]
        images: Vec<PathBuf>,
        /// Tag stored with the samples, usable to clear them later
        #[arg(short, long, default_value = "")]
        context: String,
    },
    /// Recognize face crops
    Recognize {
        #[arg(required = true)]
        images: Vec<PathBuf>,
    },
    /// Delete training samples
    Clear {
        /// Only samples of these identities (active backend only)
        #[arg(short, long = "identity")]
        identities: Vec<i64>,
        /// Only samples trained with this context
        #[arg(short, long)]
        context: Option<String>,
    },
    /// Show backend, threshold and sample counts
    Status,
    /// Run the database integrity check
    Check,
    /// Compact the database file
    Vacuum,
}

#[derive(Subcommand)]
enum IdentityCommand {
    /// Create an identity from key=value attributes
    Add { attributes: Vec<String> },
    /// List all identities
    List,
    /// Show one identity
    Show { id: i64 },
    /// Find the identity best matching key=value attributes
    Find {
        #[arg(required = true)]
        attributes: Vec<String>,
    },
    /// Replace an identity's attributes (the uuid is kept)
    Set {
        id: i64,
        attributes: Vec<String>,
        /// Add to the existing attributes instead of replacing them
        #[arg(long)]
        merge: bool,
    },
    /// Delete an identity and its training samples
    Delete { id: i64 },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = Config::load()?;
    if let Some(db) = cli.db {
        config.db_path = db;
    }
    if let Some(backend) = cli.backend {
        config.recognition.backend = backend;
    }
    if let Some(threshold) = cli.threshold {
        config.recognition.set_threshold_setting(config.recognition.backend, threshold);
    }

    if let Some(parent) = config.db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }

    tracing::debug!(?config, "configuration loaded");

    let store = SqliteStore::open(&config.db_path);
    let db = RecognitionDatabase::open(store, config.recognition.clone());
    if !db.is_available() {
        bail!("face database {} is unavailable", config.db_path.display());
    }

    install_extractor(&db, &config)?;

    match cli.command {
        Commands::Identity(command) => run_identity(&db, command)?,
        Commands::Train {
            id,
            images,
            context,
        } => {
            let identity = lookup(&db, id)?;
            let faces = images
                .iter()
                .map(|path| load_image(path))
                .collect::<Result<Vec<_>>>()?;
            let trained = db.train(&identity, &faces, &context)?;
            print_json(&json!({
                "identity": identity,
                "images": faces.len(),
                "trained": trained,
                "samples": db.trained_samples()?,
            }))?;
        }
        Commands::Recognize { images } => {
            let faces = images
                .iter()
                .map(|path| load_image(path))
                .collect::<Result<Vec<_>>>()?;
            let results = db.recognize_faces(&faces);
            let report: Vec<_> = images
                .iter()
                .zip(results)
                .map(|(path, identity)| json!({ "image": path, "identity": identity }))
                .collect();
            print_json(&report)?;
        }
        Commands::Clear {
            identities,
            context,
        } => {
            if identities.is_empty() {
                db.clear_all_training(context.as_deref())?;
            } else {
                let ids: Vec<IdentityId> = identities.into_iter().map(IdentityId).collect();
                db.clear_training(&ids, context.as_deref())?;
            }
            print_json(&json!({ "samples": db.trained_samples()? }))?;
        }
        Commands::Status => {
            print_json(&json!({
                "database": config.db_path,
                "backend": db.backend_identifier(),
                "threshold": db.threshold(),
                "identities": db.all_identities().len(),
                "samples": db.trained_samples()?,
                "recommended_image_size": db.recommended_image_size(),
                "training_cost": db.training_cost_hint(),
            }))?;
        }
        Commands::Check => {
            let ok = db.integrity_check();
            print_json(&json!({ "ok": ok }))?;
            if !ok {
                bail!("integrity check failed");
            }
        }
        Commands::Vacuum => {
            db.vacuum()?;
            println!("Database vacuumed");
        }
    }

    Ok(())
}

fn run_identity(db: &RecognitionDatabase, command: IdentityCommand) -> Result<()> {
    match command {
        IdentityCommand::Add { attributes } => {
            let identity = db.add_identity(&parse_attributes(&attributes)?)?;
            print_json(&identity)?;
        }
        IdentityCommand::List => {
            print_json(&db.all_identities())?;
        }
        IdentityCommand::Show { id } => {
            print_json(&lookup(db, id)?)?;
        }
        IdentityCommand::Find { attributes } => {
            print_json(&db.find_identity_by(&parse_attributes(&attributes)?))?;
        }
        IdentityCommand::Set {
            id,
            attributes,
            merge,
        } => {
            let attributes = parse_attributes(&attributes)?;
            let identity = if merge {
                db.add_identity_attributes(IdentityId(id), &attributes)?
            } else {
                db.set_identity_attributes(IdentityId(id), &attributes)?
            };
            print_json(&identity)?;
        }
        IdentityCommand::Delete { id } => {
            let identity = lookup(db, id)?;
            db.delete_identity(identity.id)?;
            println!("Deleted identity {id}");
        }
    }
    Ok(())
}

#[cfg(feature = "arcface")]
fn install_extractor(db: &RecognitionDatabase, config: &Config) -> Result<()> {
    if config.recognition.backend == BackendKind::Dnn {
        let extractor = likeness_core::ArcFaceExtractor::load(&config.arcface_model_path())?;
        db.set_extractor(Box::new(extractor));
    }
    Ok(())
}

#[cfg(not(feature = "arcface"))]
fn install_extractor(_db: &RecognitionDatabase, config: &Config) -> Result<()> {
    if config.recognition.backend == BackendKind::Dnn {
        tracing::warn!("built without the arcface feature; the dnn backend has no embedding extractor");
    }
    Ok(())
}

fn lookup(db: &RecognitionDatabase, id: i64) -> Result<Identity> {
    db.identity(IdentityId(id))
        .with_context(|| format!("no identity with ID {id}"))
}

/// Parse `key=value` arguments; repeated keys become multiple values.
fn parse_attributes(args: &[String]) -> Result<Attributes> {
    args.iter()
        .map(|arg| match arg.split_once('=') {
            Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
            _ => bail!("attribute {arg:?} is not of the form key=value"),
        })
        .collect()
}

fn load_image(path: &Path) -> Result<image::DynamicImage> {
    image::open(path).with_context(|| format!("reading image {}", path.display()))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
