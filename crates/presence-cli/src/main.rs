use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use presence_core::{geofence, AttendanceStore, CaptureGuard, CaptureDevice, PersonId, ZoneId};
use presence_hw::{frame, V4lCamera};
use presence_store::SqliteStore;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "presence", about = "Presence attendance operator CLI")]
struct Cli {
    /// SQLite database (default: $PRESENCE_DB_PATH or ~/.local/share/presence/attendance.db)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage authorized zones
    #[command(subcommand)]
    Zone(ZoneCommand),
    /// Manage registered persons and their reference images
    #[command(subcommand)]
    Person(PersonCommand),
    /// Show a person's attendance history, newest first
    History {
        #[arg(long)]
        person: PersonId,
    },
    /// Check whether a position lies inside a zone (no camera involved)
    Check {
        #[arg(long)]
        zone: ZoneId,
        #[arg(long, allow_hyphen_values = true)]
        lat: f64,
        #[arg(long, allow_hyphen_values = true)]
        lon: f64,
    },
    /// Camera diagnostics
    #[command(subcommand)]
    Camera(CameraCommand),
}

#[derive(Subcommand)]
enum ZoneCommand {
    /// Register a zone
    Add {
        #[arg(long)]
        name: String,
        #[arg(long, allow_hyphen_values = true)]
        lat: f64,
        #[arg(long, allow_hyphen_values = true)]
        lon: f64,
        /// Radius in meters
        #[arg(long)]
        radius: f64,
    },
    /// List zones as JSON
    List,
}

#[derive(Subcommand)]
enum PersonCommand {
    /// Register a person
    Add {
        #[arg(long)]
        name: String,
        #[arg(long)]
        role: Option<String>,
        /// Reference face image (URL or path)
        #[arg(long)]
        face_image: Option<String>,
    },
    /// List persons
    List,
    /// Replace a person's reference face image
    SetReference {
        #[arg(long)]
        id: PersonId,
        /// Reference face image (URL or path)
        #[arg(long)]
        image: String,
    },
}

#[derive(Subcommand)]
enum CameraCommand {
    /// List V4L2 capture devices
    List,
    /// Open a device, grab frames and report what the matcher would see
    Test {
        #[arg(long, default_value = "/dev/video0")]
        device: String,
        #[arg(long, default_value_t = 4)]
        warmup: usize,
        #[arg(long, default_value_t = 5)]
        frames: usize,
    },
}

fn default_db_path() -> PathBuf {
    if let Ok(path) = std::env::var("PRESENCE_DB_PATH") {
        return PathBuf::from(path);
    }
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("presence/attendance.db")
}

async fn open_store(db: Option<PathBuf>) -> Result<SqliteStore> {
    let path = db.unwrap_or_else(default_db_path);
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    Ok(SqliteStore::open(&path).await?)
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Zone(ZoneCommand::Add {
            name,
            lat,
            lon,
            radius,
        }) => {
            let store = open_store(cli.db).await?;
            let zone = store.add_zone(&name, lat, lon, radius).await?;
            println!("Registered zone {} ({})", zone.id, zone.name);
        }
        Commands::Zone(ZoneCommand::List) => {
            let store = open_store(cli.db).await?;
            let zones = store.list_zones().await?;
            println!("{}", serde_json::to_string_pretty(&zones)?);
        }
        Commands::Person(PersonCommand::Add {
            name,
            role,
            face_image,
        }) => {
            let store = open_store(cli.db).await?;
            let person = store
                .add_person(&name, role.as_deref(), face_image.as_deref())
                .await?;
            println!("Registered person {} ({})", person.id, person.name);
        }
        Commands::Person(PersonCommand::List) => {
            let store = open_store(cli.db).await?;
            for person in store.list_persons().await? {
                println!(
                    "{:>5}  {:<24} {:<10} {}",
                    person.id,
                    person.name,
                    person.role.as_deref().unwrap_or("-"),
                    person.face_image.as_deref().unwrap_or("(no reference image)")
                );
            }
        }
        Commands::Person(PersonCommand::SetReference { id, image }) => {
            let store = open_store(cli.db).await?;
            println!("{}", set_reference(&store, id, &image).await?);
        }
        Commands::History { person } => {
            let store = open_store(cli.db).await?;
            let history = store.history(person).await?;
            println!("{}", serde_json::to_string_pretty(&history)?);
        }
        Commands::Check { zone, lat, lon } => {
            let store = open_store(cli.db).await?;
            let Some(zone) = store.find_zone(zone).await? else {
                bail!("zone {zone} not found");
            };
            let check = geofence::is_within_zone(lat, lon, &zone)?;
            println!(
                "{}: {:.1} m from center of {} (radius {:.1} m)",
                if check.inside { "inside" } else { "outside" },
                check.distance_meters,
                zone.name,
                zone.radius_meters
            );
        }
        Commands::Camera(CameraCommand::List) => {
            let devices = V4lCamera::list_devices();
            if devices.is_empty() {
                println!("No V4L2 capture devices found");
            }
            for dev in devices {
                println!("{}  {} ({}, {})", dev.path, dev.name, dev.driver, dev.bus);
            }
        }
        Commands::Camera(CameraCommand::Test {
            device,
            warmup,
            frames,
        }) => camera_test(&V4lCamera::new(device, warmup), frames).await?,
    }

    Ok(())
}

/// Replace a person's reference image and describe what changed.
async fn set_reference(store: &SqliteStore, id: PersonId, image: &str) -> Result<String> {
    let Some(person) = store.find_person(id).await? else {
        bail!("person {id} not found");
    };
    store.set_face_image(id, image).await?;
    Ok(match person.face_image {
        Some(previous) => format!(
            "Reference image for {} ({id}) replaced: {previous} -> {image}",
            person.name
        ),
        None => format!("Reference image for {} ({id}) set to {image}", person.name),
    })
}

async fn camera_test(camera: &dyn CaptureDevice, frames: usize) -> Result<()> {
    println!("Opening {}...", camera.describe());
    let mut guard = CaptureGuard::acquire(camera).await?;

    for _ in 0..frames {
        let f = guard.next_frame().await?;
        println!(
            "frame {:>3}: {}x{}  brightness {:>6.1}  {}",
            f.sequence,
            f.width,
            f.height,
            frame::avg_brightness(&f.data),
            if f.is_dark { "dark" } else { "ok" }
        );
    }

    let best = guard.best_frame(frames).await?;
    drop(guard);
    if best.is_dark {
        println!("All frames dark: check the lens, lighting or exposure");
    } else {
        println!("Camera OK (frame {} usable)", best.sequence);
    }
    Ok(())
}
