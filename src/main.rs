use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};

use qimg::config::Config;
use qimg::{ImageDescriptor, ImageFormat, QemuImg, SecretKey};

#[derive(Parser)]
#[command(name = "qimg")]
#[command(version)]
#[command(about = "Create, inspect, and snapshot QEMU disk images")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new disk image
    Create {
        /// Image file path
        path: PathBuf,

        /// Virtual size: plain bytes or a K/M/G/T suffix (e.g. 10G)
        size: String,

        /// Image format
        #[arg(short, long, default_value_t = ImageFormat::Qcow2)]
        format: ImageFormat,

        /// Base image to record deltas against
        #[arg(short, long)]
        backing: Option<PathBuf>,

        /// File holding the encryption secret (enables encryption)
        #[arg(long)]
        secret_file: Option<PathBuf>,

        /// Optimization profile to apply before creation
        #[arg(long, value_enum)]
        optimize: Option<Profile>,
    },

    /// Show image information
    Info {
        /// Image file path
        path: PathBuf,

        /// File holding the encryption secret, for encrypted images
        #[arg(long)]
        secret_file: Option<PathBuf>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Manage image snapshots
    Snapshot {
        /// Image file path
        path: PathBuf,

        /// File holding the encryption secret, for encrypted images
        #[arg(long)]
        secret_file: Option<PathBuf>,

        #[command(subcommand)]
        action: SnapshotAction,
    },

    /// Change the backing file of an image
    Rebase {
        /// Image file path
        path: PathBuf,

        /// New backing file
        new_backing: PathBuf,

        /// File holding the encryption secret, for encrypted images
        #[arg(long)]
        secret_file: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum SnapshotAction {
    /// List snapshots
    List,
    /// Create a snapshot
    Create {
        /// Snapshot name; generated from the configured prefix when omitted
        name: Option<String>,
    },
    /// Restore a snapshot
    Restore {
        /// Snapshot name
        name: String,
    },
    /// Delete a snapshot
    Delete {
        /// Snapshot name
        name: String,
    },
}

/// Creation-time optimization profile
#[derive(Debug, Clone, Copy, ValueEnum)]
enum Profile {
    /// Favor write throughput over on-disk footprint
    Speed,
    /// Favor on-disk footprint over unlock/write speed
    Size,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::load()?;
    let qemu = QemuImg::new(&config.qemu_img_binary);

    match cli.command {
        Commands::Create {
            path,
            size,
            format,
            backing,
            secret_file,
            optimize,
        } => cmd_create(&qemu, path, &size, format, backing, secret_file, optimize),
        Commands::Info {
            path,
            secret_file,
            json,
        } => cmd_info(&qemu, &path, secret_file, json),
        Commands::Snapshot {
            path,
            secret_file,
            action,
        } => cmd_snapshot(&config, &qemu, &path, secret_file, action),
        Commands::Rebase {
            path,
            new_backing,
            secret_file,
        } => cmd_rebase(&qemu, &path, &new_backing, secret_file),
    }
}

fn cmd_create(
    qemu: &QemuImg,
    path: PathBuf,
    size: &str,
    format: ImageFormat,
    backing: Option<PathBuf>,
    secret_file: Option<PathBuf>,
    optimize: Option<Profile>,
) -> Result<()> {
    let virtual_size = parse_size(size)?;

    let img = match secret_file {
        Some(file) => {
            let secret = read_secret(&file)?;
            ImageDescriptor::new_encrypted(path, format, secret, virtual_size)?
        }
        None => ImageDescriptor::new(path, format, virtual_size),
    };

    let img = match optimize {
        Some(Profile::Speed) => img.optimize_speed(),
        Some(Profile::Size) => img.optimize_size(),
        None => img,
    };

    let img = match backing {
        Some(backing) => img.with_backing_file(backing)?,
        None => img,
    };

    qemu.create(&img)?;
    println!(
        "Created {} image {} ({})",
        img.format,
        img.path.display(),
        format_size(img.virtual_size)
    );

    Ok(())
}

fn cmd_info(
    qemu: &QemuImg,
    path: &Path,
    secret_file: Option<PathBuf>,
    json: bool,
) -> Result<()> {
    let img = open_image(qemu, path, secret_file)?;
    let info = qemu.inspect(&img)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&info)?);
        return Ok(());
    }

    println!("Image: {}", path.display());
    println!("Format: {}", info.format);
    println!("Virtual size: {}", format_size(info.virtual_size));
    println!("Encrypted: {}", info.encrypted);
    if let Some(backing) = &info.backing_file {
        println!("Backing file: {}", backing.display());
    }
    if let Some(cluster) = info.cluster_size {
        println!("Cluster size: {}", format_size(cluster));
    }

    if !info.snapshots.is_empty() {
        println!();
        println!("Snapshots:");
        for snap in &info.snapshots {
            println!(
                "  {:>4}  {:24}  {}  {}",
                snap.id,
                snap.name,
                snap.created
                    .with_timezone(&chrono::Local)
                    .format("%Y-%m-%d %H:%M:%S"),
                snap.vm_clock_display()
            );
        }
    }

    Ok(())
}

fn cmd_snapshot(
    config: &Config,
    qemu: &QemuImg,
    path: &Path,
    secret_file: Option<PathBuf>,
    action: SnapshotAction,
) -> Result<()> {
    let img = open_image(qemu, path, secret_file)?;

    match action {
        SnapshotAction::List => {
            let snapshots = qemu.snapshots(&img)?;
            if snapshots.is_empty() {
                println!("No snapshots for {}", path.display());
            } else {
                for snap in snapshots {
                    println!(
                        "  {:>4}  {:24}  {}  {}",
                        snap.id,
                        snap.name,
                        snap.created
                            .with_timezone(&chrono::Local)
                            .format("%Y-%m-%d %H:%M:%S"),
                        snap.vm_clock_display()
                    );
                }
            }
        }
        SnapshotAction::Create { name } => {
            let name = name.unwrap_or_else(|| {
                format!(
                    "{}-{}",
                    config.snapshot_prefix,
                    chrono::Local::now().format("%Y%m%d-%H%M%S")
                )
            });
            let snap = qemu.create_snapshot(&img, &name)?;
            println!("Created snapshot '{}' (id {})", snap.name, snap.id);
        }
        SnapshotAction::Restore { name } => {
            qemu.restore_snapshot(&img, &name)?;
            println!("Restored snapshot '{}'", name);
        }
        SnapshotAction::Delete { name } => {
            qemu.delete_snapshot(&img, &name)?;
            println!("Deleted snapshot '{}'", name);
        }
    }

    Ok(())
}

fn cmd_rebase(
    qemu: &QemuImg,
    path: &Path,
    new_backing: &Path,
    secret_file: Option<PathBuf>,
) -> Result<()> {
    let mut img = open_image(qemu, path, secret_file)?;
    qemu.rebase(&mut img, new_backing)?;
    println!(
        "Rebased {} onto {}",
        path.display(),
        new_backing.display()
    );
    Ok(())
}

fn open_image(
    qemu: &QemuImg,
    path: &Path,
    secret_file: Option<PathBuf>,
) -> Result<ImageDescriptor> {
    let img = match secret_file {
        Some(file) => qemu.open_encrypted(path, read_secret(&file)?)?,
        None => qemu.open(path)?,
    };
    Ok(img)
}

/// Read an encryption secret from a file, trimming the trailing newline.
fn read_secret(path: &Path) -> Result<SecretKey> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read secret from {:?}", path))?;
    let secret = content.trim_end_matches(['\r', '\n']);
    if secret.is_empty() {
        bail!("Secret file {:?} is empty", path);
    }
    Ok(SecretKey::new(secret))
}

/// Parse a size like "10G", "512M", or "1073741824" into bytes.
fn parse_size(size: &str) -> Result<u64> {
    let size = size.trim();
    if size.is_empty() {
        bail!("Size cannot be empty");
    }

    let (number, multiplier) = match size.chars().last() {
        Some(suffix) if suffix.is_ascii_alphabetic() => {
            let multiplier: u64 = match suffix.to_ascii_uppercase() {
                'K' => 1 << 10,
                'M' => 1 << 20,
                'G' => 1 << 30,
                'T' => 1 << 40,
                other => bail!("Unknown size suffix '{}'", other),
            };
            (&size[..size.len() - 1], multiplier)
        }
        _ => (size, 1),
    };

    let value: u64 = number
        .trim()
        .parse()
        .with_context(|| format!("Invalid size '{}'", size))?;
    value
        .checked_mul(multiplier)
        .with_context(|| format!("Size '{}' overflows", size))
}

/// Format bytes to human-readable size
fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.1}G", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1}M", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1}K", bytes as f64 / KB as f64)
    } else {
        format!("{}B", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("1024").unwrap(), 1024);
        assert_eq!(parse_size("4K").unwrap(), 4096);
        assert_eq!(parse_size("512M").unwrap(), 512 * 1024 * 1024);
        assert_eq!(parse_size("10G").unwrap(), 10737418240);
        assert_eq!(parse_size("2T").unwrap(), 2 * (1u64 << 40));
        assert_eq!(parse_size("10g").unwrap(), 10737418240);

        assert!(parse_size("").is_err());
        assert!(parse_size("10X").is_err());
        assert!(parse_size("G").is_err());
        assert!(parse_size("ten").is_err());
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(512), "512B");
        assert_eq!(format_size(1024), "1.0K");
        assert_eq!(format_size(1536), "1.5K");
        assert_eq!(format_size(1048576), "1.0M");
        assert_eq!(format_size(1073741824), "1.0G");
    }
}
