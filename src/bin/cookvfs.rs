use clap::{Parser, Subcommand};
use cookvfs::archive::{Mount, MountOptions};
use cookvfs::codec::CompressionType;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "cookvfs", version = "0.1.0", about = "Content-addressed VFS archive CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new archive
    Mount {
        archive: PathBuf,
        /// Compression: none, zlib, bzip2, lzma, zstd (default), brotli
        #[arg(short, long, default_value = "zstd")]
        compression: String,
        #[arg(short, long, default_value = "3")]
        level: u8,
        #[arg(short, long)]
        password: Option<String>,
    },
    /// Pack one or more files into an archive, creating it if needed
    Pack {
        archive: PathBuf,
        #[arg(short, long)]
        password: Option<String>,
        #[arg(short, long, required = true, num_args = 1..)]
        input: Vec<PathBuf>,
    },
    /// List archive contents
    Ls {
        archive: PathBuf,
        #[arg(default_value = "/")]
        path: String,
        #[arg(short, long)]
        password: Option<String>,
    },
    /// Print a file's contents to stdout
    Cat {
        archive: PathBuf,
        path: String,
        #[arg(short, long)]
        password: Option<String>,
    },
    /// Remove a file or directory
    Rm {
        archive: PathBuf,
        path: String,
        #[arg(short, long)]
        recursive: bool,
        #[arg(short, long)]
        password: Option<String>,
    },
    /// Show archive metadata
    Info {
        archive: PathBuf,
        #[arg(short, long)]
        password: Option<String>,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    match Cli::parse().command {
        // ── Mount ────────────────────────────────────────────────────────
        Commands::Mount { archive, compression, level, password } => {
            let mut options = MountOptions { password, ..MountOptions::default() };
            options.compression = parse_compression(&compression);
            options.level = level;
            let mount = Mount::create(&archive, options)?;
            mount.close()?;
            println!("Created archive: {}", archive.display());
        }

        // ── Pack ─────────────────────────────────────────────────────────
        Commands::Pack { archive, password, input } => {
            let mut mount = if archive.exists() {
                open_archive(&archive, password)?
            } else {
                Mount::create(&archive, MountOptions { password, ..MountOptions::default() })?
            };
            for path in &input {
                let data = std::fs::read(path)?;
                let name = format!("/{}", path.file_name().unwrap().to_string_lossy());
                mount.add_file_bytes(&name, &data)?;
                println!("  packed  {} ({} B)", path.display(), data.len());
            }
            mount.close()?;
            let size = std::fs::metadata(&archive)?.len();
            println!("Updated: {} ({} B on disk)", archive.display(), size);
        }

        // ── Ls ───────────────────────────────────────────────────────────
        Commands::Ls { archive, path, password } => {
            let mount = open_archive(&archive, password)?;
            for name in mount.list(&path)? {
                println!("{}", name);
            }
        }

        // ── Cat ──────────────────────────────────────────────────────────
        Commands::Cat { archive, path, password } => {
            let mut mount = open_archive(&archive, password)?;
            let data = mount.read_file(&path)?;
            use std::io::Write;
            std::io::stdout().write_all(&data)?;
        }

        // ── Rm ───────────────────────────────────────────────────────────
        Commands::Rm { archive, path, recursive, password } => {
            let mut mount = open_archive(&archive, password)?;
            mount.unset(&path, recursive)?;
            mount.close()?;
            println!("Removed: {}", path);
        }

        // ── Info ─────────────────────────────────────────────────────────
        Commands::Info { archive, password } => {
            let mut mount = open_archive(&archive, password)?;
            let file_size = std::fs::metadata(&archive)?.len();
            println!("── cookvfs archive ──────────────────────────────────────");
            println!("  Path         {}", archive.display());
            println!("  File size    {} B ({:.2} MiB)", file_size, file_size as f64 / 1_048_576.0);
            println!("  Writable     {}", mount.is_writable());
            println!("  Encrypted    {}", mount.is_encrypted());
            println!("  Pages        {}", mount.page_count()?);
            println!("  Has aside    {}", mount.has_aside());
            println!("  Filesets     {}", mount.list_filesets()?.join(", "));
        }
    }

    Ok(())
}

// ── helpers ──────────────────────────────────────────────────────────────

fn open_archive(path: &PathBuf, password: Option<String>) -> cookvfs::error::Result<Mount> {
    Mount::open(path, MountOptions { password, ..MountOptions::default() })
}

fn parse_compression(s: &str) -> CompressionType {
    CompressionType::from_name(s).unwrap_or_else(|| {
        eprintln!("Unknown compression '{}', defaulting to zstd", s);
        CompressionType::Zstd
    })
}
