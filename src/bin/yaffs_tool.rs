//! Inspect and modify a YAFFS filesystem on a simulated NAND image or an MTD device.
//!
//! Paths given to the subcommands are relative to the mount point, e.g. `yaffs_tool --sim-path
//! nand.bin --sim-layout 64x64x2048 --sim-write put ./hostname etc/hostname`.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use std::fs::File;
use std::io::{ErrorKind, Write};
use std::path::PathBuf;

#[cfg(target_os = "linux")]
use yaffs_direct::nand::mtd::MtdNand;
use yaffs_direct::{
    chunk::{ChunkDevice, TaggedNand},
    fs::{DeviceConfig, FilesystemRuntime, OpenFlags},
    nand::{NandLayout, SimNand},
};

#[derive(Args, Debug)]
#[group(required = true)]
struct NandOptions {
    /// Name of the MTD partition holding the filesystem
    #[cfg(target_os = "linux")]
    #[clap(long, group = "nand-options")]
    mtd_name: Option<String>,

    /// Path to a `/dev/mtdX` device
    #[cfg(target_os = "linux")]
    #[clap(long, group = "nand-options")]
    mtd_dev: Option<PathBuf>,

    /// Path to the NAND image to use; a missing file starts out blank
    #[clap(long, group = "nand-options", requires = "sim_layout")]
    sim_path: Option<PathBuf>,

    /// Layout of the NAND to simulate
    #[clap(long)]
    sim_layout: Option<NandLayout>,

    /// Write back the NAND file when done
    #[clap(long, requires = "sim_path")]
    sim_write: bool,
}

impl NandOptions {
    fn open(&self) -> Result<Box<dyn ChunkDevice + Send>> {
        if let Some(layout) = self.sim_layout {
            let mut sim = SimNand::new(layout);
            if let Some(path) = &self.sim_path {
                match File::open(path) {
                    Ok(mut file) => sim
                        .load(&mut file)
                        .with_context(|| format!("loading {}", path.display()))?,
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }

            return Ok(Box::new(TaggedNand::new(sim)?));
        }

        #[cfg(target_os = "linux")]
        {
            let mtd = if let Some(name) = &self.mtd_name {
                MtdNand::open_named(name)?
            } else if let Some(dev) = &self.mtd_dev {
                MtdNand::open(dev)?
            } else {
                anyhow::bail!("no NAND given");
            };

            Ok(Box::new(TaggedNand::new(mtd)?))
        }

        #[cfg(not(target_os = "linux"))]
        anyhow::bail!("no NAND given")
    }

    fn cleanup(&self, mut storage: Box<dyn ChunkDevice + Send>) -> Result<()> {
        if self.sim_write {
            if let Some(path) = &self.sim_path {
                storage.dump(&mut File::create(path)?)?;
            }
        }

        Ok(())
    }
}

fn parse_mode(s: &str) -> Result<u32> {
    u32::from_str_radix(s, 8).with_context(|| format!("{s:?} is not an octal mode"))
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List a directory
    Ls {
        #[clap(default_value = "")]
        path: String,

        /// Show type, permissions, link count and size
        #[clap(short, long)]
        long: bool,
    },

    /// Print a file to stdout
    Cat { path: String },

    /// Copy a local file into the filesystem
    Put {
        local: PathBuf,
        path: String,

        /// Permission bits of the new file, in octal
        #[clap(long, default_value = "644", value_parser = parse_mode)]
        mode: u32,
    },

    /// Create a directory
    Mkdir {
        path: String,

        #[clap(long, default_value = "755", value_parser = parse_mode)]
        mode: u32,
    },

    /// Remove a file or symlink
    Rm { path: String },

    /// Remove an empty directory
    Rmdir { path: String },

    /// Rename or move an object
    Mv { from: String, to: String },

    /// Create a link. Hard link targets are paths within the filesystem; symlink targets are
    /// stored verbatim.
    Ln {
        target: String,
        path: String,

        #[clap(short = 's', long)]
        symbolic: bool,
    },

    /// Replace the permission bits of an object
    Chmod {
        #[clap(value_parser = parse_mode)]
        mode: u32,
        path: String,
    },

    /// Show space used and available
    Df,
}

impl Command {
    fn execute(self, fs: &FilesystemRuntime, mount: &str) -> Result<()> {
        let at = |path: &str| format!("{}/{}", mount.trim_end_matches('/'), path);

        match self {
            Command::Ls { path, long } => {
                let path = at(&path);
                let dir = fs.opendir(&path).with_context(|| format!("listing {path}"))?;
                while let Some(entry) = fs.readdir(dir)? {
                    if !long {
                        println!("{}", entry.name);
                        continue;
                    }

                    let child = format!("{}/{}", path.trim_end_matches('/'), entry.name);
                    let stat = fs.lstat(&child)?;
                    let kind = match (stat.is_dir(), stat.is_symlink()) {
                        (true, _) => 'd',
                        (_, true) => 'l',
                        _ => '-',
                    };
                    let mut line = format!(
                        "{kind}{:03o} {:3} {:8} {}",
                        stat.perms().bits(),
                        stat.st_nlink,
                        stat.st_size,
                        entry.name
                    );
                    if stat.is_symlink() {
                        line += &format!(" -> {}", fs.readlink(&child)?);
                    }
                    println!("{line}");
                }
                fs.closedir(dir)?;
            }

            Command::Cat { path } => {
                let path = at(&path);
                let fd = fs
                    .open(&path, OpenFlags::O_RDONLY, 0)
                    .with_context(|| format!("opening {path}"))?;
                let mut stdout = std::io::stdout().lock();
                let mut buf = vec![0u8; 4096];
                loop {
                    let n = fs.read(fd, &mut buf)?;
                    if n == 0 {
                        break;
                    }
                    stdout.write_all(&buf[..n])?;
                }
                fs.close(fd)?;
            }

            Command::Put { local, path, mode } => {
                let content = std::fs::read(&local)
                    .with_context(|| format!("reading {}", local.display()))?;
                let path = at(&path);
                let flags = OpenFlags::O_CREAT | OpenFlags::O_WRONLY | OpenFlags::O_TRUNC;
                let fd = fs
                    .open(&path, flags, mode)
                    .with_context(|| format!("creating {path}"))?;
                fs.write(fd, &content)
                    .with_context(|| format!("writing {path}"))?;
                fs.close(fd)?;
            }

            Command::Mkdir { path, mode } => fs.mkdir(&at(&path), mode)?,
            Command::Rm { path } => fs.unlink(&at(&path))?,
            Command::Rmdir { path } => fs.rmdir(&at(&path))?,
            Command::Mv { from, to } => fs.rename(&at(&from), &at(&to))?,
            Command::Ln {
                target,
                path,
                symbolic: true,
            } => fs.symlink(&target, &at(&path))?,
            Command::Ln {
                target,
                path,
                symbolic: false,
            } => fs.link(&at(&target), &at(&path))?,
            Command::Chmod { mode, path } => fs.chmod(&at(&path), mode)?,

            Command::Df => {
                let total = fs.totalspace(mount)?;
                let free = fs.freespace(mount)?;
                println!("{mount}: {} of {total} bytes used, {free} free", total - free);
            }
        };

        Ok(())
    }
}

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Cli {
    /// The NAND holding the filesystem
    #[clap(flatten)]
    nand: NandOptions,

    /// Where to mount the filesystem; subcommand paths are relative to this
    #[clap(long, default_value = "/flash")]
    mount: String,

    #[clap(subcommand)]
    cmd: Command,
}

/// Log to stderr, filtered by `$RUST_LOG`
fn set_up_logging() {
    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_writer(std::io::stderr)
        .compact();
    let filter_layer = EnvFilter::builder().from_env_lossy();

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .init();
}

fn main() -> Result<()> {
    let args = Cli::parse();
    set_up_logging();
    howudoin::init(howudoin::consumers::TermLine::default());

    let storage = args.nand.open()?;
    let fs = FilesystemRuntime::new(vec![DeviceConfig {
        mount_point: args.mount.clone(),
        storage,
    }])?;
    fs.mount(&args.mount)
        .with_context(|| format!("mounting {}", args.mount))?;

    let result = args.cmd.execute(&fs, &args.mount);

    // Unmount even after a failed command so that whatever did happen is checkpointed
    fs.unmount(&args.mount)?;
    howudoin::disable();
    for (_, storage) in fs.into_storage() {
        args.nand.cleanup(storage)?;
    }
    result
}
