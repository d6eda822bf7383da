#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use bfs_block::FileSectorDevice;
use bfs_ext2::{FileKind, FileSystem, Inode, OpenFile};
use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "bfs", about = "blockfs — read-only ext2 image inspector")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print filesystem geometry and block group summary.
    Info {
        /// Path to the ext2 image.
        image: PathBuf,
    },
    /// List a directory.
    Ls {
        image: PathBuf,
        /// Absolute path inside the image.
        #[arg(default_value = "/")]
        path: String,
    },
    /// Write a file's contents to stdout.
    Cat { image: PathBuf, path: String },
    /// Print a symlink's target.
    Readlink { image: PathBuf, path: String },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    match Cli::parse().command {
        Command::Info { image } => info(&image),
        Command::Ls { image, path } => ls(&image, &path),
        Command::Cat { image, path } => cat(&image, &path),
        Command::Readlink { image, path } => readlink(&image, &path),
    }
}

fn open_fs(image: &Path) -> Result<FileSystem> {
    let device = FileSectorDevice::open(image)
        .with_context(|| format!("open image {}", image.display()))?;
    FileSystem::init(Arc::new(device)).context("mount ext2 filesystem")
}

/// Walk an absolute path component by component from the root directory.
fn resolve_path(fs: &FileSystem, path: &str) -> Result<Arc<Inode>> {
    let mut inode = fs.access_root();
    for component in path.split('/').filter(|c| !c.is_empty()) {
        let entry = inode
            .find_entry(component)
            .with_context(|| format!("look up {component:?}"))?;
        let Some(entry) = entry else {
            bail!("no such entry: {component:?} in {path:?}");
        };
        inode = fs.access_inode(entry.inode);
    }
    Ok(inode)
}

fn info(image: &Path) -> Result<()> {
    let fs = open_fs(image)?;
    let geo = fs.geometry();
    println!("block size:       {}", geo.block_size);
    println!("sectors/block:    {}", geo.sectors_per_block);
    println!("inode size:       {}", geo.inode_size);
    println!("inodes per group: {}", geo.inodes_per_group);
    println!("block groups:     {}", geo.num_block_groups);
    for (index, desc) in fs.group_descs().iter().enumerate() {
        println!(
            "group {index}: inode table at block {}, {} free blocks, {} free inodes",
            desc.inode_table, desc.free_blocks_count, desc.free_inodes_count
        );
    }
    Ok(())
}

fn ls(image: &Path, path: &str) -> Result<()> {
    let fs = open_fs(image)?;
    let inode = resolve_path(&fs, path)?;
    let mut dir = OpenFile::new(inode);
    while let Some(name) = dir.read_entries().context("read directory")? {
        if !name.is_empty() {
            println!("{name}");
        }
    }
    Ok(())
}

fn cat(image: &Path, path: &str) -> Result<()> {
    let fs = open_fs(image)?;
    let inode = resolve_path(&fs, path)?;
    let state = inode.wait_ready();
    if state.kind != FileKind::Regular {
        bail!("not a regular file: {path:?}");
    }
    #[expect(clippy::cast_possible_truncation)]
    let contents = inode
        .read_at(0, state.file_size as usize)
        .context("read file contents")?;
    std::io::stdout().write_all(&contents)?;
    Ok(())
}

fn readlink(image: &Path, path: &str) -> Result<()> {
    let fs = open_fs(image)?;
    let inode = resolve_path(&fs, path)?;
    println!("{}", inode.read_link().context("read symlink target")?);
    Ok(())
}
