use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(about = "Build and inspect littlefs images")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Format an empty image
    Mkfs {
        #[arg(long, short)]
        image: PathBuf,

        #[command(flatten)]
        geometry: GeometryArgs,
    },

    /// Format an image and copy a host directory into it
    Pack {
        /// Host directory to copy
        #[arg(long, short)]
        source: PathBuf,

        #[arg(long, short)]
        image: PathBuf,

        #[command(flatten)]
        geometry: GeometryArgs,
    },

    /// Copy every file of an image into a host directory
    Unpack {
        #[arg(long, short)]
        image: PathBuf,

        /// Output directory
        #[arg(long, short = 'O')]
        out_dir: PathBuf,

        /// Block size, inferred from the superblock when omitted
        #[arg(long, short)]
        block_size: Option<usize>,
    },

    /// List a directory of an image
    Ls {
        #[arg(long, short)]
        image: PathBuf,

        #[arg(default_value = "/")]
        path: String,

        /// List subdirectories too
        #[arg(long, short)]
        recursive: bool,

        #[arg(long, short)]
        block_size: Option<usize>,
    },

    /// Show the space usage of an image
    Df {
        #[arg(long, short)]
        image: PathBuf,

        #[arg(long, short)]
        block_size: Option<usize>,
    },
}

#[derive(clap::Args)]
pub struct GeometryArgs {
    #[arg(long, short, default_value_t = 4096)]
    pub block_size: usize,

    #[arg(long, short = 'c', default_value_t = 256)]
    pub block_count: usize,

    /// Disk version written to the superblock: 2.0 or 2.1
    #[arg(long, default_value = "2.1", value_parser = parse_version)]
    pub disk_version: (u16, u16),
}

fn parse_version(s: &str) -> Result<(u16, u16), String> {
    let (major, minor) = s
        .split_once('.')
        .ok_or_else(|| format!("expected MAJOR.MINOR, got {s:?}"))?;
    let major = major.parse().map_err(|e| format!("major version: {e}"))?;
    let minor = minor.parse().map_err(|e| format!("minor version: {e}"))?;
    Ok((major, minor))
}
