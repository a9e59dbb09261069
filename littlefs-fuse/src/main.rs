mod block_file;
mod cli;

use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Component, Path, PathBuf};

use clap::Parser;
use littlefs::{Config, DiskVersion, Geometry, LittleFs};
use typed_bytesize::ByteSizeIec;

pub use self::{
    block_file::BlockFile,
    cli::{Cli, Command, GeometryArgs},
};

fn main() -> io::Result<()> {
    env_logger::init();

    let cli = Cli::parse();
    match cli.command {
        Command::Mkfs { image, geometry } => {
            mkfs(&image, &geometry)?;
        }
        Command::Pack {
            source,
            image,
            geometry,
        } => {
            let mut fs = mkfs(&image, &geometry)?;
            pack(&mut fs, &source, "/")?;
            print_usage(&fs)?;
        }
        Command::Unpack {
            image,
            out_dir,
            block_size,
        } => {
            let fs = mount(&image, block_size)?;
            fs::create_dir_all(&out_dir)?;
            for entry in fs.list_recursive("/").map_err(io::Error::other)? {
                let host = host_path(&out_dir, &entry.path)?;
                if entry.ty.is_dir() {
                    fs::create_dir_all(&host)?;
                } else {
                    log::info!("file={:?}", entry.path);
                    fs::write(&host, fs.read_file(&entry.path).map_err(io::Error::other)?)?;
                }
            }
        }
        Command::Ls {
            image,
            path,
            recursive,
            block_size,
        } => {
            let fs = mount(&image, block_size)?;
            let entries = if recursive {
                fs.list_recursive(&path)
            } else {
                fs.list(&path)
            }
            .map_err(io::Error::other)?;

            for entry in entries {
                let kind = if entry.ty.is_dir() { 'd' } else { '-' };
                println!("{kind} {:>12} {}", entry.size, entry.path);
            }
        }
        Command::Df { image, block_size } => {
            let fs = mount(&image, block_size)?;
            let Geometry {
                block_size,
                block_count,
            } = fs.geometry();
            println!(
                "littlefs {} image, {block_count} blocks x {}",
                fs.disk_version(),
                ByteSizeIec(block_size as u64)
            );
            print_usage(&fs)?;
        }
    }

    Ok(())
}

/// 创建镜像文件并格式化
fn mkfs(image: &Path, args: &GeometryArgs) -> io::Result<LittleFs<BlockFile>> {
    let fd = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(image)?;
    let dev = BlockFile::create(fd, args.block_size, args.block_count)?;

    let (major, minor) = args.disk_version;
    let config = Config {
        disk_version: DiskVersion::new(major, minor),
        ..Config::default()
    };
    let fs = LittleFs::format_device(dev, config).map_err(io::Error::other)?;
    println!(
        "image={image:?}\nsize={}",
        ByteSizeIec(fs.geometry().capacity() as u64)
    );
    Ok(fs)
}

/// 镜像中的路径在`out_dir`之下对应的位置，每个名字必须是普通的单个路径分量
fn host_path(out_dir: &Path, path: &str) -> io::Result<PathBuf> {
    let mut host = out_dir.to_path_buf();
    for name in path.split('/').filter(|name| !name.is_empty()) {
        let mut components = Path::new(name).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(_)), None) => host.push(name),
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("refusing to unpack {path:?}"),
                ));
            }
        }
    }
    Ok(host)
}

/// 整个读入内存后挂载
fn mount(image: &Path, block_size: Option<usize>) -> io::Result<LittleFs> {
    let data = fs::read(image)?;
    let hint = block_size.map(|block_size| Geometry::new(block_size, 0));
    LittleFs::mount(&data, hint, Config::default()).map_err(io::Error::other)
}

/// 递归复制宿主机目录`source`到镜像中的`target`
fn pack(fs: &mut LittleFs<BlockFile>, source: &Path, target: &str) -> io::Result<()> {
    let mut children = fs::read_dir(source)?.collect::<Result<Vec<_>, _>>()?;
    children.sort_by_key(|child| child.file_name());

    for child in children {
        let name = child.file_name();
        let Some(name) = name.to_str() else {
            log::warn!("skipping non UTF-8 name {name:?}");
            continue;
        };
        let path = format!("{}/{name}", target.trim_end_matches('/'));

        if child.file_type()?.is_dir() {
            log::info!("dir={path:?}");
            fs.mkdir(&path).map_err(io::Error::other)?;
            pack(fs, &child.path(), &path)?;
        } else {
            log::info!("file={path:?}");
            let data = fs::read(child.path())?;
            fs.write_file(&path, &data).map_err(io::Error::other)?;
        }
    }

    Ok(())
}

fn print_usage<D: littlefs::BlockDevice>(fs: &LittleFs<D>) -> io::Result<()> {
    let usage = fs.usage().map_err(io::Error::other)?;
    println!(
        "capacity={} used={} free={}",
        ByteSizeIec(usage.capacity_bytes),
        ByteSizeIec(usage.used_bytes),
        ByteSizeIec(usage.free_bytes)
    );
    Ok(())
}
