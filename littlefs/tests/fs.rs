use littlefs::{Config, DirEntryType, DiskVersion, Error, Geometry, LittleFs};

const INFO: &[u8] = b"ESPConnect_LittleFS_test\n";

/// 由 littlefs 2.9 (C) 生成的 4096 x 24 镜像，磁盘版本 2.1
const REFERENCE: &[u8] = include_bytes!("images/lfs-2.9-4096x24.img");

fn init_log() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn format(block_size: usize, block_count: usize) -> LittleFs {
    init_log();
    LittleFs::format(Geometry::new(block_size, block_count), Config::default()).unwrap()
}

fn mount(image: &[u8]) -> Result<LittleFs, Error> {
    init_log();
    LittleFs::mount(image, None, Config::default())
}

fn remount(fs: &LittleFs) -> LittleFs {
    mount(&fs.to_image()).unwrap()
}

fn names(fs: &LittleFs, path: &str) -> Vec<String> {
    fs.list(path)
        .unwrap()
        .into_iter()
        .map(|entry| entry.name)
        .collect()
}

/// 模拟一块从设备上导出的镜像
fn fixture() -> Vec<u8> {
    let mut fs = format(4096, 64);
    fs.write_file("/info.txt", INFO).unwrap();
    fs.to_image()
}

#[test]
fn mutation_scenario() {
    let image = fixture();
    let mut fs = LittleFs::mount(&image, None, Config::default()).unwrap();
    assert_eq!(4096, fs.geometry().block_size);
    assert_eq!(INFO, fs.read_file("/info.txt").unwrap());

    fs.mkdir("/newdir").unwrap();
    fs.write_file("/newdir/a.txt", b"abc").unwrap();
    fs.rename("/info.txt", "/info-renamed.txt").unwrap();
    fs.write_file("/todelete.bin", &[1, 2, 3]).unwrap();
    fs.delete_file("/todelete.bin").unwrap();

    // 挂载时复制镜像，原缓冲区不变
    assert_eq!(fixture(), image);

    let fs = remount(&fs);
    assert_eq!(b"abc", &fs.read_file("/newdir/a.txt").unwrap()[..]);
    assert_eq!(INFO, fs.read_file("/info-renamed.txt").unwrap());
    assert_eq!(Err(Error::NotFound), fs.read_file("/info.txt"));
    assert_eq!(Err(Error::NotFound), fs.read_file("/todelete.bin"));
    assert_eq!(vec!["info-renamed.txt", "newdir"], names(&fs, "/"));
}

#[test]
fn format_is_empty_and_idempotent() {
    let mut fs = format(512, 32);
    assert!(fs.list("/").unwrap().is_empty());

    fs.write_file("/a", b"1").unwrap();
    fs.mkdir("/d").unwrap();
    fs.reformat().unwrap();
    assert!(fs.list("/").unwrap().is_empty());

    let fs = remount(&fs);
    assert!(fs.list("/").unwrap().is_empty());
    assert_eq!(Geometry::new(512, 32), fs.geometry());
}

#[test]
fn fresh_superblock_bytes() {
    let image = format(512, 16).to_image();
    let block = &image[512..1024];
    assert_eq!([1, 0, 0, 0], block[..4]);
    assert_eq!([0xf0, 0x0f, 0xff, 0xf7], block[4..8]);
    assert_eq!(b"littlefs", &block[8..16]);

    // INLINESTRUCT: 版本 2.1、块大小与块数
    let sb = &block[20..44];
    assert_eq!([0x01, 0x00, 0x02, 0x00], sb[..4]);
    assert_eq!(512u32.to_le_bytes(), sb[4..8]);
    assert_eq!(16u32.to_le_bytes(), sb[8..12]);
}

#[test]
fn block_size_inference() {
    for block_size in [128, 512, 4096] {
        let mut fs = format(block_size, 32);
        fs.write_file("/x", b"x").unwrap();
        let image = fs.to_image();
        assert_eq!(
            Some(block_size),
            LittleFs::infer_block_size(&image, &Config::default())
        );
        let fs = LittleFs::mount(&image, None, Config::default()).unwrap();
        assert_eq!(Geometry::new(block_size, 32), fs.geometry());
    }

    assert!(matches!(
        LittleFs::mount(&[0xff; 4096], None, Config::default()),
        Err(Error::CorruptImage(_))
    ));
}

#[test]
fn mount_with_hint() {
    let image = format(1024, 20).to_image();
    let fs = LittleFs::mount(&image, Some(Geometry::new(1024, 0)), Config::default()).unwrap();
    assert_eq!(20, fs.geometry().block_count);

    assert!(LittleFs::mount(&image, Some(Geometry::new(1024, 40)), Config::default()).is_err());
}

#[test]
fn usage_accounting() {
    let mut fs = format(512, 64);
    let empty = fs.usage().unwrap();
    assert_eq!(512 * 64, empty.capacity_bytes);
    assert_eq!(2 * 512, empty.used_bytes);

    fs.write_file("/big", &[7u8; 4000]).unwrap();
    fs.mkdir("/d").unwrap();
    let usage = fs.usage().unwrap();
    assert_eq!(usage.capacity_bytes, usage.used_bytes + usage.free_bytes);
    assert_eq!(0, usage.used_bytes % 512);
    // 2 个元数据对与 8 个数据块
    assert_eq!((4 + 8) * 512, usage.used_bytes);

    fs.delete_file("/big").unwrap();
    fs.delete_dir("/d").unwrap();
    assert_eq!(empty, fs.usage().unwrap());
}

#[test]
fn disk_versions() {
    for minor in [0, 1] {
        let version = DiskVersion::new(2, minor);
        let config = Config {
            disk_version: version,
            ..Config::default()
        };
        let mut fs = LittleFs::format(Geometry::new(512, 32), config).unwrap();
        fs.write_file("/v", b"version").unwrap();
        fs.write_file("/w", b"again").unwrap();

        let mut fs = remount(&fs);
        assert_eq!(version, fs.disk_version());
        fs.write_file("/v", b"changed").unwrap();

        let fs = remount(&fs);
        assert_eq!(version, fs.disk_version());
        assert_eq!(b"changed", &fs.read_file("/v").unwrap()[..]);
        assert_eq!(b"again", &fs.read_file("/w").unwrap()[..]);
    }

    let config = Config {
        disk_version: DiskVersion::new(2, 2),
        ..Config::default()
    };
    assert_eq!(
        Err(Error::UnsupportedVersion { major: 2, minor: 2 }),
        LittleFs::format(Geometry::new(512, 32), config).map(drop)
    );
}

#[test]
fn torn_commit_is_discarded() {
    let block_size = 512;
    let mut fs = format(block_size, 32);
    fs.write_file("/kept", b"committed").unwrap();
    let before = fs.to_image();
    fs.write_file("/lost", b"torn").unwrap();
    let mut after = fs.to_image();

    let diff: Vec<usize> = (0..before.len()).filter(|&i| before[i] != after[i]).collect();
    let (first, last) = (diff[0], diff[diff.len() - 1]);
    assert_eq!(first / block_size, last / block_size);

    // 提交只写了一半
    let end = (first / block_size + 1) * block_size;
    after[first + (last - first) / 2..end].fill(0xff);

    let mut fs = LittleFs::mount(&after, None, Config::default()).unwrap();
    assert_eq!(b"committed", &fs.read_file("/kept").unwrap()[..]);
    assert_eq!(Err(Error::NotFound), fs.read_file("/lost"));

    fs.write_file("/lost", b"retry").unwrap();
    let fs = remount(&fs);
    assert_eq!(b"retry", &fs.read_file("/lost").unwrap()[..]);
    assert_eq!(vec!["kept", "lost"], names(&fs, "/"));
}

#[test]
fn directory_splits() {
    let mut fs = format(512, 256);
    let baseline = fs.usage().unwrap();
    fs.mkdir("/many").unwrap();
    for i in 0..120 {
        fs.write_file(&format!("/many/file-{i:03}"), format!("content {i}").as_bytes())
            .unwrap();
    }

    let fs2 = remount(&fs);
    let entries = fs2.list("/many").unwrap();
    assert_eq!(120, entries.len());
    for (i, entry) in entries.iter().enumerate() {
        assert_eq!(format!("file-{i:03}"), entry.name);
        assert_eq!(format!("/many/file-{i:03}"), entry.path);
        assert_eq!(DirEntryType::Regular, entry.ty);
    }
    assert_eq!(
        format!("content {}", 77).as_bytes(),
        &fs2.read_file("/many/file-077").unwrap()[..]
    );
    // 元数据对链中不止一对
    assert!(fs2.stat("/many").unwrap().blocks > 2);

    assert_eq!(Err(Error::NotEmpty), fs.delete_dir("/many"));
    for i in 0..120 {
        fs.delete_file(&format!("/many/file-{i:03}")).unwrap();
    }
    fs.delete_dir("/many").unwrap();
    assert_eq!(baseline, fs.usage().unwrap());

    let fs = remount(&fs);
    assert!(fs.list("/").unwrap().is_empty());
}

#[test]
fn root_splits() {
    let mut fs = format(256, 128);
    for i in 0..40 {
        fs.write_file(&format!("/r{i:02}"), &[i as u8; 20]).unwrap();
    }
    let fs = remount(&fs);
    assert_eq!(40, fs.list("/").unwrap().len());
    assert_eq!(vec![13u8; 20], fs.read_file("/r13").unwrap());
}

#[test]
fn large_file_random_access() {
    let mut fs = format(512, 128);
    let mut data: Vec<u8> = (0..20_000u32).map(|i| (i * 7 % 251) as u8).collect();
    fs.write_file("/blob", &data).unwrap();

    assert_eq!(data, fs.read_file("/blob").unwrap());
    assert_eq!(data[1000..1100], fs.read_file_at("/blob", 1000, 100).unwrap()[..]);
    assert_eq!(data[19_990..], fs.read_file_at("/blob", 19_990, 100).unwrap()[..]);
    assert!(fs.read_file_at("/blob", 30_000, 10).unwrap().is_empty());

    fs.write_file_at("/blob", 5000, b"patched").unwrap();
    data[5000..5007].copy_from_slice(b"patched");
    fs.write_file_at("/blob", 20_010, b"tail").unwrap();
    data.resize(20_010, 0);
    data.extend_from_slice(b"tail");

    let mut fs = remount(&fs);
    assert_eq!(data, fs.read_file("/blob").unwrap());
    let stat = fs.stat("/blob").unwrap();
    assert_eq!(DirEntryType::Regular, stat.mode);
    assert_eq!(20_014, stat.size);

    fs.truncate("/blob", 3000).unwrap();
    assert_eq!(data[..3000], fs.read_file("/blob").unwrap()[..]);
    fs.truncate("/blob", 10).unwrap();
    assert_eq!(data[..10], fs.read_file("/blob").unwrap()[..]);
    assert_eq!(0, fs.stat("/blob").unwrap().blocks);
    fs.truncate("/blob", 16).unwrap();

    let fs = remount(&fs);
    let mut expected = data[..10].to_vec();
    expected.resize(16, 0);
    assert_eq!(expected, fs.read_file("/blob").unwrap());
}

#[test]
fn overwrite_inline_and_ctz() {
    let mut fs = format(512, 64);
    fs.write_file("/f", &[1; 2000]).unwrap();
    fs.write_file("/f", b"small").unwrap();
    assert_eq!(b"small", &fs.read_file("/f").unwrap()[..]);
    fs.write_file("/f", &[2; 700]).unwrap();
    fs.write_file("/f", b"").unwrap();
    assert!(fs.read_file("/f").unwrap().is_empty());

    let fs = remount(&fs);
    assert_eq!(0, fs.stat("/f").unwrap().size);
    assert_eq!(2 * 512, fs.usage().unwrap().used_bytes);
}

#[test]
fn cross_directory_rename() {
    let mut fs = format(512, 64);
    fs.mkdir("/src").unwrap();
    fs.mkdir("/dst").unwrap();
    fs.mkdir("/src/sub").unwrap();
    fs.write_file("/src/sub/deep", b"deep").unwrap();
    fs.write_file("/src/f", &[9; 1500]).unwrap();

    fs.rename("/src/f", "/dst/g").unwrap();
    fs.rename("/src/sub", "/dst/sub").unwrap();
    assert_eq!(
        Err(Error::InvalidArgument("cannot move a directory into itself")),
        fs.rename("/dst", "/dst/sub/inner")
    );
    fs.rename("/dst/g", "/dst/g").unwrap();

    let fs = remount(&fs);
    assert!(fs.list("/src").unwrap().is_empty());
    assert_eq!(vec!["g", "sub"], names(&fs, "/dst"));
    assert_eq!(vec![9u8; 1500], fs.read_file("/dst/g").unwrap());
    assert_eq!(b"deep", &fs.read_file("/dst/sub/deep").unwrap()[..]);
}

#[test]
fn error_codes() {
    let mut fs = format(512, 32);
    fs.mkdir("/d").unwrap();
    fs.write_file("/d/f", b"x").unwrap();
    fs.write_file("/g", b"y").unwrap();

    assert_eq!(Err(Error::NotEmpty), fs.delete_dir("/d"));
    assert_eq!(-39, Error::NotEmpty.code());
    assert_eq!(Err(Error::AlreadyExists), fs.mkdir("/d"));
    assert_eq!(Err(Error::AlreadyExists), fs.rename("/g", "/d/f"));
    assert_eq!(Err(Error::NotFound), fs.read_file("/missing"));
    assert_eq!(Err(Error::NotFound), fs.delete_file("/missing"));
    assert_eq!(Err(Error::NotFound), fs.mkdir("/missing/child"));
    assert_eq!(Err(Error::NotFound), fs.list("/missing"));
    assert_eq!(Err(Error::NotADirectory), fs.list("/g"));
    assert_eq!(Err(Error::NotADirectory), fs.write_file("/g/x", b""));
    assert_eq!(Err(Error::IsADirectory), fs.read_file("/d"));
    assert_eq!(Err(Error::IsADirectory), fs.delete_file("/d"));
    assert_eq!(Err(Error::NotADirectory), fs.delete_dir("/g"));
    assert_eq!(Err(Error::NameTooLong), fs.write_file(&format!("/{}", "n".repeat(256)), b""));
    assert!(matches!(fs.delete_dir("/"), Err(Error::InvalidArgument(_))));
    assert!(matches!(fs.read_file("/../x"), Err(Error::InvalidArgument(_))));

    // 失败的操作不改变镜像
    let fs = remount(&fs);
    assert_eq!(vec!["d", "g"], names(&fs, "/"));
    assert_eq!(vec!["f"], names(&fs, "/d"));
}

#[test]
fn paths_are_normalized() {
    let mut fs = format(512, 32);
    fs.mkdir("a").unwrap();
    fs.write_file("//a/./b/../c", b"c").unwrap();
    assert_eq!(b"c", &fs.read_file("/a/c").unwrap()[..]);
    let entry = &fs.list("/a/").unwrap()[0];
    assert_eq!("/a/c", entry.path);
    assert_eq!(1, entry.size);
}

#[test]
fn recursive_listing() {
    let mut fs = format(512, 64);
    fs.mkdir("/a").unwrap();
    fs.mkdir("/a/b").unwrap();
    fs.write_file("/a/b/c", b"cc").unwrap();
    fs.write_file("/a/d", b"d").unwrap();
    fs.write_file("/e", b"").unwrap();

    let paths: Vec<_> = remount(&fs)
        .list_recursive("/")
        .unwrap()
        .into_iter()
        .map(|entry| (entry.path, entry.ty.is_dir(), entry.size))
        .collect();
    assert_eq!(
        vec![
            ("/a".to_owned(), true, 0),
            ("/a/b".to_owned(), true, 0),
            ("/a/b/c".to_owned(), false, 2),
            ("/a/d".to_owned(), false, 1),
            ("/e".to_owned(), false, 0),
        ],
        paths
    );
}

#[test]
fn user_attributes() {
    let mut fs = format(512, 32);
    fs.write_file("/f", b"data").unwrap();
    fs.set_attr("/f", 0x74, b"text/plain").unwrap();
    fs.set_attr("/f", 1, &[1, 2, 3]).unwrap();
    assert_eq!(Err(Error::NoAttribute), fs.get_attr("/f", 2));

    fs.write_file("/f", b"overwritten").unwrap();
    fs.rename("/f", "/g").unwrap();

    let mut fs = remount(&fs);
    assert_eq!(b"text/plain", &fs.get_attr("/g", 0x74).unwrap()[..]);
    assert_eq!(vec![1u8, 2, 3], fs.get_attr("/g", 1).unwrap());

    fs.remove_attr("/g", 1).unwrap();
    fs.remove_attr("/g", 1).unwrap();
    assert_eq!(Err(Error::NoAttribute), fs.get_attr("/g", 1));
    assert_eq!(Err(Error::NoSpace), fs.set_attr("/g", 3, &[0; 1023]));
    assert_eq!(Err(Error::NotFound), fs.get_attr("/missing", 1));

    let fs = remount(&fs);
    assert_eq!(Err(Error::NoAttribute), fs.get_attr("/g", 1));
    assert_eq!(b"overwritten", &fs.read_file("/g").unwrap()[..]);
}

#[test]
fn no_space() {
    let mut fs = format(512, 8);
    assert_eq!(Err(Error::NoSpace), fs.write_file("/huge", &[0; 8 * 512]));
    // 失败的写入不留下目录项
    assert!(fs.list("/").unwrap().is_empty());
    fs.write_file("/fits", &[1; 1000]).unwrap();
    assert_eq!(vec![1u8; 1000], remount(&fs).read_file("/fits").unwrap());
}

#[test]
fn reference_image() {
    let mut fs = mount(REFERENCE).unwrap();
    assert_eq!(Geometry::new(4096, 24), fs.geometry());
    assert_eq!(DiskVersion::new(2, 1), fs.disk_version());
    assert_eq!(vec!["dir", "info.txt", "many", "moved.txt"], names(&fs, "/"));
    assert_eq!(vec!["big.bin", "nested.txt"], names(&fs, "/dir"));

    assert_eq!(INFO, fs.read_file("/info.txt").unwrap());
    assert_eq!(b"nested\n", &fs.read_file("/dir/nested.txt").unwrap()[..]);
    assert_eq!(b"renamed\n", &fs.read_file("/moved.txt").unwrap()[..]);
    let big: Vec<u8> = (0..10_000u32).map(|i| (i * 7 % 251) as u8).collect();
    assert_eq!(big, fs.read_file("/dir/big.bin").unwrap());

    // 99 个文件分布在两个元数据对中
    let many = names(&fs, "/many");
    assert_eq!(99, many.len());
    assert!(!many.iter().any(|name| name == "file-010"));
    assert_eq!(4, fs.stat("/many").unwrap().blocks);
    assert_eq!(b"content 99", &fs.read_file("/many/file-099").unwrap()[..]);
    assert_eq!(11 * 4096, fs.usage().unwrap().used_bytes);

    fs.write_file("/many/file-100", b"content 100").unwrap();
    fs.delete_file("/many/file-000").unwrap();
    fs.write_file_at("/dir/big.bin", 5000, b"patched").unwrap();
    fs.rename("/moved.txt", "/dir/moved.txt").unwrap();

    let fs = remount(&fs);
    let many = names(&fs, "/many");
    assert_eq!(99, many.len());
    assert_eq!("file-001", many[0]);
    assert_eq!("file-100", many[98]);
    assert_eq!(vec!["dir", "info.txt", "many"], names(&fs, "/"));
    assert_eq!(b"renamed\n", &fs.read_file("/dir/moved.txt").unwrap()[..]);
    let mut patched = big;
    patched[5000..5007].copy_from_slice(b"patched");
    assert_eq!(patched, fs.read_file("/dir/big.bin").unwrap());
}

#[test]
fn corrupt_directory_fails_mount() {
    let mut fs = format(512, 16);
    fs.mkdir("/d").unwrap();
    fs.write_file("/d/f", b"lost").unwrap();
    let mut image = fs.to_image();

    // 根目录之外只有 /d 的元数据对
    image[2 * 512..].fill(0);
    assert!(matches!(mount(&image), Err(Error::CorruptImage(_))));
}

#[test]
fn corrupt_file_chain_is_local() {
    let block_size = 512;
    let mut fs = format(block_size, 32);
    fs.write_file("/small", b"inline").unwrap();
    fs.write_file("/other", &[5u8; 2000]).unwrap();
    let before = fs.to_image();
    fs.write_file("/big", &[9u8; 3000]).unwrap();
    let mut image = fs.to_image();

    // 只有 /big 的数据块在块 {0, 1} 之外发生了变化，改写每块开头的跳表指针
    let block = |b: usize| b * block_size..(b + 1) * block_size;
    let changed: Vec<usize> = (2..32)
        .filter(|&b| before[block(b)] != image[block(b)])
        .collect();
    assert!(changed.len() > 1);
    for b in changed {
        image[block(b)][..4].copy_from_slice(&0xdead_beefu32.to_le_bytes());
    }

    let mut fs = mount(&image).unwrap();
    assert!(matches!(fs.read_file("/big"), Err(Error::CorruptImage(_))));
    assert_eq!(b"inline", &fs.read_file("/small").unwrap()[..]);
    assert_eq!(vec![5u8; 2000], fs.read_file("/other").unwrap());
    assert_eq!(3000, fs.stat("/big").unwrap().size);

    // 分配需要遍历所有文件，损坏的链表使其失败
    assert!(matches!(fs.usage(), Err(Error::CorruptImage(_))));
    assert!(matches!(
        fs.write_file("/more", &[1u8; 2000]),
        Err(Error::CorruptImage(_))
    ));

    fs.delete_file("/big").unwrap();
    fs.write_file("/more", &[1u8; 2000]).unwrap();
    let fs = remount(&fs);
    assert_eq!(vec!["more", "other", "small"], names(&fs, "/"));
    assert_eq!(vec![1u8; 2000], fs.read_file("/more").unwrap());
}

