//! End-to-end tests driving the public API over RAM disks and image files.
//!
//! Every test formats its own volume, so they are independent of each other.
//!
//! Run with: cargo test --test volume_e2e

use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use byteorder::{ByteOrder, LittleEndian};
use fatvol::config::PartitionMapping;
use fatvol::fs::{AM_RDO, FM_EXFAT, FM_FAT, FM_FAT32, FM_SFD};
use fatvol::{
    BlockDevice, DiskError, DiskStatus, FatFs, FatKind, FsConfig, FsError, ImageFile, IoctlReply,
    IoctlRequest, MkfsOptions, OpenMode, PartitionStyle, RamDisk,
};

#[derive(Debug, Clone, Copy)]
enum Kind {
    Fat12,
    Fat16,
    Fat32,
    ExFat,
}

const ALL: [Kind; 4] = [Kind::Fat12, Kind::Fat16, Kind::Fat32, Kind::ExFat];

fn config() -> FsConfig {
    FsConfig {
        rtc: false,
        ..FsConfig::default()
    }
}

fn layout(kind: Kind) -> (u64, MkfsOptions) {
    let (sectors, fmt, au_size) = match kind {
        Kind::Fat12 => (4096, FM_FAT | FM_SFD, 0),
        Kind::Fat16 => (16_384, FM_FAT | FM_SFD, 512),
        Kind::Fat32 => (68_000, FM_FAT32 | FM_SFD, 512),
        Kind::ExFat => (16_384, FM_EXFAT | FM_SFD, 0),
    };
    (
        sectors,
        MkfsOptions {
            fmt,
            n_fat: 2,
            au_size,
            ..MkfsOptions::default()
        },
    )
}

/// An engine with a freshly formatted volume 0.
fn formatted(kind: Kind) -> FatFs {
    formatted_with(kind, config())
}

fn formatted_with(kind: Kind, config: FsConfig) -> FatFs {
    let (sectors, opts) = layout(kind);
    let fs = FatFs::new(config).unwrap();
    fs.attach(0, Arc::new(RamDisk::new(sectors, 512)));
    fs.mount("0:", false).unwrap();
    fs.mkfs("0:", &opts).unwrap();
    fs
}

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u32).wrapping_mul(31).wrapping_add(seed as u32) as u8)
        .collect()
}

fn write_file(fs: &FatFs, path: &str, data: &[u8]) {
    let mut f = fs
        .open(path, OpenMode::WRITE | OpenMode::CREATE_ALWAYS)
        .unwrap();
    f.write_all(data).unwrap();
    f.close().unwrap();
}

fn read_file(fs: &FatFs, path: &str) -> Vec<u8> {
    let mut f = fs.open(path, OpenMode::READ).unwrap();
    let mut out = Vec::new();
    f.read_to_end(&mut out).unwrap();
    out
}

// ============================================================================
// Files
// ============================================================================

#[test]
fn test_write_then_read_back() {
    for kind in ALL {
        let fs = formatted(kind);
        let data = pattern(100_000, 7);
        write_file(&fs, "0:/data.bin", &data);
        assert_eq!(read_file(&fs, "0:/data.bin"), data, "{kind:?}");
        let info = fs.stat("0:/data.bin").unwrap();
        assert_eq!(info.size, 100_000);
        assert!(info.is_archive());
    }
}

#[test]
fn test_fs_type_matches_format() {
    let expect = [FatKind::Fat12, FatKind::Fat16, FatKind::Fat32, FatKind::ExFat];
    for (kind, want) in ALL.into_iter().zip(expect) {
        assert_eq!(formatted(kind).fs_type("0:").unwrap(), want);
    }
}

#[test]
fn test_data_survives_remount() {
    for kind in ALL {
        let fs = formatted(kind);
        fs.mkdir("0:/keep").unwrap();
        write_file(&fs, "0:/keep/notes.txt", b"persisted");
        let free = fs.getfree("0:").unwrap();
        fs.unmount("0:").unwrap();
        fs.mount("0:", true).unwrap();
        assert_eq!(read_file(&fs, "0:/keep/notes.txt"), b"persisted");
        assert_eq!(fs.getfree("0:").unwrap(), free, "{kind:?}");
    }
}

#[test]
fn test_seek_and_overwrite() {
    for kind in ALL {
        let fs = formatted(kind);
        let mut f = fs
            .open("0:/f", OpenMode::READ | OpenMode::WRITE | OpenMode::CREATE_ALWAYS)
            .unwrap();
        f.write_all(&pattern(3000, 1)).unwrap();
        f.seek(SeekFrom::Start(1000)).unwrap();
        f.write_all(b"XYZ").unwrap();
        assert_eq!(f.tell(), 1003);
        f.seek(SeekFrom::Start(0)).unwrap();
        let mut back = Vec::new();
        f.read_to_end(&mut back).unwrap();
        let mut want = pattern(3000, 1);
        want[1000..1003].copy_from_slice(b"XYZ");
        assert_eq!(back, want, "{kind:?}");
        assert!(f.eof());
        f.close().unwrap();
    }
}

#[test]
fn test_seek_past_end_extends_writable_file() {
    for kind in [Kind::Fat16, Kind::ExFat] {
        let fs = formatted(kind);
        let mut f = fs
            .open("0:/sparse", OpenMode::WRITE | OpenMode::CREATE_NEW)
            .unwrap();
        assert_eq!(f.seek(SeekFrom::Start(10_000)).unwrap(), 10_000);
        assert_eq!(f.size(), 10_000);
        f.write_all(b"tail").unwrap();
        f.close().unwrap();
        assert_eq!(fs.stat("0:/sparse").unwrap().size, 10_004);
        let back = read_file(&fs, "0:/sparse");
        assert_eq!(&back[10_000..], b"tail");
    }
}

#[test]
fn test_read_only_handle_seek_clips() {
    let fs = formatted(Kind::Fat12);
    write_file(&fs, "0:/short", b"12345");
    let mut f = fs.open("0:/short", OpenMode::READ).unwrap();
    assert_eq!(f.seek(SeekFrom::Start(100)).unwrap(), 5);
    assert_eq!(f.write(b"x"), Err(FsError::Denied));
    assert!(f.seek(SeekFrom::Current(-10)).is_err());
}

#[test]
fn test_truncate_releases_clusters() {
    for kind in ALL {
        let fs = formatted(kind);
        let before = fs.getfree("0:").unwrap().free_clusters;
        let mut f = fs
            .open("0:/t", OpenMode::READ | OpenMode::WRITE | OpenMode::CREATE_ALWAYS)
            .unwrap();
        f.write_all(&pattern(50_000, 3)).unwrap();
        f.seek_to(100).unwrap();
        f.truncate().unwrap();
        assert_eq!(f.size(), 100);
        f.close().unwrap();
        assert_eq!(fs.getfree("0:").unwrap().free_clusters, before - 1, "{kind:?}");
        assert_eq!(read_file(&fs, "0:/t"), pattern(100, 3));

        let mut f = fs.open("0:/t", OpenMode::WRITE).unwrap();
        f.truncate().unwrap();
        f.close().unwrap();
        assert_eq!(fs.getfree("0:").unwrap().free_clusters, before);
    }
}

#[test]
fn test_create_always_discards_contents() {
    for kind in [Kind::Fat32, Kind::ExFat] {
        let fs = formatted(kind);
        let before = fs.getfree("0:").unwrap().free_clusters;
        write_file(&fs, "0:/big", &pattern(40_000, 9));
        write_file(&fs, "0:/big", b"small");
        assert_eq!(read_file(&fs, "0:/big"), b"small");
        assert_eq!(fs.getfree("0:").unwrap().free_clusters, before - 1, "{kind:?}");
    }
}

#[test]
fn test_append_mode() {
    for kind in [Kind::Fat12, Kind::ExFat] {
        let fs = formatted(kind);
        write_file(&fs, "0:/log.txt", b"abc");
        let mut f = fs
            .open("0:/log.txt", OpenMode::WRITE | OpenMode::OPEN_APPEND)
            .unwrap();
        assert_eq!(f.tell(), 3);
        f.write_all(b"def").unwrap();
        f.close().unwrap();
        assert_eq!(read_file(&fs, "0:/log.txt"), b"abcdef");
    }
}

#[test]
fn test_open_dispositions() {
    let fs = formatted(Kind::Fat16);
    assert_eq!(
        fs.open("0:/none", OpenMode::READ).unwrap_err(),
        FsError::NoFile
    );
    assert_eq!(
        fs.open("0:/no/dir/file", OpenMode::READ).unwrap_err(),
        FsError::NoPath
    );
    write_file(&fs, "0:/x", b"1");
    assert_eq!(
        fs.open("0:/x", OpenMode::WRITE | OpenMode::CREATE_NEW)
            .unwrap_err(),
        FsError::Exist
    );
    fs.mkdir("0:/d").unwrap();
    assert_eq!(fs.open("0:/d", OpenMode::READ).unwrap_err(), FsError::NoFile);
    assert_eq!(
        fs.open("0:/d", OpenMode::WRITE | OpenMode::OPEN_ALWAYS)
            .unwrap_err(),
        FsError::Denied
    );
    assert_eq!(fs.open("0:/", OpenMode::READ).unwrap_err(), FsError::InvalidName);
}

#[test]
fn test_read_only_attribute() {
    let fs = formatted(Kind::ExFat);
    write_file(&fs, "0:/ro", b"fixed");
    fs.chmod("0:/ro", AM_RDO, AM_RDO).unwrap();
    assert!(fs.stat("0:/ro").unwrap().is_read_only());
    assert_eq!(fs.open("0:/ro", OpenMode::WRITE).unwrap_err(), FsError::Denied);
    assert_eq!(fs.unlink("0:/ro"), Err(FsError::Denied));
    assert_eq!(read_file(&fs, "0:/ro"), b"fixed");
}

#[test]
fn test_volume_full() {
    let fs = formatted(Kind::Fat12);
    let space = fs.getfree("0:").unwrap();
    let mut f = fs
        .open("0:/fill", OpenMode::WRITE | OpenMode::CREATE_NEW)
        .unwrap();
    let big = vec![0xA5u8; space.total_bytes() as usize + 4096];
    let n = f.write(&big).unwrap();
    assert_eq!(n as u64, space.free_bytes());
    assert_eq!(f.write(b"more"), Err(FsError::Denied));
    f.close().unwrap();
    assert_eq!(fs.getfree("0:").unwrap().free_clusters, 0);
    assert_eq!(fs.mkdir("0:/d"), Err(FsError::Denied));
    fs.unlink("0:/fill").unwrap();
    assert_eq!(fs.getfree("0:").unwrap().free_clusters, space.free_clusters);
}

#[test]
fn test_gets_and_forward() {
    let fs = formatted(Kind::Fat16);
    write_file(&fs, "0:/lines.txt", b"first line\nsecond\nlast");
    let mut f = fs.open("0:/lines.txt", OpenMode::READ).unwrap();
    assert_eq!(f.gets(64).unwrap().as_deref(), Some("first line\n"));
    assert_eq!(f.gets(3).unwrap().as_deref(), Some("sec"));
    assert_eq!(f.gets(64).unwrap().as_deref(), Some("ond\n"));
    assert_eq!(f.gets(64).unwrap().as_deref(), Some("last"));
    assert_eq!(f.gets(64).unwrap(), None);

    f.seek_to(0).unwrap();
    let mut sink = Vec::new();
    let n = f
        .forward(100, |chunk| {
            sink.extend_from_slice(chunk);
            chunk.len()
        })
        .unwrap();
    assert_eq!(n, 22);
    assert_eq!(sink, b"first line\nsecond\nlast");

    f.seek_to(0).unwrap();
    let n = f.forward(100, |_| 0).unwrap();
    assert_eq!(n, 0);
    assert_eq!(f.tell(), 0);
}

#[test]
fn test_expand_preallocates() {
    for kind in [Kind::Fat16, Kind::ExFat] {
        let fs = formatted(kind);
        let before = fs.getfree("0:").unwrap();
        let mut f = fs
            .open("0:/pre", OpenMode::READ | OpenMode::WRITE | OpenMode::CREATE_NEW)
            .unwrap();
        f.expand(64 * 1024, true).unwrap();
        assert_eq!(f.size(), 64 * 1024);
        if matches!(kind, Kind::ExFat) {
            assert!(f.is_contiguous());
        }
        f.write_all(&pattern(5000, 4)).unwrap();
        assert_eq!(f.expand(1024, true), Err(FsError::Denied));
        f.close().unwrap();

        let after = fs.getfree("0:").unwrap();
        let used = (64 * 1024) / before.cluster_bytes as u32;
        assert_eq!(after.free_clusters, before.free_clusters - used, "{kind:?}");
        let back = read_file(&fs, "0:/pre");
        assert_eq!(back.len(), 64 * 1024);
        assert_eq!(&back[..5000], &pattern(5000, 4)[..]);
    }
}

#[test]
fn test_link_map_on_fragmented_file() {
    for kind in [Kind::Fat32, Kind::ExFat] {
        let fs = formatted(kind);
        let bcs = fs.getfree("0:").unwrap().cluster_bytes as usize;
        let mut a = fs
            .open("0:/a", OpenMode::WRITE | OpenMode::CREATE_NEW)
            .unwrap();
        let mut b = fs
            .open("0:/b", OpenMode::WRITE | OpenMode::CREATE_NEW)
            .unwrap();
        let data = pattern(bcs * 6, 5);
        for chunk in data.chunks(bcs) {
            a.write_all(chunk).unwrap();
            b.write_all(&pattern(bcs, 2)).unwrap();
        }
        a.close().unwrap();
        b.close().unwrap();

        let mut f = fs.open("0:/a", OpenMode::READ).unwrap();
        assert_eq!(f.create_link_map(1), Err(FsError::NotEnoughCore));
        let frags = f.create_link_map(16).unwrap();
        assert!(frags >= 2, "{kind:?}: {frags} fragments");

        for &ofs in &[bcs * 5 + 17, 3, bcs * 2, bcs * 4 - 1] {
            f.seek_to(ofs as u64).unwrap();
            let mut buf = [0u8; 8];
            let n = f.read(&mut buf).unwrap();
            let end = (ofs + n).min(data.len());
            assert_eq!(&buf[..n], &data[ofs..end], "{kind:?} at {ofs}");
        }
        f.drop_link_map();
        let mut all = Vec::new();
        f.seek_to(0).unwrap();
        f.read_to_end(&mut all).unwrap();
        assert_eq!(all, data);
    }
}

#[test]
fn test_create_close_reopen_each_format() {
    for kind in ALL {
        let fs = formatted(kind);
        let names = ["0:/A.TXT", "0:/a", "0:/data.bin", "0:/Mixed Case Name.txt"];
        for name in names {
            write_file(&fs, name, b"hello");
        }
        for name in names {
            let mut f = fs.open(name, OpenMode::READ).unwrap();
            assert_eq!(f.size(), 5, "{kind:?} {name}");
            let mut buf = [0u8; 16];
            assert_eq!(f.read(&mut buf).unwrap(), 5);
            assert_eq!(&buf[..5], b"hello");
        }
        let mut listed: Vec<String> = fs
            .opendir("0:/")
            .unwrap()
            .map(|e| e.unwrap().name)
            .collect();
        listed.sort();
        assert_eq!(listed, vec!["A.TXT", "Mixed Case Name.txt", "a", "data.bin"], "{kind:?}");

        fs.rename("0:/Mixed Case Name.txt", "0:/renamed entry.txt").unwrap();
        assert_eq!(fs.stat("0:/renamed entry.txt").unwrap().name, "renamed entry.txt");
        assert_eq!(read_file(&fs, "0:/renamed entry.txt"), b"hello");
    }
}

#[test]
fn test_exfat_growth_across_sessions() {
    let fs = formatted(Kind::ExFat);
    let mut expect = Vec::new();
    for round in 0..6u8 {
        let chunk = pattern(3000, round);
        let mut f = fs
            .open("0:/grow.bin", OpenMode::WRITE | OpenMode::OPEN_APPEND)
            .unwrap();
        f.write_all(&chunk).unwrap();
        f.close().unwrap();
        expect.extend_from_slice(&chunk);
        // Take the clusters right behind the growing file.
        write_file(&fs, &format!("0:/gap{round}.bin"), &pattern(5000, round + 100));
    }
    fs.unmount("0:").unwrap();
    fs.mount("0:", true).unwrap();

    assert_eq!(fs.stat("0:/grow.bin").unwrap().size, expect.len() as u64);
    assert_eq!(read_file(&fs, "0:/grow.bin"), expect);
    for round in 0..6u8 {
        assert_eq!(
            read_file(&fs, &format!("0:/gap{round}.bin")),
            pattern(5000, round + 100)
        );
    }
}

#[test]
fn test_single_cluster_files_fill_volume() {
    let opts = MkfsOptions {
        fmt: FM_FAT | FM_SFD,
        n_fat: 2,
        au_size: 32_768,
        ..MkfsOptions::default()
    };
    let fs = FatFs::new(config()).unwrap();
    fs.attach(0, Arc::new(RamDisk::new(4096, 512)));
    fs.mount("0:", false).unwrap();
    assert_eq!(fs.mkfs("0:", &opts).unwrap(), FatKind::Fat12);

    let n = fs.getfree("0:").unwrap().free_clusters;
    assert!(n > 16 && n < 100, "{n} clusters");
    for i in 0..n {
        write_file(&fs, &format!("0:/F{i:03}.BIN"), &[i as u8]);
    }
    assert_eq!(fs.getfree("0:").unwrap().free_clusters, 0);

    let mut f = fs
        .open("0:/EXTRA.BIN", OpenMode::WRITE | OpenMode::CREATE_NEW)
        .unwrap();
    assert_eq!(f.write(b"x"), Err(FsError::Denied));
    f.close().unwrap();
    assert_eq!(fs.stat("0:/EXTRA.BIN").unwrap().size, 0);
    assert_eq!(read_file(&fs, "0:/F007.BIN"), vec![7u8]);
}

// ============================================================================
// Directories and names
// ============================================================================

#[test]
fn test_long_names_and_listing() {
    for kind in [Kind::Fat16, Kind::Fat32, Kind::ExFat] {
        let fs = formatted(kind);
        fs.mkdir("0:/docs").unwrap();
        for i in 1..=40 {
            write_file(&fs, &format!("0:/docs/Report number {i:02}.txt"), b"r");
        }
        let mut names: Vec<String> = fs
            .opendir("0:/docs")
            .unwrap()
            .map(|e| e.unwrap().name)
            .collect();
        names.sort();
        let want: Vec<String> = (1..=40)
            .map(|i| format!("Report number {i:02}.txt"))
            .collect();
        assert_eq!(names, want, "{kind:?}");

        let (mut dir, first) = fs.find_first("0:/docs", "report number 1*").unwrap();
        let mut hits = vec![first.unwrap().name];
        while let Some(info) = dir.find_next().unwrap() {
            hits.push(info.name);
        }
        assert_eq!(hits.len(), 10);

        let info = fs.stat("0:/DOCS/report NUMBER 07.TXT").unwrap();
        assert_eq!(info.name, "Report number 07.txt");
    }
}

#[test]
fn test_short_name_case_preserved() {
    let fs = formatted(Kind::Fat12);
    write_file(&fs, "0:/readme.txt", b"");
    write_file(&fs, "0:/MAKEFILE", b"");
    let mut names: Vec<String> = fs.opendir("0:/").unwrap().map(|e| e.unwrap().name).collect();
    names.sort();
    assert_eq!(names, vec!["MAKEFILE".to_string(), "readme.txt".to_string()]);
}

#[test]
fn test_rename_file_keeps_contents() {
    for kind in ALL {
        let fs = formatted(kind);
        fs.mkdir("0:/in").unwrap();
        fs.mkdir("0:/out").unwrap();
        write_file(&fs, "0:/in/a long file name.dat", &pattern(2000, 8));
        fs.rename("0:/in/a long file name.dat", "0:/out/renamed.dat")
            .unwrap();
        assert_eq!(fs.stat("0:/in/a long file name.dat"), Err(FsError::NoFile));
        assert_eq!(read_file(&fs, "0:/out/renamed.dat"), pattern(2000, 8));
        assert_eq!(
            fs.rename("0:/out/renamed.dat", "0:/in"),
            Err(FsError::Exist),
            "{kind:?}"
        );
    }
}

#[test]
fn test_directory_cannot_move_below_itself() {
    for kind in ALL {
        let fs = formatted(kind);
        fs.mkdir("0:/a").unwrap();
        fs.mkdir("0:/a/b").unwrap();
        write_file(&fs, "0:/a/b/keep.txt", b"kept");
        let free = fs.getfree("0:").unwrap().free_clusters;

        assert_eq!(fs.rename("0:/a", "0:/a/b/c"), Err(FsError::Denied), "{kind:?}");
        assert_eq!(fs.rename("0:/a", "0:/a/c"), Err(FsError::Denied));
        fs.chdir("0:/a/b").unwrap();
        assert_eq!(fs.rename("/a", "c"), Err(FsError::Denied));
        fs.chdir("/").unwrap();
        assert_eq!(read_file(&fs, "0:/a/b/keep.txt"), b"kept");
        assert_eq!(fs.getfree("0:").unwrap().free_clusters, free);

        // Moves into unrelated or parent directories still work.
        fs.mkdir("0:/d").unwrap();
        fs.rename("0:/a/b", "0:/d/b").unwrap();
        assert_eq!(fs.stat("0:/a/b"), Err(FsError::NoFile));
        assert_eq!(read_file(&fs, "0:/d/b/keep.txt"), b"kept");
        fs.rename("0:/d/b", "0:/b").unwrap();
        fs.chdir("0:/b").unwrap();
        write_file(&fs, "../top.txt", b"up");
        fs.chdir("/").unwrap();
        assert_eq!(read_file(&fs, "0:/top.txt"), b"up");
    }
}

#[test]
fn test_mkdir_in_full_root_releases_cluster() {
    let opts = MkfsOptions {
        fmt: FM_FAT | FM_SFD,
        n_fat: 1,
        n_root: 16,
        ..MkfsOptions::default()
    };
    let fs = FatFs::new(config()).unwrap();
    fs.attach(0, Arc::new(RamDisk::new(4096, 512)));
    fs.mount("0:", false).unwrap();
    fs.mkfs("0:", &opts).unwrap();
    for i in 0..16 {
        write_file(&fs, &format!("0:/R{i:02}"), b"");
    }
    let free = fs.getfree("0:").unwrap().free_clusters;
    assert_eq!(fs.mkdir("0:/SUB"), Err(FsError::Denied));
    assert_eq!(fs.getfree("0:").unwrap().free_clusters, free);
    assert_eq!(fs.stat("0:/SUB"), Err(FsError::NoFile));
}

#[test]
fn test_relative_paths_and_cwd() {
    let fs = formatted(Kind::ExFat);
    fs.mkdir("0:/a").unwrap();
    fs.mkdir("0:/a/b").unwrap();
    fs.chdir("0:/a/b").unwrap();
    write_file(&fs, "here.txt", b"1");
    write_file(&fs, "../up.txt", b"2");
    assert_eq!(fs.getcwd().unwrap(), "0:/a/b");
    assert_eq!(read_file(&fs, "0:/a/b/here.txt"), b"1");
    assert_eq!(read_file(&fs, "0:/a/up.txt"), b"2");
    assert_eq!(fs.unlink("0:/a/b"), Err(FsError::Denied));
    fs.chdir("/").unwrap();
    assert_eq!(fs.getcwd().unwrap(), "0:/");
}

// ============================================================================
// Sharing
// ============================================================================

#[test]
fn test_sharing_rules() {
    let fs = formatted(Kind::Fat16);
    write_file(&fs, "0:/shared", b"data");
    let r1 = fs.open("0:/shared", OpenMode::READ).unwrap();
    let r2 = fs.open("0:/shared", OpenMode::READ).unwrap();
    assert_eq!(fs.open("0:/shared", OpenMode::WRITE).unwrap_err(), FsError::Locked);
    assert_eq!(fs.unlink("0:/shared"), Err(FsError::Locked));
    assert_eq!(fs.rename("0:/shared", "0:/moved"), Err(FsError::Locked));
    drop(r1);
    drop(r2);

    let mut w = fs.open("0:/shared", OpenMode::WRITE).unwrap();
    assert_eq!(fs.open("0:/shared", OpenMode::READ).unwrap_err(), FsError::Locked);
    w.close().unwrap();
    assert_eq!(w.close(), Err(FsError::InvalidObject));
    fs.unlink("0:/shared").unwrap();
}

#[test]
fn test_open_directory_blocks_removal() {
    let fs = formatted(Kind::Fat32);
    fs.mkdir("0:/busy").unwrap();
    let dir = fs.opendir("0:/busy").unwrap();
    assert_eq!(fs.unlink("0:/busy"), Err(FsError::Locked));
    assert_eq!(fs.rename("0:/busy", "0:/idle"), Err(FsError::Locked));
    drop(dir);
    fs.unlink("0:/busy").unwrap();
}

#[test]
fn test_open_object_limit() {
    let fs = formatted_with(
        Kind::Fat12,
        FsConfig {
            max_open_objects: 2,
            ..config()
        },
    );
    let _a = fs.open("0:/a", OpenMode::WRITE | OpenMode::CREATE_NEW).unwrap();
    let _b = fs.open("0:/b", OpenMode::WRITE | OpenMode::CREATE_NEW).unwrap();
    assert_eq!(
        fs.open("0:/c", OpenMode::WRITE | OpenMode::CREATE_NEW)
            .unwrap_err(),
        FsError::TooManyOpenFiles
    );
    assert_eq!(fs.stat("0:/c"), Err(FsError::NoFile));
}

#[test]
fn test_unmount_invalidates_open_file() {
    let fs = formatted(Kind::Fat16);
    let mut f = fs
        .open("0:/f", OpenMode::WRITE | OpenMode::CREATE_NEW)
        .unwrap();
    f.write_all(b"abc").unwrap();
    fs.unmount("0:").unwrap();
    assert_eq!(f.write(b"d"), Err(FsError::InvalidObject));
    assert_eq!(f.close(), Err(FsError::InvalidObject));
}

#[test]
fn test_threads_share_engine() {
    let fs = Arc::new(formatted(Kind::Fat32));
    let handles: Vec<_> = (0..4)
        .map(|t| {
            let fs = Arc::clone(&fs);
            std::thread::spawn(move || {
                let path = format!("0:/thread{t}.bin");
                write_file(&fs, &path, &pattern(20_000, t as u8));
                read_file(&fs, &path)
            })
        })
        .collect();
    for (t, h) in handles.into_iter().enumerate() {
        assert_eq!(h.join().unwrap(), pattern(20_000, t as u8));
    }
}

#[test]
fn test_reentered_volume_fails_at_once() {
    let fs = formatted_with(
        Kind::Fat16,
        FsConfig {
            lock_timeout_ms: 60_000,
            ..config()
        },
    );
    write_file(&fs, "0:/r.txt", b"abc");
    let mut f = fs.open("0:/r.txt", OpenMode::READ).unwrap();
    let started = Instant::now();
    let mut inner = None;
    let n = f
        .forward(10, |chunk| {
            inner = Some(fs.stat("0:/r.txt"));
            chunk.len()
        })
        .unwrap();
    assert_eq!(n, 3);
    assert!(matches!(inner, Some(Err(FsError::Timeout))));
    assert!(started.elapsed() < Duration::from_secs(30));
    assert_eq!(fs.stat("0:/r.txt").unwrap().size, 3);
}

// ============================================================================
// Device failures
// ============================================================================

/// A RAM disk whose next read can be made to fail.
struct FlakyDisk {
    inner: RamDisk,
    fail_read: AtomicBool,
}

impl FlakyDisk {
    fn new(inner: RamDisk) -> Self {
        Self {
            inner,
            fail_read: AtomicBool::new(false),
        }
    }

    fn fail_next_read(&self) {
        self.fail_read.store(true, Ordering::SeqCst);
    }
}

impl BlockDevice for FlakyDisk {
    fn status(&self) -> DiskStatus {
        self.inner.status()
    }

    fn initialize(&self) -> DiskStatus {
        self.inner.initialize()
    }

    fn read(&self, buf: &mut [u8], sector: u64, count: u32) -> Result<(), DiskError> {
        if self.fail_read.swap(false, Ordering::SeqCst) {
            return Err(DiskError::NotReady);
        }
        self.inner.read(buf, sector, count)
    }

    fn write(&self, buf: &[u8], sector: u64, count: u32) -> Result<(), DiskError> {
        self.inner.write(buf, sector, count)
    }

    fn ioctl(&self, request: IoctlRequest) -> Result<IoctlReply, DiskError> {
        self.inner.ioctl(request)
    }
}

#[test]
fn test_device_failure_latches_disk_error() {
    let (sectors, opts) = layout(Kind::Fat16);
    let disk = Arc::new(FlakyDisk::new(RamDisk::new(sectors, 512)));
    let fs = FatFs::new(config()).unwrap();
    fs.attach(0, disk.clone());
    fs.mount("0:", false).unwrap();
    fs.mkfs("0:", &opts).unwrap();
    let data = pattern(8192, 4);
    write_file(&fs, "0:/data.bin", &data);

    let mut f = fs.open("0:/data.bin", OpenMode::READ).unwrap();
    let mut buf = vec![0u8; 2048];
    disk.fail_next_read();
    assert_eq!(f.read(&mut buf), Err(FsError::DiskErr));
    assert_eq!(f.error(), Some(FsError::DiskErr));
    assert_eq!(f.read(&mut buf), Err(FsError::DiskErr));
    drop(f);

    // The failure belongs to that handle only.
    assert_eq!(read_file(&fs, "0:/data.bin"), data);
}

// ============================================================================
// Volumes, labels and partitions
// ============================================================================

#[test]
fn test_label_and_serial() {
    for kind in [Kind::Fat12, Kind::Fat32, Kind::ExFat] {
        let fs = formatted(kind);
        assert_eq!(fs.getlabel("0:").unwrap().0, "");
        fs.setlabel("0:Archive").unwrap();
        let (label, serial) = fs.getlabel("0:").unwrap();
        let want = if matches!(kind, Kind::ExFat) {
            "Archive"
        } else {
            "ARCHIVE"
        };
        assert_eq!(label, want);
        assert_ne!(serial, 0);
    }
}

#[test]
fn test_write_protected_medium() {
    let (sectors, opts) = layout(Kind::Fat16);
    let disk = RamDisk::new(sectors, 512);
    let fs = FatFs::new(config()).unwrap();
    let disk = Arc::new(disk);
    fs.attach(0, disk.clone());
    fs.mount("0:", false).unwrap();
    fs.mkfs("0:", &opts).unwrap();
    write_file(&fs, "0:/kept", b"kept");
    fs.unmount("0:").unwrap();

    let image = disk.snapshot();
    fs.attach(0, Arc::new(RamDisk::from_image(image, 512).write_protect(true)));
    fs.mount("0:", true).unwrap();
    assert_eq!(read_file(&fs, "0:/kept"), b"kept");
    assert_eq!(fs.mkdir("0:/new"), Err(FsError::WriteProtected));
    assert_eq!(
        fs.open("0:/kept", OpenMode::WRITE).unwrap_err(),
        FsError::WriteProtected
    );
}

fn two_volume_engine(sectors: u64, style: PartitionStyle) -> FatFs {
    let fs = FatFs::new(FsConfig {
        partition_map: vec![
            PartitionMapping {
                drive: 0,
                partition: 1,
            },
            PartitionMapping {
                drive: 0,
                partition: 2,
            },
        ],
        ..config()
    })
    .unwrap();
    fs.attach(0, Arc::new(RamDisk::new(sectors, 512)));
    fs.fdisk(0, &[60, 40], style).unwrap();
    let opts = MkfsOptions {
        fmt: FM_FAT,
        ..MkfsOptions::default()
    };
    for vol in ["0:", "1:"] {
        fs.mount(vol, false).unwrap();
        fs.mkfs(vol, &opts).unwrap();
    }
    fs
}

fn check_volumes_independent(fs: &FatFs) {
    write_file(fs, "0:/first.txt", b"one");
    write_file(fs, "1:/second.txt", b"two");
    let root0: Vec<String> = fs.opendir("0:/").unwrap().map(|e| e.unwrap().name).collect();
    let root1: Vec<String> = fs.opendir("1:/").unwrap().map(|e| e.unwrap().name).collect();
    assert_eq!(root0, vec!["first.txt".to_string()]);
    assert_eq!(root1, vec!["second.txt".to_string()]);
    let total0 = fs.getfree("0:").unwrap().total_bytes();
    let total1 = fs.getfree("1:").unwrap().total_bytes();
    assert!(total0 > total1);
}

#[test]
fn test_mbr_partitions() {
    let fs = two_volume_engine(40_000, PartitionStyle::Mbr);
    check_volumes_independent(&fs);
}

#[test]
fn test_gpt_partitions() {
    let fs = two_volume_engine(70_000, PartitionStyle::Gpt);
    check_volumes_independent(&fs);
}

/// Rewrite GPT entry 0 in both copies of the table and re-seal the headers.
fn reseal_first_gpt_entry(disk: &RamDisk, sectors: u64, edit: impl Fn(&mut [u8])) {
    for hdr_lba in [1, sectors - 1] {
        let mut hdr = [0u8; 512];
        disk.read(&mut hdr, hdr_lba, 1).unwrap();
        let arr_lba = LittleEndian::read_u64(&hdr[72..]);
        let len = LittleEndian::read_u32(&hdr[80..]) as usize * 128;
        let mut array = vec![0u8; len];
        for (i, chunk) in array.chunks_exact_mut(512).enumerate() {
            disk.read(chunk, arr_lba + i as u64, 1).unwrap();
        }
        edit(&mut array[..128]);
        for (i, chunk) in array.chunks_exact(512).enumerate() {
            disk.write(chunk, arr_lba + i as u64, 1).unwrap();
        }
        LittleEndian::write_u32(&mut hdr[88..], crc32fast::hash(&array));
        LittleEndian::write_u32(&mut hdr[16..], 0);
        let crc = crc32fast::hash(&hdr[..92]);
        LittleEndian::write_u32(&mut hdr[16..], crc);
        disk.write(&hdr, hdr_lba, 1).unwrap();
    }
}

#[test]
fn test_gpt_entry_with_inverted_range() {
    let sectors = 70_000;
    let disk = Arc::new(RamDisk::new(sectors, 512));
    let fs = FatFs::new(FsConfig {
        partition_map: vec![PartitionMapping {
            drive: 0,
            partition: 1,
        }],
        ..config()
    })
    .unwrap();
    fs.attach(0, disk.clone());
    fs.fdisk(0, &[100], PartitionStyle::Gpt).unwrap();
    fs.mount("0:", false).unwrap();
    fs.mkfs(
        "0:",
        &MkfsOptions {
            fmt: FM_FAT,
            ..MkfsOptions::default()
        },
    )
    .unwrap();
    write_file(&fs, "0:/x.txt", b"x");
    fs.unmount("0:").unwrap();

    reseal_first_gpt_entry(&disk, sectors, |e| {
        let first = LittleEndian::read_u64(&e[32..]);
        LittleEndian::write_u64(&mut e[40..], first - 2);
    });
    assert_eq!(fs.mount("0:", true), Err(FsError::NoFilesystem));
}

#[test]
fn test_fdisk_invalidates_mounts() {
    let fs = two_volume_engine(40_000, PartitionStyle::Mbr);
    let mut dir = fs.opendir("0:/").unwrap();
    fs.fdisk(0, &[100], PartitionStyle::Mbr).unwrap();
    assert_eq!(dir.read(), Err(FsError::InvalidObject));
}

#[test]
fn test_image_file_round_trip() {
    let tmp = tempfile::TempDir::new().unwrap();
    let path = tmp.path().join("volume.img");
    let (sectors, opts) = layout(Kind::Fat16);
    {
        let fs = FatFs::new(config()).unwrap();
        fs.attach(0, Arc::new(ImageFile::create(&path, sectors, 512).unwrap()));
        fs.mount("0:", false).unwrap();
        fs.mkfs("0:", &opts).unwrap();
        fs.mkdir("0:/saved").unwrap();
        write_file(&fs, "0:/saved/blob", &pattern(12_345, 6));
        fs.unmount("0:").unwrap();
    }
    let fs = FatFs::new(config()).unwrap();
    fs.attach(0, Arc::new(ImageFile::open(&path, 512).unwrap()));
    fs.mount("0:", true).unwrap();
    assert_eq!(read_file(&fs, "0:/saved/blob"), pattern(12_345, 6));
}

#[test]
fn test_exfat_requires_long_names() {
    let (sectors, opts) = layout(Kind::ExFat);
    let disk = Arc::new(RamDisk::new(sectors, 512));
    let fs = FatFs::new(config()).unwrap();
    fs.attach(0, disk.clone());
    fs.mount("0:", false).unwrap();
    fs.mkfs("0:", &opts).unwrap();

    let plain = FatFs::new(FsConfig {
        long_names: false,
        ..config()
    })
    .unwrap();
    plain.attach(0, disk);
    assert_eq!(plain.mount("0:", true), Err(FsError::NoFilesystem));
}
