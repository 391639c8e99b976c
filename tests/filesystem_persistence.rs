//! Filesystem persistence across reboots and power loss
//!
//! Every "reboot" drops the whole stack and mounts a fresh translation layer
//! on the same simulated chip.

use flight_storage::{
    Disk, EntryKind, FileSystem, Geometry, ImageDisk, NandDisk, SimNand, StorageError,
};
use std::sync::Arc;
use std::thread;

fn reboot(nand: &SimNand) -> FileSystem<NandDisk<SimNand>> {
    FileSystem::mount(NandDisk::new(nand.clone())).unwrap()
}

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(13).wrapping_add(seed)).collect()
}

#[test]
fn test_tree_survives_reboot() {
    let nand = SimNand::new(Geometry::small(64));
    let mut fs = FileSystem::mount_or_format(NandDisk::new(nand.clone()), "FLIGHT").unwrap();
    fs.mkdir("/data").unwrap();
    fs.mkdir("/config").unwrap();

    let h = fs.create("/data/dat_00.pb3").unwrap();
    fs.write(h, &pattern(5000, 1)).unwrap();
    fs.close(h).unwrap();
    let h = fs.create("/config/board.cfg").unwrap();
    fs.write(h, &pattern(160, 2)).unwrap();
    fs.close(h).unwrap();
    fs.unmount().unwrap();

    let mut fs = reboot(&nand);
    assert_eq!(fs.superblock().label(), "FLIGHT");
    assert_eq!(fs.read_to_end("/data/dat_00.pb3").unwrap(), pattern(5000, 1));
    assert_eq!(fs.read_to_end("/config/board.cfg").unwrap(), pattern(160, 2));

    let names: Vec<_> = fs
        .read_dir("/")
        .unwrap()
        .into_iter()
        .map(|e| (e.name, e.kind))
        .collect();
    assert_eq!(
        names,
        vec![
            ("config".to_string(), EntryKind::Directory),
            ("data".to_string(), EntryKind::Directory),
        ]
    );
}

#[test]
fn test_synced_appends_survive_power_loss() {
    let nand = SimNand::new(Geometry::small(64));
    let mut fs = FileSystem::mount_or_format(NandDisk::new(nand.clone()), "FLIGHT").unwrap();
    let h = fs.create("/log_00.txt").unwrap();

    let mut expected = Vec::new();
    for i in 0..20u8 {
        let line = format!("t+{} event {}\n", i as u32 * 100, i);
        fs.write(h, line.as_bytes()).unwrap();
        expected.extend_from_slice(line.as_bytes());
        if i % 5 == 4 {
            fs.sync(h).unwrap();
        }
    }
    fs.write(h, b"never synced").unwrap();
    drop(fs);

    let mut fs = reboot(&nand);
    assert_eq!(fs.read_to_end("/log_00.txt").unwrap(), expected);

    // The file keeps growing after the reboot.
    let h = fs.open_append("/log_00.txt").unwrap();
    fs.write(h, b"resumed\n").unwrap();
    fs.close(h).unwrap();
    expected.extend_from_slice(b"resumed\n");
    assert_eq!(fs.read_to_end("/log_00.txt").unwrap(), expected);
}

#[test]
fn test_power_cut_at_every_program_keeps_committed_state() {
    for cut_after in 0..24u64 {
        let nand = SimNand::new(Geometry::small(32));
        let mut fs = FileSystem::mount_or_format(NandDisk::new(nand.clone()), "CUT").unwrap();
        let h = fs.create("/a").unwrap();
        fs.write(h, &pattern(1500, 7)).unwrap();
        fs.close(h).unwrap();

        nand.cut_power_after(cut_after);
        let second = (|| -> flight_storage::Result<()> {
            let h = fs.create("/b")?;
            fs.write(h, &pattern(2000, 9))?;
            fs.close(h)?;
            fs.remove("/a")
        })();
        drop(fs);
        nand.restore_power();

        let mut fs = reboot(&nand);
        match second {
            Ok(()) => {
                assert!(!fs.exists("/a"));
                assert_eq!(fs.read_to_end("/b").unwrap(), pattern(2000, 9));
            }
            Err(_) => {
                // Either generation is acceptable, a mix is not.
                if fs.exists("/a") {
                    assert_eq!(fs.read_to_end("/a").unwrap(), pattern(1500, 7), "cut {}", cut_after);
                }
                if fs.exists("/b") {
                    let b = fs.read_to_end("/b").unwrap();
                    assert!(b.is_empty() || b == pattern(2000, 9), "cut {}", cut_after);
                }
                assert!(fs.exists("/a") || fs.exists("/b"), "cut {}", cut_after);
            }
        }
    }
}

#[test]
fn test_freed_space_is_reused_across_many_files() {
    let nand = SimNand::new(Geometry::small(32));
    let mut fs = FileSystem::mount_or_format(NandDisk::new(nand.clone()), "CHURN").unwrap();
    let total = fs.free_space();

    // Far more data than the volume holds, written and deleted in turn.
    for i in 0..40u8 {
        let path = format!("/f{}", i);
        let h = fs.create(&path).unwrap();
        fs.write(h, &pattern(40 * 512, i)).unwrap();
        fs.close(h).unwrap();
        assert_eq!(fs.read_to_end(&path).unwrap(), pattern(40 * 512, i));
        fs.remove(&path).unwrap();
    }
    fs.unmount().unwrap();

    let fs = reboot(&nand);
    assert_eq!(fs.free_space(), total);
}

#[test]
fn test_host_and_filesystem_share_the_disk() {
    let nand = SimNand::new(Geometry::small(64));
    let disk = NandDisk::new(nand);
    let mut fs = FileSystem::mount_or_format(disk.clone(), "SHARED").unwrap();
    let h = fs.create("/dat_00.pb3").unwrap();

    // The host side reads raw sectors through its own clone while the
    // writer keeps appending.
    let host = Arc::new(disk.clone());
    let readers: Vec<_> = (0..3)
        .map(|_| {
            let host = Arc::clone(&host);
            thread::spawn(move || {
                let size = host.sector_size().unwrap();
                let mut buf = vec![0u8; size];
                for _ in 0..200 {
                    match host.read_sectors(0, 1, &mut buf) {
                        Ok(()) | Err(StorageError::Busy) => {}
                        Err(e) => panic!("host read failed: {}", e),
                    }
                }
            })
        })
        .collect();

    for i in 0..50u8 {
        fs.write(h, &pattern(300, i)).unwrap();
    }
    fs.close(h).unwrap();
    for reader in readers {
        reader.join().unwrap();
    }

    let data = fs.read_to_end("/dat_00.pb3").unwrap();
    assert_eq!(data.len(), 50 * 300);
    assert_eq!(&data[..300], &pattern(300, 0)[..]);
}

#[test]
fn test_image_disk_volume_persists() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sd.img");

    let disk = ImageDisk::create(&path, 256).unwrap();
    let mut fs = FileSystem::mount_or_format(disk, "SDCARD").unwrap();
    fs.mkdir("/gps").unwrap();
    let h = fs.create("/gps/gps_00.pb3").unwrap();
    fs.write(h, &pattern(3000, 3)).unwrap();
    fs.close(h).unwrap();
    fs.unmount().unwrap();

    let mut fs = FileSystem::mount(ImageDisk::open(&path).unwrap()).unwrap();
    assert_eq!(fs.superblock().label(), "SDCARD");
    assert_eq!(fs.read_to_end("/gps/gps_00.pb3").unwrap(), pattern(3000, 3));
}
