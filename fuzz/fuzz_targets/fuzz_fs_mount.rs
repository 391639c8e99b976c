#![no_main]
use flight_storage::{Disk, FileSystem, Geometry, NandDisk, SimNand};
use libfuzzer_sys::{
    arbitrary::{Arbitrary, Unstructured},
    fuzz_target,
};

#[derive(Debug, Arbitrary)]
struct Damage {
    sector: u8,
    offset: u16,
    value: u8,
}

// Mount a formatted volume after scribbling over metadata sectors.
fuzz_target!(|input: &[u8]| {
    let mut u = Unstructured::new(input);
    let damage: Vec<Damage> = match u.arbitrary() {
        Ok(d) => d,
        Err(_) => return,
    };

    let disk = NandDisk::new(SimNand::new(Geometry::small(32)));
    let mut fs = match FileSystem::mount_or_format(disk.clone(), "FUZZ") {
        Ok(fs) => fs,
        Err(_) => return,
    };
    if let Ok(h) = fs.create("/a") {
        let _ = fs.write(h, b"payload");
        let _ = fs.close(h);
    }
    drop(fs);

    let sector_size = match disk.sector_size() {
        Ok(size) => size,
        Err(_) => return,
    };
    let mut buf = vec![0u8; sector_size];
    for d in damage.iter().take(16) {
        let sector = d.sector as u64 % 40;
        if disk.read_sectors(sector, 1, &mut buf).is_err() {
            continue;
        }
        buf[d.offset as usize % sector_size] = d.value;
        let _ = disk.write_sectors(sector, 1, &buf);
    }

    if let Ok(mut fs) = FileSystem::mount(disk) {
        if let Ok(entries) = fs.read_dir("/") {
            for entry in entries {
                let _ = fs.read_to_end(&format!("/{}", entry.name));
            }
        }
        let _ = fs.free_space();
    }
});
