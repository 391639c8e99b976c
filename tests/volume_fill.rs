//! Recording until the volume is full
//!
//! Three streams are interleaved the way the writer pipeline feeds them, with
//! a flush every few rounds. The volume must run out of data space, not out of
//! metadata space, and the recorded flight must survive a remount.

use flight_storage::flight::HEADER_LEN;
use flight_storage::{
    Disk, FileManager, FlightKey, Geometry, ImageDisk, NandDisk, SimNand, StorageError,
    StorageSettings, Stream,
};

const FRAME_LEN: usize = 500;
const ROUNDS_PER_FLUSH: u64 = 20;
const INTERLEAVED: [Stream; 3] = [Stream::Sensor, Stream::State, Stream::Gps];

/// Record until a write or flush fails; returns the bytes accepted and the
/// error that stopped recording.
fn record_until_full<D: Disk>(files: &mut FileManager<D>) -> (u64, StorageError) {
    let frame = vec![0x5Au8; FRAME_LEN];
    let mut recorded = 0;
    for round in 1.. {
        for stream in INTERLEAVED {
            if let Err(e) = files.write(stream, &frame) {
                return (recorded, e);
            }
            recorded += FRAME_LEN as u64;
        }
        if round % ROUNDS_PER_FLUSH == 0 {
            if let Err(e) = files.flush() {
                return (recorded, e);
            }
        }
    }
    unreachable!()
}

fn check_fill<D: Disk>(mut files: FileManager<D>) {
    files.mount().unwrap();
    let key = files.open_flight().unwrap();
    let total = files.space().unwrap().total_bytes;

    let (recorded, error) = record_until_full(&mut files);
    assert!(matches!(error, StorageError::OutOfSpace), "{:?}", error);

    let report = files.space().unwrap();
    assert!(
        report.free_bytes < total / 8,
        "stopped with {} of {} bytes free",
        report.free_bytes,
        total
    );
    assert!(recorded > total * 3 / 4, "only {} of {} bytes recorded", recorded, total);

    // The tail of the stream that hit the wall may not fit anymore.
    if let Err(e) = files.unmount() {
        assert!(matches!(e, StorageError::OutOfSpace), "{:?}", e);
    }

    files.mount().unwrap();
    assert_eq!(files.list_flights().unwrap(), vec![key]);
    let mut kept = 0;
    for stream in INTERLEAVED {
        let path = files.path_of(stream, key);
        let content = files.read_file(&path).unwrap();
        assert!(content.len() > HEADER_LEN, "{} lost its frames", path);
        kept += (content.len() - HEADER_LEN) as u64;
    }
    assert!(kept * 10 >= recorded * 9, "kept {} of {} bytes", kept, recorded);
}

#[test]
fn test_nand_volume_fills_data_region() {
    let nand = SimNand::new(Geometry::small(64));
    let files = FileManager::new(NandDisk::new(nand), &StorageSettings::default()).unwrap();
    check_fill(files);
}

#[test]
fn test_image_volume_fills_data_region() {
    let dir = tempfile::tempdir().unwrap();
    let disk = ImageDisk::create(dir.path().join("sd.img"), 8192).unwrap();
    let files = FileManager::new(disk, &StorageSettings::default()).unwrap();
    check_fill(files);
}

#[test]
fn test_flush_commits_once() {
    let nand = SimNand::new(Geometry::small(64));
    let mut files = FileManager::new(NandDisk::new(nand), &StorageSettings::default()).unwrap();
    files.mount().unwrap();
    assert_eq!(files.open_flight().unwrap(), FlightKey::Suffix(0));

    for stream in INTERLEAVED {
        files.write(stream, &[1u8; FRAME_LEN]).unwrap();
    }
    let generation = files.filesystem().unwrap().generation();
    files.flush().unwrap();
    assert_eq!(files.filesystem().unwrap().generation(), generation + 1);
}
