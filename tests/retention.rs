//! Flight retention through the file manager
//!
//! Flights are opened on a mounted volume and the surviving file sets are
//! checked on disk, including across reboots and the 99 -> 0 rollover.

use chrono::NaiveDate;
use flight_storage::flight::HEADER_LEN;
use flight_storage::{
    FileManager, FlightKey, Geometry, Layout, NandDisk, RotationScheme, SimNand, StorageSettings,
    Stream,
};

fn settings(retain: u32) -> StorageSettings {
    StorageSettings {
        retain_flights: retain,
        ..StorageSettings::default()
    }
}

fn manager(nand: &SimNand, settings: &StorageSettings) -> FileManager<NandDisk<SimNand>> {
    let mut files = FileManager::new(NandDisk::new(nand.clone()), settings).unwrap();
    files.mount().unwrap();
    files
}

fn suffixes(keys: &[FlightKey]) -> Vec<u8> {
    keys.iter()
        .map(|k| match k {
            FlightKey::Suffix(n) => *n,
            other => panic!("unexpected key {}", other),
        })
        .collect()
}

/// Place an empty flight set on disk without going through retention.
fn plant(files: &mut FileManager<NandDisk<SimNand>>, key: FlightKey) {
    for stream in Stream::RECORDED {
        let path = files.path_of(stream, key);
        files.write_file(&path, b"").unwrap();
    }
}

#[test]
fn test_three_flights_evict_oldest() {
    let nand = SimNand::new(Geometry::small(64));
    let mut files = manager(&nand, &settings(3));
    for key in 0..3 {
        plant(&mut files, FlightKey::Suffix(key));
    }

    assert_eq!(files.open_flight().unwrap(), FlightKey::Suffix(3));
    files.close().unwrap();
    assert_eq!(suffixes(&files.list_flights().unwrap()), vec![1, 2, 3]);

    // Every stream of the evicted flight is gone.
    for stream in Stream::ALL {
        let path = files.path_of(stream, FlightKey::Suffix(0));
        assert!(files.read_file(&path).is_err(), "{} survived", path);
    }
}

#[test]
fn test_flights_survive_reboot_and_continue_numbering() {
    let nand = SimNand::new(Geometry::small(64));
    let mut files = manager(&nand, &settings(4));
    files.open_flight().unwrap();
    files.write(Stream::Sensor, b"boost").unwrap();
    files.open_flight().unwrap();
    files.write(Stream::Sensor, b"coast").unwrap();
    files.unmount().unwrap();
    drop(files);

    let mut files = manager(&nand, &settings(4));
    assert_eq!(suffixes(&files.list_flights().unwrap()), vec![0, 1]);
    let sensor = files.read_file(&files.path_of(Stream::Sensor, FlightKey::Suffix(1))).unwrap();
    assert_eq!(&sensor[HEADER_LEN..], b"coast");

    assert_eq!(files.open_flight().unwrap(), FlightKey::Suffix(2));
}

#[test]
fn test_rollover_past_ninety_nine() {
    let nand = SimNand::new(Geometry::small(64));
    let mut files = manager(&nand, &settings(3));
    plant(&mut files, FlightKey::Suffix(98));
    plant(&mut files, FlightKey::Suffix(99));

    assert_eq!(files.open_flight().unwrap(), FlightKey::Suffix(0));
    assert_eq!(files.open_flight().unwrap(), FlightKey::Suffix(1));
    files.close().unwrap();

    // 98 was the oldest once the ring wrapped.
    assert_eq!(suffixes(&files.list_flights().unwrap()), vec![0, 1, 99]);
    assert_eq!(files.open_flight().unwrap(), FlightKey::Suffix(2));
    files.close().unwrap();
    assert_eq!(suffixes(&files.list_flights().unwrap()), vec![0, 1, 2]);
}

#[test]
fn test_gap_in_numbering_counts_against_retention() {
    let nand = SimNand::new(Geometry::small(64));
    let mut files = manager(&nand, &settings(3));
    plant(&mut files, FlightKey::Suffix(5));
    plant(&mut files, FlightKey::Suffix(9));

    assert_eq!(files.open_flight().unwrap(), FlightKey::Suffix(10));
    files.close().unwrap();
    assert_eq!(suffixes(&files.list_flights().unwrap()), vec![9, 10]);
}

#[test]
fn test_long_campaign_stays_bounded() {
    let nand = SimNand::new(Geometry::small(64));
    let mut files = manager(&nand, &settings(2));
    let free_before = files.space().unwrap().free_bytes;

    let mut last = None;
    for i in 0..120u32 {
        let key = files.open_flight().unwrap();
        files.write(Stream::Sensor, &[i as u8; 300]).unwrap();
        files.write(Stream::Gps, &[i as u8; 40]).unwrap();
        files.flush().unwrap();
        assert_eq!(key, FlightKey::Suffix((i % 100) as u8));
        assert!(files.list_flights().unwrap().len() <= 2);
        last = Some(key);
    }
    files.close().unwrap();

    assert_eq!(files.list_flights().unwrap().len(), 2);
    assert_eq!(last, Some(FlightKey::Suffix(19)));
    let used = free_before - files.space().unwrap().free_bytes;
    assert!(used < 16 * 1024, "{} bytes still in use", used);
}

#[test]
fn test_dated_flights_per_stream_directories() {
    let nand = SimNand::new(Geometry::small(64));
    let settings = StorageSettings {
        retain_flights: 2,
        rotation: RotationScheme::DateSequence,
        layout: Layout::PerStream,
        data_dir: "/".into(),
        ..StorageSettings::default()
    };
    let mut files = manager(&nand, &settings);
    files.set_date_source(|| NaiveDate::from_ymd_opt(2024, 6, 1).unwrap());
    files.open_flight().unwrap();
    files.open_flight().unwrap();

    files.set_date_source(|| NaiveDate::from_ymd_opt(2024, 6, 2).unwrap());
    let key = files.open_flight().unwrap();
    files.close().unwrap();

    assert_eq!(key.to_string(), "2024-06-02-1");
    let listed: Vec<String> = files
        .list_flights()
        .unwrap()
        .iter()
        .map(|k| k.to_string())
        .collect();
    assert_eq!(listed, vec!["2024-06-01-2", "2024-06-02-1"]);
    assert!(files.read_file("/gps/gps_2024-06-02-1.pb3").is_ok());
    assert!(files.read_file("/sensor/dat_2024-06-01-1.pb3").is_err());
}
