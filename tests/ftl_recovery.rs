//! Translation layer recovery tests
//!
//! Power loss, bad blocks and stalled operations, each followed by a remount
//! of the same simulated chip.

use flight_storage::ftl::{BlockState, Ftl};
use flight_storage::{ErrorKind, Geometry, SimNand, StorageError};

const PAGE: usize = 512;

fn page(logical: u32, version: u8) -> Vec<u8> {
    (0..PAGE)
        .map(|i| (i as u32).wrapping_mul(31).wrapping_add(logical * 7 + version as u32) as u8)
        .collect()
}

fn read(ftl: &mut Ftl<SimNand>, logical: u32) -> Vec<u8> {
    let mut buf = vec![0u8; PAGE];
    ftl.read(logical, &mut buf).unwrap();
    buf
}

#[test]
fn test_torn_write_keeps_previous_version() {
    let nand = SimNand::new(Geometry::small(32));
    let mut ftl = Ftl::mount(nand.clone()).unwrap();
    for logical in 0..10 {
        ftl.write(logical, &page(logical, 0)).unwrap();
    }

    // Three rewrites land, the fourth is torn by the power cut.
    nand.cut_power_after(3);
    for logical in 0..10 {
        if ftl.write(logical, &page(logical, 1)).is_err() {
            break;
        }
    }
    drop(ftl);
    nand.restore_power();

    let mut ftl = Ftl::mount(nand.clone()).unwrap();
    for logical in 0..3 {
        assert_eq!(read(&mut ftl, logical), page(logical, 1), "page {}", logical);
    }
    for logical in 3..10 {
        assert_eq!(read(&mut ftl, logical), page(logical, 0), "page {}", logical);
    }

    // The torn page is skipped, not reused.
    ftl.write(3, &page(3, 2)).unwrap();
    assert_eq!(read(&mut ftl, 3), page(3, 2));
}

#[test]
fn test_power_cut_during_trim_is_all_or_nothing() {
    let nand = SimNand::new(Geometry::small(32));
    let mut ftl = Ftl::mount(nand.clone()).unwrap();
    for logical in 0..4 {
        ftl.write(logical, &page(logical, 0)).unwrap();
    }

    nand.cut_power_after(0);
    assert!(ftl.trim(0..4).is_err());
    drop(ftl);
    nand.restore_power();

    let mut ftl = Ftl::mount(nand).unwrap();
    for logical in 0..4 {
        assert_eq!(read(&mut ftl, logical), page(logical, 0));
    }
}

#[test]
fn test_repeated_reboots_under_churn() {
    let nand = SimNand::new(Geometry::small(16));
    let mut latest = vec![None; 24];

    for boot in 0..6u8 {
        let mut ftl = Ftl::mount(nand.clone()).unwrap();
        for (logical, expected) in latest.iter().enumerate() {
            if let Some(version) = expected {
                assert_eq!(read(&mut ftl, logical as u32), page(logical as u32, *version));
            }
        }
        for round in 0..20u8 {
            for logical in 0..24u32 {
                let version = boot.wrapping_mul(20).wrapping_add(round);
                ftl.write(logical, &page(logical, version)).unwrap();
                latest[logical as usize] = Some(version);
            }
        }
        ftl.sync().unwrap();
    }

    let ftl = Ftl::mount(nand).unwrap();
    assert_eq!(ftl.mapped_pages(), 24);
}

#[test]
fn test_bad_block_is_permanent_across_replay() {
    let nand = SimNand::new(Geometry::small(32));
    let mut ftl = Ftl::mount(nand.clone()).unwrap();
    ftl.write(0, &page(0, 0)).unwrap();
    let block = ftl.geometry().block_of(ftl.recent_remaps()[0].physical);

    nand.fail_program(block);
    let err = ftl.write(1, &page(1, 0)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BadBlock);
    ftl.write(1, &page(1, 0)).unwrap();
    drop(ftl);

    // The marker stays even once the chip stops failing.
    nand.clear_faults();
    let mut ftl = Ftl::mount(nand.clone()).unwrap();
    assert_eq!(ftl.bad_blocks(), vec![block]);
    assert_eq!(ftl.block_info(block).unwrap().state, BlockState::Bad);
    assert_eq!(read(&mut ftl, 0), page(0, 0));
    assert_eq!(read(&mut ftl, 1), page(1, 0));

    for round in 0..30u8 {
        for logical in 0..40 {
            ftl.write(logical, &page(logical, round)).unwrap();
            let physical = ftl.recent_remaps().last().unwrap().physical;
            assert_ne!(ftl.geometry().block_of(physical), block);
        }
    }
}

#[test]
fn test_erase_failure_retires_block() {
    let nand = SimNand::new(Geometry::small(16));
    let mut ftl = Ftl::mount(nand.clone()).unwrap();
    ftl.write(0, &page(0, 0)).unwrap();
    let block = ftl.geometry().block_of(ftl.recent_remaps()[0].physical);
    nand.fail_erase(block);

    // Enough churn that garbage collection must reclaim the first block.
    for round in 0..40u8 {
        for logical in 0..16 {
            ftl.write(logical, &page(logical, round)).unwrap();
        }
    }
    assert!(ftl.bad_blocks().contains(&block));
    assert!(ftl.stats().retired_blocks >= 1);
    for logical in 0..16 {
        assert_eq!(read(&mut ftl, logical), page(logical, 39));
    }

    drop(ftl);
    nand.clear_faults();
    let ftl = Ftl::mount(nand).unwrap();
    assert!(ftl.bad_blocks().contains(&block));
}

#[test]
fn test_capacity_is_fixed_by_geometry() {
    let nand = SimNand::new(Geometry::small(32));
    let ftl = Ftl::mount(nand.clone()).unwrap();
    let capacity = ftl.capacity();
    assert_eq!(capacity, 432);
    drop(ftl);

    // Retired blocks come out of the allowance, not the exported space.
    let mut ftl = Ftl::mount(nand.clone()).unwrap();
    ftl.write(0, &page(0, 0)).unwrap();
    let block = ftl.geometry().block_of(ftl.recent_remaps()[0].physical);
    nand.fail_program(block);
    let _ = ftl.write(1, &page(1, 0));
    drop(ftl);
    assert_eq!(Ftl::mount(nand).unwrap().capacity(), capacity);
}

#[test]
fn test_stalled_chip_times_out() {
    let nand = SimNand::new(Geometry::small(16));
    let mut ftl = Ftl::mount(nand.clone()).unwrap();
    ftl.write(0, &page(0, 0)).unwrap();

    nand.stall(1);
    let mut buf = vec![0u8; PAGE];
    let err = ftl.read(0, &mut buf).unwrap_err();
    assert!(matches!(err, StorageError::Timeout(_)));
    assert_eq!(err.kind(), ErrorKind::Hardware);
    assert!(!err.is_recoverable());

    ftl.read(0, &mut buf).unwrap();
    assert_eq!(buf, page(0, 0));
}
