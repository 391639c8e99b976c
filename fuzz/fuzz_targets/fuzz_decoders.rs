#![no_main]
use flight_storage::config::BoardConfig;
use flight_storage::fs::meta::decode_slot_header;
use flight_storage::fs::Superblock;
use flight_storage::ftl::PageTag;
use flight_storage::writer::frame::{decode_varint, FrameReader};
use libfuzzer_sys::fuzz_target;

// On-media decoders must reject garbage without panicking.
fuzz_target!(|data: &[u8]| {
    if let Ok(sb) = Superblock::from_bytes(data) {
        let _ = sb.validate();
        let _ = sb.label();
        let _ = Superblock::from_bytes(&sb.to_bytes());
    }

    let _ = decode_slot_header(data);
    let _ = PageTag::from_bytes(data);

    if let Ok(config) = BoardConfig::from_bytes(data) {
        let _ = config.is_valid();
        assert_eq!(config.to_bytes().len(), data.len());
    }

    let _ = decode_varint(data);
    let mut reader = FrameReader::new(data);
    let consumed: usize = reader.by_ref().map(|f| f.len()).sum();
    assert!(consumed + reader.remainder().len() <= data.len());
});
