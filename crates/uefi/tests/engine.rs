//! End-to-end engine checks over synthetic images built in memory.

use vulcan_core::checksum;
use vulcan_core::prelude::*;
use vulcan_eficomp::prelude::*;
use vulcan_uefi::ffs;
use vulcan_uefi::prelude::*;

const VOLUME_HEADER_LEN: usize = ffs::VOLUME_HEADER_SIZE + 2 * ffs::BLOCK_MAP_ENTRY_SIZE;
const VOLUME_ATTRIBUTES: u32 = 0x0004_FEFF;

fn align_to(data: &mut Vec<u8>, alignment: usize, fill: u8) {
    while data.len() % alignment != 0 {
        data.push(fill);
    }
}

/// Builds a leaf section with the common 4-byte header.
fn build_section(section_type: u8, body: &[u8]) -> Vec<u8> {
    let mut section = Vec::with_capacity(4 + body.len());
    section.extend_from_slice(&ffs::u32_to_uint24((4 + body.len()) as u32));
    section.push(section_type);
    section.extend_from_slice(body);
    section
}

/// Builds a compression section wrapping already-assembled inner sections.
fn build_compression_section(inner: &[u8]) -> Vec<u8> {
    let compressed = tiano::compress_from(inner, Variant::Tiano, Strategy::Legacy).unwrap();
    let mut section = Vec::with_capacity(9 + compressed.len());
    section.extend_from_slice(&ffs::u32_to_uint24((9 + compressed.len()) as u32));
    section.push(ffs::SECTION_COMPRESSION);
    section.extend_from_slice(&(inner.len() as u32).to_le_bytes());
    section.push(ffs::EFI_STANDARD_COMPRESSION);
    section.extend_from_slice(&compressed);
    section
}

/// Builds an FFSv2 file from its sections, with valid checksums and state.
fn build_file(guid: Guid, file_type: u8, sections: &[&[u8]]) -> Vec<u8> {
    let mut body = Vec::new();
    for (at, section) in sections.iter().enumerate() {
        if at != 0 {
            align_to(&mut body, 4, 0x00);
        }
        body.extend_from_slice(section);
    }

    let mut header = vec![0u8; ffs::FFS_FILE_HEADER_SIZE];
    header[..16].copy_from_slice(guid.as_bytes());
    header[18] = file_type;
    header[19] = 0x00; // attributes
    header[ffs::FFS_SIZE_OFFSET..ffs::FFS_SIZE_OFFSET + 3]
        .copy_from_slice(&ffs::u32_to_uint24((ffs::FFS_FILE_HEADER_SIZE + body.len()) as u32));
    header[ffs::FFS_STATE_OFFSET] = 0xF8; // !(CONSTRUCTION | HEADER_VALID | DATA_VALID)

    let header_checksum = 0u8.wrapping_sub(
        checksum::sum8(&header).wrapping_sub(header[ffs::FFS_STATE_OFFSET]),
    );
    header[ffs::FFS_INTEGRITY_OFFSET] = header_checksum;
    header[ffs::FFS_INTEGRITY_OFFSET + 1] = ffs::FFS_FIXED_CHECKSUM2;

    let mut file = header;
    file.extend_from_slice(&body);
    file
}

/// Builds an FFSv2 volume of `total_size` bytes holding the given files.
fn build_volume(files: &[&[u8]], total_size: usize) -> Vec<u8> {
    assert_eq!(total_size % 0x1000, 0);

    let mut volume = vec![0u8; VOLUME_HEADER_LEN];
    volume[16..32].copy_from_slice(ffs::EFI_FIRMWARE_FILE_SYSTEM2_GUID.as_bytes());
    volume[32..40].copy_from_slice(&(total_size as u64).to_le_bytes());
    volume[40..44].copy_from_slice(&ffs::FV_SIGNATURE);
    volume[44..48].copy_from_slice(&VOLUME_ATTRIBUTES.to_le_bytes());
    volume[48..50].copy_from_slice(&(VOLUME_HEADER_LEN as u16).to_le_bytes());
    volume[55] = 2; // revision
    // Block map: N blocks of 0x1000, terminated
    volume[56..60].copy_from_slice(&((total_size / 0x1000) as u32).to_le_bytes());
    volume[60..64].copy_from_slice(&0x1000u32.to_le_bytes());

    let header_checksum = checksum::checksum16(&volume[..VOLUME_HEADER_LEN]);
    volume[ffs::VOLUME_CHECKSUM_OFFSET..ffs::VOLUME_CHECKSUM_OFFSET + 2]
        .copy_from_slice(&header_checksum.to_le_bytes());

    for file in files {
        align_to(&mut volume, 8, 0xFF);
        volume.extend_from_slice(file);
    }
    volume.resize(total_size, 0xFF);
    volume
}

fn guid_a() -> Guid {
    "11111111-2222-3333-4455-66778899AABB".parse().unwrap()
}

fn guid_b() -> Guid {
    "AAAAAAAA-BBBB-CCCC-DDEE-FF0011223344".parse().unwrap()
}

fn guid_c() -> Guid {
    "C0C0C0C0-D1D1-E2E2-F3F3-A4A4A4A4A4A4".parse().unwrap()
}

/// A volume with three plain files, as a standalone BIOS image.
fn three_file_image() -> Vec<u8> {
    let file_a = build_file(guid_a(), ffs::FILETYPE_FREEFORM, &[&build_section(
        ffs::SECTION_RAW,
        b"first payload",
    )]);
    let ui: Vec<u8> = "FileB\0".encode_utf16().flat_map(|unit| unit.to_le_bytes()).collect();
    let file_b = build_file(guid_b(), ffs::FILETYPE_FREEFORM, &[
        &build_section(ffs::SECTION_RAW, b"second payload with some more bytes"),
        &build_section(ffs::SECTION_USER_INTERFACE, &ui),
    ]);
    let file_c = build_file(guid_c(), ffs::FILETYPE_FREEFORM, &[&build_section(
        ffs::SECTION_RAW,
        b"third",
    )]);
    build_volume(&[&file_a, &file_b, &file_c], 0x2000)
}

fn find_file(engine: &FfsEngine, guid: Guid) -> Option<NodeId> {
    let model = engine.tree_model();
    let mut pending = vec![model.root()];
    while let Some(index) = pending.pop() {
        if model.item_type(index) == ItemType::File
            && Guid::from_slice(model.header(index)) == Some(guid)
        {
            return Some(index);
        }
        pending.extend_from_slice(model.children(index));
    }
    None
}

fn first_of_type(engine: &FfsEngine, item_type: ItemType) -> Option<NodeId> {
    let model = engine.tree_model();
    let mut pending = vec![model.root()];
    while let Some(index) = pending.pop() {
        if model.item_type(index) == item_type {
            return Some(index);
        }
        let mut children = model.children(index).to_vec();
        children.reverse();
        pending.extend_from_slice(&children);
    }
    None
}

#[test]
fn round_trip_identity() {
    let image = three_file_image();
    let mut engine = FfsEngine::new();
    engine.parse_image_file(&image).unwrap();

    // The expected layout is there
    let model = engine.tree_model();
    let volume = first_of_type(&engine, ItemType::Volume).unwrap();
    assert_eq!(model.subtype(volume), Subtype::Volume(VolumeSubtype::Ffs2));
    let files: Vec<NodeId> = model
        .children(volume)
        .iter()
        .copied()
        .filter(|&child| model.item_type(child) == ItemType::File)
        .collect();
    assert_eq!(files.len(), 3);
    // The user interface section renamed its file
    assert_eq!(model.text(files[1]), "FileB");
    // Trailing free space is represented
    assert!(model
        .children(volume)
        .iter()
        .any(|&child| model.item_type(child) == ItemType::FreeSpace));

    // No checksum complaints on a well-formed image
    assert!(!engine
        .messages()
        .iter()
        .any(|message| message.text.contains("checksum")));

    let reconstructed = engine.reconstruct_image_file().unwrap();
    assert_eq!(reconstructed, image);
}

#[test]
fn rebuild_is_identity_on_untouched_tree() {
    let image = three_file_image();
    let mut engine = FfsEngine::new();
    engine.parse_image_file(&image).unwrap();

    let volume = first_of_type(&engine, ItemType::Volume).unwrap();
    engine.rebuild(volume).unwrap();
    let reconstructed = engine.reconstruct_image_file().unwrap();
    assert_eq!(reconstructed, image);

    // Checksum invariants hold on the rebuilt volume
    let mut reparsed = FfsEngine::new();
    reparsed.parse_image_file(&reconstructed).unwrap();
    let model = reparsed.tree_model();
    let volume = first_of_type(&reparsed, ItemType::Volume).unwrap();
    assert_eq!(checksum::checksum16(model.header(volume)), 0);
}

#[test]
fn removal_idempotence() {
    let image = three_file_image();
    let mut engine = FfsEngine::new();
    engine.parse_image_file(&image).unwrap();

    let victim = find_file(&engine, guid_b()).unwrap();
    engine.remove(victim).unwrap();
    let reconstructed = engine.reconstruct_image_file().unwrap();
    assert_eq!(reconstructed.len(), image.len());

    let mut reparsed = FfsEngine::new();
    reparsed.parse_image_file(&reconstructed).unwrap();
    assert!(find_file(&reparsed, guid_b()).is_none());
    assert!(find_file(&reparsed, guid_a()).is_some());
    assert!(find_file(&reparsed, guid_c()).is_some());
}

#[test]
fn insert_round_trip() {
    let image = three_file_image();
    let mut engine = FfsEngine::new();
    engine.parse_image_file(&image).unwrap();

    let new_guid: Guid = "DEADBEEF-0123-4567-89AB-CDEF01234567".parse().unwrap();
    let object = build_file(new_guid, ffs::FILETYPE_FREEFORM, &[&build_section(
        ffs::SECTION_RAW,
        b"inserted payload",
    )]);

    let anchor = find_file(&engine, guid_a()).unwrap();
    let inserted = engine.insert(anchor, &object, InsertMode::After).unwrap();

    // The inserted object extracts back unchanged
    let extracted = engine.extract(inserted, ExtractMode::AsIs).unwrap();
    assert_eq!(extracted, object);

    let reconstructed = engine.reconstruct_image_file().unwrap();
    assert_eq!(reconstructed.len(), image.len());
    let mut reparsed = FfsEngine::new();
    reparsed.parse_image_file(&reconstructed).unwrap();
    let found = find_file(&reparsed, new_guid).unwrap();
    // Inserted right after its anchor
    let model = reparsed.tree_model();
    let anchor_row = model.row(find_file(&reparsed, guid_a()).unwrap());
    assert_eq!(model.row(found), anchor_row + 1);
}

#[test]
fn compressed_section_round_trip() {
    // A file whose sections hide behind Tiano compression
    let inner = build_section(ffs::SECTION_RAW, b"compressed inner payload, repeated repeated");
    let compression = build_compression_section(&inner);
    let file = build_file(guid_a(), ffs::FILETYPE_FREEFORM, &[&compression]);
    let image = build_volume(&[&file], 0x2000);

    let mut engine = FfsEngine::new();
    engine.parse_image_file(&image).unwrap();

    // The inner raw section was reached through the encapsulation
    let model = engine.tree_model();
    let file_index = find_file(&engine, guid_a()).unwrap();
    let section = model.children(file_index)[0];
    assert_eq!(model.subtype(section), Subtype::Section(ffs::SECTION_COMPRESSION));
    assert_eq!(model.compression(section), Compression::Tiano);
    assert_eq!(model.child_count(section), 1);

    // Untouched, the image reproduces exactly
    let reconstructed = engine.reconstruct_image_file().unwrap();
    assert_eq!(reconstructed, image);

    // Rebuilding the encapsulation decompresses, reassembles and recompresses; with the same
    // payload and encoder the bytes come out identical
    engine.rebuild(section).unwrap();
    let rebuilt = engine.reconstruct_image_file().unwrap();
    assert_eq!(rebuilt, image);

    let mut reparsed = FfsEngine::new();
    reparsed.parse_image_file(&rebuilt).unwrap();
    let model = reparsed.tree_model();
    let file_index = find_file(&reparsed, guid_a()).unwrap();
    let section = model.children(file_index)[0];
    assert_eq!(model.compression(section), Compression::Tiano);
    assert_eq!(model.child_count(section), 1);
}

#[test]
fn wrong_volume_checksum_warns_and_rebuild_corrects() {
    let mut image = three_file_image();
    // Corrupt the stored header checksum
    image[ffs::VOLUME_CHECKSUM_OFFSET] ^= 0x5A;

    let mut engine = FfsEngine::new();
    engine.parse_image_file(&image).unwrap();
    assert!(engine
        .messages()
        .iter()
        .any(|message| message.text.contains("volume header checksum is invalid")));

    // Untouched reconstruction keeps the wrong bytes
    let reconstructed = engine.reconstruct_image_file().unwrap();
    assert_eq!(reconstructed, image);

    // A rebuild emits corrected bytes
    let volume = first_of_type(&engine, ItemType::Volume).unwrap();
    engine.rebuild(volume).unwrap();
    let corrected = engine.reconstruct_image_file().unwrap();
    assert_ne!(corrected, image);
    assert_eq!(checksum::checksum16(&corrected[..VOLUME_HEADER_LEN]), 0);
}

//------------------------------------------------------------------------------
// Intel image tests
//------------------------------------------------------------------------------

/// Builds a flash descriptor declaring a BIOS region ending at 4 KiB block `bios_limit`.
fn build_descriptor(bios_limit: u16) -> Vec<u8> {
    let mut descriptor = vec![0u8; 0x1000];
    for byte in descriptor.iter_mut().take(16) {
        *byte = 0xFF;
    }
    descriptor[16..20].copy_from_slice(&0x0FF0_A55Au32.to_le_bytes());

    // FLMAP0: component base 0x03, one region, region base 0x04
    descriptor[20..24].copy_from_slice(&0x0104_0003u32.to_le_bytes());
    // FLMAP1: master base 0x06
    descriptor[24..28].copy_from_slice(&0x0000_0006u32.to_le_bytes());

    // Component section at 0x30: 20 MHz read clock marks a v1 descriptor
    descriptor[0x30..0x34].copy_from_slice(&0u32.to_le_bytes());

    // Region section at 0x40: descriptor region, then BIOS at 0x1000
    descriptor[0x40..0x42].copy_from_slice(&0u16.to_le_bytes());
    descriptor[0x42..0x44].copy_from_slice(&0u16.to_le_bytes());
    descriptor[0x44..0x46].copy_from_slice(&1u16.to_le_bytes()); // BIOS base
    descriptor[0x46..0x48].copy_from_slice(&bios_limit.to_le_bytes()); // BIOS limit

    descriptor
}

fn intel_image() -> Vec<u8> {
    let mut image = build_descriptor(2);
    let volume = three_file_image();
    image.extend_from_slice(&volume);
    image
}

#[test]
fn intel_image_round_trip() {
    let image = intel_image();
    let mut engine = FfsEngine::new();
    engine.parse_image_file(&image).unwrap();

    let model = engine.tree_model();
    let intel = first_of_type(&engine, ItemType::Image).unwrap();
    assert_eq!(model.subtype(intel), Subtype::Image(ImageSubtype::Intel));
    let regions: Vec<Subtype> =
        model.children(intel).iter().map(|&child| model.subtype(child)).collect();
    assert_eq!(
        regions,
        vec![
            Subtype::Region(RegionSubtype::Descriptor),
            Subtype::Region(RegionSubtype::Bios)
        ]
    );

    let reconstructed = engine.reconstruct_image_file().unwrap();
    assert_eq!(reconstructed, image);
}

#[test]
fn intel_image_remove_file_round_trip() {
    let image = intel_image();
    let mut engine = FfsEngine::new();
    engine.parse_image_file(&image).unwrap();

    let victim = find_file(&engine, guid_b()).unwrap();
    engine.remove(victim).unwrap();
    let reconstructed = engine.reconstruct_image_file().unwrap();
    assert_eq!(reconstructed.len(), image.len());

    let mut reparsed = FfsEngine::new();
    reparsed.parse_image_file(&reconstructed).unwrap();
    assert!(find_file(&reparsed, guid_b()).is_none());
    assert!(find_file(&reparsed, guid_a()).is_some());
}

#[test]
fn truncated_intel_image_reports() {
    // The BIOS region is declared to end two blocks past the end of the image (one block
    // past would make it span exactly the image size, which reads as the Gigabyte-specific
    // descriptor instead)
    let mut image = build_descriptor(4);
    image.extend_from_slice(&three_file_image());
    assert_eq!(image.len(), 0x3000);

    let mut engine = FfsEngine::new();
    let result = engine.parse_image_file(&image);
    assert_eq!(result, Err(ErrorKind::TruncatedImage));
    assert!(engine
        .messages()
        .iter()
        .any(|message| message.text.contains("smaller than the end of last region")));
}

//------------------------------------------------------------------------------
// Search tests
//------------------------------------------------------------------------------

#[test]
fn search_finds_patterns() {
    let image = three_file_image();
    let mut engine = FfsEngine::new();
    engine.parse_image_file(&image).unwrap();
    let root_child = engine.tree_model().children(engine.tree_model().root())[0];

    engine.clear_messages();
    engine.find_text_pattern(root_child, "second payload", false, true).unwrap();
    assert_eq!(engine.messages().len(), 1);

    engine.clear_messages();
    engine.find_text_pattern(root_child, "FileB", true, true).unwrap();
    assert!(!engine.messages().is_empty());

    engine.clear_messages();
    engine.find_guid_pattern(root_child, &guid_a().to_string(), SearchScope::Header).unwrap();
    assert!(!engine.messages().is_empty());

    engine.clear_messages();
    // "first" in hex with a wildcard nibble
    engine.find_hex_pattern(root_child, "66697.7374", SearchScope::Body).unwrap();
    assert!(!engine.messages().is_empty());

    engine.clear_messages();
    assert_eq!(
        engine.find_hex_pattern(root_child, "zz", SearchScope::All),
        Err(ErrorKind::InvalidParameter)
    );
}

//------------------------------------------------------------------------------
// Dump tests
//------------------------------------------------------------------------------

#[test]
fn dump_writes_expected_layout() {
    let image = three_file_image();
    let mut engine = FfsEngine::new();
    engine.parse_image_file(&image).unwrap();
    let root_child = engine.tree_model().children(engine.tree_model().root())[0];

    let target = std::env::temp_dir().join(format!("vulcan-dump-test-{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&target);

    engine.dump(root_child, &target, None).unwrap();
    assert!(target.join("info.txt").exists());
    assert!(target.join("body.bin").exists());

    // The volume directory is the first child
    let volume_dir = std::fs::read_dir(&target)
        .unwrap()
        .filter_map(Result::ok)
        .find(|entry| entry.path().is_dir())
        .unwrap();
    assert!(volume_dir.path().join("header.bin").exists());

    let info = std::fs::read_to_string(target.join("info.txt")).unwrap();
    assert!(info.starts_with("Type: Image\n"));

    std::fs::remove_dir_all(&target).unwrap();
}

#[test]
fn dump_with_guid_filter() {
    let image = three_file_image();
    let mut engine = FfsEngine::new();
    engine.parse_image_file(&image).unwrap();
    let root_child = engine.tree_model().children(engine.tree_model().root())[0];

    let target = std::env::temp_dir().join(format!("vulcan-dump-guid-{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&target);

    engine.dump(root_child, &target, Some(&guid_b().to_string())).unwrap();
    // Only the matching file's subtree was written, so the root has no info.txt
    assert!(!target.join("info.txt").exists());

    let unknown = engine.dump(
        root_child,
        &target.join("second"),
        Some("00000000-0000-0000-0000-000000000000"),
    );
    assert_eq!(unknown, Err(ErrorKind::ItemNotFound));

    let _ = std::fs::remove_dir_all(&target);
}
