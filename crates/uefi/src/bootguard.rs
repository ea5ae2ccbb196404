//! Intel Boot Guard Key Manifest and Boot Policy Manifest layouts.
//!
//! The engine does not validate these signatures; the manifests are recognised by their tags so
//! padding that carries them can be labelled instead of showing up as anonymous non-UEFI data.

use vulcan_core::prelude::*;

type Result<T> = core::result::Result<T, vulcan_core::prelude::data::Error>;

/// "__KEYM__"
pub const KEY_MANIFEST_TAG: [u8; 8] = *b"__KEYM__";
/// "__ACBP__"
pub const BOOT_POLICY_MANIFEST_TAG: [u8; 8] = *b"__ACBP__";
/// "__IBBS__"
pub const IBB_ELEMENT_TAG: [u8; 8] = *b"__IBBS__";
/// "__PMDA__"
pub const PLATFORM_MANUFACTURER_ELEMENT_TAG: [u8; 8] = *b"__PMDA__";
/// "__PMSG__"
pub const SIGNATURE_ELEMENT_TAG: [u8; 8] = *b"__PMSG__";

/// BG_KEY_MANIFEST, up to the boot policy key hash.
#[derive(Debug, Clone, Copy)]
pub struct KeyManifest {
    pub version: u8,
    pub km_version: u8,
    pub km_svn: u8,
    pub km_id: u8,
}

impl KeyManifest {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut cursor = DataCursorRef::new(data);
        let _tag = cursor.get_slice(8)?;
        Ok(Self {
            version: cursor.read_u8()?,
            km_version: cursor.read_u8()?,
            km_svn: cursor.read_u8()?,
            km_id: cursor.read_u8()?,
        })
    }
}

/// BG_BOOT_POLICY_MANIFEST_HEADER
#[derive(Debug, Clone, Copy)]
pub struct BootPolicyManifestHeader {
    pub version: u8,
    pub header_version: u8,
    pub pmbpm_version: u8,
    pub bp_svn: u8,
    pub acm_svn: u8,
    pub nem_data_size: u16,
}

impl BootPolicyManifestHeader {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut cursor = DataCursorRef::new(data);
        let _tag = cursor.get_slice(8)?;
        let version = cursor.read_u8()?;
        let header_version = cursor.read_u8()?;
        let pmbpm_version = cursor.read_u8()?;
        let bp_svn = cursor.read_u8()?;
        let acm_svn = cursor.read_u8()?;
        let _reserved = cursor.read_u8()?;
        Ok(Self {
            version,
            header_version,
            pmbpm_version,
            bp_svn,
            acm_svn,
            nem_data_size: cursor.read_u16()?,
        })
    }
}

/// Scans a blob for a Boot Guard manifest tag and describes the find.
#[must_use]
pub fn describe(data: &[u8]) -> Option<String> {
    if let Some(offset) = find_tag(data, &KEY_MANIFEST_TAG) {
        let manifest = KeyManifest::parse(&data[offset..]).ok()?;
        return Some(format!(
            "Intel BootGuard key manifest at offset {:X}h, version {}, KM version {}, KM SVN {}",
            offset, manifest.version, manifest.km_version, manifest.km_svn
        ));
    }
    if let Some(offset) = find_tag(data, &BOOT_POLICY_MANIFEST_TAG) {
        let manifest = BootPolicyManifestHeader::parse(&data[offset..]).ok()?;
        return Some(format!(
            "Intel BootGuard boot policy manifest at offset {:X}h, version {}, BP SVN {}, ACM SVN {}",
            offset, manifest.version, manifest.bp_svn, manifest.acm_svn
        ));
    }
    None
}

fn find_tag(data: &[u8], tag: &[u8; 8]) -> Option<usize> {
    data.windows(8).position(|window| window == tag)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognises_key_manifest() {
        let mut data = vec![0u8; 64];
        data[16..24].copy_from_slice(&KEY_MANIFEST_TAG);
        data[24] = 0x10; // version
        data[25] = 0x01; // KM version
        let described = describe(&data).unwrap();
        assert!(described.contains("key manifest"));
        assert!(described.contains("offset 10h"));
    }

    #[test]
    fn ignores_plain_padding() {
        assert!(describe(&[0xFF; 64]).is_none());
    }
}
