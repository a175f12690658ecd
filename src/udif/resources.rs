//! The XML plist resource fork: `blkx`, `cSum`, `nsiz`, `plst` and `size`
//! resources, plus the scanner that reads them back.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use byteorder::{BigEndian, ByteOrder};

use crate::error::{DmgError, Result};
use crate::hfs::VolumeHeader;
use crate::udif::ATTRIBUTE_HDIUTIL;

const PLIST_HEADER: &str = "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<!DOCTYPE plist PUBLIC \"-//Apple Computer//DTD PLIST 1.0//EN\" \"http://www.apple.com/DTDs/PropertyList-1.0.dtd\">\n<plist version=\"1.0\">\n<dict>\n";
const PLIST_FOOTER: &str = "</dict>\n</plist>\n";

/// One resource datum: a typed blob with an ID and display name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceData {
    pub attributes: u32,
    pub id: i32,
    pub name: String,
    pub data: Vec<u8>,
}

/// The resource fork: an ordered map of resource type to datum list.
///
/// Key order and datum order are preserved, matching how the plist is
/// written out.
#[derive(Debug, Clone, Default)]
pub struct Resources {
    entries: Vec<(String, Vec<ResourceData>)>,
}

impl Resources {
    pub fn new() -> Self {
        Resources { entries: Vec::new() }
    }

    /// Append a datum under `key`, creating the key at the end of the list
    /// if it does not exist yet.
    pub fn insert(&mut self, key: &str, datum: ResourceData) {
        if let Some((_, data)) = self.entries.iter_mut().find(|(k, _)| k == key) {
            data.push(datum);
        } else {
            self.entries.push((key.to_owned(), vec![datum]));
        }
    }

    pub fn get(&self, key: &str) -> Option<&[ResourceData]> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, d)| d.as_slice())
    }

    pub fn get_data_by_id(&self, key: &str, id: i32) -> Option<&ResourceData> {
        self.get(key)?.iter().find(|d| d.id == id)
    }

    /// Serialize the whole fork as the XML plist the trailer points at.
    pub fn to_plist(&self) -> Vec<u8> {
        let mut out = String::new();
        out.push_str(PLIST_HEADER);
        out.push_str("\t<key>resource-fork</key>\n\t<dict>\n");
        for (key, data) in &self.entries {
            out.push_str(&format!("\t\t<key>{key}</key>\n\t\t<array>\n"));
            for datum in data {
                write_resource_data(&mut out, datum, 3);
            }
            out.push_str("\t\t</array>\n");
        }
        out.push_str("\t</dict>\n");
        out.push_str(PLIST_FOOTER);
        out.into_bytes()
    }

    /// Parse a plist produced by [`Resources::to_plist`] (or hdiutil).
    ///
    /// This is a tag scanner, not a general XML parser; it expects the
    /// resource-fork dict shape every UDIF writer emits.
    pub fn parse_plist(xml: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(xml)
            .map_err(|_| DmgError::Corrupt("resource plist is not UTF-8".into()))?;
        let mut resources = Resources::new();

        let mut pos = find_after(text, "<key>resource-fork</key>", 0)
            .ok_or_else(|| DmgError::Corrupt("plist has no resource-fork key".into()))?;
        pos = find_after(text, "<dict>", pos)
            .ok_or_else(|| DmgError::Corrupt("plist has no resource-fork dict".into()))?;

        while let Some(key_start) = find_after(text, "<key>", pos) {
            let key_end = text[key_start..]
                .find("</key>")
                .map(|i| key_start + i)
                .ok_or_else(|| DmgError::Corrupt("unterminated resource key".into()))?;
            let key = &text[key_start..key_end];

            let array_start = find_after(text, "<array>", key_end)
                .ok_or_else(|| DmgError::Corrupt(format!("resource {key} has no array")))?;
            let array_end = text[array_start..]
                .find("</array>")
                .map(|i| array_start + i)
                .ok_or_else(|| DmgError::Corrupt(format!("resource {key} array unterminated")))?;

            let mut body = &text[array_start..array_end];
            while let Some(dict_start) = body.find("<dict>") {
                let dict_end = body[dict_start..]
                    .find("</dict>")
                    .map(|i| dict_start + i)
                    .ok_or_else(|| DmgError::Corrupt(format!("resource {key} dict unterminated")))?;
                let dict = &body[dict_start + "<dict>".len()..dict_end];
                resources.insert(key, parse_resource_data(dict)?);
                body = &body[dict_end + "</dict>".len()..];
            }
            pos = array_end + "</array>".len();
        }
        Ok(resources)
    }
}

fn find_after(text: &str, needle: &str, from: usize) -> Option<usize> {
    text[from..].find(needle).map(|i| from + i + needle.len())
}

fn write_resource_data(out: &mut String, datum: &ResourceData, tab_length: usize) {
    let tabs = "\t".repeat(tab_length);
    out.push_str(&format!("{tabs}<dict>\n"));
    out.push_str(&format!(
        "{tabs}\t<key>Attributes</key>\n{tabs}\t<string>{:#06x}</string>\n",
        datum.attributes
    ));
    out.push_str(&format!("{tabs}\t<key>Data</key>\n{tabs}\t<data>\n"));
    write_base64(out, &datum.data, tab_length + 1, 43);
    out.push_str(&format!("{tabs}\t</data>\n"));
    out.push_str(&format!("{tabs}\t<key>ID</key>\n{tabs}\t<string>{}</string>\n", datum.id));
    out.push_str(&format!("{tabs}\t<key>Name</key>\n{tabs}\t<string>{}</string>\n", datum.name));
    out.push_str(&format!("{tabs}</dict>\n"));
}

fn write_base64(out: &mut String, data: &[u8], tab_length: usize, width: usize) {
    let tabs = "\t".repeat(tab_length);
    let encoded = BASE64.encode(data);
    let mut rest = encoded.as_str();
    while !rest.is_empty() {
        let line = rest.len().min(width);
        out.push_str(&tabs);
        out.push_str(&rest[..line]);
        out.push('\n');
        rest = &rest[line..];
    }
}

fn parse_resource_data(dict: &str) -> Result<ResourceData> {
    let attributes = match string_value(dict, "Attributes") {
        Some(text) => {
            let hex = text.trim().trim_start_matches("0x");
            u32::from_str_radix(hex, 16)
                .map_err(|_| DmgError::Corrupt(format!("bad Attributes value {text:?}")))?
        }
        None => 0,
    };
    let data = match tagged_value(dict, "Data", "<data>", "</data>") {
        Some(text) => {
            let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
            BASE64
                .decode(compact.as_bytes())
                .map_err(|e| DmgError::Corrupt(format!("bad base64 in Data: {e}")))?
        }
        None => Vec::new(),
    };
    let id = match string_value(dict, "ID") {
        Some(text) => text
            .trim()
            .parse::<i32>()
            .map_err(|_| DmgError::Corrupt(format!("bad ID value {text:?}")))?,
        None => 0,
    };
    let name = string_value(dict, "Name").unwrap_or_default().to_owned();
    Ok(ResourceData { attributes, id, name, data })
}

fn string_value<'a>(dict: &'a str, key: &str) -> Option<&'a str> {
    tagged_value(dict, key, "<string>", "</string>")
}

fn tagged_value<'a>(dict: &'a str, key: &str, open: &str, close: &str) -> Option<&'a str> {
    let after_key = find_after(dict, &format!("<key>{key}</key>"), 0)?;
    let start = find_after(dict, open, after_key)?;
    let end = dict[start..].find(close)? + start;
    Some(&dict[start..end])
}

/// `cSum` resource payload: a typed checksum for one partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CSumResource {
    pub version: u16,
    pub kind: u32,
    pub checksum: u32,
}

pub const CSUM_RESOURCE_SIZE: usize = 10;

impl CSumResource {
    pub fn new(checksum: u32) -> Self {
        CSumResource { version: 1, kind: crate::checksum::CHECKSUM_MKBLOCK, checksum }
    }

    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < CSUM_RESOURCE_SIZE {
            return Err(DmgError::ShortRead {
                wanted: CSUM_RESOURCE_SIZE,
                got: buf.len(),
            });
        }
        Ok(CSumResource {
            version: BigEndian::read_u16(&buf[0..]),
            kind: BigEndian::read_u32(&buf[2..]),
            checksum: BigEndian::read_u32(&buf[6..]),
        })
    }

    pub fn to_bytes(&self) -> [u8; CSUM_RESOURCE_SIZE] {
        let mut buf = [0u8; CSUM_RESOURCE_SIZE];
        BigEndian::write_u16(&mut buf[0..], self.version);
        BigEndian::write_u32(&mut buf[2..], self.kind);
        BigEndian::write_u32(&mut buf[6..], self.checksum);
        buf
    }
}

/// One `nsiz` entry: per-partition size info, stored as its own mini plist.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NSizResource {
    pub is_volume: bool,
    pub sha1_digest: Option<[u8; 20]>,
    pub block_checksum_2: u32,
    pub bytes: u64,
    pub modify_date: u32,
    pub partition_number: u32,
    pub version: u32,
    pub volume_signature: u16,
}

impl NSizResource {
    fn to_plist(&self) -> Vec<u8> {
        let mut out = String::new();
        out.push_str(PLIST_HEADER);
        if let Some(digest) = &self.sha1_digest {
            out.push_str("\t<key>SHA-1-digest</key>\n\t<data>\n");
            write_base64(&mut out, digest, 1, 42);
            out.push_str("\t</data>\n");
        }
        out.push_str(&format!(
            "\t<key>block-checksum-2</key>\n\t<integer>{}</integer>\n",
            self.block_checksum_2 as i32
        ));
        if self.is_volume {
            out.push_str(&format!("\t<key>bytes</key>\n\t<integer>{}</integer>\n", self.bytes));
            out.push_str(&format!("\t<key>date</key>\n\t<integer>{}</integer>\n", self.modify_date as i32));
        }
        out.push_str(&format!("\t<key>part-num</key>\n\t<integer>{}</integer>\n", self.partition_number));
        out.push_str(&format!("\t<key>version</key>\n\t<integer>{}</integer>\n", self.version));
        if self.is_volume {
            out.push_str(&format!(
                "\t<key>volume-signature</key>\n\t<integer>{}</integer>\n",
                self.volume_signature
            ));
        }
        out.push_str(PLIST_FOOTER);
        out.into_bytes()
    }

    fn parse(data: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(data)
            .map_err(|_| DmgError::Corrupt("nsiz resource is not UTF-8".into()))?;
        let mut nsiz = NSizResource::default();
        if let Some(digest_text) = tagged_value(text, "SHA-1-digest", "<data>", "</data>") {
            let compact: String = digest_text.chars().filter(|c| !c.is_whitespace()).collect();
            let raw = BASE64
                .decode(compact.as_bytes())
                .map_err(|e| DmgError::Corrupt(format!("bad base64 SHA-1-digest: {e}")))?;
            if raw.len() != 20 {
                return Err(DmgError::Corrupt(format!("SHA-1-digest is {} bytes", raw.len())));
            }
            let mut digest = [0u8; 20];
            digest.copy_from_slice(&raw);
            nsiz.sha1_digest = Some(digest);
        }
        nsiz.block_checksum_2 = integer_value(text, "block-checksum-2")? as u32;
        nsiz.bytes = integer_value(text, "bytes").unwrap_or(0) as u64;
        nsiz.modify_date = integer_value(text, "date").unwrap_or(0) as u32;
        nsiz.partition_number = integer_value(text, "part-num")? as u32;
        nsiz.version = integer_value(text, "version")? as u32;
        if let Ok(sig) = integer_value(text, "volume-signature") {
            nsiz.volume_signature = sig as u16;
            nsiz.is_volume = true;
        }
        Ok(nsiz)
    }
}

fn integer_value(text: &str, key: &str) -> Result<i64> {
    let raw = tagged_value(text, key, "<integer>", "</integer>")
        .ok_or_else(|| DmgError::Corrupt(format!("nsiz resource missing {key}")))?;
    raw.trim()
        .parse::<i64>()
        .map_err(|_| DmgError::Corrupt(format!("bad integer for {key}: {raw:?}")))
}

/// Append `nsiz` resources, one datum per partition, keyed by partition
/// number.
pub fn write_nsiz(resources: &mut Resources, entries: &[NSizResource]) {
    for nsiz in entries {
        resources.insert(
            "nsiz",
            ResourceData {
                attributes: 0,
                id: nsiz.partition_number as i32,
                name: String::new(),
                data: nsiz.to_plist(),
            },
        );
    }
}

/// Read back every `nsiz` entry, in resource order.
pub fn read_nsiz(resources: &Resources) -> Result<Vec<NSizResource>> {
    let Some(data) = resources.get("nsiz") else {
        return Ok(Vec::new());
    };
    data.iter().map(|datum| NSizResource::parse(&datum.data)).collect()
}

const PLST_DATA_SIZE: usize = 1032;

/// Append the boilerplate `plst` resource hdiutil stamps on every image.
pub fn make_plst(resources: &mut Resources) {
    let mut data = vec![0u8; PLST_DATA_SIZE];
    data[516..520].copy_from_slice(&[0x00, 0x01, 0x00, 0x01]);
    resources.insert(
        "plst",
        ResourceData { attributes: ATTRIBUTE_HDIUTIL, id: 0, name: String::new(), data },
    );
}

pub const SIZE_RESOURCE_SIZE: usize = 286;

/// Append the `size` resource describing the embedded volume.
pub fn make_size(resources: &mut Resources, header: &VolumeHeader) {
    let mut data = vec![0u8; SIZE_RESOURCE_SIZE];
    BigEndian::write_u16(&mut data[0..], 5); // version
    BigEndian::write_u32(&mut data[2..], 1); // isHFS
    // unknown1 at 6, dataLen at 10, data[255] at 11, unknown2/3 at 266/270
    BigEndian::write_u32(&mut data[274..], header.modify_date);
    // unknown4 at 278
    BigEndian::write_u16(&mut data[282..], header.signature);
    BigEndian::write_u16(&mut data[284..], 1); // sizePresent
    resources.insert(
        "size",
        ResourceData { attributes: 0, id: 0, name: String::new(), data },
    );
}
