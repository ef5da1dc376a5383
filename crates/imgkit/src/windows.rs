//! Windows layer tar writer.
//!
//! Container layers targeting Windows must keep every payload path under
//! `Files/` with registry hives under `Hives/`, and each file entry carries a
//! Windows security descriptor in a `MSWINDOWS.rawsd` PAX record.
//! [`WindowsLayerWriter`] wraps a byte sink and enforces that layout:
//!
//! - the first two entries of every layer are `Files/` and `Hives/`
//!   directory headers (emitted on first write, or by [`finish`] when the
//!   layer has no payload)
//! - every incoming entry name must be an absolute POSIX path and is
//!   reparented under `Files`
//! - missing parent directories are synthesized in order, without PAX
//!   records
//! - regular files, symlinks, and caller-supplied directories get exactly
//!   one `MSWINDOWS.rawsd` record: the administrator descriptor for
//!   uid 0/gid 0 entries, the user descriptor otherwise; caller-supplied
//!   PAX records are passed through verbatim
//!
//! Header blocks are written by hand (512-byte ustar blocks, octal fields,
//! space-seeded checksum), since the `tar` crate's safe setters refuse the
//! absolute names this format requires; the entry path therefore travels
//! alongside the `tar::Header` that supplies the metadata. Names that
//! overflow the 100-byte ustar name field once `Files` is prefixed ride a
//! PAX `path` record ahead of the entry, with the header field holding a
//! truncated name, so deeply nested payloads still round-trip losslessly.
//!
//! [`finish`]: WindowsLayerWriter::finish

use std::collections::{BTreeMap, HashSet};
use std::io::Write;

use crate::error::{ImageError, Result};

/// PAX record key carrying a base64 raw security descriptor.
pub const RAW_SECURITY_DESCRIPTOR_KEY: &str = "MSWINDOWS.rawsd";

/// Longest name the ustar header field can carry; anything longer travels
/// in a PAX `path` record.
const MAX_NAME_LEN: usize = 100;

/// Self-relative security descriptor with owner and group
/// `BUILTIN\Administrators` (S-1-5-32-544), base64-encoded.
pub const ADMINISTRATOR_OWNER_AND_GROUP_SID: &str =
    "AQAAgBQAAAAkAAAAAAAAAAAAAAABAgAAAAAABSAAAAAgAgAAAQIAAAAAAAUgAAAAIAIAAA==";

/// Self-relative security descriptor with owner and group `BUILTIN\Users`
/// (S-1-5-32-545), base64-encoded.
pub const USER_OWNER_AND_GROUP_SID: &str =
    "AQAAgBQAAAAkAAAAAAAAAAAAAAABAgAAAAAABSAAAAAhAgAAAQIAAAAAAAUgAAAAIQIAAA==";

/// A tar writer producing the Windows container layer layout.
pub struct WindowsLayerWriter<W: Write> {
    out: W,
    wrote_prefix: bool,
    seen_dirs: HashSet<String>,
    /// Payload bytes still owed for the current entry.
    remaining: u64,
    /// Padding bytes owed once the current payload completes.
    padding: usize,
}

impl<W: Write> WindowsLayerWriter<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            wrote_prefix: false,
            seen_dirs: HashSet::new(),
            remaining: 0,
            padding: 0,
        }
    }

    /// Write an entry header. `name` is the entry's path (the `tar` crate
    /// cannot carry absolute names in a `Header`); `header` supplies the
    /// type, ownership, size, and timestamps. Payload bytes for file entries
    /// follow via [`Write`].
    pub fn write_header(&mut self, name: &str, header: &tar::Header) -> Result<()> {
        self.write_header_with_pax(name, header, &BTreeMap::new())
    }

    /// Like [`write_header`](Self::write_header), for entries that already
    /// carry PAX records. Caller-supplied records are written verbatim and
    /// suppress the synthesized security descriptor.
    pub fn write_header_with_pax(
        &mut self,
        name: &str,
        header: &tar::Header,
        pax: &BTreeMap<String, String>,
    ) -> Result<()> {
        self.flush_entry()?;
        self.ensure_prefix()?;

        if !name.starts_with('/') || name.contains('\\') {
            return Err(ImageError::InvalidLayerName(name.to_string()));
        }

        let out_name = format!("Files{}", name.trim_end_matches('/'));
        self.write_parent_dirs(&out_name)?;

        let typeflag = header.entry_type().as_byte();
        if typeflag == b'5' {
            self.seen_dirs.insert(out_name.clone());
        }

        let mut records = if !pax.is_empty() {
            pax.clone()
        } else {
            self.default_pax_records(header, typeflag)?
        };
        if out_name.len() > MAX_NAME_LEN {
            records.insert("path".to_string(), out_name.clone());
        }
        if !records.is_empty() {
            self.write_pax_block(&out_name, &records)?;
        }

        let size = header.size()?;
        write_block(
            &mut self.out,
            &out_name,
            header.mode()?,
            header.uid()?,
            header.gid()?,
            size,
            header.mtime()?,
            typeflag,
            header.link_name_bytes().as_deref(),
        )?;

        self.remaining = size;
        self.padding = ((512 - (size % 512)) % 512) as usize;
        Ok(())
    }

    /// Flush the Files/Hives prefix if nothing was written, close the
    /// current entry, and write the end-of-archive marker. Returns the
    /// underlying sink.
    pub fn finish(mut self) -> Result<W> {
        self.flush_entry()?;
        self.ensure_prefix()?;
        self.out.write_all(&[0u8; 1024])?;
        self.out.flush()?;
        Ok(self.out)
    }

    fn ensure_prefix(&mut self) -> Result<()> {
        if self.wrote_prefix {
            return Ok(());
        }
        self.wrote_prefix = true;
        for name in ["Files", "Hives"] {
            write_block(&mut self.out, name, 0o755, 0, 0, 0, 0, b'5', None)?;
            self.seen_dirs.insert(name.to_string());
        }
        Ok(())
    }

    fn write_parent_dirs(&mut self, out_name: &str) -> Result<()> {
        let components: Vec<&str> = out_name.split('/').collect();
        for i in 1..components.len() {
            let parent = components[..i].join("/");
            if self.seen_dirs.contains(&parent) {
                continue;
            }
            if parent.len() > MAX_NAME_LEN {
                let records = BTreeMap::from([("path".to_string(), parent.clone())]);
                self.write_pax_block(&parent, &records)?;
            }
            write_block(&mut self.out, &parent, 0o755, 0, 0, 0, 0, b'5', None)?;
            self.seen_dirs.insert(parent);
        }
        Ok(())
    }

    fn default_pax_records(
        &self,
        header: &tar::Header,
        typeflag: u8,
    ) -> Result<BTreeMap<String, String>> {
        let mut records = BTreeMap::new();
        if matches!(typeflag, 0 | b'0' | b'2' | b'5') {
            let descriptor = if header.uid()? == 0 && header.gid()? == 0 {
                ADMINISTRATOR_OWNER_AND_GROUP_SID
            } else {
                USER_OWNER_AND_GROUP_SID
            };
            records.insert(
                RAW_SECURITY_DESCRIPTOR_KEY.to_string(),
                descriptor.to_string(),
            );
        }
        Ok(records)
    }

    fn write_pax_block(&mut self, entry_name: &str, records: &BTreeMap<String, String>) -> Result<()> {
        let mut data = Vec::new();
        for (key, value) in records {
            data.extend_from_slice(&pax_record(key, value));
        }

        let pax_name = format!("PaxHeaders.0/{}", entry_name);
        write_block(
            &mut self.out,
            &pax_name,
            0o644,
            0,
            0,
            data.len() as u64,
            0,
            b'x',
            None,
        )?;
        self.out.write_all(&data)?;
        let padding = (512 - (data.len() % 512)) % 512;
        self.out.write_all(&vec![0u8; padding])?;
        Ok(())
    }

    fn flush_entry(&mut self) -> Result<()> {
        if self.remaining > 0 {
            return Err(std::io::Error::other(format!(
                "missed writing {} bytes of entry payload",
                self.remaining
            ))
            .into());
        }
        if self.padding > 0 {
            self.out.write_all(&vec![0u8; self.padding])?;
            self.padding = 0;
        }
        Ok(())
    }
}

impl<W: Write> Write for WindowsLayerWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.remaining == 0 {
            return Err(std::io::Error::other("write exceeds entry size"));
        }
        let n = buf.len().min(self.remaining as usize);
        self.out.write_all(&buf[..n])?;
        self.remaining -= n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.out.flush()
    }
}

/// Write one 512-byte ustar header block. Names longer than the 100-byte
/// field are truncated; callers emit a PAX `path` record first so readers
/// recover the full name.
#[allow(clippy::too_many_arguments)]
fn write_block<W: Write>(
    out: &mut W,
    name: &str,
    mode: u32,
    uid: u64,
    gid: u64,
    size: u64,
    mtime: u64,
    typeflag: u8,
    linkname: Option<&[u8]>,
) -> std::io::Result<()> {
    let mut block = [0u8; 512];

    let name_bytes = name.as_bytes();
    let name_len = name_bytes.len().min(MAX_NAME_LEN);
    block[..name_len].copy_from_slice(&name_bytes[..name_len]);
    write_octal(&mut block[100..108], mode as u64, 7);
    write_octal(&mut block[108..116], uid, 7);
    write_octal(&mut block[116..124], gid, 7);
    write_octal(&mut block[124..136], size, 11);
    write_octal(&mut block[136..148], mtime, 11);

    // Checksum is computed with the checksum field set to spaces.
    block[148..156].fill(b' ');

    block[156] = typeflag;

    if let Some(link) = linkname {
        let n = link.len().min(100);
        block[157..157 + n].copy_from_slice(&link[..n]);
    }

    block[257..263].copy_from_slice(b"ustar\0");
    block[263..265].copy_from_slice(b"00");

    let checksum: u32 = block.iter().map(|&b| b as u32).sum();
    write_octal(&mut block[148..154], checksum as u64, 6);
    block[154] = 0;
    block[155] = b' ';

    out.write_all(&block)
}

fn write_octal(dest: &mut [u8], value: u64, width: usize) {
    let octal = format!("{:0width$o}", value, width = width);
    let bytes = octal.as_bytes();
    let len = bytes.len().min(dest.len());
    dest[..len].copy_from_slice(&bytes[..len]);
}

/// One PAX record line: `<len> <key>=<value>\n` where `<len>` counts the
/// whole line including itself.
fn pax_record(key: &str, value: &str) -> Vec<u8> {
    let base = key.len() + value.len() + 3;
    let mut len = base + decimal_width(base);
    if base + decimal_width(len) != len {
        len = base + decimal_width(len);
    }
    format!("{} {}={}\n", len, key, value).into_bytes()
}

fn decimal_width(n: usize) -> usize {
    n.to_string().len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Read;

    fn file_header(uid: u64, gid: u64, size: u64) -> tar::Header {
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_size(size);
        header.set_mode(0o644);
        header.set_uid(uid);
        header.set_gid(gid);
        header
    }

    fn dir_header() -> tar::Header {
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Directory);
        header.set_size(0);
        header.set_mode(0o755);
        header.set_uid(0);
        header.set_gid(0);
        header
    }

    /// Read back `(name, typeflag, pax records)` for every logical entry.
    fn read_entries(tar_bytes: &[u8]) -> Vec<(String, u8, HashMap<String, String>)> {
        let mut archive = tar::Archive::new(tar_bytes);
        let mut out = Vec::new();
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            let name = entry.path().unwrap().display().to_string();
            let typeflag = entry.header().entry_type().as_byte();
            let mut records = HashMap::new();
            if let Some(extensions) = entry.pax_extensions().unwrap() {
                for extension in extensions {
                    let extension = extension.unwrap();
                    records.insert(
                        extension.key().unwrap().to_string(),
                        extension.value().unwrap().to_string(),
                    );
                }
            }
            out.push((name, typeflag, records));
        }
        out
    }

    #[test]
    fn test_writes_required_entries() {
        let mut writer = WindowsLayerWriter::new(Vec::new());
        writer.write_header("/cnb/my-file", &file_header(0, 0, 0)).unwrap();
        let bytes = writer.finish().unwrap();

        let entries = read_entries(&bytes);
        assert_eq!(entries.len(), 4);
        assert_eq!(entries[0].0, "Files");
        assert_eq!(entries[0].1, b'5');
        assert!(entries[0].2.is_empty());
        assert_eq!(entries[1].0, "Hives");
        assert_eq!(entries[1].1, b'5');
        assert_eq!(entries[2].0, "Files/cnb");
        assert_eq!(entries[2].1, b'5');
        assert!(entries[2].2.is_empty());
        assert_eq!(entries[3].0, "Files/cnb/my-file");
        assert_eq!(entries[3].1, b'0');
        assert_eq!(
            entries[3].2.get(RAW_SECURITY_DESCRIPTOR_KEY).map(String::as_str),
            Some(ADMINISTRATOR_OWNER_AND_GROUP_SID)
        );
        assert_eq!(entries[3].2.len(), 1);
    }

    #[test]
    fn test_duplicate_parent_directories() {
        let mut writer = WindowsLayerWriter::new(Vec::new());
        writer
            .write_header("/cnb/lifecycle/first-file", &file_header(0, 0, 0))
            .unwrap();
        writer.write_header("/cnb/sibling-dir", &dir_header()).unwrap();
        let bytes = writer.finish().unwrap();

        let names: Vec<(String, u8, bool)> = read_entries(&bytes)
            .into_iter()
            .map(|(name, flag, pax)| (name, flag, pax.contains_key(RAW_SECURITY_DESCRIPTOR_KEY)))
            .collect();

        assert_eq!(
            names,
            vec![
                ("Files".to_string(), b'5', false),
                ("Hives".to_string(), b'5', false),
                ("Files/cnb".to_string(), b'5', false),
                ("Files/cnb/lifecycle".to_string(), b'5', false),
                ("Files/cnb/lifecycle/first-file".to_string(), b'0', true),
                ("Files/cnb/sibling-dir".to_string(), b'5', true),
            ]
        );
    }

    #[test]
    fn test_invalid_header_names() {
        let cases = [
            r"c:\windows-path.txt",
            r"\lonelyfile",
            "Files/cnb/lifecycle/first-file",
        ];

        for name in cases {
            let mut writer = WindowsLayerWriter::new(Vec::new());
            let err = writer.write_header(name, &file_header(0, 0, 0)).unwrap_err();
            assert_eq!(
                err.to_string(),
                format!("invalid header name: must be absolute, posix path: {}", name)
            );
        }
    }

    #[test]
    fn test_user_owned_entries_get_user_descriptor() {
        let mut writer = WindowsLayerWriter::new(Vec::new());
        writer
            .write_header("/cnb/my-file", &file_header(1000, 1000, 0))
            .unwrap();
        let bytes = writer.finish().unwrap();

        let entries = read_entries(&bytes);
        let (_, _, records) = &entries[3];
        assert_eq!(
            records.get(RAW_SECURITY_DESCRIPTOR_KEY).map(String::as_str),
            Some(USER_OWNER_AND_GROUP_SID)
        );
    }

    #[test]
    fn test_existing_descriptor_preserved() {
        let mut writer = WindowsLayerWriter::new(Vec::new());
        let pax = BTreeMap::from([(RAW_SECURITY_DESCRIPTOR_KEY.to_string(), "bar".to_string())]);
        writer
            .write_header_with_pax("/cnb/my-file", &file_header(0, 0, 0), &pax)
            .unwrap();
        let bytes = writer.finish().unwrap();

        let entries = read_entries(&bytes);
        let (_, _, records) = &entries[3];
        assert_eq!(
            records.get(RAW_SECURITY_DESCRIPTOR_KEY).map(String::as_str),
            Some("bar")
        );
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn test_long_names_carried_in_path_records() {
        let segment = "a-long-directory-name";
        let dir_path = format!("/{0}/{0}/{0}/{0}/{0}", segment);
        let name = format!("{}/file.txt", dir_path);
        assert!(format!("Files{}", name).len() > 100);

        let mut writer = WindowsLayerWriter::new(Vec::new());
        writer.write_header(&name, &file_header(0, 0, 0)).unwrap();
        let bytes = writer.finish().unwrap();

        let entries = read_entries(&bytes);

        // The deepest synthesized parent no longer fits the ustar name
        // field; it carries a path record and nothing else.
        let deep_parent = format!("Files{}", dir_path);
        assert!(deep_parent.len() > 100);
        let (_, flag, records) = entries
            .iter()
            .find(|(entry_name, _, _)| entry_name == &deep_parent)
            .expect("deep parent emitted");
        assert_eq!(*flag, b'5');
        assert!(records.contains_key("path"));
        assert!(!records.contains_key(RAW_SECURITY_DESCRIPTOR_KEY));

        // Parents that still fit carry no PAX records at all.
        let shallow_parent = format!("Files/{0}/{0}", segment);
        let (_, _, records) = entries
            .iter()
            .find(|(entry_name, _, _)| entry_name == &shallow_parent)
            .expect("shallow parent emitted");
        assert!(records.is_empty());

        // The file entry keeps its full name alongside its descriptor.
        let full_name = format!("Files{}", name);
        let (_, flag, records) = entries
            .iter()
            .find(|(entry_name, _, _)| entry_name == &full_name)
            .expect("file entry emitted");
        assert_eq!(*flag, b'0');
        assert_eq!(records.get("path").map(String::as_str), Some(full_name.as_str()));
        assert_eq!(
            records.get(RAW_SECURITY_DESCRIPTOR_KEY).map(String::as_str),
            Some(ADMINISTRATOR_OWNER_AND_GROUP_SID)
        );
    }

    #[test]
    fn test_empty_layer_still_writes_prefix() {
        let writer = WindowsLayerWriter::new(Vec::new());
        let bytes = writer.finish().unwrap();

        let entries = read_entries(&bytes);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].0, "Files");
        assert_eq!(entries[1].0, "Hives");
    }

    #[test]
    fn test_payload_round_trip() {
        let mut writer = WindowsLayerWriter::new(Vec::new());
        writer
            .write_header("/cnb/data.txt", &file_header(0, 0, 11))
            .unwrap();
        writer.write_all(b"hello world").unwrap();
        let bytes = writer.finish().unwrap();

        let mut archive = tar::Archive::new(&bytes[..]);
        let mut contents = None;
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            if entry.path().unwrap().display().to_string() == "Files/cnb/data.txt" {
                let mut body = String::new();
                entry.read_to_string(&mut body).unwrap();
                contents = Some(body);
            }
        }
        assert_eq!(contents.as_deref(), Some("hello world"));
    }

    #[test]
    fn test_security_descriptors_decode() {
        use base64::Engine;
        for descriptor in [ADMINISTRATOR_OWNER_AND_GROUP_SID, USER_OWNER_AND_GROUP_SID] {
            let raw = base64::engine::general_purpose::STANDARD
                .decode(descriptor)
                .unwrap();
            // Self-relative descriptor: revision 1, SE_SELF_RELATIVE control bit.
            assert_eq!(raw[0], 1);
            assert_eq!(raw[3] & 0x80, 0x80);
            assert_eq!(raw.len(), 52);
        }
    }

    #[test]
    fn test_pax_record_length_prefix() {
        let record = pax_record("MSWINDOWS.rawsd", "abc");
        let text = String::from_utf8(record.clone()).unwrap();
        let (len, _) = text.split_once(' ').unwrap();
        assert_eq!(len.parse::<usize>().unwrap(), record.len());
    }
}
