//! Streaming tar + gzip codec, used by install and boot.
//!
//! The tar layer is GNU ustar: 512-byte headers with octal size/mtime and a
//! computed checksum, entry data padded to block size, and two zero blocks
//! at the end. Names longer than 100 bytes are carried in a type-'L'
//! LongLink block holding the full name, followed by the real header with a
//! truncated name; the reader pairs the two back up.
//!
//! The codec knows nothing about the VFS — it works over `std::io`
//! [`Read`]/[`Write`] with the gzip filter from `flate2` on the outside.
//! [`Archiver`] is the facade bound to a process's filesystem view.

use std::io::{Read, Write};
use std::sync::Arc;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::error::SysError;
use crate::vfs::{self, FileKind, Vfs};

const BLOCK: usize = 512;
const NAME_FIELD: usize = 100;
/// Header name used for GNU LongLink blocks.
const LONGLINK_NAME: &[u8] = b"././@LongLink";

/// One archive member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub name: String,
    pub mode: u32,
    pub mtime: u64,
    pub data: Vec<u8>,
}

/// Tar writer over any byte sink.
pub struct TarWriter<W: Write> {
    inner: W,
}

impl<W: Write> TarWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Append a file entry, emitting a LongLink block first when the name
    /// exceeds the 100-byte header field.
    pub fn append(&mut self, entry: &Entry) -> Result<(), SysError> {
        let name = entry.name.as_bytes();
        if name.len() > NAME_FIELD {
            // LongLink data is the full name, NUL-terminated, block-padded.
            self.write_header(LONGLINK_NAME, 0, (name.len() + 1) as u64, 0, b'L')?;
            self.inner.write_all(name)?;
            self.inner.write_all(&[0])?;
            self.pad(name.len() + 1)?;
        }
        let truncated = &name[..name.len().min(NAME_FIELD)];
        self.write_header(truncated, entry.mode, entry.data.len() as u64, entry.mtime, b'0')?;
        self.inner.write_all(&entry.data)?;
        self.pad(entry.data.len())?;
        Ok(())
    }

    /// Write the two terminating zero blocks and hand back the sink.
    pub fn finish(mut self) -> Result<W, SysError> {
        self.inner.write_all(&[0u8; BLOCK * 2])?;
        self.inner.flush()?;
        Ok(self.inner)
    }

    fn pad(&mut self, written: usize) -> Result<(), SysError> {
        let rem = written % BLOCK;
        if rem != 0 {
            self.inner.write_all(&vec![0u8; BLOCK - rem])?;
        }
        Ok(())
    }

    fn write_header(
        &mut self,
        name: &[u8],
        mode: u32,
        size: u64,
        mtime: u64,
        typeflag: u8,
    ) -> Result<(), SysError> {
        let mut block = [0u8; BLOCK];
        block[..name.len()].copy_from_slice(name);
        write_octal(&mut block[100..108], u64::from(mode), 7);
        write_octal(&mut block[108..116], 0, 7); // uid
        write_octal(&mut block[116..124], 0, 7); // gid
        write_octal(&mut block[124..136], size, 11);
        write_octal(&mut block[136..148], mtime, 11);
        // Checksum is computed with its own field spaced out.
        block[148..156].fill(b' ');
        block[156] = typeflag;
        block[257..263].copy_from_slice(b"ustar\0");
        block[263..265].copy_from_slice(b"00");

        let checksum: u32 = block.iter().map(|&b| u32::from(b)).sum();
        write_octal(&mut block[148..155], u64::from(checksum), 6);
        block[155] = b' ';

        self.inner.write_all(&block)?;
        Ok(())
    }
}

/// `width` octal digits followed by a NUL, written into `field`.
fn write_octal(field: &mut [u8], value: u64, width: usize) {
    let text = format!("{value:0width$o}");
    let bytes = text.as_bytes();
    field[..bytes.len()].copy_from_slice(bytes);
    field[bytes.len()] = 0;
}

fn parse_octal(field: &[u8]) -> Result<u64, SysError> {
    let text: String = field
        .iter()
        .take_while(|&&b| b != 0 && b != b' ')
        .map(|&b| b as char)
        .collect();
    if text.is_empty() {
        return Ok(0);
    }
    u64::from_str_radix(&text, 8)
        .map_err(|_| SysError::Io("bad octal field in tar header".to_string()))
}

/// Tar reader over any byte source.
pub struct TarReader<R: Read> {
    inner: R,
}

impl<R: Read> TarReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Next file entry, with any LongLink name applied. `Ok(None)` at the
    /// terminating zero blocks; a stream ending mid-record is
    /// [`SysError::UnexpectedEof`].
    pub fn next_entry(&mut self) -> Result<Option<Entry>, SysError> {
        let mut long_name: Option<String> = None;
        loop {
            let mut header = [0u8; BLOCK];
            self.inner.read_exact(&mut header)?;
            if header.iter().all(|&b| b == 0) {
                let mut second = [0u8; BLOCK];
                self.inner.read_exact(&mut second)?;
                return Ok(None);
            }

            let expected = parse_octal(&header[148..156])?;
            let mut summed = header;
            summed[148..156].fill(b' ');
            let actual: u64 = summed.iter().map(|&b| u64::from(b)).sum();
            if expected != actual {
                return Err(SysError::Io("tar header checksum mismatch".to_string()));
            }

            let size = parse_octal(&header[124..136])? as usize;
            let typeflag = header[156];
            let mut data = vec![0u8; size];
            self.inner.read_exact(&mut data)?;
            let rem = size % BLOCK;
            if rem != 0 {
                let mut pad = vec![0u8; BLOCK - rem];
                self.inner.read_exact(&mut pad)?;
            }

            match typeflag {
                b'L' => {
                    let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
                    long_name = Some(String::from_utf8_lossy(&data[..end]).into_owned());
                }
                b'0' | 0 => {
                    let name = match long_name.take() {
                        Some(name) => name,
                        None => {
                            let end = header
                                .iter()
                                .take(NAME_FIELD)
                                .position(|&b| b == 0)
                                .unwrap_or(NAME_FIELD);
                            String::from_utf8_lossy(&header[..end]).into_owned()
                        }
                    };
                    return Ok(Some(Entry {
                        name,
                        mode: parse_octal(&header[100..108])? as u32,
                        mtime: parse_octal(&header[136..148])?,
                        data,
                    }));
                }
                // Directories and other member kinds carry no content we
                // restore; extraction creates parents implicitly.
                _ => {}
            }
        }
    }
}

/// Archive facade bound to one process's filesystem view.
pub struct Archiver {
    fs: Arc<dyn Vfs>,
    cwd: String,
}

impl Archiver {
    pub fn new(fs: Arc<dyn Vfs>, cwd: String) -> Self {
        Self { fs, cwd }
    }

    /// Pack the given paths (files or directory trees) into a `.tar.gz`
    /// byte vector. Entry names are the normalized paths without the
    /// leading slash.
    pub async fn pack(&self, paths: &[String]) -> Result<Vec<u8>, SysError> {
        let mut writer = TarWriter::new(GzEncoder::new(Vec::new(), Compression::default()));

        let mut stack: Vec<String> = paths
            .iter()
            .rev()
            .map(|p| vfs::normalize(&self.cwd, p))
            .collect();
        while let Some(path) = stack.pop() {
            let meta = self.fs.metadata(&path).await?;
            match meta.kind {
                FileKind::File => {
                    let data = self.fs.read(&path).await?;
                    writer.append(&Entry {
                        name: path.trim_start_matches('/').to_string(),
                        mode: meta.mode,
                        mtime: 0,
                        data,
                    })?;
                }
                FileKind::Dir => {
                    let names = self.fs.read_dir(&path).await?;
                    for name in names.into_iter().rev() {
                        if path == "/" {
                            stack.push(format!("/{name}"));
                        } else {
                            stack.push(format!("{path}/{name}"));
                        }
                    }
                }
            }
        }

        let gz = writer.finish()?;
        Ok(gz.finish()?)
    }

    /// Extract a `.tar.gz` byte stream under `dest` (resolved against this
    /// archiver's CWD).
    pub async fn unpack(&self, bytes: &[u8], dest: &str) -> Result<(), SysError> {
        let dest = vfs::normalize(&self.cwd, dest);
        let mut reader = TarReader::new(GzDecoder::new(bytes));
        while let Some(entry) = reader.next_entry()? {
            let path = vfs::normalize(&dest, &entry.name);
            self.fs.write(&path, entry.data, entry.mode).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::MemFs;

    fn tar_roundtrip(entries: &[Entry]) -> Vec<Entry> {
        let mut writer = TarWriter::new(Vec::new());
        for entry in entries {
            writer.append(entry).unwrap();
        }
        let bytes = writer.finish().unwrap();
        assert_eq!(bytes.len() % BLOCK, 0);

        let mut reader = TarReader::new(&bytes[..]);
        let mut out = Vec::new();
        while let Some(entry) = reader.next_entry().unwrap() {
            out.push(entry);
        }
        out
    }

    #[test]
    fn test_tar_roundtrip_plain_names() {
        let entries = vec![
            Entry {
                name: "bin/tool".to_string(),
                mode: 0o777,
                mtime: 1_700_000_000,
                data: b"#!payload".to_vec(),
            },
            Entry {
                name: "etc/empty".to_string(),
                mode: 0o644,
                mtime: 0,
                data: Vec::new(),
            },
        ];
        assert_eq!(tar_roundtrip(&entries), entries);
    }

    #[test]
    fn test_tar_roundtrip_long_utf8_name() {
        // > 100 bytes, multi-byte characters, to force a LongLink block.
        let name = format!("données/{}", "café-archivé-".repeat(12));
        assert!(name.len() > 100 && name.len() < 512);
        let entries = vec![Entry {
            name,
            mode: 0o777,
            mtime: 42,
            data: b"long name payload".to_vec(),
        }];
        assert_eq!(tar_roundtrip(&entries), entries);
    }

    #[test]
    fn test_tar_empty_archive() {
        let writer = TarWriter::new(Vec::new());
        let bytes = writer.finish().unwrap();
        assert_eq!(bytes.len(), BLOCK * 2);
        let mut reader = TarReader::new(&bytes[..]);
        assert!(reader.next_entry().unwrap().is_none());
    }

    #[test]
    fn test_truncated_stream_is_unexpected_eof() {
        let mut writer = TarWriter::new(Vec::new());
        writer
            .append(&Entry {
                name: "f".to_string(),
                mode: 0o644,
                mtime: 0,
                data: vec![7u8; 600],
            })
            .unwrap();
        let bytes = writer.finish().unwrap();

        // Cut inside the data blocks.
        let mut reader = TarReader::new(&bytes[..700]);
        assert_eq!(reader.next_entry().unwrap_err(), SysError::UnexpectedEof);
    }

    #[test]
    fn test_corrupt_header_checksum_rejected() {
        let mut writer = TarWriter::new(Vec::new());
        writer
            .append(&Entry {
                name: "f".to_string(),
                mode: 0o644,
                mtime: 0,
                data: b"x".to_vec(),
            })
            .unwrap();
        let mut bytes = writer.finish().unwrap();
        bytes[0] ^= 0xFF;
        let mut reader = TarReader::new(&bytes[..]);
        assert!(matches!(reader.next_entry(), Err(SysError::Io(_))));
    }

    #[tokio::test]
    async fn test_vfs_pack_unpack_roundtrip() {
        let fs = MemFs::new();
        fs.write("/src/a.txt", b"alpha".to_vec(), 0o777).await.unwrap();
        fs.write("/src/sub/b.bin", vec![0, 159, 146, 150], 0o777)
            .await
            .unwrap();

        let archiver = Archiver::new(Arc::clone(&fs) as Arc<dyn Vfs>, "/".to_string());
        let bytes = archiver.pack(&["/src".to_string()]).await.unwrap();
        archiver.unpack(&bytes, "/out").await.unwrap();

        assert_eq!(fs.read("/out/src/a.txt").await.unwrap(), b"alpha");
        assert_eq!(
            fs.read("/out/src/sub/b.bin").await.unwrap(),
            vec![0, 159, 146, 150]
        );
        assert_eq!(fs.metadata("/out/src/a.txt").await.unwrap().mode, 0o777);
    }

    #[tokio::test]
    async fn test_vfs_long_path_extraction() {
        let fs = MemFs::new();
        let long_component = "registre-des-opérations-très-longues".repeat(3);
        let path = format!("/deep/{long_component}/fichier.txt");
        assert!(path.len() > 100);
        fs.write(&path, b"bonjour".to_vec(), 0o777).await.unwrap();

        let archiver = Archiver::new(Arc::clone(&fs) as Arc<dyn Vfs>, "/".to_string());
        let bytes = archiver.pack(&["/deep".to_string()]).await.unwrap();
        archiver.unpack(&bytes, "/restored").await.unwrap();

        let restored = format!("/restored/deep/{long_component}/fichier.txt");
        assert_eq!(fs.read(&restored).await.unwrap(), b"bonjour");
    }
}
