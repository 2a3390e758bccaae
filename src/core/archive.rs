use crate::error::{Result, ToolbeltError};
use crate::utils::fs::{self, SparseWriter};
use flate2::bufread::MultiGzDecoder;
use log::{debug, trace};
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Cursor, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tar::{Archive, EntryType, Header};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// What the extractor does with a tar member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Directory,
    File,
    /// pax global header, carries no filesystem object
    Metadata,
    Unsupported(char),
}

impl From<EntryType> for EntryKind {
    fn from(entry_type: EntryType) -> Self {
        match entry_type {
            EntryType::Directory => EntryKind::Directory,
            // Sparse members are expanded to their full contents by the decoder
            EntryType::Regular | EntryType::GNUSparse => EntryKind::File,
            EntryType::XGlobalHeader => EntryKind::Metadata,
            other => EntryKind::Unsupported(other.as_byte() as char),
        }
    }
}

impl EntryKind {
    /// Classifies a member by its header and raw name.
    ///
    /// Pre-POSIX archives mark directories with a `'\0'` type flag and a
    /// trailing slash on the name.
    pub fn of(header: &Header, name: &[u8]) -> Self {
        if header.as_old().linkflag[0] == 0 && name.ends_with(b"/") {
            return EntryKind::Directory;
        }
        EntryKind::from(header.entry_type())
    }
}

/// Checks whether a seekable stream starts with the gzip magic bytes.
///
/// The stream is put back where it was before returning, also when reading
/// fails.
pub fn is_gzip<R: Read + Seek + ?Sized>(reader: &mut R) -> Result<bool> {
    let start = reader.stream_position()?;
    let read = read_prefix(&mut *reader);
    reader.seek(SeekFrom::Start(start))?;

    let (magic, filled) = read?;
    Ok(filled == magic.len() && magic == GZIP_MAGIC)
}

/// Checks whether a buffered stream starts with the gzip magic bytes without
/// consuming anything.
///
/// Only the bytes the reader currently buffers (or gets from a single read
/// into an empty buffer) are looked at. A source that hands out fewer than
/// two bytes per read can therefore report `false` for gzip data;
/// [`extract_reader`] does not depend on this function for that reason.
pub fn is_gzip_buffered<R: BufRead + ?Sized>(reader: &mut R) -> Result<bool> {
    let buffered = reader.fill_buf()?;
    Ok(buffered.starts_with(&GZIP_MAGIC))
}

/// Reads up to two bytes, retrying short reads until the source runs dry.
fn read_prefix<R: Read + ?Sized>(reader: &mut R) -> io::Result<([u8; 2], usize)> {
    let mut magic = [0u8; 2];
    let mut filled = 0;
    while filled < magic.len() {
        match reader.read(&mut magic[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok((magic, filled))
}

pub fn extract_archive(archive_path: &Path, destination: &Path) -> Result<()> {
    Extractor::new().extract_archive(archive_path, destination)
}

pub fn extract_reader<R: Read>(reader: R, destination: &Path) -> Result<()> {
    Extractor::new().extract_reader(reader, destination)
}

pub fn extract_stream<R: Read>(reader: R, destination: &Path) -> Result<()> {
    Extractor::new().extract_stream(reader, destination)
}

pub struct Extractor;

impl Default for Extractor {
    fn default() -> Self {
        Self
    }
}

impl Extractor {
    pub fn new() -> Self {
        Self
    }

    /// Extracts a `.tar` or `.tar.gz` file, telling the two apart by content.
    pub fn extract_archive(&self, archive_path: &Path, destination: &Path) -> Result<()> {
        debug!("Extracting {archive_path:?} to {destination:?}");

        let mut file = File::open(archive_path).map_err(ToolbeltError::filesystem(archive_path))?;
        let gzipped = is_gzip(&mut file).map_err(|e| match e {
            ToolbeltError::Io(source) => ToolbeltError::filesystem(archive_path)(source),
            other => other,
        })?;

        let reader = BufReader::new(file);
        if gzipped {
            self.extract_stream(MultiGzDecoder::new(reader), destination)
        } else {
            self.extract_stream(reader, destination)
        }
    }

    /// Same as [`Extractor::extract_archive`] for streams that cannot seek.
    ///
    /// The first two bytes are read off the stream and put back in front of
    /// it before decoding.
    pub fn extract_reader<R: Read>(&self, mut reader: R, destination: &Path) -> Result<()> {
        let (magic, filled) = read_prefix(&mut reader).map_err(ToolbeltError::malformed)?;
        let gzipped = filled == magic.len() && magic == GZIP_MAGIC;

        let stream = BufReader::new(Cursor::new(magic[..filled].to_vec()).chain(reader));
        if gzipped {
            self.extract_stream(MultiGzDecoder::new(stream), destination)
        } else {
            self.extract_stream(stream, destination)
        }
    }

    /// Extracts an uncompressed tar stream entry by entry.
    ///
    /// Stops at the first directory or regular file that cannot be written
    /// and at the first entry of any other type. Whatever was extracted
    /// before that point stays on disk.
    ///
    /// Directory modes are applied last, deepest first, so a read-only
    /// directory does not block the files that follow it.
    pub fn extract_stream<R: Read>(&self, reader: R, destination: &Path) -> Result<()> {
        fs::ensure_dir_exists(destination)?;

        let mut directories = Vec::new();
        let unpacked = unpack_entries(reader, destination, &mut directories);
        let restored = apply_directory_modes(directories);

        unpacked?;
        restored
    }
}

fn unpack_entries<R: Read>(
    reader: R,
    destination: &Path,
    directories: &mut Vec<(PathBuf, u32)>,
) -> Result<()> {
    let mut archive = Archive::new(reader);
    let entries = archive.entries().map_err(ToolbeltError::malformed)?;

    for entry in entries {
        let mut entry = entry.map_err(ToolbeltError::malformed)?;

        let kind = EntryKind::of(entry.header(), &entry.path_bytes());
        let mode = entry.header().mode().map_err(ToolbeltError::malformed)?;
        let name = entry.path().map_err(ToolbeltError::malformed)?.into_owned();

        trace!("{kind:?} {name:?} mode {mode:o}");

        match kind {
            EntryKind::Directory => {
                let target = fs::join_within(destination, &name)?;
                fs::ensure_dir_exists(&target)?;
                directories.push((target, mode));
            }
            EntryKind::File => {
                let target = fs::join_within(destination, &name)?;
                if let Some(parent) = target.parent() {
                    fs::ensure_dir_exists(parent)?;
                }
                write_file(&mut entry, &target, mode)?;
                fs::set_mode(&target, mode)?;
            }
            EntryKind::Metadata => {}
            EntryKind::Unsupported(kind) => {
                return Err(ToolbeltError::UnsupportedEntry {
                    kind,
                    path: name.display().to_string(),
                });
            }
        }
    }

    Ok(())
}

fn apply_directory_modes(mut directories: Vec<(PathBuf, u32)>) -> Result<()> {
    // Children before parents, so no directory is locked before its contents
    directories.sort_by_key(|(path, _)| std::cmp::Reverse(path.components().count()));
    for (path, mode) in directories {
        fs::set_mode(&path, mode)?;
    }
    Ok(())
}

fn write_file<R: Read>(entry: &mut R, target: &Path, mode: u32) -> Result<()> {
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);

    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(mode & 0o7777);
    }
    #[cfg(not(unix))]
    let _ = mode;

    let file = options.open(target).map_err(ToolbeltError::filesystem(target))?;
    let mut writer = SparseWriter::new(file);

    // Read failures come from the archive, write failures from the destination
    let mut buffer = vec![0u8; COPY_BUFFER_SIZE];
    loop {
        let n = match entry.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(ToolbeltError::malformed(e)),
        };
        writer
            .write_all(&buffer[..n])
            .map_err(ToolbeltError::filesystem(target))?;
    }

    writer.finish().map_err(ToolbeltError::filesystem(target))?;
    Ok(())
}
