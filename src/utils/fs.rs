use crate::error::{Result, ToolbeltError};
use std::fs::File;
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Component, Path, PathBuf};

/// Granularity at which zero runs are turned into holes.
const SPARSE_BLOCK_SIZE: usize = 4096;

pub fn ensure_dir_exists(path: &Path) -> Result<()> {
    if !path.is_dir() {
        std::fs::create_dir_all(path).map_err(ToolbeltError::filesystem(path))?;
    }
    Ok(())
}

/// Joins an archive member name onto `root`, refusing anything that would
/// land outside of it.
pub fn join_within(root: &Path, name: &Path) -> Result<PathBuf> {
    let mut joined = root.to_path_buf();

    for component in name.components() {
        match component {
            Component::Normal(part) => joined.push(part),
            Component::RootDir | Component::CurDir => {}
            Component::ParentDir | Component::Prefix(_) => {
                return Err(ToolbeltError::UnsafePath {
                    path: name.display().to_string(),
                });
            }
        }
    }

    Ok(joined)
}

pub fn set_mode(path: &Path, mode: u32) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode & 0o7777))
            .map_err(ToolbeltError::filesystem(path))?;
    }

    // Only Unix permission bits are carried in tar headers
    #[cfg(not(unix))]
    {
        let _ = (path, mode);
    }

    Ok(())
}

/// A file writer that seeks over zero-filled blocks instead of writing them,
/// leaving holes on filesystems that support sparse files.
///
/// Callers must finish with [`SparseWriter::finish`]; a trailing hole only
/// becomes part of the file once the length is fixed up there.
pub struct SparseWriter {
    file: File,
    pending_hole: u64,
    len: u64,
}

impl SparseWriter {
    pub fn new(file: File) -> Self {
        Self {
            file,
            pending_hole: 0,
            len: 0,
        }
    }

    /// Logical number of bytes written so far, holes included.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Flushes pending data, sets the final length and hands back the file.
    pub fn finish(mut self) -> io::Result<File> {
        if self.pending_hole > 0 {
            self.file.set_len(self.len)?;
            self.pending_hole = 0;
        }
        self.file.flush()?;
        Ok(self.file)
    }

    fn skip_pending_hole(&mut self) -> io::Result<()> {
        if self.pending_hole > 0 {
            let offset = i64::try_from(self.pending_hole)
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "hole too large"))?;
            self.file.seek(SeekFrom::Current(offset))?;
            self.pending_hole = 0;
        }
        Ok(())
    }
}

impl Write for SparseWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        for block in buf.chunks(SPARSE_BLOCK_SIZE) {
            if block.iter().all(|&b| b == 0) {
                self.pending_hole += block.len() as u64;
            } else {
                self.skip_pending_hole()?;
                self.file.write_all(block)?;
            }
        }
        self.len += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}
