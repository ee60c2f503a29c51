//! Thin wrappers over the OS calls used by native targets.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;

/// Force `[offset, offset + len)` of `file` to disk.
///
/// Uses `sync_file_range` on Linux so only the new extent is written back;
/// other platforms fall back to `fdatasync` of the whole file.
pub(crate) fn sync_range(file: &File, offset: u64, len: u64) -> io::Result<()> {
    #[cfg(target_os = "linux")]
    {
        use std::os::unix::io::AsRawFd;
        let flags = libc::SYNC_FILE_RANGE_WAIT_BEFORE
            | libc::SYNC_FILE_RANGE_WRITE
            | libc::SYNC_FILE_RANGE_WAIT_AFTER;
        // SAFETY: the descriptor is owned by `file`, which outlives the call.
        let rc = unsafe {
            libc::sync_file_range(
                file.as_raw_fd(),
                offset as libc::off64_t,
                len as libc::off64_t,
                flags,
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = (offset, len);
        file.sync_data()
    }
}

/// Tell the kernel the range will not be read again.
pub(crate) fn fadvise_dontneed(file: &File, offset: u64, len: u64) -> io::Result<()> {
    #[cfg(target_os = "linux")]
    {
        use std::os::unix::io::AsRawFd;
        // SAFETY: the descriptor is owned by `file`, which outlives the call.
        let rc = unsafe {
            libc::posix_fadvise(
                file.as_raw_fd(),
                offset as libc::off_t,
                len as libc::off_t,
                libc::POSIX_FADV_DONTNEED,
            )
        };
        // posix_fadvise returns the error number instead of setting errno
        if rc != 0 {
            return Err(io::Error::from_raw_os_error(rc));
        }
        Ok(())
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = (file, offset, len);
        Ok(())
    }
}

/// Create `path` for writing with `O_DIRECT`.
#[cfg(target_os = "linux")]
pub(crate) fn create_direct(path: &Path) -> io::Result<File> {
    use std::os::unix::fs::OpenOptionsExt;
    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .custom_flags(libc::O_DIRECT)
        .open(path)
}

/// `O_DIRECT` is unavailable on this platform.
#[cfg(not(target_os = "linux"))]
pub(crate) fn create_direct(_path: &Path) -> io::Result<File> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "O_DIRECT is not supported on this platform",
    ))
}

/// Create `path` for buffered writing.
pub(crate) fn create_buffered(path: &Path) -> io::Result<File> {
    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
}

/// Write all of `buf` at `offset` without moving any shared cursor.
pub(crate) fn write_all_at(file: &File, buf: &[u8], offset: u64) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::FileExt;
        file.write_all_at(buf, offset)
    }
    #[cfg(not(unix))]
    {
        use std::io::{Seek, SeekFrom, Write};
        let mut f = file;
        f.seek(SeekFrom::Start(offset))?;
        f.write_all(buf)
    }
}

/// Vectored write of `bufs` starting at `offset`, looping until every byte
/// is on its way to disk.
pub(crate) fn write_vectored_all_at(file: &File, bufs: &[&[u8]], offset: u64) -> io::Result<()> {
    use std::io::{IoSlice, Seek, SeekFrom, Write};
    let mut f = file;
    f.seek(SeekFrom::Start(offset))?;

    let mut index = 0;
    let mut skip = 0;
    while index < bufs.len() {
        if bufs[index].len() == skip {
            index += 1;
            skip = 0;
            continue;
        }
        let mut slices = Vec::with_capacity(bufs.len() - index);
        slices.push(IoSlice::new(&bufs[index][skip..]));
        slices.extend(bufs[index + 1..].iter().map(|b| IoSlice::new(b)));

        let mut n = match f.write_vectored(&slices) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "vectored write returned zero bytes",
                ))
            }
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        while n > 0 && index < bufs.len() {
            let left = bufs[index].len() - skip;
            if n >= left {
                n -= left;
                index += 1;
                skip = 0;
            } else {
                skip += n;
                n = 0;
            }
        }
    }
    Ok(())
}
