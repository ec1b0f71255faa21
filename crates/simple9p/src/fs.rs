//! Host filesystem operations behind the 9P requests.
//!
//! These are free functions over host paths. Paths handed in from fids are
//! relative to the exported root and joined with it through [`host_path`].

use {
    crate::{
        error::Ename,
        fcall::*,
        fid::{DirCursor, walk_step},
        res,
        serialize::Encodable,
        utils::Result,
    },
    filetime::FileTime,
    nix::{fcntl::OFlag, sys::stat::Mode},
    std::{
        ffi::OsString,
        fs::Metadata,
        io::SeekFrom,
        os::unix::fs::PermissionsExt,
        path::{Path, PathBuf},
    },
    tokio::{
        fs,
        io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt},
    },
    tokio_stream::{StreamExt, wrappers::ReadDirStream},
};

/// Join a root-relative path onto the exported root
pub fn host_path(root: &Path, path: &Path) -> PathBuf {
    if path.as_os_str().is_empty() {
        root.to_path_buf()
    } else {
        root.join(path)
    }
}

pub async fn metadata(path: &Path) -> Result<Metadata> {
    Ok(fs::metadata(path).await?)
}

/// Names in a directory, sorted, without `.` and `..`
pub async fn list_directory(dir: &Path) -> Result<Vec<OsString>> {
    let mut entries = ReadDirStream::new(fs::read_dir(dir).await?);

    let mut names = Vec::new();
    while let Some(entry) = entries.next().await {
        names.push(entry?.file_name());
    }
    names.sort();
    Ok(names)
}

/// A name a client may give to a new or renamed file
fn is_plain_name(name: &str) -> bool {
    !matches!(name, "" | "." | "..") && !name.contains(['/', '\0'])
}

/// Name a root-relative path reports in its stat record; `/` for the root
pub fn stat_name(path: &Path) -> String {
    match path.file_name() {
        Some(name) => name.to_string_lossy().into_owned(),
        None => "/".to_owned(),
    }
}

/// Stat record of the file at `path` under `root`
pub async fn stat(root: &Path, path: &Path) -> Result<Stat> {
    let attr = metadata(&host_path(root, path)).await?;
    Ok(Stat::from_attr(&stat_name(path), &attr))
}

/// Resolve `name` against `path`, returning the new path and its qid
pub async fn walk(root: &Path, path: &Path, name: &str) -> Result<(PathBuf, QId)> {
    let next = walk_step(path, name)?;
    let attr = metadata(&host_path(root, &next)).await?;
    Ok((next, QId::from(&attr)))
}

/// Create `name` inside the host directory `dir`.
///
/// Directories are made with `mkdir` and come back without a descriptor;
/// regular files are created exclusively and opened with `mode`.
pub async fn create(dir: &Path, name: &str, perm: u32, mode: u8) -> Result<(PathBuf, Option<fs::File>)> {
    if !is_plain_name(name) {
        return res!(Ename::Inval);
    }

    let path = dir.join(name);
    let omode = Mode::from_bits_truncate(perm & dm::PERM);

    if perm & dm::DIR != 0 {
        nix::unistd::mkdir(&path, omode)?;
        return Ok((path, None));
    }

    let mut oflags = OFlag::O_CREAT | OFlag::O_EXCL;
    oflags |= match om::access(mode) {
        om::WRITE => OFlag::O_WRONLY,
        om::RDWR => OFlag::O_RDWR,
        _ => OFlag::O_RDONLY,
    };
    if mode & om::TRUNC != 0 {
        oflags |= OFlag::O_TRUNC;
    }

    let fd = nix::fcntl::open(&path, oflags, omode)?;
    Ok((path, Some(fs::File::from_std(fd.into()))))
}

/// Read up to `count` bytes at `offset`; short only at end of file
pub async fn read(file: &mut fs::File, offset: u64, count: u32) -> Result<Vec<u8>> {
    file.seek(SeekFrom::Start(offset)).await?;

    let mut buf = Vec::with_capacity(count as usize);
    file.take(count as u64).read_to_end(&mut buf).await?;
    Ok(buf)
}

/// Write all of `data` at `offset`
pub async fn write(file: &mut fs::File, offset: u64, data: &[u8]) -> Result<u32> {
    file.seek(SeekFrom::Start(offset)).await?;
    file.write_all(data).await?;
    file.flush().await?;
    Ok(data.len() as u32)
}

/// Pack stat records of the entries in `dir` into at most `max` bytes.
///
/// Offset 0 rewinds and takes a fresh snapshot of the directory. Any other
/// offset must be where the previous read left off. Entries that vanish
/// between the snapshot and the read are skipped, and so are names a 9P
/// string cannot carry (not UTF-8, or longer than `MAXSTRLEN`).
pub async fn read_directory(dir: &Path, cursor: &mut DirCursor, offset: u64, max: u32) -> Result<Vec<u8>> {
    if offset == 0 {
        *cursor = DirCursor::snapshot(dir).await?;
    } else if offset != cursor.offset {
        return res!(Ename::BadOffset);
    }

    let mut buf = Vec::new();
    while let Some(name) = cursor.names.get(cursor.next) {
        let entry = match name.to_str() {
            Some(name) if name.len() <= MAXSTRLEN => fs::metadata(dir.join(name)).await.ok().map(|attr| (name, attr)),
            _ => None,
        };
        let Some((name, attr)) = entry else {
            cursor.next += 1;
            continue;
        };

        let stat = Stat::from_attr(name, &attr);
        if buf.len() + stat.size() as usize + 2 > max as usize {
            break;
        }
        stat.encode(&mut buf)?;
        cursor.next += 1;
    }

    cursor.offset += buf.len() as u64;
    Ok(buf)
}

/// Remove a file or an empty directory
pub async fn remove(path: &Path) -> Result<()> {
    let attr = fs::symlink_metadata(path).await?;
    if attr.is_dir() {
        fs::remove_dir(path).await?;
    } else {
        fs::remove_file(path).await?;
    }
    Ok(())
}

/// Apply the touched fields of `stat` to the file at `path` under `root`.
///
/// Every field is checked before any is applied, so a refused request
/// leaves the file as it was. Returns the file's root-relative path, which
/// differs from `path` after a rename.
pub async fn wstat(root: &Path, path: &Path, stat: &Stat) -> Result<PathBuf> {
    let host = host_path(root, path);
    let attr = metadata(&host).await?;

    if stat.length != !0 && attr.is_dir() {
        return res!(Ename::NoWstat);
    }
    if stat.mode != !0 && (stat.mode & dm::DIR != 0) != attr.is_dir() {
        return res!(Ename::NoWstat);
    }

    let renamed = match path.file_name() {
        _ if stat.name.is_empty() => None,
        Some(old) if *old == *stat.name => None,
        Some(_) if is_plain_name(&stat.name) => {
            let to = path.with_file_name(&stat.name);
            let target = host_path(root, &to);
            if fs::symlink_metadata(&target).await.is_ok() {
                return res!(Ename::NoWstat);
            }
            Some((to, target))
        }
        _ => return res!(Ename::NoWstat),
    };

    if stat.length != !0 {
        let file = fs::OpenOptions::new().write(true).open(&host).await?;
        file.set_len(stat.length).await?;
    }

    if stat.mode != !0 {
        fs::set_permissions(&host, PermissionsExt::from_mode(stat.mode & dm::PERM)).await?;
    }

    if stat.atime != !0 || stat.mtime != !0 {
        let atime = if stat.atime != !0 {
            FileTime::from_unix_time(stat.atime as i64, 0)
        } else {
            FileTime::from_last_access_time(&attr)
        };
        let mtime = if stat.mtime != !0 {
            FileTime::from_unix_time(stat.mtime as i64, 0)
        } else {
            FileTime::from_last_modification_time(&attr)
        };
        filetime::set_file_times(&host, atime, mtime)?;
    }

    match renamed {
        Some((to, target)) => {
            fs::rename(&host, target).await?;
            Ok(to)
        }
        None => Ok(path.to_path_buf()),
    }
}
