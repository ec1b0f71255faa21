//! Server-side state bound to client-chosen fids.
//!
//! Every fid names a location relative to the exported root. Paths never
//! contain `..` or absolute components, so no fid can name anything outside
//! the tree.

use {
    crate::{error::Ename, fcall::*, fs as hostfs, res, utils::Result},
    nix::{fcntl::OFlag, sys::stat::Mode},
    std::{
        collections::{HashMap, hash_map::Entry},
        ffi::OsString,
        fs::Metadata,
        path::{Path, PathBuf},
    },
    tokio::fs,
};

/// Snapshot of a directory being read through an open fid
#[derive(Debug, Default)]
pub struct DirCursor {
    /// Entry names, sorted, without `.` and `..`
    pub names: Vec<OsString>,
    /// Index of the next entry to emit
    pub next: usize,
    /// Byte offset a resuming read must present
    pub offset: u64,
}

impl DirCursor {
    pub async fn snapshot(dir: &Path) -> Result<DirCursor> {
        Ok(DirCursor {
            names: hostfs::list_directory(dir).await?,
            next: 0,
            offset: 0,
        })
    }
}

/// What an open fid reads from or writes to
#[derive(Debug)]
pub enum Handle {
    File(fs::File),
    Dir(DirCursor),
}

/// Resolve one walk component against `path`.
///
/// `..` stops at the root and an empty name or `.` stays put.
pub fn walk_step(path: &Path, name: &str) -> Result<PathBuf> {
    match name {
        "" | "." => Ok(path.to_path_buf()),
        ".." => Ok(path.parent().map(Path::to_path_buf).unwrap_or_default()),
        _ if name.contains(['/', '\0']) => res!(Ename::Inval),
        _ => Ok(path.join(name)),
    }
}

/// Host open flags for a 9P open mode
fn open_flags(mode: u8) -> OFlag {
    let mut flags = match om::access(mode) {
        om::WRITE => OFlag::O_WRONLY,
        om::RDWR => OFlag::O_RDWR,
        _ => OFlag::O_RDONLY,
    };
    if mode & om::TRUNC != 0 {
        flags |= OFlag::O_TRUNC;
    }
    flags
}

#[derive(Debug)]
pub struct Fid {
    fid: u32,
    path: PathBuf,
    handle: Option<Handle>,
    attr: Option<Metadata>,
    mode: Option<u8>,
    refs: u32,
}

impl Fid {
    fn new(fid: u32, path: PathBuf) -> Fid {
        Fid {
            fid,
            path,
            handle: None,
            attr: None,
            mode: None,
            refs: 1,
        }
    }

    pub fn fid(&self) -> u32 {
        self.fid
    }

    /// Location relative to the exported root; empty for the root itself
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn host_path(&self, root: &Path) -> PathBuf {
        hostfs::host_path(root, &self.path)
    }

    pub fn is_root(&self) -> bool {
        self.path.as_os_str().is_empty()
    }

    pub fn is_open(&self) -> bool {
        self.handle.is_some()
    }

    /// Mode given to open or create, if the fid is open
    pub fn mode(&self) -> Option<u8> {
        self.mode
    }

    pub fn handle_mut(&mut self) -> Option<&mut Handle> {
        self.handle.as_mut()
    }

    pub fn attr(&self) -> Option<&Metadata> {
        self.attr.as_ref()
    }

    pub fn is_dir(&self) -> bool {
        self.attr.as_ref().is_some_and(Metadata::is_dir)
    }

    pub fn refs(&self) -> u32 {
        self.refs
    }

    /// Qid from the cached metadata; call [`Fid::refresh`] first if it may be stale
    pub fn qid(&self) -> Option<QId> {
        self.attr.as_ref().map(QId::from)
    }

    /// Drop cached metadata after the host object may have changed
    pub fn invalidate(&mut self) {
        self.attr = None;
    }

    /// Re-read host metadata, returning the fresh qid
    pub async fn refresh(&mut self, root: &Path) -> Result<QId> {
        let attr = hostfs::metadata(&self.host_path(root)).await?;
        let qid = QId::from(&attr);
        self.attr = Some(attr);
        Ok(qid)
    }

    /// Follow the file to a new name, keeping any open handle
    pub fn set_path(&mut self, path: PathBuf) {
        self.path = path;
    }

    /// Point the fid somewhere else, closing anything it had open
    pub fn retarget(&mut self, path: PathBuf) {
        self.path = path;
        self.close();
    }

    /// Close any open handle, leaving the fid bound to its path
    pub fn close(&mut self) {
        self.handle = None;
        self.mode = None;
        self.attr = None;
    }

    /// Open the fid for I/O.
    ///
    /// Directories only open for reading and get a cursor instead of a descriptor.
    pub async fn open(&mut self, root: &Path, mode: u8) -> Result<QId> {
        if self.is_open() {
            return res!(Ename::Botch);
        }

        let qid = self.refresh(root).await?;
        let host = self.host_path(root);

        let handle = if self.is_dir() {
            if om::access(mode) != om::READ || mode & om::TRUNC != 0 {
                return res!(Ename::IsDir);
            }
            Handle::Dir(DirCursor::snapshot(&host).await?)
        } else {
            let fd = nix::fcntl::open(&host, open_flags(mode), Mode::empty())?;
            Handle::File(fs::File::from_std(fd.into()))
        };

        self.handle = Some(handle);
        self.mode = Some(mode);

        // Truncation changes length and mtime
        if mode & om::TRUNC != 0 {
            return self.refresh(root).await;
        }
        Ok(qid)
    }

    /// Adopt a descriptor opened by create
    pub fn bind(&mut self, file: fs::File, mode: u8) {
        self.handle = Some(Handle::File(file));
        self.mode = Some(mode);
    }

    /// Whether destroying this fid should remove its file
    pub fn remove_on_close(&self) -> bool {
        self.mode.is_some_and(|m| m & om::RCLOSE != 0)
    }
}

/// Live fids of one session, keyed by the client's number
#[derive(Debug, Default)]
pub struct FidTable {
    fids: HashMap<u32, Fid>,
}

impl FidTable {
    pub fn new() -> FidTable {
        Default::default()
    }

    /// Bind `fid` to `path`, failing if the number is taken
    pub fn create(&mut self, fid: u32, path: PathBuf) -> Result<&mut Fid> {
        match self.fids.entry(fid) {
            Entry::Occupied(_) => res!(Ename::DupFid),
            Entry::Vacant(slot) => Ok(slot.insert(Fid::new(fid, path))),
        }
    }

    pub fn find(&self, fid: u32) -> Option<&Fid> {
        self.fids.get(&fid)
    }

    pub fn find_mut(&mut self, fid: u32) -> Option<&mut Fid> {
        self.fids.get_mut(&fid)
    }

    /// Like [`FidTable::find_mut`], but an absent fid is an error
    pub fn get_mut(&mut self, fid: u32) -> Result<&mut Fid> {
        self.fids.get_mut(&fid).ok_or(Ename::UnknownFid.into())
    }

    pub fn contains(&self, fid: u32) -> bool {
        self.fids.contains_key(&fid)
    }

    pub fn retain(&mut self, fid: u32) -> Result<()> {
        let f = self.get_mut(fid)?;
        f.refs += 1;
        Ok(())
    }

    /// Drop one reference, handing back the fid once nothing holds it.
    ///
    /// The returned fid is out of the table; dropping it closes its handle.
    pub fn release(&mut self, fid: u32) -> Option<Fid> {
        let f = self.fids.get_mut(&fid)?;
        f.refs = f.refs.saturating_sub(1);
        if f.refs > 0 {
            return None;
        }
        self.fids.remove(&fid)
    }

    /// Take a fid out regardless of its reference count
    pub fn remove(&mut self, fid: u32) -> Option<Fid> {
        self.fids.remove(&fid)
    }

    /// Forget every fid, closing all handles
    pub fn destroy_all(&mut self) {
        self.fids.clear();
    }

    pub fn len(&self) -> usize {
        self.fids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fids.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn walk_step_stays_inside_root() {
        let root = PathBuf::new();
        assert_eq!(walk_step(&root, "..").unwrap(), root);
        assert_eq!(walk_step(&root, "").unwrap(), root);

        let a = walk_step(&root, "a").unwrap();
        let ab = walk_step(&a, "b").unwrap();
        assert_eq!(ab, Path::new("a/b"));
        assert_eq!(walk_step(&ab, ".").unwrap(), ab);
        assert_eq!(walk_step(&ab, "..").unwrap(), a);
        assert_eq!(walk_step(&a, "..").unwrap(), root);
    }

    #[test]
    fn walk_step_rejects_separators() {
        let root = PathBuf::new();
        for name in ["a/b", "/etc", "x\0y"] {
            let e = walk_step(&root, name).unwrap_err();
            assert_eq!(e.ename(), Ename::Inval);
        }
    }

    #[test]
    fn duplicate_fids_leave_table_unchanged() {
        let mut table = FidTable::new();
        table.create(1, PathBuf::from("a")).unwrap();

        let e = table.create(1, PathBuf::from("b")).unwrap_err();
        assert_eq!(e.ename(), Ename::DupFid);
        assert_eq!(table.len(), 1);
        assert_eq!(table.find(1).unwrap().path(), Path::new("a"));
    }

    #[test]
    fn release_destroys_at_zero() {
        let mut table = FidTable::new();
        table.create(7, PathBuf::new()).unwrap();
        table.retain(7).unwrap();
        assert_eq!(table.find(7).unwrap().refs(), 2);

        assert!(table.release(7).is_none());
        assert!(table.contains(7));
        assert_eq!(table.release(7).unwrap().fid(), 7);
        assert!(!table.contains(7));
        assert!(table.release(7).is_none());
    }

    #[test]
    fn destroy_all_empties_table() {
        let mut table = FidTable::new();
        for fid in 0..4 {
            table.create(fid, PathBuf::new()).unwrap();
        }
        table.destroy_all();
        assert!(table.is_empty());
        assert!(table.find(0).is_none());
    }

    #[test]
    fn open_flags_follow_access_mode() {
        assert_eq!(open_flags(om::READ), OFlag::O_RDONLY);
        assert_eq!(open_flags(om::EXEC), OFlag::O_RDONLY);
        assert_eq!(open_flags(om::WRITE), OFlag::O_WRONLY);
        assert_eq!(open_flags(om::RDWR | om::TRUNC), OFlag::O_RDWR | OFlag::O_TRUNC);
        assert_eq!(open_flags(om::READ | om::RCLOSE), OFlag::O_RDONLY);
    }

    #[tokio::test]
    async fn directories_open_read_only() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f"), b"data").unwrap();

        let mut table = FidTable::new();
        let root = table.create(0, PathBuf::new()).unwrap();
        let e = root.open(dir.path(), om::WRITE).await.unwrap_err();
        assert_eq!(e.ename(), Ename::IsDir);
        assert!(!root.is_open());

        root.open(dir.path(), om::READ).await.unwrap();
        match root.handle_mut() {
            Some(Handle::Dir(cursor)) => assert_eq!(cursor.names, vec![OsString::from("f")]),
            other => panic!("unexpected handle {:?}", other),
        }

        let e = root.open(dir.path(), om::READ).await.unwrap_err();
        assert_eq!(e.ename(), Ename::Botch);
    }

    #[tokio::test]
    async fn truncating_open_refreshes_metadata() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f"), b"data").unwrap();

        let mut table = FidTable::new();
        let f = table.create(1, PathBuf::from("f")).unwrap();
        f.refresh(dir.path()).await.unwrap();
        assert_eq!(f.attr().unwrap().len(), 4);

        f.open(dir.path(), om::WRITE | om::TRUNC).await.unwrap();
        assert_eq!(f.attr().unwrap().len(), 0);
        assert_eq!(f.mode(), Some(om::WRITE | om::TRUNC));
    }
}
