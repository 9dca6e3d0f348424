use std::cell;
use std::collections;
use std::fs;
use std::io;
use std::path;
use std::rc;

/// # File system interface
///
/// This is the OS interface the block store uses to create, open and set aside swap files.
///
/// See: <https://www.sqlite.org/c3ref/vfs.html>
pub trait FileSystem {
  /// The type of paths that this file system uses.
  type Path: ?Sized;

  /// The type of files that this file system uses.
  type File: File;

  /// Opens a file at the given `path`, creating it if it does not exist.
  fn open(&mut self, path: &Self::Path) -> io::Result<Self::File>;

  /// Deletes the file at the given `path`.
  fn delete(&mut self, path: &Self::Path) -> io::Result<()>;

  /// Moves the file at `path` out of the way so that a fresh file can be created in its place.
  ///
  /// The file is kept under an unused sibling name ending in `.corrupt`, for manual recovery.
  fn quarantine(&mut self, path: &Self::Path) -> io::Result<()>;
}

/// # File interface
///
/// This is the OS interface the block store uses to read and write pages of a swap file.
///
/// See: <https://www.sqlite.org/c3ref/io_methods.html>
pub trait File {
  /// Returns the size of the file in bytes.
  fn size(&mut self) -> io::Result<u64>;

  /// Sets the size of the file in bytes.
  fn truncate(&mut self, size: u64) -> io::Result<()>;

  /// Fills `buf` with bytes read from the file at the given `offset`.
  fn read(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()>;

  /// Writes `buf` to the file at the given `offset`.
  fn write(&mut self, offset: u64, buf: &[u8]) -> io::Result<()>;

  /// Flushes any buffered data to the file.
  fn sync(&mut self) -> io::Result<()>;

  /// Tries locking the file exclusively.
  fn try_lock(&mut self) -> io::Result<()>;

  /// Unlocks the file.
  fn unlock(&mut self) -> io::Result<()>;
}

/// # The primary implementation for [`FileSystem`]
///
/// This is simply a wrapper around [`std::fs`].
#[derive(Debug, Default)]
pub struct StandardFileSystem;

impl FileSystem for StandardFileSystem {
  type Path = path::Path;
  type File = StandardFile;

  fn open(&mut self, path: &Self::Path) -> io::Result<Self::File> {
    let file = fs::OpenOptions::new().read(true).write(true).create(true).truncate(false).open(path)?;
    Ok(Self::File::from(file))
  }

  fn delete(&mut self, path: &Self::Path) -> io::Result<()> {
    fs::remove_file(path)
  }

  fn quarantine(&mut self, path: &Self::Path) -> io::Result<()> {
    let mut name = path.as_os_str().to_owned();
    name.push(".corrupt");
    let mut target = path::PathBuf::from(&name);
    let mut n = 1;
    while target.exists() {
      let mut numbered = name.clone();
      numbered.push(format!(".{n}"));
      target = path::PathBuf::from(numbered);
      n += 1;
    }
    fs::rename(path, target)
  }
}

/// # The primary implementation for [`File`]
///
/// This is simply a wrapper around [`std::fs::File`], with advisory locks from `fs2`.
#[derive(Debug)]
pub struct StandardFile(fs::File);

impl From<fs::File> for StandardFile {
  fn from(file: fs::File) -> Self {
    Self(file)
  }
}

impl File for StandardFile {
  fn size(&mut self) -> io::Result<u64> {
    let StandardFile(inner) = self;
    Ok(inner.metadata()?.len())
  }

  fn truncate(&mut self, size: u64) -> io::Result<()> {
    let StandardFile(inner) = self;
    fs::File::set_len(inner, size)
  }

  fn read(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
    let StandardFile(inner) = self;
    io::Seek::seek(inner, io::SeekFrom::Start(offset))?;
    io::Read::read_exact(inner, buf)
  }

  fn write(&mut self, offset: u64, buf: &[u8]) -> io::Result<()> {
    let StandardFile(inner) = self;
    io::Seek::seek(inner, io::SeekFrom::Start(offset))?;
    io::Write::write_all(inner, buf)
  }

  fn sync(&mut self) -> io::Result<()> {
    let StandardFile(inner) = self;
    fs::File::sync_all(inner)
  }

  fn try_lock(&mut self) -> io::Result<()> {
    let StandardFile(inner) = self;
    fs2::FileExt::try_lock_exclusive(inner)
  }

  fn unlock(&mut self) -> io::Result<()> {
    let StandardFile(inner) = self;
    fs2::FileExt::unlock(inner)
  }
}

#[derive(Debug, Default)]
struct MemoryFileData {
  data: Vec<u8>,
  locked: bool,
  fail_writes: bool,
  /// Writes that may still succeed before every later one fails.
  writes_left: Option<u64>,
}

type SharedData = rc::Rc<cell::RefCell<MemoryFileData>>;

/// In-memory implementation for [`FileSystem`]
///
/// Every handle opened on the same path shares one byte vector, so a test can keep a handle to a
/// swap file while a store owns another, inspect its bytes, or make its writes fail.
#[derive(Debug, Default)]
pub struct MemoryFileSystem {
  files: collections::HashMap<String, SharedData>,
}

impl MemoryFileSystem {
  /// Returns a copy of the current contents of the file at `path`.
  pub fn snapshot(&self, path: &str) -> Option<Vec<u8>> {
    self.files.get(path).map(|file| file.borrow().data.clone())
  }

  /// Replaces the contents of the file at `path`, creating it if needed.
  pub fn install(&mut self, path: &str, data: Vec<u8>) {
    self.files.entry(path.to_string()).or_default().borrow_mut().data = data;
  }

  /// Makes every subsequent write to the file at `path` fail (or succeed again).
  pub fn set_fail_writes(&mut self, path: &str, fail: bool) {
    let mut file = self.files.entry(path.to_string()).or_default().borrow_mut();
    file.fail_writes = fail;
    file.writes_left = None;
  }

  /// Lets the next `count` writes to the file at `path` through, then fails every later one, as if
  /// the process died at that point.
  pub fn fail_writes_after(&mut self, path: &str, count: u64) {
    self.files.entry(path.to_string()).or_default().borrow_mut().writes_left = Some(count);
  }

  pub fn exists(&self, path: &str) -> bool {
    self.files.contains_key(path)
  }
}

impl FileSystem for MemoryFileSystem {
  type Path = str;
  type File = MemoryFile;

  fn open(&mut self, path: &Self::Path) -> io::Result<Self::File> {
    let file = self.files.entry(path.to_string()).or_default();
    Ok(file.clone().into())
  }

  fn delete(&mut self, path: &Self::Path) -> io::Result<()> {
    let file = self.files.remove(path);
    file.map(|_| ()).ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, path.to_string()))
  }

  fn quarantine(&mut self, path: &Self::Path) -> io::Result<()> {
    let file = self.files.remove(path).ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, path.to_string()))?;
    let mut target = format!("{path}.corrupt");
    let mut n = 1;
    while self.files.contains_key(&target) {
      target = format!("{path}.corrupt.{n}");
      n += 1;
    }
    self.files.insert(target, file);
    Ok(())
  }
}

/// In-memory implementation for [`File`]
///
/// A lock taken through a handle is released when that handle is dropped, like a file descriptor
/// closing, so dropping a store without closing it behaves like a process kill.
#[derive(Debug)]
pub struct MemoryFile {
  file: SharedData,
  holds_lock: bool,
}

impl From<SharedData> for MemoryFile {
  fn from(file: SharedData) -> Self {
    MemoryFile { file, holds_lock: false }
  }
}

impl Drop for MemoryFile {
  fn drop(&mut self) {
    if self.holds_lock {
      self.file.borrow_mut().locked = false;
    }
  }
}

fn to_usize(x: u64) -> io::Result<usize> {
  usize::try_from(x).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
}

impl File for MemoryFile {
  fn size(&mut self) -> io::Result<u64> {
    Ok(self.file.borrow().data.len() as u64)
  }

  fn truncate(&mut self, size: u64) -> io::Result<()> {
    let size = to_usize(size)?;
    self.file.borrow_mut().data.resize(size, 0);
    Ok(())
  }

  fn read(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
    let offset = to_usize(offset)?;
    let file = self.file.borrow();
    if offset + buf.len() > file.data.len() {
      return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "read past end of file"));
    }
    buf.copy_from_slice(&file.data[offset..offset + buf.len()]);
    Ok(())
  }

  fn write(&mut self, offset: u64, buf: &[u8]) -> io::Result<()> {
    let offset = to_usize(offset)?;
    let mut file = self.file.borrow_mut();
    if file.fail_writes || file.writes_left == Some(0) {
      return Err(io::Error::new(io::ErrorKind::Other, "injected write failure"));
    }
    if let Some(left) = file.writes_left.as_mut() {
      *left -= 1;
    }
    if offset + buf.len() > file.data.len() {
      file.data.resize(offset + buf.len(), 0);
    }
    file.data[offset..offset + buf.len()].copy_from_slice(buf);
    Ok(())
  }

  fn sync(&mut self) -> io::Result<()> {
    Ok(())
  }

  fn try_lock(&mut self) -> io::Result<()> {
    let mut file = self.file.borrow_mut();
    if file.locked {
      Err(io::Error::new(io::ErrorKind::WouldBlock, "file is locked"))
    } else {
      file.locked = true;
      self.holds_lock = true;
      Ok(())
    }
  }

  fn unlock(&mut self) -> io::Result<()> {
    if !self.holds_lock {
      return Err(io::Error::new(io::ErrorKind::InvalidInput, "handle does not hold the lock"));
    }
    self.file.borrow_mut().locked = false;
    self.holds_lock = false;
    Ok(())
  }
}
