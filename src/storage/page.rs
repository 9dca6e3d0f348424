//! # Page layouts
//!
//! Every page of a swap file has the same size, fixed when the file is created. The page at offset
//! 0 is the header; page `k >= 1` lives at offset `page_size * k` and starts with a one-byte kind
//! discriminant. All integers are little-endian.
//!
//! ```text
//! Header (slot 0)
//! Offset  Size  Field
//! 0       4     magic "SWLN"
//! 4       2     format version
//! 6       4     page size
//! 10      8     root block id (signed)
//! 18      8     total line count
//! 26      8     free-list head id (signed, 0 = empty)
//! 34      1     dirty-since-last-sync marker
//! 35      ...   zero padding to page size
//!
//! Pointer page                         Data page
//! 0   1   kind = 1                     0   1   kind = 2
//! 4   4   entry count                  4   4   line count
//! 8   16n (line count u64,             8   4   text start
//!          child id i64) per entry     12  8n  (offset u32, length u32) per line
//!                                      ... free space ...
//!                                      text start .. page end: line bytes, line 0 highest
//!
//! Free-list trunk page
//! 0   1   kind = 3
//! 4   8   next trunk id (0 = none)
//! 12  4   number of listed slots
//! 16  ... prefix-varint slot numbers
//! ```

use crate::encoding::prefix_varint;
use crate::error::{Error, Result};
use std::collections;
use std::fmt;
use std::mem;
use std::ops;
use zerocopy::little_endian::{I64, U16, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

pub const MAGIC: [u8; 4] = *b"SWLN";
pub const VERSION: u16 = 1;
pub const HEADER_LEN: usize = mem::size_of::<RawHeader>();

pub const DATA_HEADER: usize = mem::size_of::<DataHead>();
pub const DATA_SLOT: usize = mem::size_of::<LineSlot>();
pub const POINTER_HEADER: usize = mem::size_of::<PointerHead>();
pub const POINTER_SLOT: usize = mem::size_of::<RawEntry>();
pub const TRUNK_HEADER: usize = mem::size_of::<TrunkHead>();

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct RawHeader {
  magic: [u8; 4],
  version: U16,
  page_size: U32,
  root: I64,
  line_count: U64,
  free_head: I64,
  dirty: u8,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct DataHead {
  kind: u8,
  _pad: [u8; 3],
  count: U32,
  text_start: U32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct LineSlot {
  offset: U32,
  len: U32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct PointerHead {
  kind: u8,
  _pad: [u8; 3],
  count: U32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct RawEntry {
  line_count: U64,
  child: I64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct TrunkHead {
  kind: u8,
  _pad: [u8; 3],
  next: I64,
  count: U32,
}

const _: () = assert!(mem::size_of::<RawHeader>() == 35);
const _: () = assert!(mem::size_of::<DataHead>() == 12);
const _: () = assert!(mem::size_of::<LineSlot>() == 8);
const _: () = assert!(mem::size_of::<PointerHead>() == 8);
const _: () = assert!(mem::size_of::<RawEntry>() == 16);
const _: () = assert!(mem::size_of::<TrunkHead>() == 16);

/// Borrows a `T` laid over `buf` at byte `at`.
///
/// Panics if the struct runs past the end of the page, like an out-of-bounds slice index.
fn view<T: FromBytes + KnownLayout + Immutable + Unaligned>(buf: &[u8], at: usize) -> &T {
  match T::ref_from_prefix(&buf[at..]) {
    Ok((value, _)) => value,
    Err(_) => panic!("{} bytes at offset {at} overrun a {}-byte page", mem::size_of::<T>(), buf.len()),
  }
}

fn view_mut<T: FromBytes + IntoBytes + KnownLayout + Unaligned>(buf: &mut [u8], at: usize) -> &mut T {
  let len = buf.len();
  match T::mut_from_prefix(&mut buf[at..]) {
    Ok((value, _)) => value,
    Err(_) => panic!("{} bytes at offset {at} overrun a {len}-byte page", mem::size_of::<T>()),
  }
}

/// # Block identifier
///
/// Blocks created since the last sync have no file position yet; they carry a `Pending` token
/// local to the store that created them. `sync` promotes them to `Assigned` file slots and rewrites
/// every pointer entry that mentioned the token.
///
/// On a page, pending ids are stored as negative numbers and assigned ids as positive ones. Slot 0
/// is the header, so `Assigned(0)` never names a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BlockId {
  Pending(u64),
  Assigned(u64),
}

impl BlockId {
  pub fn to_raw(self) -> i64 {
    match self {
      BlockId::Pending(token) => -(token as i64),
      BlockId::Assigned(slot) => slot as i64,
    }
  }

  pub fn from_raw(raw: i64) -> Self {
    if raw < 0 {
      BlockId::Pending(raw.unsigned_abs())
    } else {
      BlockId::Assigned(raw as u64)
    }
  }

  /// Returns the file slot, if one has been assigned.
  pub fn slot(self) -> Option<u64> {
    match self {
      BlockId::Pending(_) => None,
      BlockId::Assigned(slot) => Some(slot),
    }
  }
}

impl fmt::Display for BlockId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.to_raw())
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum BlockKind {
  Pointer = 1,
  Data = 2,
  Free = 3,
}

impl TryFrom<u8> for BlockKind {
  type Error = String;

  fn try_from(byte: u8) -> std::result::Result<Self, Self::Error> {
    match byte {
      1 => Ok(BlockKind::Pointer),
      2 => Ok(BlockKind::Data),
      3 => Ok(BlockKind::Free),
      other => Err(format!("unknown block kind {other}")),
    }
  }
}

/// # Header block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
  pub page_size: u32,
  pub root: Option<BlockId>,
  pub line_count: u64,
  pub free_head: Option<u64>,
  pub dirty: bool,
}

impl Header {
  pub fn fresh(page_size: usize) -> Self {
    Header { page_size: page_size as u32, root: None, line_count: 0, free_head: None, dirty: false }
  }

  /// Whether `other` describes the same tree and free list, ignoring the dirty marker.
  pub fn same_state(&self, other: &Header) -> bool {
    self.root == other.root && self.line_count == other.line_count && self.free_head == other.free_head
  }

  pub fn encode(&self, buf: &mut [u8]) {
    let raw = RawHeader {
      magic: MAGIC,
      version: U16::new(VERSION),
      page_size: U32::new(self.page_size),
      root: I64::new(self.root.map_or(0, BlockId::to_raw)),
      line_count: U64::new(self.line_count),
      free_head: I64::new(self.free_head.map_or(0, |slot| slot as i64)),
      dirty: u8::from(self.dirty),
    };
    buf.fill(0);
    buf[..HEADER_LEN].copy_from_slice(raw.as_bytes());
  }

  /// Decodes the first [`HEADER_LEN`] bytes of a swap file.
  ///
  /// # Errors
  ///
  /// [`Error::FormatMismatch`] for a wrong magic or version, [`Error::Corrupt`] for impossible
  /// field values.
  pub fn decode(buf: &[u8]) -> Result<Self> {
    if buf.len() < HEADER_LEN {
      return Err(Error::Corrupt(format!("header truncated to {} bytes", buf.len())));
    }
    let raw: &RawHeader = view(buf, 0);
    if raw.magic != MAGIC {
      return Err(Error::FormatMismatch(format!("bad magic {:02x?}", raw.magic)));
    }
    let version = raw.version.get();
    if version != VERSION {
      return Err(Error::FormatMismatch(format!("unsupported format version {version}")));
    }
    let page_size = raw.page_size.get();
    crate::config::validate_page_size(page_size as usize)
      .map_err(|_| Error::Corrupt(format!("header records invalid page size {page_size}")))?;
    let root = match BlockId::from_raw(raw.root.get()) {
      BlockId::Assigned(0) => None,
      BlockId::Assigned(slot) => Some(BlockId::Assigned(slot)),
      BlockId::Pending(_) => return Err(Error::Corrupt("header root has no file slot".into())),
    };
    let free_head = match raw.free_head.get() {
      0 => None,
      raw if raw > 0 => Some(raw as u64),
      raw => return Err(Error::Corrupt(format!("invalid free-list head {raw}"))),
    };
    let dirty = match raw.dirty {
      0 => false,
      1 => true,
      other => return Err(Error::Corrupt(format!("invalid dirty marker {other}"))),
    };
    Ok(Header { page_size, root, line_count: raw.line_count.get(), free_head, dirty })
  }
}

/// Writes an empty page of the given kind.
pub fn init(kind: BlockKind, buf: &mut [u8]) {
  buf.fill(0);
  buf[0] = kind as u8;
  if kind == BlockKind::Data {
    let end = buf.len() as u32;
    view_mut::<DataHead>(buf, 0).text_start.set(end);
  }
}

/// Checks the structure of a page read back from disk and returns its kind.
pub fn validate(buf: &[u8]) -> std::result::Result<BlockKind, String> {
  let kind = BlockKind::try_from(buf[0])?;
  match kind {
    BlockKind::Pointer => PointerPage::new(buf).validate()?,
    BlockKind::Data => DataPage::new(buf).validate()?,
    BlockKind::Free => {
      let count = view::<TrunkHead>(buf, 0).count.get() as usize;
      if count > buf.len() - TRUNK_HEADER {
        return Err(format!("trunk lists {count} slots"));
      }
    }
  }
  Ok(kind)
}

pub fn kind_of(buf: &[u8]) -> Option<BlockKind> {
  BlockKind::try_from(buf[0]).ok()
}

/// Largest line that fits alone in a data page.
pub fn max_line_len(page_size: usize) -> usize {
  page_size - DATA_HEADER - DATA_SLOT
}

/// Bytes available for slots and text in a data page.
pub fn data_capacity(page_size: usize) -> usize {
  page_size - DATA_HEADER
}

/// Number of entries that fit in a pointer page.
pub fn pointer_capacity(page_size: usize) -> usize {
  (page_size - POINTER_HEADER) / POINTER_SLOT
}

/// Bytes a line costs in a data page: its text and its slot.
pub fn line_cost(len: usize) -> usize {
  len + DATA_SLOT
}

/// # Data page view
///
/// Holds a run of whole lines. Slots grow up from the page header, text grows down from the page
/// end, and the text of line `i` sits directly below the text of line `i - 1`.
#[derive(Debug, Clone, Copy)]
pub struct DataPage<'a> {
  buf: &'a [u8],
}

impl<'a> DataPage<'a> {
  pub fn new(buf: &'a [u8]) -> Self {
    DataPage { buf }
  }

  fn head(&self) -> &'a DataHead {
    view(self.buf, 0)
  }

  pub fn len(&self) -> usize {
    self.head().count.get() as usize
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  fn text_start(&self) -> usize {
    self.head().text_start.get() as usize
  }

  fn slot(&self, i: usize) -> (usize, usize) {
    let slot: &LineSlot = view(self.buf, DATA_HEADER + i * DATA_SLOT);
    (slot.offset.get() as usize, slot.len.get() as usize)
  }

  /// Byte range of line `i` within the page.
  pub fn range(&self, i: usize) -> ops::Range<usize> {
    let (offset, len) = self.slot(i);
    offset..offset + len
  }

  pub fn line(&self, i: usize) -> &'a [u8] {
    &self.buf[self.range(i)]
  }

  pub fn lines(&self) -> impl Iterator<Item = &'a [u8]> {
    let page = *self;
    (0..page.len()).map(move |i| page.line(i))
  }

  pub fn free_space(&self) -> usize {
    self.text_start() - (DATA_HEADER + self.len() * DATA_SLOT)
  }

  /// Bytes taken by slots and text.
  pub fn used(&self) -> usize {
    data_capacity(self.buf.len()) - self.free_space()
  }

  pub fn fits(&self, len: usize) -> bool {
    line_cost(len) <= self.free_space()
  }

  /// Whether line `i` can be resized to `len` bytes without leaving the page.
  pub fn fits_resized(&self, i: usize, len: usize) -> bool {
    let (_, old) = self.slot(i);
    len <= old || len - old <= self.free_space()
  }

  pub fn validate(&self) -> std::result::Result<(), String> {
    if self.head().kind != BlockKind::Data as u8 {
      return Err(format!("kind byte {} on a data page", self.head().kind));
    }
    let size = self.buf.len();
    let count = self.len();
    let text_start = self.text_start();
    if DATA_HEADER + count * DATA_SLOT > size || text_start > size || text_start < DATA_HEADER + count * DATA_SLOT {
      return Err(format!("data page with {count} lines and text start {text_start} overflows"));
    }
    let mut top = size;
    for i in 0..count {
      let (offset, len) = self.slot(i);
      if offset + len != top || offset < text_start {
        return Err(format!("line {i} at {offset}+{len} breaks the text layout"));
      }
      top = offset;
    }
    if top != text_start {
      return Err(format!("text start {text_start} does not match the last line at {top}"));
    }
    Ok(())
  }
}

/// # Mutable data page view
#[derive(Debug)]
pub struct DataPageMut<'a> {
  buf: &'a mut [u8],
}

impl<'a> DataPageMut<'a> {
  pub fn new(buf: &'a mut [u8]) -> Self {
    DataPageMut { buf }
  }

  pub fn as_ref(&self) -> DataPage<'_> {
    DataPage::new(self.buf)
  }

  fn head_mut(&mut self) -> &mut DataHead {
    view_mut(self.buf, 0)
  }

  fn set_len(&mut self, count: usize) {
    self.head_mut().count.set(count as u32);
  }

  fn set_text_start(&mut self, at: usize) {
    self.head_mut().text_start.set(at as u32);
  }

  fn set_slot(&mut self, i: usize, offset: usize, len: usize) {
    *view_mut(self.buf, DATA_HEADER + i * DATA_SLOT) = LineSlot { offset: U32::new(offset as u32), len: U32::new(len as u32) };
  }

  /// Moves the slot offsets of lines `from..to` by `up - down` bytes.
  fn shift_slots(&mut self, from: usize, to: usize, up: usize, down: usize) {
    for j in from..to {
      let (offset, len) = self.as_ref().slot(j);
      self.set_slot(j, offset + up - down, len);
    }
  }

  /// Inserts `bytes` as line `i`. Returns `false`, leaving the page untouched, if it does not fit.
  pub fn insert(&mut self, i: usize, bytes: &[u8]) -> bool {
    let page = self.as_ref();
    let count = page.len();
    if i > count || !page.fits(bytes.len()) {
      return false;
    }
    let text_start = page.text_start();
    let top = if i == 0 { self.buf.len() } else { page.slot(i - 1).0 };
    let len = bytes.len();

    self.buf.copy_within(text_start..top, text_start - len);
    self.buf[top - len..top].copy_from_slice(bytes);
    let slots = DATA_HEADER + i * DATA_SLOT..DATA_HEADER + count * DATA_SLOT;
    self.buf.copy_within(slots.clone(), slots.start + DATA_SLOT);
    self.set_slot(i, top - len, len);
    self.shift_slots(i + 1, count + 1, 0, len);
    self.set_len(count + 1);
    self.set_text_start(text_start - len);
    true
  }

  /// Appends `bytes` as the last line. Returns `false` if it does not fit.
  pub fn push(&mut self, bytes: &[u8]) -> bool {
    let count = self.as_ref().len();
    self.insert(count, bytes)
  }

  /// Removes line `i`.
  pub fn remove(&mut self, i: usize) {
    let page = self.as_ref();
    let count = page.len();
    let text_start = page.text_start();
    let (offset, len) = page.slot(i);

    self.buf.copy_within(text_start..offset, text_start + len);
    let slots = DATA_HEADER + (i + 1) * DATA_SLOT..DATA_HEADER + count * DATA_SLOT;
    self.buf.copy_within(slots.clone(), slots.start - DATA_SLOT);
    self.shift_slots(i, count - 1, len, 0);
    self.set_len(count - 1);
    self.set_text_start(text_start + len);
  }

  /// Overwrites line `i` with `bytes`. Returns `false`, leaving the page untouched, if the new
  /// content does not fit.
  pub fn replace(&mut self, i: usize, bytes: &[u8]) -> bool {
    let page = self.as_ref();
    if !page.fits_resized(i, bytes.len()) {
      return false;
    }
    let count = page.len();
    let text_start = page.text_start();
    let (offset, old) = page.slot(i);
    let new = bytes.len();
    let top = offset + old;
    let new_text_start = text_start + old - new;

    self.buf.copy_within(text_start..offset, new_text_start);
    self.buf[top - new..top].copy_from_slice(bytes);
    self.set_slot(i, top - new, new);
    self.shift_slots(i + 1, count, old, new);
    self.set_text_start(new_text_start);
    true
  }

  /// Replaces the whole content with `lines`, which must fit.
  pub fn rebuild<L: AsRef<[u8]>>(&mut self, lines: &[L]) {
    init(BlockKind::Data, self.buf);
    for line in lines {
      let pushed = self.push(line.as_ref());
      debug_assert!(pushed, "rebuilt data page overflows");
    }
  }
}

/// # Pointer entry
///
/// `line_count` is the number of lines in the subtree rooted at `child`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Entry {
  pub line_count: u64,
  pub child: BlockId,
}

/// # Pointer page view
#[derive(Debug, Clone, Copy)]
pub struct PointerPage<'a> {
  buf: &'a [u8],
}

impl<'a> PointerPage<'a> {
  pub fn new(buf: &'a [u8]) -> Self {
    PointerPage { buf }
  }

  pub fn len(&self) -> usize {
    view::<PointerHead>(self.buf, 0).count.get() as usize
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn entry(&self, i: usize) -> Entry {
    let raw: &RawEntry = view(self.buf, POINTER_HEADER + i * POINTER_SLOT);
    Entry { line_count: raw.line_count.get(), child: BlockId::from_raw(raw.child.get()) }
  }

  /// Index of the entry pointing at `child`.
  pub fn position(&self, child: BlockId) -> Option<usize> {
    (0..self.len()).find(|&i| self.entry(i).child == child)
  }

  pub fn entries(&self) -> Vec<Entry> {
    (0..self.len()).map(|i| self.entry(i)).collect()
  }

  pub fn total(&self) -> u64 {
    (0..self.len()).map(|i| self.entry(i).line_count).sum()
  }

  /// Finds the child holding 0-based line `n` of this subtree.
  ///
  /// Returns the entry index and the number of lines before that child. With `inclusive`, a
  /// position just past the end of a child also selects it, which is where an insertion at that
  /// position goes.
  pub fn locate(&self, n: u64, inclusive: bool) -> Option<(usize, u64)> {
    let mut prefix = 0;
    for i in 0..self.len() {
      let count = self.entry(i).line_count;
      if n < prefix + count || (inclusive && n == prefix + count) {
        return Some((i, prefix));
      }
      prefix += count;
    }
    None
  }

  pub fn validate(&self) -> std::result::Result<(), String> {
    let kind = view::<PointerHead>(self.buf, 0).kind;
    if kind != BlockKind::Pointer as u8 {
      return Err(format!("kind byte {kind} on a pointer page"));
    }
    let count = self.len();
    if count == 0 || count > pointer_capacity(self.buf.len()) {
      return Err(format!("pointer page with {count} entries"));
    }
    for i in 0..count {
      let entry = self.entry(i);
      match entry.child {
        BlockId::Assigned(0) | BlockId::Pending(_) => {
          return Err(format!("entry {i} points at invalid block {}", entry.child));
        }
        BlockId::Assigned(_) => {}
      }
      if entry.line_count == 0 {
        return Err(format!("entry {i} covers no lines"));
      }
    }
    Ok(())
  }
}

/// # Mutable pointer page view
#[derive(Debug)]
pub struct PointerPageMut<'a> {
  buf: &'a mut [u8],
}

impl<'a> PointerPageMut<'a> {
  pub fn new(buf: &'a mut [u8]) -> Self {
    PointerPageMut { buf }
  }

  pub fn as_ref(&self) -> PointerPage<'_> {
    PointerPage::new(self.buf)
  }

  pub fn set(&mut self, i: usize, entry: Entry) {
    *view_mut(self.buf, POINTER_HEADER + i * POINTER_SLOT) =
      RawEntry { line_count: U64::new(entry.line_count), child: I64::new(entry.child.to_raw()) };
  }

  pub fn set_line_count(&mut self, i: usize, line_count: u64) {
    view_mut::<RawEntry>(self.buf, POINTER_HEADER + i * POINTER_SLOT).line_count.set(line_count);
  }

  /// Adds `delta` lines to entry `i`, which may be negative.
  pub fn adjust(&mut self, i: usize, delta: i64) {
    let count = self.as_ref().entry(i).line_count;
    self.set_line_count(i, count.wrapping_add_signed(delta));
  }

  /// Replaces all entries. The caller guarantees they fit.
  pub fn set_entries(&mut self, entries: &[Entry]) {
    init(BlockKind::Pointer, self.buf);
    self.set_len(entries.len());
    for (i, &entry) in entries.iter().enumerate() {
      self.set(i, entry);
    }
  }

  pub fn remove(&mut self, i: usize) {
    let count = self.as_ref().len();
    let tail = POINTER_HEADER + (i + 1) * POINTER_SLOT..POINTER_HEADER + count * POINTER_SLOT;
    self.buf.copy_within(tail.clone(), tail.start - POINTER_SLOT);
    self.set_len(count - 1);
  }

  fn set_len(&mut self, count: usize) {
    view_mut::<PointerHead>(self.buf, 0).count.set(count as u32);
  }

  /// Points the entry for `old` at `new`. Returns whether `old` was found.
  pub fn replace_child(&mut self, old: BlockId, new: BlockId) -> bool {
    match self.as_ref().position(old) {
      Some(i) => {
        let line_count = self.as_ref().entry(i).line_count;
        self.set(i, Entry { line_count, child: new });
        true
      }
      None => false,
    }
  }

  /// Rewrites pending children according to `promoted` (token to slot). Returns whether anything
  /// changed.
  pub fn remap(&mut self, promoted: &collections::HashMap<u64, u64>) -> bool {
    let mut changed = false;
    for i in 0..self.as_ref().len() {
      let mut entry = self.as_ref().entry(i);
      entry.child = match entry.child {
        BlockId::Pending(token) => match promoted.get(&token) {
          Some(&slot) => BlockId::Assigned(slot),
          None => continue,
        },
        BlockId::Assigned(_) => continue,
      };
      self.set(i, entry);
      changed = true;
    }
    changed
  }
}

/// Number of slots a trunk page of the given size can list, assuming the worst-case varint width.
pub fn trunk_capacity(page_size: usize) -> usize {
  (page_size - TRUNK_HEADER) / 9
}

/// Writes a free-list trunk page listing `slots`, followed by `next`.
///
/// Lists as many slots as fit and returns how many it took.
pub fn encode_trunk(buf: &mut [u8], next: Option<u64>, slots: &[u64]) -> usize {
  init(BlockKind::Free, buf);
  view_mut::<TrunkHead>(buf, 0).next.set(next.map_or(0, |slot| slot as i64));
  let mut packed = Vec::new();
  let mut taken = 0;
  for &slot in slots {
    if TRUNK_HEADER + packed.len() + prefix_varint::encoded_len(slot) > buf.len() {
      break;
    }
    prefix_varint::encode(slot, &mut packed);
    taken += 1;
  }
  view_mut::<TrunkHead>(buf, 0).count.set(taken as u32);
  buf[TRUNK_HEADER..TRUNK_HEADER + packed.len()].copy_from_slice(&packed);
  taken
}

/// Reads a free-list trunk page: the next trunk and the listed slots.
pub fn decode_trunk(buf: &[u8]) -> std::result::Result<(Option<u64>, Vec<u64>), String> {
  let head: &TrunkHead = view(buf, 0);
  if head.kind != BlockKind::Free as u8 {
    return Err("not a free-list trunk".into());
  }
  let next = match head.next.get() {
    0 => None,
    raw if raw > 0 => Some(raw as u64),
    raw => return Err(format!("invalid next trunk {raw}")),
  };
  let count = head.count.get() as usize;
  let slots: Vec<u64> = prefix_varint::decode_all(&buf[TRUNK_HEADER..]).take(count).collect();
  if slots.len() != count {
    return Err(format!("trunk lists {count} slots but holds {}", slots.len()));
  }
  Ok((next, slots))
}

#[cfg(test)]
mod tests {
  use super::*;

  fn data_page(size: usize) -> Vec<u8> {
    let mut buf = vec![0; size];
    init(BlockKind::Data, &mut buf);
    buf
  }

  fn lines_of(buf: &[u8]) -> Vec<Vec<u8>> {
    DataPage::new(buf).lines().map(<[u8]>::to_vec).collect()
  }

  #[test]
  fn test_block_id_raw_encoding() {
    assert_eq!(BlockId::Assigned(7).to_raw(), 7);
    assert_eq!(BlockId::Pending(3).to_raw(), -3);
    assert_eq!(BlockId::from_raw(-3), BlockId::Pending(3));
    assert_eq!(BlockId::from_raw(7), BlockId::Assigned(7));
    assert_eq!(BlockId::Pending(3).slot(), None);
  }

  #[test]
  fn test_header_layout_is_bit_exact() {
    let header = Header {
      page_size: 4096,
      root: Some(BlockId::Assigned(2)),
      line_count: 3,
      free_head: Some(5),
      dirty: true,
    };
    let mut buf = vec![0xAA; 4096];
    header.encode(&mut buf);
    assert_eq!(&buf[0..4], b"SWLN");
    assert_eq!(&buf[4..6], &[1, 0]);
    assert_eq!(&buf[6..10], &4096u32.to_le_bytes());
    assert_eq!(&buf[10..18], &2i64.to_le_bytes());
    assert_eq!(&buf[18..26], &3u64.to_le_bytes());
    assert_eq!(&buf[26..34], &5i64.to_le_bytes());
    assert_eq!(buf[34], 1);
    assert!(buf[35..].iter().all(|&b| b == 0));
    assert_eq!(Header::decode(&buf).unwrap(), header);
  }

  #[test]
  fn test_header_rejects_foreign_files() {
    let mut buf = vec![0; 64];
    Header::fresh(4096).encode(&mut buf);
    buf[0] = b'X';
    assert!(matches!(Header::decode(&buf), Err(Error::FormatMismatch(_))));

    Header::fresh(4096).encode(&mut buf);
    buf[4] = 9;
    assert!(matches!(Header::decode(&buf), Err(Error::FormatMismatch(_))));

    Header::fresh(4096).encode(&mut buf);
    assert!(matches!(Header::decode(&buf[..20]), Err(Error::Corrupt(_))));

    Header::fresh(4096).encode(&mut buf);
    buf[34] = 7;
    assert!(matches!(Header::decode(&buf), Err(Error::Corrupt(_))));
  }

  #[test]
  fn test_data_page_insert_remove_replace() {
    let mut buf = data_page(256);
    let mut page = DataPageMut::new(&mut buf);
    assert!(page.push(b"alpha"));
    assert!(page.push(b"gamma"));
    assert!(page.insert(1, b"beta"));
    assert!(page.insert(0, b""));
    assert_eq!(lines_of(&buf), vec![b"".to_vec(), b"alpha".to_vec(), b"beta".to_vec(), b"gamma".to_vec()]);
    DataPage::new(&buf).validate().unwrap();

    let mut page = DataPageMut::new(&mut buf);
    page.remove(1);
    assert!(page.replace(1, b"a much longer beta"));
    assert!(page.replace(2, b"g"));
    assert_eq!(lines_of(&buf), vec![b"".to_vec(), b"a much longer beta".to_vec(), b"g".to_vec()]);
    DataPage::new(&buf).validate().unwrap();
  }

  #[test]
  fn test_data_page_accounting() {
    let mut buf = data_page(128);
    let page = DataPage::new(&buf);
    assert_eq!(page.used(), 0);
    assert_eq!(page.free_space(), data_capacity(128));
    assert!(page.fits(max_line_len(128)));
    assert!(!page.fits(max_line_len(128) + 1));

    let mut page = DataPageMut::new(&mut buf);
    assert!(page.push(&[b'x'; 40]));
    assert!(page.push(&[b'y'; 40]));
    // 116 capacity - 96 used leaves room for 20 - 8 bytes of text.
    assert!(!page.push(&[b'z'; 13]));
    assert!(page.push(&[b'z'; 12]));
    assert_eq!(DataPage::new(&buf).free_space(), 0);
    assert!(!DataPageMut::new(&mut buf).replace(0, &[b'x'; 41]));
    assert_eq!(lines_of(&buf)[0], vec![b'x'; 40]);
  }

  #[test]
  fn test_data_page_validate_catches_garbage() {
    let mut buf = data_page(256);
    DataPageMut::new(&mut buf).push(b"hello");
    buf[12] ^= 0x01;
    DataPage::new(&buf).validate().unwrap_err();

    let mut buf = data_page(256);
    buf[4] = 200;
    DataPage::new(&buf).validate().unwrap_err();
  }

  #[test]
  fn test_pointer_page_locate() {
    let mut buf = vec![0; 256];
    let entries = [
      Entry { line_count: 3, child: BlockId::Assigned(2) },
      Entry { line_count: 2, child: BlockId::Assigned(3) },
      Entry { line_count: 4, child: BlockId::Assigned(4) },
    ];
    PointerPageMut::new(&mut buf).set_entries(&entries);
    let page = PointerPage::new(&buf);
    assert_eq!(page.total(), 9);
    assert_eq!(page.locate(0, false), Some((0, 0)));
    assert_eq!(page.locate(3, false), Some((1, 3)));
    assert_eq!(page.locate(3, true), Some((0, 0)));
    assert_eq!(page.locate(8, false), Some((2, 5)));
    assert_eq!(page.locate(9, false), None);
    assert_eq!(page.locate(9, true), Some((2, 5)));
    page.validate().unwrap();
  }

  #[test]
  fn test_pointer_page_remap_and_remove() {
    let mut buf = vec![0; 256];
    let mut page = PointerPageMut::new(&mut buf);
    page.set_entries(&[
      Entry { line_count: 1, child: BlockId::Assigned(2) },
      Entry { line_count: 2, child: BlockId::Pending(1) },
      Entry { line_count: 3, child: BlockId::Pending(2) },
    ]);
    // Pending children are not valid on disk.
    page.as_ref().validate().unwrap_err();

    let promoted = collections::HashMap::from([(1, 9), (2, 10)]);
    assert!(page.remap(&promoted));
    assert!(!page.remap(&promoted));
    assert!(page.replace_child(BlockId::Assigned(9), BlockId::Pending(7)));
    assert!(!page.replace_child(BlockId::Assigned(9), BlockId::Pending(8)));
    assert_eq!(page.as_ref().position(BlockId::Pending(7)), Some(1));
    assert!(page.replace_child(BlockId::Pending(7), BlockId::Assigned(9)));
    page.adjust(0, 4);
    page.remove(1);
    assert_eq!(
      page.as_ref().entries(),
      vec![
        Entry { line_count: 5, child: BlockId::Assigned(2) },
        Entry { line_count: 3, child: BlockId::Assigned(10) },
      ]
    );
    page.as_ref().validate().unwrap();
  }

  #[test]
  fn test_trunk_pages() {
    let mut buf = vec![0; 128];
    let slots: Vec<u64> = (1000..1100).collect();
    let taken = encode_trunk(&mut buf, Some(42), &slots);
    assert!(taken >= trunk_capacity(128));
    assert!(taken < slots.len());
    assert_eq!(validate(&buf).unwrap(), BlockKind::Free);
    let (next, listed) = decode_trunk(&buf).unwrap();
    assert_eq!(next, Some(42));
    assert_eq!(listed, &slots[..taken]);

    let mut data = data_page(128);
    DataPageMut::new(&mut data).push(b"not a trunk");
    decode_trunk(&data).unwrap_err();
  }
}
