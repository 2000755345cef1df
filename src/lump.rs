//! Resource-archive lookup and the in-memory byte source fed to the demuxer.
//!
//! Movies live inside the game's stacked resource archives under a
//! `Movies/` prefix. The whole lump is cached up front; the demuxer then
//! reads and seeks over the cached bytes through [`LumpSource`].

use crate::error::{Error, Result};

/// Where to seek from.
///
/// `Size` reports the lump length without moving the cursor, mirroring the
/// demuxer-side stream protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    Set,
    Cur,
    End,
    Size,
}

/// A mounted archive that can resolve lump names to bytes.
pub trait ResourceArchive {
    /// Look up a lump by full name path, e.g. `"Movies/INTRO"`.
    fn lookup(&self, name: &str) -> Option<Vec<u8>>;
}

/// A stack of archives searched highest-priority first.
#[derive(Default)]
pub struct ArchiveStack {
    archives: Vec<Box<dyn ResourceArchive>>,
}

impl ArchiveStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mount an archive above everything mounted before it.
    pub fn mount(&mut self, archive: Box<dyn ResourceArchive>) {
        self.archives.push(archive);
    }
}

impl ResourceArchive for ArchiveStack {
    fn lookup(&self, name: &str) -> Option<Vec<u8>> {
        self.archives
            .iter()
            .rev()
            .find_map(|archive| archive.lookup(name))
    }
}

/// Fetch the named movie's bytes from `archive`.
pub fn cache_movie_lump(archive: &dyn ResourceArchive, name: &str) -> Result<Vec<u8>> {
    let path = format!("Movies/{name}");
    archive
        .lookup(&path)
        .ok_or_else(|| Error::NotFound(name.to_string()))
}

/// Read/seek adapter over a cached lump.
pub struct LumpSource {
    data: Vec<u8>,
    position: usize,
}

impl LumpSource {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data, position: 0 }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Copy up to `buf.len()` bytes at the cursor, advancing it.
    ///
    /// Returns the number of bytes copied; 0 means end of lump.
    pub fn read(&mut self, buf: &mut [u8]) -> usize {
        let remaining = self.data.len() - self.position;
        let n = buf.len().min(remaining);
        buf[..n].copy_from_slice(&self.data[self.position..self.position + n]);
        self.position += n;
        n
    }

    /// Move the cursor and return the new position.
    ///
    /// `Whence::Size` reports the lump length without moving. Out-of-range
    /// targets clamp to the lump bounds.
    pub fn seek(&mut self, offset: i64, whence: Whence) -> i64 {
        let base = match whence {
            Whence::Set => 0,
            Whence::Cur => self.position as i64,
            Whence::End => self.data.len() as i64,
            Whence::Size => return self.data.len() as i64,
        };
        let target = (base + offset).clamp(0, self.data.len() as i64);
        self.position = target as usize;
        target
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct MapArchive(Vec<(&'static str, &'static [u8])>);

    impl ResourceArchive for MapArchive {
        fn lookup(&self, name: &str) -> Option<Vec<u8>> {
            self.0
                .iter()
                .find(|(n, _)| *n == name)
                .map(|(_, data)| data.to_vec())
        }
    }

    #[test]
    fn stack_prefers_last_mounted() {
        let mut stack = ArchiveStack::new();
        stack.mount(Box::new(MapArchive(vec![("Movies/INTRO", b"base")])));
        stack.mount(Box::new(MapArchive(vec![("Movies/INTRO", b"patch")])));

        assert_eq!(cache_movie_lump(&stack, "INTRO").unwrap(), b"patch");
    }

    #[test]
    fn missing_lump_is_not_found() {
        let stack = ArchiveStack::new();
        assert!(matches!(
            cache_movie_lump(&stack, "NOPE"),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn read_advances_and_stops_at_end() {
        let mut source = LumpSource::new(b"abcdef".to_vec());
        let mut buf = [0u8; 4];
        assert_eq!(source.read(&mut buf), 4);
        assert_eq!(&buf, b"abcd");
        assert_eq!(source.read(&mut buf), 2);
        assert_eq!(&buf[..2], b"ef");
        assert_eq!(source.read(&mut buf), 0);
    }

    #[test]
    fn seek_whence_variants() {
        let mut source = LumpSource::new(b"0123456789".to_vec());
        assert_eq!(source.seek(4, Whence::Set), 4);
        assert_eq!(source.seek(2, Whence::Cur), 6);
        assert_eq!(source.seek(-3, Whence::End), 7);
        // Size reports the length without moving the cursor.
        assert_eq!(source.seek(0, Whence::Size), 10);
        let mut buf = [0u8; 1];
        source.read(&mut buf);
        assert_eq!(buf[0], b'7');
    }
}
