//! Read-back access to movie store files.
//!
//! Analysis code opens a finished recording (or one left behind by a fault;
//! the writer keeps the header's frame count current) and pulls individual
//! frames plus the metadata record.

use crate::codec::FrameGeometry;
use crate::error::{Result, SaverError};
use crate::store::{StoreHeader, StoreMetadata, HEADER_SIZE};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

/// Reader handle for a movie store file.
#[derive(Debug)]
pub struct MovieReader {
    file: File,
    path: PathBuf,
    geometry: FrameGeometry,
    frames: u64,
    allocate: u64,
    data_offset: u64,
    metadata: StoreMetadata,
}

impl MovieReader {
    /// Open and validate a store file.
    pub fn open(path: &Path) -> Result<Self> {
        let mut file = File::open(path)?;

        let mut header_buf = [0u8; HEADER_SIZE as usize];
        file.read_exact(&mut header_buf)
            .map_err(|_| SaverError::corrupt("file shorter than the store header"))?;
        let header = StoreHeader::decode(&header_buf)?;

        if u64::from(header.meta_len) > u64::from(header.meta_capacity) {
            return Err(SaverError::corrupt(
                "metadata length exceeds its reserved region",
            ));
        }
        let mut meta_buf = vec![0u8; header.meta_len as usize];
        file.read_exact(&mut meta_buf)
            .map_err(|_| SaverError::corrupt("truncated metadata record"))?;
        let metadata: StoreMetadata = serde_json::from_slice(&meta_buf)
            .map_err(|e| SaverError::corrupt(format!("bad metadata record: {e}")))?;

        let geometry = header.geometry();
        let frame_bytes = geometry.frame_bytes() as u64;
        if frame_bytes == 0 {
            return Err(SaverError::corrupt("zero-sized frame geometry"));
        }
        let needed = header.data_offset() + header.frames * frame_bytes;
        let actual = file.metadata()?.len();
        if actual < needed {
            return Err(SaverError::corrupt(format!(
                "file holds {actual} bytes, header claims {needed}"
            )));
        }

        Ok(Self {
            file,
            path: path.to_path_buf(),
            geometry,
            frames: header.frames,
            allocate: header.allocate,
            data_offset: header.data_offset(),
            metadata,
        })
    }

    /// Total frames recorded.
    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn geometry(&self) -> FrameGeometry {
        self.geometry
    }

    /// Block capacity the recording was staged with.
    pub fn allocate(&self) -> u64 {
        self.allocate
    }

    pub fn metadata(&self) -> &StoreMetadata {
        &self.metadata
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the raw bytes of frame `index` (column-major, as recorded).
    pub fn frame(&mut self, index: u64) -> Result<Vec<u8>> {
        if index >= self.frames {
            return Err(SaverError::invalid_config(format!(
                "frame {index} out of range, store holds {}",
                self.frames
            )));
        }
        let frame_bytes = self.geometry.frame_bytes();
        let offset = self.data_offset + index * frame_bytes as u64;
        self.file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; frame_bytes];
        self.file.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Read every frame back to back, in recorded order.
    pub fn read_all(&mut self) -> Result<Vec<u8>> {
        let frame_bytes = self.geometry.frame_bytes() as u64;
        self.file.seek(SeekFrom::Start(self.data_offset))?;
        let mut buf = vec![0u8; (self.frames * frame_bytes) as usize];
        self.file.read_exact(&mut buf)?;
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{FrameGeometry, PixelFormat};
    use crate::store::MovieStore;
    use std::collections::BTreeMap;
    use std::io::Write;
    use tempfile::TempDir;

    fn geometry() -> FrameGeometry {
        FrameGeometry::new(4, 3, PixelFormat::U16)
    }

    #[test]
    fn test_round_trip_multi_block() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("movie.msv");
        let frame_bytes = geometry().frame_bytes();

        let mut store =
            MovieStore::create(&path, geometry(), 2, 100.0, &BTreeMap::new()).unwrap();
        // Two full blocks and a partial one: frames 0..5, each filled with
        // its own index.
        let all: Vec<Vec<u8>> = (0u8..5).map(|i| vec![i; frame_bytes]).collect();
        store
            .append_block(&[all[0].clone(), all[1].clone()].concat(), 2)
            .unwrap();
        store
            .append_block(&[all[2].clone(), all[3].clone()].concat(), 2)
            .unwrap();
        store.append_block(&all[4], 1).unwrap();
        store.finalize().unwrap();

        let mut reader = MovieReader::open(&path).unwrap();
        assert_eq!(reader.frames(), 5);
        assert_eq!(reader.geometry(), geometry());
        assert_eq!(reader.allocate(), 2);
        for (i, expected) in all.iter().enumerate() {
            assert_eq!(&reader.frame(i as u64).unwrap(), expected, "frame {i}");
        }
        assert_eq!(reader.read_all().unwrap(), all.concat());
    }

    #[test]
    fn test_frame_out_of_range() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("movie.msv");
        let store =
            MovieStore::create(&path, geometry(), 2, 100.0, &BTreeMap::new()).unwrap();
        store.finalize().unwrap();

        let mut reader = MovieReader::open(&path).unwrap();
        assert_eq!(reader.frames(), 0);
        assert!(reader.frame(0).is_err());
    }

    #[test]
    fn test_rejects_foreign_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("not_a_store.bin");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(&[0u8; 256]).unwrap();
        drop(f);

        let err = MovieReader::open(&path).unwrap_err();
        assert!(matches!(err, SaverError::CorruptStore { .. }), "{err:?}");
    }

    #[test]
    fn test_rejects_truncated_data_region() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("movie.msv");
        let frame_bytes = geometry().frame_bytes();
        let mut store =
            MovieStore::create(&path, geometry(), 2, 100.0, &BTreeMap::new()).unwrap();
        store
            .append_block(&vec![1u8; 2 * frame_bytes], 2)
            .unwrap();
        store.finalize().unwrap();

        // Chop the last frame off the data region.
        let len = std::fs::metadata(&path).unwrap().len();
        let f = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        f.set_len(len - frame_bytes as u64).unwrap();

        assert!(matches!(
            MovieReader::open(&path),
            Err(SaverError::CorruptStore { .. })
        ));
    }
}
