//! Staged disk writer for downloaded pieces.
//!
//! Completed, verified pieces are written into a small number of
//! fixed-size temporary files rather than directly into the final
//! per-file layout; once a temp file has received every piece that maps
//! into its span, its bytes are split across the torrent's final files
//! and the temp file is deleted. This avoids holding every final file
//! open (a multi-file torrent may name thousands of files) while still
//! writing each piece exactly once.
use crate::torrent::Metainfo;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, instrument};

/// Largest a temp file is allowed to grow: 128 MiB, rounded down to a
/// whole number of pieces.
pub const MAX_TEMP_FILE_SIZE: u64 = 1 << 27;

#[derive(Debug, Error)]
pub enum WriterError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("piece index {0} out of range")]
    PieceIndexOutOfRange(u32),
}

pub type WriterResult<T> = std::result::Result<T, WriterError>;

struct FinalFile {
    path: PathBuf,
    /// Byte offset of this file's first byte in the flat torrent byte space.
    global_offset: u64,
    length: u64,
}

struct TempFile {
    path: PathBuf,
    file: File,
    size: u64,
    written: u64,
}

pub struct Writer {
    output_dir: PathBuf,
    piece_length: u64,
    total_length: u64,
    temp_file_size: u64,
    num_temp_files: usize,
    temp_base_name: String,
    final_files: Vec<FinalFile>,
    temp_files: Vec<Option<TempFile>>,
}

impl Writer {
    pub fn new(metainfo: &Metainfo, output_dir: impl Into<PathBuf>) -> WriterResult<Self> {
        let output_dir = output_dir.into();
        std::fs::create_dir_all(&output_dir)?;

        let piece_length = metainfo.piece_length();
        let total_length = metainfo.total_length();

        let max_whole_pieces = (MAX_TEMP_FILE_SIZE / piece_length).max(1) * piece_length;
        let temp_file_size = max_whole_pieces.min(total_length).max(piece_length);
        let num_temp_files = total_length.div_ceil(temp_file_size).max(1) as usize;

        let mut final_files = Vec::new();
        let mut offset = 0u64;
        for entry in metainfo.files() {
            let mut path = output_dir.clone();
            for segment in &entry.path {
                path.push(segment);
            }
            final_files.push(FinalFile {
                path,
                global_offset: offset,
                length: entry.length,
            });
            offset += entry.length;
        }

        let temp_base_name = final_files
            .first()
            .map(|f| f.path.file_name().unwrap().to_string_lossy().into_owned())
            .unwrap_or_else(|| "download".to_string());

        Ok(Self {
            output_dir,
            piece_length,
            total_length,
            temp_file_size,
            num_temp_files,
            temp_base_name,
            final_files,
            temp_files: (0..num_temp_files).map(|_| None).collect(),
        })
    }

    fn temp_file_path(&self, index: usize) -> PathBuf {
        self.output_dir
            .join(format!("{}.tmp.{}", self.temp_base_name, index))
    }

    fn temp_file_size_for(&self, index: usize) -> u64 {
        if index == self.num_temp_files - 1 {
            self.total_length - (self.num_temp_files - 1) as u64 * self.temp_file_size
        } else {
            self.temp_file_size
        }
    }

    fn open_temp_file(&mut self, index: usize) -> WriterResult<()> {
        if self.temp_files[index].is_some() {
            return Ok(());
        }
        let path = self.temp_file_path(index);
        let size = self.temp_file_size_for(index);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;
        file.set_len(size)?;
        self.temp_files[index] = Some(TempFile {
            path,
            file,
            size,
            written: 0,
        });
        Ok(())
    }

    /// Writes one verified piece's bytes into the appropriate temp file,
    /// flushing that temp file to its final destination(s) once every
    /// piece mapping into it has arrived.
    #[instrument(level = "debug", skip(self, data))]
    pub fn write_piece(&mut self, index: u32, data: &[u8]) -> WriterResult<()> {
        let global_pos = index as u64 * self.piece_length;
        if global_pos >= self.total_length {
            return Err(WriterError::PieceIndexOutOfRange(index));
        }
        let temp_index = (global_pos / self.temp_file_size) as usize;
        self.open_temp_file(temp_index)?;

        let position_in_temp = global_pos - temp_index as u64 * self.temp_file_size;
        {
            let temp = self.temp_files[temp_index].as_mut().unwrap();
            temp.file.seek(SeekFrom::Start(position_in_temp))?;
            temp.file.write_all(data)?;
            temp.written += data.len() as u64;
        }

        let complete = {
            let temp = self.temp_files[temp_index].as_ref().unwrap();
            temp.written >= temp.size
        };
        if complete {
            self.flush_temp_file(temp_index)?;
        }
        Ok(())
    }

    fn flush_temp_file(&mut self, index: usize) -> WriterResult<()> {
        let temp = self.temp_files[index].take().unwrap();
        let temp_global_begin = index as u64 * self.temp_file_size;

        let mut file = temp.file;
        file.seek(SeekFrom::Start(0))?;
        let mut bytes = Vec::with_capacity(temp.size as usize);
        file.read_to_end(&mut bytes)?;

        for final_file in &self.final_files {
            let final_begin = final_file.global_offset;
            let final_end = final_begin + final_file.length;
            let temp_end = temp_global_begin + temp.size;

            let overlap_begin = temp_global_begin.max(final_begin);
            let overlap_end = temp_end.min(final_end);
            if overlap_begin >= overlap_end {
                continue;
            }

            let slice = &bytes[(overlap_begin - temp_global_begin) as usize
                ..(overlap_end - temp_global_begin) as usize];
            write_into_final_file(&final_file.path, overlap_begin - final_begin, slice)?;
        }

        drop(file);
        std::fs::remove_file(&temp.path)?;
        debug!(temp_file = %temp.path.display(), "flushed temp file to final destination");
        Ok(())
    }
}

fn write_into_final_file(path: &Path, offset: u64, data: &[u8]) -> WriterResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?;
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(data)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bencode::encoder::encode_to_vec;
    use crate::bencode::BencodeValue;
    use std::collections::BTreeMap;

    fn single_file_metainfo(piece_length: u64, total_length: u64) -> Metainfo {
        let num_pieces = total_length.div_ceil(piece_length);
        let pieces: Vec<u8> = (0..num_pieces).flat_map(|_| [0u8; 20]).collect();

        let mut info = BTreeMap::new();
        info.insert(b"length".to_vec(), BencodeValue::Integer(total_length as i64));
        info.insert(b"name".to_vec(), BencodeValue::String(b"out.bin".to_vec()));
        info.insert(
            b"piece length".to_vec(),
            BencodeValue::Integer(piece_length as i64),
        );
        info.insert(b"pieces".to_vec(), BencodeValue::String(pieces));

        let mut root = BTreeMap::new();
        root.insert(
            b"announce".to_vec(),
            BencodeValue::String(b"http://tracker.example/announce".to_vec()),
        );
        root.insert(b"info".to_vec(), BencodeValue::Dict(info));

        let bytes = encode_to_vec(&BencodeValue::Dict(root)).unwrap();
        Metainfo::parse(&bytes).unwrap()
    }

    #[test]
    fn writes_single_temp_file_torrent_to_final_file() {
        let dir = tempfile::tempdir().unwrap();
        let metainfo = single_file_metainfo(16, 48);
        let mut writer = Writer::new(&metainfo, dir.path()).unwrap();

        writer.write_piece(0, &[1u8; 16]).unwrap();
        writer.write_piece(1, &[2u8; 16]).unwrap();
        writer.write_piece(2, &[3u8; 16]).unwrap();

        let out = std::fs::read(dir.path().join("out.bin")).unwrap();
        let mut expected = vec![1u8; 16];
        expected.extend(vec![2u8; 16]);
        expected.extend(vec![3u8; 16]);
        assert_eq!(out, expected);
    }

    #[test]
    fn temp_files_are_deleted_after_flush() {
        let dir = tempfile::tempdir().unwrap();
        let metainfo = single_file_metainfo(16, 32);
        let mut writer = Writer::new(&metainfo, dir.path()).unwrap();

        writer.write_piece(0, &[9u8; 16]).unwrap();
        writer.write_piece(1, &[9u8; 16]).unwrap();

        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp."))
            .collect();
        assert!(leftovers.is_empty());
    }
}
