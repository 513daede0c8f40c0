//! File input: contiguous reads of a pre-encoded stream, with optional
//! looping back to the start on EOF.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;

use failure::{bail, Error};
use log::{debug, warn};

use super::InputSource;

pub struct FileInput {
    path: PathBuf,
    bitrate: u16,
    looping: bool,
    file: Option<File>,
    file_size: u64,
    loop_count: u64,
    underruns: u64,
}

impl FileInput {
    pub fn new(path: &str, bitrate: u16, looping: bool) -> Self {
        FileInput {
            path: PathBuf::from(path),
            bitrate,
            looping,
            file: None,
            file_size: 0,
            loop_count: 0,
            underruns: 0,
        }
    }
}

impl InputSource for FileInput {
    fn open(&mut self) -> Result<(), Error> {
        let mut file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) => bail!("open {:?}: {}", self.path, e),
        };
        let size = file.seek(SeekFrom::End(0))?;
        file.seek(SeekFrom::Start(0))?;
        if size == 0 {
            bail!("input file {:?} is empty", self.path);
        }
        debug!("file input {:?}: {} bytes, loop={}", self.path, size, self.looping);
        self.file_size = size;
        self.file = Some(file);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.file.is_some()
    }

    fn read_frame(&mut self, size: usize) -> Vec<u8> {
        let mut out = vec![0u8; size];
        let file = match self.file.as_mut() {
            Some(f) => f,
            None => {
                self.underruns += 1;
                return out;
            }
        };
        let mut filled = 0;
        while filled < size {
            match file.read(&mut out[filled..]) {
                Ok(0) => {
                    if self.looping && self.file_size > 0 {
                        if file.seek(SeekFrom::Start(0)).is_err() {
                            break;
                        }
                        self.loop_count += 1;
                        debug!("file input {:?} looped ({})", self.path, self.loop_count);
                    } else {
                        // EOF without looping: zero-fill the remainder.
                        self.underruns += 1;
                        break;
                    }
                }
                Ok(n) => filled += n,
                Err(e) => {
                    warn!("file input {:?} read error: {}", self.path, e);
                    self.underruns += 1;
                    break;
                }
            }
        }
        out
    }

    fn bitrate(&self) -> u16 {
        self.bitrate
    }

    fn close(&mut self) {
        self.file = None;
    }

    fn underruns(&self) -> u64 {
        self.underruns
    }

    fn buffered(&self) -> usize {
        if self.is_open() {
            self.file_size as usize
        } else {
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn temp_file(contents: &[u8]) -> PathBuf {
        use std::sync::atomic::{AtomicU32, Ordering};
        static SEQ: AtomicU32 = AtomicU32::new(0);
        let mut path = std::env::temp_dir();
        path.push(format!(
            "dabmux-file-input-{}-{}",
            std::process::id(),
            SEQ.fetch_add(1, Ordering::Relaxed)
        ));
        let mut f = File::create(&path).unwrap();
        f.write_all(contents).unwrap();
        path
    }

    #[test]
    fn reads_sequentially() {
        let data: Vec<u8> = (0..=255u8).collect();
        let path = temp_file(&data);
        let mut input = FileInput::new(path.to_str().unwrap(), 128, false);
        input.open().unwrap();
        assert_eq!(input.read_frame(100), data[..100].to_vec());
        assert_eq!(input.read_frame(100), data[100..200].to_vec());
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn zero_fills_at_eof() {
        let data = [1u8; 10];
        let path = temp_file(&data);
        let mut input = FileInput::new(path.to_str().unwrap(), 128, false);
        input.open().unwrap();
        let frame = input.read_frame(16);
        assert_eq!(&frame[..10], &[1u8; 10]);
        assert_eq!(&frame[10..], &[0u8; 6]);
        assert_eq!(input.underruns(), 1);
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn loops_at_eof() {
        let data = [7u8, 8, 9];
        let path = temp_file(&data);
        let mut input = FileInput::new(path.to_str().unwrap(), 128, true);
        input.open().unwrap();
        assert_eq!(input.read_frame(7), vec![7, 8, 9, 7, 8, 9, 7]);
        assert_eq!(input.underruns(), 0);
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn missing_file_fails_open() {
        let mut input = FileInput::new("/nonexistent/audio.mp2", 128, false);
        assert!(input.open().is_err());
        assert!(!input.is_open());
        // Unopened sources zero-fill.
        assert_eq!(input.read_frame(4), vec![0; 4]);
    }
}
