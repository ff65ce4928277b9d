use std::fs::File;
use std::io::{self, Read};

use camino::Utf8Path;
use digest::Digest;
use sha2::Sha256;

use crate::error::Result;

/// Reader computing a digest of everything read through it.
pub struct StreamHasher<R, H> {
    reader: R,
    hasher: H,
}

impl<R, H: Digest> StreamHasher<R, H> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            hasher: H::new(),
        }
    }

    pub fn finalize(self) -> digest::Output<H> {
        self.hasher.finalize()
    }
}

impl<R: Read, H: Digest> Read for StreamHasher<R, H> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let bytes_read = self.reader.read(buf)?;
        self.hasher.update(&buf[..bytes_read]);
        Ok(bytes_read)
    }
}

/// Hex-encoded SHA-256 of a file's contents.
pub fn sha256_hex(path: &Utf8Path) -> Result<String> {
    let mut hasher = StreamHasher::<_, Sha256>::new(File::open(path)?);
    io::copy(&mut hasher, &mut io::sink())?;
    Ok(hex::encode(hasher.finalize()))
}
