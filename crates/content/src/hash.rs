use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::path::Path;

const CHUNK: usize = 64 * 1024;

/// Copy `reader` into `writer`, returning the byte count and SHA-256 of
/// everything copied.
pub fn copy_hashed<R: Read, W: Write>(reader: &mut R, writer: &mut W) -> io::Result<(u64, String)> {
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; CHUNK];
    let mut total = 0u64;
    loop {
        let read = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        };
        hasher.update(&buffer[..read]);
        writer.write_all(&buffer[..read])?;
        total += read as u64;
    }
    writer.flush()?;
    Ok((total, to_hex(&hasher.finalize())))
}

pub fn sha256_file(path: impl AsRef<Path>) -> io::Result<String> {
    let mut reader = BufReader::new(File::open(path)?);
    let (_, digest) = copy_hashed(&mut reader, &mut io::sink())?;
    Ok(digest)
}

fn to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}
