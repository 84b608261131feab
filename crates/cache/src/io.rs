//! Stream helpers for moving blob content

use std::fs::File;
use std::io::{self, Read, Write};
use std::path::PathBuf;

/// Reader that counts the bytes passing through it
#[derive(Debug)]
pub(crate) struct CountingReader<R> {
    inner: R,
    count: u64,
}

impl<R: Read> CountingReader<R> {
    pub(crate) const fn new(inner: R) -> Self {
        Self { inner, count: 0 }
    }

    pub(crate) const fn count(&self) -> u64 {
        self.count
    }
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.count += n as u64;
        Ok(n)
    }
}

/// Writer copying everything into several destination files
#[derive(Debug)]
pub(crate) struct FanOutWriter {
    outputs: Vec<(PathBuf, File)>,
}

impl FanOutWriter {
    pub(crate) const fn new(outputs: Vec<(PathBuf, File)>) -> Self {
        Self { outputs }
    }
}

impl Write for FanOutWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_all(buf)?;
        Ok(buf.len())
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        for (path, file) in &mut self.outputs {
            file.write_all(buf)
                .map_err(|e| io::Error::new(e.kind(), format!("{}: {e}", path.display())))?;
        }
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        for (path, file) in &mut self.outputs {
            file.flush()
                .map_err(|e| io::Error::new(e.kind(), format!("{}: {e}", path.display())))?;
        }
        Ok(())
    }
}

/// Copy `reader` into `writer` through a buffer of `buffer_size` bytes
pub(crate) fn copy_with_buffer<R, W>(
    reader: &mut R,
    writer: &mut W,
    buffer_size: usize,
) -> io::Result<u64>
where
    R: Read + ?Sized,
    W: Write + ?Sized,
{
    let mut buf = vec![0u8; buffer_size.max(1)];
    let mut total = 0u64;
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        writer.write_all(&buf[..n])?;
        total += n as u64;
    }
    writer.flush()?;
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn counting_reader_counts_everything_read() {
        let mut reader = CountingReader::new(&b"twelve bytes"[..]);
        let mut sink = Vec::new();
        reader.read_to_end(&mut sink).unwrap();
        assert_eq!(reader.count(), 12);
    }

    #[test]
    fn copy_uses_small_buffers() {
        let data = vec![42u8; 1000];
        let mut out = Vec::new();
        let copied = copy_with_buffer(&mut data.as_slice(), &mut out, 7).unwrap();
        assert_eq!(copied, 1000);
        assert_eq!(out, data);
    }

    #[test]
    fn fan_out_writes_every_destination() {
        let tmp = TempDir::new().unwrap();
        let paths = [tmp.path().join("one"), tmp.path().join("two")];
        let outputs = paths
            .iter()
            .map(|p| (p.clone(), File::create(p).unwrap()))
            .collect();

        let mut writer = FanOutWriter::new(outputs);
        copy_with_buffer(&mut &b"fan out"[..], &mut writer, 3).unwrap();
        drop(writer);

        for path in &paths {
            assert_eq!(std::fs::read(path).unwrap(), b"fan out");
        }
    }
}
