//! Log tailing.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;

const BLOCK: u64 = 8 * 1024;

/// Number of lines `str::lines` would yield for `buf`.
fn line_count(buf: &[u8]) -> usize {
    let newlines = buf.iter().filter(|&&b| b == b'\n').count();
    match buf.last() {
        Some(b'\n') | None => newlines,
        Some(_) => newlines + 1,
    }
}

/// Last `n` lines of `path`.
///
/// Reads backwards in 8 KiB blocks until more than `n` lines are buffered, so
/// the cost is proportional to the tail, not the file. The result equals
/// taking the last `n` entries of `read_to_string(path).lines()`, with
/// invalid UTF-8 replaced.
pub fn tail_lines(path: &Path, n: usize) -> io::Result<Vec<String>> {
    if n == 0 {
        return Ok(Vec::new());
    }
    let mut file = File::open(path)?;
    let mut pos = file.seek(SeekFrom::End(0))?;
    let mut buf: Vec<u8> = Vec::new();

    while pos > 0 && line_count(&buf) <= n {
        let len = BLOCK.min(pos);
        pos -= len;
        file.seek(SeekFrom::Start(pos))?;
        let mut chunk = vec![0u8; len as usize];
        file.read_exact(&mut chunk)?;
        chunk.extend_from_slice(&buf);
        buf = chunk;
    }

    let text = String::from_utf8_lossy(&buf);
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(n);
    Ok(lines[start..].iter().map(|l| l.to_string()).collect())
}

/// Tail joined with newlines; a missing file yields empty text.
pub fn tail_text(path: &Path, n: usize) -> io::Result<String> {
    match tail_lines(path, n) {
        Ok(lines) => Ok(lines.join("\n")),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(String::new()),
        Err(e) => Err(e),
    }
}
