/// Start offsets of every line that begins with `delimiter`, in archive order.
///
/// A delimiter line is recognised at offset 0 or right after a `\n`. The scan is
/// a single forward pass over line starts.
pub fn delimiter_offsets(data: &[u8], delimiter: &[u8]) -> Vec<u64> {
    let mut starts = Vec::new();
    let mut pos = 0usize;

    while pos < data.len() {
        if data[pos..].starts_with(delimiter) {
            starts.push(pos as u64);
        }
        match data[pos..].iter().position(|&b| b == b'\n') {
            Some(newline) => pos += newline + 1,
            None => break,
        }
    }

    starts
}

/// Record extents produced by one scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanResult {
    /// `(byte_offset, byte_length)`; each record includes its delimiter line.
    pub extents: Vec<(u64, u64)>,
    /// Bytes before the first delimiter line. They belong to no record.
    pub preamble_bytes: u64,
}

/// Split `data` into delimiter-bounded records.
///
/// Records are contiguous: each runs up to the next delimiter line, and the
/// last one runs to end of file whether or not it ends in a newline.
pub fn scan_records(data: &[u8], delimiter: &[u8]) -> ScanResult {
    let starts = delimiter_offsets(data, delimiter);
    let total = data.len() as u64;

    let preamble_bytes = starts.first().copied().unwrap_or(total);
    let extents = starts
        .iter()
        .enumerate()
        .map(|(i, &start)| {
            let end = starts.get(i + 1).copied().unwrap_or(total);
            (start, end - start)
        })
        .collect();

    ScanResult { extents, preamble_bytes }
}
