// Primitives for reading delimited files.

use std::fs;
use std::path::Path;

use crate::gap::{
    io_common::{decode_text, simplify_file_name},
    *,
};

const CANDIDATE_DELIMITERS: [u8; 4] = [b',', b';', b'\t', b'|'];

/// Picks the delimiter that occurs the most in the header line. Ties and
/// lines without any candidate go to the comma.
pub fn sniff_delimiter(header_line: &str) -> u8 {
    let mut best = (b',', 0);
    for d in CANDIDATE_DELIMITERS.iter() {
        let n = header_line.bytes().filter(|b| b == d).count();
        if n > best.1 {
            best = (*d, n);
        }
    }
    best.0
}

pub fn read_table(path: &Path) -> GapResult<RawTable> {
    let bytes = fs::read(path).context(ReadingSourceSnafu {
        path: path.display().to_string(),
    })?;
    let (text, encoding) = decode_text(&bytes);
    debug!("read_table: {:?}: {:?}", path, encoding);
    parse_table(&text, &simplify_file_name(path))
}

/// Parses delimited text with a header line. Lines that cannot be parsed are
/// skipped. Rows may have fewer or more cells than the header.
pub fn parse_table(text: &str, name: &str) -> GapResult<RawTable> {
    let header_line = text
        .lines()
        .find(|l| !l.trim().is_empty())
        .context(EmptyTableSnafu { path: name })?;
    let delimiter = sniff_delimiter(header_line);

    let mut rdr = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(text.as_bytes());
    let headers: Vec<String> = rdr
        .headers()
        .context(CsvParseSnafu { path: name })?
        .iter()
        .map(|h| h.to_string())
        .collect();

    let mut rows: Vec<Vec<String>> = Vec::new();
    let mut skipped = 0;
    for (idx, line_r) in rdr.records().enumerate() {
        match line_r {
            Ok(line) => rows.push(line.iter().map(|s| s.to_string()).collect()),
            Err(e) => {
                skipped += 1;
                debug!("parse_table: {}: record {}: {}", name, idx + 1, e);
            }
        }
    }
    if skipped > 0 {
        warn!("{}: skipped {} lines that could not be parsed", name, skipped);
    }
    debug!(
        "parse_table: {}: delimiter {:?}, {} columns, {} rows",
        name,
        delimiter as char,
        headers.len(),
        rows.len()
    );
    Ok(RawTable::new(headers, rows))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sniffs_delimiters() {
        assert_eq!(sniff_delimiter("a,b,c"), b',');
        assert_eq!(sniff_delimiter("a;b;c"), b';');
        assert_eq!(sniff_delimiter("a\tb\tc"), b'\t');
        assert_eq!(sniff_delimiter("a|b|c"), b'|');
        assert_eq!(sniff_delimiter("single"), b',');
        assert_eq!(sniff_delimiter("a;b,c"), b',');
    }

    #[test]
    fn parses_ragged_rows() {
        let table = parse_table(
            " pincode ; Month ;age_0_5\n110001;December;4\n560001;May\n400001;June;1;extra\n",
            "test.csv",
        )
        .unwrap();
        assert_eq!(table.headers, vec!["pincode", "Month", "age_0_5"]);
        assert_eq!(table.num_rows(), 3);
        assert_eq!(table.cell(0, 2), "4");
        assert_eq!(table.cell(1, 2), "");
        assert_eq!(table.cell(2, 0), "400001");
    }

    #[test]
    fn quoted_cells_keep_their_delimiters() {
        let table = parse_table(
            "district,pincode\n\"Bhopal, Huzur\",462001\n",
            "test.csv",
        )
        .unwrap();
        assert_eq!(table.cell(0, 0), "Bhopal, Huzur");
        assert_eq!(table.cell(0, 1), "462001");
    }

    #[test]
    fn empty_text_is_an_error() {
        assert!(matches!(
            parse_table("\n  \n", "empty.csv"),
            Err(GapError::EmptyTable { .. })
        ));
    }
}
