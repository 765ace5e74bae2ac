//! Line-oriented input files (identifier list, ledger)

use crate::Result;
use std::path::Path;

/// Read a newline-delimited list, dropping blank lines and `#` comments.
///
/// Invalid UTF-8 is replaced rather than rejected. A missing file is an
/// empty list.
pub fn read_identifier_list(path: &Path) -> Result<Vec<String>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let bytes = std::fs::read(path)?;
    Ok(clean_lines(&String::from_utf8_lossy(&bytes)))
}

/// Trim each line and drop blanks and comment lines
pub fn clean_lines(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_clean_lines_skips_comments_and_blanks() {
        let text = "# header\n\nhttps://a\n   \n  https://b  \n#https://c\n";
        assert_eq!(clean_lines(text), vec!["https://a", "https://b"]);
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = tempdir().unwrap();
        let list = read_identifier_list(&dir.path().join("absent.txt")).unwrap();
        assert!(list.is_empty());
    }

    #[test]
    fn test_invalid_utf8_is_replaced() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("links.txt");
        std::fs::write(&path, b"https://a\n\xff\xfe\nhttps://b\n").unwrap();

        let list = read_identifier_list(&path).unwrap();
        assert_eq!(list.len(), 3);
        assert_eq!(list[0], "https://a");
        assert_eq!(list[2], "https://b");
    }
}
