//! Prediction result files.

use std::fmt::Write;

use nametag_core::SequenceRecord;

/// Render records as `<token> <gold> <predicted>` lines, one per real
/// position, with a blank line after each sequence.
pub fn render_result_file(records: &[SequenceRecord]) -> String {
    let mut out = String::new();
    for record in records {
        let positions = record
            .tokens
            .iter()
            .zip(&record.gold)
            .zip(&record.predicted)
            .take(record.length);
        for ((token, gold), predicted) in positions {
            // Writing to a String cannot fail
            let _ = writeln!(out, "{token} {gold} {predicted}");
        }
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_layout() {
        let records = vec![
            SequenceRecord::new(
                strings(&["John", "lives"]),
                strings(&["B-PER", "O"]),
                strings(&["B-PER", "O"]),
            ),
            SequenceRecord::new(strings(&["Paris"]), strings(&["B-LOC"]), strings(&["O"])),
        ];
        assert_eq!(
            render_result_file(&records),
            "John B-PER B-PER\nlives O O\n\nParis B-LOC O\n\n"
        );
    }

    #[test]
    fn test_stops_at_length() {
        let mut record = SequenceRecord::new(
            strings(&["a", "b", "<pad>"]),
            strings(&["O", "O", "O"]),
            strings(&["O", "O", "O"]),
        );
        record.length = 2;
        assert_eq!(render_result_file(&[record]), "a O O\nb O O\n\n");
    }

    #[test]
    fn test_empty() {
        assert_eq!(render_result_file(&[]), "");
    }
}
