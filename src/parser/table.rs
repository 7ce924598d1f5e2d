use serde::{Deserialize, Serialize};

/// Generic whitespace-aligned table: one header line followed by rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Table {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl Table {
    /// Rows as header-keyed maps.
    pub fn records(&self) -> Vec<std::collections::BTreeMap<&str, &str>> {
        self.rows
            .iter()
            .map(|row| {
                self.headers
                    .iter()
                    .map(String::as_str)
                    .zip(row.iter().map(String::as_str))
                    .collect()
            })
            .collect()
    }
}

/// Split on runs of whitespace. Surplus cells are folded into the final
/// column; short rows are padded with empty strings.
pub fn parse(text: &str) -> Option<Table> {
    let mut lines = text.lines().filter(|l| !l.trim().is_empty());
    let headers: Vec<String> = lines.next()?.split_whitespace().map(str::to_string).collect();
    if headers.is_empty() {
        return None;
    }
    let width = headers.len();

    let rows = lines
        .map(|line| {
            let tokens: Vec<&str> = line.split_whitespace().collect();
            let mut row: Vec<String> = Vec::with_capacity(width);
            for (i, tok) in tokens.iter().enumerate() {
                if i + 1 == width {
                    row.push(tokens[i..].join(" "));
                    break;
                }
                row.push(tok.to_string());
            }
            row.resize(width, String::new());
            row
        })
        .collect();

    Some(Table { headers, rows })
}
