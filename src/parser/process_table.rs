use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessRow {
    pub pid: u32,
    pub ppid: Option<u32>,
    pub user: Option<String>,
    pub cpu_percent: Option<f64>,
    pub mem_percent: Option<f64>,
    pub rss_bytes: Option<u64>,
    pub command: String,
}

const COMMAND_HEADERS: &[&str] = &["COMMAND", "COMM", "ARGS", "CMD", "UCOMM"];

/// Parse `ps` output. Columns are located by header name; the command column
/// absorbs the rest of the line when it is last, so arguments with spaces
/// survive.
pub fn parse(text: &str) -> Option<Vec<ProcessRow>> {
    let mut lines = text.lines().filter(|l| !l.trim().is_empty());
    let header: Vec<String> = lines
        .next()?
        .split_whitespace()
        .map(|h| h.to_ascii_uppercase())
        .collect();

    let col = |names: &[&str]| header.iter().position(|h| names.contains(&h.as_str()));
    let pid_idx = col(&["PID"])?;
    let cmd_idx = col(COMMAND_HEADERS)?;
    let ppid_idx = col(&["PPID"]);
    let user_idx = col(&["USER", "UID"]);
    let cpu_idx = col(&["%CPU"]);
    let mem_idx = col(&["%MEM"]);
    let rss_idx = col(&["RSS"]);
    let cmd_is_last = cmd_idx == header.len() - 1;

    let rows: Vec<ProcessRow> = lines
        .filter_map(|line| {
            let tokens: Vec<&str> = line.split_whitespace().collect();
            if tokens.len() < header.len() {
                return None;
            }
            let field = |idx: Option<usize>| idx.and_then(|i| tokens.get(i).copied());
            let command = if cmd_is_last {
                tokens[cmd_idx..].join(" ")
            } else {
                tokens[cmd_idx].to_string()
            };
            Some(ProcessRow {
                pid: tokens[pid_idx].parse().ok()?,
                ppid: field(ppid_idx).and_then(|v| v.parse().ok()),
                user: field(user_idx).map(str::to_string),
                cpu_percent: field(cpu_idx).and_then(|v| v.parse().ok()),
                mem_percent: field(mem_idx).and_then(|v| v.parse().ok()),
                // ps reports RSS in KiB
                rss_bytes: field(rss_idx)
                    .and_then(|v| v.parse::<u64>().ok())
                    .and_then(|kib| kib.checked_mul(1024)),
                command,
            })
        })
        .collect();

    if rows.is_empty() {
        None
    } else {
        Some(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ps_columns() {
        let text = "  PID  PPID USER     %CPU %MEM    RSS COMMAND\n\
                    \x20   1     0 root      0.0  0.1  12345 /sbin/launchd\n\
                    \x20 412     1 alice    12.5  3.2 204800 /Applications/Safari.app/Contents/MacOS/Safari --flag value\n";
        let rows = parse(text).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].pid, 1);
        assert_eq!(rows[0].user.as_deref(), Some("root"));
        assert_eq!(rows[1].ppid, Some(1));
        assert_eq!(rows[1].cpu_percent, Some(12.5));
        assert_eq!(rows[1].rss_bytes, Some(204800 * 1024));
        assert_eq!(
            rows[1].command,
            "/Applications/Safari.app/Contents/MacOS/Safari --flag value"
        );
    }

    #[test]
    fn minimal_columns() {
        let rows = parse("PID COMM\n77 sshd\n").unwrap();
        assert_eq!(rows[0].pid, 77);
        assert_eq!(rows[0].command, "sshd");
        assert_eq!(rows[0].user, None);
    }

    #[test]
    fn oversized_rss_is_unknown() {
        let rows = parse("PID RSS COMMAND\n9 18446744073709551615 /bin/big\n").unwrap();
        assert_eq!(rows[0].pid, 9);
        assert_eq!(rows[0].rss_bytes, None);
        assert_eq!(rows[0].command, "/bin/big");
    }

    #[test]
    fn rejects_unrecognized_tables() {
        assert_eq!(parse("NAME VALUE\na b\n"), None);
        assert_eq!(parse("PID COMMAND\n"), None);
        assert_eq!(parse("PID COMMAND\nnot-a-pid x\n"), None);
    }
}
