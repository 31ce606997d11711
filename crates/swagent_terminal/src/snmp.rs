use crate::config;
use crate::pattern::FullMatch;
use anyhow::{bail, Context, Result};
use once_cell::sync::Lazy;
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

static WALK_ROW: Lazy<FullMatch> =
    Lazy::new(|| FullMatch::new(r".*\.([0-9]+) = (.*)").expect("walk row pattern"));

/// Run the external bulk-walk tool against one OID subtree and return the
/// `(numeric suffix, raw value)` pairs it printed.
pub async fn bulk_walk(
    version: u32,
    community: &str,
    ip: &str,
    oid: &str,
) -> Result<Vec<(String, String)>> {
    let bin = config::snmp_bulkwalk_bin();
    debug!(target: "snmp", bin, ip, oid, "bulk walk");
    let output = Command::new(bin)
        .arg("-v")
        .arg(format!("{version}c"))
        .arg("-c")
        .arg(community)
        .arg(ip)
        .arg(oid)
        .stdin(Stdio::null())
        .output()
        .await
        .with_context(|| format!("Failed to execute '{bin}'"))?;

    let mut merged = String::from_utf8_lossy(&output.stdout).into_owned();
    merged.push_str(&String::from_utf8_lossy(&output.stderr));
    parse_walk_output(&merged, output.status.success())
}

/// Each matching line yields a row; the first non-matching non-empty line
/// is kept as the error message thrown when the tool exits non-zero.
fn parse_walk_output(text: &str, exited_clean: bool) -> Result<Vec<(String, String)>> {
    let mut rows = Vec::new();
    let mut err_line = String::new();
    for line in text.lines() {
        if let Some(caps) = WALK_ROW.captures(line) {
            rows.push((caps[1].to_string(), caps[2].to_string()));
        } else if !line.is_empty() && err_line.is_empty() {
            err_line = line.to_string();
        }
    }
    if !exited_clean {
        bail!("{err_line}");
    }
    Ok(rows)
}

/// Strip the `STRING: ` prefix and surrounding double quotes from a walk
/// value. Non-STRING values collapse to the empty string. The prefix skip
/// is nine characters, eating the opening quote of a quoted value.
pub fn un_string(value: &str) -> String {
    let mut ret = String::new();
    if value.starts_with("STRING: ") {
        ret = value.get(9..).unwrap_or("").to_string();
    }
    if ret.starts_with('"') {
        ret.remove(0);
    }
    if ret.ends_with('"') {
        ret.pop();
    }
    ret
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rows_parse_suffix_and_value() {
        let text = ".1.3.6.1.2.1.31.1.1.1.1.10101 = STRING: \"Gi0/1\"\n\
                    .1.3.6.1.2.1.31.1.1.1.1.10102 = STRING: \"Gi0/2\"\n";
        let rows = parse_walk_output(text, true).expect("rows");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0], ("10101".into(), "STRING: \"Gi0/1\"".into()));
        assert_eq!(rows[1].0, "10102");
    }

    #[test]
    fn first_stray_line_becomes_error_on_bad_exit() {
        let text = "Timeout: No Response from 10.0.0.9\nsecond stray\n";
        let err = parse_walk_output(text, false).expect_err("must fail");
        assert_eq!(format!("{err}"), "Timeout: No Response from 10.0.0.9");
    }

    #[test]
    fn stray_lines_are_ignored_on_clean_exit() {
        let text = "informational noise\n.1.2.3.4 = INTEGER: 1\n";
        let rows = parse_walk_output(text, true).expect("rows");
        assert_eq!(rows, vec![("4".to_string(), "INTEGER: 1".to_string())]);
    }

    #[test]
    fn un_string_strips_prefix_and_quotes() {
        assert_eq!(un_string("STRING: \"Gi0/1\""), "Gi0/1");
        assert_eq!(un_string("STRING: \"uplink to core\""), "uplink to core");
        // The nine-character skip eats the first character of an unquoted
        // value; non-STRING values collapse to empty.
        assert_eq!(un_string("STRING: up"), "p");
        assert_eq!(un_string("INTEGER: 1"), "");
        assert_eq!(un_string(""), "");
    }
}
