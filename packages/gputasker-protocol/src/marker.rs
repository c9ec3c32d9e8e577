/// Prefix of the first stdout line emitted by the remote bootstrap.
pub const MARKER_PREFIX: &str = "__GPUTASKER_REMOTE__";

/// Parse a marker line of the form `__GPUTASKER_REMOTE__ pid=<int> pgid=<int>`.
///
/// Extra whitespace between fields is tolerated. Returns `(None, None)` when
/// the line does not carry the marker prefix; a field that is present but
/// unparsable is simply left as `None`.
pub fn parse_marker(line: &str) -> (Option<i64>, Option<i64>) {
    let line = line.trim();
    if !line.starts_with(MARKER_PREFIX) {
        return (None, None);
    }
    let mut pid = None;
    let mut pgid = None;
    for part in line.split_whitespace() {
        if let Some(value) = part.strip_prefix("pid=") {
            pid = value.parse::<i64>().ok();
        }
        if let Some(value) = part.strip_prefix("pgid=") {
            pgid = value.parse::<i64>().ok();
        }
    }
    (pid, pgid)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_pid_and_pgid() {
        let (pid, pgid) = parse_marker("__GPUTASKER_REMOTE__ pid=4321 pgid=4321\n");
        assert_eq!(pid, Some(4321));
        assert_eq!(pgid, Some(4321));
    }

    #[test]
    fn tolerates_extra_whitespace() {
        let (pid, pgid) = parse_marker("  __GPUTASKER_REMOTE__   pid=10   pgid=22  ");
        assert_eq!(pid, Some(10));
        assert_eq!(pgid, Some(22));
    }

    #[test]
    fn rejects_foreign_lines() {
        assert_eq!(parse_marker("starting training run"), (None, None));
        assert_eq!(parse_marker(""), (None, None));
    }

    #[test]
    fn keeps_parsable_half_of_a_torn_line() {
        let (pid, pgid) = parse_marker("__GPUTASKER_REMOTE__ pid=99 pgid=");
        assert_eq!(pid, Some(99));
        assert_eq!(pgid, None);
    }
}
