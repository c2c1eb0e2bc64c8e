//! Run Identity (C6): collision-free run-ID generation, parsing, sequencing.
//!
//! A run ID has one of two shapes:
//! - new: `<kind>_<YYYYMMDD>_<HHMMSS>_<baseRefShortHash>_<seq>`
//! - legacy: `<YYYYMMDD>_<seq>`
//!
//! Both formats are accepted on input (see [`RunId::parse`]); only the new
//! format is minted for new runs. The two are independent sequence
//! namespaces: a legacy run id never influences the `seq` computed for a new
//! prefix, and vice versa (see SPEC_FULL.md, Open Question).

use std::fmt;

use anyhow::{Result, anyhow};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunId {
    pub kind: String,
    pub date: String,
    pub time: String,
    pub base_ref_hash: String,
    pub seq: u32,
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}_{}_{}_{}_{:03}",
            self.kind, self.date, self.time, self.base_ref_hash, self.seq
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyRunId {
    pub date: String,
    pub seq: u32,
}

impl fmt::Display for LegacyRunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{:03}", self.date, self.seq)
    }
}

/// Either shape of run id, as accepted on input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedRunId {
    New(RunId),
    Legacy(LegacyRunId),
}

impl ParsedRunId {
    /// Parse either the new or legacy run-id shape from a raw string.
    pub fn parse(raw: &str) -> Result<ParsedRunId> {
        let parts: Vec<&str> = raw.split('_').collect();
        if parts.len() == 5 {
            let (date, time, hash, seq) = (parts[1], parts[2], parts[3], parts[4]);
            if is_date(date) && is_time(time) && !hash.is_empty() {
                let seq: u32 = seq.parse().map_err(|_| anyhow!("invalid seq in run id: {raw}"))?;
                return Ok(ParsedRunId::New(RunId {
                    kind: parts[0].to_string(),
                    date: date.to_string(),
                    time: time.to_string(),
                    base_ref_hash: hash.to_string(),
                    seq,
                }));
            }
        }
        if parts.len() == 2 && is_date(parts[0]) {
            let seq: u32 = parts[1].parse().map_err(|_| anyhow!("invalid seq in run id: {raw}"))?;
            return Ok(ParsedRunId::Legacy(LegacyRunId {
                date: parts[0].to_string(),
                seq,
            }));
        }
        Err(anyhow!("unrecognized run id shape: {raw}"))
    }
}

fn is_date(s: &str) -> bool {
    s.len() == 8 && s.bytes().all(|b| b.is_ascii_digit())
}

fn is_time(s: &str) -> bool {
    s.len() == 6 && s.bytes().all(|b| b.is_ascii_digit())
}

/// Truncate a resolved commit SHA (or the sha256 of a literal ref string, as
/// a fallback when resolution fails) to the canonical 8-hex-char form.
pub fn short_base_ref_hash(resolved: &str) -> String {
    let lowered = resolved.to_lowercase();
    lowered.chars().take(8).collect()
}

/// Build the collision-detection prefix shared by all run IDs for a given
/// `(kind, timestamp, base_ref_hash)` triple.
pub fn prefix_for(kind: &str, date: &str, time: &str, base_ref_hash: &str) -> String {
    format!("{kind}_{date}_{time}_{base_ref_hash}")
}

/// Compute the next sequence number given existing run ids that share the
/// same new-format prefix. Ignores legacy-format ids entirely.
pub fn next_seq_for_prefix(prefix: &str, existing_run_ids: &[String]) -> u32 {
    let max_existing = existing_run_ids
        .iter()
        .filter_map(|id| {
            let rest = id.strip_prefix(prefix)?.strip_prefix('_')?;
            rest.parse::<u32>().ok()
        })
        .max();
    max_existing.map(|n| n + 1).unwrap_or(1)
}

/// Mint the next run id for `(kind, date, time, base_ref_hash)` given the
/// full set of existing run ids recorded in the ledger.
pub fn next_run_id(kind: &str, date: &str, time: &str, base_ref_hash: &str, existing_run_ids: &[String]) -> RunId {
    let prefix = prefix_for(kind, date, time, base_ref_hash);
    let seq = next_seq_for_prefix(&prefix, existing_run_ids);
    RunId {
        kind: kind.to_string(),
        date: date.to_string(),
        time: time.to_string(),
        base_ref_hash: short_base_ref_hash(base_ref_hash),
        seq,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mints_seq_one_when_no_collisions() {
        let id = next_run_id("factory", "20260801", "101500", "abcdef12", &[]);
        assert_eq!(id.to_string(), "factory_20260801_101500_abcdef12_001");
    }

    #[test]
    fn mints_next_seq_on_collision() {
        let existing = vec!["factory_20260801_101500_abcdef12_001".to_string()];
        let id = next_run_id("factory", "20260801", "101500", "abcdef12", &existing);
        assert_eq!(id.seq, 2);
    }

    #[test]
    fn legacy_and_new_are_independent_namespaces() {
        let existing = vec!["20260801_007".to_string()];
        let id = next_run_id("factory", "20260801", "101500", "abcdef12", &existing);
        assert_eq!(id.seq, 1);
    }

    #[test]
    fn parses_new_shape() {
        match ParsedRunId::parse("factory_20260801_101500_abcdef12_003").unwrap() {
            ParsedRunId::New(id) => assert_eq!(id.seq, 3),
            ParsedRunId::Legacy(_) => panic!("expected new shape"),
        }
    }

    #[test]
    fn parses_legacy_shape() {
        match ParsedRunId::parse("20260801_007").unwrap() {
            ParsedRunId::Legacy(id) => assert_eq!(id.seq, 7),
            ParsedRunId::New(_) => panic!("expected legacy shape"),
        }
    }

    #[test]
    fn rejects_garbage() {
        assert!(ParsedRunId::parse("not-a-run-id").is_err());
    }

    #[test]
    fn base_ref_hash_truncated_to_eight_chars() {
        assert_eq!(short_base_ref_hash("ABCDEF1234567890"), "abcdef12");
    }
}
