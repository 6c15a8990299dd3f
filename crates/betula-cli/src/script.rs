//! Operation script parsing and recording.
//!
//! Scripts are line-oriented: one command per line, replayable with `-i`
//! and recordable with `-o`, so a failing random run can be captured and
//! replayed deterministically.

use anyhow::{bail, Context, Result};

/// One scripted operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Insert(u64),
    Update(u64),
    Delete(u64),
    /// A query together with its observed outcome (`None` = absent).
    Query(u64, Option<String>),
    FullScan,
    LowerBoundScan(u64),
    UpperBoundScan(u64),
}

impl Command {
    /// Parses a single script line.
    pub fn parse(line: &str) -> Result<Command> {
        let mut words = line.split_whitespace();
        let verb = words.next().context("empty script line")?;
        let key: u64 = words
            .next()
            .with_context(|| format!("missing argument after {verb:?}"))?
            .parse()
            .with_context(|| format!("bad key in line {line:?}"))?;

        let command = match verb {
            "Inserting" => Command::Insert(key),
            "Updating" => Command::Update(key),
            "Deleting" => Command::Delete(key),
            "Query" => {
                let arrow = words.next();
                if arrow != Some("->") {
                    bail!("malformed query line {line:?}");
                }
                let outcome = words.next().context("query line missing outcome")?;
                let value = (outcome != "DNE").then(|| outcome.to_string());
                Command::Query(key, value)
            }
            "Full_scan" => Command::FullScan,
            "Lower_bound_scan" => Command::LowerBoundScan(key),
            "Upper_bound_scan" => Command::UpperBoundScan(key),
            other => bail!("unknown command: {other}"),
        };
        Ok(command)
    }

    /// Renders the command as a script line.
    pub fn render(&self) -> String {
        match self {
            Command::Insert(k) => format!("Inserting {k}"),
            Command::Update(k) => format!("Updating {k}"),
            Command::Delete(k) => format!("Deleting {k}"),
            Command::Query(k, Some(v)) => format!("Query {k} -> {v}"),
            Command::Query(k, None) => format!("Query {k} -> DNE"),
            Command::FullScan => "Full_scan 0".to_string(),
            Command::LowerBoundScan(k) => format!("Lower_bound_scan {k}"),
            Command::UpperBoundScan(k) => format!("Upper_bound_scan {k}"),
        }
    }
}

/// Parses a whole script.
pub fn parse_script(text: &str) -> Result<Vec<Command>> {
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .map(Command::parse)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mutations() {
        assert_eq!(Command::parse("Inserting 7").unwrap(), Command::Insert(7));
        assert_eq!(Command::parse("Updating 12").unwrap(), Command::Update(12));
        assert_eq!(Command::parse("Deleting 3").unwrap(), Command::Delete(3));
    }

    #[test]
    fn test_parse_queries() {
        assert_eq!(
            Command::parse("Query 5 -> 5:5:").unwrap(),
            Command::Query(5, Some("5:5:".into()))
        );
        assert_eq!(
            Command::parse("Query 9 -> DNE").unwrap(),
            Command::Query(9, None)
        );
    }

    #[test]
    fn test_parse_scans() {
        assert_eq!(Command::parse("Full_scan 0").unwrap(), Command::FullScan);
        assert_eq!(
            Command::parse("Lower_bound_scan 42").unwrap(),
            Command::LowerBoundScan(42)
        );
        assert_eq!(
            Command::parse("Upper_bound_scan 42").unwrap(),
            Command::UpperBoundScan(42)
        );
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(Command::parse("Exploding 7").is_err());
        assert!(Command::parse("Inserting").is_err());
        assert!(Command::parse("Query 5 ->").is_err());
        assert!(Command::parse("Inserting seven").is_err());
    }

    #[test]
    fn test_render_parse_roundtrip() {
        let commands = vec![
            Command::Insert(1),
            Command::Update(2),
            Command::Delete(3),
            Command::Query(4, Some("4:".into())),
            Command::Query(5, None),
            Command::FullScan,
            Command::LowerBoundScan(6),
            Command::UpperBoundScan(7),
        ];
        for command in commands {
            assert_eq!(Command::parse(&command.render()).unwrap(), command);
        }
    }

    #[test]
    fn test_parse_script_skips_blank_lines() {
        let script = "Inserting 1\n\nDeleting 1\n";
        let commands = parse_script(script).unwrap();
        assert_eq!(commands, vec![Command::Insert(1), Command::Delete(1)]);
    }
}
