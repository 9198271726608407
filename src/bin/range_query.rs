//! range_query - read-only leaderboard queries
//!
//! Usage:
//!   range_query top [N] [--json]
//!   range_query search KEYWORD [N] [--json]
//!
//! Reads the database named by `RANGEWATCH_DB_PATH` while the runtime keeps
//! writing; WAL mode keeps the two from blocking each other.

use chrono::{TimeZone, Utc};
use rangewatch::pipeline::{PipelineConfig, RangeView, RankingService, SqliteStore};
use std::env;
use std::sync::Arc;

const DEFAULT_LIMIT: usize = 10;

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Top { limit: usize },
    Search { keyword: String, limit: usize },
}

#[derive(Debug, PartialEq, Eq)]
struct Args {
    command: Command,
    json: bool,
}

fn usage() -> String {
    "usage: range_query top [N] [--json] | range_query search KEYWORD [N] [--json]".to_string()
}

fn parse_limit(raw: Option<&String>) -> Result<usize, String> {
    match raw {
        None => Ok(DEFAULT_LIMIT),
        Some(raw) => raw
            .parse()
            .map_err(|_| format!("invalid limit {:?}\n{}", raw, usage())),
    }
}

fn parse_args(raw: &[String]) -> Result<Args, String> {
    let json = raw.iter().any(|a| a == "--json");
    let positional: Vec<&String> = raw.iter().filter(|a| *a != "--json").collect();

    let command = match positional.first().map(|s| s.as_str()) {
        Some("top") => Command::Top {
            limit: parse_limit(positional.get(1).copied())?,
        },
        Some("search") => {
            let keyword = positional.get(1).ok_or_else(usage)?.to_string();
            Command::Search {
                keyword,
                limit: parse_limit(positional.get(2).copied())?,
            }
        }
        _ => return Err(usage()),
    };

    Ok(Args { command, json })
}

fn format_table(views: &[RangeView]) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "{:<6}{:<40}{:<16}{:>8}{:>7}  {}\n",
        "RANK", "RANGE", "COUNTRY", "CALLS", "CLIS", "LAST SEEN"
    ));
    out.push_str(&"-".repeat(100));
    out.push('\n');

    for (i, view) in views.iter().enumerate() {
        let last_seen = Utc
            .timestamp_millis_opt(view.last_seen_at_millis)
            .single()
            .map(|t| t.format("%H:%M:%S").to_string())
            .unwrap_or_else(|| "-".to_string());
        out.push_str(&format!(
            "{:<6}{:<40}{:<16}{:>8}{:>7}  {}  {}\n",
            format!("#{}", i + 1),
            truncate(&view.name, 38),
            truncate(&view.source_key, 14),
            view.calls,
            view.cli_count,
            last_seen,
            view.recent_clis.join(", ")
        ));
    }
    out
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let head: String = s.chars().take(max.saturating_sub(3)).collect();
    format!("{}...", head)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"))
        .target(env_logger::Target::Stderr)
        .init();

    let raw: Vec<String> = env::args().skip(1).collect();
    let args = match parse_args(&raw) {
        Ok(args) => args,
        Err(msg) => {
            eprintln!("{}", msg);
            std::process::exit(2);
        }
    };

    let config = PipelineConfig::from_env()?;
    let store = Arc::new(SqliteStore::open(&config.db_path)?);
    let ranking = RankingService::new(store);

    let views = match &args.command {
        Command::Top { limit } => ranking.top_ranges(*limit)?,
        Command::Search { keyword, limit } => ranking.search(keyword, *limit)?,
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&views)?);
    } else if views.is_empty() {
        println!("No ranges found");
    } else {
        print!("{}", format_table(&views));
    }

    Ok(())
}
