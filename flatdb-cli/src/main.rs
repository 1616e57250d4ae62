use clap::{Args, Parser, Subcommand, ValueEnum};
use flatdb::{Collection, CollectionOptions, Document, OptionsOverlay, Query, QueryValue, Update};
use std::path::PathBuf;
use std::process;

/// flatdb CLI: query and edit a flatdb collection file from the command line
#[derive(Parser)]
#[command(name = "flatdb", version, about)]
struct Cli {
    /// Collection file (overrides `path` from the config file)
    #[arg(long)]
    file: Option<PathBuf>,

    /// YAML or JSON config file with collection options
    #[arg(long)]
    config: Option<PathBuf>,

    /// Indent the collection file when writing it
    #[arg(long)]
    pretty: bool,

    /// Output format
    #[arg(long, default_value = "json")]
    format: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, ValueEnum)]
enum OutputFormat {
    Yaml,
    Json,
}

/// Field filters shared by every command that selects documents
#[derive(Args, Default)]
struct FilterArgs {
    /// Field equals value (e.g. --where role=admin, --where age=31); values are parsed as JSON when possible
    #[arg(long = "where", value_parser = parse_key_value)]
    equals: Vec<(String, String)>,

    /// String field matches a regular expression (e.g. --match name=^al)
    #[arg(long = "match", value_parser = parse_key_value)]
    patterns: Vec<(String, String)>,

    /// Field does not exist
    #[arg(long)]
    missing: Vec<String>,
}

#[derive(Subcommand)]
enum Command {
    /// List documents matching the filters
    Find {
        #[command(flatten)]
        filter: FilterArgs,
        /// Stop after this many documents
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Count documents matching the filters
    Count {
        #[command(flatten)]
        filter: FilterArgs,
    },

    /// Insert a document
    Insert {
        /// The document as a JSON object
        document: Option<String>,
        /// Field values (e.g. --field name="Alice Chen")
        #[arg(long = "field", value_parser = parse_key_value)]
        fields: Vec<(String, String)>,
    },

    /// Update documents matching the filters
    Update {
        #[command(flatten)]
        filter: FilterArgs,
        /// Field values to set (e.g. --set status=published)
        #[arg(long = "set", value_parser = parse_key_value)]
        set: Vec<(String, String)>,
        /// Fields to remove
        #[arg(long)]
        unset: Vec<String>,
    },

    /// Remove documents matching the filters
    Remove {
        #[command(flatten)]
        filter: FilterArgs,
        /// Show what would be removed without removing it
        #[arg(long)]
        dry_run: bool,
    },

    /// Parse the collection file and report its size
    Check,
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    let pos = s
        .find('=')
        .ok_or_else(|| format!("Invalid key=value pair: no '=' found in '{s}'"))?;
    Ok((s[..pos].to_string(), s[pos + 1..].to_string()))
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        eprintln!("ERROR:{e}");
        process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let overrides = OptionsOverlay {
        path: cli.file.clone(),
        pretty: cli.pretty.then_some(true),
        // Every command exits right after its write, so wait for it
        coalesce_writes: Some(false),
        ..Default::default()
    };
    let options = CollectionOptions::resolve(cli.config.as_deref(), &overrides)?;
    if options.path.is_none() {
        return Err("No collection file: pass --file or set `path` in --config".into());
    }
    log::debug!("Resolved options: {options:?}");

    let mut collection = Collection::open(options)?;

    match cli.command {
        Command::Find { filter, limit } => {
            let mut docs = collection.find(&build_query(&filter)?);
            if let Some(limit) = limit {
                docs.truncate(limit);
            }
            print_output(&documents_to_value(docs), &cli.format)?;
        }

        Command::Count { filter } => {
            let count = collection.count(&build_query(&filter)?);
            print_output(&serde_json::json!({ "count": count }), &cli.format)?;
        }

        Command::Insert { document, fields } => {
            let mut doc = match document {
                Some(text) => match serde_json::from_str(&text)? {
                    serde_json::Value::Object(map) => map,
                    _ => return Err("Document must be a JSON object".into()),
                },
                None => Document::new(),
            };
            for (key, value) in &fields {
                doc.insert(key.clone(), parse_value(value));
            }
            collection.insert(doc)?;
            print_output(
                &serde_json::json!({ "ok": true, "count": collection.len() }),
                &cli.format,
            )?;
        }

        Command::Update { filter, set, unset } => {
            let mut update = Update::new();
            for (key, value) in &set {
                update = update.set(key.clone(), parse_value(value));
            }
            for key in unset {
                update = update.unset(key);
            }
            let summary = collection.update(&build_query(&filter)?, &update)?;
            print_output(
                &serde_json::json!({
                    "ok": true,
                    "matched": summary.matched,
                    "replaced": summary.replaced,
                    "deleted": summary.deleted,
                }),
                &cli.format,
            )?;
        }

        Command::Remove { filter, dry_run } => {
            let query = build_query(&filter)?;
            if dry_run {
                let docs = collection.find(&query);
                print_output(
                    &serde_json::json!({
                        "dry_run": true,
                        "would_remove": docs.len(),
                        "documents": documents_to_value(docs),
                    }),
                    &cli.format,
                )?;
            } else {
                let removed = collection.remove(&query)?;
                print_output(
                    &serde_json::json!({ "ok": true, "removed": removed }),
                    &cli.format,
                )?;
            }
        }

        Command::Check => {
            print_output(
                &serde_json::json!({
                    "ok": true,
                    "file": collection.path().map(|p| p.display().to_string()),
                    "documents": collection.len(),
                }),
                &cli.format,
            )?;
        }
    }

    collection.flush()?;
    Ok(())
}

fn build_query(filter: &FilterArgs) -> Result<Query, Box<dyn std::error::Error>> {
    let mut query = Query::new();
    for (key, value) in &filter.equals {
        query = query.field(key.clone(), parse_value(value));
    }
    for (key, pattern) in &filter.patterns {
        query = query.field(key.clone(), QueryValue::pattern(pattern)?);
    }
    for key in &filter.missing {
        query = query.missing(key.clone());
    }
    Ok(query)
}

/// Parse a CLI value as JSON (numbers, booleans, arrays, objects), falling back to a string.
fn parse_value(raw: &str) -> serde_json::Value {
    serde_json::from_str(raw).unwrap_or_else(|_| serde_json::Value::String(raw.to_string()))
}

fn documents_to_value(docs: Vec<Document>) -> serde_json::Value {
    serde_json::Value::Array(docs.into_iter().map(serde_json::Value::Object).collect())
}

fn print_output(
    value: &serde_json::Value,
    format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(value)?),
        OutputFormat::Yaml => print!("{}", serde_yaml::to_string(value)?),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_key_value() {
        assert_eq!(
            parse_key_value("name=a=b").unwrap(),
            ("name".to_string(), "a=b".to_string())
        );
        assert!(parse_key_value("name").is_err());
    }

    #[test]
    fn test_parse_value_prefers_json() {
        assert_eq!(parse_value("31"), json!(31));
        assert_eq!(parse_value("true"), json!(true));
        assert_eq!(parse_value("[1,2]"), json!([1, 2]));
        assert_eq!(parse_value("alice"), json!("alice"));
        assert_eq!(parse_value("\"31\""), json!("31"));
    }

    #[test]
    fn test_build_query_combines_filters() {
        let filter = FilterArgs {
            equals: vec![("role".into(), "admin".into())],
            patterns: vec![("name".into(), "^a".into())],
            missing: vec!["deleted_at".into()],
        };
        let query = build_query(&filter).unwrap();
        let docs: Vec<Document> = [
            json!({"name": "alice", "role": "admin"}),
            json!({"name": "alex", "role": "admin", "deleted_at": 1}),
            json!({"name": "bob", "role": "admin"}),
        ]
        .into_iter()
        .filter_map(|v| v.as_object().cloned())
        .collect();
        assert_eq!(flatdb::search::search(&query, &docs), vec![0]);
    }

    #[test]
    fn test_build_query_rejects_bad_pattern() {
        let filter = FilterArgs {
            patterns: vec![("name".into(), "(".into())],
            ..Default::default()
        };
        assert!(build_query(&filter).is_err());
    }

    #[test]
    fn test_cli_parses() {
        let cli = Cli::try_parse_from([
            "flatdb", "--file", "db.json", "update", "--where", "role=admin", "--set", "active=true",
            "--unset", "legacy",
        ])
        .unwrap();
        match cli.command {
            Command::Update { filter, set, unset } => {
                assert_eq!(filter.equals, vec![("role".to_string(), "admin".to_string())]);
                assert_eq!(set, vec![("active".to_string(), "true".to_string())]);
                assert_eq!(unset, vec!["legacy".to_string()]);
            }
            _ => panic!("expected update"),
        }
    }
}
