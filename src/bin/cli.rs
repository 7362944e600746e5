//! lstore CLI
//!
//! Command-line interface for working with lstore tables on disk.

use std::process;

use clap::{Parser, Subcommand};
use lstore::{Config, Schema, Table, Value, ValueType};
use tracing_subscriber::{fmt, EnvFilter};

/// lstore CLI
#[derive(Parser, Debug)]
#[command(name = "lstore-cli")]
#[command(about = "CLI for the lstore columnar storage engine")]
#[command(version)]
struct Args {
    /// Data directory
    #[arg(short, long, default_value = "./lstore_data")]
    data_dir: String,

    /// Updates per page stack before a merge is queued
    #[arg(long, default_value = "2048")]
    merge_threshold: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create (or replace) a table
    Create {
        table: String,

        /// Column types, e.g. int,int,text
        #[arg(short, long, value_delimiter = ',')]
        columns: Vec<ValueType>,

        /// Index of the key column
        #[arg(short, long, default_value = "0")]
        key: usize,
    },

    /// Insert a row
    Insert {
        table: String,

        /// One literal per column
        values: Vec<String>,
    },

    /// Select rows by the value of a column
    Select {
        table: String,

        key: String,

        /// Column to search (defaults to the key column)
        #[arg(short, long)]
        column: Option<usize>,

        /// Relative version: 0 = newest, -1 = one update back
        #[arg(short, long, default_value = "0", allow_hyphen_values = true)]
        version: i64,
    },

    /// Update a row; "_" leaves a column unchanged
    Update {
        table: String,

        key: String,

        values: Vec<String>,
    },

    /// Delete a row
    Delete { table: String, key: String },

    /// Sum a column over a key range
    Sum {
        table: String,

        begin: String,

        end: String,

        /// Column to sum
        column: usize,

        #[arg(short, long, default_value = "0", allow_hyphen_values = true)]
        version: i64,
    },

    /// Merge every page stack now
    Merge { table: String },

    /// Show table statistics
    Info { table: String },
}

fn main() {
    // Initialize tracing/logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,lstore=debug"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();

    let args = Args::parse();

    let config = Config::builder()
        .data_dir(&args.data_dir)
        .merge_threshold(args.merge_threshold)
        .build();

    if let Err(e) = run(args.command, config) {
        tracing::error!("{}", e);
        process::exit(1);
    }
}

fn run(command: Commands, config: Config) -> lstore::Result<()> {
    match command {
        Commands::Create {
            table,
            columns,
            key,
        } => {
            let schema = Schema::new(columns, key)?;
            let table = Table::create(&table, schema, config)?;
            table.close()?;
            println!("OK");
        }
        Commands::Insert { table, values } => {
            let table = Table::open(&table, config)?;
            let row = parse_row(&table, &values)?;
            let inserted = table.insert(row)?;
            table.close()?;
            println!("{}", if inserted { "OK" } else { "DUPLICATE" });
        }
        Commands::Select {
            table,
            key,
            column,
            version,
        } => {
            let table = Table::open(&table, config)?;
            let column = column.unwrap_or(table.schema().key_column());
            let key = parse_value(&table, column, &key)?;
            let wanted = vec![true; table.schema().num_columns()];
            let records = table.select(&key, column, &wanted, version)?;
            if records.is_empty() {
                println!("(nil)");
            }
            for record in records {
                let row: Vec<String> = record
                    .columns
                    .iter()
                    .map(|v| v.as_ref().map(Value::to_string).unwrap_or_default())
                    .collect();
                println!("{}", row.join(" | "));
            }
            table.close()?;
        }
        Commands::Update { table, key, values } => {
            let table = Table::open(&table, config)?;
            let key = parse_value(&table, table.schema().key_column(), &key)?;
            let mut row = Vec::with_capacity(values.len());
            for (column, literal) in values.iter().enumerate() {
                row.push(match literal.as_str() {
                    "_" => None,
                    literal => Some(parse_value(&table, column, literal)?),
                });
            }
            let updated = table.update(&key, row)?;
            table.close()?;
            println!("{}", if updated { "OK" } else { "NOT FOUND" });
        }
        Commands::Delete { table, key } => {
            let table = Table::open(&table, config)?;
            let key = parse_value(&table, table.schema().key_column(), &key)?;
            let deleted = table.delete(&key)?;
            table.close()?;
            println!("{}", if deleted { "OK" } else { "NOT FOUND" });
        }
        Commands::Sum {
            table,
            begin,
            end,
            column,
            version,
        } => {
            let table = Table::open(&table, config)?;
            let key_column = table.schema().key_column();
            let begin = parse_value(&table, key_column, &begin)?;
            let end = parse_value(&table, key_column, &end)?;
            match table.sum_range(&begin, &end, key_column, column, version)? {
                Some(sum) => println!("{}", sum),
                None => println!("(nil)"),
            }
            table.close()?;
        }
        Commands::Merge { table } => {
            let table = Table::open(&table, config)?;
            let mut merged = 0;
            for page_id in 0..table.directory().stack_count() as u64 {
                if table.merge(page_id)?.is_some() {
                    merged += 1;
                }
            }
            table.close()?;
            println!("merged {} page stacks", merged);
        }
        Commands::Info { table } => {
            let table = Table::open(&table, config)?;
            let stats = table.stats()?;
            println!("table:           {}", stats.name);
            println!("columns:         {}", stats.num_columns);
            println!("key column:      {}", stats.key_column);
            println!("page stacks:     {}", stats.stacks);
            println!("tail page sets:  {}", stats.tail_page_sets);
            println!("live records:    {}", stats.live_records);
            println!("indexed columns: {:?}", stats.indexed_columns);
            table.close()?;
        }
    }
    Ok(())
}

fn parse_value(table: &Table, column: usize, literal: &str) -> lstore::Result<Value> {
    table.schema().check_column(column)?;
    table.schema().column_types()[column].parse(literal)
}

fn parse_row(table: &Table, literals: &[String]) -> lstore::Result<Vec<Value>> {
    literals
        .iter()
        .enumerate()
        .map(|(column, literal)| parse_value(table, column, literal))
        .collect()
}
