// Copyright 2019 Fullstop000 <fullstop1005@gmail.com>.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// See the License for the specific language governing permissions and
// limitations under the License.

//! Command-line front end over [`whitedb::Database`] (§6 "Command
//! surface"). A thin `clap`-derived dispatcher: every subcommand maps
//! onto one or two core calls and reports the result through
//! [`whitedb::error::exit_code`], matching the source `Main/wgdb.c`'s own
//! shape (attach, do the one thing the subcommand names, detach).
//!
//! Index-subsystem subcommands (`createindex`/`createhash`/`dropindex`/
//! `listindex`) have no core counterpart (the T-tree/hash indexing
//! subsystems are out of scope) and report that plainly instead of
//! quietly doing nothing.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use whitedb::db::Database;
use whitedb::encoding::Value;
use whitedb::error::{exit_code, DbError, Status};
use whitedb::options::{AttachKey, DbOptions};

#[derive(Parser)]
#[command(name = "wgdb", version, about = "WhiteDB database tool")]
struct Cli {
    /// Shared-memory key identifying the segment. Omit for the default.
    #[arg(long, global = true, default_value_t = 0)]
    shmname: i64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Free (destroy) the named shared-memory segment.
    Free,
    /// Create an empty database of the given size.
    Create {
        #[arg(default_value_t = whitedb::options::MIN_SEGMENT_SIZE)]
        size: usize,
        #[arg(long)]
        mode: Option<u32>,
        #[arg(short = 'l', long)]
        logging: bool,
    },
    /// Write a memory dump to disk.
    Export { filename: PathBuf },
    /// Read a memory dump from disk, overwriting existing contents.
    Import {
        filename: PathBuf,
        #[arg(short = 'l', long)]
        logging: bool,
    },
    /// Export data to a CSV file.
    Exportcsv { filename: PathBuf },
    /// Import data from a CSV file.
    Importcsv { filename: PathBuf },
    /// Replay a journal file into the attached segment.
    Replay { filename: PathBuf },
    /// Print information about the memory database.
    Info,
    /// Store a data row (int or string fields only).
    Add { values: Vec<String> },
    /// Print database contents.
    Select {
        /// Number of rows to print.
        count: usize,
        /// Row to start printing from.
        #[arg(default_value_t = 0)]
        start: usize,
    },
    /// Basic query: print rows whose column `col` compares against `value`.
    Query { col: usize, cond: String, value: String },
    /// Like query, but matching rows are deleted.
    Del { col: usize, cond: String, value: String },
    /// Store a JSON document (array-of-arrays or array-of-objects).
    Addjson { filename: PathBuf },
    /// Find documents with matching keys/values (col=value pairs).
    Findjson { json: String },
    /// Create a T-tree index on a column (no core counterpart).
    Createindex { column: usize },
    /// Create a hash index on columns (no core counterpart).
    Createhash { columns: Vec<usize> },
    /// Delete an index (no core counterpart).
    Dropindex { id: usize },
    /// List all indexes (no core counterpart).
    Listindex,
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();
    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("wgdb: {}", e);
            ExitCode::from(exit_code(e.status()) as u8)
        }
    }
}

fn key(cli: &Cli) -> AttachKey {
    AttachKey(cli.shmname)
}

fn run(cli: &Cli) -> whitedb::Result<()> {
    match &cli.command {
        Command::Free => {
            whitedb::mem::segment::Segment::delete_named(key(cli).normalized())?;
            println!("Database freed.");
            Ok(())
        }
        Command::Create { size, mode, logging } => {
            let mut opts = DbOptions::default()
                .with_key(key(cli))
                .with_size(*size)
                .with_logging(*logging);
            if let Some(mode) = mode {
                opts = opts.with_mode(*mode);
            }
            let db = Database::attach(&opts)?;
            println!("Database created.");
            db.detach();
            Ok(())
        }
        Command::Export { filename } => {
            let opts = DbOptions::default().with_key(key(cli)).with_logging(false);
            let db = attach_existing(&opts)?;
            db.dump(filename)?;
            println!("Database exported.");
            db.detach();
            Ok(())
        }
        Command::Import { filename, logging } => {
            let info = whitedb::dump::check_dump(filename)?;
            let opts = DbOptions::default()
                .with_key(key(cli))
                .with_size(info.maxsize)
                .with_logging(*logging);
            let mut db = Database::attach(&opts)?;
            db.import(filename)?;
            println!("Database imported.");
            db.detach();
            Ok(())
        }
        Command::Exportcsv { filename } => {
            let opts = DbOptions::default().with_key(key(cli)).with_logging(false);
            let db = attach_existing(&opts)?;
            export_csv(&db, filename)?;
            println!("Database exported to CSV.");
            db.detach();
            Ok(())
        }
        Command::Importcsv { filename } => {
            let opts = DbOptions::default().with_key(key(cli)).with_logging(false);
            let mut db = Database::attach(&opts)?;
            import_csv(&mut db, filename)?;
            println!("Database imported from CSV.");
            db.detach();
            Ok(())
        }
        Command::Replay { filename } => {
            let opts = DbOptions::default().with_key(key(cli)).with_logging(false);
            let mut db = Database::attach(&opts)?;
            db.replay(filename)?;
            println!("Log successfully imported from file.");
            db.detach();
            Ok(())
        }
        Command::Info => {
            let opts = DbOptions::default().with_key(key(cli)).with_logging(false);
            let db = attach_existing(&opts)?;
            print_info(&db);
            db.detach();
            Ok(())
        }
        Command::Add { values } => {
            let opts = DbOptions::default().with_key(key(cli)).with_logging(false);
            let mut db = Database::attach(&opts)?;
            add_row(&mut db, values)?;
            db.detach();
            Ok(())
        }
        Command::Select { count, start } => {
            let opts = DbOptions::default().with_key(key(cli)).with_logging(false);
            let db = attach_existing(&opts)?;
            select_rows(&db, *count, *start)?;
            db.detach();
            Ok(())
        }
        Command::Query { col, cond, value } => {
            let opts = DbOptions::default().with_key(key(cli)).with_logging(false);
            let db = Database::attach(&opts)?;
            for_each_matching(&db, *col, cond, value, |db, rec| print_row(db, rec))?;
            db.detach();
            Ok(())
        }
        Command::Del { col, cond, value } => {
            let opts = DbOptions::default().with_key(key(cli)).with_logging(false);
            let mut db = Database::attach(&opts)?;
            let matches = collect_matching(&db, *col, cond, value)?;
            for rec in matches {
                db.delete_record(rec)?;
            }
            db.detach();
            Ok(())
        }
        Command::Addjson { filename } => {
            let opts = DbOptions::default().with_key(key(cli)).with_logging(false);
            let mut db = Database::attach(&opts)?;
            let text = std::fs::read_to_string(filename)
                .map_err(|e| DbError::new(Status::SystemError, Some(&e.to_string())))?;
            import_json(&mut db, &text)?;
            db.detach();
            Ok(())
        }
        Command::Findjson { json } => {
            let opts = DbOptions::default().with_key(key(cli)).with_logging(false);
            let db = attach_existing(&opts)?;
            find_json(&db, json)?;
            db.detach();
            Ok(())
        }
        Command::Createindex { .. } | Command::Createhash { .. } | Command::Dropindex { .. } | Command::Listindex => {
            Err(DbError::new(
                Status::BadArgument,
                Some("index-subsystem commands are not implemented by this core"),
            ))
        }
    }
}

fn attach_existing(opts: &DbOptions) -> whitedb::Result<Database> {
    let opts = opts.clone();
    Database::attach(&DbOptions { create: false, ..opts })
}

fn print_info(db: &Database) {
    let mut count = 0usize;
    let mut rec = db.first_record();
    while let Some(r) = rec {
        count += 1;
        rec = db.next_record(r);
    }
    println!("Record count: {}", count);
}

fn format_value(v: &Value) -> String {
    match v {
        Value::Null => "NULL".to_string(),
        Value::SmallInt(i) | Value::FullInt(i) | Value::Var(i) | Value::AnonConst(i) => i.to_string(),
        Value::Double(d) => d.to_string(),
        Value::Fixpoint(d) => format!("{:.2}", d),
        Value::Char(c) => (*c as char).to_string(),
        Value::Date(d) => format!("date:{}", d),
        Value::Time(t) => format!("time:{}", t),
        Value::ShortStr(b) | Value::LongStr(whitedb::encoding::LongStrValue { payload: b, .. }) => {
            String::from_utf8_lossy(b).into_owned()
        }
        Value::RecordRef(off) => format!("ref:{}", off),
    }
}

fn print_row(db: &Database, rec: usize) -> whitedb::Result<()> {
    let fields = db.read_record(rec)?;
    let rendered: Vec<String> = fields.iter().map(format_value).collect();
    println!("{}", rendered.join(", "));
    Ok(())
}

fn select_rows(db: &Database, count: usize, start: usize) -> whitedb::Result<()> {
    let mut rec = db.first_record();
    let mut idx = 0usize;
    let mut printed = 0usize;
    while let Some(r) = rec {
        if idx >= start && printed < count {
            print_row(db, r)?;
            printed += 1;
        }
        if printed >= count {
            break;
        }
        idx += 1;
        rec = db.next_record(r);
    }
    Ok(())
}

/// Parses each `add` argument as an integer when possible, otherwise as a
/// string, matching the source's "only int or str recognized" note.
fn add_row(db: &mut Database, values: &[String]) -> whitedb::Result<()> {
    let rec = db.create_record(values.len())?;
    for (col, raw) in values.iter().enumerate() {
        let value = parse_cell(raw);
        db.set_field(rec, col, value)?;
    }
    Ok(())
}

fn parse_cell(raw: &str) -> Value {
    if let Ok(i) = raw.parse::<i64>() {
        Value::SmallInt(i)
    } else if raw.len() <= whitedb::encoding::SHORTSTR_MAX_PAYLOAD {
        Value::ShortStr(raw.as_bytes().to_vec())
    } else {
        Value::LongStr(whitedb::encoding::LongStrValue {
            kind: whitedb::encoding::LONGSTR_TYPE_STR,
            payload: raw.as_bytes().to_vec(),
            secondary: None,
        })
    }
}

fn compare(field: &Value, cond: &str, target: &str) -> bool {
    let ordering = match (field, target.parse::<i64>()) {
        (Value::SmallInt(a) | Value::FullInt(a) | Value::Var(a) | Value::AnonConst(a), Ok(b)) => a.cmp(&b),
        _ => format_value(field).as_str().cmp(target),
    };
    match cond {
        "=" | "==" => ordering == std::cmp::Ordering::Equal,
        "!=" => ordering != std::cmp::Ordering::Equal,
        "<" => ordering == std::cmp::Ordering::Less,
        "<=" => ordering != std::cmp::Ordering::Greater,
        ">" => ordering == std::cmp::Ordering::Greater,
        ">=" => ordering != std::cmp::Ordering::Less,
        _ => false,
    }
}

fn for_each_matching(
    db: &Database,
    col: usize,
    cond: &str,
    value: &str,
    mut f: impl FnMut(&Database, usize) -> whitedb::Result<()>,
) -> whitedb::Result<()> {
    let mut rec = db.first_record();
    while let Some(r) = rec {
        let next = db.next_record(r);
        if col < whitedb::record::field_count(db.segment(), r) {
            let field = db.get_field(r, col)?;
            if compare(&field, cond, value) {
                f(db, r)?;
            }
        }
        rec = next;
    }
    Ok(())
}

fn collect_matching(db: &Database, col: usize, cond: &str, value: &str) -> whitedb::Result<Vec<usize>> {
    let mut matches = Vec::new();
    for_each_matching(db, col, cond, value, |_, rec| {
        matches.push(rec);
        Ok(())
    })?;
    Ok(matches)
}

fn export_csv(db: &Database, path: &PathBuf) -> whitedb::Result<()> {
    let mut writer = csv::Writer::from_path(path)
        .map_err(|e| DbError::new(Status::SystemError, Some(&e.to_string())))?;
    let mut rec = db.first_record();
    while let Some(r) = rec {
        let fields = db.read_record(r)?;
        let row: Vec<String> = fields.iter().map(format_value).collect();
        writer
            .write_record(&row)
            .map_err(|e| DbError::new(Status::SystemError, Some(&e.to_string())))?;
        rec = db.next_record(r);
    }
    writer
        .flush()
        .map_err(|e| DbError::new(Status::SystemError, Some(&e.to_string())))?;
    Ok(())
}

fn import_csv(db: &mut Database, path: &PathBuf) -> whitedb::Result<()> {
    let mut reader = csv::Reader::from_path(path)
        .map_err(|e| DbError::new(Status::SystemError, Some(&e.to_string())))?;
    for result in reader.records() {
        let record = result.map_err(|e| DbError::new(Status::SystemError, Some(&e.to_string())))?;
        let rec = db.create_record(record.len())?;
        for (col, cell) in record.iter().enumerate() {
            db.set_field(rec, col, string_field(cell))?;
        }
    }
    Ok(())
}

/// CSV cells are read verbatim, with no type inference (§6.1): every cell
/// becomes a short or long string field depending only on its byte length.
fn string_field(cell: &str) -> Value {
    if cell.len() <= whitedb::encoding::SHORTSTR_MAX_PAYLOAD {
        Value::ShortStr(cell.as_bytes().to_vec())
    } else {
        Value::LongStr(whitedb::encoding::LongStrValue {
            kind: whitedb::encoding::LONGSTR_TYPE_STR,
            payload: cell.as_bytes().to_vec(),
            secondary: None,
        })
    }
}

/// Maps a `serde_json::Value` to a database [`Value`] per §6.1: numbers
/// become `SmallInt`/`FullInt`/`Double` depending on range and
/// fractionality, strings become `ShortStr`/`LongStr` by length, null
/// becomes `Null`, and booleans become `SmallInt(0|1)`.
fn json_to_value(v: &serde_json::Value) -> Value {
    match v {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::SmallInt(if *b { 1 } else { 0 }),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                if i >= i32::MIN as i64 && i <= i32::MAX as i64 {
                    Value::SmallInt(i)
                } else {
                    Value::FullInt(i)
                }
            } else {
                Value::Double(n.as_f64().unwrap_or(0.0))
            }
        }
        serde_json::Value::String(s) => string_field(s),
        other => string_field(&other.to_string()),
    }
}

fn import_json(db: &mut Database, text: &str) -> whitedb::Result<()> {
    let parsed: serde_json::Value = serde_json::from_str(text)
        .map_err(|e| DbError::new(Status::BadArgument, Some(&e.to_string())))?;
    let rows: Vec<Vec<serde_json::Value>> = match parsed {
        serde_json::Value::Array(items) => items
            .into_iter()
            .map(|item| match item {
                serde_json::Value::Array(cells) => cells,
                serde_json::Value::Object(map) => {
                    let mut cells: Vec<(usize, serde_json::Value)> = map
                        .into_iter()
                        .filter_map(|(k, v)| k.parse::<usize>().ok().map(|idx| (idx, v)))
                        .collect();
                    cells.sort_by_key(|(idx, _)| *idx);
                    cells.into_iter().map(|(_, v)| v).collect()
                }
                other => vec![other],
            })
            .collect(),
        other => vec![vec![other]],
    };
    for row in rows {
        let rec = db.create_record(row.len())?;
        for (col, cell) in row.iter().enumerate() {
            db.set_field(rec, col, json_to_value(cell))?;
        }
    }
    Ok(())
}

fn find_json(db: &Database, json: &str) -> whitedb::Result<()> {
    let parsed: serde_json::Value = serde_json::from_str(json)
        .map_err(|e| DbError::new(Status::BadArgument, Some(&e.to_string())))?;
    let filters: Vec<(usize, serde_json::Value)> = match parsed {
        serde_json::Value::Object(map) => map
            .into_iter()
            .filter_map(|(k, v)| k.parse::<usize>().ok().map(|idx| (idx, v)))
            .collect(),
        _ => {
            return Err(DbError::new(
                Status::BadArgument,
                Some("findjson expects a JSON object keyed by column index"),
            ))
        }
    };
    let mut rec = db.first_record();
    while let Some(r) = rec {
        let field_count = whitedb::record::field_count(db.segment(), r);
        let mut all_match = true;
        for (col, want) in &filters {
            if *col >= field_count {
                all_match = false;
                break;
            }
            let field = db.get_field(r, *col)?;
            if format_value(&field) != format_value(&json_to_value(want)) {
                all_match = false;
                break;
            }
        }
        if all_match {
            print_row(db, r)?;
        }
        rec = db.next_record(r);
    }
    Ok(())
}
