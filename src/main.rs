use clap::{Parser, Subcommand};
use pxstore::crypto::password_checksum;
use pxstore::{Document, FieldType, OpenOptions, Value};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "pxstore", about = "Inspect and edit Paradox .DB/.PX/.MB files")]
struct Cli {
    /// Log engine activity to stderr
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show header metadata
    Info {
        input: PathBuf,
        #[arg(short, long)]
        password: Option<String>,
    },
    /// List field descriptors
    Fields {
        input: PathBuf,
    },
    /// Print records
    Dump {
        input: PathBuf,
        /// One JSON object per record
        #[arg(long)]
        json: bool,
        /// Blob file holding out-of-line values
        #[arg(long)]
        blob: Option<PathBuf>,
        /// Primary index file used for lookups
        #[arg(long)]
        index: Option<PathBuf>,
        #[arg(short, long)]
        password: Option<String>,
    },
    /// Append a record; one value per field, empty for NULL
    Insert {
        input: PathBuf,
        #[arg(long)]
        blob: Option<PathBuf>,
        #[arg(required = true, num_args = 1..)]
        values: Vec<String>,
    },
    /// Overwrite one field of a record
    Set {
        input: PathBuf,
        recno: u32,
        field: String,
        value: String,
        #[arg(long)]
        blob: Option<PathBuf>,
    },
    /// Delete a record
    Delete {
        input: PathBuf,
        recno: u32,
        #[arg(long)]
        blob: Option<PathBuf>,
    },
    /// Walk the block chain and report inconsistencies
    Check {
        input: PathBuf,
    },
    /// Write a primary index file for an indexed table
    WriteIndex {
        input: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Print the checksum a password is stored as
    Checksum {
        password: String,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let default = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)))
        .with_writer(std::io::stderr)
        .init();

    match cli.command {

        // ── Info ─────────────────────────────────────────────────────────────
        Commands::Info { input, password } => {
            let doc = Document::open_path(&input, OpenOptions { writable: false, password })?;
            let h = doc.header();
            println!("── Paradox file ─────────────────────────────────────────");
            println!("  Path           {}", input.display());
            println!("  File type      {}", h.file_type.description());
            println!("  Version        {}.{}", h.version / 10, h.version % 10);
            println!("  Table name     {}", h.table_name);
            println!("  Records        {}", h.num_records);
            println!("  Fields         {}", h.fields.len());
            println!("  Record size    {} B", h.record_size);
            println!("  Header size    {} B", h.header_size);
            println!("  Block size     {} B", h.block_size());
            println!("  Blocks         {} (first {}, last {})", h.file_blocks, h.first_block, h.last_block);
            println!("  Capacity       {} records", h.theoretical_records());
            println!("  Key fields     {}", h.primary_key_fields);
            println!("  Autoincrement  {}", h.auto_inc);
            println!("  Codepage       {}", h.codepage);
            println!("  Sort order     0x{:02x}", h.sort_order);
            println!("  Encrypted      {}", doc.is_encrypted());
            if doc.is_encrypted() {
                println!("  Checksum       0x{:08x}", h.encryption);
            }
        }

        // ── Fields ───────────────────────────────────────────────────────────
        Commands::Fields { input } => {
            let doc = Document::open_path(&input, OpenOptions::default())?;
            println!("{:<4} {:<26} {:<10} {:>6}", "#", "Name", "Type", "Length");
            for (i, f) in doc.fields().iter().enumerate() {
                let len = match f.field_type {
                    FieldType::Bcd => format!("{},{}", f.len, f.decimals),
                    _              => f.len.to_string(),
                };
                println!("{:<4} {:<26} {:<10} {:>6}", i, f.name, f.field_type.name(), len);
            }
        }

        // ── Dump ─────────────────────────────────────────────────────────────
        Commands::Dump { input, json, blob, index, password } => {
            let mut doc = Document::open_path(&input, OpenOptions { writable: false, password })?;
            attach_blob(&mut doc, blob.as_deref())?;
            if let Some(path) = index {
                let mut px = Document::open_path(&path, OpenOptions::default())?;
                doc.add_primary_index(&mut px)?;
            }
            let names: Vec<String> = doc.fields().iter().map(|f| f.name.clone()).collect();
            if !json {
                println!("{}", names.join("\t"));
            }
            for recno in 0..doc.record_count() {
                let values = doc.get_record(recno)?;
                if json {
                    let obj: serde_json::Map<String, serde_json::Value> = names
                        .iter()
                        .cloned()
                        .zip(values.iter().map(serde_json::to_value))
                        .map(|(k, v)| v.map(|v| (k, v)))
                        .collect::<Result<_, _>>()?;
                    println!("{}", serde_json::Value::Object(obj));
                } else {
                    let cells: Vec<String> = values.iter().map(Value::display).collect();
                    println!("{}", cells.join("\t"));
                }
            }
        }

        // ── Insert ───────────────────────────────────────────────────────────
        Commands::Insert { input, blob, values } => {
            let mut doc = Document::open_path(&input, OpenOptions { writable: true, password: None })?;
            attach_blob(&mut doc, blob.as_deref())?;
            if values.len() != doc.field_count() {
                return Err(format!("{} values given for {} fields", values.len(), doc.field_count()).into());
            }
            let parsed = doc
                .fields()
                .iter()
                .zip(&values)
                .map(|(f, v)| Value::parse(v, f))
                .collect::<Result<Vec<_>, _>>()?;
            let recno = doc.insert_record(&parsed)?;
            doc.close()?;
            println!("Inserted record {recno}");
        }

        // ── Set ──────────────────────────────────────────────────────────────
        Commands::Set { input, recno, field, value, blob } => {
            let mut doc = Document::open_path(&input, OpenOptions { writable: true, password: None })?;
            attach_blob(&mut doc, blob.as_deref())?;
            let i = doc.field_index(&field).ok_or_else(|| format!("no field named '{field}'"))?;
            let v = Value::parse(&value, &doc.fields()[i])?;
            doc.set_field(recno, i, &v)?;
            doc.close()?;
            println!("Updated record {recno}, field {field}");
        }

        // ── Delete ───────────────────────────────────────────────────────────
        Commands::Delete { input, recno, blob } => {
            let mut doc = Document::open_path(&input, OpenOptions { writable: true, password: None })?;
            attach_blob(&mut doc, blob.as_deref())?;
            doc.delete_record(recno)?;
            doc.close()?;
            println!("Deleted record {recno}");
        }

        // ── Check ────────────────────────────────────────────────────────────
        Commands::Check { input } => {
            let mut doc = Document::open_path(&input, OpenOptions::default())?;
            let mut found = doc.take_warnings();
            found.extend(doc.verify()?);
            if found.is_empty() {
                println!("{}: no problems found", input.display());
            } else {
                for w in &found {
                    println!("warning: {w}");
                }
                println!("{}: {} problem(s)", input.display(), found.len());
            }
        }

        // ── Write index ──────────────────────────────────────────────────────
        Commands::WriteIndex { input, output } => {
            let mut doc = Document::open_path(&input, OpenOptions::default())?;
            let mut px = doc.create_primary_index_path(&output)?;
            doc.write_primary_index(&mut px)?;
            px.close()?;
            println!("Wrote {} index entries to {}", px.record_count(), output.display());
        }

        // ── Checksum ─────────────────────────────────────────────────────────
        Commands::Checksum { password } => {
            println!("0x{:08x}", password_checksum(&password));
        }
    }

    Ok(())
}

// ── helpers ──────────────────────────────────────────────────────────────────

fn attach_blob(doc: &mut Document, path: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(p) = path {
        doc.attach_blob_path(p)?;
    }
    Ok(())
}
