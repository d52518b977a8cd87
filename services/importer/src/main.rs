//! Importer Service - Loads AM market spreadsheet exports into the explorer database
//!
//! Responsibilities:
//! - Read XLSX workbooks and delimited text exports (comma or semicolon)
//! - Normalize cell values (trimming, numeric/date coercion, alias canonicalization)
//! - Aggregate repeated rows into one company plus its equipment records
//! - Upsert normalized rows in bounded batches, tolerating partial batch failure
//! - Track import runs and skip files already imported (content hash)
//!
//! One invocation processes one file (or a config of files) start to finish,
//! strictly sequentially. A missing source file aborts the run; everything
//! else degrades to skip counts and diagnostics in the final summary.
//!
//! Usage:
//!   # Single file:
//!   cargo run --bin importer -- --dataset companies --file data/company-info.xlsx
//!
//!   # All configured datasets:
//!   cargo run --bin importer -- --config config/datasets.json

use anyhow::{Context, Result};
use calamine::{open_workbook_auto, Data, Reader};
use chrono::NaiveDate;
use clap::{Parser, ValueEnum};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, QueryBuilder};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::{Path, PathBuf};
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "importer", about = "Imports AM market spreadsheets into the explorer database")]
struct Args {
    /// Path to the source file (XLSX/XLS or CSV)
    #[arg(long)]
    file: Option<PathBuf>,

    /// Which dataset the file contains
    #[arg(long, value_enum)]
    dataset: Option<Dataset>,

    /// Worksheet name override (XLSX only)
    #[arg(long)]
    sheet: Option<String>,

    /// Field delimiter override (CSV only)
    #[arg(long)]
    delimiter: Option<char>,

    /// Maximum rows per upsert batch
    #[arg(long)]
    batch_size: Option<usize>,

    /// Path to datasets config file (for batch mode)
    #[arg(long)]
    config: Option<String>,

    /// Parse and aggregate but write nothing
    #[arg(long, default_value = "false")]
    dry_run: bool,

    /// Re-import even if an identical file was already imported
    #[arg(long, default_value = "false")]
    force: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "kebab-case")]
enum Dataset {
    /// Company roster with per-row equipment ("Company Information" sheet)
    Companies,
    /// Service-provider pricing quotes ("SP Pricing" sheet)
    Pricing,
    /// Market size estimates by year/segment/region
    MarketSize,
    /// Merger & acquisition records
    Mergers,
}

impl Dataset {
    fn label(&self) -> &'static str {
        match self {
            Dataset::Companies => "companies",
            Dataset::Pricing => "pricing",
            Dataset::MarketSize => "market-size",
            Dataset::Mergers => "mergers",
        }
    }

    /// Sheet names are part of the contract with the workbook exports.
    fn default_sheet(&self) -> Option<&'static str> {
        match self {
            Dataset::Companies => Some("Company Information"),
            Dataset::Pricing => Some("SP Pricing"),
            Dataset::MarketSize | Dataset::Mergers => None,
        }
    }
}

#[derive(Debug, Clone)]
struct Config {
    db_url: String,
    batch_size: usize,
}

impl Config {
    fn from_env() -> Result<Self> {
        Ok(Self {
            db_url: std::env::var("DB_URL").context("DB_URL env var missing")?,
            batch_size: std::env::var("BATCH_SIZE")
                .unwrap_or_else(|_| "200".to_string())
                .parse()
                .unwrap_or(200),
        })
    }
}

/// Everything one run needs, resolved from flags/config/env up front.
#[derive(Debug, Clone)]
struct RunSpec {
    dataset: Dataset,
    file: PathBuf,
    sheet: Option<String>,
    delimiter: Option<char>,
    batch_size: usize,
    dry_run: bool,
    force: bool,
}

// =============================================================================
// RUN REPORT - accumulated counts and diagnostics, one per run
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunPhase {
    Idle,
    Reading,
    Normalizing,
    Aggregating,
    Upserting,
    Done,
    /// Terminal: the source file was absent, nothing was processed.
    Aborted,
}

impl RunPhase {
    fn as_str(&self) -> &'static str {
        match self {
            RunPhase::Idle => "idle",
            RunPhase::Reading => "reading",
            RunPhase::Normalizing => "normalizing",
            RunPhase::Aggregating => "aggregating",
            RunPhase::Upserting => "upserting",
            RunPhase::Done => "done",
            RunPhase::Aborted => "aborted",
        }
    }
}

/// Run-level result value. The driver decides the exit code from this;
/// nothing below the driver aborts the process.
#[derive(Debug)]
struct ImportReport {
    dataset: Dataset,
    phase: RunPhase,
    rows_read: usize,
    rows_skipped: usize,
    entities: usize,
    written: usize,
    failed: usize,
    diagnostics: Vec<String>,
    skip_samples: Vec<String>,
}

impl ImportReport {
    fn new(dataset: Dataset) -> Self {
        Self {
            dataset,
            phase: RunPhase::Idle,
            rows_read: 0,
            rows_skipped: 0,
            entities: 0,
            written: 0,
            failed: 0,
            diagnostics: Vec::new(),
            skip_samples: Vec::new(),
        }
    }

    fn skip_row(&mut self, location: &str) {
        self.rows_skipped += 1;
        if self.skip_samples.len() < 5 {
            self.skip_samples.push(location.to_string());
        }
    }

    fn absorb_sink(&mut self, sink: SinkReport, table: &str) {
        println!(
            "  {}: {} written, {} failed across {} batches",
            table, sink.written, sink.failed, sink.batches
        );
        self.written += sink.written;
        self.failed += sink.failed;
        for err in sink.errors {
            self.diagnostics.push(format!("{}: {}", table, err));
        }
    }

    fn print_summary(&self) {
        println!("\n=== Import Summary ===");
        println!("Dataset: {}", self.dataset.label());
        println!("Phase reached: {}", self.phase.as_str());
        println!("Rows read: {} ({} skipped)", self.rows_read, self.rows_skipped);
        println!("Entities: {}", self.entities);
        println!("Written: {}", self.written);
        println!("Failed: {}", self.failed);
        if !self.skip_samples.is_empty() {
            println!("First skipped rows: {}", self.skip_samples.join(", "));
        }
        if !self.diagnostics.is_empty() {
            println!("Diagnostics ({}):", self.diagnostics.len());
            for (i, d) in self.diagnostics.iter().take(5).enumerate() {
                println!("  [{}] {}", i + 1, d);
            }
            if self.diagnostics.len() > 5 {
                println!("  ... and {} more", self.diagnostics.len() - 5);
            }
        }
    }
}

// =============================================================================
// SOURCE READER - file -> ordered rows of raw cells
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Cell {
    Text(String),
    Number(f64),
    Date(NaiveDate),
    Empty,
}

const EMPTY_CELL: Cell = Cell::Empty;

/// One source row: raw cells in header order plus a provenance location.
#[derive(Debug, Clone)]
struct RawRow {
    location: String,
    cells: Vec<Cell>,
}

impl RawRow {
    fn cell(&self, idx: usize) -> &Cell {
        self.cells.get(idx).unwrap_or(&EMPTY_CELL)
    }
}

#[derive(Debug, Default)]
struct SheetRows {
    headers: Vec<String>,
    rows: Vec<RawRow>,
    skipped_short: usize,
}

/// The one fatal input error: the file itself is absent or unreadable.
fn read_source_bytes(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("cannot read source file {}", path.display()))
}

fn is_excel_path(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()).map(|e| e.to_lowercase()).as_deref(),
        Some("xlsx") | Some("xls") | Some("xlsb") | Some("ods")
    )
}

/// Exports are UTF-8 except some older ones saved from Windows Excel.
fn decode_text(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(s) => s.to_string(),
        Err(_) => {
            let (cow, _, _) = encoding_rs::WINDOWS_1252.decode(bytes);
            cow.into_owned()
        }
    }
}

fn read_csv_rows(bytes: &[u8], delimiter: u8) -> Result<SheetRows> {
    let text = decode_text(bytes);
    let text = text.strip_prefix('\u{feff}').unwrap_or(&text);

    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(text.as_bytes());

    let headers: Vec<String> = reader
        .headers()
        .context("failed to read CSV header row")?
        .iter()
        .map(|h| h.to_string())
        .collect();

    let mut rows = Vec::new();
    let mut skipped_short = 0;

    for (idx, result) in reader.records().enumerate() {
        let line = idx + 2; // header is line 1
        let record = match result {
            Ok(r) => r,
            Err(e) => {
                eprintln!("  warning: dropping line {}: {}", line, e);
                skipped_short += 1;
                continue;
            }
        };
        // Short rows cannot be mapped to the header contract.
        if record.len() < headers.len() {
            skipped_short += 1;
            continue;
        }
        let cells = record
            .iter()
            .take(headers.len())
            .map(|field| {
                if field.is_empty() {
                    Cell::Empty
                } else {
                    Cell::Text(field.to_string())
                }
            })
            .collect();
        rows.push(RawRow {
            location: format!("csv:line={}", line),
            cells,
        });
    }

    Ok(SheetRows {
        headers,
        rows,
        skipped_short,
    })
}

/// Excel serial dates count days from the 1899-12-30 epoch.
fn excel_serial_to_date(serial: f64) -> Option<NaiveDate> {
    if !serial.is_finite() {
        return None;
    }
    NaiveDate::from_ymd_opt(1899, 12, 30)?.checked_add_signed(chrono::Duration::days(serial.trunc() as i64))
}

fn cell_from_excel(data: &Data) -> Cell {
    match data {
        Data::Empty => Cell::Empty,
        Data::String(s) => {
            if s.trim().is_empty() {
                Cell::Empty
            } else {
                Cell::Text(s.clone())
            }
        }
        Data::Float(f) => Cell::Number(*f),
        Data::Int(i) => Cell::Number(*i as f64),
        Data::Bool(b) => Cell::Text(b.to_string()),
        Data::DateTime(dt) => match excel_serial_to_date(dt.as_f64()) {
            Some(d) => Cell::Date(d),
            None => Cell::Empty,
        },
        Data::DateTimeIso(s) => match NaiveDate::parse_from_str(s.get(..10).unwrap_or(s), "%Y-%m-%d") {
            Ok(d) => Cell::Date(d),
            Err(_) => Cell::Text(s.clone()),
        },
        Data::DurationIso(s) => Cell::Text(s.clone()),
        Data::Error(_) => Cell::Empty,
    }
}

/// Read one worksheet. A missing sheet yields an empty row set, not an error:
/// several workbook exports carry optional sheets.
fn read_excel_rows(path: &Path, sheet: Option<&str>) -> Result<SheetRows> {
    let mut workbook = open_workbook_auto(path)
        .with_context(|| format!("failed to open workbook {}", path.display()))?;

    let sheet_names = workbook.sheet_names().to_vec();
    let selected = match sheet {
        Some(name) => match sheet_names
            .iter()
            .find(|n| n.trim().eq_ignore_ascii_case(name.trim()))
        {
            Some(n) => n.clone(),
            None => {
                println!(
                    "  sheet '{}' not present (workbook has {:?}) - nothing to read",
                    name, sheet_names
                );
                return Ok(SheetRows::default());
            }
        },
        None => match sheet_names.first() {
            Some(n) => n.clone(),
            None => return Ok(SheetRows::default()),
        },
    };

    let range = workbook
        .worksheet_range(&selected)
        .with_context(|| format!("failed to read sheet '{}'", selected))?;

    let mut rows_iter = range.rows();
    let Some(header_row) = rows_iter.next() else {
        return Ok(SheetRows::default());
    };

    let headers: Vec<String> = header_row
        .iter()
        .map(|cell| match cell {
            Data::String(s) => s.trim().to_string(),
            Data::Empty => String::new(),
            other => format!("{}", other),
        })
        .collect();

    let mut rows = Vec::new();
    for (row_idx, row) in rows_iter.enumerate() {
        let cells: Vec<Cell> = (0..headers.len())
            .map(|i| row.get(i).map(cell_from_excel).unwrap_or(Cell::Empty))
            .collect();
        if cells.iter().all(|c| *c == Cell::Empty) {
            continue;
        }
        rows.push(RawRow {
            location: format!("xlsx:sheet='{}':row={}", selected, row_idx + 2),
            cells,
        });
    }

    Ok(SheetRows {
        headers,
        rows,
        skipped_short: 0,
    })
}

// =============================================================================
// FIELD NORMALIZER - total coercion rules, one bad cell never blocks a row
// =============================================================================

fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        n.to_string()
    }
}

/// Trimmed text, with the spreadsheet blank markers collapsed to None.
fn trim_or_null(cell: &Cell) -> Option<String> {
    let text = match cell {
        Cell::Text(s) => s.trim().to_string(),
        Cell::Number(n) => format_number(*n),
        Cell::Date(d) => d.format("%Y-%m-%d").to_string(),
        Cell::Empty => return None,
    };
    if text.is_empty() || text == "-" || text.eq_ignore_ascii_case("n/a") {
        None
    } else {
        Some(text)
    }
}

/// Strip currency symbols, thousands separators and unit suffixes, then parse.
/// Total: anything that does not survive as a finite number becomes None.
fn to_number(cell: &Cell) -> Option<f64> {
    match cell {
        Cell::Number(n) if n.is_finite() => Some(*n),
        Cell::Number(_) => None,
        Cell::Text(s) => {
            let cleaned: String = s
                .chars()
                .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
                .collect();
            if cleaned.is_empty() {
                return None;
            }
            cleaned.parse::<f64>().ok().filter(|n| n.is_finite())
        }
        _ => None,
    }
}

/// The date layouts seen across the workbook and CSV exports.
const DATE_FORMATS: &[&str] = &[
    "%Y-%m-%d",
    "%m/%d/%Y",
    "%d/%m/%Y",
    "%Y/%m/%d",
    "%B %d, %Y",
    "%b %d, %Y",
    "%d-%b-%Y",
];

fn to_date(cell: &Cell) -> Option<NaiveDate> {
    match cell {
        Cell::Date(d) => Some(*d),
        Cell::Number(n) => {
            let year = *n as i32;
            if n.fract() == 0.0 && (1900..=2100).contains(&year) {
                NaiveDate::from_ymd_opt(year, 1, 1)
            } else {
                None
            }
        }
        Cell::Text(s) => {
            let s = s.trim();
            if s.is_empty() {
                return None;
            }
            for fmt in DATE_FORMATS {
                if let Ok(d) = NaiveDate::parse_from_str(s, fmt) {
                    return Some(d);
                }
            }
            // Bare year: common in M&A exports.
            if let Ok(year) = s.parse::<i32>() {
                if (1900..=2100).contains(&year) {
                    return NaiveDate::from_ymd_opt(year, 1, 1);
                }
            }
            None
        }
        Cell::Empty => None,
    }
}

/// Alias lookup on the trimmed, lowercased value. Unmapped values pass
/// through unchanged: an unknown value is still informative.
fn canonicalize(cell: &Cell, aliases: &[(&str, &str)]) -> Option<String> {
    let value = trim_or_null(cell)?;
    let key = value.to_lowercase();
    for (alias, canonical) in aliases {
        if *alias == key {
            return Some((*canonical).to_string());
        }
    }
    Some(value)
}

const COUNTRY_ALIASES: &[(&str, &str)] = &[
    ("usa", "United States"),
    ("us", "United States"),
    ("u.s.", "United States"),
    ("u.s.a.", "United States"),
    ("united states of america", "United States"),
    ("uk", "United Kingdom"),
    ("u.k.", "United Kingdom"),
    ("great britain", "United Kingdom"),
    ("england", "United Kingdom"),
    ("korea", "South Korea"),
    ("republic of korea", "South Korea"),
    ("prc", "China"),
    ("people's republic of china", "China"),
    ("holland", "Netherlands"),
    ("the netherlands", "Netherlands"),
    ("uae", "United Arab Emirates"),
    ("czech republic", "Czechia"),
];

const SEGMENT_ALIASES: &[(&str, &str)] = &[
    ("industrial", "Industrial"),
    ("industrial systems", "Industrial"),
    ("professional", "Professional"),
    ("prosumer", "Professional"),
    ("desktop", "Desktop"),
    ("consumer", "Desktop"),
    ("service", "Service"),
    ("services", "Service"),
];

const COUNT_TYPE_ALIASES: &[(&str, &str)] = &[
    ("estimate", "Estimated"),
    ("estimated", "Estimated"),
    ("est", "Estimated"),
    ("est.", "Estimated"),
    ("approximate", "Estimated"),
    ("actual", "Actual"),
    ("exact", "Actual"),
    ("reported", "Actual"),
    ("minimum", "Minimum"),
    ("min", "Minimum"),
    ("at least", "Minimum"),
    ("range", "Range"),
    ("forecast", "Forecast"),
    ("projected", "Forecast"),
    ("projection", "Forecast"),
];

const PROCESS_ALIASES: &[(&str, &str)] = &[
    ("fused deposition modeling", "FDM"),
    ("fused filament fabrication", "FDM"),
    ("fff", "FDM"),
    ("material extrusion", "FDM"),
    ("stereolithography", "SLA"),
    ("vat photopolymerization", "SLA"),
    ("selective laser sintering", "SLS"),
    ("multi jet fusion", "MJF"),
    ("direct metal laser sintering", "DMLS"),
    ("selective laser melting", "SLM"),
    ("powder bed fusion", "PBF"),
    ("binder jetting", "BJT"),
    ("material jetting", "MJT"),
    ("directed energy deposition", "DED"),
];

// =============================================================================
// COLUMN MAPPING - header candidate lists are the contract with the files
// =============================================================================

const COMPANY_NAME_COLUMNS: &[&str] = &["company name", "company", "name"];
const WEBSITE_COLUMNS: &[&str] = &["website", "url", "web site"];
const CITY_COLUMNS: &[&str] = &["city", "headquarters city", "hq city"];
const COUNTRY_COLUMNS: &[&str] = &["country", "hq country", "headquarters country"];
const SEGMENT_COLUMNS: &[&str] = &["segment", "market segment"];
const COMPANY_TYPE_COLUMNS: &[&str] = &["company type", "type", "role"];
const PROCESS_COLUMNS: &[&str] = &["process", "technology", "am process"];
const MANUFACTURER_COLUMNS: &[&str] = &["printer manufacturer", "manufacturer", "machine manufacturer"];
const MODEL_COLUMNS: &[&str] = &["printer model", "model", "machine model"];
const COUNT_COLUMNS: &[&str] = &["number of printers", "printer count", "machine count", "count", "units"];
const COUNT_TYPE_COLUMNS: &[&str] = &["count type", "count qualifier"];
const MATERIAL_COLUMNS: &[&str] = &["material", "material type", "material format"];

const PRICING_COMPANY_COLUMNS: &[&str] = &["company name", "company", "provider", "service provider"];
const QUANTITY_COLUMNS: &[&str] = &["quantity", "qty", "order quantity"];
const PRICE_COLUMNS: &[&str] = &["price", "unit price", "price (usd)", "total price"];
const LEAD_TIME_COLUMNS: &[&str] = &["lead time", "lead time (days)", "delivery days"];

const YEAR_COLUMNS: &[&str] = &["year", "calendar year", "period"];
const REGION_COLUMNS: &[&str] = &["region", "geography"];
const VALUE_COLUMNS: &[&str] = &["value", "value (usd m)", "revenue", "market size"];
const ESTIMATE_TYPE_COLUMNS: &[&str] = &["estimate type", "value type"];

const ACQUIRER_COLUMNS: &[&str] = &["acquirer", "acquiring company", "buyer"];
const TARGET_COLUMNS: &[&str] = &["target", "acquired company", "company acquired"];
const DEAL_DATE_COLUMNS: &[&str] = &["announced date", "announcement date", "date"];
const DEAL_SIZE_COLUMNS: &[&str] = &["deal size", "deal value", "amount", "amount (usd m)"];

/// Exact matches win over substring matches so "company" cannot claim the
/// "Company Type" column when "Company Name" is also present.
fn find_column(headers: &[String], candidates: &[&str]) -> Option<usize> {
    for (idx, header) in headers.iter().enumerate() {
        let normalized = header.trim().to_lowercase();
        if candidates.iter().any(|c| normalized == *c) {
            return Some(idx);
        }
    }
    for (idx, header) in headers.iter().enumerate() {
        let normalized = header.trim().to_lowercase();
        if candidates.iter().any(|c| normalized.contains(c)) {
            return Some(idx);
        }
    }
    None
}

#[derive(Debug)]
struct CompanyColumns {
    name: usize,
    website: Option<usize>,
    city: Option<usize>,
    country: Option<usize>,
    segment: Option<usize>,
    company_type: Option<usize>,
    process: Option<usize>,
    manufacturer: Option<usize>,
    model: Option<usize>,
    count: Option<usize>,
    count_type: Option<usize>,
    material: Option<usize>,
}

impl CompanyColumns {
    fn detect(headers: &[String]) -> Result<Self> {
        let mut cols = Self {
            name: find_column(headers, COMPANY_NAME_COLUMNS).context(
                "no company name column found; expected one of: company name, company, name",
            )?,
            website: find_column(headers, WEBSITE_COLUMNS),
            city: find_column(headers, CITY_COLUMNS),
            country: find_column(headers, COUNTRY_COLUMNS),
            segment: find_column(headers, SEGMENT_COLUMNS),
            company_type: find_column(headers, COMPANY_TYPE_COLUMNS),
            process: find_column(headers, PROCESS_COLUMNS),
            manufacturer: find_column(headers, MANUFACTURER_COLUMNS),
            model: find_column(headers, MODEL_COLUMNS),
            count: find_column(headers, COUNT_COLUMNS),
            count_type: find_column(headers, COUNT_TYPE_COLUMNS),
            material: find_column(headers, MATERIAL_COLUMNS),
        };
        // A lone "Count Type" header must not double as the count column.
        if cols.count == cols.count_type {
            cols.count = None;
        }
        Ok(cols)
    }
}

#[derive(Debug)]
struct PricingColumns {
    company: usize,
    process: usize,
    material: usize,
    quantity: usize,
    price: Option<usize>,
    lead_time: Option<usize>,
    country: Option<usize>,
}

impl PricingColumns {
    fn detect(headers: &[String]) -> Result<Self> {
        Ok(Self {
            company: find_column(headers, PRICING_COMPANY_COLUMNS)
                .context("no company column found; expected one of: company, provider, service provider")?,
            process: find_column(headers, PROCESS_COLUMNS)
                .context("no process column found; expected one of: process, technology")?,
            material: find_column(headers, MATERIAL_COLUMNS)
                .context("no material column found; expected one of: material, material type")?,
            quantity: find_column(headers, QUANTITY_COLUMNS)
                .context("no quantity column found; expected one of: quantity, qty, order quantity")?,
            price: find_column(headers, PRICE_COLUMNS),
            lead_time: find_column(headers, LEAD_TIME_COLUMNS),
            country: find_column(headers, COUNTRY_COLUMNS),
        })
    }
}

#[derive(Debug)]
struct MarketSizeColumns {
    year: usize,
    segment: usize,
    region: Option<usize>,
    value: Option<usize>,
    estimate_type: Option<usize>,
}

impl MarketSizeColumns {
    fn detect(headers: &[String]) -> Result<Self> {
        Ok(Self {
            year: find_column(headers, YEAR_COLUMNS)
                .context("no year column found; expected one of: year, calendar year, period")?,
            segment: find_column(headers, SEGMENT_COLUMNS)
                .context("no segment column found; expected one of: segment, market segment")?,
            region: find_column(headers, REGION_COLUMNS),
            value: find_column(headers, VALUE_COLUMNS),
            estimate_type: find_column(headers, ESTIMATE_TYPE_COLUMNS),
        })
    }
}

#[derive(Debug)]
struct DealColumns {
    acquirer: usize,
    target: usize,
    date: Option<usize>,
    size: Option<usize>,
    country: Option<usize>,
}

impl DealColumns {
    fn detect(headers: &[String]) -> Result<Self> {
        Ok(Self {
            acquirer: find_column(headers, ACQUIRER_COLUMNS)
                .context("no acquirer column found; expected one of: acquirer, acquiring company, buyer")?,
            target: find_column(headers, TARGET_COLUMNS)
                .context("no target column found; expected one of: target, acquired company")?,
            date: find_column(headers, DEAL_DATE_COLUMNS),
            size: find_column(headers, DEAL_SIZE_COLUMNS),
            country: find_column(headers, COUNTRY_COLUMNS),
        })
    }
}

// =============================================================================
// NORMALIZED ROWS - declared record types per dataset, built at the read boundary
// =============================================================================

#[derive(Debug, Clone)]
struct CompanyRow {
    name: String,
    website: Option<String>,
    city: Option<String>,
    country: Option<String>,
    segment: Option<String>,
    company_type: Option<String>,
    process: Option<String>,
    manufacturer: Option<String>,
    model: Option<String>,
    count: Option<i64>,
    count_type: Option<String>,
    material: Option<String>,
}

fn normalize_companies(sheet: &SheetRows, report: &mut ImportReport) -> Result<Vec<CompanyRow>> {
    let cols = CompanyColumns::detect(&sheet.headers)?;
    let mut rows = Vec::with_capacity(sheet.rows.len());

    for raw in &sheet.rows {
        // A row without a company name has no identity to aggregate under.
        let Some(name) = trim_or_null(raw.cell(cols.name)) else {
            report.skip_row(&raw.location);
            continue;
        };
        rows.push(CompanyRow {
            name,
            website: cols.website.and_then(|c| trim_or_null(raw.cell(c))),
            city: cols.city.and_then(|c| trim_or_null(raw.cell(c))),
            country: cols.country.and_then(|c| canonicalize(raw.cell(c), COUNTRY_ALIASES)),
            segment: cols.segment.and_then(|c| canonicalize(raw.cell(c), SEGMENT_ALIASES)),
            company_type: cols.company_type.and_then(|c| trim_or_null(raw.cell(c))),
            process: cols.process.and_then(|c| canonicalize(raw.cell(c), PROCESS_ALIASES)),
            manufacturer: cols.manufacturer.and_then(|c| trim_or_null(raw.cell(c))),
            model: cols.model.and_then(|c| trim_or_null(raw.cell(c))),
            count: cols
                .count
                .and_then(|c| to_number(raw.cell(c)))
                .map(|n| n.round() as i64)
                .filter(|n| *n >= 0),
            count_type: cols.count_type.and_then(|c| canonicalize(raw.cell(c), COUNT_TYPE_ALIASES)),
            material: cols.material.and_then(|c| trim_or_null(raw.cell(c))),
        });
    }

    Ok(rows)
}

#[derive(Debug, Clone)]
struct PricingRow {
    company_name: String,
    process: String,
    material: String,
    quantity: i64,
    price_usd: Option<f64>,
    lead_time_days: Option<i64>,
    country: Option<String>,
}

fn normalize_pricing(sheet: &SheetRows, report: &mut ImportReport) -> Result<Vec<PricingRow>> {
    let cols = PricingColumns::detect(&sheet.headers)?;
    let mut rows = Vec::with_capacity(sheet.rows.len());

    for raw in &sheet.rows {
        // Identity is (company, process, material, quantity); a quote missing
        // any of them cannot be keyed for upsert.
        let company = trim_or_null(raw.cell(cols.company));
        let process = canonicalize(raw.cell(cols.process), PROCESS_ALIASES);
        let material = trim_or_null(raw.cell(cols.material));
        let quantity = to_number(raw.cell(cols.quantity)).map(|n| n.round() as i64);
        let (Some(company_name), Some(process), Some(material), Some(quantity)) =
            (company, process, material, quantity)
        else {
            report.skip_row(&raw.location);
            continue;
        };
        rows.push(PricingRow {
            company_name,
            process,
            material,
            quantity,
            price_usd: cols.price.and_then(|c| to_number(raw.cell(c))),
            lead_time_days: cols
                .lead_time
                .and_then(|c| to_number(raw.cell(c)))
                .map(|n| n.round() as i64),
            country: cols.country.and_then(|c| canonicalize(raw.cell(c), COUNTRY_ALIASES)),
        });
    }

    Ok(rows)
}

#[derive(Debug, Clone)]
struct MarketSizeRow {
    year: i32,
    segment: String,
    region: String,
    value_usd_m: Option<f64>,
    estimate_type: Option<String>,
}

fn normalize_market_sizes(sheet: &SheetRows, report: &mut ImportReport) -> Result<Vec<MarketSizeRow>> {
    let cols = MarketSizeColumns::detect(&sheet.headers)?;
    let mut rows = Vec::with_capacity(sheet.rows.len());

    for raw in &sheet.rows {
        let year = to_number(raw.cell(cols.year))
            .map(|n| n as i32)
            .filter(|y| (1900..=2100).contains(y));
        let segment = canonicalize(raw.cell(cols.segment), SEGMENT_ALIASES);
        let (Some(year), Some(segment)) = (year, segment) else {
            report.skip_row(&raw.location);
            continue;
        };
        rows.push(MarketSizeRow {
            year,
            segment,
            // Blank region means the worldwide figure in these exports.
            region: cols
                .region
                .and_then(|c| trim_or_null(raw.cell(c)))
                .unwrap_or_else(|| "Global".to_string()),
            value_usd_m: cols.value.and_then(|c| to_number(raw.cell(c))),
            estimate_type: cols
                .estimate_type
                .and_then(|c| canonicalize(raw.cell(c), COUNT_TYPE_ALIASES)),
        });
    }

    Ok(rows)
}

#[derive(Debug, Clone)]
struct DealRow {
    acquirer: String,
    target: String,
    announced_date: Option<NaiveDate>,
    deal_size_usd_m: Option<f64>,
    country: Option<String>,
}

fn normalize_deals(sheet: &SheetRows, report: &mut ImportReport) -> Result<Vec<DealRow>> {
    let cols = DealColumns::detect(&sheet.headers)?;
    let mut rows = Vec::with_capacity(sheet.rows.len());

    for raw in &sheet.rows {
        let acquirer = trim_or_null(raw.cell(cols.acquirer));
        let target = trim_or_null(raw.cell(cols.target));
        let (Some(acquirer), Some(target)) = (acquirer, target) else {
            report.skip_row(&raw.location);
            continue;
        };
        rows.push(DealRow {
            acquirer,
            target,
            announced_date: cols.date.and_then(|c| to_date(raw.cell(c))),
            deal_size_usd_m: cols.size.and_then(|c| to_number(raw.cell(c))),
            country: cols.country.and_then(|c| canonicalize(raw.cell(c), COUNTRY_ALIASES)),
        });
    }

    Ok(rows)
}

// =============================================================================
// ROW AGGREGATOR - fold repeated rows into one company plus equipment children
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
struct EquipmentRecord {
    process: Option<String>,
    manufacturer: Option<String>,
    model: Option<String>,
    count: Option<i64>,
    count_type: Option<String>,
    material: Option<String>,
    is_primary: bool,
}

#[derive(Debug, Clone, PartialEq)]
struct CompanyRecord {
    name: String,
    website: Option<String>,
    city: Option<String>,
    country: Option<String>,
    segment: Option<String>,
    company_type: Option<String>,
    equipment: Vec<EquipmentRecord>,
}

impl CompanyRecord {
    fn new(name: String) -> Self {
        Self {
            name,
            website: None,
            city: None,
            country: None,
            segment: None,
            company_type: None,
            equipment: Vec::new(),
        }
    }
}

/// First non-null wins; an existing value is never overwritten. When rows
/// disagree on a scalar, the first-seen value is the deliberate tie-break.
fn merge_scalar(slot: &mut Option<String>, value: Option<String>) {
    if slot.is_none() {
        *slot = value;
    }
}

/// Group rows by lowercased company name, preserving first-seen order.
/// Equipment children append unconditionally in source order; the first
/// child carries the primary flag.
fn aggregate_companies(rows: Vec<CompanyRow>) -> Vec<CompanyRecord> {
    let mut records: Vec<CompanyRecord> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for row in rows {
        let key = row.name.to_lowercase();
        if key.is_empty() {
            continue;
        }
        let slot = *index.entry(key).or_insert_with(|| {
            records.push(CompanyRecord::new(row.name.clone()));
            records.len() - 1
        });
        let record = &mut records[slot];

        merge_scalar(&mut record.website, row.website);
        merge_scalar(&mut record.city, row.city);
        merge_scalar(&mut record.country, row.country);
        merge_scalar(&mut record.segment, row.segment);
        merge_scalar(&mut record.company_type, row.company_type);

        let has_equipment = row.process.is_some()
            || row.manufacturer.is_some()
            || row.model.is_some()
            || row.count.is_some();
        if has_equipment {
            let is_primary = record.equipment.is_empty();
            record.equipment.push(EquipmentRecord {
                process: row.process,
                manufacturer: row.manufacturer,
                model: row.model,
                count: row.count,
                count_type: row.count_type,
                material: row.material,
                is_primary,
            });
        }
    }

    records
}

/// Drop rows whose conflict key was already seen, keeping the first.
/// The flattened datasets need this so one batch cannot upsert the same
/// key twice.
fn dedupe_rows<T, K, F>(rows: Vec<T>, mut key: F) -> (Vec<T>, usize)
where
    K: std::hash::Hash + Eq,
    F: FnMut(&T) -> K,
{
    let mut seen = HashSet::new();
    let mut kept = Vec::with_capacity(rows.len());
    let mut dropped = 0;
    for row in rows {
        if seen.insert(key(&row)) {
            kept.push(row);
        } else {
            dropped += 1;
        }
    }
    (kept, dropped)
}

// =============================================================================
// UPSERT SINK - bounded sequential batches, batch failure is counted not fatal
// =============================================================================

#[derive(Debug, Default)]
struct SinkReport {
    written: usize,
    failed: usize,
    batches: usize,
    errors: Vec<String>,
}

/// Submit items in sequential batches of at most `batch_size`. A failed batch
/// is recorded and counted as its full size, then the run continues with the
/// next batch. No retry, no backoff, no cross-batch transaction.
async fn drain_batches<T, F, Fut>(items: &[T], batch_size: usize, mut submit: F) -> SinkReport
where
    T: Clone,
    F: FnMut(usize, Vec<T>) -> Fut,
    Fut: Future<Output = Result<u64>>,
{
    let batch_size = batch_size.max(1);
    let mut report = SinkReport::default();

    for (batch_idx, chunk) in items.chunks(batch_size).enumerate() {
        report.batches += 1;
        match submit(batch_idx, chunk.to_vec()).await {
            Ok(written) => report.written += written as usize,
            Err(e) => {
                report.failed += chunk.len();
                let msg = format!("batch {} ({} rows): {:#}", batch_idx + 1, chunk.len(), e);
                eprintln!("  upsert failed: {}", msg);
                report.errors.push(msg);
            }
        }
    }

    report
}

async fn upsert_company_batch(pool: &PgPool, chunk: &[CompanyRecord]) -> Result<u64> {
    let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
        "INSERT INTO companies (company_id, name, website, city, country, segment, company_type) ",
    );
    qb.push_values(chunk, |mut b, rec| {
        b.push_bind(Uuid::new_v4())
            .push_bind(&rec.name)
            .push_bind(rec.website.as_deref())
            .push_bind(rec.city.as_deref())
            .push_bind(rec.country.as_deref())
            .push_bind(rec.segment.as_deref())
            .push_bind(rec.company_type.as_deref());
    });
    qb.push(
        " ON CONFLICT (name) DO UPDATE SET \
         website = EXCLUDED.website, city = EXCLUDED.city, country = EXCLUDED.country, \
         segment = EXCLUDED.segment, company_type = EXCLUDED.company_type",
    );
    let result = qb.build().execute(pool).await?;
    Ok(result.rows_affected())
}

/// Flattened equipment row; `ordinal` preserves source child order and gives
/// the conflict key a non-null second column.
#[derive(Debug, Clone)]
struct EquipmentFlat {
    company_name: String,
    ordinal: i32,
    process: Option<String>,
    manufacturer: Option<String>,
    model: Option<String>,
    count: Option<i64>,
    count_type: Option<String>,
    material: Option<String>,
    is_primary: bool,
}

fn flatten_equipment(records: &[CompanyRecord]) -> Vec<EquipmentFlat> {
    let mut flat = Vec::new();
    for record in records {
        for (idx, eq) in record.equipment.iter().enumerate() {
            flat.push(EquipmentFlat {
                company_name: record.name.clone(),
                ordinal: idx as i32,
                process: eq.process.clone(),
                manufacturer: eq.manufacturer.clone(),
                model: eq.model.clone(),
                count: eq.count,
                count_type: eq.count_type.clone(),
                material: eq.material.clone(),
                is_primary: eq.is_primary,
            });
        }
    }
    flat
}

async fn upsert_equipment_batch(pool: &PgPool, chunk: &[EquipmentFlat]) -> Result<u64> {
    let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
        "INSERT INTO company_equipment \
         (company_name, ordinal, process, manufacturer, printer_model, unit_count, count_type, material, is_primary) ",
    );
    qb.push_values(chunk, |mut b, eq| {
        b.push_bind(&eq.company_name)
            .push_bind(eq.ordinal)
            .push_bind(eq.process.as_deref())
            .push_bind(eq.manufacturer.as_deref())
            .push_bind(eq.model.as_deref())
            .push_bind(eq.count)
            .push_bind(eq.count_type.as_deref())
            .push_bind(eq.material.as_deref())
            .push_bind(eq.is_primary);
    });
    qb.push(
        " ON CONFLICT (company_name, ordinal) DO UPDATE SET \
         process = EXCLUDED.process, manufacturer = EXCLUDED.manufacturer, \
         printer_model = EXCLUDED.printer_model, unit_count = EXCLUDED.unit_count, \
         count_type = EXCLUDED.count_type, material = EXCLUDED.material, \
         is_primary = EXCLUDED.is_primary",
    );
    let result = qb.build().execute(pool).await?;
    Ok(result.rows_affected())
}

async fn upsert_pricing_batch(pool: &PgPool, chunk: &[PricingRow]) -> Result<u64> {
    let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
        "INSERT INTO pricing_quotes \
         (company_name, process, material, quantity, price_usd, lead_time_days, country) ",
    );
    qb.push_values(chunk, |mut b, row| {
        b.push_bind(&row.company_name)
            .push_bind(&row.process)
            .push_bind(&row.material)
            .push_bind(row.quantity)
            .push_bind(row.price_usd)
            .push_bind(row.lead_time_days)
            .push_bind(row.country.as_deref());
    });
    qb.push(
        " ON CONFLICT (company_name, process, material, quantity) DO UPDATE SET \
         price_usd = EXCLUDED.price_usd, lead_time_days = EXCLUDED.lead_time_days, \
         country = EXCLUDED.country",
    );
    let result = qb.build().execute(pool).await?;
    Ok(result.rows_affected())
}

async fn upsert_market_size_batch(pool: &PgPool, chunk: &[MarketSizeRow]) -> Result<u64> {
    let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
        "INSERT INTO market_sizes (year, segment, region, value_usd_m, estimate_type) ",
    );
    qb.push_values(chunk, |mut b, row| {
        b.push_bind(row.year)
            .push_bind(&row.segment)
            .push_bind(&row.region)
            .push_bind(row.value_usd_m)
            .push_bind(row.estimate_type.as_deref());
    });
    qb.push(
        " ON CONFLICT (year, segment, region) DO UPDATE SET \
         value_usd_m = EXCLUDED.value_usd_m, estimate_type = EXCLUDED.estimate_type",
    );
    let result = qb.build().execute(pool).await?;
    Ok(result.rows_affected())
}

async fn upsert_deal_batch(pool: &PgPool, chunk: &[DealRow]) -> Result<u64> {
    let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
        "INSERT INTO ma_deals (acquirer, target, announced_date, deal_size_usd_m, country) ",
    );
    qb.push_values(chunk, |mut b, row| {
        b.push_bind(&row.acquirer)
            .push_bind(&row.target)
            .push_bind(row.announced_date)
            .push_bind(row.deal_size_usd_m)
            .push_bind(row.country.as_deref());
    });
    qb.push(
        " ON CONFLICT (acquirer, target) DO UPDATE SET \
         announced_date = EXCLUDED.announced_date, deal_size_usd_m = EXCLUDED.deal_size_usd_m, \
         country = EXCLUDED.country",
    );
    let result = qb.build().execute(pool).await?;
    Ok(result.rows_affected())
}

// =============================================================================
// RUN TRACKING - content-hash dedup and import_runs bookkeeping
// =============================================================================

fn hash_content(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("sha256:{:x}", hasher.finalize())
}

/// A successful earlier run over the same bytes means the file is unchanged.
async fn find_completed_run(pool: &PgPool, dataset: &str, content_hash: &str) -> Result<Option<Uuid>> {
    let row: Option<(Uuid,)> = sqlx::query_as(
        "SELECT run_id FROM import_runs WHERE dataset = $1 AND content_hash = $2 AND status = 'ok' LIMIT 1",
    )
    .bind(dataset)
    .bind(content_hash)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|r| r.0))
}

async fn create_import_run(
    pool: &PgPool,
    dataset: &str,
    source_path: &Path,
    content_hash: &str,
) -> Result<Uuid> {
    let run_id = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO import_runs (run_id, dataset, source_path, content_hash, status, detail)
        VALUES ($1, $2, $3, $4, 'running', '{}')
        "#,
    )
    .bind(run_id)
    .bind(dataset)
    .bind(source_path.to_string_lossy().to_string())
    .bind(content_hash)
    .execute(pool)
    .await?;
    Ok(run_id)
}

async fn finish_import_run(
    pool: &PgPool,
    run_id: Uuid,
    status: &str,
    error: Option<&str>,
    report: &ImportReport,
) -> Result<()> {
    let detail = serde_json::json!({
        "rows_read": report.rows_read,
        "rows_skipped": report.rows_skipped,
        "entities": report.entities,
        "written": report.written,
        "failed": report.failed,
        "diagnostics": report.diagnostics,
    });
    sqlx::query(
        r#"
        UPDATE import_runs
        SET finished_at = now(), status = $2, error = $3, detail = $4
        WHERE run_id = $1
        "#,
    )
    .bind(run_id)
    .bind(status)
    .bind(error)
    .bind(detail)
    .execute(pool)
    .await?;
    Ok(())
}

// =============================================================================
// PIPELINE DRIVERS - read -> normalize -> aggregate -> upsert, one dataset each
// =============================================================================

async fn import_companies(
    pool: &PgPool,
    sheet: &SheetRows,
    spec: &RunSpec,
    report: &mut ImportReport,
) -> Result<()> {
    report.phase = RunPhase::Normalizing;
    println!("\n[2/4] Normalizing company rows");
    let rows = normalize_companies(sheet, report)?;
    println!("  {} rows kept, {} skipped", rows.len(), report.rows_skipped);

    report.phase = RunPhase::Aggregating;
    println!("\n[3/4] Aggregating by company name");
    let records = aggregate_companies(rows);
    let machines: usize = records.iter().map(|r| r.equipment.len()).sum();
    report.entities = records.len();
    println!("  {} companies, {} equipment rows", records.len(), machines);

    report.phase = RunPhase::Upserting;
    println!("\n[4/4] Upserting (batch size {})", spec.batch_size);
    if spec.dry_run {
        println!("  dry run - nothing written");
        return Ok(());
    }

    let sink = drain_batches(&records, spec.batch_size, |_, chunk: Vec<CompanyRecord>| {
        let pool = pool.clone();
        async move { upsert_company_batch(&pool, &chunk).await }
    })
    .await;
    report.absorb_sink(sink, "companies");

    let flat = flatten_equipment(&records);
    let sink = drain_batches(&flat, spec.batch_size, |_, chunk: Vec<EquipmentFlat>| {
        let pool = pool.clone();
        async move { upsert_equipment_batch(&pool, &chunk).await }
    })
    .await;
    report.absorb_sink(sink, "company_equipment");

    Ok(())
}

async fn import_pricing(
    pool: &PgPool,
    sheet: &SheetRows,
    spec: &RunSpec,
    report: &mut ImportReport,
) -> Result<()> {
    report.phase = RunPhase::Normalizing;
    println!("\n[2/4] Normalizing pricing rows");
    let rows = normalize_pricing(sheet, report)?;
    println!("  {} rows kept, {} skipped", rows.len(), report.rows_skipped);

    report.phase = RunPhase::Aggregating;
    println!("\n[3/4] Deduplicating by conflict key");
    let (rows, duplicates) = dedupe_rows(rows, |r| {
        (r.company_name.clone(), r.process.clone(), r.material.clone(), r.quantity)
    });
    report.rows_skipped += duplicates;
    report.entities = rows.len();
    println!("  {} quotes, {} duplicates dropped", rows.len(), duplicates);

    report.phase = RunPhase::Upserting;
    println!("\n[4/4] Upserting (batch size {})", spec.batch_size);
    if spec.dry_run {
        println!("  dry run - nothing written");
        return Ok(());
    }

    let sink = drain_batches(&rows, spec.batch_size, |_, chunk: Vec<PricingRow>| {
        let pool = pool.clone();
        async move { upsert_pricing_batch(&pool, &chunk).await }
    })
    .await;
    report.absorb_sink(sink, "pricing_quotes");

    Ok(())
}

async fn import_market_sizes(
    pool: &PgPool,
    sheet: &SheetRows,
    spec: &RunSpec,
    report: &mut ImportReport,
) -> Result<()> {
    report.phase = RunPhase::Normalizing;
    println!("\n[2/4] Normalizing market size rows");
    let rows = normalize_market_sizes(sheet, report)?;
    println!("  {} rows kept, {} skipped", rows.len(), report.rows_skipped);

    report.phase = RunPhase::Aggregating;
    println!("\n[3/4] Deduplicating by conflict key");
    let (rows, duplicates) = dedupe_rows(rows, |r| (r.year, r.segment.clone(), r.region.clone()));
    report.rows_skipped += duplicates;
    report.entities = rows.len();
    println!("  {} estimates, {} duplicates dropped", rows.len(), duplicates);

    report.phase = RunPhase::Upserting;
    println!("\n[4/4] Upserting (batch size {})", spec.batch_size);
    if spec.dry_run {
        println!("  dry run - nothing written");
        return Ok(());
    }

    let sink = drain_batches(&rows, spec.batch_size, |_, chunk: Vec<MarketSizeRow>| {
        let pool = pool.clone();
        async move { upsert_market_size_batch(&pool, &chunk).await }
    })
    .await;
    report.absorb_sink(sink, "market_sizes");

    Ok(())
}

async fn import_mergers(
    pool: &PgPool,
    sheet: &SheetRows,
    spec: &RunSpec,
    report: &mut ImportReport,
) -> Result<()> {
    report.phase = RunPhase::Normalizing;
    println!("\n[2/4] Normalizing M&A rows");
    let rows = normalize_deals(sheet, report)?;
    println!("  {} rows kept, {} skipped", rows.len(), report.rows_skipped);

    report.phase = RunPhase::Aggregating;
    println!("\n[3/4] Deduplicating by conflict key");
    let (rows, duplicates) = dedupe_rows(rows, |r| (r.acquirer.clone(), r.target.clone()));
    report.rows_skipped += duplicates;
    report.entities = rows.len();
    println!("  {} deals, {} duplicates dropped", rows.len(), duplicates);

    report.phase = RunPhase::Upserting;
    println!("\n[4/4] Upserting (batch size {})", spec.batch_size);
    if spec.dry_run {
        println!("  dry run - nothing written");
        return Ok(());
    }

    let sink = drain_batches(&rows, spec.batch_size, |_, chunk: Vec<DealRow>| {
        let pool = pool.clone();
        async move { upsert_deal_batch(&pool, &chunk).await }
    })
    .await;
    report.absorb_sink(sink, "ma_deals");

    Ok(())
}

async fn import_dataset(
    pool: &PgPool,
    spec: &RunSpec,
    bytes: &[u8],
    report: &mut ImportReport,
) -> Result<()> {
    let sheet = if is_excel_path(&spec.file) {
        let name = spec
            .sheet
            .clone()
            .or_else(|| spec.dataset.default_sheet().map(str::to_string));
        read_excel_rows(&spec.file, name.as_deref())?
    } else {
        let delimiter = spec.delimiter.map(|c| c as u8).unwrap_or(b',');
        read_csv_rows(bytes, delimiter)?
    };

    report.rows_read = sheet.rows.len();
    report.rows_skipped += sheet.skipped_short;
    println!("  {} rows ({} short rows dropped)", sheet.rows.len(), sheet.skipped_short);

    if sheet.headers.is_empty() {
        println!("  nothing to import");
        return Ok(());
    }

    match spec.dataset {
        Dataset::Companies => import_companies(pool, &sheet, spec, report).await,
        Dataset::Pricing => import_pricing(pool, &sheet, spec, report).await,
        Dataset::MarketSize => import_market_sizes(pool, &sheet, spec, report).await,
        Dataset::Mergers => import_mergers(pool, &sheet, spec, report).await,
    }
}

/// One full run for one file: read, hash, skip-check, pipeline, bookkeeping.
async fn execute_run(pool: &PgPool, spec: &RunSpec) -> Result<ImportReport> {
    let mut report = ImportReport::new(spec.dataset);

    report.phase = RunPhase::Reading;
    println!("\n[1/4] Reading {}", spec.file.display());
    let bytes = match read_source_bytes(&spec.file) {
        Ok(bytes) => bytes,
        Err(e) => {
            // Nothing was processed; the caller decides to exit non-zero.
            eprintln!("  {:#}", e);
            report.phase = RunPhase::Aborted;
            report.diagnostics.push(format!("{:#}", e));
            return Ok(report);
        }
    };

    let content_hash = hash_content(&bytes);
    println!("  {} bytes, {}", bytes.len(), content_hash);

    if !spec.force {
        if let Some(run_id) = find_completed_run(pool, spec.dataset.label(), &content_hash).await? {
            println!("  unchanged since run {} - skipping (use --force to re-import)", run_id);
            report.phase = RunPhase::Done;
            report.diagnostics.push("source unchanged, import skipped".to_string());
            return Ok(report);
        }
    }

    let run_id = if spec.dry_run {
        None
    } else {
        Some(create_import_run(pool, spec.dataset.label(), &spec.file, &content_hash).await?)
    };

    let result = import_dataset(pool, spec, &bytes, &mut report).await;

    if let Some(run_id) = run_id {
        match &result {
            Ok(()) => {
                let status = if report.failed == 0 { "ok" } else { "partial" };
                finish_import_run(pool, run_id, status, None, &report).await?;
            }
            Err(e) => {
                finish_import_run(pool, run_id, "failed", Some(&e.to_string()), &report).await?;
            }
        }
    }

    result?;
    report.phase = RunPhase::Done;
    Ok(report)
}

// =============================================================================
// BATCH CONFIG MODE - one config file instead of a dozen one-off scripts
// =============================================================================

#[derive(Debug, Deserialize)]
struct DatasetsConfig {
    version: String,
    datasets: Vec<DatasetEntry>,
}

#[derive(Debug, Deserialize)]
struct DatasetEntry {
    dataset: Dataset,
    file: PathBuf,
    #[serde(default)]
    sheet: Option<String>,
    #[serde(default)]
    delimiter: Option<char>,
    #[serde(default)]
    description: String,
    #[serde(default = "default_true")]
    enabled: bool,
}

fn default_true() -> bool {
    true
}

async fn run_config_batch(pool: &PgPool, config_path: &str, args: &Args, defaults: &Config) -> Result<()> {
    let content = std::fs::read_to_string(config_path)
        .with_context(|| format!("failed to read datasets config {}", config_path))?;
    let datasets_config: DatasetsConfig =
        serde_json::from_str(&content).context("failed to parse datasets config")?;
    println!("Config version: {}", datasets_config.version);

    let entries: Vec<&DatasetEntry> = datasets_config
        .datasets
        .iter()
        .filter(|e| {
            if !e.enabled {
                return false;
            }
            if let Some(filter) = args.dataset {
                return e.dataset == filter;
            }
            true
        })
        .collect();

    if entries.is_empty() {
        anyhow::bail!("no enabled datasets match the filter criteria");
    }

    println!("Processing {} dataset file(s)...", entries.len());

    let mut completed = 0;
    let mut aborted = 0;
    let mut written = 0;
    let mut failed_rows = 0;

    for entry in entries {
        println!("\n[{}] {}", entry.dataset.label(), entry.file.display());
        if !entry.description.is_empty() {
            println!("  {}", entry.description);
        }
        let spec = RunSpec {
            dataset: entry.dataset,
            file: entry.file.clone(),
            sheet: entry.sheet.clone(),
            delimiter: entry.delimiter,
            batch_size: args.batch_size.unwrap_or(defaults.batch_size),
            dry_run: args.dry_run,
            force: args.force,
        };
        match execute_run(pool, &spec).await {
            Ok(report) => {
                report.print_summary();
                if report.phase == RunPhase::Aborted {
                    aborted += 1;
                } else {
                    completed += 1;
                    written += report.written;
                    failed_rows += report.failed;
                }
            }
            Err(e) => {
                eprintln!("  import failed: {:#}", e);
                aborted += 1;
            }
        }
    }

    println!("\n=== Batch Summary ===");
    println!("Completed runs: {}", completed);
    println!("Aborted runs: {}", aborted);
    println!("Rows written: {}", written);
    println!("Rows failed: {}", failed_rows);

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    let config = Config::from_env()?;

    println!("=== AM Market Explorer Importer ===");

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&config.db_url)
        .await
        .context("failed to connect to database")?;

    if let Some(config_path) = &args.config {
        println!("Loading datasets from: {}", config_path);
        run_config_batch(&pool, config_path, &args, &config).await?;
    } else if let (Some(file), Some(dataset)) = (&args.file, args.dataset) {
        let spec = RunSpec {
            dataset,
            file: file.clone(),
            sheet: args.sheet.clone(),
            delimiter: args.delimiter,
            batch_size: args.batch_size.unwrap_or(config.batch_size),
            dry_run: args.dry_run,
            force: args.force,
        };
        println!("Dataset: {}", dataset.label());
        println!("Mode: {}", if args.dry_run { "dry-run" } else { "live" });

        let report = execute_run(&pool, &spec).await?;
        report.print_summary();
        if report.phase == RunPhase::Aborted {
            anyhow::bail!("run aborted: source file could not be read");
        }
    } else {
        anyhow::bail!(
            "must specify either:\n  \
             --config <path> for batch mode, or\n  \
             --dataset <kind> --file <path> for single-file mode"
        );
    }

    Ok(())
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn text(s: &str) -> Cell {
        Cell::Text(s.to_string())
    }

    fn report() -> ImportReport {
        ImportReport::new(Dataset::Companies)
    }

    // -------------------------------------------------------------------------
    // FIELD NORMALIZER - every rule is total and degrades instead of failing
    // -------------------------------------------------------------------------

    #[test]
    fn test_trim_or_null_blank_variants() {
        assert_eq!(trim_or_null(&text("")), None);
        assert_eq!(trim_or_null(&text("-")), None);
        assert_eq!(trim_or_null(&text("N/A")), None);
        assert_eq!(trim_or_null(&text("n/a")), None);
        assert_eq!(trim_or_null(&text("   ")), None);
        assert_eq!(trim_or_null(&Cell::Empty), None);
    }

    #[test]
    fn test_trim_or_null_trims_whitespace() {
        assert_eq!(trim_or_null(&text("  Acme  ")), Some("Acme".to_string()));
    }

    #[test]
    fn test_trim_or_null_formats_numbers() {
        assert_eq!(trim_or_null(&Cell::Number(2024.0)), Some("2024".to_string()));
        assert_eq!(trim_or_null(&Cell::Number(3.5)), Some("3.5".to_string()));
    }

    #[test]
    fn test_to_number_is_total() {
        let inputs = [
            "", "abc", "-", "--", "$-", "1.2.3", "3-5 days", "n/a", "∞", "12e", "¥¥¥",
        ];
        for input in inputs {
            match to_number(&text(input)) {
                Some(n) => assert!(n.is_finite(), "input {:?} gave non-finite {}", input, n),
                None => {}
            }
        }
        assert_eq!(to_number(&Cell::Number(f64::NAN)), None);
        assert_eq!(to_number(&Cell::Number(f64::INFINITY)), None);
        assert_eq!(to_number(&Cell::Empty), None);
    }

    #[test]
    fn test_to_number_strips_currency_and_units() {
        assert_eq!(to_number(&text("$1,234.56")), Some(1234.56));
        assert_eq!(to_number(&text("≈ 2,000 units")), Some(2000.0));
        assert_eq!(to_number(&text("12%")), Some(12.0));
        assert_eq!(to_number(&text("  450  ")), Some(450.0));
        assert_eq!(to_number(&Cell::Number(7.25)), Some(7.25));
    }

    #[test]
    fn test_to_number_rejects_garbled() {
        assert_eq!(to_number(&text("1.2.3")), None);
        assert_eq!(to_number(&text("3-5 days")), None);
        assert_eq!(to_number(&text("tbd")), None);
    }

    #[test]
    fn test_to_date_known_formats() {
        let expected = NaiveDate::from_ymd_opt(2024, 3, 15).unwrap();
        assert_eq!(to_date(&text("2024-03-15")), Some(expected));
        assert_eq!(to_date(&text("03/15/2024")), Some(expected));
        assert_eq!(to_date(&text("March 15, 2024")), Some(expected));
        assert_eq!(to_date(&text("Mar 15, 2024")), Some(expected));
        assert_eq!(
            to_date(&text("25/12/2024")),
            NaiveDate::from_ymd_opt(2024, 12, 25)
        );
    }

    #[test]
    fn test_to_date_bare_year_and_passthrough() {
        assert_eq!(to_date(&text("2021")), NaiveDate::from_ymd_opt(2021, 1, 1));
        assert_eq!(to_date(&Cell::Number(2024.0)), NaiveDate::from_ymd_opt(2024, 1, 1));
        let d = NaiveDate::from_ymd_opt(2019, 6, 1).unwrap();
        assert_eq!(to_date(&Cell::Date(d)), Some(d));
    }

    #[test]
    fn test_to_date_unparseable_is_none() {
        assert_eq!(to_date(&text("soon")), None);
        assert_eq!(to_date(&text("Q3 maybe")), None);
        assert_eq!(to_date(&Cell::Empty), None);
    }

    #[test]
    fn test_excel_serial_to_date() {
        assert_eq!(excel_serial_to_date(45292.0), NaiveDate::from_ymd_opt(2024, 1, 1));
        assert_eq!(excel_serial_to_date(43831.0), NaiveDate::from_ymd_opt(2020, 1, 1));
        assert_eq!(excel_serial_to_date(f64::NAN), None);
    }

    #[test]
    fn test_canonicalize_country_aliases() {
        assert_eq!(
            canonicalize(&text("USA"), COUNTRY_ALIASES),
            Some("United States".to_string())
        );
        assert_eq!(
            canonicalize(&text("  uk  "), COUNTRY_ALIASES),
            Some("United Kingdom".to_string())
        );
        assert_eq!(canonicalize(&text(""), COUNTRY_ALIASES), None);
    }

    #[test]
    fn test_canonicalize_unmapped_passes_through() {
        // An unknown value is still informative; it must not become null.
        assert_eq!(
            canonicalize(&text("Wakanda"), COUNTRY_ALIASES),
            Some("Wakanda".to_string())
        );
    }

    #[test]
    fn test_canonicalize_count_type() {
        assert_eq!(
            canonicalize(&text("estimate"), COUNT_TYPE_ALIASES),
            Some("Estimated".to_string())
        );
        assert_eq!(
            canonicalize(&text("Actual"), COUNT_TYPE_ALIASES),
            Some("Actual".to_string())
        );
    }

    // -------------------------------------------------------------------------
    // COLUMN MAPPING
    // -------------------------------------------------------------------------

    #[test]
    fn test_find_column_exact_beats_substring() {
        let headers = vec!["Company Type".to_string(), "Company Name".to_string()];
        assert_eq!(find_column(&headers, COMPANY_NAME_COLUMNS), Some(1));
        assert_eq!(find_column(&headers, COMPANY_TYPE_COLUMNS), Some(0));
    }

    #[test]
    fn test_find_column_substring_fallback() {
        let headers = vec!["Printer Manufacturer Name".to_string()];
        assert_eq!(find_column(&headers, MANUFACTURER_COLUMNS), Some(0));
        assert_eq!(find_column(&headers, YEAR_COLUMNS), None);
    }

    #[test]
    fn test_company_columns_count_type_not_reused_as_count() {
        let headers = vec!["Company".to_string(), "Count Type".to_string()];
        let cols = CompanyColumns::detect(&headers).unwrap();
        assert_eq!(cols.count_type, Some(1));
        assert_eq!(cols.count, None);
    }

    // -------------------------------------------------------------------------
    // SOURCE READER
    // -------------------------------------------------------------------------

    #[test]
    fn test_read_csv_basic() {
        let sheet = read_csv_rows(b"Company,Process\nAcme,FDM\n", b',').unwrap();
        assert_eq!(sheet.headers, vec!["Company", "Process"]);
        assert_eq!(sheet.rows.len(), 1);
        assert_eq!(sheet.rows[0].location, "csv:line=2");
        assert_eq!(*sheet.rows[0].cell(0), Cell::Text("Acme".to_string()));
    }

    #[test]
    fn test_read_csv_semicolon_with_bom() {
        let bytes = "\u{feff}Year;Segment;Value\n2024;Industrial;1,234\n".as_bytes();
        let sheet = read_csv_rows(bytes, b';').unwrap();
        assert_eq!(sheet.headers[0], "Year");
        assert_eq!(sheet.rows.len(), 1);
    }

    #[test]
    fn test_read_csv_short_rows_dropped_silently() {
        let sheet = read_csv_rows(b"a,b,c\n1,2\n1,2,3\n", b',').unwrap();
        assert_eq!(sheet.rows.len(), 1);
        assert_eq!(sheet.skipped_short, 1);
    }

    #[test]
    fn test_read_csv_quoted_delimiter() {
        let sheet = read_csv_rows(b"name,website\n\"Acme, Inc.\",acme.com\n", b',').unwrap();
        assert_eq!(*sheet.rows[0].cell(0), Cell::Text("Acme, Inc.".to_string()));
    }

    #[test]
    fn test_decode_windows_1252_fallback() {
        // "München" saved from Windows Excel: 0xFC is u-umlaut in CP-1252.
        let bytes = b"M\xFCnchen";
        assert_eq!(decode_text(bytes), "München");
    }

    #[test]
    fn test_read_source_bytes_missing_file_is_fatal() {
        let result = read_source_bytes(Path::new("/nonexistent/companies.xlsx"));
        assert!(result.is_err());
    }

    #[test]
    fn test_is_excel_path() {
        assert!(is_excel_path(Path::new("data/Company Info.XLSX")));
        assert!(is_excel_path(Path::new("legacy.xls")));
        assert!(!is_excel_path(Path::new("deals.csv")));
    }

    // -------------------------------------------------------------------------
    // ROW AGGREGATOR
    // -------------------------------------------------------------------------

    fn company_rows(csv: &str) -> Vec<CompanyRow> {
        let sheet = read_csv_rows(csv.as_bytes(), b',').unwrap();
        normalize_companies(&sheet, &mut report()).unwrap()
    }

    #[test]
    fn test_aggregate_end_to_end() {
        let rows = company_rows("Company,Process\nAcme,FDM\nAcme,SLA\nBeta,FDM\n");
        let records = aggregate_companies(rows);

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].name, "Acme");
        let acme: Vec<_> = records[0]
            .equipment
            .iter()
            .map(|e| e.process.clone().unwrap())
            .collect();
        assert_eq!(acme, vec!["FDM", "SLA"]);
        assert_eq!(records[1].name, "Beta");
        assert_eq!(records[1].equipment.len(), 1);
    }

    #[test]
    fn test_aggregate_first_non_null_wins() {
        let rows = company_rows("Company,Website\nAcme,a.com\nAcme,b.com\n");
        let records = aggregate_companies(rows);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].website.as_deref(), Some("a.com"));
    }

    #[test]
    fn test_aggregate_fills_gaps_from_later_rows() {
        let rows = company_rows("Company,Website,Country\nAcme,,USA\nAcme,a.com,\n");
        let records = aggregate_companies(rows);
        assert_eq!(records[0].website.as_deref(), Some("a.com"));
        assert_eq!(records[0].country.as_deref(), Some("United States"));
    }

    #[test]
    fn test_aggregate_is_idempotent() {
        let csv = "Company,Process,Website\nAcme,FDM,a.com\nAcme,SLA,b.com\nBeta,FDM,\n";
        let first = aggregate_companies(company_rows(csv));
        let second = aggregate_companies(company_rows(csv));
        assert_eq!(first, second);
        assert_eq!(first[0].equipment.len(), second[0].equipment.len());
    }

    #[test]
    fn test_aggregate_groups_case_insensitively() {
        let rows = company_rows("Company,Process\nAcme,FDM\nACME,SLA\n");
        let records = aggregate_companies(rows);
        assert_eq!(records.len(), 1);
        // First-seen spelling is kept as the display name.
        assert_eq!(records[0].name, "Acme");
        assert_eq!(records[0].equipment.len(), 2);
    }

    #[test]
    fn test_normalize_drops_rows_without_identity() {
        let mut rep = report();
        let sheet = read_csv_rows(b"Company,Process\n,FDM\nAcme,SLA\n", b',').unwrap();
        let rows = normalize_companies(&sheet, &mut rep).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rep.rows_skipped, 1);
        assert_eq!(rep.skip_samples, vec!["csv:line=2"]);
    }

    #[test]
    fn test_first_equipment_child_is_primary() {
        let rows = company_rows("Company,Process\nAcme,FDM\nAcme,SLA\n");
        let records = aggregate_companies(rows);
        assert!(records[0].equipment[0].is_primary);
        assert!(!records[0].equipment[1].is_primary);
    }

    #[test]
    fn test_rows_without_equipment_fields_add_no_children() {
        let rows = company_rows("Company,Website\nAcme,a.com\n");
        let records = aggregate_companies(rows);
        assert!(records[0].equipment.is_empty());
    }

    #[test]
    fn test_dedupe_rows_first_wins() {
        let (kept, dropped) = dedupe_rows(vec![1, 2, 1, 3, 2], |n| *n);
        assert_eq!(kept, vec![1, 2, 3]);
        assert_eq!(dropped, 2);
    }

    // -------------------------------------------------------------------------
    // UPSERT SINK - batch splitting and partial-failure resilience
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_batch_splitting_125_by_50() {
        let items: Vec<u32> = (0..125).collect();
        let sizes = Arc::new(Mutex::new(Vec::new()));
        let sizes_rec = sizes.clone();

        let sink = drain_batches(&items, 50, move |_, chunk: Vec<u32>| {
            let sizes = sizes_rec.clone();
            async move {
                sizes.lock().unwrap().push(chunk.len());
                Ok(chunk.len() as u64)
            }
        })
        .await;

        assert_eq!(sink.batches, 3);
        assert_eq!(*sizes.lock().unwrap(), vec![50, 50, 25]);
        assert_eq!(sink.written, 125);
        assert_eq!(sink.failed, 0);
    }

    #[tokio::test]
    async fn test_partial_batch_failure_continues() {
        let items: Vec<u32> = (0..125).collect();
        let attempts = Arc::new(Mutex::new(Vec::new()));
        let attempts_rec = attempts.clone();

        let sink = drain_batches(&items, 50, move |idx, chunk: Vec<u32>| {
            let attempts = attempts_rec.clone();
            async move {
                attempts.lock().unwrap().push(idx);
                if idx == 1 {
                    anyhow::bail!("connection reset");
                }
                Ok(chunk.len() as u64)
            }
        })
        .await;

        // Batches 1 and 3 still attempted; only batch 2's size counts as failed.
        assert_eq!(*attempts.lock().unwrap(), vec![0, 1, 2]);
        assert_eq!(sink.failed, 50);
        assert_eq!(sink.written, 75);
        assert_eq!(sink.errors.len(), 1);
        assert!(sink.errors[0].contains("batch 2"));
    }

    #[tokio::test]
    async fn test_empty_input_issues_no_batches() {
        let items: Vec<u32> = Vec::new();
        let sink = drain_batches(&items, 50, |_, chunk: Vec<u32>| async move {
            Ok(chunk.len() as u64)
        })
        .await;
        assert_eq!(sink.batches, 0);
        assert_eq!(sink.written, 0);
    }

    #[test]
    fn test_flatten_equipment_ordinals() {
        let records = aggregate_companies(company_rows("Company,Process\nAcme,FDM\nAcme,SLA\nBeta,MJF\n"));
        let flat = flatten_equipment(&records);
        assert_eq!(flat.len(), 3);
        assert_eq!((flat[0].company_name.as_str(), flat[0].ordinal), ("Acme", 0));
        assert_eq!((flat[1].company_name.as_str(), flat[1].ordinal), ("Acme", 1));
        assert_eq!((flat[2].company_name.as_str(), flat[2].ordinal), ("Beta", 0));
        assert!(flat[0].is_primary);
        assert!(!flat[1].is_primary);
    }

    // -------------------------------------------------------------------------
    // DATASET NORMALIZERS
    // -------------------------------------------------------------------------

    #[test]
    fn test_normalize_pricing_requires_identity() {
        let csv = "Company,Process,Material,Quantity,Price\n\
                   Hubs,FDM,PLA,100,\"$1,250.00\"\n\
                   Hubs,FDM,,100,$900.00\n";
        let mut rep = report();
        let sheet = read_csv_rows(csv.as_bytes(), b',').unwrap();
        let rows = normalize_pricing(&sheet, &mut rep).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rep.rows_skipped, 1);
        assert_eq!(rows[0].company_name, "Hubs");
        assert_eq!(rows[0].quantity, 100);
    }

    #[test]
    fn test_normalize_pricing_optional_fields_degrade() {
        let csv = "Company,Process,Material,Quantity,Price,Lead Time\n\
                   Xometry,SLS,Nylon 12,50,call us,7\n";
        let mut rep = report();
        let sheet = read_csv_rows(csv.as_bytes(), b',').unwrap();
        let rows = normalize_pricing(&sheet, &mut rep).unwrap();
        assert_eq!(rows[0].price_usd, None);
        assert_eq!(rows[0].lead_time_days, Some(7));
    }

    #[test]
    fn test_normalize_market_sizes_defaults_region() {
        let csv = "Year,Segment,Region,Value,Estimate Type\n\
                   2024,industrial,,\"$6,200\",estimate\n\
                   2025,Professional,Europe,1500,forecast\n";
        let mut rep = report();
        let sheet = read_csv_rows(csv.as_bytes(), b',').unwrap();
        let rows = normalize_market_sizes(&sheet, &mut rep).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].region, "Global");
        assert_eq!(rows[0].segment, "Industrial");
        assert_eq!(rows[0].value_usd_m, Some(6200.0));
        assert_eq!(rows[0].estimate_type.as_deref(), Some("Estimated"));
        assert_eq!(rows[1].region, "Europe");
        assert_eq!(rows[1].estimate_type.as_deref(), Some("Forecast"));
    }

    #[test]
    fn test_normalize_market_sizes_drops_bad_year() {
        let csv = "Year,Segment,Value\nsoon,Industrial,100\n2024,Industrial,200\n";
        let mut rep = report();
        let sheet = read_csv_rows(csv.as_bytes(), b',').unwrap();
        let rows = normalize_market_sizes(&sheet, &mut rep).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].year, 2024);
        assert_eq!(rep.rows_skipped, 1);
    }

    #[test]
    fn test_normalize_deals() {
        let csv = "Acquirer,Target,Announced Date,Deal Size,Country\n\
                   Stratasys,Origin,\"December 9, 2020\",$100M,USA\n\
                   Desktop Metal,,2021,50,USA\n";
        let mut rep = report();
        let sheet = read_csv_rows(csv.as_bytes(), b',').unwrap();
        let rows = normalize_deals(&sheet, &mut rep).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rep.rows_skipped, 1);
        assert_eq!(rows[0].acquirer, "Stratasys");
        assert_eq!(rows[0].announced_date, NaiveDate::from_ymd_opt(2020, 12, 9));
        assert_eq!(rows[0].deal_size_usd_m, Some(100.0));
        assert_eq!(rows[0].country.as_deref(), Some("United States"));
    }

    // -------------------------------------------------------------------------
    // RUN REPORT
    // -------------------------------------------------------------------------

    #[test]
    fn test_report_skip_samples_capped() {
        let mut rep = report();
        for i in 0..10 {
            rep.skip_row(&format!("csv:line={}", i + 2));
        }
        assert_eq!(rep.rows_skipped, 10);
        assert_eq!(rep.skip_samples.len(), 5);
    }

    #[test]
    fn test_report_absorbs_sink_diagnostics() {
        let mut rep = report();
        rep.absorb_sink(
            SinkReport {
                written: 100,
                failed: 50,
                batches: 3,
                errors: vec!["batch 2 (50 rows): connection reset".to_string()],
            },
            "companies",
        );
        assert_eq!(rep.written, 100);
        assert_eq!(rep.failed, 50);
        assert_eq!(rep.diagnostics.len(), 1);
        assert!(rep.diagnostics[0].starts_with("companies:"));
    }

    #[tokio::test]
    async fn test_missing_source_file_aborts_run() {
        // connect_lazy opens no connection; the run aborts before any query.
        let pool = PgPoolOptions::new()
            .connect_lazy("postgres://localhost/unused")
            .unwrap();
        let spec = RunSpec {
            dataset: Dataset::Companies,
            file: PathBuf::from("/nonexistent/companies.csv"),
            sheet: None,
            delimiter: None,
            batch_size: 50,
            dry_run: true,
            force: false,
        };
        let report = execute_run(&pool, &spec).await.unwrap();
        assert_eq!(report.phase, RunPhase::Aborted);
        assert_eq!(report.rows_read, 0);
        assert!(!report.diagnostics.is_empty());
    }

    #[test]
    fn test_hash_content_is_stable() {
        let a = hash_content(b"Company,Process\nAcme,FDM\n");
        let b = hash_content(b"Company,Process\nAcme,FDM\n");
        assert_eq!(a, b);
        assert!(a.starts_with("sha256:"));
        assert_ne!(a, hash_content(b"Company,Process\nBeta,FDM\n"));
    }

    // -------------------------------------------------------------------------
    // DATASET CONFIG
    // -------------------------------------------------------------------------

    #[test]
    fn test_datasets_config_parses() {
        let json = r#"{
            "version": "1",
            "datasets": [
                {"dataset": "companies", "file": "data/company-info.xlsx", "sheet": "Company Information"},
                {"dataset": "market-size", "file": "data/market.csv", "delimiter": ";", "enabled": false}
            ]
        }"#;
        let config: DatasetsConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.datasets.len(), 2);
        assert_eq!(config.datasets[0].dataset, Dataset::Companies);
        assert!(config.datasets[0].enabled);
        assert_eq!(config.datasets[1].dataset, Dataset::MarketSize);
        assert_eq!(config.datasets[1].delimiter, Some(';'));
        assert!(!config.datasets[1].enabled);
    }
}
