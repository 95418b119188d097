//! Foreign table descriptor and option parsing.
//!
//! The descriptor is owned by the catalog and read-only to the storage
//! layer. Option values arrive verbatim from `CREATE FOREIGN TABLE`; the
//! error strings raised here are user-visible and fixed.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use fstore_result::{Error, Result};

use crate::chunk_key::TablePrefix;
use crate::schema::ForeignTableSchema;

pub const DEFAULT_FRAGMENT_SIZE: usize = 32_000_000;
pub const DEFAULT_BUFFER_SIZE: usize = 32 * 1024 * 1024;

/// Format of `refresh_start_date_time`.
const START_DATE_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Wrapper kind named by the foreign table descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataWrapperType {
    Csv,
    Parquet,
}

impl DataWrapperType {
    pub fn from_name(name: &str) -> Result<Self> {
        match name.to_ascii_lowercase().as_str() {
            "csv" => Ok(DataWrapperType::Csv),
            "parquet" => Ok(DataWrapperType::Parquet),
            _ => Err(Error::UnsupportedWrapper),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RefreshUpdateType {
    #[default]
    All,
    Append,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RefreshTimingType {
    #[default]
    Manual,
    Scheduled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshIntervalUnit {
    Seconds,
    Hours,
    Days,
}

/// Parsed `refresh_interval` value: `<int><S|H|D>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshInterval {
    pub count: i64,
    pub unit: RefreshIntervalUnit,
}

impl RefreshInterval {
    pub fn parse(value: &str) -> Result<Self> {
        let invalid =
            || Error::BadOption("Invalid value provided for the REFRESH_INTERVAL option.".into());
        let value = value.trim();
        if value.len() < 2 {
            return Err(invalid());
        }
        let (digits, unit) = value.split_at(value.len() - 1);
        let count: i64 = digits.parse().map_err(|_| invalid())?;
        if count <= 0 {
            return Err(invalid());
        }
        let unit = match unit.to_ascii_uppercase().as_str() {
            "S" => RefreshIntervalUnit::Seconds,
            "H" => RefreshIntervalUnit::Hours,
            "D" => RefreshIntervalUnit::Days,
            _ => return Err(invalid()),
        };
        Ok(Self { count, unit })
    }

    pub fn as_seconds(&self) -> i64 {
        match self.unit {
            RefreshIntervalUnit::Seconds => self.count,
            RefreshIntervalUnit::Hours => self.count * 3600,
            RefreshIntervalUnit::Days => self.count * 86_400,
        }
    }
}

/// Refresh policy of a foreign table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RefreshParams {
    pub update_type: RefreshUpdateType,
    pub timing_type: RefreshTimingType,
    /// Epoch seconds (UTC); `None` for manual timing.
    pub start_time: Option<i64>,
    pub interval: Option<RefreshInterval>,
}

impl RefreshParams {
    pub fn from_options(options: &ParsedOptions, now: i64) -> Result<Self> {
        let update_type = match options.get("refresh_update_type") {
            None => RefreshUpdateType::All,
            Some(value) => match value.to_ascii_uppercase().as_str() {
                "ALL" => RefreshUpdateType::All,
                "APPEND" => RefreshUpdateType::Append,
                _ => {
                    return Err(Error::BadOption(format!(
                        "Invalid value \"{value}\" for REFRESH_UPDATE_TYPE option. Value must be \"APPEND\" or \"ALL\"."
                    )));
                }
            },
        };
        let timing_type = match options.get("refresh_timing_type") {
            None => RefreshTimingType::Manual,
            Some(value) => match value.to_ascii_uppercase().as_str() {
                "MANUAL" => RefreshTimingType::Manual,
                "SCHEDULED" => RefreshTimingType::Scheduled,
                _ => {
                    return Err(Error::BadOption(
                        "Invalid value provided for the REFRESH_TIMING_TYPE option. Value must be \"MANUAL\" or \"SCHEDULED\"."
                            .into(),
                    ));
                }
            },
        };
        let start_time = match options.get("refresh_start_date_time") {
            None => None,
            Some(value) => {
                let parsed = NaiveDateTime::parse_from_str(value, START_DATE_TIME_FORMAT)
                    .map_err(|_| {
                        Error::BadOption(format!("Invalid DATE/TIMESTAMP string ({value})"))
                    })?;
                Some(parsed.and_utc().timestamp())
            }
        };
        let interval = match options.get("refresh_interval") {
            None => None,
            Some(value) => Some(RefreshInterval::parse(value)?),
        };

        if timing_type == RefreshTimingType::Scheduled {
            match start_time {
                None => {
                    return Err(Error::BadOption(
                        "REFRESH_START_DATE_TIME option must be provided for scheduled refreshes."
                            .into(),
                    ));
                }
                Some(start) if start < now => {
                    return Err(Error::BadOption(
                        "REFRESH_START_DATE_TIME cannot be a past date time.".into(),
                    ));
                }
                Some(_) => {}
            }
        }

        Ok(Self {
            update_type,
            timing_type,
            start_time,
            interval,
        })
    }
}

/// Delimited-text parse options interpreted verbatim from the statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsvParseOptions {
    pub header: bool,
    pub delimiter: u8,
    pub line_delimiter: u8,
    pub quoted: bool,
    pub quote: u8,
    pub escape: u8,
    pub array_delimiter: u8,
    pub array_marker: (u8, u8),
    /// Token treated as NULL; empty unquoted fields are NULL as well.
    pub nulls: String,
    pub lonlat: bool,
    pub buffer_size: usize,
}

impl Default for CsvParseOptions {
    fn default() -> Self {
        Self {
            header: true,
            delimiter: b',',
            line_delimiter: b'\n',
            quoted: true,
            quote: b'"',
            escape: b'\\',
            array_delimiter: b',',
            array_marker: (b'{', b'}'),
            nulls: "NA".to_string(),
            lonlat: true,
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

impl CsvParseOptions {
    pub fn from_options(options: &ParsedOptions) -> Result<Self> {
        let mut parsed = CsvParseOptions::default();
        if let Some(value) = options.get("header") {
            parsed.header = parse_bool(value, "HEADER")?;
        }
        if let Some(value) = options.get("quoted") {
            parsed.quoted = parse_bool(value, "QUOTED")?;
        }
        if let Some(value) = options.get("lonlat") {
            parsed.lonlat = parse_bool(value, "LONLAT")?;
        }
        if let Some(value) = options.get("delimiter") {
            parsed.delimiter = parse_char(value, "DELIMITER")?;
        }
        if let Some(value) = options.get("line_delimiter") {
            parsed.line_delimiter = parse_char(value, "LINE_DELIMITER")?;
        }
        if let Some(value) = options.get("quote") {
            parsed.quote = parse_char(value, "QUOTE")?;
        }
        if let Some(value) = options.get("escape") {
            parsed.escape = parse_char(value, "ESCAPE")?;
        }
        if let Some(value) = options.get("array_delimiter") {
            parsed.array_delimiter = parse_char(value, "ARRAY_DELIMITER")?;
        }
        if let Some(value) = options.get("array_marker") {
            let bytes = value.as_bytes();
            if bytes.len() != 2 {
                return Err(Error::BadOption(format!(
                    "Invalid value \"{value}\" provided for ARRAY_MARKER option. Value must be exactly two characters."
                )));
            }
            parsed.array_marker = (bytes[0], bytes[1]);
        }
        if let Some(value) = options.get("nulls") {
            parsed.nulls = value.clone();
        }
        if let Some(value) = options.get("buffer_size") {
            parsed.buffer_size = parse_positive(value, "BUFFER_SIZE")?;
        }
        Ok(parsed)
    }
}

fn parse_bool(value: &str, option: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "t" => Ok(true),
        "false" | "f" => Ok(false),
        _ => Err(Error::BadOption(format!(
            "Invalid value \"{value}\" provided for {option} option. Value must be either \"true\" or \"false\"."
        ))),
    }
}

fn parse_char(value: &str, option: &str) -> Result<u8> {
    match value.as_bytes() {
        [c] => Ok(*c),
        b"\\n" => Ok(b'\n'),
        b"\\t" => Ok(b'\t'),
        _ => Err(Error::BadOption(format!(
            "Invalid value \"{value}\" provided for {option} option. Value must be a single character."
        ))),
    }
}

fn parse_positive(value: &str, option: &str) -> Result<usize> {
    value
        .parse::<usize>()
        .ok()
        .filter(|v| *v > 0)
        .ok_or_else(|| {
            Error::BadOption(format!(
                "Invalid value \"{value}\" provided for {option} option. Value must be a positive integer."
            ))
        })
}

const KNOWN_OPTIONS: &[&str] = &[
    "file_path",
    "fragment_size",
    "buffer_size",
    "header",
    "quoted",
    "quote",
    "escape",
    "delimiter",
    "array_delimiter",
    "array_marker",
    "line_delimiter",
    "nulls",
    "lonlat",
    "refresh_update_type",
    "refresh_timing_type",
    "refresh_start_date_time",
    "refresh_interval",
];

/// Statement options with case-insensitive keys and verbatim values.
#[derive(Debug, Default, Clone)]
pub struct ParsedOptions(HashMap<String, String>);

impl ParsedOptions {
    /// Normalizes keys and rejects options no wrapper understands.
    pub fn new(options: &HashMap<String, String>) -> Result<Self> {
        let mut normalized = HashMap::with_capacity(options.len());
        for (key, value) in options {
            let lower = key.to_ascii_lowercase();
            if !KNOWN_OPTIONS.contains(&lower.as_str()) {
                return Err(Error::BadOption(format!(
                    "Invalid option \"{}\" provided for foreign table.",
                    key.to_ascii_uppercase()
                )));
            }
            normalized.insert(lower, value.clone());
        }
        Ok(Self(normalized))
    }

    fn get(&self, key: &str) -> Option<&String> {
        self.0.get(key)
    }
}

/// Read-only descriptor of one foreign table.
#[derive(Debug, Clone)]
pub struct ForeignTable {
    pub db_id: i32,
    pub table_id: i32,
    pub name: String,
    pub wrapper_type: DataWrapperType,
    pub file_path: PathBuf,
    pub fragment_size: usize,
    pub schema: ForeignTableSchema,
    pub csv: CsvParseOptions,
    pub refresh: RefreshParams,
}

impl ForeignTable {
    /// Build a descriptor from statement options. `now` is the statement
    /// time, used to reject past refresh start times.
    pub fn from_options(
        db_id: i32,
        table_id: i32,
        name: impl Into<String>,
        wrapper_type: DataWrapperType,
        schema: ForeignTableSchema,
        options: &HashMap<String, String>,
        now: i64,
    ) -> Result<Self> {
        let options = ParsedOptions::new(options)?;
        let file_path = options
            .get("file_path")
            .map(PathBuf::from)
            .ok_or_else(|| Error::BadOption("FILE_PATH option must be provided.".into()))?;
        let fragment_size = match options.get("fragment_size") {
            None => DEFAULT_FRAGMENT_SIZE,
            Some(value) => parse_positive(value, "FRAGMENT_SIZE")?,
        };
        let refresh = RefreshParams::from_options(&options, now)?;
        let csv = CsvParseOptions::from_options(&options)?;
        Ok(Self {
            db_id,
            table_id,
            name: name.into(),
            wrapper_type,
            file_path,
            fragment_size,
            schema,
            csv,
            refresh,
        })
    }

    pub fn table_prefix(&self) -> TablePrefix {
        TablePrefix::new(self.db_id, self.table_id)
    }

    pub fn is_append_mode(&self) -> bool {
        self.refresh.update_type == RefreshUpdateType::Append
    }

    /// Foreign tables are read-only; every write statement is rejected.
    pub fn check_write_allowed(&self) -> Result<()> {
        Err(Error::WriteRejected)
    }

    /// File name component of the source path, used in source mutation
    /// errors.
    pub fn file_name(&self) -> String {
        file_name_of(&self.file_path)
    }
}

pub fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}
