//! Variable marshaling between the host and the isolated environment.
//!
//! Each variable becomes one file in a bundle directory, described by a
//! `manifest.json`:
//!
//! ```text
//! vars/
//! ├── manifest.json        {"version": 1, "variables": [{"name", "kind", "file"}, ...]}
//! ├── tips_data.table.json columnar table, becomes a pandas DataFrame
//! ├── settings.json        any JSON value
//! └── raw_blob.bin         raw bytes
//! ```
//!
//! The same layout is used in both directions: the host writes the input
//! bundle before the environment starts, and the bootstrap writes declared
//! outputs in this format for the host to read back.

use crate::errors::{Result, SandboxError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

pub const MANIFEST_FILE: &str = "manifest.json";
pub const MANIFEST_VERSION: u32 = 1;

/// Names the bootstrap itself binds in the generated code's scope
pub const RESERVED_NAMES: &[&str] = &["declare_output"];

const PYTHON_KEYWORDS: &[&str] = &[
    "False", "None", "True", "and", "as", "assert", "async", "await", "break", "class",
    "continue", "def", "del", "elif", "else", "except", "finally", "for", "from", "global",
    "if", "import", "in", "is", "lambda", "nonlocal", "not", "or", "pass", "raise", "return",
    "try", "while", "with", "yield",
];

/// A single typed column of a [`Table`]; `None` marks a missing value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "dtype", rename_all = "snake_case")]
pub enum Column {
    Int { name: String, values: Vec<Option<i64>> },
    Float { name: String, values: Vec<Option<f64>> },
    Bool { name: String, values: Vec<Option<bool>> },
    Str { name: String, values: Vec<Option<String>> },
}

impl Column {
    pub fn name(&self) -> &str {
        match self {
            Column::Int { name, .. }
            | Column::Float { name, .. }
            | Column::Bool { name, .. }
            | Column::Str { name, .. } => name,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Column::Int { values, .. } => values.len(),
            Column::Float { values, .. } => values.len(),
            Column::Bool { values, .. } => values.len(),
            Column::Str { values, .. } => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dtype(&self) -> &'static str {
        match self {
            Column::Int { .. } => "int",
            Column::Float { .. } => "float",
            Column::Bool { .. } => "bool",
            Column::Str { .. } => "str",
        }
    }
}

/// Columnar data frame. Exposed as a `pandas.DataFrame` inside the environment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Table {
    columns: Vec<Column>,
}

impl Table {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_column(mut self, column: Column) -> Self {
        self.columns.push(column);
        self
    }

    pub fn int(self, name: &str, values: impl IntoIterator<Item = Option<i64>>) -> Self {
        self.with_column(Column::Int {
            name: name.to_string(),
            values: values.into_iter().collect(),
        })
    }

    pub fn float(self, name: &str, values: impl IntoIterator<Item = Option<f64>>) -> Self {
        self.with_column(Column::Float {
            name: name.to_string(),
            values: values.into_iter().collect(),
        })
    }

    pub fn bool(self, name: &str, values: impl IntoIterator<Item = Option<bool>>) -> Self {
        self.with_column(Column::Bool {
            name: name.to_string(),
            values: values.into_iter().collect(),
        })
    }

    pub fn str<S: Into<String>>(self, name: &str, values: impl IntoIterator<Item = Option<S>>) -> Self {
        self.with_column(Column::Str {
            name: name.to_string(),
            values: values.into_iter().map(|v| v.map(Into::into)).collect(),
        })
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name() == name)
    }

    pub fn rows(&self) -> usize {
        self.columns.first().map(Column::len).unwrap_or(0)
    }

    /// Reasons a table has no faithful transfer form
    fn check(&self) -> std::result::Result<(), String> {
        let rows = self.rows();
        let mut seen = HashSet::new();
        for column in &self.columns {
            if column.name().is_empty() {
                return Err("table has a column with an empty name".to_string());
            }
            if !seen.insert(column.name()) {
                return Err(format!("duplicate column `{}`", column.name()));
            }
            if column.len() != rows {
                return Err(format!(
                    "column `{}` has {} rows, expected {}",
                    column.name(),
                    column.len(),
                    rows
                ));
            }
            if let Column::Float { name, values } = column {
                if let Some(row) = values
                    .iter()
                    .position(|v| v.map(|f| !f.is_finite()).unwrap_or(false))
                {
                    return Err(format!(
                        "column `{}` row {} holds a non-finite float; use None for missing values",
                        name, row
                    ));
                }
            }
        }
        Ok(())
    }
}

/// How a variable travels through the mounts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariableKind {
    Json,
    Bytes,
    Table,
}

impl VariableKind {
    fn file_name(&self, name: &str) -> String {
        match self {
            VariableKind::Json => format!("{}.json", name),
            VariableKind::Bytes => format!("{}.bin", name),
            VariableKind::Table => format!("{}.table.json", name),
        }
    }
}

/// A host value that can be handed to generated code
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Json(serde_json::Value),
    Bytes(Vec<u8>),
    Table(Table),
}

impl Value {
    /// Convert any serde-serializable value into its JSON transfer form
    pub fn from_serialize<T: Serialize + ?Sized>(value: &T) -> serde_json::Result<Self> {
        serde_json::to_value(value).map(Value::Json)
    }

    pub fn kind(&self) -> VariableKind {
        match self {
            Value::Json(_) => VariableKind::Json,
            Value::Bytes(_) => VariableKind::Bytes,
            Value::Table(_) => VariableKind::Table,
        }
    }

    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Value::Json(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_table(&self) -> Option<&Table> {
        match self {
            Value::Table(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    fn shape(&self) -> String {
        match self {
            Value::Json(serde_json::Value::Object(map)) => format!("object with {} keys", map.len()),
            Value::Json(serde_json::Value::Array(items)) => format!("array of {} items", items.len()),
            Value::Json(serde_json::Value::String(_)) => "string".to_string(),
            Value::Json(serde_json::Value::Number(_)) => "number".to_string(),
            Value::Json(serde_json::Value::Bool(_)) => "bool".to_string(),
            Value::Json(serde_json::Value::Null) => "null".to_string(),
            Value::Bytes(bytes) => format!("{} bytes", bytes.len()),
            Value::Table(table) => format!(
                "{} rows x {} columns [{}]",
                table.rows(),
                table.columns().len(),
                table
                    .columns()
                    .iter()
                    .map(|c| format!("{}: {}", c.name(), c.dtype()))
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
        }
    }
}

impl From<serde_json::Value> for Value {
    fn from(value: serde_json::Value) -> Self {
        Value::Json(value)
    }
}

impl From<Vec<u8>> for Value {
    fn from(value: Vec<u8>) -> Self {
        Value::Bytes(value)
    }
}

impl From<Table> for Value {
    fn from(value: Table) -> Self {
        Value::Table(value)
    }
}

/// Short description of one variable, used in generation prompts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariableSummary {
    pub name: String,
    pub kind: VariableKind,
    pub shape: String,
}

impl fmt::Display for VariableSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:?}): {}", self.name, self.kind, self.shape)
    }
}

/// Named variables, ordered by name
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Variables {
    inner: BTreeMap<String, Value>,
}

impl Variables {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a value under `name`, returning the previous value for that name
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.inner.insert(name.into(), value.into())
    }

    /// Insert any serde-serializable value as JSON
    pub fn insert_serialize<T: Serialize + ?Sized>(&mut self, name: &str, value: &T) -> Result<()> {
        let value = Value::from_serialize(value)
            .map_err(|e| SandboxError::serialization(name, e.to_string()))?;
        self.inner.insert(name.to_string(), value);
        Ok(())
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.inner.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.inner.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.inner.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn describe(&self) -> Vec<VariableSummary> {
        self.iter()
            .map(|(name, value)| VariableSummary {
                name: name.to_string(),
                kind: value.kind(),
                shape: value.shape(),
            })
            .collect()
    }
}

impl<N: Into<String>, V: Into<Value>> FromIterator<(N, V)> for Variables {
    fn from_iter<I: IntoIterator<Item = (N, V)>>(iter: I) -> Self {
        let mut vars = Variables::new();
        for (name, value) in iter {
            vars.insert(name, value);
        }
        vars
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub name: String,
    pub kind: VariableKind,
    pub file: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,
    pub variables: Vec<ManifestEntry>,
}

/// What [`marshal`] wrote
#[derive(Debug, Clone)]
pub struct InputBundle {
    pub dir: PathBuf,
    pub entries: Vec<ManifestEntry>,
    pub bytes_written: u64,
}

/// Check that `name` can be bound verbatim in the generated code's scope
pub fn validate_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .map(|c| c.is_ascii_alphabetic() || c == '_')
        .unwrap_or(false);
    if !valid_start || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(SandboxError::serialization(
            name,
            "name is not an ASCII Python identifier",
        ));
    }
    if PYTHON_KEYWORDS.contains(&name) {
        return Err(SandboxError::serialization(name, "name is a Python keyword"));
    }
    if RESERVED_NAMES.contains(&name) || (name.starts_with("__") && name.ends_with("__")) {
        return Err(SandboxError::serialization(
            name,
            "name is reserved by the sandbox bootstrap",
        ));
    }
    Ok(())
}

/// Check every variable has a transfer form without writing anything
pub fn validate(vars: &Variables) -> Result<()> {
    for (name, value) in vars.iter() {
        validate_name(name)?;
        if let Value::Table(table) = value {
            table
                .check()
                .map_err(|reason| SandboxError::serialization(name, reason))?;
        }
    }
    Ok(())
}

/// Identifier tokens appearing anywhere in `code`
pub fn referenced_names(code: &str) -> BTreeSet<String> {
    let mut names = BTreeSet::new();
    let mut current = String::new();
    for c in code.chars().chain(std::iter::once(' ')) {
        if c.is_ascii_alphanumeric() || c == '_' {
            current.push(c);
        } else if !current.is_empty() {
            if !current.starts_with(|c: char| c.is_ascii_digit()) {
                names.insert(std::mem::take(&mut current));
            } else {
                current.clear();
            }
        }
    }
    names
}

/// Write `vars` into `dir`, one file per variable plus the manifest.
///
/// With `only`, variables whose names are not in the set are skipped.
/// Validation happens before the first byte is written.
pub fn marshal(vars: &Variables, dir: &Path, only: Option<&BTreeSet<String>>) -> Result<InputBundle> {
    validate(vars)?;
    std::fs::create_dir_all(dir)?;

    let mut entries = Vec::new();
    let mut bytes_written = 0u64;
    for (name, value) in vars.iter() {
        if let Some(only) = only {
            if !only.contains(name) {
                debug!("[MARSHAL] Skipping unreferenced variable `{}`", name);
                continue;
            }
        }
        let kind = value.kind();
        let file = kind.file_name(name);
        let path = dir.join(&file);
        bytes_written += write_value(&path, value)
            .map_err(|e| SandboxError::serialization(name, e.to_string()))?;
        entries.push(ManifestEntry {
            name: name.to_string(),
            kind,
            file,
        });
    }

    let manifest = Manifest {
        version: MANIFEST_VERSION,
        variables: entries.clone(),
    };
    let writer = BufWriter::new(File::create(dir.join(MANIFEST_FILE))?);
    serde_json::to_writer_pretty(writer, &manifest)?;

    debug!(
        "[MARSHAL] Wrote {} variables ({} bytes) to {:?}",
        entries.len(),
        bytes_written,
        dir
    );

    Ok(InputBundle {
        dir: dir.to_path_buf(),
        entries,
        bytes_written,
    })
}

fn write_value(path: &Path, value: &Value) -> std::io::Result<u64> {
    let mut writer = BufWriter::new(File::create(path)?);
    match value {
        Value::Json(json) => serde_json::to_writer(&mut writer, json)?,
        Value::Table(table) => serde_json::to_writer(&mut writer, table)?,
        Value::Bytes(bytes) => writer.write_all(bytes)?,
    }
    writer.flush()?;
    drop(writer);
    Ok(std::fs::metadata(path)?.len())
}

/// Read a bundle back. A directory without a manifest holds no variables.
pub fn unmarshal(dir: &Path) -> Result<Variables> {
    match std::fs::symlink_metadata(dir) {
        Ok(meta) if meta.is_dir() => {}
        Ok(_) => {
            return Err(SandboxError::InternalError(format!(
                "bundle {} is not a plain directory",
                dir.display()
            )))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Variables::new()),
        Err(e) => return Err(e.into()),
    }
    let manifest_path = dir.join(MANIFEST_FILE);
    if std::fs::symlink_metadata(&manifest_path).is_err() {
        return Ok(Variables::new());
    }

    let manifest: Manifest = serde_json::from_reader(BufReader::new(open_regular(&manifest_path)?))?;
    if manifest.version != MANIFEST_VERSION {
        return Err(SandboxError::InternalError(format!(
            "unsupported manifest version {}",
            manifest.version
        )));
    }

    let mut vars = Variables::new();
    for entry in manifest.variables {
        validate_name(&entry.name)?;
        if entry.file.contains(['/', '\\']) || entry.file.starts_with('.') {
            return Err(SandboxError::serialization(
                &entry.name,
                format!("manifest points outside the bundle: {}", entry.file),
            ));
        }
        let value = read_value(&dir.join(&entry.file), entry.kind)
            .map_err(|e| SandboxError::serialization(&entry.name, e.to_string()))?;
        vars.insert(entry.name, value);
    }
    Ok(vars)
}

/// Open `path` only if it is a regular file, never following a symlink.
///
/// Bundles read back from the output mount were written by generated code;
/// the environment has stopped by then, so the entry cannot change after the check.
pub(crate) fn open_regular(path: &Path) -> std::io::Result<File> {
    let meta = std::fs::symlink_metadata(path)?;
    if !meta.file_type().is_file() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("{} is not a regular file", path.display()),
        ));
    }
    File::open(path)
}

fn read_value(path: &Path, kind: VariableKind) -> std::io::Result<Value> {
    let mut reader = BufReader::new(open_regular(path)?);
    Ok(match kind {
        VariableKind::Json => Value::Json(serde_json::from_reader(&mut reader)?),
        VariableKind::Table => Value::Table(serde_json::from_reader(&mut reader)?),
        VariableKind::Bytes => {
            let mut bytes = Vec::new();
            reader.read_to_end(&mut bytes)?;
            Value::Bytes(bytes)
        }
    })
}
