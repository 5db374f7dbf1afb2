//! Typed variables attached to a service
//!
//! Any module can describe a [`DataType`] and store values of it on a
//! service without the core knowing about it. Keyed types (`keyed = true`)
//! are instanced by a variable name, e.g. one `env` entry per variable.

use std::fmt;

/// Value shape a data type accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataKind {
    String,
    StringList,
    Set,
    Int,
}

impl DataKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::StringList => "string list",
            Self::Set => "set",
            Self::Int => "integer",
        }
    }
}

/// Descriptor of one variable
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataType {
    pub name: &'static str,
    pub kind: DataKind,
    /// Requires a variable name sub-key
    pub keyed: bool,
    pub description: &'static str,
}

impl DataType {
    pub const fn new(name: &'static str, kind: DataKind, description: &'static str) -> Self {
        Self {
            name,
            kind,
            keyed: false,
            description,
        }
    }

    pub const fn keyed(name: &'static str, kind: DataKind, description: &'static str) -> Self {
        Self {
            name,
            kind,
            keyed: true,
            description,
        }
    }
}

/// Stored payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    String(String),
    Int(i32),
    Set,
}

impl Value {
    pub fn kind(&self) -> DataKind {
        match self {
            Self::String(_) => DataKind::String,
            Self::Int(_) => DataKind::Int,
            Self::Set => DataKind::Set,
        }
    }

    fn fits(&self, kind: DataKind) -> bool {
        matches!(
            (self, kind),
            (Self::String(_), DataKind::String)
                | (Self::String(_), DataKind::StringList)
                | (Self::Int(_), DataKind::Int)
                | (Self::Set, DataKind::Set)
        )
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String(s) => f.write_str(s),
            Self::Int(i) => write!(f, "{}", i),
            Self::Set => f.write_str("set"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataEntry {
    pub data_type: DataType,
    pub var_name: Option<String>,
    pub value: Value,
}

impl DataEntry {
    fn matches(&self, ty: &DataType, var: Option<&str>) -> bool {
        self.data_type.name == ty.name && self.var_name.as_deref() == var
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DataError {
    #[error("\"{name}\" is not a {expected} type, got a {found} value")]
    TypeMismatch {
        name: &'static str,
        expected: &'static str,
        found: &'static str,
    },

    #[error("The variable name is missing for \"{0}\"")]
    MissingVarName(&'static str),
}

/// Entries owned by one service
#[derive(Debug, Clone, Default)]
pub struct DataSet {
    entries: Vec<DataEntry>,
}

impl DataSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `value` under `(ty, var)`
    ///
    /// Replaces an existing entry, except for string lists where every call
    /// appends one element. A variable name given for an unkeyed type is
    /// ignored.
    pub fn set(&mut self, ty: &DataType, var: Option<&str>, value: Value) -> Result<(), DataError> {
        if !value.fits(ty.kind) {
            return Err(DataError::TypeMismatch {
                name: ty.name,
                expected: ty.kind.as_str(),
                found: value.kind().as_str(),
            });
        }
        let var = key(ty, var)?;

        if ty.kind != DataKind::StringList {
            if let Some(entry) = self.entries.iter_mut().find(|e| e.matches(ty, var)) {
                entry.value = value;
                return Ok(());
            }
        }

        self.entries.push(DataEntry {
            data_type: *ty,
            var_name: var.map(str::to_string),
            value,
        });
        Ok(())
    }

    pub fn set_string(&mut self, ty: &DataType, var: Option<&str>, value: impl Into<String>) -> Result<(), DataError> {
        self.set(ty, var, Value::String(value.into()))
    }

    pub fn set_int(&mut self, ty: &DataType, var: Option<&str>, value: i32) -> Result<(), DataError> {
        self.set(ty, var, Value::Int(value))
    }

    pub fn set_flag(&mut self, ty: &DataType, var: Option<&str>) -> Result<(), DataError> {
        self.set(ty, var, Value::Set)
    }

    pub fn get_string(&self, ty: &DataType, var: Option<&str>) -> Option<&str> {
        match self.find(ty, var)?.value {
            Value::String(ref s) => Some(s),
            _ => None,
        }
    }

    /// Every string stored under `(ty, var)`, in insertion order
    ///
    /// The iterator borrows the set; call again to restart.
    pub fn strings<'a>(&'a self, ty: &'a DataType, var: Option<&'a str>) -> impl Iterator<Item = &'a str> + 'a {
        let var = normalize(ty, var);
        self.entries
            .iter()
            .filter(move |e| e.matches(ty, var))
            .filter_map(|e| match e.value {
                Value::String(ref s) => Some(s.as_str()),
                _ => None,
            })
    }

    pub fn is_set(&self, ty: &DataType, var: Option<&str>) -> bool {
        matches!(self.find(ty, var), Some(DataEntry { value: Value::Set, .. }))
    }

    pub fn get_int(&self, ty: &DataType, var: Option<&str>) -> Option<i32> {
        match self.find(ty, var)?.value {
            Value::Int(i) => Some(i),
            _ => None,
        }
    }

    /// Remove every entry under `(ty, var)`, returns how many went
    pub fn unset(&mut self, ty: &DataType, var: Option<&str>) -> usize {
        let var = normalize(ty, var);
        let before = self.entries.len();
        self.entries.retain(|e| !e.matches(ty, var));
        before - self.entries.len()
    }

    /// Keyed entries of `ty` as `(var_name, value)` pairs
    pub fn keyed<'a>(&'a self, ty: &'a DataType) -> impl Iterator<Item = (&'a str, &'a Value)> + 'a {
        self.entries
            .iter()
            .filter(move |e| e.data_type.name == ty.name)
            .filter_map(|e| e.var_name.as_deref().map(|v| (v, &e.value)))
    }

    pub fn iter(&self) -> impl Iterator<Item = &DataEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    fn find(&self, ty: &DataType, var: Option<&str>) -> Option<&DataEntry> {
        let var = normalize(ty, var);
        self.entries.iter().find(|e| e.matches(ty, var))
    }
}

fn key<'a>(ty: &DataType, var: Option<&'a str>) -> Result<Option<&'a str>, DataError> {
    match (ty.keyed, var) {
        (true, None) => Err(DataError::MissingVarName(ty.name)),
        (true, Some(v)) => Ok(Some(v)),
        (false, _) => Ok(None),
    }
}

fn normalize<'a>(ty: &DataType, var: Option<&'a str>) -> Option<&'a str> {
    if ty.keyed {
        var
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXEC: DataType = DataType::new("exec", DataKind::String, "");
    const ARGS: DataType = DataType::new("exec_args", DataKind::StringList, "");
    const RESPAWN: DataType = DataType::new("respawn", DataKind::Set, "");
    const TIMEOUT: DataType = DataType::new("timeout", DataKind::Int, "");
    const ENV: DataType = DataType::keyed("env", DataKind::String, "");

    #[test]
    fn test_string_replaces() {
        let mut data = DataSet::new();
        data.set_string(&EXEC, None, "/bin/false").unwrap();
        data.set_string(&EXEC, None, "/bin/true").unwrap();

        assert_eq!(data.len(), 1);
        assert_eq!(data.get_string(&EXEC, None), Some("/bin/true"));
    }

    #[test]
    fn test_string_list_appends() {
        let mut data = DataSet::new();
        data.set_string(&ARGS, None, "-n").unwrap();
        data.set_string(&ARGS, None, "tty1").unwrap();

        assert_eq!(data.len(), 2);
        assert_eq!(data.strings(&ARGS, None).collect::<Vec<_>>(), vec!["-n", "tty1"]);
        // Restartable
        assert_eq!(data.strings(&ARGS, None).count(), 2);
    }

    #[test]
    fn test_type_mismatch() {
        let mut data = DataSet::new();
        let err = data.set_string(&RESPAWN, None, "yes").unwrap_err();
        assert!(matches!(err, DataError::TypeMismatch { name: "respawn", .. }));

        let err = data.set_int(&EXEC, None, 3).unwrap_err();
        assert!(matches!(err, DataError::TypeMismatch { name: "exec", .. }));
        assert!(data.is_empty());
    }

    #[test]
    fn test_keyed_requires_var_name() {
        let mut data = DataSet::new();
        assert_eq!(
            data.set_string(&ENV, None, "x").unwrap_err(),
            DataError::MissingVarName("env")
        );

        data.set_string(&ENV, Some("PATH"), "/bin").unwrap();
        data.set_string(&ENV, Some("TERM"), "linux").unwrap();
        data.set_string(&ENV, Some("PATH"), "/usr/bin").unwrap();

        assert_eq!(data.len(), 2);
        assert_eq!(data.get_string(&ENV, Some("PATH")), Some("/usr/bin"));
        assert_eq!(data.get_string(&ENV, None), None);

        let pairs: Vec<(&str, String)> = data.keyed(&ENV).map(|(k, v)| (k, v.to_string())).collect();
        assert_eq!(pairs, vec![("PATH", "/usr/bin".to_string()), ("TERM", "linux".to_string())]);
    }

    #[test]
    fn test_unkeyed_ignores_var_name() {
        let mut data = DataSet::new();
        data.set_string(&EXEC, Some("ignored"), "/bin/true").unwrap();
        assert_eq!(data.get_string(&EXEC, None), Some("/bin/true"));
        assert_eq!(data.get_string(&EXEC, Some("other")), Some("/bin/true"));
    }

    #[test]
    fn test_set_and_int() {
        let mut data = DataSet::new();
        assert!(!data.is_set(&RESPAWN, None));
        data.set_flag(&RESPAWN, None).unwrap();
        assert!(data.is_set(&RESPAWN, None));

        assert_eq!(data.get_int(&TIMEOUT, None), None);
        data.set_int(&TIMEOUT, None, 30).unwrap();
        assert_eq!(data.get_int(&TIMEOUT, None), Some(30));
    }

    #[test]
    fn test_unset() {
        let mut data = DataSet::new();
        data.set_string(&ARGS, None, "a").unwrap();
        data.set_string(&ARGS, None, "b").unwrap();
        data.set_string(&EXEC, None, "/bin/sh").unwrap();

        assert_eq!(data.unset(&ARGS, None), 2);
        assert_eq!(data.unset(&ARGS, None), 0);
        assert_eq!(data.len(), 1);
    }
}
