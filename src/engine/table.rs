use itertools::Itertools;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One attempt input: field name -> value
pub type Record = Map<String, Value>;

/// Named column of candidate values
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub values: Vec<Value>,
}

impl Field {
    pub fn new<I, V>(name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Self {
            name: name.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }
}

/// Combinatorial source of records.
///
/// Records are the cartesian product of all fields. The primary field, when
/// present, is the outermost dimension so records sharing a primary value are
/// contiguous.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Table {
    primary: Option<Field>,
    fields: Vec<Field>,
}

impl Table {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_field(&mut self, field: Field) {
        self.fields.push(field);
    }

    /// Sets the primary field, replacing any previous one
    pub fn add_primary_field(&mut self, field: Field) {
        self.primary = Some(field);
    }

    pub fn with_field(mut self, field: Field) -> Self {
        self.add_field(field);
        self
    }

    pub fn with_primary_field(mut self, field: Field) -> Self {
        self.add_primary_field(field);
        self
    }

    pub fn primary_field(&self) -> Option<&Field> {
        self.primary.as_ref()
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    /// Number of records the table produces, saturating at `usize::MAX`
    pub fn len(&self) -> usize {
        let columns = self.columns();
        if columns.is_empty() {
            return 0;
        }
        columns
            .iter()
            .try_fold(1usize, |acc, f| acc.checked_mul(f.values.len()))
            .unwrap_or(usize::MAX)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Primary value of a record, if the table has a primary field
    pub fn primary_value<'a>(&self, record: &'a Record) -> Option<&'a Value> {
        self.primary.as_ref().and_then(|p| record.get(&p.name))
    }

    /// All records in table order
    pub fn records(&self) -> Box<dyn Iterator<Item = Record> + Send + '_> {
        Self::product(self.columns())
    }

    /// Records grouped by primary value, in primary order.
    ///
    /// Without a primary field every record forms its own group keyed by `Null`.
    pub fn records_grouped(&self) -> Box<dyn Iterator<Item = (Value, Vec<Record>)> + Send + '_> {
        match &self.primary {
            Some(primary) => Box::new(primary.values.iter().map(move |value| {
                let mut columns = vec![primary.clone()];
                columns[0].values = vec![value.clone()];
                columns.extend(self.fields.iter().cloned());
                let group: Vec<Record> = Self::product(columns.iter().collect()).collect();
                (value.clone(), group)
            })),
            None => Box::new(self.records().map(|r| (Value::Null, vec![r]))),
        }
    }

    fn columns(&self) -> Vec<&Field> {
        self.primary.iter().chain(self.fields.iter()).collect()
    }

    fn product<'a>(columns: Vec<&'a Field>) -> Box<dyn Iterator<Item = Record> + Send + 'a> {
        if columns.is_empty() {
            return Box::new(std::iter::empty());
        }
        let names: Vec<&'a str> = columns.iter().map(|f| f.name.as_str()).collect();
        Box::new(
            columns
                .into_iter()
                .map(|f| f.values.iter())
                .multi_cartesian_product()
                .map(move |row| {
                    names
                        .iter()
                        .zip(row)
                        .map(|(name, value)| (name.to_string(), value.clone()))
                        .collect()
                }),
        )
    }
}
