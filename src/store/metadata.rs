//! Metadata table: product rows in insertion order plus an id -> row map.
//!
//! Row position is an internal detail; every public operation is addressed
//! by product id.

use std::collections::{HashMap, HashSet};
use std::io::{Read, Write};
use std::time::Instant;

use crate::product::ProductRecord;
use crate::store::StorageError;

pub const CSV_HEADERS: [&str; 8] = [
    "id",
    "name",
    "brand",
    "categories",
    "ingredients",
    "manufacturer",
    "manufacturerNumber",
    "text_corpus",
];

#[derive(Debug, Clone, Default)]
pub struct MetadataTable {
    rows: Vec<ProductRecord>,
    positions: HashMap<u64, usize>,
}

impl MetadataTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn contains(&self, id: u64) -> bool {
        self.positions.contains_key(&id)
    }

    pub fn get(&self, id: u64) -> Option<&ProductRecord> {
        self.positions.get(&id).map(|&pos| &self.rows[pos])
    }

    pub fn iter(&self) -> impl Iterator<Item = &ProductRecord> {
        self.rows.iter()
    }

    pub fn ids(&self) -> impl Iterator<Item = u64> + '_ {
        self.rows.iter().map(|r| r.id)
    }

    pub fn max_id(&self) -> Option<u64> {
        self.positions.keys().copied().max()
    }

    /// Append a new row. Fails if the id is already present.
    pub fn insert(&mut self, record: ProductRecord) -> Result<(), StorageError> {
        if self.positions.contains_key(&record.id) {
            return Err(StorageError::DuplicateId(record.id));
        }
        self.positions.insert(record.id, self.rows.len());
        self.rows.push(record);
        Ok(())
    }

    /// Replace the row with the same id, returning the previous row.
    pub fn replace(&mut self, record: ProductRecord) -> Option<ProductRecord> {
        let pos = *self.positions.get(&record.id)?;
        Some(std::mem::replace(&mut self.rows[pos], record))
    }

    /// Drop every row whose id is in `ids`. Surviving ids are unchanged.
    pub fn remove_ids(&mut self, ids: &HashSet<u64>) -> usize {
        let before = self.rows.len();
        self.rows.retain(|r| !ids.contains(&r.id));
        self.reindex();
        before - self.rows.len()
    }

    fn reindex(&mut self) {
        self.positions = self
            .rows
            .iter()
            .enumerate()
            .map(|(pos, r)| (r.id, pos))
            .collect();
    }

    pub fn write_csv<W: Write>(&self, writer: W) -> Result<(), StorageError> {
        let mut csv_wrt = csv::Writer::from_writer(writer);
        csv_wrt.write_record(CSV_HEADERS)?;
        for record in &self.rows {
            csv_wrt.write_record([
                &record.id.to_string(),
                &record.name,
                &record.brand,
                &record.categories,
                &record.ingredients,
                &record.manufacturer,
                &record.manufacturer_number,
                &record.corpus,
            ])?;
        }
        csv_wrt.flush()?;
        Ok(())
    }

    pub fn read_csv<R: Read>(reader: R) -> Result<Self, StorageError> {
        let now = Instant::now();
        let mut csv_reader = csv::Reader::from_reader(reader);

        let headers = csv_reader.headers()?.clone();
        if headers.iter().ne(CSV_HEADERS.iter().copied()) {
            return Err(StorageError::InvalidFormat(format!(
                "unexpected metadata columns: {}",
                headers.iter().collect::<Vec<_>>().join(",")
            )));
        }

        let mut table = Self::new();
        for record in csv_reader.deserialize::<ProductRecord>() {
            table.insert(record?)?;
        }

        log::debug!(
            "took {}ms to read {} metadata rows",
            now.elapsed().as_micros() as f64 / 1000.0,
            table.len()
        );

        Ok(table)
    }
}
