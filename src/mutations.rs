//! Comparable hashes of wide-column row mutations.
//!
//! Replication pipelines between HBase and Bigtable are tested by
//! checking that the mutations written on one side match the ones
//! read from the other. Mutations carry server-assigned fields that
//! differ between otherwise identical writes, so they are first
//! normalized into strings with [`hash_mutation_list`].
//!
//! The cell model here is only rich enough to hash.

use std::fmt;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HashError {
    #[error("cell type {0} is not supported")]
    UnsupportedCellType(CellType),
    #[error("key {key:?} is not the same as row mutations row {row:?}")]
    RowKeyMismatch { key: String, row: String },
    #[error("mutation for row {mutation_row:?} doesn't match row mutations row {row:?}")]
    WrongRow { mutation_row: String, row: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CellType {
    Put,
    /// Delete a single version of a column.
    Delete,
    /// Delete all versions of a column.
    DeleteColumn,
    /// Delete all columns of a family.
    DeleteFamily,
    /// Delete all columns of a family with one timestamp.
    DeleteFamilyVersion,
}

impl fmt::Display for CellType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Put => "PUT",
            Self::Delete => "DELETE",
            Self::DeleteColumn => "DELETE_COLUMN",
            Self::DeleteFamily => "DELETE_FAMILY",
            Self::DeleteFamilyVersion => "DELETE_FAMILY_VERSION",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cell {
    pub row: Vec<u8>,
    pub family: Vec<u8>,
    pub qualifier: Vec<u8>,
    /// Milliseconds since the epoch.
    pub timestamp: i64,
    pub value: Vec<u8>,
    pub cell_type: CellType,
}

/// Changes to a single row, in the order they were added.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mutation {
    row: Vec<u8>,
    cells: Vec<Cell>,
}

impl Mutation {
    pub fn row(&self) -> &[u8] {
        &self.row
    }

    pub fn cells(&self) -> &[Cell] {
        &self.cells
    }

    fn push(&mut self, family: &[u8], qualifier: &[u8], timestamp: i64, value: &[u8], cell_type: CellType) {
        self.cells.push(Cell {
            row: self.row.clone(),
            family: family.to_vec(),
            qualifier: qualifier.to_vec(),
            timestamp,
            value: value.to_vec(),
            cell_type,
        });
    }
}

/// Builds a [`Mutation`] that writes values.
#[derive(Debug, Clone)]
pub struct Put(Mutation);

impl Put {
    pub fn new(row: impl AsRef<[u8]>) -> Self {
        Self(Mutation {
            row: row.as_ref().to_vec(),
            cells: Vec::new(),
        })
    }

    pub fn add_column(
        mut self,
        family: impl AsRef<[u8]>,
        qualifier: impl AsRef<[u8]>,
        timestamp: i64,
        value: impl AsRef<[u8]>,
    ) -> Self {
        self.0.push(
            family.as_ref(),
            qualifier.as_ref(),
            timestamp,
            value.as_ref(),
            CellType::Put,
        );
        self
    }
}

impl From<Put> for Mutation {
    fn from(put: Put) -> Self {
        put.0
    }
}

/// Builds a [`Mutation`] that removes values.
#[derive(Debug, Clone)]
pub struct Delete(Mutation);

impl Delete {
    pub fn new(row: impl AsRef<[u8]>) -> Self {
        Self(Mutation {
            row: row.as_ref().to_vec(),
            cells: Vec::new(),
        })
    }

    /// Delete one version of a column.
    pub fn add_column(
        mut self,
        family: impl AsRef<[u8]>,
        qualifier: impl AsRef<[u8]>,
        timestamp: i64,
    ) -> Self {
        self.0.push(
            family.as_ref(),
            qualifier.as_ref(),
            timestamp,
            &[],
            CellType::Delete,
        );
        self
    }

    /// Delete all versions of a column up to `timestamp`.
    pub fn add_columns(
        mut self,
        family: impl AsRef<[u8]>,
        qualifier: impl AsRef<[u8]>,
        timestamp: i64,
    ) -> Self {
        self.0.push(
            family.as_ref(),
            qualifier.as_ref(),
            timestamp,
            &[],
            CellType::DeleteColumn,
        );
        self
    }

    pub fn add_family(mut self, family: impl AsRef<[u8]>, timestamp: i64) -> Self {
        self.0
            .push(family.as_ref(), &[], timestamp, &[], CellType::DeleteFamily);
        self
    }

    pub fn add_family_version(mut self, family: impl AsRef<[u8]>, timestamp: i64) -> Self {
        self.0.push(
            family.as_ref(),
            &[],
            timestamp,
            &[],
            CellType::DeleteFamilyVersion,
        );
        self
    }
}

impl From<Delete> for Mutation {
    fn from(delete: Delete) -> Self {
        delete.0
    }
}

/// An ordered group of mutations applied atomically to one row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowMutations {
    row: Vec<u8>,
    mutations: Vec<Mutation>,
}

impl RowMutations {
    pub fn new(row: impl AsRef<[u8]>) -> Self {
        Self {
            row: row.as_ref().to_vec(),
            mutations: Vec::new(),
        }
    }

    /// Append a mutation. It must target this row.
    pub fn add(&mut self, mutation: impl Into<Mutation>) -> Result<(), HashError> {
        let mutation = mutation.into();
        if mutation.row != self.row {
            return Err(HashError::WrongRow {
                mutation_row: bytes_to_string(&mutation.row),
                row: bytes_to_string(&self.row),
            });
        }
        self.mutations.push(mutation);
        Ok(())
    }

    pub fn row(&self) -> &[u8] {
        &self.row
    }

    pub fn mutations(&self) -> &[Mutation] {
        &self.mutations
    }
}

fn bytes_to_string(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

/// Normalize one cell into `TYPE_ts_row_family_qualifier_value`.
///
/// Delete family markers get their timestamp at execution time, so
/// it is replaced with `0`.
pub fn hash_cell(cell: &Cell) -> Result<String, HashError> {
    let ts = match cell.cell_type {
        CellType::DeleteFamily => 0,
        CellType::Put | CellType::DeleteColumn => cell.timestamp,
        other => return Err(HashError::UnsupportedCellType(other)),
    };
    Ok([
        cell.cell_type.to_string(),
        ts.to_string(),
        bytes_to_string(&cell.row),
        bytes_to_string(&cell.family),
        bytes_to_string(&cell.qualifier),
        bytes_to_string(&cell.value),
    ]
    .join("_"))
}

/// One string per mutation, its cell hashes joined with `" > "`.
pub fn hash_mutation_list(mutations: &[Mutation]) -> Result<Vec<String>, HashError> {
    mutations
        .iter()
        .map(|mutation| {
            let cells = mutation
                .cells
                .iter()
                .map(hash_cell)
                .collect::<Result<Vec<_>, _>>()?;
            Ok(cells.join(" > "))
        })
        .collect()
}

/// Split a keyed [`RowMutations`] into its row and mutation hashes.
pub fn hash_row_mutations(
    key: &[u8],
    row_mutations: &RowMutations,
) -> Result<(String, Vec<String>), HashError> {
    if key != row_mutations.row() {
        return Err(HashError::RowKeyMismatch {
            key: bytes_to_string(key),
            row: bytes_to_string(row_mutations.row()),
        });
    }
    Ok((
        bytes_to_string(row_mutations.row()),
        hash_mutation_list(row_mutations.mutations())?,
    ))
}

/// Whether two [`RowMutations`] write the same row with the same
/// mutations, in any order.
pub fn row_mutations_equivalent(a: &RowMutations, b: &RowMutations) -> Result<bool, HashError> {
    if a.row() != b.row() {
        return Ok(false);
    }
    let mut a_hashes = hash_mutation_list(a.mutations())?;
    let mut b_hashes = hash_mutation_list(b.mutations())?;
    a_hashes.sort();
    b_hashes.sort();
    Ok(a_hashes == b_hashes)
}
