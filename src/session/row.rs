use std::sync::Arc;

use crate::core::{CellValue, PoolError, Result};
use crate::native::{FetchStatus, NativeResult, RawRow};

/// Converts the driver's raw geometry bytes into a cell value.
///
/// The hook point for plugging a real geometry factory above this crate.
/// The default keeps the byte representation opaque.
pub trait GeometryDecoder: Send + Sync {
    fn decode(&self, raw: &[u8]) -> NativeResult<CellValue>;
}

/// Default decoder: wraps the raw bytes without interpreting them.
pub struct PassthroughGeometry;

impl GeometryDecoder for PassthroughGeometry {
    fn decode(&self, raw: &[u8]) -> NativeResult<CellValue> {
        Ok(CellValue::Geometry(raw.to_vec()))
    }
}

/// An eagerly-copied snapshot of one cursor row.
///
/// Native cursors invalidate their current row on every advance; the
/// snapshot copies the column values out so a caller can keep reading
/// them after the owning session has moved on. Each column carries the
/// fetch status the driver reported, and repeated/already-fetched columns
/// are filled from the previous row's snapshot.
#[derive(Debug, Clone)]
pub struct RowSnapshot {
    columns: Arc<[String]>,
    values: Vec<CellValue>,
    statuses: Vec<FetchStatus>,
}

impl RowSnapshot {
    /// Build a snapshot from a raw fetch result, merging in values from
    /// the previous snapshot where the driver signalled that a column was
    /// not resent.
    pub fn from_raw(
        raw: RawRow,
        previous: Option<&RowSnapshot>,
        geometry: &dyn GeometryDecoder,
    ) -> Result<Self> {
        let mut values = Vec::with_capacity(raw.cells.len());
        let mut statuses = Vec::with_capacity(raw.cells.len());

        for (index, cell) in raw.cells.into_iter().enumerate() {
            let value = match cell.status {
                FetchStatus::AlreadyFetched | FetchStatus::Repeated => previous
                    .and_then(|p| p.value(index))
                    .cloned()
                    .unwrap_or(CellValue::Null),
                FetchStatus::Null => match cell.pending_bytes {
                    // Some drivers report long character columns as null
                    // while the content is still streamable. Read it as
                    // UTF-8 text instead of losing it.
                    Some(bytes) => CellValue::Text(String::from_utf8_lossy(&bytes).into_owned()),
                    None => CellValue::Null,
                },
                FetchStatus::Fresh => {
                    if raw.geometry_column == Some(index) {
                        match cell.value {
                            CellValue::Blob(bytes) | CellValue::Geometry(bytes) => {
                                geometry.decode(&bytes).map_err(PoolError::from)?
                            }
                            other => other,
                        }
                    } else {
                        cell.value
                    }
                }
            };
            values.push(value);
            statuses.push(cell.status);
        }

        Ok(Self {
            columns: raw.columns,
            values,
            statuses,
        })
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn value(&self, index: usize) -> Option<&CellValue> {
        self.values.get(index)
    }

    pub fn value_by_name(&self, name: &str) -> Option<&CellValue> {
        self.columns
            .iter()
            .position(|c| c == name)
            .and_then(|i| self.values.get(i))
    }

    /// The fetch status the driver reported for a column on this row.
    pub fn status(&self, index: usize) -> Option<FetchStatus> {
        self.statuses.get(index).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::RawCell;

    fn row(cells: Vec<RawCell>) -> RawRow {
        RawRow {
            columns: vec!["a".to_string(), "b".to_string()][..cells.len().min(2)]
                .to_vec()
                .into(),
            cells,
            geometry_column: None,
        }
    }

    #[test]
    fn test_fresh_values_are_copied() {
        let snapshot = RowSnapshot::from_raw(
            row(vec![
                RawCell::fresh(CellValue::Int32(1)),
                RawCell::fresh(CellValue::Text("x".into())),
            ]),
            None,
            &PassthroughGeometry,
        )
        .unwrap();
        assert_eq!(snapshot.value(0), Some(&CellValue::Int32(1)));
        assert_eq!(snapshot.value_by_name("b"), Some(&CellValue::Text("x".into())));
    }

    #[test]
    fn test_repeated_column_takes_previous_value() {
        let first = RowSnapshot::from_raw(
            row(vec![RawCell::fresh(CellValue::Int32(7))]),
            None,
            &PassthroughGeometry,
        )
        .unwrap();
        let second = RowSnapshot::from_raw(
            row(vec![RawCell::repeated()]),
            Some(&first),
            &PassthroughGeometry,
        )
        .unwrap();
        assert_eq!(second.value(0), Some(&CellValue::Int32(7)));
    }

    #[test]
    fn test_repeated_without_previous_is_null() {
        let snapshot = RowSnapshot::from_raw(
            row(vec![RawCell::already_fetched()]),
            None,
            &PassthroughGeometry,
        )
        .unwrap();
        assert_eq!(snapshot.value(0), Some(&CellValue::Null));
    }

    #[test]
    fn test_null_with_stream_decodes_text() {
        let snapshot = RowSnapshot::from_raw(
            row(vec![RawCell::null_with_stream(b"long text".to_vec())]),
            None,
            &PassthroughGeometry,
        )
        .unwrap();
        assert_eq!(snapshot.value(0), Some(&CellValue::Text("long text".into())));
    }

    #[test]
    fn test_geometry_column_goes_through_decoder() {
        struct Marker;
        impl GeometryDecoder for Marker {
            fn decode(&self, raw: &[u8]) -> NativeResult<CellValue> {
                Ok(CellValue::Geometry(raw.iter().rev().copied().collect()))
            }
        }

        let raw = RawRow {
            columns: vec!["shape".to_string()].into(),
            cells: vec![RawCell::fresh(CellValue::Blob(vec![1, 2, 3]))],
            geometry_column: Some(0),
        };
        let snapshot = RowSnapshot::from_raw(raw, None, &Marker).unwrap();
        assert_eq!(snapshot.value(0), Some(&CellValue::Geometry(vec![3, 2, 1])));
    }
}
