// SPDX-FileCopyrightText: 2023 LakeSoul Contributors
//
// SPDX-License-Identifier: Apache-2.0

use std::fmt::Debug;
use std::io::Cursor;

use arrow::compute::concat_batches;
use arrow::record_batch::RecordBatch;
use arrow_ipc::reader::StreamReader;
use arrow_ipc::writer::StreamWriter;
use arrow_schema::ArrowError;

use super::SerializedPage;

/// Converts between wire pages and record batches.
pub trait PagesSerde: Send + Sync + Debug {
    fn serialize(&self, batch: &RecordBatch) -> Result<SerializedPage, ArrowError>;

    fn deserialize(&self, page: &SerializedPage) -> Result<RecordBatch, ArrowError>;
}

/// Pages encoded as self-describing Arrow IPC streams.
#[derive(Debug, Default, Clone, Copy)]
pub struct ArrowIpcSerde;

impl PagesSerde for ArrowIpcSerde {
    fn serialize(&self, batch: &RecordBatch) -> Result<SerializedPage, ArrowError> {
        let mut writer = StreamWriter::try_new(Vec::new(), &batch.schema())?;
        writer.write(batch)?;
        writer.finish()?;
        Ok(SerializedPage::new(writer.into_inner()?, batch.num_rows()))
    }

    fn deserialize(&self, page: &SerializedPage) -> Result<RecordBatch, ArrowError> {
        let reader = StreamReader::try_new(Cursor::new(page.data().clone()), None)?;
        let schema = reader.schema();
        let mut batches = reader.collect::<Result<Vec<_>, _>>()?;
        let batch = match batches.len() {
            0 => return Err(ArrowError::IpcError("serialized page holds no record batch".into())),
            1 => batches.swap_remove(0),
            _ => concat_batches(&schema, &batches)?,
        };
        if batch.num_rows() != page.row_count() {
            return Err(ArrowError::IpcError(format!(
                "page declares {} rows but decodes to {}",
                page.row_count(),
                batch.num_rows()
            )));
        }
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use arrow::array::{ArrayRef, Int32Array, StringArray};

    use super::*;

    fn batch() -> RecordBatch {
        let id: ArrayRef = Arc::new(Int32Array::from(vec![Some(1), None, Some(3)]));
        let name: ArrayRef = Arc::new(StringArray::from(vec!["a", "b", "c"]));
        RecordBatch::try_from_iter(vec![("id", id), ("name", name)]).unwrap()
    }

    #[test]
    fn ipc_page_keeps_nulls_and_schema() {
        let serde = ArrowIpcSerde;
        let page = serde.serialize(&batch()).unwrap();
        assert_eq!(page.row_count(), 3);
        assert!(page.size_in_bytes() > 0);
        assert_eq!(serde.deserialize(&page).unwrap(), batch());
    }

    #[test]
    fn garbage_is_rejected() {
        let page = SerializedPage::new(vec![1u8, 2, 3], 1);
        assert!(ArrowIpcSerde.deserialize(&page).is_err());
    }

    #[test]
    fn row_count_mismatch_is_rejected() {
        let page = ArrowIpcSerde.serialize(&batch()).unwrap();
        let lying = SerializedPage::new(page.data().clone(), 7);
        let err = ArrowIpcSerde.deserialize(&lying).unwrap_err();
        assert!(err.to_string().contains("declares 7 rows"));
    }
}
